//! Update Orchestrator
//!
//! Turns one inbound command into at most one install. Preconditions run in
//! a fixed order: in-flight guard, required fields, authentication, version
//! equality. The update is recorded durably before the installer is called,
//! and the install outcome decides between restart and confirm.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Interval;
use tracing::{debug, error, info, warn};

use super::auth::{AuthOutcome, CommandAuthenticator};
use super::command::UpdateCommand;
use super::error::{Result, UpdateFault};
use super::installer::{InstallOutcome, Installer};
use super::state::{Directive, RestartCause, UpdateStateMachine};
use super::store::StateStore;
use super::telemetry::{Publisher, StatusKeyword, Telemetry};

/// How one command was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Another command was in flight; dropped without a trace
    Ignored,
    /// Required field missing or unstorable; dropped without a status
    Malformed(UpdateFault),
    Rejected(AuthOutcome),
    /// Target equals the running version and `force` was not set
    AlreadyCurrent,
    /// Image installed; restart into it
    Rebooting { version: String },
    InstallFailed(String),
    NoChange,
    /// Post-install re-check failed; update abandoned
    SignatureFailed,
}

impl CommandOutcome {
    pub fn directive(&self) -> Directive {
        match self {
            Self::Rebooting { version } => Directive::Restart(RestartCause::NewImage {
                version: version.clone(),
            }),
            _ => Directive::Continue,
        }
    }
}

/// Clears the in-flight flag when a command finishes, however it finishes
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Serializes command handling and owns the installer
pub struct UpdateOrchestrator<I: Installer> {
    authenticator: CommandAuthenticator,
    installer: I,
    install_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    in_flight: Arc<AtomicBool>,
}

impl<I: Installer> UpdateOrchestrator<I> {
    pub fn new(authenticator: CommandAuthenticator, installer: I, install_timeout: Duration) -> Self {
        Self {
            authenticator,
            installer,
            install_timeout,
            heartbeat_interval: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Keep publishing heartbeats every `interval` while an install runs.
    /// A zero interval disables them.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    /// Shared view of the in-flight guard, for transports that drop
    /// commands while an install runs.
    pub fn in_flight_flag(&self) -> Arc<AtomicBool> {
        self.in_flight.clone()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn authenticator(&self) -> &CommandAuthenticator {
        &self.authenticator
    }

    pub fn installer(&self) -> &I {
        &self.installer
    }

    pub fn installer_mut(&mut self) -> &mut I {
        &mut self.installer
    }

    /// Process one command end to end.
    ///
    /// `Err` only for state store failures; every other failure resolves to
    /// a [`CommandOutcome`] and telemetry.
    pub async fn handle_command<S: StateStore, P: Publisher>(
        &mut self,
        command: &UpdateCommand,
        machine: &mut UpdateStateMachine<S>,
        telemetry: &mut Telemetry<P>,
    ) -> Result<CommandOutcome> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            debug!(version = ?command.version, "Update in flight, command dropped");
            return Ok(CommandOutcome::Ignored);
        };

        let valid = match command.validate() {
            Ok(valid) => valid,
            Err(fault) => {
                warn!(%fault, "Dropping malformed command");
                return Ok(CommandOutcome::Malformed(fault));
            }
        };

        if self.authenticator.is_enforced() {
            telemetry.status(StatusKeyword::VerifyingSignature, machine.record(), None);
        }
        let auth = self.authenticator.authenticate(command);
        if !auth.is_accepted() {
            let fault = UpdateFault::AuthenticationRejected(auth);
            warn!(%fault, version = valid.version, "Command rejected");
            telemetry.status(StatusKeyword::Rejected, machine.record(), Some(&auth.to_string()));
            return Ok(CommandOutcome::Rejected(auth));
        }

        if !valid.force && valid.version == machine.current_version() {
            debug!(version = valid.version, "Already running target version");
            return Ok(CommandOutcome::AlreadyCurrent);
        }

        info!(version = valid.version, url = valid.url, force = valid.force, "Update accepted");
        telemetry.status(StatusKeyword::UpdateAvailable, machine.record(), Some(valid.version));

        let before = machine.record().clone();
        if let Err(e) = machine.prepare_update(valid.version, valid.checksum) {
            error!(error = %e, "Failed to record update, not installing");
            telemetry.status(StatusKeyword::DownloadFailed, machine.record(), Some("state store unavailable"));
            return Err(e.into());
        }

        telemetry.status(StatusKeyword::Downloading, machine.record(), None);
        let outcome = {
            let install = tokio::time::timeout(
                self.install_timeout,
                self.installer.install(valid.version, valid.url, valid.checksum),
            );
            tokio::pin!(install);

            // Heartbeats name the image still running, not the one being fetched
            let mut beat = self.heartbeat_interval.map(|interval| {
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval)
            });
            loop {
                tokio::select! {
                    result = &mut install => break match result {
                        Ok(outcome) => outcome,
                        Err(_) => InstallOutcome::Failed("install timed out".to_string()),
                    },
                    _ = next_beat(&mut beat) => {
                        telemetry.heartbeat(&before, false);
                    }
                }
            }
        };

        match outcome {
            InstallOutcome::Installed => {
                if self.authenticator.is_enforced() && !self.recheck(machine, valid.url, command)? {
                    error!(version = valid.version, "Installed image failed signature re-check");
                    if let Err(e) = self.installer.restore(&before.current_version) {
                        warn!(error = %e, version = %before.current_version, "Failed to restore running image");
                    }
                    machine.cancel_update(&before)?;
                    telemetry.status(StatusKeyword::SignatureFailed, machine.record(), None);
                    return Ok(CommandOutcome::SignatureFailed);
                }

                info!(version = valid.version, "Install complete, restarting");
                telemetry.status(StatusKeyword::Rebooting, machine.record(), None);
                Ok(CommandOutcome::Rebooting {
                    version: valid.version.to_string(),
                })
            }
            InstallOutcome::Failed(reason) => {
                let fault = UpdateFault::InstallFailed(reason.clone());
                warn!(%fault, version = valid.version, "Install failed, keeping running firmware");
                machine.cancel_update(&before)?;
                telemetry.status(StatusKeyword::DownloadFailed, machine.record(), Some(&reason));
                Ok(CommandOutcome::InstallFailed(reason))
            }
            InstallOutcome::NoChangeNeeded => {
                info!(version = valid.version, "Installer reported no change");
                machine.confirm()?;
                telemetry.status(StatusKeyword::Idle, machine.record(), Some("no change"));
                Ok(CommandOutcome::NoChange)
            }
        }
    }

    /// Recompute the tag over the durably recorded update, so an installer
    /// path that altered the record cannot boot unverified code.
    fn recheck<S: StateStore>(
        &self,
        machine: &mut UpdateStateMachine<S>,
        url: &str,
        command: &UpdateCommand,
    ) -> Result<bool> {
        let Some(persisted) = machine.read_persisted()? else {
            return Ok(false);
        };
        let tag = command.signature.as_deref().unwrap_or_default();
        let outcome = self.authenticator.verify_fields(
            &persisted.current_version,
            &persisted.expected_checksum,
            url,
            tag,
        );
        Ok(outcome.is_accepted())
    }
}

/// Next heartbeat tick; never resolves when heartbeats are off
async fn next_beat(beat: &mut Option<Interval>) {
    match beat {
        Some(beat) => {
            beat.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::command::DeviceTopics;
    use crate::engine::updater::installer::ScriptedInstaller;
    use crate::engine::updater::state::{MachineSettings, UpdateFlag};
    use crate::engine::updater::store::{FileStore, MemoryStore, OFFSET_CHECKSUM};
    use crate::engine::updater::telemetry::RecordingPublisher;
    use tempfile::tempdir;

    const SECRET: &str = "fleet-secret";
    const URL: &str = "https://github.com/acme/sensor/releases/download/v1.1.0/firmware.bin";
    const CHECKSUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn settings() -> MachineSettings {
        MachineSettings {
            max_boot_failures: 3,
            default_version: "1.0.0".into(),
        }
    }

    fn machine() -> UpdateStateMachine<MemoryStore> {
        let mut machine = UpdateStateMachine::open(MemoryStore::new(), settings()).unwrap();
        machine.boot().unwrap();
        machine
    }

    fn telemetry() -> Telemetry<RecordingPublisher> {
        Telemetry::new(RecordingPublisher::new(), DeviceTopics::new("esp-01", "canary"))
    }

    fn orchestrator(outcome: InstallOutcome) -> UpdateOrchestrator<ScriptedInstaller> {
        UpdateOrchestrator::new(
            CommandAuthenticator::new(SECRET, true),
            ScriptedInstaller::new(outcome),
            Duration::from_secs(5),
        )
    }

    fn signed(version: &str) -> UpdateCommand {
        let auth = CommandAuthenticator::new(SECRET, true);
        UpdateCommand {
            version: Some(version.into()),
            url: Some(URL.into()),
            checksum: Some(CHECKSUM.into()),
            signature: Some(auth.sign(version, CHECKSUM, URL)),
            force: false,
        }
    }

    #[tokio::test]
    async fn test_installed_restarts_into_new_image() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Rebooting { version: "1.1.0".into() });
        assert_eq!(
            outcome.directive(),
            Directive::Restart(RestartCause::NewImage { version: "1.1.0".into() })
        );
        assert_eq!(machine.flag(), UpdateFlag::PendingVerify);
        assert_eq!(machine.current_version(), "1.1.0");
        assert_eq!(machine.record().previous_version, "1.0.0");
        assert_eq!(orchestrator.installer().installs, vec![URL.to_string()]);
        assert_eq!(
            telemetry.publisher().statuses(),
            vec![
                StatusKeyword::VerifyingSignature,
                StatusKeyword::UpdateAvailable,
                StatusKeyword::Downloading,
                StatusKeyword::Rebooting
            ]
        );
        assert!(!orchestrator.is_in_flight());
    }

    #[tokio::test]
    async fn test_missing_signature_rejected_before_prepare() {
        let mut machine = machine();
        let writes = machine.store().write_log().len();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);

        let mut command = signed("1.1.0");
        command.signature = None;
        let outcome = orchestrator
            .handle_command(&command, &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Rejected(AuthOutcome::RejectedMissingSignature));
        assert_eq!(machine.store().write_log().len(), writes);
        assert_eq!(machine.current_version(), "1.0.0");
        assert!(orchestrator.installer().installs.is_empty());

        let last = telemetry.publisher().status_reports().pop().unwrap();
        assert_eq!(last.status, StatusKeyword::Rejected);
        assert_eq!(last.detail.as_deref(), Some("missing signature"));

        // Substituted URL with the original tag
        let mut command = signed("1.1.0");
        command.url = Some("https://evil.example/firmware.bin".into());
        let outcome = orchestrator
            .handle_command(&command, &mut machine, &mut telemetry)
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Rejected(AuthOutcome::RejectedSignatureMismatch));
        assert_eq!(machine.store().write_log().len(), writes);
        assert_eq!(machine.flag(), UpdateFlag::Confirmed);
    }

    #[tokio::test]
    async fn test_malformed_dropped_without_status() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);

        let command = UpdateCommand {
            url: Some(URL.into()),
            ..Default::default()
        };
        let outcome = orchestrator
            .handle_command(&command, &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert!(matches!(outcome, CommandOutcome::Malformed(UpdateFault::MalformedCommand(_))));
        assert!(telemetry.publisher().sent.is_empty());
    }

    #[tokio::test]
    async fn test_same_version_is_noop_twice() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);
        let writes = machine.store().write_log().len();

        for _ in 0..2 {
            let outcome = orchestrator
                .handle_command(&signed("1.0.0"), &mut machine, &mut telemetry)
                .await
                .unwrap();
            assert_eq!(outcome, CommandOutcome::AlreadyCurrent);
        }
        assert_eq!(machine.store().write_log().len(), writes);
        assert!(orchestrator.installer().installs.is_empty());
    }

    #[tokio::test]
    async fn test_force_reinstalls_same_version() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);

        let mut command = signed("1.0.0");
        command.force = true;
        let outcome = orchestrator
            .handle_command(&command, &mut machine, &mut telemetry)
            .await
            .unwrap();
        assert!(outcome.directive().is_restart());
    }

    #[tokio::test]
    async fn test_in_flight_command_ignored() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);
        orchestrator.in_flight_flag().store(true, Ordering::SeqCst);

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Ignored);
        assert_eq!(machine.current_version(), "1.0.0");
        assert!(telemetry.publisher().sent.is_empty());
        // Guard left untouched for its owner
        assert!(orchestrator.is_in_flight());
    }

    #[tokio::test]
    async fn test_install_failure_keeps_running_firmware() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Failed("HTTP 404".into()));

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::InstallFailed("HTTP 404".into()));
        assert_eq!(outcome.directive(), Directive::Continue);
        assert_eq!(machine.flag(), UpdateFlag::Confirmed);
        assert_eq!(machine.current_version(), "1.0.0");
        assert_eq!(machine.record().boot_attempts, 0);

        let last = telemetry.publisher().status_reports().pop().unwrap();
        assert_eq!(last.status, StatusKeyword::DownloadFailed);
        assert_eq!(last.detail.as_deref(), Some("HTTP 404"));
        assert!(!orchestrator.is_in_flight());
    }

    #[tokio::test]
    async fn test_install_timeout_is_failure() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = UpdateOrchestrator::new(
            CommandAuthenticator::disabled(),
            ScriptedInstaller::new(InstallOutcome::Installed).with_delay(Duration::from_secs(5)),
            Duration::from_millis(20),
        );

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::InstallFailed("install timed out".into()));
        assert_eq!(machine.flag(), UpdateFlag::Confirmed);
        assert_eq!(machine.current_version(), "1.0.0");
    }

    #[tokio::test]
    async fn test_heartbeats_continue_during_slow_install() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = UpdateOrchestrator::new(
            CommandAuthenticator::new(SECRET, true),
            ScriptedInstaller::new(InstallOutcome::Installed).with_delay(Duration::from_millis(250)),
            Duration::from_secs(5),
        )
        .with_heartbeat_interval(Duration::from_millis(40));

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();
        assert!(outcome.directive().is_restart());

        let heartbeats = telemetry.publisher().heartbeats();
        assert!(heartbeats.len() >= 2, "only {} heartbeats", heartbeats.len());
        assert!(heartbeats.iter().all(|h| h.version == "1.0.0"));

        // Off unless configured
        let mut telemetry = self::telemetry();
        let mut orchestrator = UpdateOrchestrator::new(
            CommandAuthenticator::new(SECRET, true),
            ScriptedInstaller::new(InstallOutcome::Installed).with_delay(Duration::from_millis(100)),
            Duration::from_secs(5),
        )
        .with_heartbeat_interval(Duration::ZERO);
        let mut machine = self::machine();
        orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();
        assert!(telemetry.publisher().heartbeats().is_empty());
    }

    #[tokio::test]
    async fn test_no_change_confirms() {
        let mut machine = machine();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::NoChangeNeeded);

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::NoChange);
        assert_eq!(machine.flag(), UpdateFlag::Confirmed);
        // The source vouched for the running image, so the record takes the target name
        assert_eq!(machine.current_version(), "1.1.0");
        assert_eq!(machine.record().previous_version, "1.0.0");
        assert!(orchestrator.installer().restored.is_empty());
        assert_eq!(telemetry.last_status(), Some(StatusKeyword::Idle));
    }

    #[tokio::test]
    async fn test_tampered_record_fails_recheck() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("update.rec");
        let mut machine = UpdateStateMachine::open(FileStore::new(&path), settings()).unwrap();
        machine.boot().unwrap();

        let tamper_path = path.clone();
        let installer = ScriptedInstaller::new(InstallOutcome::Installed).with_hook(move |_| {
            let mut bytes = std::fs::read(&tamper_path).unwrap();
            bytes[OFFSET_CHECKSUM] = b'0';
            std::fs::write(&tamper_path, bytes).unwrap();
        });
        let mut orchestrator = UpdateOrchestrator::new(
            CommandAuthenticator::new(SECRET, true),
            installer,
            Duration::from_secs(5),
        );
        let mut telemetry = telemetry();

        let outcome = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::SignatureFailed);
        assert_eq!(machine.flag(), UpdateFlag::Confirmed);
        assert_eq!(machine.current_version(), "1.0.0");
        assert_eq!(orchestrator.installer().restored, vec!["1.0.0".to_string()]);
        assert_eq!(telemetry.last_status(), Some(StatusKeyword::SignatureFailed));
    }

    #[tokio::test]
    async fn test_store_failure_blocks_install() {
        let mut machine = machine();
        let mut store = machine.into_store();
        store.cut_power_after(1);
        let mut machine = UpdateStateMachine::open(store, settings()).unwrap();
        let mut telemetry = telemetry();
        let mut orchestrator = orchestrator(InstallOutcome::Installed);

        let result = orchestrator
            .handle_command(&signed("1.1.0"), &mut machine, &mut telemetry)
            .await;

        assert!(result.is_err());
        assert!(orchestrator.installer().installs.is_empty());
        assert_eq!(machine.current_version(), "1.0.0");
        assert!(!orchestrator.is_in_flight());
    }
}
