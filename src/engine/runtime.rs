//! Device Runtime
//!
//! Composes the state machine, orchestrator, self-test supervisor and
//! telemetry for one device process. The host loop drives it with three
//! calls, each returning a [`Directive`]:
//!
//! - [`Device::boot`] once at process start, before anything else
//! - [`Device::handle_envelope`] / [`Device::handle_message`] per inbound command
//! - [`Device::tick`] on a fixed cadence with the monotonic time
//!
//! A `Directive::Restart` is terminal: the host must restart and the next
//! process resumes from the persisted record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::updater::command::UpdateCommand;
use super::updater::error::Result;
use super::updater::installer::Installer;
use super::updater::orchestrator::{CommandOutcome, UpdateOrchestrator};
use super::updater::selftest::{SelfTestBattery, SelfTestSupervisor, SupervisorSettings, SupervisorStep};
use super::updater::state::{BootOutcome, Directive, MachineSettings, UpdateRecord, UpdateStateMachine};
use super::updater::store::{StateStore, StoreError};
use super::updater::telemetry::{Envelope, HeartbeatSchedule, Publisher, StatusKeyword, Telemetry};

/// Runtime tunables
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub machine: MachineSettings,
    pub supervisor: SupervisorSettings,
    pub heartbeat_interval: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            machine: MachineSettings::default(),
            supervisor: SupervisorSettings::default(),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

pub struct Device<S: StateStore, I: Installer, P: Publisher> {
    machine: UpdateStateMachine<S>,
    orchestrator: UpdateOrchestrator<I>,
    telemetry: Telemetry<P>,
    battery: SelfTestBattery,
    settings: DeviceSettings,
    supervisor: Option<SelfTestSupervisor>,
    heartbeat: HeartbeatSchedule,
    boot_outcome: Option<BootOutcome>,
}

impl<S: StateStore, I: Installer, P: Publisher> Device<S, I, P> {
    /// Load the record from `store`. Nothing transitions until [`Device::boot`].
    pub fn open(
        store: S,
        settings: DeviceSettings,
        orchestrator: UpdateOrchestrator<I>,
        telemetry: Telemetry<P>,
        battery: SelfTestBattery,
    ) -> std::result::Result<Self, StoreError> {
        let machine = UpdateStateMachine::open(store, settings.machine.clone())?;
        let orchestrator = orchestrator.with_heartbeat_interval(settings.heartbeat_interval);
        let heartbeat = HeartbeatSchedule::new(settings.heartbeat_interval, Duration::ZERO);
        Ok(Self {
            machine,
            orchestrator,
            telemetry,
            battery,
            settings,
            supervisor: None,
            heartbeat,
            boot_outcome: None,
        })
    }

    /// Per-boot transition, then the status that announces it.
    pub fn boot(&mut self, now: Duration) -> Result<Directive> {
        let outcome = self.machine.boot()?;
        self.heartbeat = HeartbeatSchedule::new(self.settings.heartbeat_interval, now);

        match &outcome {
            BootOutcome::Fresh | BootOutcome::Stable => {
                self.telemetry.status(StatusKeyword::Idle, self.machine.record(), None);
            }
            BootOutcome::Recovered { raw_flag } => {
                let detail = format!("recovered from unknown flag 0x{raw_flag:02x}");
                self.telemetry.status(StatusKeyword::Idle, self.machine.record(), Some(&detail));
            }
            BootOutcome::RolledBack { restored, abandoned } => {
                if let Err(e) = self.orchestrator.installer_mut().restore(restored) {
                    warn!(error = %e, version = %restored, "Could not re-activate restored image");
                }
                let detail = format!("restored {restored}, abandoned {abandoned}");
                self.telemetry.status(StatusKeyword::RolledBack, self.machine.record(), Some(&detail));
            }
            BootOutcome::VerifyRequired { attempt } => {
                // The speculative update stays in flight until the verdict
                self.orchestrator.in_flight_flag().store(true, Ordering::SeqCst);
                self.supervisor = Some(SelfTestSupervisor::start(self.settings.supervisor.clone(), now));
                let detail = format!("boot attempt {attempt}");
                self.telemetry.status(StatusKeyword::SelfTestRunning, self.machine.record(), Some(&detail));
            }
            BootOutcome::Escalated { attempts } => {
                let detail = format!("boot failure limit reached after {attempts} attempts");
                self.telemetry.status(StatusKeyword::RolledBack, self.machine.record(), Some(&detail));
            }
        }

        info!(outcome = ?outcome, version = %self.machine.current_version(), "Boot evaluated");
        let directive = outcome.directive();
        self.boot_outcome = Some(outcome);
        Ok(directive)
    }

    /// Handle a transport envelope; topics not addressed to this device are ignored.
    pub async fn handle_envelope(&mut self, envelope: &Envelope) -> Result<Directive> {
        if !self.telemetry.topics().accepts(&envelope.topic) {
            debug!(topic = %envelope.topic, "Ignoring envelope for another target");
            return Ok(Directive::Continue);
        }
        self.handle_message(&envelope.payload).await
    }

    /// Handle one raw command payload.
    pub async fn handle_message(&mut self, payload: &str) -> Result<Directive> {
        let command = match UpdateCommand::from_json(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable command");
                return Ok(Directive::Continue);
            }
        };
        let outcome = self.handle_command(&command).await?;
        Ok(outcome.directive())
    }

    pub async fn handle_command(&mut self, command: &UpdateCommand) -> Result<CommandOutcome> {
        let outcome = self
            .orchestrator
            .handle_command(command, &mut self.machine, &mut self.telemetry)
            .await?;
        debug!(?outcome, "Command handled");
        Ok(outcome)
    }

    /// Advance the supervisor and heartbeat to `now`.
    pub fn tick(&mut self, now: Duration) -> Result<Directive> {
        if let Some(supervisor) = self.supervisor.as_mut() {
            let step = supervisor.tick(now, &mut self.battery, &mut self.machine, &mut self.telemetry)?;
            match step {
                SupervisorStep::Confirmed { .. } => {
                    self.orchestrator.in_flight_flag().store(false, Ordering::SeqCst);
                }
                SupervisorStep::Restart(cause) => return Ok(Directive::Restart(cause)),
                _ => {}
            }
        }

        if self.heartbeat.due(now) {
            let verifying = self.is_verifying();
            self.telemetry.heartbeat(self.machine.record(), verifying);
        }
        Ok(Directive::Continue)
    }

    pub fn is_verifying(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|s| !s.is_finished())
    }

    pub fn boot_outcome(&self) -> Option<&BootOutcome> {
        self.boot_outcome.as_ref()
    }

    pub fn record(&self) -> &UpdateRecord {
        self.machine.record()
    }

    pub fn in_flight_flag(&self) -> Arc<AtomicBool> {
        self.orchestrator.in_flight_flag()
    }

    pub fn telemetry(&self) -> &Telemetry<P> {
        &self.telemetry
    }

    pub fn orchestrator(&self) -> &UpdateOrchestrator<I> {
        &self.orchestrator
    }

    /// Tear down, keeping only the store: what survives a restart.
    pub fn into_store(self) -> S {
        self.machine.into_store()
    }
}
