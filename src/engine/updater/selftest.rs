//! Self-Test Supervisor
//!
//! Decides whether a speculatively booted image becomes the new baseline.
//! After a settle delay it runs the check battery; all pass confirms, a
//! failure retries until the deadline, and the deadline forces rollback.
//!
//! The supervisor never sleeps. The runtime calls [`SelfTestSupervisor::tick`]
//! with the current monotonic time and the supervisor decides whether an
//! attempt is due.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::error::UpdateFault;
use super::state::{Directive, RestartCause, UpdateStateMachine};
use super::store::{StateStore, StoreError};
use super::telemetry::{Publisher, StatusKeyword, Telemetry};
use crate::engine::platform::ResourceProbe;

/// Health check result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthResult {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl HealthResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    fn describe(&self) -> String {
        match self {
            Self::Healthy => "healthy".to_string(),
            Self::Unhealthy { reason } => reason.clone(),
            Self::Timeout => "timed out".to_string(),
        }
    }
}

/// One verification in the battery
pub trait HealthCheck {
    fn name(&self) -> &str;
    fn run(&mut self) -> HealthResult;
}

/// TCP reachability of a known endpoint, bounded by `timeout`
pub struct NetworkCheck {
    address: String,
    timeout: Duration,
}

impl NetworkCheck {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }
}

impl HealthCheck for NetworkCheck {
    fn name(&self) -> &str {
        "network"
    }

    fn run(&mut self) -> HealthResult {
        let started = Instant::now();
        let addr = match resolve_within(&self.address, self.timeout) {
            Resolved::Addr(addr) => addr,
            Resolved::TimedOut => return HealthResult::Timeout,
            Resolved::Failed(reason) => return HealthResult::Unhealthy { reason },
        };

        let remaining = self.timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return HealthResult::Timeout;
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(_) => HealthResult::Healthy,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => HealthResult::Timeout,
            Err(e) => HealthResult::Unhealthy {
                reason: format!("connect {}: {}", addr, e),
            },
        }
    }
}

enum Resolved {
    Addr(SocketAddr),
    TimedOut,
    Failed(String),
}

/// Name lookup has no timeout of its own, so a slow resolver is abandoned on
/// a helper thread once `timeout` passes.
fn resolve_within(address: &str, timeout: Duration) -> Resolved {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Resolved::Addr(addr);
    }

    let (tx, rx) = mpsc::channel();
    let owned = address.to_string();
    thread::spawn(move || {
        let _ = tx.send(owned.to_socket_addrs().map(|mut a| a.next()));
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(Some(addr))) => Resolved::Addr(addr),
        Ok(Ok(None)) => Resolved::Failed(format!("{address} did not resolve")),
        Ok(Err(e)) => Resolved::Failed(format!("resolve {address}: {e}")),
        Err(mpsc::RecvTimeoutError::Timeout) => Resolved::TimedOut,
        Err(mpsc::RecvTimeoutError::Disconnected) => Resolved::Failed(format!("resolve {address}: lookup aborted")),
    }
}

/// Connection state of the messaging channel, maintained by the transport
#[derive(Debug, Clone, Default)]
pub struct ChannelState(Arc<AtomicBool>);

impl ChannelState {
    pub fn new(connected: bool) -> Self {
        Self(Arc::new(AtomicBool::new(connected)))
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Messaging-channel connectivity
pub struct ChannelCheck {
    state: ChannelState,
}

impl ChannelCheck {
    pub fn new(state: ChannelState) -> Self {
        Self { state }
    }
}

impl HealthCheck for ChannelCheck {
    fn name(&self) -> &str {
        "messaging"
    }

    fn run(&mut self) -> HealthResult {
        if self.state.is_connected() {
            HealthResult::Healthy
        } else {
            HealthResult::Unhealthy {
                reason: "channel disconnected".to_string(),
            }
        }
    }
}

/// Available working memory above a floor.
///
/// Platforms that cannot report memory pass this check.
pub struct MemoryCheck {
    min_free: u64,
    probe: Box<dyn ResourceProbe + Send>,
}

impl MemoryCheck {
    pub fn new(min_free: u64, probe: impl ResourceProbe + Send + 'static) -> Self {
        Self {
            min_free,
            probe: Box::new(probe),
        }
    }
}

impl HealthCheck for MemoryCheck {
    fn name(&self) -> &str {
        "memory"
    }

    fn run(&mut self) -> HealthResult {
        match self.probe.snapshot().free_memory {
            Some(free) if free < self.min_free => HealthResult::Unhealthy {
                reason: format!("{} bytes free, need {}", free, self.min_free),
            },
            _ => HealthResult::Healthy,
        }
    }
}

/// Write/read-back probe in the data directory
pub struct StorageCheck {
    dir: PathBuf,
}

impl StorageCheck {
    const PROBE_NAME: &'static str = ".storage_probe";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn probe(&self) -> io::Result<bool> {
        let path = self.dir.join(Self::PROBE_NAME);
        let expected = uuid::Uuid::new_v4().to_string();

        {
            let mut file = fs::File::create(&path)?;
            file.write_all(expected.as_bytes())?;
            file.sync_all()?;
        }

        let mut actual = String::new();
        fs::File::open(&path)?.read_to_string(&mut actual)?;
        fs::remove_file(&path)?;
        Ok(actual == expected)
    }
}

impl HealthCheck for StorageCheck {
    fn name(&self) -> &str {
        "storage"
    }

    fn run(&mut self) -> HealthResult {
        match self.probe() {
            Ok(true) => HealthResult::Healthy,
            Ok(false) => HealthResult::Unhealthy {
                reason: "read-back mismatch".to_string(),
            },
            Err(e) => HealthResult::Unhealthy {
                reason: format!("probe in {}: {}", self.dir.display(), e),
            },
        }
    }
}

/// Check backed by a closure, for simulators and tests
pub struct FnCheck {
    name: String,
    check: Box<dyn FnMut() -> HealthResult + Send>,
}

impl FnCheck {
    pub fn new(name: impl Into<String>, check: impl FnMut() -> HealthResult + Send + 'static) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

impl HealthCheck for FnCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> HealthResult {
        (self.check)()
    }
}

/// Outcome of one battery run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatteryReport {
    pub results: Vec<(String, HealthResult)>,
}

impl BatteryReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_healthy())
    }

    /// `name: reason` for every failed check
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_healthy())
            .map(|(name, r)| format!("{}: {}", name, r.describe()))
            .collect()
    }
}

/// Fixed set of checks, AND-reduced
#[derive(Default)]
pub struct SelfTestBattery {
    checks: Vec<Box<dyn HealthCheck + Send>>,
}

impl SelfTestBattery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: impl HealthCheck + Send + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check so the report names all failures.
    pub fn run(&mut self) -> BatteryReport {
        let results = self
            .checks
            .iter_mut()
            .map(|check| (check.name().to_string(), check.run()))
            .collect();
        BatteryReport { results }
    }
}

/// Supervisor timing
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Wait after boot, and between attempts
    pub settle_delay: Duration,
    /// Overall budget measured from boot
    pub deadline: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(5),
            deadline: Duration::from_secs(60),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorStep {
    /// Verdict already reached
    Finished,
    /// Next attempt not due yet
    Waiting { next_attempt_at: Duration },
    Retrying { attempt: u32, failures: Vec<String> },
    Confirmed { attempts: u32 },
    /// Rollback persisted (or attempted); restart now
    Restart(RestartCause),
}

impl SupervisorStep {
    pub fn directive(&self) -> Directive {
        match self {
            Self::Restart(cause) => Directive::Restart(cause.clone()),
            _ => Directive::Continue,
        }
    }
}

/// Retry-with-deadline state for one boot
#[derive(Debug, Clone)]
pub struct SelfTestSupervisor {
    settings: SupervisorSettings,
    started_at: Duration,
    next_attempt_at: Duration,
    attempts: u32,
    finished: bool,
}

impl SelfTestSupervisor {
    /// Start supervising a speculative boot observed at `now`.
    pub fn start(settings: SupervisorSettings, now: Duration) -> Self {
        let next_attempt_at = now + settings.settle_delay;
        Self {
            settings,
            started_at: now,
            next_attempt_at,
            attempts: 0,
            finished: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn next_attempt_at(&self) -> Duration {
        self.next_attempt_at
    }

    /// Evaluate the supervisor at `now`, running an attempt if one is due.
    pub fn tick<S: StateStore, P: Publisher>(
        &mut self,
        now: Duration,
        battery: &mut SelfTestBattery,
        machine: &mut UpdateStateMachine<S>,
        telemetry: &mut Telemetry<P>,
    ) -> Result<SupervisorStep, StoreError> {
        if self.finished {
            return Ok(SupervisorStep::Finished);
        }
        if now < self.next_attempt_at {
            return Ok(SupervisorStep::Waiting {
                next_attempt_at: self.next_attempt_at,
            });
        }

        self.attempts += 1;
        let report = battery.run();

        if report.passed() {
            machine.confirm()?;
            self.finished = true;
            info!(attempts = self.attempts, version = %machine.current_version(), "Self-test passed");
            telemetry.status(StatusKeyword::Confirmed, machine.record(), None);
            return Ok(SupervisorStep::Confirmed {
                attempts: self.attempts,
            });
        }

        let failures = report.failures();
        let elapsed = now.saturating_sub(self.started_at);

        if elapsed < self.settings.deadline {
            let fault = UpdateFault::SelfTestFailing(failures.clone());
            warn!(attempt = self.attempts, elapsed_ms = elapsed.as_millis() as u64, %fault, "Self-test attempt failed, retrying");
            telemetry.status(
                StatusKeyword::SelfTestRunning,
                machine.record(),
                Some(&format!("retrying: {}", failures.join(", "))),
            );
            self.next_attempt_at = now + self.settings.settle_delay;
            return Ok(SupervisorStep::Retrying {
                attempt: self.attempts,
                failures,
            });
        }

        self.finished = true;
        let fault = UpdateFault::SelfTestTimedOut { elapsed };
        telemetry.status(
            StatusKeyword::RolledBack,
            machine.record(),
            Some("rolled back on self-test timeout"),
        );
        let cause = match machine.trigger_rollback(fault.clone()) {
            Ok(cause) => cause,
            Err(e) => {
                // Restart anyway; the boot counter escalates on a later boot
                error!(error = %e, "Failed to persist rollback");
                RestartCause::Rollback(fault)
            }
        };
        Ok(SupervisorStep::Restart(cause))
    }
}
