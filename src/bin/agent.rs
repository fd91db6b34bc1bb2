//! OtaGuard Agent
//!
//! Device-side update agent. Reads command envelopes (one JSON
//! `{topic, retain, payload}` per line) from stdin and writes status and
//! heartbeat envelopes to stdout; logs go to stderr.
//!
//! ## Restart contract
//! A restart directive ends the process with exit code 75. The process
//! supervisor relaunches the agent, which resumes from the persisted record.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use otaguard_lib::engine::config::Config;
use otaguard_lib::engine::platform::{HostProbe, Platform};
use otaguard_lib::engine::updater::clock::{Clock, SystemClock};
use otaguard_lib::engine::updater::command::DeviceTopics;
use otaguard_lib::engine::updater::installer::HttpInstaller;
use otaguard_lib::engine::updater::selftest::{
    ChannelCheck, ChannelState, MemoryCheck, NetworkCheck, SelfTestBattery, StorageCheck,
};
use otaguard_lib::engine::updater::slots::FirmwareSlots;
use otaguard_lib::engine::updater::telemetry::{Envelope, JsonLinesPublisher};
use otaguard_lib::engine::updater::{FileStore, RestartCause, Telemetry, UpdateOrchestrator};
use otaguard_lib::{Device, Directive};

const EXIT_RESTART: u8 = 75;
const TICK_INTERVAL: Duration = Duration::from_millis(250);
const COMMAND_QUEUE: usize = 8;

#[derive(Parser, Debug)]
#[command(name = "otaguard-agent", version, about = "OtaGuard device update agent")]
struct Args {
    /// Directory holding otaguard.config.json
    #[arg(short, long)]
    config_dir: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(None) => ExitCode::SUCCESS,
        Ok(Some(cause)) => {
            info!(?cause, "Restarting");
            ExitCode::from(EXIT_RESTART)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<Option<RestartCause>> {
    let config_dir = match args.config_dir {
        Some(dir) => dir,
        None => Platform::current()
            .data_dir()
            .context("Could not determine data directory; pass --config-dir")?,
    };
    let config = Config::load(&config_dir)
        .with_context(|| format!("Failed to load config from {}", config_dir.display()))?;
    config.validate()?;

    info!(
        device = %config.device.id,
        group = %config.device.group,
        signatures = config.security.require_signature,
        "OtaGuard agent starting"
    );

    let clock = SystemClock::new();
    let channel = ChannelState::new(true);

    let slots = FirmwareSlots::with_base_dir(config.firmware_dir(&config_dir));
    slots.init()?;
    slots.cleanup_staging()?;

    let orchestrator = UpdateOrchestrator::new(
        config.authenticator(),
        HttpInstaller::new(slots),
        config.install_timeout(),
    );
    let telemetry = Telemetry::new(
        JsonLinesPublisher::new(std::io::stdout()),
        DeviceTopics::new(&config.device.id, &config.device.group),
    );
    let battery = build_battery(&config, &config_dir, channel.clone());

    let mut device = Device::open(
        FileStore::new(config.state_path(&config_dir)),
        config.device_settings(),
        orchestrator,
        telemetry,
        battery,
    )?;

    // Nothing else runs before the boot transition
    if let Directive::Restart(cause) = device.boot(clock.now())? {
        return Ok(Some(cause));
    }

    let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE);
    tokio::spawn(read_commands(tx, device.in_flight_flag(), channel));

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut input_open = true;

    loop {
        let directive = tokio::select! {
            _ = ticker.tick() => device.tick(clock.now())?,
            envelope = rx.recv(), if input_open => match envelope {
                Some(envelope) => device.handle_envelope(&envelope).await?,
                None => {
                    input_open = false;
                    Directive::Continue
                }
            },
        };

        if let Directive::Restart(cause) = directive {
            return Ok(Some(cause));
        }
        if !input_open && !device.is_verifying() {
            info!("Command stream closed, agent exiting");
            return Ok(None);
        }
    }
}

fn build_battery(config: &Config, config_dir: &Path, channel: ChannelState) -> SelfTestBattery {
    let storage_dir = config
        .state_path(config_dir)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_dir.to_path_buf());

    SelfTestBattery::new()
        .with_check(NetworkCheck::new(config.self_test.probe_address.clone(), config.probe_timeout()))
        .with_check(ChannelCheck::new(channel))
        .with_check(MemoryCheck::new(config.self_test.min_free_memory_bytes, HostProbe))
        .with_check(StorageCheck::new(storage_dir))
}

/// Forward stdin envelopes to the main loop. Commands arriving while an
/// update is in flight are dropped, not queued.
async fn read_commands(tx: mpsc::Sender<Envelope>, in_flight: Arc<AtomicBool>, channel: ChannelState) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Failed to read command stream");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Skipping undecodable envelope");
                continue;
            }
        };
        if in_flight.load(Ordering::SeqCst) {
            debug!(topic = %envelope.topic, "Update in flight, command dropped");
            continue;
        }
        if tx.try_send(envelope).is_err() {
            warn!("Command queue full, command dropped");
        }
    }
    channel.set_connected(false);
}
