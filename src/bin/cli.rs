//! OtaGuard CLI - Main entry point for the operator binary
//!
//! This binary provides the `otaguard` tool for device setup, command
//! signing and fleet monitoring.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use otaguard_lib::engine::cli::formatter::{colorize_status, format_duration, format_size, CliFormatter};
use otaguard_lib::engine::cli::{Cli, Commands, OutputFormat, Target};
use otaguard_lib::engine::config::{Config, SECRET_ENV};
use otaguard_lib::engine::fleet::{status_label, FleetView};
use otaguard_lib::engine::updater::auth::CommandAuthenticator;
use otaguard_lib::engine::updater::command::release_firmware_url;
use otaguard_lib::engine::updater::installer::sha256_file;
use otaguard_lib::engine::updater::slots::FirmwareSlots;
use otaguard_lib::engine::updater::state::{inspect_store, DecodedRecord, MachineSettings};
use otaguard_lib::engine::updater::telemetry::Envelope;
use otaguard_lib::engine::updater::{FileStore, UpdateCommand, UpdateRecord, UpdateStateMachine};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run_cli(cli) {
        CliFormatter::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn run_cli(cli: Cli) -> Result<()> {
    let config_dir = cli.get_config_dir();
    let json_output = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Init { device, group, probe, no_signature, force } => {
            let identity = DeviceIdentity { device, group, probe };
            cmd_init(&config_dir, &identity, no_signature, force, json_output)?;
        }
        Commands::Status => {
            cmd_status(&config_dir, json_output)?;
        }
        Commands::Sign {
            version,
            url,
            repo,
            checksum,
            file,
            target,
            device,
            force,
            dry_run,
        } => {
            let request = SignRequest {
                version,
                url,
                repo,
                checksum,
                file,
                target,
                device,
                force,
                dry_run,
            };
            cmd_sign(&config_dir, request, json_output)?;
        }
        Commands::Verify { version, url, checksum, signature } => {
            cmd_verify(&config_dir, &version, &url, &checksum, &signature, json_output)?;
        }
        Commands::Monitor { follow } => {
            cmd_monitor(follow, json_output)?;
        }
    }

    Ok(())
}

struct DeviceIdentity {
    device: String,
    group: String,
    probe: String,
}

fn cmd_init(
    config_dir: &Path,
    identity: &DeviceIdentity,
    no_signature: bool,
    force: bool,
    json: bool,
) -> Result<()> {
    if Config::load(config_dir).is_ok() && !force {
        bail!("Config already exists in {} (use --force to overwrite)", config_dir.display());
    }

    let env_secret = std::env::var(SECRET_ENV).ok().filter(|s| !s.is_empty());
    let DeviceIdentity { device, group, probe } = identity;
    let mut config = Config::default_for_device(device, group);
    config.self_test.probe_address = probe.clone();
    config.security.require_signature = !no_signature;

    let generated = !no_signature && env_secret.is_none();
    if generated {
        config.security.signing_secret = generate_secret();
    }
    config.apply_secret_override(env_secret.clone());
    config.validate()?;

    // The secret stays out of the file when it came from the environment
    let mut on_disk = config.clone();
    if env_secret.is_some() {
        on_disk.security.signing_secret.clear();
    }
    on_disk.save(config_dir)?;

    let mut machine = UpdateStateMachine::open(FileStore::new(config.state_path(config_dir)), machine_settings(&config))?;
    // A record already on disk belongs to the device; only a blank store is seeded
    let seeded = machine.provision()?;
    FirmwareSlots::with_base_dir(config.firmware_dir(config_dir)).init()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "config_dir": config_dir,
                "device": device,
                "group": group,
                "record_created": seeded,
                "record": machine.record(),
            }))?
        );
    } else {
        CliFormatter::success(&format!("Initialized device {} in group {}", device, group));
        CliFormatter::kv("Config", &config_dir.join(otaguard_lib::engine::config::CONFIG_FILE).display().to_string());
        CliFormatter::kv("Record", &config.state_path(config_dir).display().to_string());
        CliFormatter::kv("Version", machine.current_version());
        if !seeded {
            CliFormatter::info(&format!("Kept existing update record ({})", machine.flag().as_str()));
        }
        if no_signature {
            CliFormatter::warning("Signature enforcement disabled: any command will be accepted");
        } else if generated {
            CliFormatter::info("Generated a signing secret; copy it to the operator host to sign commands");
        }
    }
    Ok(())
}

/// Two v4 UUIDs hex encoded: 244 random bits, the version and variant
/// nibbles are fixed
fn generate_secret() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(uuid::Uuid::new_v4().as_bytes());
    hex::encode(bytes)
}

#[derive(Serialize)]
struct StatusOutput<'a> {
    device: &'a str,
    group: &'a str,
    record: Option<UpdateRecord>,
    /// Set when the stored flag byte is not a known state
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_flag: Option<u8>,
    active_image: Option<String>,
    installed_images: Vec<String>,
}

fn cmd_status(config_dir: &Path, json: bool) -> Result<()> {
    let config = Config::load(config_dir)
        .with_context(|| format!("No device config in {}", config_dir.display()))?;

    // Read-only: decode without running the boot transition or any repair
    let mut store = FileStore::new(config.state_path(config_dir));
    let (record, raw_flag) = match inspect_store(&mut store)? {
        DecodedRecord::Blank => (None, None),
        DecodedRecord::Valid(record) => (Some(record), None),
        DecodedRecord::UnknownFlag { raw, record } => (Some(record), Some(raw)),
    };
    let slots = FirmwareSlots::with_base_dir(config.firmware_dir(config_dir));

    let output = StatusOutput {
        device: &config.device.id,
        group: &config.device.group,
        record,
        raw_flag,
        active_image: slots.active_version()?,
        installed_images: slots.list_versions()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    CliFormatter::header(&format!("Device {}", output.device));
    CliFormatter::kv("Group", output.group);
    match &output.record {
        Some(record) => {
            let state = match output.raw_flag {
                Some(raw) => colorize_status("rolled_back", &format!("unknown (0x{:02x})", raw)).to_string(),
                None => {
                    let flag = record.flag.as_str();
                    colorize_status(flag_status(flag), flag).to_string()
                }
            };
            CliFormatter::kv("State", &state);
            CliFormatter::kv("Version", &record.current_version);
            CliFormatter::kv("Previous", or_dash(&record.previous_version));
            CliFormatter::kv("Boot attempts", &record.boot_attempts.to_string());
            CliFormatter::kv("Checksum", or_dash(&record.expected_checksum));
        }
        None => CliFormatter::warning("No update record yet; the agent writes one on first boot"),
    }

    CliFormatter::header("Images");
    if output.installed_images.is_empty() {
        CliFormatter::item("none installed");
    }
    for version in &output.installed_images {
        let size = std::fs::metadata(slots.image_path(version))
            .map(|m| format_size(m.len()))
            .unwrap_or_else(|_| "?".to_string());
        let marker = if output.active_image.as_deref() == Some(version.as_str()) { " (active)" } else { "" };
        CliFormatter::item(&format!("{} {}{}", version, size, marker));
    }
    Ok(())
}

struct SignRequest {
    version: String,
    url: Option<String>,
    repo: Option<String>,
    checksum: Option<String>,
    file: Option<PathBuf>,
    target: Target,
    device: Option<String>,
    force: bool,
    dry_run: bool,
}

/// Command payload as published, with provenance fields devices ignore
#[derive(Serialize)]
struct PublishedCommand {
    #[serde(flatten)]
    command: UpdateCommand,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
}

fn cmd_sign(config_dir: &Path, request: SignRequest, json: bool) -> Result<()> {
    let url = match (&request.url, &request.repo) {
        (Some(url), _) => url.clone(),
        (None, Some(repo)) => release_firmware_url(repo, &request.version),
        (None, None) => bail!("Provide --url or --repo"),
    };
    let checksum = match (&request.checksum, &request.file) {
        (Some(checksum), _) => checksum.to_lowercase(),
        (None, Some(file)) => sha256_file(file).with_context(|| format!("Failed to hash {}", file.display()))?,
        (None, None) => String::new(),
    };

    let secret = signing_secret(config_dir);
    let signature = match &secret {
        Some(secret) => Some(CommandAuthenticator::new(secret, true).sign(&request.version, &checksum, &url)),
        None => {
            CliFormatter::warning(&format!("No signing secret ({} or config); command is unsigned", SECRET_ENV));
            None
        }
    };

    let command = UpdateCommand {
        version: Some(request.version.clone()),
        url: Some(url.clone()),
        checksum: Some(checksum.clone()).filter(|c| !c.is_empty()),
        signature,
        force: request.force,
    };
    command.validate().map_err(|fault| anyhow::anyhow!("{}", fault))?;

    let topic = request.target.command_target(request.device.as_deref()).topic();
    let published = PublishedCommand {
        command,
        timestamp: Utc::now(),
        repo: request.repo.clone(),
    };
    let envelope = Envelope {
        topic,
        retain: false,
        payload: serde_json::to_string(&published)?,
    };

    if request.dry_run {
        if json {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        } else {
            CliFormatter::header("Dry run: nothing emitted");
            CliFormatter::kv("Topic", &envelope.topic);
            CliFormatter::kv("Version", &request.version);
            CliFormatter::kv("URL", &url);
            CliFormatter::kv("Checksum", or_dash(&checksum));
            CliFormatter::kv("Signed", if secret.is_some() { "yes" } else { "no" });
            CliFormatter::kv("Force", &request.force.to_string());
        }
        return Ok(());
    }

    println!("{}", serde_json::to_string(&envelope)?);
    Ok(())
}

fn cmd_verify(
    config_dir: &Path,
    version: &str,
    url: &str,
    checksum: &str,
    signature: &str,
    json: bool,
) -> Result<()> {
    let secret = signing_secret(config_dir)
        .with_context(|| format!("No signing secret; set {} or configure one", SECRET_ENV))?;
    let outcome = CommandAuthenticator::new(secret, true).verify_fields(version, checksum, url, signature);

    if json {
        println!("{}", serde_json::json!({ "accepted": outcome.is_accepted(), "outcome": outcome.to_string() }));
    } else if outcome.is_accepted() {
        CliFormatter::success("Signature valid");
    } else {
        CliFormatter::error(&format!("Signature rejected: {}", outcome));
    }

    if !outcome.is_accepted() {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_monitor(follow: bool, json: bool) -> Result<()> {
    let mut fleet = FleetView::new();
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        let Ok(envelope) = serde_json::from_str::<Envelope>(&line) else {
            continue;
        };
        if fleet.merge(&envelope, Utc::now()).is_some() && follow {
            render_fleet(&fleet, json)?;
        }
    }

    if !follow {
        render_fleet(&fleet, json)?;
    }
    Ok(())
}

fn render_fleet(fleet: &FleetView, json: bool) -> Result<()> {
    if json {
        let devices: Vec<_> = fleet.devices().collect();
        println!("{}", serde_json::to_string(&devices)?);
        return Ok(());
    }

    CliFormatter::header(&format!("OtaGuard Fleet Monitor - {} devices", fleet.len()));
    let columns = [
        ("Device", 14),
        ("Version", 10),
        ("Status", 16),
        ("Group", 12),
        ("Signal", 8),
        ("Memory", 12),
        ("Uptime", 10),
    ];
    CliFormatter::table_header(&columns);
    for device in fleet.devices() {
        let label = status_label(&device.status);
        let signal = device.signal_dbm.map(|s| format!("{}dBm", s)).unwrap_or_else(|| "?".into());
        let memory = device.free_memory.map(format_size).unwrap_or_else(|| "?".into());
        CliFormatter::table_row(&[
            (device.device_id.clone(), columns[0].1),
            (device.version.clone(), columns[1].1),
            (colorize_status(&device.status, &format!("{:<16}", label)).to_string(), columns[2].1),
            (device.group.clone(), columns[3].1),
            (signal, columns[4].1),
            (memory, columns[5].1),
            (format_duration(device.uptime_ms / 1000), columns[6].1),
        ]);
    }

    let summary = fleet
        .summary()
        .into_iter()
        .map(|(status, count)| format!("{} {}", count, status))
        .collect::<Vec<_>>()
        .join(", ");
    CliFormatter::blank();
    if summary.is_empty() {
        CliFormatter::info("no devices seen");
    } else {
        CliFormatter::info(&summary);
    }
    Ok(())
}

/// Secret from the environment first, then the device config
fn signing_secret(config_dir: &Path) -> Option<String> {
    std::env::var(SECRET_ENV)
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            Config::load(config_dir)
                .ok()
                .map(|c| c.security.signing_secret)
                .filter(|s| !s.is_empty())
        })
}

fn machine_settings(config: &Config) -> MachineSettings {
    config.device_settings().machine
}

/// Status keyword a record flag is colored like
fn flag_status(flag: &str) -> &'static str {
    match flag {
        "confirmed" => "confirmed",
        "pending_verify" => "self_test_running",
        _ => "rolled_back",
    }
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_shape() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        // v4 version nibble sits at byte 6 of each half
        assert_eq!(&secret[12..13], "4");
        assert_eq!(&secret[44..45], "4");
        assert_ne!(secret, generate_secret());
    }
}
