//! OtaGuard CLI Module
//! Command-line interface for operators and device setup

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::platform::Platform;
use super::updater::command::CommandTarget;

#[derive(Parser, Debug)]
#[command(name = "otaguard")]
#[command(author = "OtaGuard Team")]
#[command(version)]
#[command(about = "Rollback-safe OTA firmware updates", long_about = None)]
pub struct Cli {
    /// Directory holding otaguard.config.json (defaults to the platform data dir)
    #[arg(short, long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Release rings a command can be published to
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Target {
    Fleet,
    Canary,
    Staging,
    Production,
}

impl Target {
    pub fn command_target(self, device: Option<&str>) -> CommandTarget {
        if let Some(device) = device {
            return CommandTarget::Device(device.to_string());
        }
        match self {
            Self::Fleet => CommandTarget::Fleet,
            Self::Canary => CommandTarget::Group("canary".into()),
            Self::Staging => CommandTarget::Group("staging".into()),
            Self::Production => CommandTarget::Group("production".into()),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a device config and initialize the update record
    Init {
        /// Device id used in topic names
        #[arg(short, long)]
        device: String,

        /// Group (release ring) the device belongs to
        #[arg(short, long, default_value = "fleet")]
        group: String,

        /// host:port the self-test must reach, typically the broker
        #[arg(short, long)]
        probe: String,

        /// Accept unsigned commands
        #[arg(long)]
        no_signature: bool,

        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Show the persisted update record and installed images
    Status,

    /// Build and sign an update command envelope
    Sign {
        /// Firmware version to deploy
        #[arg(short, long)]
        version: String,

        /// Image URL (defaults to the release asset of --repo)
        #[arg(short, long)]
        url: Option<String>,

        /// Repository (owner/name) hosting release images
        #[arg(short, long)]
        repo: Option<String>,

        /// SHA-256 of the image
        #[arg(long, conflicts_with = "file")]
        checksum: Option<String>,

        /// Compute the checksum from a local image
        #[arg(long)]
        file: Option<PathBuf>,

        /// Release ring to address
        #[arg(short, long, default_value = "fleet")]
        target: Target,

        /// Address a single device instead
        #[arg(short, long)]
        device: Option<String>,

        /// Reinstall even if the device already runs this version
        #[arg(long)]
        force: bool,

        /// Show what would be sent without emitting the envelope
        #[arg(long)]
        dry_run: bool,
    },

    /// Check a command signature
    Verify {
        #[arg(short, long)]
        version: String,

        #[arg(short, long)]
        url: String,

        #[arg(long, default_value = "")]
        checksum: String,

        #[arg(short, long)]
        signature: String,
    },

    /// Fleet table from status/heartbeat envelopes on stdin
    Monitor {
        /// Redraw after every message instead of once at end of input
        #[arg(long)]
        follow: bool,
    },
}

impl Cli {
    pub fn get_config_dir(&self) -> PathBuf {
        self.config_dir
            .clone()
            .or_else(|| Platform::current().data_dir())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
