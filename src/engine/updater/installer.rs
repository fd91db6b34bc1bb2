//! Firmware Installer
//!
//! The [`Installer`] seam is the only place an image is fetched and flashed.
//! [`HttpInstaller`] streams the image over HTTP into a staging slot, checks
//! its SHA-256 against the commanded checksum, and activates it.

use futures_util::StreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::slots::{FirmwareSlots, SlotError};

/// Result of one install attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// New image is in place; a restart boots it
    Installed,
    /// Nothing was flashed
    Failed(String),
    /// Source reported the image unchanged
    NoChangeNeeded,
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {0}")]
    Http(u16),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Slot(#[from] SlotError),
}

/// Fetch, verify and flash a firmware image
#[allow(async_fn_in_trait)]
pub trait Installer {
    /// Install `version` from `url`. An empty `checksum` skips the digest check.
    async fn install(&mut self, version: &str, url: &str, checksum: &str) -> InstallOutcome;

    /// Make an already installed version the one that boots.
    fn restore(&mut self, version: &str) -> Result<(), InstallError>;
}

/// SHA-256 of a file, lowercase hex
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// HTTP-backed installer over [`FirmwareSlots`]
pub struct HttpInstaller {
    client: reqwest::Client,
    slots: FirmwareSlots,
}

impl HttpInstaller {
    pub fn new(slots: FirmwareSlots) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("otaguard/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { client, slots }
    }

    pub fn slots(&self) -> &FirmwareSlots {
        &self.slots
    }

    /// Already running the exact image requested
    fn is_current(&self, version: &str, checksum: &str) -> Result<bool, InstallError> {
        if self.slots.active_version()?.as_deref() != Some(version) || !self.slots.is_installed(version) {
            return Ok(false);
        }
        if checksum.is_empty() {
            return Ok(true);
        }
        let actual = sha256_file(&self.slots.image_path(version))?;
        Ok(actual.eq_ignore_ascii_case(checksum))
    }

    async fn try_install(&self, version: &str, url: &str, checksum: &str) -> Result<InstallOutcome, InstallError> {
        if self.is_current(version, checksum)? {
            return Ok(InstallOutcome::NoChangeNeeded);
        }

        let staging = self.slots.prepare_staging(version)?;

        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            fs::remove_dir_all(&staging)?;
            return Ok(InstallOutcome::NoChangeNeeded);
        }
        if !response.status().is_success() {
            return Err(InstallError::Http(response.status().as_u16()));
        }

        let mut file = File::create(self.slots.staging_image(version))?;
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
        }
        file.sync_all()?;
        drop(file);
        debug!(version, bytes = downloaded, "Image downloaded");

        let actual = hex::encode(hasher.finalize());
        if !checksum.is_empty() && !actual.eq_ignore_ascii_case(checksum) {
            return Err(InstallError::ChecksumMismatch {
                expected: checksum.to_string(),
                actual,
            });
        }

        let previous = self.slots.active_version()?;
        self.slots.commit_staged(version)?;
        self.slots.activate(version)?;

        let mut keep = vec![version];
        if let Some(previous) = previous.as_deref() {
            keep.push(previous);
        }
        let pruned = self.slots.prune(&keep)?;
        if !pruned.is_empty() {
            debug!(?pruned, "Pruned old images");
        }

        info!(version, bytes = downloaded, "Image installed");
        Ok(InstallOutcome::Installed)
    }
}

impl Installer for HttpInstaller {
    async fn install(&mut self, version: &str, url: &str, checksum: &str) -> InstallOutcome {
        match self.try_install(version, url, checksum).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = self.slots.cleanup_staging() {
                    warn!(error = %cleanup, "Failed to clean staging area");
                }
                warn!(version, url, error = %e, "Install failed");
                InstallOutcome::Failed(e.to_string())
            }
        }
    }

    fn restore(&mut self, version: &str) -> Result<(), InstallError> {
        self.slots.activate(version)?;
        info!(version, "Restored firmware image");
        Ok(())
    }
}

/// Installer with a preset outcome, for simulators and tests
pub struct ScriptedInstaller {
    outcome: InstallOutcome,
    delay: Option<Duration>,
    hook: Option<Box<dyn FnMut(&str) + Send>>,
    /// URLs passed to `install`, in call order
    pub installs: Vec<String>,
    pub restored: Vec<String>,
}

impl ScriptedInstaller {
    pub fn new(outcome: InstallOutcome) -> Self {
        Self {
            outcome,
            delay: None,
            hook: None,
            installs: Vec::new(),
            restored: Vec::new(),
        }
    }

    /// Take `delay` before reporting, like a slow download.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Run `hook` with the version on every install, before reporting.
    pub fn with_hook(mut self, hook: impl FnMut(&str) + Send + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }
}

impl Installer for ScriptedInstaller {
    async fn install(&mut self, version: &str, url: &str, _checksum: &str) -> InstallOutcome {
        self.installs.push(url.to_string());
        if let Some(hook) = self.hook.as_mut() {
            hook(version);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.clone()
    }

    fn restore(&mut self, version: &str) -> Result<(), InstallError> {
        self.restored.push(version.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection
    async fn serve(status: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/firmware.bin", addr)
    }

    fn digest(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_install_activates_verified_image() {
        let dir = tempdir().unwrap();
        let mut installer = HttpInstaller::new(FirmwareSlots::with_base_dir(dir.path()));
        let url = serve("200 OK", b"firmware-1.1.0").await;

        let outcome = installer.install("1.1.0", &url, &digest(b"firmware-1.1.0")).await;
        assert_eq!(outcome, InstallOutcome::Installed);
        assert_eq!(installer.slots().active_version().unwrap().as_deref(), Some("1.1.0"));

        // Same image again is a no-op, no network needed
        let outcome = installer.install("1.1.0", "http://127.0.0.1:9/unused", "").await;
        assert_eq!(outcome, InstallOutcome::NoChangeNeeded);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_without_activation() {
        let dir = tempdir().unwrap();
        let mut installer = HttpInstaller::new(FirmwareSlots::with_base_dir(dir.path()));
        let url = serve("200 OK", b"tampered").await;

        let outcome = installer.install("1.1.0", &url, &digest(b"expected")).await;
        assert!(matches!(outcome, InstallOutcome::Failed(ref reason) if reason.starts_with("Checksum mismatch")));
        assert!(!installer.slots().is_installed("1.1.0"));
        assert!(!installer.slots().staging_dir("1.1.0").exists());
        assert_eq!(installer.slots().active_version().unwrap(), None);
    }

    #[tokio::test]
    async fn test_http_error_and_not_modified() {
        let dir = tempdir().unwrap();
        let mut installer = HttpInstaller::new(FirmwareSlots::with_base_dir(dir.path()));

        let url = serve("404 Not Found", b"").await;
        assert_eq!(
            installer.install("1.1.0", &url, "").await,
            InstallOutcome::Failed("HTTP 404".into())
        );

        let url = serve("304 Not Modified", b"").await;
        assert_eq!(
            installer.install("1.1.0", &url, "").await,
            InstallOutcome::NoChangeNeeded
        );
    }

    #[tokio::test]
    async fn test_version_outside_slots_fails_before_download() {
        let dir = tempdir().unwrap();
        let victim = dir.path().join("victim");
        fs::create_dir_all(&victim).unwrap();
        fs::write(victim.join("keep.txt"), b"keep").unwrap();

        let mut installer = HttpInstaller::new(FirmwareSlots::with_base_dir(dir.path().join("fw")));
        let url = serve("200 OK", b"payload").await;
        let outcome = installer.install("../../victim", &url, "").await;

        assert!(matches!(outcome, InstallOutcome::Failed(ref reason) if reason.starts_with("Invalid version name")));
        assert_eq!(fs::read(victim.join("keep.txt")).unwrap(), b"keep");
        assert!(!victim.join("firmware.bin").exists());
    }

    #[tokio::test]
    async fn test_restore_previous_image() {
        let dir = tempdir().unwrap();
        let mut installer = HttpInstaller::new(FirmwareSlots::with_base_dir(dir.path()));

        let url = serve("200 OK", b"one").await;
        assert_eq!(installer.install("1.0.0", &url, "").await, InstallOutcome::Installed);
        let url = serve("200 OK", b"two").await;
        assert_eq!(installer.install("1.1.0", &url, "").await, InstallOutcome::Installed);

        installer.restore("1.0.0").unwrap();
        assert_eq!(installer.slots().active_version().unwrap().as_deref(), Some("1.0.0"));
        assert!(installer.restore("0.9.0").is_err());
    }
}
