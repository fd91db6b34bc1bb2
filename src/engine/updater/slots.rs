//! Firmware Slots
//!
//! Versioned on-disk image layout with atomic activation:
//!
//! ```text
//! <base>/versions/<version>/firmware.bin
//! <base>/versions/.tmp-<version>/     staging for an in-progress download
//! <base>/current -> versions/<version>
//! ```

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use super::command::version_name_problem;

#[cfg(unix)]
use std::os::unix::fs::symlink;

pub const IMAGE_FILE: &str = "firmware.bin";
const STAGING_PREFIX: &str = ".tmp-";

#[derive(Error, Debug)]
pub enum SlotError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Version {0} not installed")]
    VersionNotFound(String),
    #[error("No staged image for {0}")]
    StagingNotFound(String),
    #[error("Invalid version name: {0:?}")]
    InvalidVersion(String),
}

/// A version names exactly one directory under `versions/`.
pub fn check_version_name(version: &str) -> Result<(), SlotError> {
    let mut components = Path::new(version).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(name)), None) if name == version
    );
    if !single || version_name_problem(version).is_some() {
        return Err(SlotError::InvalidVersion(version.to_string()));
    }
    Ok(())
}

/// Side-by-side firmware images under one base directory
#[derive(Debug, Clone)]
pub struct FirmwareSlots {
    base_dir: PathBuf,
}

impl FirmwareSlots {
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn init(&self) -> Result<(), SlotError> {
        fs::create_dir_all(self.versions_dir())?;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.base_dir.join("versions")
    }

    pub fn current_link(&self) -> PathBuf {
        self.base_dir.join("current")
    }

    pub fn version_path(&self, version: &str) -> PathBuf {
        self.versions_dir().join(version)
    }

    pub fn image_path(&self, version: &str) -> PathBuf {
        self.version_path(version).join(IMAGE_FILE)
    }

    pub fn staging_dir(&self, version: &str) -> PathBuf {
        self.versions_dir().join(format!("{STAGING_PREFIX}{version}"))
    }

    pub fn staging_image(&self, version: &str) -> PathBuf {
        self.staging_dir(version).join(IMAGE_FILE)
    }

    pub fn is_installed(&self, version: &str) -> bool {
        check_version_name(version).is_ok() && self.image_path(version).is_file()
    }

    /// Empty staging directory for a download of `version`.
    pub fn prepare_staging(&self, version: &str) -> Result<PathBuf, SlotError> {
        check_version_name(version)?;
        self.init()?;
        let staging = self.staging_dir(version);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    /// Installed versions, ordered by numeric components
    pub fn list_versions(&self) -> Result<Vec<String>, SlotError> {
        let versions_dir = self.versions_dir();
        if !versions_dir.exists() {
            return Ok(vec![]);
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&versions_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if !name.starts_with(STAGING_PREFIX) {
                    versions.push(name.to_string());
                }
            }
        }

        versions.sort_by(|a, b| version_key(a).cmp(&version_key(b)).then_with(|| a.cmp(b)));
        Ok(versions)
    }

    /// Version the `current` pointer targets, if any
    pub fn active_version(&self) -> Result<Option<String>, SlotError> {
        let current = self.current_link();

        #[cfg(unix)]
        {
            let target = match fs::read_link(&current) {
                Ok(target) => target,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(target
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string))
        }

        #[cfg(not(unix))]
        {
            let marker = current.join(".version");
            if !marker.exists() {
                return Ok(None);
            }
            Ok(Some(fs::read_to_string(&marker)?.trim().to_string()))
        }
    }

    /// Move a staged download into its final slot.
    pub fn commit_staged(&self, version: &str) -> Result<PathBuf, SlotError> {
        check_version_name(version)?;
        let staged = self.staging_dir(version);
        if !staged.is_dir() {
            return Err(SlotError::StagingNotFound(version.to_string()));
        }

        let final_path = self.version_path(version);
        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(&staged, &final_path)?;
        Ok(self.image_path(version))
    }

    /// Point `current` at `version` atomically.
    #[cfg(unix)]
    pub fn activate(&self, version: &str) -> Result<(), SlotError> {
        check_version_name(version)?;
        if !self.is_installed(version) {
            return Err(SlotError::VersionNotFound(version.to_string()));
        }

        let temp_link = self.base_dir.join(".current_new");
        if fs::symlink_metadata(&temp_link).is_ok() {
            fs::remove_file(&temp_link)?;
        }
        symlink(self.version_path(version), &temp_link)?;
        fs::rename(&temp_link, self.current_link())?;
        Ok(())
    }

    /// Marker-file activation where symlinks are unavailable
    #[cfg(not(unix))]
    pub fn activate(&self, version: &str) -> Result<(), SlotError> {
        check_version_name(version)?;
        if !self.is_installed(version) {
            return Err(SlotError::VersionNotFound(version.to_string()));
        }

        let current = self.current_link();
        fs::create_dir_all(&current)?;
        let temp_marker = current.join(".version.tmp");
        fs::write(&temp_marker, version)?;
        fs::rename(&temp_marker, current.join(".version"))?;
        Ok(())
    }

    pub fn remove_version(&self, version: &str) -> Result<(), SlotError> {
        check_version_name(version)?;
        let path = self.version_path(version);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Drop abandoned downloads.
    pub fn cleanup_staging(&self) -> Result<(), SlotError> {
        let versions_dir = self.versions_dir();
        if !versions_dir.exists() {
            return Ok(());
        }

        for entry in fs::read_dir(&versions_dir)? {
            let path = entry?.path();
            let staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(STAGING_PREFIX));
            if staging {
                fs::remove_dir_all(&path)?;
            }
        }
        Ok(())
    }

    /// Remove every installed version not in `keep`. Returns what was removed.
    pub fn prune(&self, keep: &[&str]) -> Result<Vec<String>, SlotError> {
        let mut removed = Vec::new();
        for version in self.list_versions()? {
            if !keep.contains(&version.as_str()) {
                self.remove_version(&version)?;
                removed.push(version);
            }
        }
        Ok(removed)
    }
}

fn version_key(version: &str) -> Vec<u32> {
    version
        .split(['.', '-', '+'])
        .filter_map(|s| s.parse().ok())
        .collect()
}
