//! Update State Machine
//!
//! Owns the persisted update record and every transition on it. Each
//! mutation is applied to a copy, written field by field, flushed, and only
//! then becomes the in-memory record.
//!
//! ## Resume contract
//! The only cancellation primitive is a full device restart. A restart
//! discards all in-memory state; the next process calls [`UpdateStateMachine::open`]
//! followed by [`UpdateStateMachine::boot`] before any application logic and
//! resumes strictly from the persisted record.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::error::UpdateFault;
use super::store::{
    StateStore, StoreError, CHECKSUM_LEN, OFFSET_BOOT_COUNT, OFFSET_CHECKSUM,
    OFFSET_CURRENT_VERSION, OFFSET_FLAG, OFFSET_MAGIC, OFFSET_PREVIOUS_VERSION, RECORD_LEN,
    RECORD_MAGIC, VERSION_LEN,
};

/// Which firmware is safe to keep running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UpdateFlag {
    /// Trusted, running normally
    Confirmed = 0x01,
    /// Newly flashed, awaiting self-test
    PendingVerify = 0x02,
    /// Restore the previous version on next boot
    RollingBack = 0x03,
}

impl UpdateFlag {
    /// Decode a persisted flag byte. Unknown values yield `None`; the state
    /// machine normalizes those to `Confirmed` on boot.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Confirmed),
            0x02 => Some(Self::PendingVerify),
            0x03 => Some(Self::RollingBack),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::PendingVerify => "pending_verify",
            Self::RollingBack => "rolling_back",
        }
    }
}

/// The persisted update record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub flag: UpdateFlag,
    /// Consecutive boots spent in `PendingVerify`
    pub boot_attempts: u8,
    pub current_version: String,
    /// Empty when there is nothing to roll back to
    pub previous_version: String,
    pub expected_checksum: String,
}

/// Result of decoding the raw region
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRecord {
    /// Region never written or marker missing
    Blank,
    Valid(UpdateRecord),
    /// Marker present but the flag byte is unrecognized. `record` carries the
    /// decoded fields with the flag already normalized to `Confirmed`.
    UnknownFlag { raw: u8, record: UpdateRecord },
}

impl UpdateRecord {
    /// Record written on first-ever boot
    pub fn initial(default_version: &str) -> Self {
        Self {
            flag: UpdateFlag::Confirmed,
            boot_attempts: 0,
            current_version: default_version.to_string(),
            previous_version: String::new(),
            expected_checksum: String::new(),
        }
    }

    /// Check that a version/checksum pair fits the fixed-length slots.
    pub fn check_fits(version: &str, checksum: &str) -> Result<(), StoreError> {
        fixed_field("version", version, VERSION_LEN)?;
        fixed_field("checksum", checksum, CHECKSUM_LEN)?;
        Ok(())
    }

    /// Encode into `(offset, bytes)` writes, in the order they must land:
    /// everything describing the new state first, then the flag, then the
    /// marker that makes the region valid.
    pub fn encode_fields(&self) -> Result<Vec<(usize, Vec<u8>)>, StoreError> {
        Ok(vec![
            (OFFSET_CHECKSUM, fixed_field("checksum", &self.expected_checksum, CHECKSUM_LEN)?),
            (
                OFFSET_PREVIOUS_VERSION,
                fixed_field("previous version", &self.previous_version, VERSION_LEN)?,
            ),
            (
                OFFSET_CURRENT_VERSION,
                fixed_field("current version", &self.current_version, VERSION_LEN)?,
            ),
            (OFFSET_BOOT_COUNT, vec![self.boot_attempts]),
            (OFFSET_FLAG, vec![self.flag.as_byte()]),
            (OFFSET_MAGIC, RECORD_MAGIC.to_vec()),
        ])
    }

    pub fn decode(image: &[u8; RECORD_LEN]) -> DecodedRecord {
        if image[OFFSET_MAGIC..OFFSET_MAGIC + RECORD_MAGIC.len()] != RECORD_MAGIC {
            return DecodedRecord::Blank;
        }

        let raw_flag = image[OFFSET_FLAG];
        let mut record = Self {
            flag: UpdateFlag::from_byte(raw_flag).unwrap_or(UpdateFlag::Confirmed),
            boot_attempts: image[OFFSET_BOOT_COUNT],
            current_version: read_field(&image[OFFSET_CURRENT_VERSION..OFFSET_PREVIOUS_VERSION]),
            previous_version: read_field(&image[OFFSET_PREVIOUS_VERSION..OFFSET_CHECKSUM]),
            expected_checksum: read_field(&image[OFFSET_CHECKSUM..RECORD_LEN]),
        };

        match UpdateFlag::from_byte(raw_flag) {
            Some(_) => DecodedRecord::Valid(record),
            None => {
                record.boot_attempts = 0;
                DecodedRecord::UnknownFlag { raw: raw_flag, record }
            }
        }
    }
}

fn fixed_field(field: &'static str, value: &str, max: usize) -> Result<Vec<u8>, StoreError> {
    let bytes = value.as_bytes();
    if bytes.len() > max {
        return Err(StoreError::FieldTooLong {
            field,
            len: bytes.len(),
            max,
        });
    }
    let mut slot = vec![0u8; max];
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(slot)
}

fn read_field(slot: &[u8]) -> String {
    // 0xFF never appears in UTF-8, so it also terminates an erased slot
    let end = slot
        .iter()
        .position(|b| *b == 0x00 || *b == 0xFF)
        .unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

/// Decode whatever `store` holds without any transition.
pub fn inspect_store<S: StateStore>(store: &mut S) -> Result<DecodedRecord, StoreError> {
    Ok(match store.load()? {
        Some(image) => UpdateRecord::decode(&image),
        None => DecodedRecord::Blank,
    })
}

/// Why the current execution has to end in a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartCause {
    /// Deliberate restart into a freshly installed image
    NewImage { version: String },
    /// Rollback has been persisted; the next boot restores the previous image
    Rollback(UpdateFault),
}

/// What the runtime must do after an operation returns
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Terminal for this execution: restart the device and resume from the
    /// persisted record.
    Restart(RestartCause),
}

impl Directive {
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart(_))
    }
}

/// What happened when the record was evaluated at boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootOutcome {
    /// No valid record existed; defaults were written
    Fresh,
    /// Confirmed firmware, nothing to do
    Stable,
    /// Unrecognized flag byte normalized to `Confirmed`
    Recovered { raw_flag: u8 },
    /// Previous version restored after a rollback directive
    RolledBack { restored: String, abandoned: String },
    /// Speculative boot; the self-test supervisor must run
    VerifyRequired { attempt: u8 },
    /// Boot-failure limit reached; rollback persisted, restart now
    Escalated { attempts: u8 },
}

impl BootOutcome {
    pub fn directive(&self) -> Directive {
        match self {
            Self::Escalated { attempts } => Directive::Restart(RestartCause::Rollback(
                UpdateFault::BootFailureLimitExceeded {
                    attempts: *attempts,
                },
            )),
            _ => Directive::Continue,
        }
    }
}

/// Tunables consumed by the state machine
#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Consecutive `PendingVerify` boots before forcing rollback
    pub max_boot_failures: u8,
    /// Version recorded on first-ever boot
    pub default_version: String,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            max_boot_failures: 3,
            default_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// How the record looked when it was opened, consumed by `boot`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenedAs {
    Blank,
    Valid,
    UnknownFlag(u8),
}

/// Sole owner of the update record
pub struct UpdateStateMachine<S: StateStore> {
    store: S,
    record: UpdateRecord,
    settings: MachineSettings,
    opened_as: OpenedAs,
}

impl<S: StateStore> UpdateStateMachine<S> {
    /// Load the record from `store`. Does not transition; call `boot` next.
    pub fn open(mut store: S, settings: MachineSettings) -> Result<Self, StoreError> {
        let decoded = inspect_store(&mut store)?;

        let (record, opened_as) = match decoded {
            DecodedRecord::Blank => (
                UpdateRecord::initial(&settings.default_version),
                OpenedAs::Blank,
            ),
            DecodedRecord::Valid(record) => (record, OpenedAs::Valid),
            DecodedRecord::UnknownFlag { raw, record } => (record, OpenedAs::UnknownFlag(raw)),
        };

        Ok(Self {
            store,
            record,
            settings,
            opened_as,
        })
    }

    /// Run the per-boot transition. Must precede any application logic.
    pub fn boot(&mut self) -> Result<BootOutcome, StoreError> {
        let opened_as = std::mem::replace(&mut self.opened_as, OpenedAs::Valid);

        match opened_as {
            OpenedAs::Blank => {
                let initial = UpdateRecord::initial(&self.settings.default_version);
                self.persist(initial)?;
                info!(version = %self.record.current_version, "Initialized update record on first boot");
                return Ok(BootOutcome::Fresh);
            }
            OpenedAs::UnknownFlag(raw_flag) => {
                let mut next = self.record.clone();
                next.flag = UpdateFlag::Confirmed;
                next.boot_attempts = 0;
                self.persist(next)?;
                warn!(raw_flag, version = %self.record.current_version, "Unrecognized update flag, normalized to confirmed");
                return Ok(BootOutcome::Recovered { raw_flag });
            }
            OpenedAs::Valid => {}
        }

        match self.record.flag {
            UpdateFlag::Confirmed => {
                if self.record.boot_attempts != 0 {
                    let mut next = self.record.clone();
                    next.boot_attempts = 0;
                    self.persist(next)?;
                }
                debug!(version = %self.record.current_version, "Booted confirmed firmware");
                Ok(BootOutcome::Stable)
            }
            UpdateFlag::PendingVerify => {
                let attempts = self.record.boot_attempts.saturating_add(1);
                let mut next = self.record.clone();

                if attempts >= self.settings.max_boot_failures {
                    next.flag = UpdateFlag::RollingBack;
                    next.boot_attempts = 0;
                    self.persist(next)?;
                    warn!(
                        attempts,
                        version = %self.record.current_version,
                        "Boot failure limit reached, rolling back"
                    );
                    return Ok(BootOutcome::Escalated { attempts });
                }

                next.boot_attempts = attempts;
                self.persist(next)?;
                info!(attempt = attempts, version = %self.record.current_version, "Speculative boot, verification required");
                Ok(BootOutcome::VerifyRequired { attempt: attempts })
            }
            UpdateFlag::RollingBack => {
                let abandoned = self.record.current_version.clone();
                let mut next = self.record.clone();
                if !next.previous_version.is_empty() {
                    next.current_version = next.previous_version.clone();
                }
                next.flag = UpdateFlag::Confirmed;
                next.boot_attempts = 0;
                self.persist(next)?;
                warn!(
                    restored = %self.record.current_version,
                    abandoned = %abandoned,
                    "Rolled back to previous firmware"
                );
                Ok(BootOutcome::RolledBack {
                    restored: self.record.current_version.clone(),
                    abandoned,
                })
            }
        }
    }

    /// Record an in-flight update. Must return `Ok` before the Installer
    /// runs, since installing may reboot outside our control.
    pub fn prepare_update(&mut self, new_version: &str, checksum: &str) -> Result<(), StoreError> {
        let next = UpdateRecord {
            flag: UpdateFlag::PendingVerify,
            boot_attempts: 0,
            current_version: new_version.to_string(),
            previous_version: self.record.current_version.clone(),
            expected_checksum: checksum.to_string(),
        };
        self.persist(next)?;
        info!(
            version = %self.record.current_version,
            previous = %self.record.previous_version,
            "Prepared update"
        );
        Ok(())
    }

    /// Write the first-boot record if the store held none when opened.
    /// An existing record is left untouched for the device's own boot to
    /// evaluate. Returns whether a record was written.
    pub fn provision(&mut self) -> Result<bool, StoreError> {
        if self.opened_as != OpenedAs::Blank {
            return Ok(false);
        }
        self.boot()?;
        Ok(true)
    }

    /// Mark the running firmware as the trusted baseline.
    pub fn confirm(&mut self) -> Result<(), StoreError> {
        let mut next = self.record.clone();
        next.flag = UpdateFlag::Confirmed;
        next.boot_attempts = 0;
        self.persist(next)?;
        info!(version = %self.record.current_version, "Firmware confirmed");
        Ok(())
    }

    /// Confirm after an install that never replaced the running firmware.
    /// The version fields return to `before`, the record as it was ahead of
    /// `prepare_update`.
    pub fn cancel_update(&mut self, before: &UpdateRecord) -> Result<(), StoreError> {
        let mut next = before.clone();
        next.flag = UpdateFlag::Confirmed;
        next.boot_attempts = 0;
        let abandoned = self.record.current_version.clone();
        self.persist(next)?;
        info!(version = %self.record.current_version, abandoned = %abandoned, "Update cancelled, running firmware confirmed");
        Ok(())
    }

    /// Persist a rollback directive. The returned cause is terminal for the
    /// current execution: the caller must restart.
    pub fn trigger_rollback(&mut self, fault: UpdateFault) -> Result<RestartCause, StoreError> {
        let mut next = self.record.clone();
        next.flag = UpdateFlag::RollingBack;
        next.boot_attempts = 0;
        self.persist(next)?;
        warn!(reason = %fault, version = %self.record.current_version, "Rollback triggered");
        Ok(RestartCause::Rollback(fault))
    }

    pub fn record(&self) -> &UpdateRecord {
        &self.record
    }

    /// Re-read the record as it currently sits in the store. Anything other
    /// than a valid record yields `None`.
    pub fn read_persisted(&mut self) -> Result<Option<UpdateRecord>, StoreError> {
        let Some(image) = self.store.load()? else {
            return Ok(None);
        };
        match UpdateRecord::decode(&image) {
            DecodedRecord::Valid(record) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    pub fn current_version(&self) -> &str {
        &self.record.current_version
    }

    pub fn flag(&self) -> UpdateFlag {
        self.record.flag
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give the store back, e.g. to reopen it as the next boot would.
    pub fn into_store(self) -> S {
        self.store
    }

    fn persist(&mut self, next: UpdateRecord) -> Result<(), StoreError> {
        for (offset, bytes) in next.encode_fields()? {
            self.store.write_at(offset, &bytes)?;
        }
        self.store.flush()?;
        self.record = next;
        Ok(())
    }
}
