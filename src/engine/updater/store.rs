//! Persistent State Store
//!
//! A small fixed-layout region that survives reboot and power loss. The
//! state machine is the only writer; everything here is byte plumbing.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Marker written last; its absence means the region holds no record.
pub const RECORD_MAGIC: [u8; 2] = *b"OG";

pub const OFFSET_MAGIC: usize = 0;
pub const OFFSET_FLAG: usize = 2;
pub const OFFSET_BOOT_COUNT: usize = 3;
pub const OFFSET_CURRENT_VERSION: usize = 4;
pub const OFFSET_PREVIOUS_VERSION: usize = OFFSET_CURRENT_VERSION + VERSION_LEN;
pub const OFFSET_CHECKSUM: usize = OFFSET_PREVIOUS_VERSION + VERSION_LEN;

/// Fixed width of each version slot
pub const VERSION_LEN: usize = 32;
/// Fixed width of the checksum slot (one SHA-256 hex digest)
pub const CHECKSUM_LEN: usize = 64;

pub const RECORD_LEN: usize = OFFSET_CHECKSUM + CHECKSUM_LEN;

/// Erased-region fill byte
const ERASED: u8 = 0xFF;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("write of {len} bytes at offset {offset} exceeds record region")]
    OutOfBounds { offset: usize, len: usize },

    #[error("{field} value of {len} bytes does not fit its {max}-byte slot")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("power lost during write")]
    PowerLoss,
}

/// Durable region holding exactly one record.
///
/// Writes land in field order; `flush` is the durability point. Callers
/// must not take any state-dependent external action before `flush`
/// returns `Ok`.
pub trait StateStore {
    /// Read the whole region, `None` if it was never written.
    fn load(&mut self) -> Result<Option<[u8; RECORD_LEN]>, StoreError>;

    /// Write `bytes` at `offset` inside the region.
    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StoreError>;

    /// Make every prior write durable.
    fn flush(&mut self) -> Result<(), StoreError>;
}

fn check_bounds(offset: usize, len: usize) -> Result<(), StoreError> {
    if offset + len > RECORD_LEN {
        return Err(StoreError::OutOfBounds { offset, len });
    }
    Ok(())
}

/// File-backed store for hosted devices.
///
/// Field writes are staged in an in-memory image; `flush` writes a temp
/// file, syncs it, then renames it over the record file.
pub struct FileStore {
    path: PathBuf,
    image: [u8; RECORD_LEN],
    loaded: bool,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            image: [ERASED; RECORD_LEN],
            loaded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_image(&mut self) -> Result<bool, StoreError> {
        if !self.path.exists() {
            return Ok(false);
        }
        let bytes = fs::read(&self.path)?;
        let mut image = [ERASED; RECORD_LEN];
        let len = bytes.len().min(RECORD_LEN);
        image[..len].copy_from_slice(&bytes[..len]);
        self.image = image;
        Ok(true)
    }
}

impl StateStore for FileStore {
    fn load(&mut self) -> Result<Option<[u8; RECORD_LEN]>, StoreError> {
        let present = self.read_image()?;
        self.loaded = true;
        Ok(present.then_some(self.image))
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, bytes.len())?;
        if !self.loaded {
            self.read_image()?;
            self.loaded = true;
        }
        self.image[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(&self.image)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

/// Byte-addressed region with no atomicity beyond a single write.
///
/// Models an EEPROM/flash page for tests: keeps a log of write offsets and
/// can drop every write after a configured count to simulate power loss.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    region: [u8; RECORD_LEN],
    written: bool,
    write_log: Vec<usize>,
    flushes: usize,
    writes_before_power_loss: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            region: [ERASED; RECORD_LEN],
            written: false,
            write_log: Vec::new(),
            flushes: 0,
            writes_before_power_loss: None,
        }
    }

    /// Start from raw region contents, e.g. a corrupted record.
    pub fn with_region(region: [u8; RECORD_LEN]) -> Self {
        Self {
            region,
            written: true,
            ..Self::new()
        }
    }

    /// Let `writes` more writes land, then fail every later one.
    pub fn cut_power_after(&mut self, writes: usize) {
        self.writes_before_power_loss = Some(writes);
    }

    /// Restore power (a reboot after a cut).
    pub fn restore_power(&mut self) {
        self.writes_before_power_loss = None;
    }

    /// Offsets of every landed write, oldest first
    pub fn write_log(&self) -> &[usize] {
        &self.write_log
    }

    pub fn clear_write_log(&mut self) {
        self.write_log.clear();
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    pub fn region(&self) -> &[u8; RECORD_LEN] {
        &self.region
    }

    pub fn region_mut(&mut self) -> &mut [u8; RECORD_LEN] {
        self.written = true;
        &mut self.region
    }
}

impl StateStore for MemoryStore {
    fn load(&mut self) -> Result<Option<[u8; RECORD_LEN]>, StoreError> {
        Ok(self.written.then_some(self.region))
    }

    fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        check_bounds(offset, bytes.len())?;
        if let Some(remaining) = self.writes_before_power_loss.as_mut() {
            if *remaining == 0 {
                return Err(StoreError::PowerLoss);
            }
            *remaining -= 1;
        }
        self.region[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.written = true;
        self.write_log.push(offset);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.writes_before_power_loss == Some(0) {
            return Err(StoreError::PowerLoss);
        }
        self.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_fits_region() {
        assert_eq!(OFFSET_PREVIOUS_VERSION, 36);
        assert_eq!(OFFSET_CHECKSUM, 68);
        assert_eq!(RECORD_LEN, 132);
    }

    #[test]
    fn test_file_store_missing_file_is_blank() {
        let dir = tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("record.bin"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_file_store_writes_only_land_on_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("record.bin");
        let mut store = FileStore::new(&path);

        store.write_at(OFFSET_FLAG, &[0x01]).unwrap();
        assert!(!path.exists());

        store.flush().unwrap();
        let mut reopened = FileStore::new(&path);
        let image = reopened.load().unwrap().unwrap();
        assert_eq!(image[OFFSET_FLAG], 0x01);
        assert_eq!(image[OFFSET_BOOT_COUNT], ERASED);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_file_store_pads_short_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("record.bin");
        fs::write(&path, b"OG").unwrap();

        let image = FileStore::new(&path).load().unwrap().unwrap();
        assert_eq!(&image[..2], b"OG");
        assert!(image[2..].iter().all(|b| *b == ERASED));
    }

    #[test]
    fn test_out_of_bounds_write_rejected() {
        let mut store = MemoryStore::new();
        let result = store.write_at(RECORD_LEN - 1, &[0, 0]);
        assert!(matches!(result, Err(StoreError::OutOfBounds { .. })));
    }

    #[test]
    fn test_memory_store_power_cut() {
        let mut store = MemoryStore::new();
        store.cut_power_after(1);

        store.write_at(OFFSET_BOOT_COUNT, &[7]).unwrap();
        assert!(matches!(store.write_at(OFFSET_FLAG, &[1]), Err(StoreError::PowerLoss)));
        assert!(matches!(store.flush(), Err(StoreError::PowerLoss)));

        assert_eq!(store.region()[OFFSET_BOOT_COUNT], 7);
        assert_eq!(store.region()[OFFSET_FLAG], ERASED);
        assert_eq!(store.write_log(), &[OFFSET_BOOT_COUNT]);
    }
}
