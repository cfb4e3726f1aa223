//! Durable key-value storage shared by the foreground and background contexts
//!
//! Values are opaque strings. Shared mutable state is kept append-only
//! (one JSON document per line) so that two processes appending to the same
//! key never lose each other's updates; readers merge the log idempotently.

use crate::error::StorageError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// Durable storage handle, passed explicitly to every context that needs it
pub trait DurableStore: Send + Sync {
    /// Read the whole value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` only if `key` has never been written; returns the value that won
    fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StorageError>;

    /// Append one line to the log under `key`
    fn append(&self, key: &str, line: &str) -> Result<(), StorageError>;

    /// Read the log under `key` as lines, skipping blank ones
    fn lines(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .get(key)?
            .map(|content| {
                content.lines().filter(|l| !l.trim().is_empty()).map(str::to_string).collect()
            })
            .unwrap_or_default())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// File-per-key storage in a directory
///
/// Appends are a single `write_all` on an O_APPEND handle, so concurrent
/// writers from separate processes interleave whole lines.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "durable_store_opened");
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The value is written and synced under a temp name, then hard-linked into
    /// place, so `key` never exists with partial contents.
    fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(existing) = self.get(key)? {
            return Ok(existing);
        }

        // Keys never start with '.', so staging names cannot collide with them
        let staging = self.dir.join(format!(".{key}.{}.tmp", Uuid::now_v7().simple()));
        let staged = write_synced(&staging, value);
        let linked = staged.and_then(|()| fs::hard_link(&staging, &path));
        let _ = fs::remove_file(&staging);

        match linked {
            Ok(()) => {
                debug!(key = %key, "durable_value_created");
                Ok(value.to_string())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(key = %key, "durable_value_lost_race");
                Ok(fs::read_to_string(&path)?)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, key: &str, line: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;

        debug!(key = %key, bytes = %buf.len(), "durable_line_appended");
        Ok(())
    }
}

fn write_synced(path: &Path, value: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(value.as_bytes())?;
    file.sync_all()
}

/// In-process storage for tests and simulations
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<FxHashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        validate_key(key)?;
        Ok(self.values.lock().get(key).cloned())
    }

    fn set_if_absent(&self, key: &str, value: &str) -> Result<String, StorageError> {
        validate_key(key)?;
        let mut values = self.values.lock();
        Ok(values.entry(key.to_string()).or_insert_with(|| value.to_string()).clone())
    }

    fn append(&self, key: &str, line: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        let mut values = self.values.lock();
        let entry = values.entry(key.to_string()).or_default();
        entry.push_str(line);
        entry.push('\n');
        Ok(())
    }
}
