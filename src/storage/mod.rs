//! # Storage Module - Received Message Inbox
//!
//! Messages picked up from the modem are kept in arrival order in memory and
//! mirrored to a single JSON array on disk:
//!
//! ```text
//! [
//!   { "id": "7c1e…", "index": "3", "status": "REC UNREAD", "sender": "+1555…",
//!     "timestamp": "2024-01-02T10:11:12+00:00", "body": "hi" }
//! ]
//! ```
//!
//! The file is the source of truth, so a running daemon and one-shot CLI
//! commands can share it. Every mutation takes an exclusive `fs2` lock on a
//! sidecar `.<name>.lock` file, re-reads the inbox, applies the change and
//! writes the result through a temp file and an atomic rename. The lock lives
//! on the sidecar because the rename replaces the inbox file itself.
//!
//! A failed write is logged and counted. Until a later write succeeds the
//! in-memory copy stays authoritative and the file is not re-read.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use smsgate::storage::{MessageStore, PersistedMessage};
//! # fn demo(record: smsgate::modem::SmsRecord) {
//! let mut store = MessageStore::load("inbox.json");
//! let msg = PersistedMessage::new(record);
//! let id = msg.id.clone();
//! store.append(msg);
//! assert!(store.delete(&id));
//! # }
//! ```

use fs2::FileExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::metrics;
use crate::modem::SmsRecord;

/// A received message plus the stable id it was given on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMessage {
    pub id: String,
    #[serde(flatten)]
    pub record: SmsRecord,
}

impl PersistedMessage {
    /// Wrap a record with a freshly generated v4 UUID.
    pub fn new(record: SmsRecord) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            record,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("inbox io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("inbox encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Inbox shared between the notification watcher and request handlers.
pub type SharedStore = Arc<Mutex<MessageStore>>;

/// Ordered inbox backed by a JSON file.
#[derive(Debug)]
pub struct MessageStore {
    path: PathBuf,
    messages: Vec<PersistedMessage>,
    /// The last write failed; the file lags behind `messages`.
    dirty: bool,
}

impl MessageStore {
    /// Read the backing file. A missing or undecodable file yields an empty
    /// inbox; nothing is written until the first mutation.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let messages = read_file(&path).unwrap_or_default();
        info!("Loaded {} stored messages from {}", messages.len(), path.display());
        Self {
            path,
            messages,
            dirty: false,
        }
    }

    /// Pick up changes other processes made to the file. Keeps the in-memory
    /// copy when the file is missing or unreadable.
    pub fn refresh(&mut self) {
        let _lock = match lock_inbox(&self.path) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!("Could not lock inbox {}: {}", self.path.display(), e);
                None
            }
        };
        self.reload();
    }

    fn reload(&mut self) {
        if self.dirty {
            return;
        }
        if let Some(messages) = read_file(&self.path) {
            self.messages = messages;
        }
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn messages(&self) -> &[PersistedMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PersistedMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Append in arrival order and rewrite the file.
    pub fn append(&mut self, message: PersistedMessage) {
        debug!("Storing message {} from {}", message.id, message.record.sender);
        self.mutate(|messages| messages.push(message));
    }

    /// Remove the first message with `id`. Returns whether one was removed.
    /// The file is rewritten either way.
    pub fn delete(&mut self, id: &str) -> bool {
        self.mutate(|messages| match messages.iter().position(|m| m.id == id) {
            Some(pos) => {
                messages.remove(pos);
                true
            }
            None => false,
        })
    }

    /// Read-modify-write under the inbox lock.
    fn mutate<R>(&mut self, op: impl FnOnce(&mut Vec<PersistedMessage>) -> R) -> R {
        let lock = lock_inbox(&self.path);
        if let Err(e) = &lock {
            warn!("Could not lock inbox {}: {}", self.path.display(), e);
        }
        self.reload();
        let out = op(&mut self.messages);
        self.dirty = match self.write() {
            Ok(()) => false,
            Err(e) => {
                metrics::inc_persistence_failures();
                error!("Failed to write inbox {}: {}", self.path.display(), e);
                true
            }
        };
        drop(lock);
        out
    }

    /// Serialize the whole inbox and atomically replace the backing file.
    pub fn persist(&self) -> Result<(), StoreError> {
        let _lock = lock_inbox(&self.path)?;
        self.write()
    }

    fn write(&self) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(&self.messages)?;
        write_atomic(&self.path, content.as_bytes())
    }
}

/// Messages currently on disk. `None` when the file is missing or cannot be
/// decoded.
fn read_file(path: &Path) -> Option<Vec<PersistedMessage>> {
    match fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<Vec<PersistedMessage>>(&text) {
            Ok(messages) => Some(messages),
            Err(e) => {
                warn!("Ignoring undecodable inbox {}: {}", path.display(), e);
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No inbox at {}", path.display());
            None
        }
        Err(e) => {
            warn!("Could not read inbox {}: {}", path.display(), e);
            None
        }
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn base_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("inbox.json")
}

/// Exclusive lock on the sidecar file next to the inbox. fs2 locks are
/// blocking and advisory; released when the returned file drops.
fn lock_inbox(path: &Path) -> Result<File, StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(format!(".{}.lock", base_name(path))))?;
    lock_file.lock_exclusive()?;
    Ok(lock_file)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir)?;
    let base = base_name(path);
    let mut counter = 0u32;
    let tmp_path = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(mut tmp) => {
                tmp.write_all(content)?;
                tmp.flush()?;
                let _ = tmp.sync_all();
                break candidate;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    };

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    if let Ok(dir_file) = File::open(dir) {
        let _ = dir_file.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::sms::parse_timestamp;

    fn record(index: &str, body: &str) -> SmsRecord {
        SmsRecord {
            index: index.into(),
            status: "REC UNREAD".into(),
            sender: "+15550001112".into(),
            timestamp: parse_timestamp("24/01/02,10:11:12+00").unwrap(),
            body: body.into(),
        }
    }

    #[test]
    fn persisted_message_serializes_flat() {
        let msg = PersistedMessage::new(record("3", "hi"));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], msg.id.as_str());
        assert_eq!(value["index"], "3");
        assert_eq!(value["body"], "hi");
        assert!(value.get("record").is_none());
    }

    #[test]
    fn undecodable_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        fs::write(&path, "{ not json").unwrap();
        let store = MessageStore::load(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn delete_missing_id_still_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inbox.json");
        let mut store = MessageStore::load(&path);
        assert!(!store.delete("nope"));
        let text = fs::read_to_string(&path).unwrap();
        let back: Vec<PersistedMessage> = serde_json::from_str(&text).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn ids_are_unique() {
        let a = PersistedMessage::new(record("1", "a"));
        let b = PersistedMessage::new(record("1", "a"));
        assert_ne!(a.id, b.id);
    }
}
