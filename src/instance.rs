//! Single-instance lock on the modem ports.
//!
//! `smsgate start` holds it for as long as the monitor runs, and one-shot
//! commands take it around their exchange, so a CLI `send` never writes to a
//! command port a running monitor owns. The file records the holder's pid.

use fs2::FileExt;
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another smsgate process is using the modem (lock {path}{owner})")]
    Held { path: String, owner: String },
    #[error("lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without waiting.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self, LockError> {
        let path = path.as_ref();
        let io = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let owner = fs::read_to_string(path)
                    .ok()
                    .map(|pid| pid.trim().to_string())
                    .filter(|pid| !pid.is_empty())
                    .map(|pid| format!(", pid {pid}"))
                    .unwrap_or_default();
                return Err(LockError::Held {
                    path: path.display().to_string(),
                    owner,
                });
            }
            Err(e) => return Err(io(e)),
        }

        file.set_len(0).map_err(io)?;
        write!(file, "{}", std::process::id()).map_err(io)?;
        file.flush().map_err(io)?;
        debug!("Holding instance lock {}", path.display());
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("smsgate.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(first.path()).unwrap(),
            std::process::id().to_string()
        );
        match InstanceLock::acquire(&path) {
            Err(LockError::Held { owner, .. }) => {
                assert_eq!(owner, format!(", pid {}", std::process::id()));
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(first);
        InstanceLock::acquire(&path).unwrap();
    }
}
