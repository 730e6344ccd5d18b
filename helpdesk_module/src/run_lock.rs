//! File lock that keeps two processing runs from overlapping.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{info, warn};
use uuid::Uuid;

pub const DEFAULT_STALE_SECS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum RunLockError {
    #[error("run lock {path} is held ({holder})")]
    Locked { path: PathBuf, holder: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the lock, clearing a stale lock file at most once.
    pub fn acquire(&self) -> Result<RunLockGuard, RunLockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        match self.try_create() {
            Err(RunLockError::Locked { holder, .. }) if self.is_stale()? => {
                warn!(
                    "removing stale run lock {} ({})",
                    self.path.display(),
                    holder
                );
                match fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                self.try_create()
            }
            other => other,
        }
    }

    fn try_create(&self) -> Result<RunLockGuard, RunLockError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&self.path)
                    .map(|content| content.trim().replace('\n', " "))
                    .unwrap_or_default();
                return Err(RunLockError::Locked {
                    path: self.path.clone(),
                    holder,
                });
            }
            Err(err) => return Err(err.into()),
        };
        // The token tells this holder's file apart from a successor's after a
        // stale takeover, even within one process.
        let contents = format!(
            "{}\n{}\n{}\n",
            std::process::id(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            Uuid::new_v4()
        );
        let guard = RunLockGuard {
            path: self.path.clone(),
            contents,
        };
        file.write_all(guard.contents.as_bytes())?;
        info!("acquired run lock {}", self.path.display());
        Ok(guard)
    }

    fn is_stale(&self) -> Result<bool, RunLockError> {
        let locked_at = match self.locked_at() {
            Ok(value) => value,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let age = Utc::now().signed_duration_since(locked_at);
        Ok(age.to_std().map(|age| age > self.stale_after).unwrap_or(false))
    }

    /// Timestamp written by the holder, else the file's mtime.
    fn locked_at(&self) -> std::io::Result<DateTime<Utc>> {
        let content = fs::read_to_string(&self.path)?;
        if let Some(stamp) = content
            .lines()
            .nth(1)
            .and_then(|line| DateTime::parse_from_rfc3339(line.trim()).ok())
        {
            return Ok(stamp.with_timezone(&Utc));
        }
        let modified = fs::metadata(&self.path)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

/// Removes the lock file on drop, unless another run has taken it over.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    contents: String,
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(current) if current == self.contents => {}
            Ok(_) => {
                warn!(
                    "run lock {} was taken over; leaving it in place",
                    self.path.display()
                );
                return;
            }
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!("failed to read run lock {}: {}", self.path.display(), err);
                return;
            }
        }
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to release run lock {}: {}", self.path.display(), err);
            }
        }
    }
}
