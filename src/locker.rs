//! Filesystem-backed mutual exclusion.
//!
//! Two different locks live here:
//!
//! - The **process lock**: one `<name>.lock` artifact per agent role,
//!   created with exclusive-create semantics and held for the process
//!   lifetime. An already-present artifact means another instance runs
//!   this role — a fatal condition decided by the caller.
//! - The **optimize claim**: a cooperative fleet-wide marker recording
//!   the IP of whichever peer currently owns a running optimize job. The
//!   artifact alone is never trusted as ground truth: the staleness check
//!   re-derives it from the owner's live thread list and deletes the
//!   claim when no `SYSTEM OPTIMIZE` job shows up there.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::engine::ProbeFactory;
use crate::error::{Result, SentinelError};

/// Named filesystem lock plus the optimize-claim operations.
pub struct Locker {
    name: String,
    lock_dir: PathBuf,
    optimize_path: Option<PathBuf>,
    probes: Arc<dyn ProbeFactory>,
    clock: Arc<dyn Clock>,
    probe_attempts: i32,
    /// Keeps the lock file handle open while the lock is held.
    #[allow(dead_code)]
    held: Option<File>,
}

impl Locker {
    pub fn new(
        name: impl Into<String>,
        lock_dir: impl Into<PathBuf>,
        optimize_path: Option<PathBuf>,
        probes: Arc<dyn ProbeFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            lock_dir: lock_dir.into(),
            optimize_path,
            probes,
            clock,
            probe_attempts: -1,
            held: None,
        }
    }

    pub fn set_probe_attempts(&mut self, attempts: i32) {
        self.probe_attempts = attempts;
    }

    fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", self.name))
    }

    /// Take the process lock. Exclusive-create closes the race between
    /// two processes both observing "absent".
    pub fn acquire(&mut self) -> Result<()> {
        let path = self.lock_path();

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => {
                debug!(lock = %self.name, path = %path.display(), "lock acquired");
                self.held = Some(file);
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                Err(SentinelError::LockHeld(self.name.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Release the process lock after an optional delay — letting a
    /// dependent process observe the lock before it disappears.
    pub async fn unlock(&mut self, delay: Duration) -> Result<()> {
        if !delay.is_zero() {
            self.clock.sleep(delay).await;
        }

        self.held = None;
        match std::fs::remove_file(self.lock_path()) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Record this peer as the owner of the running optimize job. The
    /// claim is written unconditionally.
    pub fn set_optimize_lock(&self, owner_ip: &str) -> Result<()> {
        let path = self
            .optimize_path
            .as_ref()
            .ok_or(SentinelError::OptimizePathMissing)?;

        std::fs::write(path, owner_ip)?;
        info!(owner = %owner_ip, "optimize claim recorded");
        Ok(())
    }

    /// Whether a cluster-wide optimize is currently running.
    ///
    /// No artifact — no one is optimizing. An existing artifact is
    /// verified against the owner's live thread list; a claim whose owner
    /// shows no `SYSTEM OPTIMIZE` job is stale and gets deleted.
    pub async fn check_optimize_lock(&self, artifact: &Path, worker_port: u16) -> Result<bool> {
        if !artifact.exists() {
            return Ok(false);
        }

        let owner_ip = std::fs::read_to_string(artifact)?.trim().to_string();

        let mut probe = self
            .probes
            .connect(&owner_ip, worker_port, "", self.probe_attempts)
            .await?;

        let threads = probe.show_threads().await?;
        if threads.iter().any(|thread| thread.is_system_optimize()) {
            return Ok(true);
        }

        debug!(owner = %owner_ip, "stale optimize claim removed");
        match std::fs::remove_file(artifact) {
            Ok(()) => Ok(false),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
