//! Unmounting and remounting the target around a flash.
//!
//! The actual work is done by an external disk-management capability (on
//! macOS, `diskutil`). Each call is bounded: a waiter thread reports the
//! operation's exit over a channel, and if nothing arrives within the
//! timeout the operation is killed and reported as failed.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountAction {
    Unmount,
    Mount,
}

impl MountAction {
    fn verb(&self) -> &'static str {
        match self {
            MountAction::Unmount => "unmount",
            MountAction::Mount => "mount",
        }
    }
}

/// A running mount or unmount operation.
pub trait DiskJob: Send + Sync {
    /// Blocks until the operation exits; `true` means it succeeded.
    fn wait(&self) -> io::Result<bool>;

    /// Terminates the operation. May be called while another thread waits.
    fn kill(&self) -> io::Result<()>;
}

/// Starts mount and unmount operations for whole disks.
pub trait DiskManager: Send + Sync {
    fn start(&self, action: MountAction, device: &Path) -> io::Result<Box<dyn DiskJob>>;
}

/// `diskutil unmountDisk` / `diskutil mountDisk`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diskutil;

struct DiskutilJob(duct::Handle);

impl DiskJob for DiskutilJob {
    fn wait(&self) -> io::Result<bool> {
        let output = self.0.wait()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, "diskutil failed: {}", stderr.trim());
        }
        Ok(output.status.success())
    }

    fn kill(&self) -> io::Result<()> {
        self.0.kill()
    }
}

impl DiskManager for Diskutil {
    fn start(&self, action: MountAction, device: &Path) -> io::Result<Box<dyn DiskJob>> {
        let verb = match action {
            MountAction::Unmount => "unmountDisk",
            MountAction::Mount => "mountDisk",
        };
        let handle = duct::cmd!("diskutil", verb, device)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()?;
        Ok(Box::new(DiskutilJob(handle)))
    }
}

/// Bounded mount/unmount on top of a [`DiskManager`]. No retries.
#[derive(Clone)]
pub struct MountController {
    manager: Arc<dyn DiskManager>,
    timeout: Duration,
}

impl MountController {
    pub fn new(manager: Arc<dyn DiskManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    pub fn unmount(&self, device: &Path) -> bool {
        self.run(MountAction::Unmount, device)
    }

    pub fn mount(&self, device: &Path) -> bool {
        self.run(MountAction::Mount, device)
    }

    fn run(&self, action: MountAction, device: &Path) -> bool {
        debug!(device = %device.display(), "starting {}", action.verb());
        let job: Arc<dyn DiskJob> = match self.manager.start(action, device) {
            Ok(job) => Arc::from(job),
            Err(e) => {
                warn!(device = %device.display(), "could not start {}: {e}", action.verb());
                return false;
            }
        };

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&job);
        thread::spawn(move || {
            // The receiver is gone if we already timed out.
            let _ = tx.send(waiter.wait());
        });

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(true)) => {
                info!(device = %device.display(), "{} succeeded", action.verb());
                true
            }
            Ok(Ok(false)) => {
                warn!(device = %device.display(), "{} failed", action.verb());
                false
            }
            Ok(Err(e)) => {
                warn!(device = %device.display(), "{} failed: {e}", action.verb());
                false
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    device = %device.display(),
                    timeout = ?self.timeout,
                    "{} timed out, terminating it",
                    action.verb()
                );
                if let Err(e) = job.kill() {
                    warn!("failed to terminate {}: {e}", action.verb());
                }
                false
            }
            Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}
