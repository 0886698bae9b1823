//! The flash state machine.
//!
//! One [`FlashOrchestrator`] runs at most one flash at a time:
//!
//! ```text
//! Idle → Preparing → [CalculatingChecksum] → Flashing → Completed | Failed
//! ```
//!
//! Nothing destructive happens until validation has passed in the same
//! invocation. Once the write phase has started, every failure is reported
//! with [`DeviceCondition::Indeterminate`](crate::error::DeviceCondition).

use crate::cancel::CancelToken;
use crate::checksum;
use crate::config::{Config, CopyBackend};
use crate::device::DeviceDescriptor;
use crate::error::{FlashError, FlashFailure};
use crate::history::{ImageHistoryStore, JsonImageHistory};
use crate::image::{FileImageAccess, ImageAccess, ImageDescriptor};
use crate::mount::{Diskutil, MountController};
use crate::validate::{FlashPreconditionValidator, FsProbe};
use crate::verify::FlashVerifier;
use crate::write::{BlockCopy, DdBlockCopy, NativeBlockCopy, RawDeviceWriter};
use anyhow::{Context, Result};
use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// A problem that did not stop the flash from completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashWarning {
    /// The image was written and verified, but the device could not be
    /// mounted again afterwards.
    RemountFailed,
}

impl fmt::Display for FlashWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashWarning::RemountFailed => {
                write!(f, "the device was flashed but could not be remounted")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlashState {
    Idle,
    Preparing,
    CalculatingChecksum(f64),
    Flashing(f64),
    Completed { warnings: Vec<FlashWarning> },
    Failed(FlashError),
}

impl FlashState {
    /// No flash is running and a new one may start.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlashState::Idle | FlashState::Completed { .. } | FlashState::Failed(_)
        )
    }

    /// Whether the state machine may move from `self` to `next`.
    pub fn allows(&self, next: &FlashState) -> bool {
        use FlashState::*;
        match (self, next) {
            (Idle | Completed { .. } | Failed(_), Preparing) => true,
            (Completed { .. } | Failed(_), Idle) => true,
            (Preparing, CalculatingChecksum(_) | Flashing(_) | Failed(_)) => true,
            (CalculatingChecksum(_), CalculatingChecksum(_) | Flashing(_) | Failed(_)) => true,
            (Flashing(_), Flashing(_) | Completed { .. } | Failed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FlashState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashState::Idle => write!(f, "idle"),
            FlashState::Preparing => write!(f, "preparing"),
            FlashState::CalculatingChecksum(p) => {
                write!(f, "calculating checksum ({:.0}%)", p * 100.0)
            }
            FlashState::Flashing(p) => write!(f, "flashing ({:.0}%)", p * 100.0),
            FlashState::Completed { warnings } if warnings.is_empty() => write!(f, "completed"),
            FlashState::Completed { warnings } => {
                write!(f, "completed with {} warning(s)", warnings.len())
            }
            FlashState::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// What a successful flash produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub raw_device_path: PathBuf,
    /// The image checksum, when the checksum phase ran.
    pub checksum: Option<String>,
    pub warnings: Vec<FlashWarning>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashOptions {
    /// Compute (or re-check) the image checksum before writing.
    pub compute_checksum: bool,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self {
            compute_checksum: true,
        }
    }
}

/// The collaborators a [`FlashOrchestrator`] drives.
pub struct FlashComponents {
    pub validator: FlashPreconditionValidator,
    pub images: Arc<dyn ImageAccess>,
    pub mounts: MountController,
    pub writer: RawDeviceWriter,
    pub verifier: FlashVerifier,
    pub history: Arc<dyn ImageHistoryStore>,
}

pub type StateObserver = Box<dyn Fn(&FlashState) + Send + Sync>;

pub struct FlashOrchestrator {
    components: FlashComponents,
    options: FlashOptions,
    state: Mutex<FlashState>,
    busy: AtomicBool,
    cancel: CancelToken,
    observer: Option<StateObserver>,
}

/// Clears the busy flag on every exit path.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FlashOrchestrator {
    pub fn new(components: FlashComponents, options: FlashOptions) -> Self {
        Self {
            components,
            options,
            state: Mutex::new(FlashState::Idle),
            busy: AtomicBool::new(false),
            cancel: CancelToken::new(),
            observer: None,
        }
    }

    /// Wires the shipped implementations: filesystem probe, plain image
    /// files, `diskutil`, the configured copy backend and the JSON history.
    pub fn from_config(config: &Config) -> Result<Self> {
        let images: Arc<dyn ImageAccess> = Arc::new(FileImageAccess);
        let copier: Box<dyn BlockCopy> = match config.flash.copy_backend {
            CopyBackend::Native => Box::new(NativeBlockCopy {
                direct_io: config.flash.direct_io,
            }),
            CopyBackend::Dd => Box::new(DdBlockCopy {
                poll_interval: config.flash.progress_interval(),
                ..DdBlockCopy::default()
            }),
        };
        let history_path = config.storage.history_path();
        let history = JsonImageHistory::open(&history_path, config.storage.history_capacity)
            .with_context(|| format!("open image history: {}", history_path.display()))?;

        let components = FlashComponents {
            validator: FlashPreconditionValidator::new(Arc::new(FsProbe), Arc::clone(&images)),
            images,
            mounts: MountController::new(Arc::new(Diskutil), config.flash.mount_timeout()),
            writer: RawDeviceWriter::new(copier)
                .with_block_size(config.flash.block_size)
                .with_progress_interval(config.flash.progress_interval()),
            verifier: FlashVerifier::new(config.flash.verify_sample_bytes),
            history: Arc::new(history),
        };
        let options = FlashOptions {
            compute_checksum: config.flash.compute_checksum,
        };
        Ok(Self::new(components, options))
    }

    /// Registers a callback that sees every state the orchestrator enters.
    /// It runs on the flashing thread and should return quickly.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&FlashState) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn state(&self) -> FlashState {
        self.lock_state().clone()
    }

    /// The store checksums are recorded in.
    pub fn history(&self) -> &dyn ImageHistoryStore {
        self.components.history.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Requests cancellation of the running flash. Observed between chunks
    /// of the checksum and write phases.
    pub fn cancel(&self) {
        if self.is_busy() {
            info!("cancellation requested");
        }
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Returns to `Idle` after `Completed` or `Failed`. Refused with
    /// [`FlashError::DeviceBusy`] while a flash is running.
    ///
    /// A flash that unwound without finishing leaves a phase state behind
    /// with the busy flag already cleared; that state is forced to `Idle`.
    pub fn reset(&self) -> Result<(), FlashError> {
        if self.is_busy() {
            return Err(FlashError::DeviceBusy);
        }
        let forced = {
            let mut state = self.lock_state();
            if *state == FlashState::Idle {
                return Ok(());
            }
            if !state.is_terminal() {
                warn!("abandoned flash left state {}; forcing idle", *state);
                *state = FlashState::Idle;
            }
            *state == FlashState::Idle
        };
        if forced {
            self.notify(&FlashState::Idle);
        } else {
            self.transition(FlashState::Idle);
        }
        Ok(())
    }

    /// Validates, checksums, unmounts, writes, verifies and remounts.
    ///
    /// The checksum computed for `image` is attached to it. A second call
    /// while one is running fails immediately with
    /// [`FlashError::DeviceBusy`] and leaves the state alone.
    pub fn flash(
        &self,
        image: &mut ImageDescriptor,
        device: &DeviceDescriptor,
    ) -> Result<FlashReport, FlashFailure> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(device = %device.path.display(), "rejected: a flash is already in progress");
            return Err(FlashFailure::untouched(FlashError::DeviceBusy));
        }
        let _busy = BusyGuard(&self.busy);
        self.cancel.reset();

        info!(
            image = %image.path().display(),
            device = %device.path.display(),
            "starting flash"
        );
        let result = self.run(image, device);

        match &result {
            Ok(report) => {
                info!(raw = %report.raw_device_path.display(), "flash completed");
                self.transition(FlashState::Completed {
                    warnings: report.warnings.clone(),
                });
            }
            Err(failure) => {
                error!("flash failed: {failure}");
                self.transition(FlashState::Failed(failure.error.clone()));
                if failure.error == FlashError::OperationCancelled {
                    self.transition(FlashState::Idle);
                }
            }
        }
        result
    }

    fn run(
        &self,
        image: &mut ImageDescriptor,
        device: &DeviceDescriptor,
    ) -> Result<FlashReport, FlashFailure> {
        let c = &self.components;

        self.transition(FlashState::Preparing);
        let raw = c
            .validator
            .validate(image, device)
            .map_err(FlashFailure::untouched)?;

        if self.options.compute_checksum {
            self.checksum_phase(image)?;
        }

        let mut source = self.open_image(image).map_err(FlashFailure::untouched)?;

        let was_mounted = device.is_mounted();
        if was_mounted && !c.mounts.unmount(&device.path) {
            return Err(FlashFailure::untouched(FlashError::UnmountFailed));
        }

        self.transition(FlashState::Flashing(0.0));
        c.writer
            .write(&mut *source, &raw, image.size(), &self.cancel, |p| {
                self.transition(FlashState::Flashing(p))
            })
            .map_err(FlashFailure::indeterminate)?;
        drop(source);

        let sample = self.open_image(image).map_err(FlashFailure::indeterminate)?;
        let matched = c
            .verifier
            .verify(sample, &raw)
            .map_err(FlashFailure::indeterminate)?;
        if !matched {
            return Err(FlashFailure::indeterminate(FlashError::VerificationMismatch));
        }

        let mut warnings = Vec::new();
        if was_mounted && !c.mounts.mount(&device.path) {
            warn!(device = %device.path.display(), "flash verified but remount failed");
            warnings.push(FlashWarning::RemountFailed);
        }

        Ok(FlashReport {
            raw_device_path: raw,
            checksum: image.checksum().map(str::to_owned),
            warnings,
        })
    }

    /// Re-checks a known checksum, or computes, attaches and records one.
    fn checksum_phase(&self, image: &mut ImageDescriptor) -> Result<(), FlashFailure> {
        self.transition(FlashState::CalculatingChecksum(0.0));
        let source = self.open_image(image).map_err(FlashFailure::untouched)?;
        let on_progress = |p| self.transition(FlashState::CalculatingChecksum(p));

        if let Some(expected) = image.checksum().map(str::to_owned) {
            debug!(%expected, "re-checking image checksum");
            let matched =
                checksum::verify(source, image.size(), &expected, &self.cancel, on_progress)
                    .map_err(FlashFailure::untouched)?;
            if !matched {
                warn!(image = %image.path().display(), "image does not match its recorded checksum");
                return Err(FlashFailure::untouched(FlashError::ChecksumMismatch));
            }
            return Ok(());
        }

        let digest = checksum::compute_hash(source, image.size(), &self.cancel, on_progress)
            .map_err(FlashFailure::untouched)?;
        image.attach_checksum(digest.as_str());
        if let Err(e) = self.components.history.record(image.path(), &digest) {
            warn!(image = %image.path().display(), "could not record image history: {e:#}");
        }
        Ok(())
    }

    fn open_image(&self, image: &ImageDescriptor) -> Result<Box<dyn Read + Send>, FlashError> {
        self.components.images.open(image).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FlashError::ImageNotFound,
            _ => FlashError::from_read(e),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, next: FlashState) {
        {
            let mut state = self.lock_state();
            if !state.allows(&next) {
                warn!("ignoring illegal state transition from {} to {}", *state, next);
                return;
            }
            *state = next.clone();
        }
        self.notify(&next);
    }

    fn notify(&self, state: &FlashState) {
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }
}

impl fmt::Debug for FlashOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashOrchestrator")
            .field("state", &self.state())
            .field("busy", &self.is_busy())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
