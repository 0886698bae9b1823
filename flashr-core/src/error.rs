//! Error types for the flash path.
//!
//! Everything between "the caller asked for a flash" and "the flash reached a
//! terminal state" reports failures as a [`FlashError`]. Configuration,
//! persistence and device discovery use `anyhow` instead, since their callers
//! only ever display those errors.

use std::fmt;
use std::io;

/// Why a flash (or one of its phases) did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    /// The target does not exist or is not an acceptable whole-disk target.
    #[error("target device not found or not a valid whole-disk target")]
    DeviceNotFound,
    #[error("image source not found")]
    ImageNotFound,
    #[error("target device is read-only")]
    DeviceReadOnly,
    /// The image is as large as, or larger than, the device.
    #[error("image does not fit on the target device")]
    ImageTooLarge,
    #[error("insufficient permissions to access the target device")]
    InsufficientPermissions,
    /// Another flash is already running on this orchestrator.
    #[error("a flash operation is already in progress")]
    DeviceBusy,
    #[error("operation cancelled by user")]
    OperationCancelled,
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
    /// The image no longer matches the checksum recorded for it.
    #[error("image checksum does not match the recorded checksum")]
    ChecksumMismatch,
    #[error("could not unmount the target device")]
    UnmountFailed,
    /// The bytes read back from the device differ from the image.
    #[error("verification failed: device contents do not match the image")]
    VerificationMismatch,
}

impl FlashError {
    /// Maps an error raised while reading the image or device.
    pub(crate) fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => FlashError::InsufficientPermissions,
            _ => FlashError::ReadFailed(err.to_string()),
        }
    }

    /// Maps an error raised while opening or writing the device node.
    pub(crate) fn from_write(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => FlashError::InsufficientPermissions,
            io::ErrorKind::NotFound => FlashError::DeviceNotFound,
            _ => FlashError::WriteFailed(err.to_string()),
        }
    }
}

/// What a failed flash left behind on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCondition {
    /// The failure happened before anything was written.
    Untouched,
    /// Writing had started: the device holds a partial image and must not be
    /// treated as bootable.
    Indeterminate,
}

impl DeviceCondition {
    pub fn is_untouched(&self) -> bool {
        matches!(self, DeviceCondition::Untouched)
    }
}

impl fmt::Display for DeviceCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceCondition::Untouched => write!(f, "device contents unchanged"),
            DeviceCondition::Indeterminate => {
                write!(f, "device contents are indeterminate and not safely bootable")
            }
        }
    }
}

/// The error half of [`crate::orchestrator::FlashOrchestrator::flash`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error} ({device})")]
pub struct FlashFailure {
    #[source]
    pub error: FlashError,
    pub device: DeviceCondition,
}

impl FlashFailure {
    pub fn untouched(error: FlashError) -> Self {
        Self {
            error,
            device: DeviceCondition::Untouched,
        }
    }

    pub fn indeterminate(error: FlashError) -> Self {
        Self {
            error,
            device: DeviceCondition::Indeterminate,
        }
    }
}
