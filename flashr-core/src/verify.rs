//! Post-write sample comparison.
//!
//! This is a spot check, not a full read-back: the first `sample_size` bytes
//! of the image are compared with the same range on the device.
use crate::checksum::read_chunk;
use crate::error::FlashError;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

pub const SAMPLE_SIZE: usize = 1024 * 1024; // 1 MiB

/// Raw nodes only serve reads in whole sectors.
const SECTOR_SIZE: usize = 512;

#[derive(Debug, Clone, Copy)]
pub struct FlashVerifier {
    sample_size: usize,
}

impl Default for FlashVerifier {
    fn default() -> Self {
        Self::new(SAMPLE_SIZE)
    }
}

impl FlashVerifier {
    pub fn new(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Compares the leading sample of `image` with the start of the device.
    ///
    /// An image shorter than the sample is compared over its whole length.
    pub fn verify<R: Read>(&self, mut image: R, raw_device_path: &Path) -> Result<bool, FlashError> {
        let mut expected = vec![0u8; self.sample_size];
        let n = read_chunk(&mut image, &mut expected).map_err(FlashError::from_read)?;
        expected.truncate(n);

        let mut device = File::open(raw_device_path).map_err(FlashError::from_read)?;
        let mut actual = vec![0u8; n.div_ceil(SECTOR_SIZE) * SECTOR_SIZE];
        let read = read_chunk(&mut device, &mut actual).map_err(FlashError::from_read)?;
        actual.truncate(read.min(n));

        let matched = samples_match(&expected, &actual);
        if matched {
            debug!(bytes = n, "verification sample matches");
        } else {
            warn!(bytes = n, device_bytes = actual.len(), "verification sample differs");
        }
        Ok(matched)
    }
}

/// Byte-for-byte equality, including length.
pub fn samples_match(expected: &[u8], actual: &[u8]) -> bool {
    expected == actual
}
