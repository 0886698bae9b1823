//! Streaming SHA-256 over an image, with progress and cancellation.
use crate::cancel::CancelToken;
use crate::error::FlashError;
use sha2::{Digest, Sha256};
use std::io::{self, Read};
use tracing::debug;

/// The hash is fed in 1 MiB chunks; cancellation and progress are handled
/// between chunks.
pub const CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Computes the SHA-256 of `source` as lowercase hex.
///
/// `on_progress` receives `bytes_processed / total_size` after each chunk.
/// The values never decrease and stay below 1.0 while reading; exactly one
/// 1.0 is reported, once the digest has been finalized. If `cancel` is set
/// before a chunk is read, the hash is abandoned and
/// [`FlashError::OperationCancelled`] is returned.
pub fn compute_hash<R, F>(
    mut source: R,
    total_size: u64,
    cancel: &CancelToken,
    mut on_progress: F,
) -> Result<String, FlashError>
where
    R: Read,
    F: FnMut(f64),
{
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut processed: u64 = 0;
    let mut last_reported = 0.0_f64;

    loop {
        if cancel.is_cancelled() {
            debug!(processed, "checksum cancelled");
            return Err(FlashError::OperationCancelled);
        }

        let n = read_chunk(&mut source, &mut buffer).map_err(FlashError::from_read)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        processed += n as u64;

        if total_size > 0 {
            let progress = processed as f64 / total_size as f64;
            if progress < 1.0 && progress > last_reported {
                last_reported = progress;
                on_progress(progress);
            }
        }
    }

    let digest = hex::encode(hasher.finalize());
    on_progress(1.0);
    debug!(processed, %digest, "checksum complete");
    Ok(digest)
}

/// Hashes `source` and compares it against `expected_hex`, ignoring case.
pub fn verify<R, F>(
    source: R,
    total_size: u64,
    expected_hex: &str,
    cancel: &CancelToken,
    on_progress: F,
) -> Result<bool, FlashError>
where
    R: Read,
    F: FnMut(f64),
{
    let actual = compute_hash(source, total_size, cancel, on_progress)?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

/// Fills `buf` from `reader`, stopping early only at end of stream.
pub(crate) fn read_chunk<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn known_digests() {
        let cancel = CancelToken::new();
        assert_eq!(compute_hash(Cursor::new(b"abc"), 3, &cancel, |_| {}).unwrap(), ABC_SHA256);
        assert_eq!(compute_hash(Cursor::new(b""), 0, &cancel, |_| {}).unwrap(), EMPTY_SHA256);
    }

    #[test]
    fn progress_is_monotonic_and_ends_with_a_single_one() {
        let data = vec![7u8; CHUNK_SIZE * 3 + 10];
        let mut seen = Vec::new();
        compute_hash(Cursor::new(&data), data.len() as u64, &CancelToken::new(), |p| seen.push(p))
            .unwrap();

        assert_eq!(seen.len(), 4);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.iter().all(|p| (0.0..=1.0).contains(p)));
        assert_eq!(seen.iter().filter(|p| **p == 1.0).count(), 1);
        assert_eq!(*seen.last().unwrap(), 1.0);
    }

    #[test]
    fn exact_chunk_multiple_still_reports_one_only_at_the_end() {
        let data = vec![1u8; CHUNK_SIZE * 2];
        let mut seen = Vec::new();
        compute_hash(Cursor::new(&data), data.len() as u64, &CancelToken::new(), |p| seen.push(p))
            .unwrap();
        assert_eq!(seen, vec![0.5, 1.0]);
    }

    #[test]
    fn cancel_between_chunks() {
        let data = vec![0u8; CHUNK_SIZE * 4];
        let cancel = CancelToken::new();
        let mut seen = Vec::new();

        let result = compute_hash(Cursor::new(&data), data.len() as u64, &cancel, |p| {
            seen.push(p);
            cancel.cancel();
        });

        assert_eq!(result, Err(FlashError::OperationCancelled));
        assert_eq!(seen, vec![0.25]);
    }

    #[test]
    fn verify_ignores_case() {
        let cancel = CancelToken::new();
        let upper = ABC_SHA256.to_uppercase();
        assert!(verify(Cursor::new(b"abc"), 3, &upper, &cancel, |_| {}).unwrap());
        assert!(!verify(Cursor::new(b"abd"), 3, ABC_SHA256, &cancel, |_| {}).unwrap());
    }

    #[test]
    fn read_errors_are_read_failures() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("bad sector"))
            }
        }
        let err = compute_hash(Broken, 10, &CancelToken::new(), |_| {}).unwrap_err();
        assert_eq!(err, FlashError::ReadFailed("bad sector".to_string()));
    }
}
