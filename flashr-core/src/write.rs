//! Contains the logic for streaming an image onto a raw device node.
//!
//! The copy itself is done by a [`BlockCopy`] backend:
//! - [`NativeBlockCopy`] reads and writes in-process and counts bytes itself.
//! - [`DdBlockCopy`] pipes the image through `dd` and scrapes its status
//!   output. It exists for environments where the raw node is only writable
//!   through an external tool.
//!
//! Either way, status reports are turned into a progress fraction by
//! [`ProgressTracker`], which keeps it monotonic, caps it at 1.0 and
//! rate-limits how often it is delivered.
//!
//! A cancelled or failed write is never rolled back: whatever was written
//! stays on the device.
use crate::cancel::CancelToken;
use crate::checksum::read_chunk;
use crate::error::FlashError;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const BLOCK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Progress is delivered at most this often.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Raw nodes only accept transfers in whole sectors.
const SECTOR_SIZE: usize = 512;

/// A status report from a copy backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    /// Whole blocks of the configured block size written so far.
    BlocksOut(u64),
    /// Bytes written so far.
    BytesCopied(u64),
}

#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("copy cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The external copy exited unsuccessfully; holds its diagnostics.
    #[error("{0}")]
    Failed(String),
}

/// Streams bytes from a source to a device node.
pub trait BlockCopy: Send + Sync {
    /// Copies `source` to `destination` in `block_size` blocks until the
    /// source is exhausted, checking `cancel` between blocks and reporting
    /// through `on_status`.
    fn copy(
        &self,
        source: &mut dyn Read,
        destination: &Path,
        block_size: usize,
        cancel: &CancelToken,
        on_status: &mut dyn FnMut(CopyStatus),
    ) -> Result<(), CopyError>;
}

/// Parses one line of `dd` status output.
///
/// Understands `"<N>+<M> records out"`, `"<N> blocks out"` and
/// `"<N> bytes transferred ..."` / `"<N> bytes (...) copied ..."`.
pub fn parse_status_line(line: &str) -> Option<CopyStatus> {
    let line = line.trim();
    let mut words = line.split_whitespace();
    let first = words.next()?;
    let second = words.next()?;

    if line.ends_with("records out") || line.ends_with("blocks out") {
        let full = first.split('+').next()?;
        return full.parse().ok().map(CopyStatus::BlocksOut);
    }
    if second == "bytes" {
        return first.parse().ok().map(CopyStatus::BytesCopied);
    }
    None
}

/// Turns backend status into a rate-limited progress fraction.
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    block_size: u64,
    interval: Duration,
    bytes: u64,
    last_emit: Option<Instant>,
    last_emitted: Option<f64>,
}

impl ProgressTracker {
    pub fn new(total: u64, block_size: usize, interval: Duration) -> Self {
        Self {
            total,
            block_size: block_size as u64,
            interval,
            bytes: 0,
            last_emit: None,
            last_emitted: None,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// `bytes_written / total`, capped at 1.0.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.bytes as f64 / self.total as f64).min(1.0)
    }

    /// Folds in a status report. Returns the progress to deliver, or `None`
    /// when the last delivery was less than one interval ago.
    pub fn update(&mut self, status: CopyStatus) -> Option<f64> {
        let bytes = match status {
            CopyStatus::BlocksOut(blocks) => blocks.saturating_mul(self.block_size),
            CopyStatus::BytesCopied(bytes) => bytes,
        };
        self.bytes = self.bytes.max(bytes);

        let due = self
            .last_emit
            .is_none_or(|at| at.elapsed() >= self.interval);
        if !due {
            return None;
        }
        self.emit()
    }

    /// Delivers the final value once the copy is done, if it has not been
    /// delivered already. The completion value ignores the interval, so it
    /// may follow the previous delivery immediately.
    pub fn finish(&mut self) -> Option<f64> {
        if self.last_emitted == Some(self.progress()) {
            return None;
        }
        self.emit()
    }

    fn emit(&mut self) -> Option<f64> {
        let progress = self.progress();
        self.last_emit = Some(Instant::now());
        self.last_emitted = Some(progress);
        Some(progress)
    }
}

fn sector_multiple(block_size: usize) -> usize {
    block_size.max(SECTOR_SIZE).next_multiple_of(SECTOR_SIZE)
}

/// Writes images to raw device nodes through a [`BlockCopy`] backend.
pub struct RawDeviceWriter {
    copier: Box<dyn BlockCopy>,
    block_size: usize,
    progress_interval: Duration,
}

impl RawDeviceWriter {
    pub fn new(copier: Box<dyn BlockCopy>) -> Self {
        Self {
            copier,
            block_size: BLOCK_SIZE,
            progress_interval: PROGRESS_INTERVAL,
        }
    }

    /// Rounded up to a whole number of sectors.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = sector_multiple(block_size);
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Writes at most `total_size` bytes of `source` to `raw_device_path`.
    ///
    /// `total_size` is the size that passed validation; anything the source
    /// yields beyond it is never written. `on_progress` receives values in
    /// [0, 1] that never decrease, at most once per progress interval plus
    /// once at completion.
    ///
    /// # Errors
    ///
    /// - [`FlashError::OperationCancelled`] if `cancel` was set.
    /// - [`FlashError::InsufficientPermissions`] if the node cannot be opened
    ///   for writing.
    /// - [`FlashError::WriteFailed`] with the backend's diagnostics otherwise.
    pub fn write<F>(
        &self,
        source: &mut dyn Read,
        raw_device_path: &Path,
        total_size: u64,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> Result<(), FlashError>
    where
        F: FnMut(f64),
    {
        info!(device = %raw_device_path.display(), bytes = total_size, "writing image");
        let mut tracker = ProgressTracker::new(total_size, self.block_size, self.progress_interval);
        let mut bounded = source.take(total_size);

        let result = self.copier.copy(
            &mut bounded,
            raw_device_path,
            self.block_size,
            cancel,
            &mut |status| {
                if let Some(p) = tracker.update(status) {
                    on_progress(p);
                }
            },
        );

        match result {
            Ok(()) => {
                if let Some(p) = tracker.finish() {
                    on_progress(p);
                }
                info!(bytes = tracker.bytes_written(), "write complete");
                Ok(())
            }
            Err(CopyError::Cancelled) => {
                warn!(bytes = tracker.bytes_written(), "write cancelled, device left partially written");
                Err(FlashError::OperationCancelled)
            }
            Err(CopyError::Io(e)) => {
                warn!(bytes = tracker.bytes_written(), "write failed: {e}");
                Err(FlashError::from_write(e))
            }
            Err(CopyError::Failed(diagnostic)) => {
                warn!(bytes = tracker.bytes_written(), "write failed: {diagnostic}");
                Err(FlashError::WriteFailed(diagnostic))
            }
        }
    }
}

/// An in-process copy loop with an explicit byte counter.
#[derive(Debug, Clone, Copy)]
pub struct NativeBlockCopy {
    /// Bypass the OS page cache (`O_DIRECT` on Linux, `F_NOCACHE` on macOS)
    /// and pad the final block to a whole sector.
    pub direct_io: bool,
}

impl Default for NativeBlockCopy {
    fn default() -> Self {
        Self { direct_io: true }
    }
}

impl NativeBlockCopy {
    fn open(&self, destination: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true);

        #[cfg(target_os = "linux")]
        if self.direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(destination)?;

        #[cfg(target_os = "macos")]
        if self.direct_io {
            use std::os::unix::io::AsRawFd;
            // SAFETY: fcntl on a descriptor we own, with an integer argument.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(file)
    }
}

impl BlockCopy for NativeBlockCopy {
    fn copy(
        &self,
        source: &mut dyn Read,
        destination: &Path,
        block_size: usize,
        cancel: &CancelToken,
        on_status: &mut dyn FnMut(CopyStatus),
    ) -> Result<(), CopyError> {
        let mut device_file = self.open(destination)?;
        let block_size = sector_multiple(block_size);

        // Align the buffer to the sector size for unbuffered I/O.
        let mut buf = vec![0u8; block_size + SECTOR_SIZE];
        let offset = buf.as_ptr().align_offset(SECTOR_SIZE);
        let buffer = &mut buf[offset..offset + block_size];

        let mut written: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CopyError::Cancelled);
            }

            let n = read_chunk(source, buffer)?;
            if n == 0 {
                break;
            }

            // The last chunk may not be a whole number of sectors.
            let len = if self.direct_io && n % SECTOR_SIZE != 0 {
                let padded = n.div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
                buffer[n..padded].fill(0);
                padded
            } else {
                n
            };

            device_file.write_all(&buffer[..len])?;
            written += n as u64;
            on_status(CopyStatus::BytesCopied(written));
        }

        device_file.flush()?;
        if let Err(e) = device_file.sync_data() {
            // Raw character devices may not support fsync.
            debug!("sync after write not supported: {e}");
        }
        Ok(())
    }
}

/// Pipes the image into `dd` and parses its status output.
#[derive(Debug, Clone)]
pub struct DdBlockCopy {
    pub program: PathBuf,
    /// How often `dd` is asked for a status line.
    pub poll_interval: Duration,
}

impl Default for DdBlockCopy {
    fn default() -> Self {
        Self {
            program: PathBuf::from("dd"),
            poll_interval: PROGRESS_INTERVAL,
        }
    }
}

/// Asks a running `dd` to print its transfer statistics.
#[cfg(unix)]
fn request_status(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    ))]
    let signal = Signal::SIGINFO;
    #[cfg(not(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd"
    )))]
    let signal = Signal::SIGUSR1;

    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!("could not signal dd: {e}");
    }
}

#[cfg(not(unix))]
fn request_status(_pid: u32) {}

impl BlockCopy for DdBlockCopy {
    fn copy(
        &self,
        source: &mut dyn Read,
        destination: &Path,
        block_size: usize,
        cancel: &CancelToken,
        on_status: &mut dyn FnMut(CopyStatus),
    ) -> Result<(), CopyError> {
        let mut child = Command::new(&self.program)
            .arg(format!("of={}", destination.display()))
            .arg(format!("bs={block_size}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        debug!(pid = child.id(), "dd started");

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CopyError::Failed("dd stderr unavailable".to_string()))?;
        let (tx, rx) = mpsc::channel::<String>();
        let reader = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut diagnostics = Vec::new();
        let mut handle_line = |line: String| match parse_status_line(&line) {
            Some(status) => on_status(status),
            None => {
                if !line.trim().is_empty() {
                    diagnostics.push(line);
                }
            }
        };

        let mut stdin = child.stdin.take();
        let mut buffer = vec![0u8; block_size];
        let mut last_poke = Instant::now();
        let mut cancelled = false;
        let mut feed_error = None;

        while let Some(pipe) = stdin.as_mut() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            for line in rx.try_iter() {
                handle_line(line);
            }
            if last_poke.elapsed() >= self.poll_interval {
                request_status(child.id());
                last_poke = Instant::now();
            }

            let n = match read_chunk(source, &mut buffer) {
                Ok(n) => n,
                Err(e) => {
                    feed_error = Some(e);
                    break;
                }
            };
            if n == 0 {
                break;
            }
            if let Err(e) = pipe.write_all(&buffer[..n]) {
                // dd went away; its exit status and stderr explain why.
                debug!("dd stdin closed: {e}");
                break;
            }
        }
        // Closing stdin lets dd see end of input.
        drop(stdin);

        if cancelled || feed_error.is_some() {
            let _ = child.kill();
        }
        let status = child.wait()?;
        let _ = reader.join();
        for line in rx.try_iter() {
            handle_line(line);
        }

        if cancelled {
            return Err(CopyError::Cancelled);
        }
        if let Some(e) = feed_error {
            return Err(CopyError::Io(e));
        }
        if !status.success() {
            let mut message = diagnostics.join("\n");
            if message.is_empty() {
                message = format!("dd exited with {status}");
            }
            return Err(CopyError::Failed(message));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_dd_status_lines() {
        assert_eq!(
            parse_status_line("1024+0 records out"),
            Some(CopyStatus::BlocksOut(1024))
        );
        assert_eq!(
            parse_status_line("  12+1 records out\n"),
            Some(CopyStatus::BlocksOut(12))
        );
        assert_eq!(parse_status_line("1024 blocks out"), Some(CopyStatus::BlocksOut(1024)));
        assert_eq!(
            parse_status_line("1073741824 bytes transferred in 12.345 secs (86977 bytes/sec)"),
            Some(CopyStatus::BytesCopied(1_073_741_824))
        );
        assert_eq!(
            parse_status_line("1073741824 bytes (1.1 GB, 1.0 GiB) copied, 5.1 s, 210 MB/s"),
            Some(CopyStatus::BytesCopied(1_073_741_824))
        );
        assert_eq!(parse_status_line("1024+0 records in"), None);
        assert_eq!(parse_status_line("dd: /dev/rdisk4: Permission denied"), None);
        assert_eq!(parse_status_line(""), None);
    }

    #[test]
    fn blocks_out_converts_exactly() {
        let total = 2048 * BLOCK_SIZE as u64;
        let mut tracker = ProgressTracker::new(total, BLOCK_SIZE, Duration::ZERO);

        let p = tracker.update(CopyStatus::BlocksOut(1024)).unwrap();
        assert_eq!(tracker.bytes_written(), 1024 * 1_048_576);
        assert_eq!(p, 0.5);
    }

    #[test]
    fn progress_is_capped_and_monotonic() {
        let mut tracker = ProgressTracker::new(1000 * BLOCK_SIZE as u64, BLOCK_SIZE, Duration::ZERO);
        assert_eq!(tracker.update(CopyStatus::BlocksOut(1024)), Some(1.0));
        // A late, smaller report does not move progress backwards.
        assert_eq!(tracker.update(CopyStatus::BlocksOut(10)), Some(1.0));
        assert_eq!(tracker.bytes_written(), 1024 * BLOCK_SIZE as u64);
    }

    #[test]
    fn updates_are_rate_limited() {
        let mut tracker = ProgressTracker::new(100, BLOCK_SIZE, Duration::from_secs(3600));
        assert_eq!(tracker.update(CopyStatus::BytesCopied(10)), Some(0.1));
        assert_eq!(tracker.update(CopyStatus::BytesCopied(20)), None);
        assert_eq!(tracker.update(CopyStatus::BytesCopied(100)), None);
        // The final value is still delivered once.
        assert_eq!(tracker.finish(), Some(1.0));
        assert_eq!(tracker.finish(), None);
    }

    struct ScriptedCopy(Vec<CopyStatus>);

    impl BlockCopy for ScriptedCopy {
        fn copy(
            &self,
            _source: &mut dyn Read,
            _destination: &Path,
            _block_size: usize,
            _cancel: &CancelToken,
            on_status: &mut dyn FnMut(CopyStatus),
        ) -> Result<(), CopyError> {
            for status in &self.0 {
                on_status(*status);
            }
            Ok(())
        }
    }

    #[test]
    fn writer_reports_progress_from_synthetic_status() {
        let total = 4096 * BLOCK_SIZE as u64;
        let writer = RawDeviceWriter::new(Box::new(ScriptedCopy(vec![
            CopyStatus::BlocksOut(1024),
            CopyStatus::BlocksOut(2048),
            CopyStatus::BlocksOut(4096),
        ])))
        .with_progress_interval(Duration::ZERO);

        let mut seen = Vec::new();
        writer
            .write(&mut io::empty(), Path::new("/dev/rdisk9"), total, &CancelToken::new(), |p| {
                seen.push(p)
            })
            .unwrap();
        assert_eq!(seen, vec![0.25, 0.5, 1.0]);
    }

    #[test]
    fn native_copy_writes_the_image() {
        let data: Vec<u8> = (0..(BLOCK_SIZE * 2 + 777)).map(|i| (i % 251) as u8).collect();
        let target = NamedTempFile::new().unwrap();

        let writer = RawDeviceWriter::new(Box::new(NativeBlockCopy { direct_io: false }))
            .with_progress_interval(Duration::ZERO);
        let mut seen = Vec::new();
        writer
            .write(
                &mut Cursor::new(&data),
                target.path(),
                data.len() as u64,
                &CancelToken::new(),
                |p| seen.push(p),
            )
            .unwrap();

        assert_eq!(std::fs::read(target.path()).unwrap(), data);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[test]
    fn native_copy_never_writes_past_the_validated_size() {
        let data = vec![0xAAu8; 4096];
        let target = NamedTempFile::new().unwrap();
        let writer = RawDeviceWriter::new(Box::new(NativeBlockCopy { direct_io: false }));
        writer
            .write(&mut Cursor::new(&data), target.path(), 1000, &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(std::fs::read(target.path()).unwrap().len(), 1000);
    }

    #[test]
    fn odd_block_sizes_are_rounded_to_whole_sectors() {
        let writer = RawDeviceWriter::new(Box::new(NativeBlockCopy { direct_io: true }))
            .with_block_size(1000);
        assert_eq!(writer.block_size, 1024);
        assert_eq!(sector_multiple(1), SECTOR_SIZE);
        assert_eq!(sector_multiple(BLOCK_SIZE), BLOCK_SIZE);

        let data = vec![0x5Au8; 600];
        let target = NamedTempFile::new().unwrap();
        // Some filesystems refuse O_DIRECT; the padded tail must not panic
        // where they accept it.
        let mut status = |_: CopyStatus| {};
        let result = NativeBlockCopy { direct_io: true }.copy(
            &mut Cursor::new(&data),
            target.path(),
            1000,
            &CancelToken::new(),
            &mut status,
        );
        if result.is_ok() {
            let written = std::fs::read(target.path()).unwrap();
            assert_eq!(written.len(), 1024);
            assert_eq!(&written[..600], &data[..]);
            assert!(written[600..].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn cancelled_native_copy_reports_cancellation() {
        let data = vec![1u8; BLOCK_SIZE * 4];
        let target = NamedTempFile::new().unwrap();
        let cancel = CancelToken::new();
        let writer = RawDeviceWriter::new(Box::new(NativeBlockCopy { direct_io: false }))
            .with_progress_interval(Duration::ZERO);

        let result = writer.write(
            &mut Cursor::new(&data),
            target.path(),
            data.len() as u64,
            &cancel,
            |_| cancel.cancel(),
        );
        assert_eq!(result, Err(FlashError::OperationCancelled));
        // No rollback: the first block is on the device.
        assert_eq!(std::fs::read(target.path()).unwrap().len(), BLOCK_SIZE);
    }

    #[test]
    fn missing_node_is_device_not_found() {
        let writer = RawDeviceWriter::new(Box::new(NativeBlockCopy { direct_io: false }));
        let result = writer.write(
            &mut io::empty(),
            Path::new("/definitely/not/a/device"),
            0,
            &CancelToken::new(),
            |_| {},
        );
        assert_eq!(result, Err(FlashError::DeviceNotFound));
    }

    #[cfg(unix)]
    #[test]
    fn dd_copy_writes_the_image() {
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        let target = NamedTempFile::new().unwrap();
        let mut statuses = Vec::new();

        DdBlockCopy::default()
            .copy(
                &mut Cursor::new(&data),
                target.path(),
                BLOCK_SIZE,
                &CancelToken::new(),
                &mut |s| statuses.push(s),
            )
            .unwrap();

        assert_eq!(std::fs::read(target.path()).unwrap(), data);
        assert!(statuses.contains(&CopyStatus::BytesCopied(data.len() as u64)));
    }

    #[cfg(unix)]
    #[test]
    fn dd_failure_carries_diagnostics() {
        let result = DdBlockCopy::default().copy(
            &mut Cursor::new(vec![0u8; 16]),
            Path::new("/definitely/not/a/dir/target"),
            BLOCK_SIZE,
            &CancelToken::new(),
            &mut |_| {},
        );
        match result {
            Err(CopyError::Failed(message)) => assert!(!message.is_empty()),
            other => panic!("expected dd failure, got {other:?}"),
        }
    }
}
