//! Composable backup sinks.
//!
//! Every byte of a backup flows through a stack of sinks. The stack head
//! receives data from the senders; each sink forwards downstream, possibly
//! transforming it (compression) or just observing it (progress, throttle).
//! The bottom of the stack delivers the stream to its destination: the
//! requesting session's channel or a server-side directory.
//!
//! Senders do not call sinks directly. They go through [`SinkPipeline`],
//! which owns the shared read buffer all senders fill.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, WriteBytesExt};
use tracing::debug;

use crate::error::BackupError;
use crate::lsn::Lsn;
use crate::pg_constants::BLCKSZ;
use crate::xlog_utils::TimeLineID;

pub trait Sink {
    /// Called once before any archive. `buffer_len` is the length of the
    /// shared sender buffer, always a multiple of BLCKSZ.
    fn begin_backup(&mut self, buffer_len: usize) -> Result<(), BackupError>;

    /// Open a named logical archive ("base.tar", "<oid>.tar", ...).
    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError>;

    /// Commit a chunk of archive bytes.
    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError>;

    fn end_archive(&mut self) -> Result<(), BackupError>;

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError>;

    /// Idempotent; called on both success and failure paths.
    fn cleanup(&mut self);
}

/// Length of the shared sender buffer: at least 32 KiB, at least one page,
/// and always a whole number of pages.
pub fn sink_buffer_length() -> usize {
    let len = std::cmp::max(32 * 1024, BLCKSZ);
    len.div_ceil(BLCKSZ) * BLCKSZ
}

/// Owns the sink stack and the shared buffer the senders read file data
/// into. Commits pass `&buffer[..n]` to the stack head.
pub struct SinkPipeline {
    head: Box<dyn Sink>,
    buffer: Vec<u8>,
}

impl SinkPipeline {
    pub fn new(head: Box<dyn Sink>) -> Self {
        SinkPipeline {
            head,
            buffer: vec![0u8; sink_buffer_length()],
        }
    }

    pub fn buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn begin_backup(&mut self) -> Result<(), BackupError> {
        let len = self.buffer.len();
        self.head.begin_backup(len)
    }

    pub fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.head.begin_archive(name)
    }

    /// Commit the first `n` bytes of the shared buffer.
    pub fn archive_contents(&mut self, n: usize) -> Result<(), BackupError> {
        self.head.archive_contents(&self.buffer[..n])
    }

    /// Commit bytes that do not live in the shared buffer (tar headers,
    /// synthesized file contents), chunking through it.
    pub fn push(&mut self, mut data: &[u8]) -> Result<(), BackupError> {
        while !data.is_empty() {
            let n = std::cmp::min(data.len(), self.buffer.len());
            self.buffer[..n].copy_from_slice(&data[..n]);
            self.head.archive_contents(&self.buffer[..n])?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Commit `n` zero bytes (tar padding, truncation fill).
    pub fn push_zeroes(&mut self, mut n: usize) -> Result<(), BackupError> {
        while n > 0 {
            let chunk = std::cmp::min(n, self.buffer.len());
            self.buffer[..chunk].fill(0);
            self.head.archive_contents(&self.buffer[..chunk])?;
            n -= chunk;
        }
        Ok(())
    }

    pub fn end_archive(&mut self) -> Result<(), BackupError> {
        self.head.end_archive()
    }

    pub fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.head.end_backup(end_lsn, end_tli)
    }

    pub fn cleanup(&mut self) {
        self.head.cleanup();
    }
}

//
// Copy-stream sink: frames the stream for delivery over the session channel.
//
// Wire format, one message per call: a one-byte type tag, a little-endian
// u32 payload length, then the payload.
//
//   'n'  new archive; payload is the archive name
//   'd'  archive data
//   'e'  end of archive; empty payload
//   'f'  end of backup; payload is the 8-byte end LSN and 4-byte timeline
//
pub struct CopyStreamSink<W: Write> {
    out: W,
}

impl<W: Write> CopyStreamSink<W> {
    pub fn new(out: W) -> Self {
        CopyStreamSink { out }
    }

    fn message(&mut self, tag: u8, payload: &[u8]) -> Result<(), BackupError> {
        self.out.write_all(&[tag])?;
        self.out.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.out.write_all(payload)?;
        Ok(())
    }
}

impl<W: Write> Sink for CopyStreamSink<W> {
    fn begin_backup(&mut self, _buffer_len: usize) -> Result<(), BackupError> {
        Ok(())
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.message(b'n', name.as_bytes())
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        self.message(b'd', data)
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        self.message(b'e', &[])
    }

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        let mut payload = Vec::with_capacity(12);
        payload.write_u64::<LittleEndian>(end_lsn.0)?;
        payload.write_u32::<LittleEndian>(end_tli)?;
        self.message(b'f', &payload)?;
        self.out.flush()?;
        Ok(())
    }

    fn cleanup(&mut self) {
        let _ = self.out.flush();
    }
}

//
// Server-file sink: one file per archive under a server-controlled
// directory. The target directory must be empty (or absent) so a backup
// never silently overwrites an earlier one.
//
pub struct ServerFileSink {
    dir: PathBuf,
    current: Option<File>,
}

impl ServerFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ServerFileSink {
            dir: dir.into(),
            current: None,
        }
    }
}

impl Sink for ServerFileSink {
    fn begin_backup(&mut self, _buffer_len: usize) -> Result<(), BackupError> {
        std::fs::create_dir_all(&self.dir)?;
        if std::fs::read_dir(&self.dir)?.next().is_some() {
            return Err(BackupError::OptionInvalid(format!(
                "backup target directory \"{}\" is not empty",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        let path = self.dir.join(name);
        let file = File::create(&path).map_err(|e| BackupError::FileOpenFailed {
            path,
            source: e,
        })?;
        self.current = Some(file);
        Ok(())
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        if let Some(file) = &mut self.current {
            file.write_all(data)?;
        }
        Ok(())
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        if let Some(file) = self.current.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn end_backup(&mut self, _end_lsn: Lsn, _end_tli: TimeLineID) -> Result<(), BackupError> {
        Ok(())
    }

    fn cleanup(&mut self) {
        self.current = None;
    }
}

//
// Progress sink: forwards bytes unchanged, publishing byte totals on a
// shared handle the orchestrator and any observer can read. Phase and
// per-tablespace counts are the orchestrator's to set; only it knows
// which archives are tablespaces. Progress never travels inside the
// archive stream.
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackupPhase {
    Initializing = 0,
    WaitCheckpoint = 1,
    EstimateSize = 2,
    StreamFiles = 3,
    WaitWalArchive = 4,
    TransferWal = 5,
}

#[derive(Default)]
pub struct BackupProgress {
    phase: AtomicU8,
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    tablespaces_total: AtomicU32,
    tablespaces_done: AtomicU32,
}

impl BackupProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_phase(&self, phase: BackupPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn phase(&self) -> BackupPhase {
        match self.phase.load(Ordering::Relaxed) {
            1 => BackupPhase::WaitCheckpoint,
            2 => BackupPhase::EstimateSize,
            3 => BackupPhase::StreamFiles,
            4 => BackupPhase::WaitWalArchive,
            5 => BackupPhase::TransferWal,
            _ => BackupPhase::Initializing,
        }
    }

    pub fn add_bytes_done(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn set_bytes_total(&self, n: u64) {
        self.bytes_total.store(n, Ordering::Relaxed);
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn set_tablespaces_total(&self, n: u32) {
        self.tablespaces_total.store(n, Ordering::Relaxed);
    }

    pub fn tablespace_done(&self) {
        self.tablespaces_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tablespaces(&self) -> (u32, u32) {
        (
            self.tablespaces_done.load(Ordering::Relaxed),
            self.tablespaces_total.load(Ordering::Relaxed),
        )
    }
}

pub struct ProgressSink {
    inner: Box<dyn Sink>,
    progress: std::sync::Arc<BackupProgress>,
}

impl ProgressSink {
    pub fn new(inner: Box<dyn Sink>, progress: std::sync::Arc<BackupProgress>) -> Self {
        ProgressSink { inner, progress }
    }
}

impl Sink for ProgressSink {
    fn begin_backup(&mut self, buffer_len: usize) -> Result<(), BackupError> {
        self.inner.begin_backup(buffer_len)
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        debug!("starting archive {name}");
        self.inner.begin_archive(name)
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        self.progress.add_bytes_done(data.len() as u64);
        self.inner.archive_contents(data)
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        self.inner.end_archive()
    }

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.inner.end_backup(end_lsn, end_tli)
    }

    fn cleanup(&mut self) {
        self.inner.cleanup();
    }
}

//
// Throttle sink: keeps the rolling byte rate at or under the limit by
// sleeping. The second is divided into fixed samples; bytes committed over
// a sample's budget carry into the next one.
//

const THROTTLING_FREQUENCY: u32 = 8;

pub struct ThrottleSink {
    inner: Box<dyn Sink>,
    /// Byte budget per sample interval.
    sample_bytes: u64,
    sample_interval: Duration,
    bytes_this_sample: u64,
    sample_start: Instant,
}

impl ThrottleSink {
    pub fn new(inner: Box<dyn Sink>, max_rate_kib: u32) -> Self {
        let rate = max_rate_kib as u64 * 1024;
        ThrottleSink {
            inner,
            sample_bytes: std::cmp::max(1, rate / THROTTLING_FREQUENCY as u64),
            sample_interval: Duration::from_secs(1) / THROTTLING_FREQUENCY,
            bytes_this_sample: 0,
            sample_start: Instant::now(),
        }
    }

    fn account(&mut self, n: usize) {
        self.bytes_this_sample += n as u64;
        while self.bytes_this_sample >= self.sample_bytes {
            let elapsed = self.sample_start.elapsed();
            if elapsed < self.sample_interval {
                std::thread::sleep(self.sample_interval - elapsed);
            }
            // Overshoot carries into the next sample.
            self.bytes_this_sample -= self.sample_bytes;
            self.sample_start = Instant::now();
        }
    }
}

impl Sink for ThrottleSink {
    fn begin_backup(&mut self, buffer_len: usize) -> Result<(), BackupError> {
        self.sample_start = Instant::now();
        self.inner.begin_backup(buffer_len)
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.inner.begin_archive(name)
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        self.inner.archive_contents(data)?;
        self.account(data.len());
        Ok(())
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        self.inner.end_archive()
    }

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.inner.end_backup(end_lsn, end_tli)
    }

    fn cleanup(&mut self) {
        self.inner.cleanup();
    }
}
