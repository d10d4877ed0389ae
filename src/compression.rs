//! Compression sinks.
//!
//! Each wraps the next sink down and compresses per archive: a fresh
//! encoder per `begin_archive`, flushed and finished at `end_archive`.
//! Compressed archives are renamed with the conventional suffix so a
//! consumer can tell what it received. One upstream commit may produce
//! zero or many downstream commits; alignment of the upstream buffer is
//! unaffected.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use flate2::write::GzEncoder;
use flate2::Compression;
use lz4_flex::frame::FrameEncoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::error::BackupError;
use crate::lsn::Lsn;
use crate::sink::Sink;
use crate::xlog_utils::TimeLineID;

pub const DEFAULT_GZIP_LEVEL: u32 = 6;
pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

type SharedSink = Rc<RefCell<Box<dyn Sink>>>;

/// io::Write adapter over the downstream sink, so encoders that insist on
/// owning their writer can still feed the stack.
struct SinkWriter {
    inner: SharedSink,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .borrow_mut()
            .archive_contents(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct GzipSink {
    inner: SharedSink,
    level: u32,
    encoder: Option<GzEncoder<SinkWriter>>,
}

impl GzipSink {
    pub fn new(inner: Box<dyn Sink>, level: Option<u32>) -> Self {
        GzipSink {
            inner: Rc::new(RefCell::new(inner)),
            level: level.unwrap_or(DEFAULT_GZIP_LEVEL),
            encoder: None,
        }
    }
}

impl Sink for GzipSink {
    fn begin_backup(&mut self, buffer_len: usize) -> Result<(), BackupError> {
        self.inner.borrow_mut().begin_backup(buffer_len)
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.inner.borrow_mut().begin_archive(&format!("{name}.gz"))?;
        let writer = SinkWriter {
            inner: Rc::clone(&self.inner),
        };
        self.encoder = Some(GzEncoder::new(writer, Compression::new(self.level)));
        Ok(())
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        match &mut self.encoder {
            Some(encoder) => Ok(encoder.write_all(data)?),
            None => Ok(()),
        }
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        if let Some(encoder) = self.encoder.take() {
            encoder.finish()?;
        }
        self.inner.borrow_mut().end_archive()
    }

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.inner.borrow_mut().end_backup(end_lsn, end_tli)
    }

    fn cleanup(&mut self) {
        self.encoder = None;
        self.inner.borrow_mut().cleanup();
    }
}

pub struct Lz4Sink {
    inner: SharedSink,
    encoder: Option<FrameEncoder<SinkWriter>>,
}

impl Lz4Sink {
    pub fn new(inner: Box<dyn Sink>) -> Self {
        Lz4Sink {
            inner: Rc::new(RefCell::new(inner)),
            encoder: None,
        }
    }
}

impl Sink for Lz4Sink {
    fn begin_backup(&mut self, buffer_len: usize) -> Result<(), BackupError> {
        self.inner.borrow_mut().begin_backup(buffer_len)
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.inner
            .borrow_mut()
            .begin_archive(&format!("{name}.lz4"))?;
        let writer = SinkWriter {
            inner: Rc::clone(&self.inner),
        };
        self.encoder = Some(FrameEncoder::new(writer));
        Ok(())
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        match &mut self.encoder {
            Some(encoder) => Ok(encoder.write_all(data)?),
            None => Ok(()),
        }
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        if let Some(encoder) = self.encoder.take() {
            encoder
                .finish()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        }
        self.inner.borrow_mut().end_archive()
    }

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.inner.borrow_mut().end_backup(end_lsn, end_tli)
    }

    fn cleanup(&mut self) {
        self.encoder = None;
        self.inner.borrow_mut().cleanup();
    }
}

pub struct ZstdSink {
    inner: SharedSink,
    level: i32,
    workers: u32,
    encoder: Option<ZstdEncoder<'static, SinkWriter>>,
}

impl ZstdSink {
    pub fn new(inner: Box<dyn Sink>, level: Option<i32>, workers: u32) -> Self {
        ZstdSink {
            inner: Rc::new(RefCell::new(inner)),
            level: level.unwrap_or(DEFAULT_ZSTD_LEVEL),
            workers,
            encoder: None,
        }
    }
}

impl Sink for ZstdSink {
    fn begin_backup(&mut self, buffer_len: usize) -> Result<(), BackupError> {
        self.inner.borrow_mut().begin_backup(buffer_len)
    }

    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.inner
            .borrow_mut()
            .begin_archive(&format!("{name}.zst"))?;
        let writer = SinkWriter {
            inner: Rc::clone(&self.inner),
        };
        let mut encoder = ZstdEncoder::new(writer, self.level)?;
        if self.workers > 0 {
            encoder.multithread(self.workers)?;
        }
        self.encoder = Some(encoder);
        Ok(())
    }

    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        match &mut self.encoder {
            Some(encoder) => Ok(encoder.write_all(data)?),
            None => Ok(()),
        }
    }

    fn end_archive(&mut self) -> Result<(), BackupError> {
        if let Some(encoder) = self.encoder.take() {
            encoder.finish()?;
        }
        self.inner.borrow_mut().end_archive()
    }

    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.inner.borrow_mut().end_backup(end_lsn, end_tli)
    }

    fn cleanup(&mut self) {
        self.encoder = None;
        self.inner.borrow_mut().cleanup();
    }
}
