//! Backup manifest construction.
//!
//! The manifest is a JSON document listing every file the backup streamed,
//! with size, mtime, and an optional content digest, plus the WAL range
//! needed to make the backup consistent. It is serialized incrementally as
//! files are sent and finished with a checksum over its own body.
//!
//! Files under `pg_wal/` are never listed; the WAL-Ranges member describes
//! the log instead.

use std::time::SystemTime;

use base64::Engine;
use chrono::{DateTime, Utc};

use crate::checksum::{ChecksumAlgorithm, ChecksumContext};
use crate::lsn::Lsn;
use crate::xlog_utils::TimeLineID;

pub const MANIFEST_VERSION: u32 = 1;

struct WalRange {
    start_lsn: Lsn,
    start_tli: TimeLineID,
    end_lsn: Lsn,
    end_tli: TimeLineID,
    timeline_history: Vec<String>,
}

pub struct ManifestBuilder {
    force_encode: bool,
    algorithm: ChecksumAlgorithm,
    buf: Vec<u8>,
    first_file: bool,
    wal_range: Option<WalRange>,
}

impl ManifestBuilder {
    pub fn new(force_encode: bool, algorithm: ChecksumAlgorithm) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            format!("{{\"PostgreSQL-Backup-Manifest-Version\": {MANIFEST_VERSION},\n\"Files\": [")
                .as_bytes(),
        );
        ManifestBuilder {
            force_encode,
            algorithm,
            buf,
            first_file: true,
            wal_range: None,
        }
    }

    /// The digest algorithm applied to file contents, for senders to build
    /// their per-file context from.
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Record one streamed file. `checksum` must cover exactly the bytes
    /// the archive carries for it (incremental header, content, truncation
    /// pad), or be None when digesting is disabled.
    pub fn add_file(
        &mut self,
        path: &str,
        size: u64,
        mtime: SystemTime,
        checksum: Option<&[u8]>,
    ) {
        if path.starts_with("pg_wal/") {
            return;
        }

        if self.first_file {
            self.buf.push(b'\n');
            self.first_file = false;
        } else {
            self.buf.extend_from_slice(b",\n");
        }

        let path_field = if self.force_encode || !path.is_ascii() {
            format!(
                "\"Encoded-Path\": \"{}\"",
                base64::engine::general_purpose::STANDARD.encode(path.as_bytes())
            )
        } else {
            format!("\"Path\": {}", serde_json::to_string(path).unwrap())
        };

        let mtime: DateTime<Utc> = mtime.into();
        self.buf.extend_from_slice(
            format!(
                "{{ {path_field}, \"Size\": {size}, \"Last-Modified\": \"{}\"",
                mtime.format("%Y-%m-%d %H:%M:%S GMT")
            )
            .as_bytes(),
        );
        if let Some(checksum) = checksum {
            self.buf.extend_from_slice(
                format!(
                    ", \"Checksum-Algorithm\": \"{}\", \"Checksum\": \"{}\"",
                    self.algorithm.name(),
                    hex::encode(checksum)
                )
                .as_bytes(),
            );
        }
        self.buf.extend_from_slice(b" }");
    }

    pub fn add_wal_range(
        &mut self,
        start_lsn: Lsn,
        start_tli: TimeLineID,
        end_lsn: Lsn,
        end_tli: TimeLineID,
        timeline_history: Vec<String>,
    ) {
        self.wal_range = Some(WalRange {
            start_lsn,
            start_tli,
            end_lsn,
            end_tli,
            timeline_history,
        });
    }

    /// Close the document: WAL range, then a checksum over everything that
    /// precedes the Manifest-Checksum member. With checksums disabled the
    /// document checksum falls back to SHA256 so the manifest always names
    /// a digest a verifier can recompute.
    pub fn finalize(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b"\n],\n\"WAL-Ranges\": [");
        if let Some(range) = &self.wal_range {
            let history: Vec<String> = range
                .timeline_history
                .iter()
                .map(|h| serde_json::to_string(h).unwrap())
                .collect();
            self.buf.extend_from_slice(
                format!(
                    "\n{{ \"Start-LSN\": \"{}\", \"Start-Timeline\": {}, \
                     \"End-LSN\": \"{}\", \"End-Timeline\": {}, \
                     \"Timeline-History\": [{}] }}",
                    range.start_lsn,
                    range.start_tli,
                    range.end_lsn,
                    range.end_tli,
                    history.join(", ")
                )
                .as_bytes(),
            );
        }
        self.buf.extend_from_slice(b"],\n");

        let algorithm = match self.algorithm {
            ChecksumAlgorithm::None => ChecksumAlgorithm::Sha256,
            other => other,
        };
        let mut ctx = ChecksumContext::new(algorithm);
        ctx.update(&self.buf);
        let digest = ctx.finish();
        self.buf.extend_from_slice(
            format!("\"Manifest-Checksum\": \"{}\"}}\n", hex::encode(digest)).as_bytes(),
        );
        self.buf
    }
}
