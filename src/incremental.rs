//! Incremental backup support.
//!
//! An incremental backup replaces an unchanged-enough relation file with a
//! sparse member: a small header naming the blocks that follow, then just
//! those blocks. Everything else in the backup (non-relation files, WAL,
//! the manifest) is identical to a full backup.
//!
//! Which blocks changed comes from the prior backup's manifest plus a
//! changed-block table; the walker only sees the [`PriorBackup`] trait so
//! it stays free of manifest-format knowledge.

use std::collections::HashMap;

use byteorder::{LittleEndian, WriteBytesExt};
use serde_json::Value;
use tracing::debug;

use crate::error::BackupError;
use crate::pg_constants::{
    BLCKSZ, FSM_FORKNUM, INCREMENTAL_MAGIC, INCREMENTAL_PREFIX, RELSEG_SIZE,
};

/// How a relation file should be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileBackupMethod {
    Full,
    Incremental {
        /// Segment-relative block numbers, sorted ascending.
        blocks: Vec<u32>,
        truncation_block_length: u32,
    },
}

/// Handle onto the prior backup consulted for each relation file. Injected
/// by the orchestrator when `incremental` is requested.
pub trait PriorBackup {
    #[allow(clippy::too_many_arguments)]
    fn file_backup_method(
        &self,
        path: &str,
        dboid: u32,
        spcoid: u32,
        relnumber: u32,
        forknum: u8,
        segno: u32,
        size: u64,
    ) -> FileBackupMethod;
}

/// Archive name of an incrementally-sent file: `INCREMENTAL.<basename>`.
pub fn incremental_name(basename: &str) -> String {
    format!("{INCREMENTAL_PREFIX}{basename}")
}

/// Size of the incremental file header for `block_count` blocks. With any
/// blocks present the header is rounded up to a page boundary so the block
/// payloads that follow stay page-aligned in the archive.
pub fn header_size(block_count: usize) -> usize {
    let size = 3 * 4 + 4 * block_count;
    if block_count > 0 {
        size.div_ceil(BLCKSZ) * BLCKSZ
    } else {
        size
    }
}

/// Total archive size of an incremental file.
pub fn file_size(block_count: usize) -> u64 {
    (header_size(block_count) + block_count * BLCKSZ) as u64
}

/// Serialize the incremental file header, including alignment padding.
pub fn write_header(blocks: &[u32], truncation_block_length: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(header_size(blocks.len()));
    buf.write_u32::<LittleEndian>(INCREMENTAL_MAGIC).unwrap();
    buf.write_u32::<LittleEndian>(blocks.len() as u32).unwrap();
    buf.write_u32::<LittleEndian>(truncation_block_length)
        .unwrap();
    for &b in blocks {
        buf.write_u32::<LittleEndian>(b).unwrap();
    }
    buf.resize(header_size(blocks.len()), 0);
    buf
}

/// Prior backup built from a parsed manifest and a changed-block table.
pub struct ManifestPriorBackup {
    /// Path -> size, as recorded by the prior manifest. Incremental members
    /// are keyed under both their plain and prefixed names.
    files: HashMap<String, u64>,
    /// Path -> segment-relative changed blocks since the prior backup.
    changed: HashMap<String, Vec<u32>>,
}

impl ManifestPriorBackup {
    /// Parse an uploaded prior manifest. Only the file list matters here;
    /// the WAL ranges and checksums are for restore-side tooling.
    pub fn from_manifest(manifest: &[u8]) -> Result<Self, BackupError> {
        let doc: Value = serde_json::from_slice(manifest)
            .map_err(|e| BackupError::OptionInvalid(format!("could not parse manifest: {e}")))?;
        let mut files = HashMap::new();
        let entries = doc
            .get("Files")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                BackupError::OptionInvalid("manifest has no \"Files\" member".to_owned())
            })?;
        for entry in entries {
            let path = match entry.get("Path").and_then(Value::as_str) {
                Some(p) => p.to_owned(),
                None => {
                    let encoded = entry
                        .get("Encoded-Path")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            BackupError::OptionInvalid(
                                "manifest entry has neither Path nor Encoded-Path".to_owned(),
                            )
                        })?;
                    use base64::Engine;
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| {
                            BackupError::OptionInvalid(format!("bad Encoded-Path: {e}"))
                        })?;
                    String::from_utf8_lossy(&raw).into_owned()
                }
            };
            let size = entry.get("Size").and_then(Value::as_u64).unwrap_or(0);
            files.insert(path, size);
        }
        Ok(ManifestPriorBackup {
            files,
            changed: HashMap::new(),
        })
    }

    /// Record which blocks of `path` changed since the prior backup. The
    /// table normally comes from WAL summaries covering the interval.
    pub fn record_changed_blocks(&mut self, path: &str, blocks: &[u32]) {
        let mut blocks = blocks.to_vec();
        blocks.sort_unstable();
        blocks.dedup();
        self.changed.insert(path.to_owned(), blocks);
    }

    fn in_prior_backup(&self, path: &str) -> bool {
        if self.files.contains_key(path) {
            return true;
        }
        // The prior backup may itself have been incremental.
        match path.rsplit_once('/') {
            Some((dir, base)) => self
                .files
                .contains_key(&format!("{dir}/{}", incremental_name(base))),
            None => self.files.contains_key(&incremental_name(path)),
        }
    }
}

impl PriorBackup for ManifestPriorBackup {
    fn file_backup_method(
        &self,
        path: &str,
        _dboid: u32,
        _spcoid: u32,
        _relnumber: u32,
        forknum: u8,
        _segno: u32,
        size: u64,
    ) -> FileBackupMethod {
        // Guardrails: anything we can't reason about block-by-block is
        // sent in full.
        if size == 0 {
            return FileBackupMethod::Full;
        }
        if size % BLCKSZ as u64 != 0 || size > RELSEG_SIZE as u64 * BLCKSZ as u64 {
            debug!("{path}: unexpected size {size}, sending in full");
            return FileBackupMethod::Full;
        }
        // Free-space maps are not WAL-logged block by block.
        if forknum == FSM_FORKNUM {
            return FileBackupMethod::Full;
        }
        if !self.in_prior_backup(path) {
            debug!("{path}: not in prior backup, sending in full");
            return FileBackupMethod::Full;
        }

        let nblocks = (size / BLCKSZ as u64) as u32;
        let blocks: Vec<u32> = self
            .changed
            .get(path)
            .map(|v| v.iter().copied().filter(|&b| b < nblocks).collect())
            .unwrap_or_default();

        // Mostly-rewritten files gain nothing from the sparse form.
        if blocks.len() as u64 * 10 >= nblocks as u64 * 9 {
            return FileBackupMethod::Full;
        }

        FileBackupMethod::Incremental {
            blocks,
            truncation_block_length: nblocks,
        }
    }
}
