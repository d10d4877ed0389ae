//! Interfaces to the rest of the cluster, plus session and cluster-wide
//! backup bookkeeping.
//!
//! The orchestrator never talks to the checkpointer, the recovery state, or
//! the statistics machinery directly; everything goes through the
//! [`ClusterControl`] trait so backups can be driven against a live server
//! or a test double alike.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::SystemTime;

use chrono::{DateTime, Utc};

use crate::error::BackupError;
use crate::lsn::Lsn;
use crate::options::CheckpointMode;
use crate::xlog_utils::{TimeLineID, XLogSegNo};

/// One storage location included in the backup. The main data directory is
/// represented with `oid` and `path` both None and always sorts last.
#[derive(Debug, Clone)]
pub struct Tablespace {
    pub oid: Option<u32>,
    /// Absolute location outside the data directory.
    pub path: Option<std::path::PathBuf>,
    /// Relative location for in-place tablespaces inside the data dir.
    pub rpath: Option<std::path::PathBuf>,
    /// Estimated size in bytes, filled by the size-estimate pass.
    pub size: Option<u64>,
}

impl Tablespace {
    pub fn main() -> Self {
        Tablespace {
            oid: None,
            path: None,
            rpath: None,
            size: None,
        }
    }

    pub fn is_main(&self) -> bool {
        self.oid.is_none()
    }

    /// Archive name for this tablespace's stream.
    pub fn archive_name(&self) -> String {
        match self.oid {
            None => "base.tar".to_owned(),
            Some(oid) => format!("{oid}.tar"),
        }
    }
}

/// Result of the start-of-backup checkpoint handshake.
pub struct StartedBackup {
    pub start_lsn: Lsn,
    pub start_tli: TimeLineID,
    pub checkpoint_lsn: Lsn,
    /// True if the cluster was in recovery when the backup started. A
    /// promotion before the backup completes is fatal.
    pub in_recovery: bool,
    pub tablespaces: Vec<Tablespace>,
    /// Contents of the synthesized backup_label member.
    pub backup_label: String,
    /// Contents of the synthesized tablespace_map member.
    pub tablespace_map: String,
}

pub struct StoppedBackup {
    pub stop_lsn: Lsn,
    pub stop_tli: TimeLineID,
}

pub trait ClusterControl {
    /// Issue the starting checkpoint and capture the backup start state.
    fn backup_start(
        &self,
        label: &str,
        mode: CheckpointMode,
    ) -> Result<StartedBackup, BackupError>;

    /// End the backup; when `wait_for_archive` is set, block until the WAL
    /// needed by the backup has been archived.
    fn backup_stop(&self, wait_for_archive: bool) -> Result<StoppedBackup, BackupError>;

    /// Tear down backup state after a failure between start and stop.
    fn backup_abort(&self) {}

    fn in_recovery(&self) -> bool;

    fn data_checksums_enabled(&self) -> bool;

    fn wal_segment_size(&self) -> usize;

    /// Fail with `WalRemoved` if the given segment has been recycled since
    /// the backup started.
    fn wal_removed_check(&self, segno: XLogSegNo, tli: TimeLineID) -> Result<(), BackupError>;

    /// Feed per-database checksum failure counts to the statistics layer.
    fn report_checksum_failures(&self, _dboid: Option<u32>, _failures: u64) {}

    /// Cooperative cancellation: admin cancel, client disconnect,
    /// postmaster death. Checked at every directory entry and WAL step.
    fn interrupted(&self) -> bool {
        false
    }
}

/// Compose the backup_label contents written at the start of the backup.
pub fn build_backup_label(
    start_lsn: Lsn,
    start_tli: TimeLineID,
    checkpoint_lsn: Lsn,
    from_standby: bool,
    label: &str,
    start_time: SystemTime,
    wal_segment_size: usize,
) -> String {
    let start_time: DateTime<Utc> = start_time.into();
    let wal_file = crate::xlog_utils::XLogFileName(
        start_tli,
        start_lsn.segment_number(wal_segment_size),
        wal_segment_size,
    );
    format!(
        "START WAL LOCATION: {start_lsn} (file {wal_file})\n\
         CHECKPOINT LOCATION: {checkpoint_lsn}\n\
         BACKUP METHOD: streamed\n\
         BACKUP FROM: {}\n\
         START TIME: {}\n\
         LABEL: {label}\n\
         START TIMELINE: {start_tli}\n",
        if from_standby { "standby" } else { "primary" },
        start_time.format("%Y-%m-%d %H:%M:%S %Z"),
    )
}

/// Compose the tablespace_map contents: one `oid path` line per external
/// tablespace.
pub fn build_tablespace_map(tablespaces: &[Tablespace]) -> String {
    let mut map = String::new();
    for ts in tablespaces {
        if let (Some(oid), Some(path)) = (ts.oid, &ts.path) {
            map.push_str(&format!("{oid} {}\n", path.display()));
        }
    }
    map
}

/// Session-level flag rejecting overlapping backups. One per session; the
/// returned guard clears the flag when dropped.
#[derive(Default)]
pub struct SessionBackupLock {
    running: AtomicBool,
}

pub struct SessionBackupGuard<'a> {
    lock: &'a SessionBackupLock,
}

impl SessionBackupLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Result<SessionBackupGuard<'_>, BackupError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BackupError::SessionBusy);
        }
        Ok(SessionBackupGuard { lock: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for SessionBackupGuard<'_> {
    fn drop(&mut self) {
        self.lock.running.store(false, Ordering::Release);
    }
}

/// Cluster-global count of in-progress backups. Every start increments it
/// and every exit path, success or failure, must decrement it exactly once.
#[derive(Default)]
pub struct ActiveBackupCounter {
    count: AtomicI64,
}

impl ActiveBackupCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn current(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lock_rejects_overlap() {
        let lock = SessionBackupLock::new();
        let guard = lock.try_begin().unwrap();
        assert!(matches!(lock.try_begin(), Err(BackupError::SessionBusy)));
        drop(guard);
        assert!(lock.try_begin().is_ok());
    }

    #[test]
    fn test_counter_balance() {
        let counter = ActiveBackupCounter::new();
        counter.increment();
        assert_eq!(counter.current(), 1);
        counter.decrement();
        assert_eq!(counter.current(), 0);
    }

    #[test]
    fn test_backup_label_layout() {
        let label = build_backup_label(
            Lsn(0x2000028),
            1,
            Lsn(0x2000028),
            false,
            "t1",
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1700000000),
            16 * 1024 * 1024,
        );
        assert!(label.starts_with(
            "START WAL LOCATION: 0/2000028 (file 000000010000000000000002)\n"
        ));
        assert!(label.contains("BACKUP METHOD: streamed\n"));
        assert!(label.contains("BACKUP FROM: primary\n"));
        assert!(label.contains("LABEL: t1\n"));
        assert!(label.ends_with("START TIMELINE: 1\n"));
    }

    #[test]
    fn test_tablespace_map() {
        let spaces = vec![
            Tablespace {
                oid: Some(16400),
                path: Some("/mnt/ts1".into()),
                rpath: None,
                size: None,
            },
            Tablespace::main(),
        ];
        assert_eq!(build_tablespace_map(&spaces), "16400 /mnt/ts1\n");
    }
}
