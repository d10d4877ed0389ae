//! End-to-end backup scenarios against a synthetic data directory.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tempfile::TempDir;

use basebackup::basebackup::{perform_base_backup, BackupEnvironment};
use basebackup::checksum::ChecksumAlgorithm;
use basebackup::control::{
    build_backup_label, build_tablespace_map, ActiveBackupCounter, ClusterControl,
    SessionBackupLock, StartedBackup, StoppedBackup, Tablespace,
};
use basebackup::error::BackupError;
use basebackup::incremental::{ManifestPriorBackup, PriorBackup};
use basebackup::lsn::Lsn;
use basebackup::options::{BackupOptions, CheckpointMode, ManifestOption};
use basebackup::page_checksum::set_page_checksum;
use basebackup::pg_constants::{BLCKSZ, INCREMENTAL_MAGIC};
use basebackup::sink::{BackupProgress, Sink};
use basebackup::xlog_utils::{TimeLineID, XLogFileName, XLogSegNo};

const WAL_SEG_SIZE: usize = 64 * 1024;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

//
// Test double for the cluster side of the backup.
//

struct TestControl {
    start_lsn: Lsn,
    stop_lsn: Lsn,
    tli: TimeLineID,
    checksums_enabled: bool,
    tablespaces: Vec<Tablespace>,
    in_recovery: AtomicBool,
    /// Number of interrupt checks to pass before reporting an interrupt;
    /// negative means never.
    interrupt_after: AtomicI64,
    reported_failures: AtomicU64,
}

impl TestControl {
    fn new() -> Self {
        TestControl {
            start_lsn: Lsn(0x10008),
            stop_lsn: Lsn(0x30010),
            tli: 1,
            checksums_enabled: true,
            tablespaces: vec![Tablespace::main()],
            in_recovery: AtomicBool::new(false),
            interrupt_after: AtomicI64::new(-1),
            reported_failures: AtomicU64::new(0),
        }
    }
}

impl ClusterControl for TestControl {
    fn backup_start(
        &self,
        label: &str,
        _mode: CheckpointMode,
    ) -> Result<StartedBackup, BackupError> {
        Ok(StartedBackup {
            start_lsn: self.start_lsn,
            start_tli: self.tli,
            checkpoint_lsn: self.start_lsn,
            in_recovery: self.in_recovery.load(Ordering::SeqCst),
            tablespaces: self.tablespaces.clone(),
            backup_label: build_backup_label(
                self.start_lsn,
                self.tli,
                self.start_lsn,
                self.in_recovery.load(Ordering::SeqCst),
                label,
                SystemTime::now(),
                WAL_SEG_SIZE,
            ),
            tablespace_map: build_tablespace_map(&self.tablespaces),
        })
    }

    fn backup_stop(&self, _wait_for_archive: bool) -> Result<StoppedBackup, BackupError> {
        Ok(StoppedBackup {
            stop_lsn: self.stop_lsn,
            stop_tli: self.tli,
        })
    }

    fn in_recovery(&self) -> bool {
        self.in_recovery.load(Ordering::SeqCst)
    }

    fn data_checksums_enabled(&self) -> bool {
        self.checksums_enabled
    }

    fn wal_segment_size(&self) -> usize {
        WAL_SEG_SIZE
    }

    fn wal_removed_check(&self, _segno: XLogSegNo, _tli: TimeLineID) -> Result<(), BackupError> {
        Ok(())
    }

    fn report_checksum_failures(&self, _dboid: Option<u32>, failures: u64) {
        self.reported_failures.fetch_add(failures, Ordering::SeqCst);
    }

    fn interrupted(&self) -> bool {
        let remaining = self.interrupt_after.load(Ordering::SeqCst);
        if remaining < 0 {
            return false;
        }
        if remaining == 0 {
            return true;
        }
        self.interrupt_after.fetch_sub(1, Ordering::SeqCst);
        false
    }
}

//
// Recording sink: collects every archive in memory.
//

#[derive(Default)]
struct Recorded {
    archives: Vec<(String, Vec<u8>)>,
    end_backup: Option<(Lsn, TimeLineID)>,
    cleanup_called: bool,
}

struct RecordingSink {
    rec: Arc<Mutex<Recorded>>,
}

impl Sink for RecordingSink {
    fn begin_backup(&mut self, _buffer_len: usize) -> Result<(), BackupError> {
        Ok(())
    }
    fn begin_archive(&mut self, name: &str) -> Result<(), BackupError> {
        self.rec
            .lock()
            .unwrap()
            .archives
            .push((name.to_owned(), Vec::new()));
        Ok(())
    }
    fn archive_contents(&mut self, data: &[u8]) -> Result<(), BackupError> {
        self.rec
            .lock()
            .unwrap()
            .archives
            .last_mut()
            .expect("archive_contents before begin_archive")
            .1
            .extend_from_slice(data);
        Ok(())
    }
    fn end_archive(&mut self) -> Result<(), BackupError> {
        Ok(())
    }
    fn end_backup(&mut self, end_lsn: Lsn, end_tli: TimeLineID) -> Result<(), BackupError> {
        self.rec.lock().unwrap().end_backup = Some((end_lsn, end_tli));
        Ok(())
    }
    fn cleanup(&mut self) {
        self.rec.lock().unwrap().cleanup_called = true;
    }
}

//
// Minimal tar reader for assertions.
//

#[derive(Debug)]
struct TarEntry {
    name: String,
    typeflag: u8,
    content: Vec<u8>,
}

fn parse_tar(data: &[u8]) -> Vec<TarEntry> {
    assert_eq!(data.len() % 512, 0, "archive not block aligned");
    let mut entries = Vec::new();
    let mut pos = 0;
    loop {
        let block = &data[pos..pos + 512];
        if block.iter().all(|&b| b == 0) {
            // terminator: exactly two zero blocks, then end of archive
            assert_eq!(
                &data[pos..],
                vec![0u8; data.len() - pos].as_slice(),
                "garbage after terminator"
            );
            assert_eq!(data.len() - pos, 1024, "terminator is not two blocks");
            return entries;
        }
        let name_end = block.iter().position(|&b| b == 0).unwrap_or(100);
        let name = String::from_utf8(block[..name_end].to_vec()).unwrap();
        let size = u64::from_str_radix(
            std::str::from_utf8(&block[124..135]).unwrap().trim(),
            8,
        )
        .unwrap();
        let typeflag = block[156];
        let content_start = pos + 512;
        let content = data[content_start..content_start + size as usize].to_vec();
        let padded = (size as usize).div_ceil(512) * 512;
        pos = content_start + padded;
        entries.push(TarEntry {
            name,
            typeflag,
            content,
        });
    }
}

//
// Synthetic data directory.
//

fn write_rel_file(path: &Path, npages: usize) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(npages as u64);
    let mut data = Vec::with_capacity(npages * BLCKSZ);
    for blkno in 0..npages {
        let mut page = vec![0u8; BLCKSZ];
        // page LSN well below the backup start LSN, page initialized
        LittleEndian::write_u32(&mut page[4..8], 0x100);
        LittleEndian::write_u16(&mut page[12..14], 24);
        LittleEndian::write_u16(&mut page[14..16], BLCKSZ as u16);
        rng.fill(&mut page[256..512]);
        set_page_checksum(&mut page, blkno as u32);
        data.extend_from_slice(&page);
    }
    fs::write(path, data).unwrap();
}

fn make_datadir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    for d in [
        "base/1",
        "base/5",
        "global",
        "pg_wal/archive_status",
        "pg_tblspc",
        "pg_replslot",
        "pg_stat_tmp",
        "pg_notify",
    ] {
        fs::create_dir_all(root.join(d)).unwrap();
    }

    fs::write(root.join("PG_VERSION"), "17\n").unwrap();
    fs::write(root.join("postgresql.conf"), "# config\n").unwrap();
    // residual files from earlier runs, all excluded
    fs::write(root.join("postmaster.pid"), "1234\n").unwrap();
    fs::write(root.join("backup_label"), "stale\n").unwrap();
    fs::write(root.join("pg_replslot/slot.state"), "x").unwrap();
    fs::write(root.join("pg_stat_tmp/stats.tmp"), "x").unwrap();

    fs::write(root.join("global/pg_control"), vec![0xC0u8; 8192]).unwrap();
    fs::write(root.join("global/pg_filenode.map"), vec![1u8; 512]).unwrap();
    write_rel_file(&root.join("global/1262"), 2);
    write_rel_file(&root.join("base/1/1234"), 3);
    write_rel_file(&root.join("base/5/16385"), 16);
    write_rel_file(&root.join("base/5/16385_fsm"), 2);

    dir
}

fn write_wal_segments(root: &Path, segnos: &[u64]) {
    for &segno in segnos {
        let name = XLogFileName(1, segno, WAL_SEG_SIZE);
        fs::write(root.join("pg_wal").join(name), vec![0x57u8; WAL_SEG_SIZE]).unwrap();
    }
}

//
// Driver.
//

struct RunResult {
    result: Result<(), BackupError>,
    rec: Arc<Mutex<Recorded>>,
    counter_after: i64,
    progress: Arc<BackupProgress>,
}

fn run_backup(
    datadir: &Path,
    control: &TestControl,
    options: &BackupOptions,
    prior: Option<&dyn PriorBackup>,
) -> RunResult {
    let session = SessionBackupLock::new();
    let counter = ActiveBackupCounter::new();
    let env = BackupEnvironment {
        datadir: datadir.to_path_buf(),
        control,
        session: &session,
        counter: &counter,
    };
    let rec = Arc::new(Mutex::new(Recorded::default()));
    let progress = Arc::new(BackupProgress::new());
    let result = perform_base_backup(
        &env,
        options,
        Box::new(RecordingSink { rec: rec.clone() }),
        prior,
        progress.clone(),
    );
    RunResult {
        result,
        rec,
        counter_after: counter.current(),
        progress,
    }
}

fn manifest_options() -> BackupOptions {
    BackupOptions {
        manifest: ManifestOption::Yes,
        ..Default::default()
    }
}

fn archive<'a>(rec: &'a Recorded, name: &str) -> &'a [u8] {
    &rec.archives
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("no archive {name}"))
        .1
}

//
// Scenarios.
//

#[test]
fn test_full_backup_stream_shape() -> Result<()> {
    init_logging();
    let datadir = make_datadir();
    let control = TestControl::new();
    let mut options = manifest_options();
    options.label = "t1".to_owned();

    let run = run_backup(datadir.path(), &control, &options, None);
    run.result?;
    assert_eq!(run.counter_after, 0);

    let rec = run.rec.lock().unwrap();
    let names: Vec<&str> = rec.archives.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["base.tar", "backup_manifest"]);
    assert_eq!(rec.end_backup, Some((Lsn(0x30010), 1)));

    let entries = parse_tar(archive(&rec, "base.tar"));

    // synthesized label first, with this run's label, not the stale file
    assert_eq!(entries[0].name, "backup_label");
    let label = String::from_utf8(entries[0].content.clone()).unwrap();
    assert!(label.contains("LABEL: t1\n"));
    assert!(label.contains("START WAL LOCATION: 0/10008"));

    // control file last
    assert_eq!(entries.last().unwrap().name, "global/pg_control");

    let entry_names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(entry_names.contains(&"PG_VERSION"));
    assert!(entry_names.contains(&"base/5/16385"));
    assert!(entry_names.contains(&"global/1262"));
    // excluded files are gone, excluded-content dirs are empty entries
    assert!(!entry_names.contains(&"postmaster.pid"));
    assert!(!entry_names.iter().any(|n| n.starts_with("pg_replslot/") && *n != "pg_replslot/"));
    assert!(!entry_names.iter().any(|n| n.starts_with("pg_stat_tmp/") && *n != "pg_stat_tmp/"));
    assert!(entry_names.contains(&"pg_replslot/"));
    // WAL skeleton only
    assert!(entry_names.contains(&"pg_wal/"));
    assert!(entry_names.contains(&"pg_wal/archive_status/"));
    assert!(entry_names.contains(&"pg_wal/summaries/"));
    for n in &entry_names {
        if n.starts_with("pg_wal/") {
            assert!(
                ["pg_wal/", "pg_wal/archive_status/", "pg_wal/summaries/"].contains(n),
                "unexpected WAL entry {n}"
            );
        }
    }
    Ok(())
}

#[test]
fn test_manifest_faithfulness() -> Result<()> {
    init_logging();
    let datadir = make_datadir();
    let control = TestControl::new();
    let options = manifest_options();

    let run = run_backup(datadir.path(), &control, &options, None);
    run.result?;

    let rec = run.rec.lock().unwrap();
    let manifest_entries = parse_tar(archive(&rec, "backup_manifest"));
    assert_eq!(manifest_entries.len(), 1);
    assert_eq!(manifest_entries[0].name, "backup_manifest");
    let doc: Value = serde_json::from_slice(&manifest_entries[0].content).unwrap();

    let base_entries = parse_tar(archive(&rec, "base.tar"));
    let files = doc["Files"].as_array().unwrap();

    // every regular file streamed has a manifest record, and vice versa
    let streamed: Vec<&str> = base_entries
        .iter()
        .filter(|e| e.typeflag == b'0')
        .map(|e| e.name.as_str())
        .collect();
    let listed: Vec<&str> = files
        .iter()
        .map(|f| f["Path"].as_str().unwrap())
        .collect();
    for name in &streamed {
        assert!(listed.contains(name), "{name} missing from manifest");
    }
    assert_eq!(streamed.len(), listed.len());

    // recomputing the recorded algorithm over the streamed payload must
    // reproduce the stored checksum
    for f in files {
        assert_eq!(f["Checksum-Algorithm"], "CRC32C");
        let path = f["Path"].as_str().unwrap();
        let entry = base_entries.iter().find(|e| e.name == path).unwrap();
        assert_eq!(f["Size"].as_u64().unwrap(), entry.content.len() as u64);
        let crc = crc32c::crc32c(&entry.content);
        assert_eq!(
            f["Checksum"].as_str().unwrap(),
            hex::encode(crc.to_le_bytes()),
            "checksum mismatch for {path}"
        );
    }
    Ok(())
}

#[test]
fn test_checksum_corruption_detected() {
    let datadir = make_datadir();
    // flip a byte in block 2 of a relation, past the page header
    let rel = datadir.path().join("base/5/16385");
    let mut data = fs::read(&rel).unwrap();
    data[2 * BLCKSZ + 100] ^= 0xFF;
    fs::write(&rel, data).unwrap();

    let control = TestControl::new();
    let run = run_backup(datadir.path(), &control, &manifest_options(), None);

    match run.result {
        Err(BackupError::DataCorrupted(n)) => assert_eq!(n, 1),
        other => panic!("expected DataCorrupted, got {other:?}"),
    }
    assert_eq!(control.reported_failures.load(Ordering::SeqCst), 1);
    assert_eq!(run.counter_after, 0);

    // the stream itself completed; the corrupt page was still sent
    let rec = run.rec.lock().unwrap();
    assert!(rec.end_backup.is_some());
}

#[test]
fn test_verification_skips_pages_newer_than_backup() {
    let datadir = make_datadir();
    // corrupt a page but stamp its LSN after the backup start
    let rel = datadir.path().join("base/5/16385");
    let mut data = fs::read(&rel).unwrap();
    LittleEndian::write_u32(&mut data[3 * BLCKSZ + 4..3 * BLCKSZ + 8], 0x99999999);
    data[3 * BLCKSZ + 200] ^= 0xFF;
    fs::write(&rel, data).unwrap();

    let control = TestControl::new();
    let run = run_backup(datadir.path(), &control, &manifest_options(), None);
    run.result.unwrap();
    assert_eq!(control.reported_failures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wal_range_collection() -> Result<()> {
    init_logging();
    let datadir = make_datadir();
    // start_lsn in segment 1, stop_lsn in segment 3: segments 1..=3
    write_wal_segments(datadir.path(), &[1, 2, 3, 4]);
    fs::write(
        datadir.path().join("pg_wal/00000002.history"),
        "1\t0/20000\tpromotion\n",
    )
    .unwrap();

    let control = TestControl::new();
    let mut options = manifest_options();
    options.include_wal = true;

    let run = run_backup(datadir.path(), &control, &options, None);
    run.result?;

    let rec = run.rec.lock().unwrap();
    let entries = parse_tar(archive(&rec, "base.tar"));

    let control_pos = entries
        .iter()
        .position(|e| e.name == "global/pg_control")
        .unwrap();
    let after: Vec<&str> = entries[control_pos + 1..]
        .iter()
        .map(|e| e.name.as_str())
        .collect();
    assert_eq!(
        after,
        vec![
            "pg_wal/000000010000000000000001",
            "pg_wal/archive_status/000000010000000000000001.done",
            "pg_wal/000000010000000000000002",
            "pg_wal/archive_status/000000010000000000000002.done",
            "pg_wal/000000010000000000000003",
            "pg_wal/archive_status/000000010000000000000003.done",
            "pg_wal/00000002.history",
            "pg_wal/archive_status/00000002.history.done",
        ]
    );
    for e in &entries[control_pos + 1..] {
        if e.name.ends_with(".done") {
            assert!(e.content.is_empty());
        } else if e.name != "pg_wal/00000002.history" {
            assert_eq!(e.content.len(), WAL_SEG_SIZE);
        }
    }

    let manifest_entries = parse_tar(archive(&rec, "backup_manifest"));
    let doc: Value = serde_json::from_slice(&manifest_entries[0].content).unwrap();
    let range = &doc["WAL-Ranges"].as_array().unwrap()[0];
    assert_eq!(range["Start-LSN"], "0/10008");
    assert_eq!(range["End-LSN"], "0/30010");
    assert_eq!(range["Start-Timeline"], 1);
    assert_eq!(range["Timeline-History"][0], "00000002.history");
    // WAL segments themselves are never listed as files
    assert!(!doc["Files"]
        .as_array()
        .unwrap()
        .iter()
        .any(|f| f["Path"].as_str().unwrap().starts_with("pg_wal/")));
    Ok(())
}

#[test]
fn test_wal_gap_is_fatal() {
    let datadir = make_datadir();
    write_wal_segments(datadir.path(), &[1, 3]);

    let control = TestControl::new();
    let mut options = manifest_options();
    options.include_wal = true;

    let run = run_backup(datadir.path(), &control, &options, None);
    match run.result {
        Err(BackupError::WalGap(msg)) => {
            assert!(msg.contains("000000010000000000000002"), "{msg}");
        }
        other => panic!("expected WalGap, got {other:?}"),
    }
    assert_eq!(run.counter_after, 0);
    assert!(run.rec.lock().unwrap().cleanup_called);
}

#[test]
fn test_missing_wal_entirely() {
    let datadir = make_datadir();
    let control = TestControl::new();
    let mut options = manifest_options();
    options.include_wal = true;

    let run = run_backup(datadir.path(), &control, &options, None);
    assert!(matches!(run.result, Err(BackupError::WalGap(_))));
}

#[test]
fn test_incremental_backup() -> Result<()> {
    init_logging();
    let datadir = make_datadir();
    let rel_size = 16 * BLCKSZ as u64;
    let manifest_json = format!(
        r#"{{"PostgreSQL-Backup-Manifest-Version": 1,
             "Files": [{{"Path": "base/5/16385", "Size": {rel_size}}},
                       {{"Path": "base/5/16385_fsm", "Size": {}}}]}}"#,
        2 * BLCKSZ
    );
    let mut prior = ManifestPriorBackup::from_manifest(manifest_json.as_bytes())?;
    prior.record_changed_blocks("base/5/16385", &[9, 0, 3, 2]);

    let control = TestControl::new();
    let mut options = manifest_options();
    options.incremental = true;

    let run = run_backup(datadir.path(), &control, &options, Some(&prior));
    run.result?;

    let rec = run.rec.lock().unwrap();
    let entries = parse_tar(archive(&rec, "base.tar"));
    let inc = entries
        .iter()
        .find(|e| e.name == "base/5/INCREMENTAL.16385")
        .expect("incremental member missing");
    assert!(!entries.iter().any(|e| e.name == "base/5/16385"));

    // header: magic, block count, truncation length, sorted block numbers,
    // padded to a page boundary
    assert_eq!(inc.content.len(), BLCKSZ + 4 * BLCKSZ);
    assert_eq!(
        LittleEndian::read_u32(&inc.content[0..4]),
        INCREMENTAL_MAGIC
    );
    assert_eq!(LittleEndian::read_u32(&inc.content[4..8]), 4);
    assert_eq!(LittleEndian::read_u32(&inc.content[8..12]), 16);
    let blocks: Vec<u32> = (0..4)
        .map(|i| LittleEndian::read_u32(&inc.content[12 + 4 * i..16 + 4 * i]))
        .collect();
    assert_eq!(blocks, vec![0, 2, 3, 9]);

    // payload pages are the current on-disk pages at those block numbers
    let on_disk = fs::read(datadir.path().join("base/5/16385")).unwrap();
    for (i, &blkno) in blocks.iter().enumerate() {
        let sent = &inc.content[BLCKSZ * (1 + i)..BLCKSZ * (2 + i)];
        let disk = &on_disk[BLCKSZ * blkno as usize..BLCKSZ * (blkno as usize + 1)];
        assert_eq!(sent, disk, "block {blkno}");
    }

    // FSM fork always goes in full
    assert!(entries.iter().any(|e| e.name == "base/5/16385_fsm"));

    // manifest records the sparse member under its archive name and size
    let manifest_entries = parse_tar(archive(&rec, "backup_manifest"));
    let doc: Value = serde_json::from_slice(&manifest_entries[0].content).unwrap();
    let entry = doc["Files"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["Path"] == "base/5/INCREMENTAL.16385")
        .unwrap();
    assert_eq!(entry["Size"].as_u64().unwrap(), (5 * BLCKSZ) as u64);
    Ok(())
}

#[test]
fn test_incremental_requires_manifest() {
    let datadir = make_datadir();
    let control = TestControl::new();
    let mut options = manifest_options();
    options.incremental = true;

    let run = run_backup(datadir.path(), &control, &options, None);
    assert!(matches!(run.result, Err(BackupError::MissingManifest)));
    assert_eq!(run.counter_after, 0);
}

#[test]
fn test_session_busy() {
    let datadir = make_datadir();
    let control = TestControl::new();
    let session = SessionBackupLock::new();
    let counter = ActiveBackupCounter::new();
    let env = BackupEnvironment {
        datadir: datadir.path().to_path_buf(),
        control: &control,
        session: &session,
        counter: &counter,
    };

    let _running = session.try_begin().unwrap();
    let rec = Arc::new(Mutex::new(Recorded::default()));
    let result = perform_base_backup(
        &env,
        &manifest_options(),
        Box::new(RecordingSink { rec: rec.clone() }),
        None,
        Arc::new(BackupProgress::new()),
    );
    assert!(matches!(result, Err(BackupError::SessionBusy)));
    assert_eq!(counter.current(), 0);
    assert!(rec.lock().unwrap().archives.is_empty());
}

#[test]
fn test_interrupt_mid_walk() {
    let datadir = make_datadir();
    let control = TestControl::new();
    control.interrupt_after.store(5, Ordering::SeqCst);

    let run = run_backup(datadir.path(), &control, &manifest_options(), None);
    assert!(matches!(run.result, Err(BackupError::Interrupted)));
    assert_eq!(run.counter_after, 0);
    assert!(run.rec.lock().unwrap().cleanup_called);
}

#[test]
fn test_promotion_mid_walk() {
    let datadir = make_datadir();
    let control = TestControl::new();
    // started on a standby...
    control.in_recovery.store(true, Ordering::SeqCst);
    let session = SessionBackupLock::new();
    let counter = ActiveBackupCounter::new();
    let env = BackupEnvironment {
        datadir: datadir.path().to_path_buf(),
        control: &control,
        session: &session,
        counter: &counter,
    };

    // ...then promoted immediately after backup_start captured the state.
    // in_recovery() now reports false while from_standby is set.
    struct PromotingControl<'a> {
        inner: &'a TestControl,
    }
    impl ClusterControl for PromotingControl<'_> {
        fn backup_start(
            &self,
            label: &str,
            mode: CheckpointMode,
        ) -> Result<StartedBackup, BackupError> {
            let started = self.inner.backup_start(label, mode)?;
            self.inner.in_recovery.store(false, Ordering::SeqCst);
            Ok(started)
        }
        fn backup_stop(&self, wait: bool) -> Result<StoppedBackup, BackupError> {
            self.inner.backup_stop(wait)
        }
        fn in_recovery(&self) -> bool {
            self.inner.in_recovery()
        }
        fn data_checksums_enabled(&self) -> bool {
            self.inner.data_checksums_enabled()
        }
        fn wal_segment_size(&self) -> usize {
            self.inner.wal_segment_size()
        }
        fn wal_removed_check(
            &self,
            segno: XLogSegNo,
            tli: TimeLineID,
        ) -> Result<(), BackupError> {
            self.inner.wal_removed_check(segno, tli)
        }
    }
    let promoting = PromotingControl { inner: &control };
    let env = BackupEnvironment {
        control: &promoting,
        ..env
    };

    let rec = Arc::new(Mutex::new(Recorded::default()));
    let result = perform_base_backup(
        &env,
        &manifest_options(),
        Box::new(RecordingSink { rec: rec.clone() }),
        None,
        Arc::new(BackupProgress::new()),
    );
    assert!(matches!(result, Err(BackupError::PromotedDuringBackup)));
    assert_eq!(counter.current(), 0);
}

#[test]
fn test_unlogged_and_temp_relations_excluded() {
    let datadir = make_datadir();
    let base5 = datadir.path().join("base/5");
    write_rel_file(&base5.join("16390"), 2);
    write_rel_file(&base5.join("16390_fsm"), 1);
    write_rel_file(&base5.join("16390_init"), 1);
    write_rel_file(&base5.join("t3_999"), 1);
    fs::write(base5.join("pgsql_tmp123"), "x").unwrap();

    let control = TestControl::new();
    let run = run_backup(datadir.path(), &control, &manifest_options(), None);
    run.result.unwrap();

    let rec = run.rec.lock().unwrap();
    let entries = parse_tar(archive(&rec, "base.tar"));
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"base/5/16390_init"));
    assert!(!names.contains(&"base/5/16390"));
    assert!(!names.contains(&"base/5/16390_fsm"));
    assert!(!names.contains(&"base/5/t3_999"));
    assert!(!names.contains(&"base/5/pgsql_tmp123"));
}

#[cfg(unix)]
#[test]
fn test_external_tablespace_archive() {
    let datadir = make_datadir();
    let ts_dir = TempDir::new().unwrap();
    let version_dir = ts_dir
        .path()
        .join(basebackup::pg_constants::TABLESPACE_VERSION_DIRECTORY);
    fs::create_dir_all(version_dir.join("5")).unwrap();
    write_rel_file(&version_dir.join("5/20001"), 2);
    std::os::unix::fs::symlink(ts_dir.path(), datadir.path().join("pg_tblspc/16400")).unwrap();

    let mut control = TestControl::new();
    control.tablespaces = vec![
        Tablespace {
            oid: Some(16400),
            path: Some(ts_dir.path().to_path_buf()),
            rpath: None,
            size: None,
        },
        Tablespace::main(),
    ];

    let run = run_backup(datadir.path(), &control, &manifest_options(), None);
    run.result.unwrap();

    let rec = run.rec.lock().unwrap();
    let names: Vec<&str> = rec.archives.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["16400.tar", "base.tar", "backup_manifest"]);

    let ts_entries = parse_tar(archive(&rec, "16400.tar"));
    let ts_names: Vec<&str> = ts_entries.iter().map(|e| e.name.as_str()).collect();
    let rel_name = format!(
        "{}/5/20001",
        basebackup::pg_constants::TABLESPACE_VERSION_DIRECTORY
    );
    assert!(ts_names.contains(&rel_name.as_str()));

    // the tablespace symlink appears in the main archive
    let base_entries = parse_tar(archive(&rec, "base.tar"));
    let link = base_entries
        .iter()
        .find(|e| e.name == "pg_tblspc/16400")
        .expect("tablespace link missing");
    assert_eq!(link.typeflag, b'2');

    assert_eq!(run.progress.tablespaces(), (2, 2));
}

#[cfg(unix)]
#[test]
fn test_relocated_wal_symlink_sent_as_directory() {
    init_logging();
    let datadir = make_datadir();
    // pg_wal relocated to another filesystem via symlink
    let wal_dir = TempDir::new().unwrap();
    fs::create_dir_all(wal_dir.path().join("archive_status")).unwrap();
    fs::remove_dir_all(datadir.path().join("pg_wal")).unwrap();
    std::os::unix::fs::symlink(wal_dir.path(), datadir.path().join("pg_wal")).unwrap();

    let control = TestControl::new();
    let run = run_backup(datadir.path(), &control, &manifest_options(), None);
    run.result.unwrap();

    let rec = run.rec.lock().unwrap();
    let entries = parse_tar(archive(&rec, "base.tar"));
    for name in ["pg_wal/", "pg_wal/archive_status/", "pg_wal/summaries/"] {
        let entry = entries
            .iter()
            .find(|e| e.name == name)
            .unwrap_or_else(|| panic!("{name} missing from archive"));
        assert_eq!(entry.typeflag, b'5', "{name} is not a directory entry");
    }
    assert!(!entries.iter().any(|e| e.typeflag == b'2'));
}

#[cfg(unix)]
#[test]
fn test_relocated_wal_symlink_streams_segments() {
    let datadir = make_datadir();
    let wal_dir = TempDir::new().unwrap();
    fs::remove_dir_all(datadir.path().join("pg_wal")).unwrap();
    std::os::unix::fs::symlink(wal_dir.path(), datadir.path().join("pg_wal")).unwrap();
    write_wal_segments(datadir.path(), &[1, 2, 3]);

    let control = TestControl::new();
    let mut options = manifest_options();
    options.include_wal = true;

    let run = run_backup(datadir.path(), &control, &options, None);
    run.result.unwrap();

    let rec = run.rec.lock().unwrap();
    let entries = parse_tar(archive(&rec, "base.tar"));
    assert!(entries
        .iter()
        .any(|e| e.name == "pg_wal/000000010000000000000003"));
}

#[test]
fn test_walker_is_deterministic() {
    let datadir = make_datadir();
    let names_of = |run: &RunResult| -> Vec<String> {
        let rec = run.rec.lock().unwrap();
        parse_tar(archive(&rec, "base.tar"))
            .iter()
            .map(|e| e.name.clone())
            .collect()
    };

    let control = TestControl::new();
    let first = run_backup(datadir.path(), &control, &manifest_options(), None);
    first.result.as_ref().unwrap();
    let second = run_backup(datadir.path(), &control, &manifest_options(), None);
    second.result.as_ref().unwrap();
    assert_eq!(names_of(&first), names_of(&second));
}

#[test]
fn test_progress_estimate() {
    let datadir = make_datadir();
    let control = TestControl::new();
    let mut options = manifest_options();
    options.progress = true;

    let run = run_backup(datadir.path(), &control, &options, None);
    run.result.unwrap();
    assert!(run.progress.bytes_total() > 0);
    assert!(run.progress.bytes_done() >= run.progress.bytes_total());
    // one tablespace; the manifest archive is not a tablespace
    assert_eq!(run.progress.tablespaces(), (1, 1));
}

#[test]
fn test_checksum_verification_disabled_cluster() {
    let datadir = make_datadir();
    // corrupt a page; with cluster checksums off nothing is verified
    let rel = datadir.path().join("base/5/16385");
    let mut data = fs::read(&rel).unwrap();
    data[BLCKSZ + 300] ^= 0xFF;
    fs::write(&rel, data).unwrap();

    let mut control = TestControl::new();
    control.checksums_enabled = false;

    let run = run_backup(datadir.path(), &control, &manifest_options(), None);
    run.result.unwrap();
    assert_eq!(control.reported_failures.load(Ordering::SeqCst), 0);
}

#[test]
fn test_force_encode_manifest() {
    let datadir = make_datadir();
    let control = TestControl::new();
    let mut options = manifest_options();
    options.manifest = ManifestOption::ForceEncode;
    options.manifest_checksum = ChecksumAlgorithm::Sha256;

    let run = run_backup(datadir.path(), &control, &options, None);
    run.result.unwrap();

    let rec = run.rec.lock().unwrap();
    let manifest_entries = parse_tar(archive(&rec, "backup_manifest"));
    let doc: Value = serde_json::from_slice(&manifest_entries[0].content).unwrap();
    for f in doc["Files"].as_array().unwrap() {
        assert!(f.get("Path").is_none());
        assert!(f.get("Encoded-Path").is_some());
        assert_eq!(f["Checksum-Algorithm"], "SHA256");
    }
}
