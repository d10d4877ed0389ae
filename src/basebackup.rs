//!
//! Online base backup: stream a self-consistent snapshot of a live data
//! directory, plus the WAL needed to recover it, as a sequence of tar
//! archives through a sink stack.
//!
//! The cluster keeps accepting writes while this runs. Consistency comes
//! from the checkpoint handshake at the start, from capturing each file's
//! stat once and treating that size as authoritative, and from shipping a
//! WAL range that lets recovery repair everything read mid-write.
//!

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::checksum::{ChecksumAlgorithm, ChecksumContext};
use crate::compression::{GzipSink, Lz4Sink, ZstdSink};
use crate::control::{ActiveBackupCounter, ClusterControl, SessionBackupLock, Tablespace};
use crate::error::BackupError;
use crate::incremental::{self, FileBackupMethod, PriorBackup};
use crate::lsn::Lsn;
use crate::manifest::ManifestBuilder;
use crate::options::{BackupOptions, BackupTarget, CompressionAlgorithm, ManifestOption};
use crate::page_checksum;
use crate::pg_constants::{
    BLCKSZ, BACKUP_LABEL_FILE, BACKUP_MANIFEST_FILE, DEFAULTTABLESPACE_OID,
    GLOBALTABLESPACE_OID, INIT_FORKNUM, PG_FILE_MODE_OWNER, PG_TEMP_FILE_PREFIX, RELSEG_SIZE,
    TABLESPACE_DIR, TABLESPACE_MAP, TABLESPACE_VERSION_DIRECTORY, XLOGDIR, XLOG_CONTROL_FILE,
};
use crate::relfile_utils::{init_fork_sibling, looks_like_temp_rel_name, parse_relfilename};
use crate::sink::{
    BackupPhase, BackupProgress, CopyStreamSink, ProgressSink, ServerFileSink, Sink,
    SinkPipeline, ThrottleSink,
};
use crate::tar::{self, EntryStat};
use crate::xlog_utils::{
    IsTLHistoryFileName, IsXLogFileName, TimeLineID, XLByteToPrevSeg, XLByteToSeg, XLogFileName,
    XLogFromFileName, XLogSegNo,
};

/// Directories whose contents are dropped; the directory itself is sent as
/// an empty entry so a restored cluster can recreate its state.
const EXCLUDE_DIR_CONTENTS: &[&str] = &[
    "pg_stat_tmp",
    "pg_replslot",
    "pg_dynshmem",
    "pg_notify",
    "pg_serial",
    "pg_snapshots",
    "pg_subtrans",
];

/// Files skipped entirely, matched by basename at any depth.
const EXCLUDE_FILES: &[&str] = &[
    "postgresql.auto.conf.tmp",
    "current_logfiles.tmp",
    "backup_label",
    "tablespace_map",
    "backup_manifest",
    "postmaster.pid",
    "postmaster.opts",
    ".DS_Store",
];

/// Relation cache init files, matched by prefix.
const EXCLUDE_PREFIX: &str = "pg_internal.init";

const CHECKSUM_WARNINGS_PER_FILE: u64 = 5;

/// Long-lived per-session/per-cluster state a backup runs against.
pub struct BackupEnvironment<'a> {
    pub datadir: PathBuf,
    pub control: &'a dyn ClusterControl,
    pub session: &'a SessionBackupLock,
    pub counter: &'a ActiveBackupCounter,
}

/// Build the destination sink named by the request. A client target needs
/// the session's outbound channel.
pub fn target_sink(
    options: &BackupOptions,
    client: Option<Box<dyn Write>>,
) -> Result<Box<dyn Sink>, BackupError> {
    match &options.target {
        BackupTarget::Client => match client {
            Some(out) => Ok(Box::new(CopyStreamSink::new(out))),
            None => Err(BackupError::OptionInvalid(
                "client target requires an output channel".to_owned(),
            )),
        },
        BackupTarget::Server(dir) => Ok(Box::new(ServerFileSink::new(dir.clone()))),
    }
}

/// Assemble the sink stack for a request: progress at the head, then
/// throttle, then compression, then the destination.
pub fn build_sink_stack(
    options: &BackupOptions,
    target: Box<dyn Sink>,
    progress: Arc<BackupProgress>,
) -> Box<dyn Sink> {
    let mut sink = target;
    match options.compression {
        CompressionAlgorithm::None => {}
        CompressionAlgorithm::Gzip => {
            sink = Box::new(GzipSink::new(
                sink,
                options.compression_detail.level.map(|l| l as u32),
            ))
        }
        CompressionAlgorithm::Lz4 => sink = Box::new(Lz4Sink::new(sink)),
        CompressionAlgorithm::Zstd => {
            sink = Box::new(ZstdSink::new(
                sink,
                options.compression_detail.level,
                options.compression_detail.workers,
            ))
        }
    }
    if options.max_rate_kib > 0 {
        sink = Box::new(ThrottleSink::new(sink, options.max_rate_kib));
    }
    Box::new(ProgressSink::new(sink, progress))
}

/// Run one base backup end to end. Returns only after the stream is
/// complete or the failure has been cleaned up.
pub fn perform_base_backup(
    env: &BackupEnvironment,
    options: &BackupOptions,
    target: Box<dyn Sink>,
    prior: Option<&dyn PriorBackup>,
    progress: Arc<BackupProgress>,
) -> Result<(), BackupError> {
    let _session = env.session.try_begin()?;

    if options.incremental && prior.is_none() {
        return Err(BackupError::MissingManifest);
    }

    let mut pipeline = SinkPipeline::new(build_sink_stack(options, target, progress.clone()));
    let result = run_backup(env, options, &mut pipeline, prior, progress.as_ref());
    if result.is_err() {
        pipeline.cleanup();
    }
    result
}

fn run_backup(
    env: &BackupEnvironment,
    options: &BackupOptions,
    pipeline: &mut SinkPipeline,
    prior: Option<&dyn PriorBackup>,
    progress: &BackupProgress,
) -> Result<(), BackupError> {
    progress.set_phase(BackupPhase::WaitCheckpoint);

    env.counter.increment();
    let _counter_guard = scopeguard::guard(env.counter, |c| c.decrement());

    let started = env.control.backup_start(&options.label, options.checkpoint)?;
    // Tear down the backup state if anything fails before backup_stop.
    let abort_guard = scopeguard::guard(env.control, |c| c.backup_abort());

    info!(
        "base backup \"{}\" starting at {} on timeline {}",
        options.label, started.start_lsn, started.start_tli
    );

    let verify_checksums = options.verify_checksums && env.control.data_checksums_enabled();
    if options.verify_checksums && !verify_checksums {
        info!("data checksums are disabled in this cluster, skipping verification");
    }

    let manifest = match options.manifest {
        ManifestOption::No => None,
        ManifestOption::Yes => Some(ManifestBuilder::new(false, options.manifest_checksum)),
        ManifestOption::ForceEncode => {
            Some(ManifestBuilder::new(true, options.manifest_checksum))
        }
    };

    // Main data directory always last, so its archive can absorb the
    // control file update and the WAL that follows it.
    let mut tablespaces = started.tablespaces.clone();
    tablespaces.sort_by_key(Tablespace::is_main);

    let mut ctx = BackupContext {
        datadir: &env.datadir,
        control: env.control,
        pipeline,
        manifest,
        prior: if options.incremental { prior } else { None },
        start_lsn: started.start_lsn,
        from_standby: started.in_recovery,
        verify_checksums,
        send_tblspc_links: !options.send_tablespace_map,
        in_pgdata_tablespaces: tablespaces
            .iter()
            .filter_map(|ts| ts.rpath.clone())
            .collect(),
        total_checksum_failures: 0,
    };

    if options.progress {
        progress.set_phase(BackupPhase::EstimateSize);
        let mut total = 0u64;
        for ts in &mut tablespaces {
            let size = if ts.is_main() {
                ctx.estimate_main_size(options, &started)?
            } else {
                ctx.send_tablespace(ts, true)? + 1024
            };
            ts.size = Some(size);
            total += size;
        }
        progress.set_bytes_total(total);
    }
    progress.set_tablespaces_total(tablespaces.len() as u32);

    ctx.pipeline.begin_backup()?;
    progress.set_phase(BackupPhase::StreamFiles);

    for ts in &tablespaces {
        ctx.pipeline.begin_archive(&ts.archive_name())?;
        if ts.is_main() {
            ctx.send_file_with_content(BACKUP_LABEL_FILE, started.backup_label.as_bytes())?;
            if options.send_tablespace_map {
                ctx.send_file_with_content(TABLESPACE_MAP, started.tablespace_map.as_bytes())?;
            }
            let datadir = ctx.datadir;
            ctx.send_dir(datadir, "", None, false)?;
            ctx.send_control_file()?;
        } else {
            ctx.send_tablespace(ts, false)?;
        }
        // With WAL requested the main archive stays open for the log.
        if !(options.include_wal && ts.is_main()) {
            ctx.pipeline.push(&tar::ZERO_BLOCK)?;
            ctx.pipeline.push(&tar::ZERO_BLOCK)?;
            ctx.pipeline.end_archive()?;
            progress.tablespace_done();
        }
    }

    progress.set_phase(BackupPhase::WaitWalArchive);
    let stopped = env.control.backup_stop(options.wait_for_wal_archive)?;
    scopeguard::ScopeGuard::into_inner(abort_guard);

    let mut history_files = Vec::new();
    if options.include_wal {
        progress.set_phase(BackupPhase::TransferWal);
        history_files =
            ctx.send_wal_range(started.start_lsn, started.start_tli, stopped.stop_lsn)?;
        ctx.pipeline.push(&tar::ZERO_BLOCK)?;
        ctx.pipeline.push(&tar::ZERO_BLOCK)?;
        ctx.pipeline.end_archive()?;
        progress.tablespace_done();
    }

    if let Some(mut manifest) = ctx.manifest.take() {
        manifest.add_wal_range(
            started.start_lsn,
            started.start_tli,
            stopped.stop_lsn,
            stopped.stop_tli,
            history_files,
        );
        let doc = manifest.finalize();
        ctx.pipeline.begin_archive(BACKUP_MANIFEST_FILE)?;
        ctx.send_file_with_content(BACKUP_MANIFEST_FILE, &doc)?;
        ctx.pipeline.push(&tar::ZERO_BLOCK)?;
        ctx.pipeline.push(&tar::ZERO_BLOCK)?;
        ctx.pipeline.end_archive()?;
    }

    ctx.pipeline.end_backup(stopped.stop_lsn, stopped.stop_tli)?;

    if ctx.total_checksum_failures > 0 {
        warn!(
            "base backup completed with {} total checksum verification failures",
            ctx.total_checksum_failures
        );
        return Err(BackupError::DataCorrupted(ctx.total_checksum_failures));
    }

    info!(
        "base backup \"{}\" complete, {} to {}",
        options.label, started.start_lsn, stopped.stop_lsn
    );
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct RelationFile {
    spcoid: u32,
    dboid: u32,
    segno: u32,
}

struct BackupContext<'a> {
    datadir: &'a Path,
    control: &'a dyn ClusterControl,
    pipeline: &'a mut SinkPipeline,
    manifest: Option<ManifestBuilder>,
    prior: Option<&'a dyn PriorBackup>,
    start_lsn: Lsn,
    from_standby: bool,
    verify_checksums: bool,
    send_tblspc_links: bool,
    /// Relative paths of in-place tablespaces; not recursed into from the
    /// main walk, each gets its own archive.
    in_pgdata_tablespaces: Vec<PathBuf>,
    total_checksum_failures: u64,
}

impl BackupContext<'_> {
    fn check_interrupts(&self) -> Result<(), BackupError> {
        if self.control.interrupted() {
            return Err(BackupError::Interrupted);
        }
        if self.from_standby && !self.control.in_recovery() {
            return Err(BackupError::PromotedDuringBackup);
        }
        Ok(())
    }

    /// Walk one directory, streaming (or, with `sizeonly`, just measuring)
    /// everything that belongs in the backup. `rel` is the directory's
    /// archive-relative path, empty at the root; `spcoid` is set when
    /// walking a tablespace tree.
    fn send_dir(
        &mut self,
        fs_path: &Path,
        rel: &str,
        spcoid: Option<u32>,
        sizeonly: bool,
    ) -> Result<u64, BackupError> {
        let rd = fs::read_dir(fs_path).map_err(|e| BackupError::FileOpenFailed {
            path: fs_path.to_owned(),
            source: e,
        })?;
        let mut names: Vec<String> = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| BackupError::FileReadFailed {
                path: fs_path.to_owned(),
                source: e,
            })?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        let name_set: HashSet<&str> = names.iter().map(String::as_str).collect();

        let mut size = 0u64;
        for name in &names {
            self.check_interrupts()?;

            if EXCLUDE_FILES.contains(&name.as_str()) {
                debug!("file \"{name}\" excluded from backup");
                continue;
            }
            if name.starts_with(EXCLUDE_PREFIX) || name.starts_with(PG_TEMP_FILE_PREFIX) {
                continue;
            }

            let entry_path = fs_path.join(name);
            let rel_path = if rel.is_empty() {
                name.clone()
            } else {
                format!("{rel}/{name}")
            };

            // The file may vanish between readdir and stat.
            let meta = match fs::symlink_metadata(&entry_path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(BackupError::FileStatFailed {
                        path: entry_path,
                        source: e,
                    })
                }
            };
            let stat = entry_stat(&meta);

            if meta.file_type().is_symlink() {
                // Relocated WAL: pg_wal may be a symlink, but a restored
                // cluster needs a real directory there. Send the skeleton
                // as if it were one.
                if rel.is_empty() && name == XLOGDIR {
                    let mut dir_stat = stat;
                    tar::convert_link_to_directory(&mut dir_stat);
                    size += self.send_empty_dir(&rel_path, &dir_stat, sizeonly)?;
                    size += self.send_empty_dir(
                        &format!("{rel_path}/archive_status"),
                        &dir_stat,
                        sizeonly,
                    )?;
                    size += self.send_empty_dir(
                        &format!("{rel_path}/summaries"),
                        &dir_stat,
                        sizeonly,
                    )?;
                    continue;
                }
                if rel == TABLESPACE_DIR {
                    if self.send_tblspc_links {
                        if !sizeonly {
                            let target = fs::read_link(&entry_path).map_err(|e| {
                                BackupError::FileReadFailed {
                                    path: entry_path.clone(),
                                    source: e,
                                }
                            })?;
                            let header = tar::symlink_header(
                                &rel_path,
                                &target.to_string_lossy(),
                                &stat,
                            )?;
                            self.pipeline.push(&header)?;
                        }
                        size += 512;
                    }
                } else {
                    warn!("skipping special file \"{rel_path}\"");
                }
                continue;
            }

            if meta.is_dir() {
                if rel.is_empty() && EXCLUDE_DIR_CONTENTS.contains(&name.as_str()) {
                    debug!("contents of directory \"{name}\" excluded from backup");
                    size += self.send_empty_dir(&rel_path, &stat, sizeonly)?;
                    continue;
                }
                // WAL is collected separately; ship the skeleton only.
                if rel.is_empty() && name == XLOGDIR {
                    size += self.send_empty_dir(&rel_path, &stat, sizeonly)?;
                    size += self.send_empty_dir(
                        &format!("{rel_path}/archive_status"),
                        &stat,
                        sizeonly,
                    )?;
                    size +=
                        self.send_empty_dir(&format!("{rel_path}/summaries"), &stat, sizeonly)?;
                    continue;
                }

                if !sizeonly {
                    let header = tar::directory_header(&rel_path, &stat)?;
                    self.pipeline.push(&header)?;
                }
                size += 512;

                if self
                    .in_pgdata_tablespaces
                    .iter()
                    .any(|r| r.as_path() == Path::new(&rel_path))
                {
                    debug!("in-place tablespace \"{rel_path}\" sent as its own archive");
                    continue;
                }
                size += self.send_dir(&entry_path, &rel_path, spcoid, sizeonly)?;
                continue;
            }

            if !meta.is_file() {
                warn!("skipping special file \"{rel_path}\"");
                continue;
            }

            // The control file is captured last, after backup_stop.
            if spcoid.is_none() && rel_path == XLOG_CONTROL_FILE {
                continue;
            }

            let mut relation = None;
            if let Some((spc, db)) = relation_context(rel, spcoid) {
                if looks_like_temp_rel_name(name) {
                    debug!("temporary relation file \"{rel_path}\" excluded");
                    continue;
                }
                if let Ok((relnumber, forknum, segno)) = parse_relfilename(name) {
                    if forknum != INIT_FORKNUM {
                        if let Some(sibling) = init_fork_sibling(name) {
                            if name_set.contains(sibling.as_str()) {
                                debug!("unlogged relation file \"{rel_path}\" excluded");
                                continue;
                            }
                        }
                    }
                    relation = Some((
                        RelationFile {
                            spcoid: spc,
                            dboid: db,
                            segno,
                        },
                        relnumber,
                        forknum,
                    ));
                }
            }

            let mut archive_name = rel_path.clone();
            let mut method = FileBackupMethod::Full;
            let mut archive_size = stat.size;
            if let (Some(prior), Some((relfile, relnumber, forknum))) = (self.prior, relation)
            {
                method = prior.file_backup_method(
                    &rel_path,
                    relfile.dboid,
                    relfile.spcoid,
                    relnumber,
                    forknum,
                    relfile.segno,
                    stat.size,
                );
                if let FileBackupMethod::Incremental { blocks, .. } = &method {
                    archive_name = match rel_path.rsplit_once('/') {
                        Some((dir, base)) => {
                            format!("{dir}/{}", incremental::incremental_name(base))
                        }
                        None => incremental::incremental_name(&rel_path),
                    };
                    archive_size = incremental::file_size(blocks.len());
                }
            }

            if sizeonly {
                size += tar::entry_size(archive_size);
                continue;
            }
            let sent = self.send_file(
                &archive_name,
                &entry_path,
                &stat,
                relation.map(|(r, _, _)| r),
                method,
                true,
            )?;
            if sent {
                size += tar::entry_size(archive_size);
            }
        }
        Ok(size)
    }

    fn send_empty_dir(
        &mut self,
        rel_path: &str,
        stat: &EntryStat,
        sizeonly: bool,
    ) -> Result<u64, BackupError> {
        if !sizeonly {
            let header = tar::directory_header(rel_path, stat)?;
            self.pipeline.push(&header)?;
        }
        Ok(512)
    }

    /// Stream one auxiliary tablespace as its own archive. Missing version
    /// directories (tablespace created but never used by this major
    /// version) are skipped with a warning.
    fn send_tablespace(&mut self, ts: &Tablespace, sizeonly: bool) -> Result<u64, BackupError> {
        let root = match (&ts.path, &ts.rpath) {
            (Some(path), _) => path.clone(),
            (None, Some(rpath)) => self.datadir.join(rpath),
            (None, None) => unreachable!("main tablespace is walked via send_dir"),
        };
        let version_path = root.join(TABLESPACE_VERSION_DIRECTORY);
        let meta = match fs::metadata(&version_path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "tablespace directory \"{}\" does not exist, skipped",
                    version_path.display()
                );
                return Ok(0);
            }
            Err(e) => {
                return Err(BackupError::FileStatFailed {
                    path: version_path,
                    source: e,
                })
            }
        };

        let mut size =
            self.send_empty_dir(TABLESPACE_VERSION_DIRECTORY, &entry_stat(&meta), sizeonly)?;
        size += self.send_dir(&version_path, TABLESPACE_VERSION_DIRECTORY, ts.oid, sizeonly)?;
        Ok(size)
    }

    fn send_control_file(&mut self) -> Result<(), BackupError> {
        let path = self.datadir.join(XLOG_CONTROL_FILE);
        let meta = fs::metadata(&path).map_err(|e| BackupError::FileStatFailed {
            path: path.clone(),
            source: e,
        })?;
        self.send_file(
            XLOG_CONTROL_FILE,
            &path,
            &entry_stat(&meta),
            None,
            FileBackupMethod::Full,
            false,
        )?;
        Ok(())
    }

    fn estimate_main_size(
        &mut self,
        options: &BackupOptions,
        started: &crate::control::StartedBackup,
    ) -> Result<u64, BackupError> {
        let mut size = tar::entry_size(started.backup_label.len() as u64);
        if options.send_tablespace_map {
            size += tar::entry_size(started.tablespace_map.len() as u64);
        }
        let datadir = self.datadir;
        size += self.send_dir(datadir, "", None, true)?;
        let control_path = self.datadir.join(XLOG_CONTROL_FILE);
        if let Ok(meta) = fs::metadata(&control_path) {
            size += tar::entry_size(meta.len());
        }
        // archive terminator
        size += 1024;
        Ok(size)
    }

    /// Stream one file: tar header, optional incremental header, content,
    /// truncation pad, tar pad; record it in the manifest. Returns false
    /// when the file vanished and `missing_ok` allows that.
    fn send_file(
        &mut self,
        archive_name: &str,
        fs_path: &Path,
        stat: &EntryStat,
        relation: Option<RelationFile>,
        method: FileBackupMethod,
        missing_ok: bool,
    ) -> Result<bool, BackupError> {
        let mut file = match File::open(fs_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && missing_ok => {
                return Ok(false)
            }
            Err(e) => {
                return Err(BackupError::FileOpenFailed {
                    path: fs_path.to_owned(),
                    source: e,
                })
            }
        };

        let algorithm = self
            .manifest
            .as_ref()
            .map(|m| m.algorithm())
            .unwrap_or(ChecksumAlgorithm::None);
        let mut digest = ChecksumContext::new(algorithm);

        let mut verify = self.verify_checksums && relation.is_some();
        let base_blkno = relation.map(|r| r.segno * RELSEG_SIZE).unwrap_or(0);
        let mut failures = 0u64;

        let logical_size = match &method {
            FileBackupMethod::Full => stat.size,
            FileBackupMethod::Incremental { blocks, .. } => incremental::file_size(blocks.len()),
        };
        let mut header_stat = *stat;
        header_stat.size = logical_size;
        let header = tar::regular_header(archive_name, &header_stat)?;
        self.pipeline.push(&header)?;

        match method {
            FileBackupMethod::Full => {
                let buf_len = self.pipeline.buffer_len();
                let mut total_read = 0u64;
                loop {
                    // The stat-captured size is authoritative: bytes past
                    // it (concurrent extension) are not sent.
                    let want =
                        std::cmp::min(buf_len as u64, stat.size - total_read) as usize;
                    if want == 0 {
                        break;
                    }
                    let buf = self.pipeline.buffer();
                    let n = file.read(&mut buf[..want]).map_err(|e| {
                        BackupError::FileReadFailed {
                            path: fs_path.to_owned(),
                            source: e,
                        }
                    })?;
                    if n == 0 {
                        break;
                    }
                    if verify {
                        if n % BLCKSZ != 0 {
                            warn!(
                                "could not verify checksums in file \"{}\": read {} bytes, not a multiple of the page size",
                                fs_path.display(),
                                n
                            );
                            verify = false;
                        } else {
                            let first_blkno =
                                base_blkno + (total_read / BLCKSZ as u64) as u32;
                            let buf = self.pipeline.buffer();
                            verify_page_chunk(
                                &mut buf[..n],
                                &mut file,
                                fs_path,
                                total_read,
                                first_blkno,
                                self.start_lsn,
                                &mut failures,
                            )?;
                        }
                    }
                    let buf = self.pipeline.buffer();
                    digest.update(&buf[..n]);
                    self.pipeline.archive_contents(n)?;
                    total_read += n as u64;
                }

                // Concurrent truncation: pad to the captured size. The pad
                // is part of the manifest-described content.
                if total_read < stat.size {
                    let mut pad = stat.size - total_read;
                    let zeroes = [0u8; BLCKSZ];
                    while pad > 0 {
                        let n = std::cmp::min(pad, BLCKSZ as u64) as usize;
                        digest.update(&zeroes[..n]);
                        pad -= n as u64;
                    }
                    self.pipeline.push_zeroes((stat.size - total_read) as usize)?;
                }
            }
            FileBackupMethod::Incremental {
                blocks,
                truncation_block_length,
            } => {
                let header_bytes = incremental::write_header(&blocks, truncation_block_length);
                digest.update(&header_bytes);
                self.pipeline.push(&header_bytes)?;

                let mut truncated = false;
                for &block in &blocks {
                    let offset = block as u64 * BLCKSZ as u64;
                    let buf = self.pipeline.buffer();
                    let page = &mut buf[..BLCKSZ];
                    if truncated {
                        page.fill(0);
                    } else {
                        file.seek(SeekFrom::Start(offset)).map_err(|e| {
                            BackupError::FileReadFailed {
                                path: fs_path.to_owned(),
                                source: e,
                            }
                        })?;
                        if read_full(&mut file, page).map_err(|e| {
                            BackupError::FileReadFailed {
                                path: fs_path.to_owned(),
                                source: e,
                            }
                        })? {
                            if verify {
                                verify_page_chunk(
                                    page,
                                    &mut file,
                                    fs_path,
                                    offset,
                                    base_blkno + block,
                                    self.start_lsn,
                                    &mut failures,
                                )?;
                            }
                        } else {
                            // Mid-truncation: this and all remaining
                            // selected blocks become zero pages.
                            truncated = true;
                            page.fill(0);
                        }
                    }
                    let buf = self.pipeline.buffer();
                    digest.update(&buf[..BLCKSZ]);
                    self.pipeline.archive_contents(BLCKSZ)?;
                }
            }
        }

        // Tar padding is framing, not content: never digested.
        self.pipeline.push_zeroes(tar::padding_len(logical_size))?;

        let checksum = match algorithm {
            ChecksumAlgorithm::None => None,
            _ => Some(digest.finish()),
        };
        if let Some(manifest) = &mut self.manifest {
            manifest.add_file(
                archive_name,
                logical_size,
                UNIX_EPOCH + std::time::Duration::from_secs(stat.mtime),
                checksum.as_deref(),
            );
        }

        if failures > 0 {
            warn!(
                "file \"{}\" has a total of {} checksum verification failures",
                fs_path.display(),
                failures
            );
            let dboid = relation.and_then(|r| (r.dboid != 0).then_some(r.dboid));
            self.control.report_checksum_failures(dboid, failures);
            self.total_checksum_failures += failures;
        }
        Ok(true)
    }

    /// Stream a synthesized member: backup label, tablespace map, archive
    /// status markers, the manifest itself.
    fn send_file_with_content(
        &mut self,
        archive_name: &str,
        content: &[u8],
    ) -> Result<(), BackupError> {
        let stat = EntryStat {
            size: content.len() as u64,
            mode: PG_FILE_MODE_OWNER,
            uid: 0,
            gid: 0,
            mtime: now_secs(),
        };
        let header = tar::regular_header(archive_name, &stat)?;
        self.pipeline.push(&header)?;
        self.pipeline.push(content)?;
        self.pipeline
            .push_zeroes(tar::padding_len(content.len() as u64))?;

        if let Some(manifest) = &mut self.manifest {
            let checksum = match manifest.algorithm() {
                ChecksumAlgorithm::None => None,
                algorithm => {
                    let mut ctx = ChecksumContext::new(algorithm);
                    ctx.update(content);
                    Some(ctx.finish())
                }
            };
            manifest.add_file(
                archive_name,
                stat.size,
                SystemTime::now(),
                checksum.as_deref(),
            );
        }
        Ok(())
    }

    /// Stream the WAL segments spanning the backup, plus any timeline
    /// history files, into the still-open main archive. Returns the
    /// history file names for the manifest's WAL range.
    fn send_wal_range(
        &mut self,
        start_lsn: Lsn,
        start_tli: TimeLineID,
        end_lsn: Lsn,
    ) -> Result<Vec<String>, BackupError> {
        let seg_size = self.control.wal_segment_size();
        let start_seg = XLByteToSeg(start_lsn, seg_size);
        let end_seg = XLByteToPrevSeg(end_lsn, seg_size);
        let wal_dir = self.datadir.join(XLOGDIR);

        let mut wal_files: Vec<(XLogSegNo, TimeLineID, String)> = Vec::new();
        let mut history: Vec<String> = Vec::new();
        let rd = fs::read_dir(&wal_dir).map_err(|e| BackupError::FileOpenFailed {
            path: wal_dir.clone(),
            source: e,
        })?;
        for entry in rd {
            self.check_interrupts()?;
            let entry = entry.map_err(|e| BackupError::FileReadFailed {
                path: wal_dir.clone(),
                source: e,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if IsXLogFileName(&name) {
                let (segno, tli) = XLogFromFileName(&name, seg_size);
                if (start_seg..=end_seg).contains(&segno) {
                    wal_files.push((segno, tli, name));
                }
            } else if IsTLHistoryFileName(&name) {
                history.push(name);
            }
        }

        if wal_files.is_empty() {
            self.control.wal_removed_check(start_seg, start_tli)?;
            return Err(BackupError::WalGap(
                "could not find any WAL files".to_owned(),
            ));
        }

        // Ordering and contiguity go by segment number alone; the timeline
        // prefix is ignored, so a gapless range spanning a timeline switch
        // passes.
        wal_files.sort_by_key(|(segno, _, _)| *segno);
        wal_files.dedup_by_key(|(segno, _, _)| *segno);

        let mut expected = start_seg;
        for (segno, tli, _) in &wal_files {
            if *segno != expected {
                return Err(BackupError::WalGap(format!(
                    "could not find WAL file \"{}\"",
                    XLogFileName(*tli, expected, seg_size)
                )));
            }
            expected += 1;
        }
        if wal_files.last().unwrap().0 != end_seg {
            let (_, tli, _) = *wal_files.last().unwrap();
            return Err(BackupError::WalGap(format!(
                "could not find WAL file \"{}\"",
                XLogFileName(tli, end_seg, seg_size)
            )));
        }

        for (segno, tli, name) in &wal_files {
            self.check_interrupts()?;
            self.control.wal_removed_check(*segno, *tli)?;

            let path = wal_dir.join(name);
            let meta = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(BackupError::WalRemoved(name.clone()))
                }
                Err(e) => {
                    return Err(BackupError::FileStatFailed {
                        path,
                        source: e,
                    })
                }
            };
            if meta.len() != seg_size as u64 {
                // Maybe it was recycled under us; prefer that report.
                self.control.wal_removed_check(*segno, *tli)?;
                return Err(BackupError::WalSizeWrong {
                    path: format!("{XLOGDIR}/{name}"),
                    size: meta.len(),
                    expected: seg_size as u64,
                });
            }

            self.send_file(
                &format!("{XLOGDIR}/{name}"),
                &path,
                &entry_stat(&meta),
                None,
                FileBackupMethod::Full,
                false,
            )?;
            self.send_file_with_content(
                &format!("{XLOGDIR}/archive_status/{name}.done"),
                b"",
            )?;
        }

        history.sort();
        for name in &history {
            self.check_interrupts()?;
            let path = wal_dir.join(name);
            let meta = fs::metadata(&path).map_err(|e| BackupError::FileStatFailed {
                path: path.clone(),
                source: e,
            })?;
            self.send_file(
                &format!("{XLOGDIR}/{name}"),
                &path,
                &entry_stat(&meta),
                None,
                FileBackupMethod::Full,
                false,
            )?;
            self.send_file_with_content(
                &format!("{XLOGDIR}/archive_status/{name}.done"),
                b"",
            )?;
        }

        Ok(history)
    }
}

/// Tablespace and database OIDs governing relation files directly inside
/// the directory `dir_rel`, if any.
fn relation_context(dir_rel: &str, spcoid: Option<u32>) -> Option<(u32, u32)> {
    match spcoid {
        None => {
            if dir_rel == "global" {
                return Some((GLOBALTABLESPACE_OID, 0));
            }
            if let Some(db) = dir_rel.strip_prefix("base/") {
                if let Ok(dboid) = db.parse::<u32>() {
                    return Some((DEFAULTTABLESPACE_OID, dboid));
                }
            }
            None
        }
        Some(spc) => {
            let mut parts = dir_rel.split('/');
            if parts.next() == Some(TABLESPACE_VERSION_DIRECTORY) {
                if let (Some(db), None) = (parts.next(), parts.next()) {
                    if let Ok(dboid) = db.parse::<u32>() {
                        return Some((spc, dboid));
                    }
                }
            }
            None
        }
    }
}

fn entry_stat(meta: &fs::Metadata) -> EntryStat {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        EntryStat {
            size: meta.len(),
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            mtime: meta.mtime().max(0) as u64,
        }
    }
    #[cfg(not(unix))]
    {
        EntryStat {
            size: meta.len(),
            mode: PG_FILE_MODE_OWNER,
            uid: 0,
            gid: 0,
            mtime: meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fill `buf` completely from the current position. Returns false on a
/// short read (end of file).
fn read_full(file: &mut File, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

/// Verify page checksums over one chunk of a relation file sitting in the
/// buffer. A mismatched page is re-read once to absorb a torn concurrent
/// write; a persistent mismatch counts as a failure. At most
/// `CHECKSUM_WARNINGS_PER_FILE` warnings are logged per file.
fn verify_page_chunk(
    buf: &mut [u8],
    file: &mut File,
    path: &Path,
    chunk_offset: u64,
    first_blkno: u32,
    start_lsn: Lsn,
    failures_in_file: &mut u64,
) -> Result<(), BackupError> {
    let mut reread = false;
    let npages = buf.len() / BLCKSZ;
    for i in 0..npages {
        let page = &mut buf[i * BLCKSZ..(i + 1) * BLCKSZ];
        let blkno = first_blkno + i as u32;

        if page_ok(page, blkno, start_lsn) {
            continue;
        }

        // Possibly a torn write: re-read this one page and check again.
        let page_offset = chunk_offset + (i * BLCKSZ) as u64;
        file.seek(SeekFrom::Start(page_offset)).map_err(|e| {
            BackupError::FileReadFailed {
                path: path.to_owned(),
                source: e,
            }
        })?;
        reread = true;
        let complete = read_full(file, page).map_err(|e| BackupError::FileReadFailed {
            path: path.to_owned(),
            source: e,
        })?;
        if !complete {
            // Truncated under us; the sender's padding logic covers it.
            continue;
        }
        if page_ok(page, blkno, start_lsn) {
            continue;
        }

        *failures_in_file += 1;
        if *failures_in_file <= CHECKSUM_WARNINGS_PER_FILE {
            warn!(
                "checksum verification failed in file \"{}\", block {}: calculated {:#06X} but expected {:#06X}",
                path.display(),
                blkno,
                page_checksum::pg_checksum_page(page, blkno),
                page_checksum::page_stored_checksum(page),
            );
        }
        if *failures_in_file == CHECKSUM_WARNINGS_PER_FILE {
            warn!(
                "further checksum verification failures in file \"{}\" will not be reported",
                path.display()
            );
        }
    }
    if reread {
        // Put the sequential read position back where the caller left it.
        file.seek(SeekFrom::Start(chunk_offset + buf.len() as u64))
            .map_err(|e| BackupError::FileReadFailed {
                path: path.to_owned(),
                source: e,
            })?;
    }
    Ok(())
}

/// A page passes if it is verifiable-and-correct, or not verifiable at
/// all: new pages carry no checksum, and pages stamped at or after the
/// backup start will be replayed from WAL anyway.
fn page_ok(page: &[u8], blkno: u32, start_lsn: Lsn) -> bool {
    if page_checksum::page_is_new(page) {
        return true;
    }
    if page_checksum::page_lsn(page) >= start_lsn {
        return true;
    }
    page_checksum::pg_checksum_page(page, blkno) == page_checksum::page_stored_checksum(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_context() {
        assert_eq!(
            relation_context("global", None),
            Some((GLOBALTABLESPACE_OID, 0))
        );
        assert_eq!(
            relation_context("base/5", None),
            Some((DEFAULTTABLESPACE_OID, 5))
        );
        assert_eq!(relation_context("base/notanoid", None), None);
        assert_eq!(relation_context("", None), None);
        assert_eq!(relation_context("pg_tblspc", None), None);

        let in_ts = format!("{TABLESPACE_VERSION_DIRECTORY}/12345");
        assert_eq!(relation_context(&in_ts, Some(16400)), Some((16400, 12345)));
        assert_eq!(relation_context("base/5", Some(16400)), None);
        assert_eq!(
            relation_context(&format!("{in_ts}/deeper"), Some(16400)),
            None
        );
    }

    #[test]
    fn test_exclusion_lists() {
        assert!(EXCLUDE_DIR_CONTENTS.contains(&"pg_replslot"));
        assert!(EXCLUDE_FILES.contains(&"postmaster.pid"));
        assert!(!EXCLUDE_FILES.contains(&"PG_VERSION"));
    }

    #[test]
    fn test_page_ok_skip_rules() {
        use byteorder::{ByteOrder, LittleEndian};
        let mut page = vec![0u8; BLCKSZ];
        // new page: always ok
        assert!(page_ok(&page, 0, Lsn(0x100)));
        // initialized page with a bad checksum but LSN past backup start
        LittleEndian::write_u32(&mut page[4..8], 0x500);
        LittleEndian::write_u16(&mut page[14..16], 128);
        assert!(page_ok(&page, 0, Lsn(0x100)));
        // same page, backup started later: checksum now matters
        assert!(!page_ok(&page, 0, Lsn(0x1000)));
        crate::page_checksum::set_page_checksum(&mut page, 0);
        assert!(page_ok(&page, 0, Lsn(0x1000)));
    }
}
