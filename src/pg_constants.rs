//!
//! Misc constants, copied from PostgreSQL headers.
//!
//! Only the ones the backup path cares about live here; it's nice to have
//! them in one place with the ability to add comments.
//!

/// Size of a data page, in bytes.
pub const BLCKSZ: usize = 8192;

/// Relation segment size, in blocks (1 GiB worth of 8 KiB pages).
pub const RELSEG_SIZE: u32 = 1024 * 1024 * 1024 / BLCKSZ as u32;

/// Default WAL segment size. The actual size for a cluster comes from the
/// control surface; this is only used as a fallback in tests.
pub const DEFAULT_WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Size of one tar block. Everything in a tar stream is padded to this.
pub const TAR_BLOCK_SIZE: usize = 512;

//
// From pg_tablespace_d.h
//
pub const DEFAULTTABLESPACE_OID: u32 = 1663;
pub const GLOBALTABLESPACE_OID: u32 = 1664;

pub const INVALID_OID: u32 = 0;

//
// Fork numbers, from relpath.h
//
pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

//
// Well-known paths inside the data directory.
//
pub const XLOG_CONTROL_FILE: &str = "global/pg_control";
pub const BACKUP_LABEL_FILE: &str = "backup_label";
pub const TABLESPACE_MAP: &str = "tablespace_map";
pub const BACKUP_MANIFEST_FILE: &str = "backup_manifest";
pub const XLOGDIR: &str = "pg_wal";
pub const TABLESPACE_DIR: &str = "pg_tblspc";

/// Name of the per-major-version directory inside a tablespace location.
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_17_202406281";

/// Prefix of temporary files and temporary-sort directories.
pub const PG_TEMP_FILE_PREFIX: &str = "pgsql_tmp";

/// Default file and directory creation modes, from file_perm.h.
pub const PG_FILE_MODE_OWNER: u32 = 0o600;
pub const PG_DIR_MODE_OWNER: u32 = 0o700;

/// Magic number at the start of an incremental relation file,
/// from basebackup.h.
pub const INCREMENTAL_MAGIC: u32 = 0xd3ae1f0d;

/// Prefix of an incrementally-sent relation file inside the archive.
pub const INCREMENTAL_PREFIX: &str = "INCREMENTAL.";
