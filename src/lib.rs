//!
//! Online physical base backups for a PostgreSQL-style cluster.
//!
//! While the database keeps accepting writes, [`perform_base_backup`]
//! streams a self-consistent snapshot of the data directory and every
//! auxiliary tablespace as ustar archives, optionally followed by the WAL
//! range that makes the snapshot recoverable and a manifest describing
//! every file sent. Output flows through a composable sink stack
//! (compression, throttling, progress reporting, client or server-side
//! delivery), and relation pages can be checksum-verified on the way out.
//! Incremental mode replaces little-changed relation files with a sparse
//! representation against a prior backup's manifest.
//!

pub mod basebackup;
pub mod checksum;
pub mod compression;
pub mod control;
pub mod error;
pub mod incremental;
pub mod lsn;
pub mod manifest;
pub mod options;
pub mod page_checksum;
pub mod pg_constants;
pub mod relfile_utils;
pub mod sink;
pub mod tar;
pub mod xlog_utils;

pub use basebackup::{perform_base_backup, target_sink, BackupEnvironment};
pub use error::BackupError;
pub use options::{parse_backup_options, BackupOptions};
