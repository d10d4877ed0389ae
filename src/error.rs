//! Error type for the backup subsystem.

use std::io;
use std::path::PathBuf;

/// Errors surfaced to the caller of a base backup. Recoverable anomalies
/// (torn pages, concurrent truncation, ENOENT on optional files) are handled
/// inside the senders and never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("a backup is already in progress in this session")]
    SessionBusy,

    #[error("{0}")]
    OptionInvalid(String),

    #[error("the standby was promoted during online backup")]
    PromotedDuringBackup,

    #[error("incremental backup requires an uploaded manifest from a prior backup")]
    MissingManifest,

    #[error("WAL file \"{0}\" has been removed")]
    WalRemoved(String),

    #[error("{0}")]
    WalGap(String),

    #[error("unexpected WAL file size: \"{path}\" is {size} bytes, expected {expected}")]
    WalSizeWrong {
        path: String,
        size: u64,
        expected: u64,
    },

    #[error("could not open file \"{path}\": {source}")]
    FileOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not read file \"{path}\": {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not stat file \"{path}\": {source}")]
    FileStatFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("file name too long for tar format: \"{0}\"")]
    NameTooLong(String),

    #[error("symbolic link target too long for tar format: \"{0}\"")]
    SymlinkTooLong(String),

    #[error("checksum verification failure during base backup: {0} total failures")]
    DataCorrupted(u64),

    #[error("backup was interrupted")]
    Interrupted,

    /// Failure writing to the backup destination (client channel, server
    /// file, or a compression stage in between).
    #[error("could not write backup data: {0}")]
    Io(#[from] io::Error),
}
