//! Backup request option parsing.
//!
//! The orchestrator receives options as an ordered name/value list, the way
//! the replication command surface delivers them. Duplicates, unknown
//! names, out-of-range numerics, and inconsistent combinations are all user
//! errors.

use std::path::PathBuf;
use std::str::FromStr;

use crate::checksum::ChecksumAlgorithm;
use crate::error::BackupError;

pub const MAX_RATE_LOWER: u32 = 32;
pub const MAX_RATE_UPPER: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Fast,
    Spread,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOption {
    No,
    Yes,
    ForceEncode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionDetail {
    pub level: Option<i32>,
    pub workers: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupTarget {
    /// Stream to the requesting session.
    Client,
    /// Write archives to a directory on the server.
    Server(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub label: String,
    pub progress: bool,
    pub checkpoint: CheckpointMode,
    pub wait_for_wal_archive: bool,
    pub include_wal: bool,
    pub incremental: bool,
    /// KiB/second; 0 means unthrottled.
    pub max_rate_kib: u32,
    pub send_tablespace_map: bool,
    pub verify_checksums: bool,
    pub manifest: ManifestOption,
    pub manifest_checksum: ChecksumAlgorithm,
    pub compression: CompressionAlgorithm,
    pub compression_detail: CompressionDetail,
    pub target: BackupTarget,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            label: "base backup".to_owned(),
            progress: false,
            checkpoint: CheckpointMode::Spread,
            wait_for_wal_archive: true,
            include_wal: false,
            incremental: false,
            max_rate_kib: 0,
            send_tablespace_map: false,
            verify_checksums: true,
            manifest: ManifestOption::No,
            manifest_checksum: ChecksumAlgorithm::Crc32c,
            compression: CompressionAlgorithm::None,
            compression_detail: CompressionDetail::default(),
            target: BackupTarget::Client,
        }
    }
}

fn invalid(msg: impl Into<String>) -> BackupError {
    BackupError::OptionInvalid(msg.into())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, BackupError> {
    match value {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => Err(invalid(format!("{name} requires a Boolean value"))),
    }
}

/// Parse the option list into a validated [`BackupOptions`].
pub fn parse_backup_options(options: &[(&str, &str)]) -> Result<BackupOptions, BackupError> {
    let mut opt = BackupOptions::default();
    let mut seen: Vec<&str> = Vec::new();
    let mut target: Option<&str> = None;
    let mut target_detail: Option<&str> = None;
    let mut compression_detail: Option<&str> = None;
    let mut manifest_checksums_seen = false;

    for &(name, value) in options {
        if seen.contains(&name) {
            return Err(invalid(format!("duplicate option \"{name}\"")));
        }
        seen.push(name);

        match name {
            "label" => opt.label = value.to_owned(),
            "progress" => opt.progress = parse_bool(name, value)?,
            "checkpoint" => {
                opt.checkpoint = match value {
                    "fast" => CheckpointMode::Fast,
                    "spread" => CheckpointMode::Spread,
                    _ => {
                        return Err(invalid(format!(
                            "unrecognized checkpoint type: \"{value}\""
                        )))
                    }
                }
            }
            "wait" => opt.wait_for_wal_archive = parse_bool(name, value)?,
            "wal" => opt.include_wal = parse_bool(name, value)?,
            "incremental" => opt.incremental = parse_bool(name, value)?,
            "max_rate" => {
                let rate: u32 = value
                    .parse()
                    .map_err(|_| invalid(format!("{name} requires an integer value")))?;
                if rate != 0 && !(MAX_RATE_LOWER..=MAX_RATE_UPPER).contains(&rate) {
                    return Err(invalid(format!(
                        "transfer rate {rate} is out of range ({MAX_RATE_LOWER}..{MAX_RATE_UPPER} kB/s)"
                    )));
                }
                opt.max_rate_kib = rate;
            }
            "tablespace_map" => opt.send_tablespace_map = parse_bool(name, value)?,
            "verify_checksums" => opt.verify_checksums = parse_bool(name, value)?,
            "manifest" => {
                opt.manifest = match value {
                    "force-encode" => ManifestOption::ForceEncode,
                    _ => {
                        if parse_bool(name, value)? {
                            ManifestOption::Yes
                        } else {
                            ManifestOption::No
                        }
                    }
                }
            }
            "manifest_checksums" => {
                manifest_checksums_seen = true;
                opt.manifest_checksum =
                    ChecksumAlgorithm::from_str(value).map_err(|e| invalid(e))?;
            }
            "target" => target = Some(value),
            "target_detail" => target_detail = Some(value),
            "compression" => {
                opt.compression = match value {
                    "none" => CompressionAlgorithm::None,
                    "gzip" => CompressionAlgorithm::Gzip,
                    "lz4" => CompressionAlgorithm::Lz4,
                    "zstd" => CompressionAlgorithm::Zstd,
                    _ => {
                        return Err(invalid(format!(
                            "unrecognized compression algorithm: \"{value}\""
                        )))
                    }
                }
            }
            "compression_detail" => compression_detail = Some(value),
            _ => return Err(invalid(format!("unrecognized base backup option: \"{name}\""))),
        }
    }

    opt.target = match (target, target_detail) {
        (None, None) | (Some("client"), None) => BackupTarget::Client,
        (Some("client"), Some(_)) => {
            return Err(invalid("target \"client\" does not accept a target detail"))
        }
        (Some("server"), Some(path)) => BackupTarget::Server(PathBuf::from(path)),
        (Some("server"), None) => {
            return Err(invalid("target \"server\" requires a target detail"))
        }
        (Some(other), _) => return Err(invalid(format!("unrecognized target: \"{other}\""))),
        (None, Some(_)) => return Err(invalid("target detail requires a target")),
    };

    if manifest_checksums_seen && opt.manifest == ManifestOption::No {
        return Err(invalid(
            "manifest checksums require a backup manifest",
        ));
    }

    if let Some(detail) = compression_detail {
        if opt.compression == CompressionAlgorithm::None {
            return Err(invalid(
                "compression detail cannot be specified unless compression is enabled",
            ));
        }
        opt.compression_detail = parse_compression_detail(opt.compression, detail)?;
    }

    Ok(opt)
}

/// Parse a detail string like "level=5" or "workers=3,level=9".
fn parse_compression_detail(
    algorithm: CompressionAlgorithm,
    detail: &str,
) -> Result<CompressionDetail, BackupError> {
    let mut result = CompressionDetail::default();
    for item in detail.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (key, value) = match item.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            // a bare integer is shorthand for the level
            None => ("level", item),
        };
        match key {
            "level" => {
                let level: i32 = value
                    .parse()
                    .map_err(|_| invalid("compression level must be an integer"))?;
                let range = match algorithm {
                    CompressionAlgorithm::Gzip => 1..=9,
                    CompressionAlgorithm::Zstd => 1..=22,
                    // lz4 frame compression takes no level knob here
                    CompressionAlgorithm::Lz4 => {
                        return Err(invalid(
                            "compression algorithm \"lz4\" does not accept a compression level",
                        ))
                    }
                    CompressionAlgorithm::None => unreachable!(),
                };
                if !range.contains(&level) {
                    return Err(invalid(format!(
                        "compression level {level} is out of range for algorithm"
                    )));
                }
                result.level = Some(level);
            }
            "workers" => {
                if algorithm != CompressionAlgorithm::Zstd {
                    return Err(invalid(
                        "compression algorithm does not accept a worker count",
                    ));
                }
                result.workers = value
                    .parse()
                    .map_err(|_| invalid("compression workers must be an integer"))?;
            }
            _ => {
                return Err(invalid(format!(
                    "unrecognized compression option: \"{key}\""
                )))
            }
        }
    }
    Ok(result)
}
