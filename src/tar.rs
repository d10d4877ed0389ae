//! ustar archive framing: headers, padding, terminators.
//!
//! Only the subset of the format the backup stream needs: regular files,
//! directories, and symlinks, all with numeric owner fields. Names over 99
//! bytes and link targets over 99 bytes are rejected rather than split into
//! the prefix field, matching the server-side tar writer this models.

use crate::error::BackupError;
use crate::pg_constants::TAR_BLOCK_SIZE;

pub const ZERO_BLOCK: [u8; TAR_BLOCK_SIZE] = [0u8; TAR_BLOCK_SIZE];

/// Stat fields a tar header carries. Callers capture these once per file;
/// the captured size is authoritative even if the file changes afterwards.
#[derive(Debug, Clone, Copy)]
pub struct EntryStat {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Seconds since the epoch.
    pub mtime: u64,
}

/// Rewrite a symlink-typed stat so the path can be emitted as an empty
/// directory instead (in-place tablespaces, excluded-content directories).
pub fn convert_link_to_directory(stat: &mut EntryStat) {
    stat.mode = crate::pg_constants::PG_DIR_MODE_OWNER;
    stat.size = 0;
}

/// Zero padding needed after `len` content bytes to reach a block boundary.
pub fn padding_len(len: u64) -> usize {
    ((TAR_BLOCK_SIZE as u64 - (len % TAR_BLOCK_SIZE as u64)) % TAR_BLOCK_SIZE as u64) as usize
}

/// Archive size of one member: header block plus content rounded up.
pub fn entry_size(content_len: u64) -> u64 {
    TAR_BLOCK_SIZE as u64 + content_len + padding_len(content_len) as u64
}

pub fn regular_header(name: &str, stat: &EntryStat) -> Result<[u8; 512], BackupError> {
    create_header(name, None, b'0', stat.size, stat)
}

pub fn directory_header(name: &str, stat: &EntryStat) -> Result<[u8; 512], BackupError> {
    // Directory names carry a trailing slash and zero size.
    let name = format!("{}/", name.trim_end_matches('/'));
    create_header(&name, None, b'5', 0, stat)
}

pub fn symlink_header(
    name: &str,
    target: &str,
    stat: &EntryStat,
) -> Result<[u8; 512], BackupError> {
    if target.len() > 99 {
        return Err(BackupError::SymlinkTooLong(name.to_owned()));
    }
    create_header(name, Some(target), b'2', 0, stat)
}

fn create_header(
    name: &str,
    link_target: Option<&str>,
    typeflag: u8,
    size: u64,
    stat: &EntryStat,
) -> Result<[u8; 512], BackupError> {
    if name.len() > 99 {
        return Err(BackupError::NameTooLong(name.to_owned()));
    }

    let mut h = [0u8; 512];
    h[0..name.len()].copy_from_slice(name.as_bytes());

    write_octal(&mut h[100..108], stat.mode as u64 & 0o7777, 7);
    write_octal(&mut h[108..116], stat.uid as u64, 7);
    write_octal(&mut h[116..124], stat.gid as u64, 7);
    write_octal(&mut h[124..136], size, 11);
    write_octal(&mut h[136..148], stat.mtime, 11);

    h[156] = typeflag;
    if let Some(target) = link_target {
        h[157..157 + target.len()].copy_from_slice(target.as_bytes());
    }

    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");
    h[265..265 + 8].copy_from_slice(b"postgres");
    h[297..297 + 8].copy_from_slice(b"postgres");
    write_octal(&mut h[329..337], 0, 7);
    write_octal(&mut h[337..345], 0, 7);

    // Checksum is computed with the checksum field itself space-filled,
    // then stored as six octal digits, NUL, space.
    h[148..156].copy_from_slice(b"        ");
    let sum: u64 = h.iter().map(|b| *b as u64).sum();
    write_octal(&mut h[148..155], sum, 6);
    h[155] = 0;

    Ok(h)
}

/// Zero-padded octal of `digits` characters followed by a space, the
/// conventional tar numeric field encoding.
fn write_octal(field: &mut [u8], value: u64, digits: usize) {
    let s = format!("{value:0width$o} ", width = digits);
    field[..digits + 1].copy_from_slice(s.as_bytes());
}
