//!
//! Common utilities for dealing with PostgreSQL relation files.
//!
use once_cell::sync::Lazy;
use regex::Regex;

use crate::pg_constants;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
    #[error("invalid relation data file name")]
    InvalidFileName,
}

impl From<core::num::ParseIntError> for FilePathError {
    fn from(_e: core::num::ParseIntError) -> Self {
        FilePathError::InvalidFileName
    }
}

/// Convert Postgres relation file's fork suffix to fork number.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        // "main" is not in filenames, it's implicit if the fork name is not present
        None => Ok(pg_constants::MAIN_FORKNUM),
        Some("fsm") => Ok(pg_constants::FSM_FORKNUM),
        Some("vm") => Ok(pg_constants::VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(pg_constants::INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

/// Convert Postgres fork number to the right suffix of the relation data file.
pub fn forknumber_to_name(forknum: u8) -> Option<&'static str> {
    match forknum {
        pg_constants::MAIN_FORKNUM => None,
        pg_constants::FSM_FORKNUM => Some("fsm"),
        pg_constants::VISIBILITYMAP_FORKNUM => Some("vm"),
        pg_constants::INIT_FORKNUM => Some("init"),
        _ => panic!("unrecognized fork number"),
    }
}

static RELFILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<relnode>\d+)(_(?P<forkname>[a-z]+))?(\.(?P<segno>\d+))?$").unwrap()
});

///
/// Parse a filename of a relation file. Returns (relfilenode, forknum, segno) tuple.
///
/// Formats:
/// <oid>
/// <oid>_<fork name>
/// <oid>.<segment number>
/// <oid>_<fork name>.<segment number>
///
/// See functions relpath() and _mdfd_segpath() in PostgreSQL sources.
///
pub fn parse_relfilename(fname: &str) -> Result<(u32, u8, u32), FilePathError> {
    let caps = RELFILE_RE
        .captures(fname)
        .ok_or(FilePathError::InvalidFileName)?;

    let relnode_str = caps.name("relnode").unwrap().as_str();
    let relnode = relnode_str.parse::<u32>()?;

    let forkname = caps.name("forkname").map(|f| f.as_str());
    let forknum = forkname_to_number(forkname)?;

    let segno = match caps.name("segno") {
        None => 0,
        Some(m) => m.as_str().parse::<u32>()?,
    };

    Ok((relnode, forknum, segno))
}

static TEMP_RELFILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^t\d+_\d+(_[a-z]+)?(\.\d+)?$").unwrap());

/// Does this look like a temporary relation file name? Mimics
/// looks_like_temp_rel_name() in PostgreSQL. Temporary relations live in
/// database directories alongside regular ones, prefixed with `t<backend>_`.
pub fn looks_like_temp_rel_name(fname: &str) -> bool {
    TEMP_RELFILE_RE.is_match(fname)
}

/// The basename an init fork sibling would have for this relation file, or
/// None if the file is itself an init fork (init forks are never excluded).
/// Used to skip the other forks of unlogged relations.
pub fn init_fork_sibling(fname: &str) -> Option<String> {
    let (relnode, forknum, _segno) = parse_relfilename(fname).ok()?;
    if forknum == pg_constants::INIT_FORKNUM {
        return None;
    }
    Some(format!("{relnode}_init"))
}
