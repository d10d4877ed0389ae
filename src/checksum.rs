//! Whole-file digests for the backup manifest.
//!
//! Each file streamed into the backup gets an incrementally-updated digest
//! over exactly the bytes the manifest describes: incremental header (if
//! any), file content, and the zero pad covering a concurrent truncation.
//! Tar framing bytes are never digested.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    None,
    Crc32c,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumAlgorithm {
    /// Tag used in the manifest's Checksum-Algorithm field.
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::None => "NONE",
            ChecksumAlgorithm::Crc32c => "CRC32C",
            ChecksumAlgorithm::Sha224 => "SHA224",
            ChecksumAlgorithm::Sha256 => "SHA256",
            ChecksumAlgorithm::Sha384 => "SHA384",
            ChecksumAlgorithm::Sha512 => "SHA512",
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(ChecksumAlgorithm::None),
            "crc32c" => Ok(ChecksumAlgorithm::Crc32c),
            "sha224" => Ok(ChecksumAlgorithm::Sha224),
            "sha256" => Ok(ChecksumAlgorithm::Sha256),
            "sha384" => Ok(ChecksumAlgorithm::Sha384),
            "sha512" => Ok(ChecksumAlgorithm::Sha512),
            _ => Err(format!("unrecognized checksum algorithm: \"{s}\"")),
        }
    }
}

/// Incremental digest context. `None` swallows updates and yields an empty
/// digest, so senders don't have to special-case the disabled state.
pub enum ChecksumContext {
    None,
    Crc32c(u32),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl ChecksumContext {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::None => ChecksumContext::None,
            ChecksumAlgorithm::Crc32c => ChecksumContext::Crc32c(0),
            ChecksumAlgorithm::Sha224 => ChecksumContext::Sha224(Sha224::new()),
            ChecksumAlgorithm::Sha256 => ChecksumContext::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha384 => ChecksumContext::Sha384(Sha384::new()),
            ChecksumAlgorithm::Sha512 => ChecksumContext::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumContext::None => {}
            ChecksumContext::Crc32c(crc) => *crc = crc32c::crc32c_append(*crc, data),
            ChecksumContext::Sha224(h) => h.update(data),
            ChecksumContext::Sha256(h) => h.update(data),
            ChecksumContext::Sha384(h) => h.update(data),
            ChecksumContext::Sha512(h) => h.update(data),
        }
    }

    /// Finish the digest. CRC32C is rendered little-endian, matching the
    /// in-memory layout the manifest consumers expect.
    pub fn finish(self) -> Vec<u8> {
        match self {
            ChecksumContext::None => Vec::new(),
            ChecksumContext::Crc32c(crc) => crc.to_le_bytes().to_vec(),
            ChecksumContext::Sha224(h) => h.finalize().to_vec(),
            ChecksumContext::Sha256(h) => h.finalize().to_vec(),
            ChecksumContext::Sha384(h) => h.finalize().to_vec(),
            ChecksumContext::Sha512(h) => h.finalize().to_vec(),
        }
    }
}
