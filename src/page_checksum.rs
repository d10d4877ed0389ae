//!
//! Data page checksums, following PostgreSQL's checksum_impl.h.
//!
//! The algorithm is an FNV-1a derivative computed as 32 parallel sums over
//! the page, with two extra mixing rounds at the end, folded to 16 bits and
//! offset by one so that zero never appears as a valid checksum. The block
//! number is mixed in so that pages transposed between blocks fail
//! verification.
//!

use byteorder::{ByteOrder, LittleEndian};

use crate::lsn::Lsn;
use crate::pg_constants::BLCKSZ;

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

/// Base offsets to initialize each of the parallel FNV hashes with.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

// Offsets into the page header, from bufpage.h. pd_lsn occupies the first
// eight bytes as two 32-bit halves.
const PD_CHECKSUM_OFFSET: usize = 8;
const PD_UPPER_OFFSET: usize = 14;

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/// A page is "new" (never initialized) if pd_upper is zero. New pages carry
/// no checksum and cannot be verified.
pub fn page_is_new(page: &[u8]) -> bool {
    LittleEndian::read_u16(&page[PD_UPPER_OFFSET..PD_UPPER_OFFSET + 2]) == 0
}

/// LSN of the last WAL record that touched this page.
pub fn page_lsn(page: &[u8]) -> Lsn {
    let hi = LittleEndian::read_u32(&page[0..4]);
    let lo = LittleEndian::read_u32(&page[4..8]);
    Lsn(((hi as u64) << 32) | lo as u64)
}

/// Checksum currently stored in the page header.
pub fn page_stored_checksum(page: &[u8]) -> u16 {
    LittleEndian::read_u16(&page[PD_CHECKSUM_OFFSET..PD_CHECKSUM_OFFSET + 2])
}

/// Compute the checksum for a page at the given absolute block number.
///
/// The pd_checksum field itself is treated as zero while summing, so the
/// caller does not have to mask it out of the buffer first.
pub fn pg_checksum_page(page: &[u8], blkno: u32) -> u16 {
    assert_eq!(page.len(), BLCKSZ);

    let mut sums = CHECKSUM_BASE_OFFSETS;

    // The page is summed as BLCKSZ / (4 * N_SUMS) rows of N_SUMS 32-bit
    // words each, one word per parallel sum.
    let words_per_row = N_SUMS;
    let rows = BLCKSZ / (4 * words_per_row);
    for row in 0..rows {
        for j in 0..words_per_row {
            let off = (row * words_per_row + j) * 4;
            let mut value = LittleEndian::read_u32(&page[off..off + 4]);
            if off == PD_CHECKSUM_OFFSET & !3 {
                // Mask out the stored checksum (low half of this word).
                value &= 0xFFFF0000;
            }
            sums[j] = checksum_comp(sums[j], value);
        }
    }

    // Two extra rounds of zeroes for input-length extension.
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    let mut checksum: u32 = 0;
    for sum in sums {
        checksum ^= sum;
    }

    // Mix in the block number, then fold to 16 bits avoiding zero.
    checksum ^= blkno;
    ((checksum % 65535) + 1) as u16
}

/// Stamp a page with its checksum. Used when constructing pages, and by
/// tests building synthetic relation files.
pub fn set_page_checksum(page: &mut [u8], blkno: u32) {
    let checksum = pg_checksum_page(page, blkno);
    LittleEndian::write_u16(
        &mut page[PD_CHECKSUM_OFFSET..PD_CHECKSUM_OFFSET + 2],
        checksum,
    );
}
