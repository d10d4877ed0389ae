//
// This file contains common utilities for dealing with PostgreSQL WAL files
// and LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

use crate::lsn::Lsn;

pub const XLOG_FNAME_LEN: usize = 24;

pub type TimeLineID = u32;
pub type XLogSegNo = u64;

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    0x100000000u64 / wal_segsz_bytes as u64
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, log_seg_no: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        log_seg_no / XLogSegmentsPerXLogId(wal_segsz_bytes),
        log_seg_no % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> (XLogSegNo, TimeLineID) {
    let tli = u32::from_str_radix(&fname[0..8], 16).unwrap();
    let log = u32::from_str_radix(&fname[8..16], 16).unwrap() as XLogSegNo;
    let seg = u32::from_str_radix(&fname[16..24], 16).unwrap() as XLogSegNo;
    (log * XLogSegmentsPerXLogId(wal_seg_size) + seg, tli)
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

#[allow(non_snake_case)]
pub fn IsPartialXLogFileName(fname: &str) -> bool {
    fname.ends_with(".partial") && IsXLogFileName(&fname[0..fname.len() - 8])
}

/// Timeline history files are named `<tli>.history`, where `<tli>` is the
/// 8-character hex timeline ID.
#[allow(non_snake_case)]
pub fn IsTLHistoryFileName(fname: &str) -> bool {
    fname.len() == 8 + ".history".len()
        && fname.ends_with(".history")
        && fname[0..8].chars().all(|c| c.is_ascii_hexdigit())
}

/// Segment containing the given LSN, mimicking XLByteToSeg.
#[allow(non_snake_case)]
pub fn XLByteToSeg(lsn: Lsn, wal_seg_size: usize) -> XLogSegNo {
    lsn.segment_number(wal_seg_size)
}

/// Segment containing the byte just before the given LSN, mimicking
/// XLByteToPrevSeg. An end-of-backup LSN sitting exactly on a segment
/// boundary means that segment was never written to.
#[allow(non_snake_case)]
pub fn XLByteToPrevSeg(lsn: Lsn, wal_seg_size: usize) -> XLogSegNo {
    (lsn.0 - 1) / wal_seg_size as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xlog_file_names() {
        let seg_sz = 16 * 1024 * 1024;
        assert_eq!(XLogFileName(1, 1, seg_sz), "000000010000000000000001");
        // segment numbers wrap into the "log" part every 0x100000000 bytes
        assert_eq!(XLogFileName(1, 256, seg_sz), "000000010000000100000000");
        assert_eq!(
            XLogFromFileName("000000010000000100000000", seg_sz),
            (256, 1)
        );
        assert_eq!(XLogFromFileName("0000000A0000000000000003", seg_sz), (3, 10));
    }

    #[test]
    fn test_file_name_classification() {
        assert!(IsXLogFileName("000000010000000000000001"));
        assert!(!IsXLogFileName("00000001000000000000001"));
        assert!(!IsXLogFileName("000000010000000000000001.partial"));
        assert!(IsPartialXLogFileName("000000010000000000000001.partial"));
        assert!(IsTLHistoryFileName("00000002.history"));
        assert!(!IsTLHistoryFileName("0000002.history"));
        assert!(!IsTLHistoryFileName("00000002.histories"));
    }

    #[test]
    fn test_segment_bounds() {
        let seg_sz = 16 * 1024 * 1024;
        assert_eq!(XLByteToSeg(Lsn(0x1000000), seg_sz), 1);
        assert_eq!(XLByteToSeg(Lsn(0x1000001), seg_sz), 1);
        // an end LSN exactly on a boundary belongs to the previous segment
        assert_eq!(XLByteToPrevSeg(Lsn(0x2000000), seg_sz), 1);
        assert_eq!(XLByteToPrevSeg(Lsn(0x2000001), seg_sz), 2);
    }
}
