use serde::{Deserialize, Serialize};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::RecordNumber;

/// Segment size used when none is requested: 32000 records.
pub const DEFAULT_SEGMENT_SIZE_BYTES: u32 = 4000;
/// Small segments for tests: 128 records.
pub const TEST_SEGMENT_SIZE_BYTES: u32 = 16;
/// 16 records.
pub const MIN_SEGMENT_SIZE_BYTES: u32 = 2;
/// List offsets are two bytes, so a segment holds at most 65536 records.
pub const MAX_SEGMENT_SIZE_BYTES: u32 = 8192;

/// Fixed number of records per segment, held as the byte size of a bitmap segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSize {
    bytes: u32,
}

impl SegmentSize {
    /// Derive the segment size from a byte budget: one bit per record.
    pub fn configure(segment_size_bytes: Option<u32>) -> Result<Self> {
        let bytes = segment_size_bytes.unwrap_or(DEFAULT_SEGMENT_SIZE_BYTES);
        if !(MIN_SEGMENT_SIZE_BYTES..=MAX_SEGMENT_SIZE_BYTES).contains(&bytes) {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!(
                    "Segment size {} bytes outside {}..={}",
                    bytes, MIN_SEGMENT_SIZE_BYTES, MAX_SEGMENT_SIZE_BYTES
                ),
            ));
        }
        Ok(SegmentSize { bytes })
    }

    /// Segment size given as a record count, which must be a multiple of 8.
    pub fn from_records(records: u32) -> Result<Self> {
        if records % 8 != 0 {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!("Segment record count {} is not a multiple of 8", records),
            ));
        }
        Self::configure(Some(records / 8))
    }

    pub fn for_testing() -> Self {
        SegmentSize { bytes: TEST_SEGMENT_SIZE_BYTES }
    }

    pub fn bytes(&self) -> u32 {
        self.bytes
    }

    pub fn records(&self) -> u32 {
        self.bytes * 8
    }

    pub fn bitmap_bytes(&self) -> usize {
        self.bytes as usize
    }

    pub fn list_bytes(&self, member_count: usize) -> usize {
        member_count * 2
    }

    /// Split a record number into (segment number, offset in segment).
    pub fn split(&self, record_number: RecordNumber) -> (u64, u32) {
        let records = self.records() as u64;
        (record_number.0 / records, (record_number.0 % records) as u32)
    }

    pub fn join(&self, segment: u64, offset: u32) -> RecordNumber {
        RecordNumber(segment * self.records() as u64 + offset as u64)
    }

    /// One deferred update point per segment, at its last record.
    pub fn default_deferred_update_points(&self) -> Vec<u32> {
        vec![self.records() - 1]
    }
}

impl Default for SegmentSize {
    fn default() -> Self {
        SegmentSize { bytes: DEFAULT_SEGMENT_SIZE_BYTES }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_defaults() {
        let size = SegmentSize::configure(None).unwrap();
        assert_eq!(size.bytes(), 4000);
        assert_eq!(size.records(), 32000);
        assert_eq!(size.default_deferred_update_points(), vec![31999]);

        let test = SegmentSize::for_testing();
        assert_eq!(test.records(), 128);
        assert_eq!(test.default_deferred_update_points(), vec![127]);
    }

    #[test]
    fn test_limits_enforced() {
        assert_eq!(SegmentSize::configure(Some(0)).unwrap_err().kind, ErrorKind::Configuration);
        assert_eq!(SegmentSize::configure(Some(1)).unwrap_err().kind, ErrorKind::Configuration);
        assert_eq!(SegmentSize::configure(Some(8193)).unwrap_err().kind, ErrorKind::Configuration);
        assert_eq!(SegmentSize::configure(Some(8192)).unwrap().records(), 65536);
        assert_eq!(SegmentSize::from_records(16).unwrap().bytes(), 2);
        assert!(SegmentSize::from_records(12).is_err());
    }

    #[test]
    fn test_split_and_join() {
        let size = SegmentSize::from_records(16).unwrap();
        assert_eq!(size.split(RecordNumber(5001)), (312, 9));
        assert_eq!(size.join(312, 9), RecordNumber(5001));
        assert_eq!(size.bitmap_bytes(), 2);
        assert_eq!(size.list_bytes(4), 8);
    }
}
