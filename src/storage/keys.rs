use crate::core::types::RecordNumber;

/// Joins the parts of every engine key.
pub const SUBFILE_DELIMITER: u8 = b'_';

pub const CONTROL_SEGMENT_SIZE_KEY: &[u8] = b"_control_segment_size";
pub const CONTROL_SPECIFICATION_KEY: &[u8] = b"_control_specification";
/// Present once any record has been stored; the segment size is fixed from then on.
pub const CONTROL_SEGMENTS_WRITTEN_KEY: &[u8] = b"_control_segments_written";

const EXISTENCE_BITMAP_SUFFIX: &[u8] = b"ebm";
const DATA_SUFFIX: &[u8] = b"data";
const FREED_SUFFIX: &[u8] = b"freed";
const SEGMENT_SUFFIX: &[u8] = b"segment";

/// Names no secondary field may take, since they share the key space of a file.
pub const RESERVED_FIELD_NAMES: [&str; 4] = ["ebm", "data", "freed", "segment"];

/// Engine key layout for one database.
///
/// ```text
/// {file}_{field}_{value}                 segment table for an index value
/// {file}_{field}_{value}_segment_{n}     list or bitmap payload of segment n
/// {file}_ebm                             existence bitmap segment numbers
/// {file}_ebm_{n}                         existence bitmap segment n
/// {file}_data_{record}                   stored record
/// {file}_freed                           segments holding freed record numbers
/// ```
///
/// An `_` inside an index value is written `__`, so a value key never equals
/// the payload key of another value.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyLayout;

impl KeyLayout {
    fn join(parts: &[&[u8]]) -> Vec<u8> {
        let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                key.push(SUBFILE_DELIMITER);
            }
            key.extend_from_slice(part);
        }
        key
    }

    fn escape_value(value: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(value.len());
        for byte in value {
            out.push(*byte);
            if *byte == SUBFILE_DELIMITER {
                out.push(SUBFILE_DELIMITER);
            }
        }
        out
    }

    pub fn segment_table_key(&self, file: &str, field: &str, value: &[u8]) -> Vec<u8> {
        Self::join(&[file.as_bytes(), field.as_bytes(), &Self::escape_value(value)])
    }

    pub fn segment_key(&self, file: &str, field: &str, value: &[u8], segment: u64) -> Vec<u8> {
        Self::join(&[
            file.as_bytes(),
            field.as_bytes(),
            &Self::escape_value(value),
            SEGMENT_SUFFIX,
            segment.to_string().as_bytes(),
        ])
    }

    pub fn ebm_table_key(&self, file: &str) -> Vec<u8> {
        Self::join(&[file.as_bytes(), EXISTENCE_BITMAP_SUFFIX])
    }

    pub fn ebm_segment_key(&self, file: &str, segment: u64) -> Vec<u8> {
        Self::join(&[
            file.as_bytes(),
            EXISTENCE_BITMAP_SUFFIX,
            segment.to_string().as_bytes(),
        ])
    }

    pub fn record_key(&self, file: &str, record: RecordNumber) -> Vec<u8> {
        Self::join(&[file.as_bytes(), DATA_SUFFIX, record.0.to_string().as_bytes()])
    }

    pub fn freed_key(&self, file: &str) -> Vec<u8> {
        Self::join(&[file.as_bytes(), FREED_SUFFIX])
    }
}
