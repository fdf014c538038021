use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use crate::core::error::{Error, Result};
use crate::storage::segment_size::SegmentSize;

/// Encoding of a stored segment. The discriminant is the on-engine tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentKind {
    List = 1,
    Bitmap = 2,
}

impl SegmentKind {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SegmentKind::List),
            2 => Some(SegmentKind::Bitmap),
            _ => None,
        }
    }
}

/// Converts offset sets to and from their list and bitmap encodings.
///
/// Offsets are relative to the segment start, so every member is below
/// `SegmentSize::records()`.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCodec {
    size: SegmentSize,
}

impl SegmentCodec {
    pub fn new(size: SegmentSize) -> Self {
        SegmentCodec { size }
    }

    pub fn segment_size(&self) -> SegmentSize {
        self.size
    }

    /// Sorted ascending 2-byte big-endian offsets.
    pub fn encode_as_list(&self, offsets: &RoaringBitmap) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size.list_bytes(offsets.len() as usize));
        for offset in offsets {
            out.extend_from_slice(&(offset as u16).to_be_bytes());
        }
        out
    }

    /// Bit `i` (most significant bit first) set iff offset `i` is present.
    pub fn encode_as_bitmap(&self, offsets: &RoaringBitmap) -> Vec<u8> {
        let mut out = vec![0u8; self.size.bitmap_bytes()];
        for offset in offsets {
            out[(offset / 8) as usize] |= 0x80 >> (offset % 8);
        }
        out
    }

    pub fn decode(&self, kind: SegmentKind, payload: &[u8]) -> Result<RoaringBitmap> {
        match kind {
            SegmentKind::List => self.decode_list(payload),
            SegmentKind::Bitmap => self.decode_bitmap(payload),
        }
    }

    fn decode_list(&self, payload: &[u8]) -> Result<RoaringBitmap> {
        if payload.len() % 2 != 0 {
            return Err(Error::corrupt(format!(
                "List segment payload has length {}",
                payload.len()
            )));
        }
        let records = self.size.records();
        let mut offsets = RoaringBitmap::new();
        let mut previous: Option<u32> = None;
        for pair in payload.chunks_exact(2) {
            let offset = u16::from_be_bytes([pair[0], pair[1]]) as u32;
            if offset >= records || previous.is_some_and(|p| p >= offset) {
                return Err(Error::corrupt(format!(
                    "List segment offset {} out of order or beyond {} records",
                    offset, records
                )));
            }
            offsets.insert(offset);
            previous = Some(offset);
        }
        Ok(offsets)
    }

    fn decode_bitmap(&self, payload: &[u8]) -> Result<RoaringBitmap> {
        if payload.len() != self.size.bitmap_bytes() {
            return Err(Error::corrupt(format!(
                "Bitmap segment payload has length {}, expected {}",
                payload.len(),
                self.size.bitmap_bytes()
            )));
        }
        let mut offsets = RoaringBitmap::new();
        for (i, byte) in payload.iter().enumerate() {
            if *byte == 0 {
                continue;
            }
            for bit in 0..8u32 {
                if byte & (0x80 >> bit) != 0 {
                    offsets.insert(i as u32 * 8 + bit);
                }
            }
        }
        Ok(offsets)
    }

    /// List while it is smaller than the bitmap.
    pub fn choose_kind(&self, member_count: usize) -> SegmentKind {
        if self.size.list_bytes(member_count) < self.size.bitmap_bytes() {
            SegmentKind::List
        } else {
            SegmentKind::Bitmap
        }
    }

    /// Encode with the kind chosen for the current member count.
    pub fn encode(&self, offsets: &RoaringBitmap) -> (SegmentKind, Vec<u8>) {
        match self.choose_kind(offsets.len() as usize) {
            SegmentKind::List => (SegmentKind::List, self.encode_as_list(offsets)),
            SegmentKind::Bitmap => (SegmentKind::Bitmap, self.encode_as_bitmap(offsets)),
        }
    }

    /// Stored form of a segment: kind tag byte followed by the payload.
    pub fn encode_record(&self, kind: SegmentKind, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(kind.tag());
        out.extend_from_slice(payload);
        out
    }

    pub fn decode_record(&self, stored: &[u8]) -> Result<(SegmentKind, RoaringBitmap)> {
        let (tag, payload) = stored
            .split_first()
            .ok_or_else(|| Error::corrupt("Empty segment record".to_string()))?;
        let kind = SegmentKind::from_tag(*tag)
            .ok_or_else(|| Error::corrupt(format!("Unknown segment kind tag {}", tag)))?;
        Ok((kind, self.decode(kind, payload)?))
    }

    pub fn union(&self, a: &RoaringBitmap, b: &RoaringBitmap) -> RoaringBitmap {
        a | b
    }

    pub fn difference(&self, a: &RoaringBitmap, b: &RoaringBitmap) -> RoaringBitmap {
        a - b
    }
}
