use std::collections::{BTreeMap, BTreeSet};
use roaring::RoaringBitmap;
use tracing::debug;
use crate::core::error::{Error, Result};
use crate::core::types::RecordNumber;
use crate::index::record_list::RecordList;
use crate::storage::codec::{SegmentCodec, SegmentKind};
use crate::storage::engine::Engine;
use crate::storage::keys::KeyLayout;

/// Per-file bitmap of live record numbers, stored one segment per key.
///
/// Segments are always stored bitmap-encoded. Mutations stay in the segment
/// cache until `flush`, so the caller decides when they reach the engine.
pub struct ExistenceBitmap {
    file: String,
    codec: SegmentCodec,
    keys: KeyLayout,
    /// Non-empty segments, stored or created since the last flush.
    segments: BTreeSet<u64>,
    cache: BTreeMap<u64, RoaringBitmap>,
    dirty: BTreeSet<u64>,
    table_dirty: bool,
    high: Option<RecordNumber>,
    /// Segments below the high segment holding freed record numbers; loaded on first use.
    freed: Option<BTreeSet<u64>>,
    freed_dirty: bool,
}

impl ExistenceBitmap {
    pub fn load<E: Engine>(engine: &E, file: &str, codec: SegmentCodec) -> Result<Self> {
        let keys = KeyLayout;
        let segments: Vec<u64> = match engine.get(&keys.ebm_table_key(file))? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => Vec::new(),
        };

        let mut ebm = ExistenceBitmap {
            file: file.to_string(),
            codec,
            keys,
            segments: segments.into_iter().collect(),
            cache: BTreeMap::new(),
            dirty: BTreeSet::new(),
            table_dirty: false,
            high: None,
            freed: None,
            freed_dirty: false,
        };
        if let Some(last) = ebm.segments.last().copied() {
            ebm.high = ebm.highest_at_or_below(engine, last)?;
        }
        Ok(ebm)
    }

    fn read_segment<E: Engine>(&self, engine: &E, segment: u64) -> Result<RoaringBitmap> {
        if let Some(set) = self.cache.get(&segment) {
            return Ok(set.clone());
        }
        if !self.segments.contains(&segment) {
            return Ok(RoaringBitmap::new());
        }
        let stored = engine.get(&self.keys.ebm_segment_key(&self.file, segment))?.ok_or_else(|| {
            Error::corrupt(format!(
                "Existence bitmap segment {} of file '{}' is listed but missing",
                segment, self.file
            ))
        })?;
        let (kind, offsets) = self.codec.decode_record(&stored)?;
        if kind != SegmentKind::Bitmap {
            return Err(Error::corrupt(format!(
                "Existence bitmap segment {} of file '{}' is not bitmap encoded",
                segment, self.file
            )));
        }
        Ok(offsets)
    }

    fn load_segment<E: Engine>(&mut self, engine: &E, segment: u64) -> Result<&mut RoaringBitmap> {
        if !self.cache.contains_key(&segment) {
            let offsets = self.read_segment(engine, segment)?;
            self.cache.insert(segment, offsets);
        }
        Ok(self.cache.entry(segment).or_default())
    }

    fn highest_at_or_below<E: Engine>(&self, engine: &E, segment: u64) -> Result<Option<RecordNumber>> {
        let size = self.codec.segment_size();
        for s in self.segments.range(..=segment).rev() {
            if let Some(max) = self.read_segment(engine, *s)?.max() {
                return Ok(Some(size.join(*s, max)));
            }
        }
        Ok(None)
    }

    /// Mark `record` live. Returns false if it already was.
    pub fn set_bit<E: Engine>(&mut self, engine: &E, record: RecordNumber) -> Result<bool> {
        let (segment, offset) = self.codec.segment_size().split(record);
        let inserted = self.load_segment(engine, segment)?.insert(offset);
        if self.segments.insert(segment) {
            self.table_dirty = true;
        }
        if inserted {
            self.dirty.insert(segment);
            if self.high.is_none_or(|h| h < record) {
                self.high = Some(record);
            }
        }
        Ok(inserted)
    }

    /// Mark `record` free. Returns false if it was not live.
    ///
    /// A segment left empty leaves the segment list; its key goes on the next flush.
    pub fn clear_bit<E: Engine>(&mut self, engine: &E, record: RecordNumber) -> Result<bool> {
        let (segment, offset) = self.codec.segment_size().split(record);
        if !self.segments.contains(&segment) {
            return Ok(false);
        }
        let offsets = self.load_segment(engine, segment)?;
        let removed = offsets.remove(offset);
        let emptied = offsets.is_empty();
        if removed {
            self.dirty.insert(segment);
            if emptied {
                self.segments.remove(&segment);
                self.table_dirty = true;
            }
            if self.high == Some(record) {
                self.high = self.highest_at_or_below(engine, segment)?;
            }
        }
        Ok(removed)
    }

    pub fn is_live<E: Engine>(&self, engine: &E, record: RecordNumber) -> Result<bool> {
        let (segment, offset) = self.codec.segment_size().split(record);
        Ok(self.read_segment(engine, segment)?.contains(offset))
    }

    pub fn high_record_number(&self) -> Option<RecordNumber> {
        self.high
    }

    pub fn next_record_number(&self) -> RecordNumber {
        self.high.map_or(RecordNumber(0), |h| RecordNumber(h.0 + 1))
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty() || self.table_dirty || self.freed_dirty
    }

    pub fn dirty_segments(&self) -> Vec<u64> {
        self.dirty.iter().copied().collect()
    }

    /// Persist `segment` if it changed since it was last written. An empty
    /// segment is deleted instead.
    pub fn flush<E: Engine>(&mut self, engine: &mut E, segment: u64) -> Result<()> {
        if self.dirty.contains(&segment) {
            let key = self.keys.ebm_segment_key(&self.file, segment);
            match self.cache.get(&segment) {
                Some(offsets) if !offsets.is_empty() => {
                    let payload = self.codec.encode_as_bitmap(offsets);
                    engine.put(&key, &self.codec.encode_record(SegmentKind::Bitmap, &payload))?;
                }
                _ => engine.delete(&key)?,
            }
            self.dirty.remove(&segment);
        }
        self.flush_tables(engine)?;

        let high_segment = self.high.map(|h| self.codec.segment_size().split(h).0);
        if high_segment != Some(segment) && !self.dirty.contains(&segment) {
            self.cache.remove(&segment);
        }
        Ok(())
    }

    pub fn flush_all<E: Engine>(&mut self, engine: &mut E) -> Result<()> {
        let dirty = self.dirty_segments();
        for segment in &dirty {
            self.flush(engine, *segment)?;
        }
        self.flush_tables(engine)?;
        if !dirty.is_empty() {
            debug!(file = %self.file, segments = dirty.len(), "Flushed existence bitmap");
        }
        Ok(())
    }

    fn flush_tables<E: Engine>(&mut self, engine: &mut E) -> Result<()> {
        if self.table_dirty {
            let key = self.keys.ebm_table_key(&self.file);
            if self.segments.is_empty() {
                engine.delete(&key)?;
            } else {
                let segments: Vec<u64> = self.segments.iter().copied().collect();
                engine.put(&key, &bincode::serialize(&segments)?)?;
            }
            self.table_dirty = false;
        }
        if self.freed_dirty {
            let freed: Vec<u64> = self.freed.iter().flatten().copied().collect();
            let key = self.keys.freed_key(&self.file);
            if freed.is_empty() {
                engine.delete(&key)?;
            } else {
                engine.put(&key, &bincode::serialize(&freed)?)?;
            }
            self.freed_dirty = false;
        }
        Ok(())
    }

    /// Every live record number.
    pub fn live_records<E: Engine>(&self, engine: &E) -> Result<RecordList> {
        let mut list = RecordList::new(self.codec.segment_size());
        for segment in &self.segments {
            let offsets = self.read_segment(engine, *segment)?;
            if !offsets.is_empty() {
                list.insert_segment(*segment, offsets);
            }
        }
        Ok(list)
    }

    fn load_freed<E: Engine>(&mut self, engine: &E) -> Result<&mut BTreeSet<u64>> {
        if self.freed.is_none() {
            let freed: Vec<u64> = match engine.get(&self.keys.freed_key(&self.file))? {
                Some(bytes) => bincode::deserialize(&bytes)?,
                None => Vec::new(),
            };
            self.freed = Some(freed.into_iter().collect());
        }
        Ok(self.freed.get_or_insert_with(BTreeSet::new))
    }

    /// Remember that `segment` has a free record number for reuse.
    pub fn note_freed<E: Engine>(&mut self, engine: &E, segment: u64) -> Result<()> {
        let Some(high) = self.high else {
            return Ok(());
        };
        let high_segment = self.codec.segment_size().split(high).0;
        if segment > high_segment {
            return Ok(());
        }
        if self.load_freed(engine)?.insert(segment) {
            self.freed_dirty = true;
        }
        Ok(())
    }

    /// Lowest reusable record number, never taken from the high segment.
    pub fn lowest_freed_record_number<E: Engine>(&mut self, engine: &E) -> Result<Option<RecordNumber>> {
        let size = self.codec.segment_size();
        let high_segment = self.high.map(|h| size.split(h).0);
        loop {
            let Some(segment) = self.load_freed(engine)?.first().copied() else {
                return Ok(None);
            };
            if Some(segment) == high_segment {
                return Ok(None);
            }
            let offsets = self.read_segment(engine, segment)?;
            let free = first_clear_offset(&offsets, size.records());
            match free {
                Some(offset) => return Ok(Some(size.join(segment, offset))),
                None => {
                    self.load_freed(engine)?.remove(&segment);
                    self.freed_dirty = true;
                }
            }
        }
    }
}

fn first_clear_offset(offsets: &RoaringBitmap, records: u32) -> Option<u32> {
    let mut expected = 0u32;
    for offset in offsets {
        if offset != expected {
            return Some(expected);
        }
        expected += 1;
    }
    (expected < records).then_some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEngine;
    use crate::storage::segment_size::SegmentSize;

    fn codec16() -> SegmentCodec {
        SegmentCodec::new(SegmentSize::from_records(16).unwrap())
    }

    #[test]
    fn test_high_water_mark() {
        let mut engine = MemoryEngine::new();
        let mut ebm = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        assert_eq!(ebm.high_record_number(), None);

        for n in [5u64, 5000, 5001] {
            ebm.set_bit(&engine, RecordNumber(n)).unwrap();
        }
        assert_eq!(ebm.high_record_number(), Some(RecordNumber(5001)));
        ebm.clear_bit(&engine, RecordNumber(5001)).unwrap();
        assert_eq!(ebm.high_record_number(), Some(RecordNumber(5000)));
        ebm.clear_bit(&engine, RecordNumber(5000)).unwrap();
        assert_eq!(ebm.high_record_number(), Some(RecordNumber(5)));
        ebm.clear_bit(&engine, RecordNumber(5)).unwrap();
        assert_eq!(ebm.high_record_number(), None);

        ebm.flush_all(&mut engine).unwrap();
    }

    #[test]
    fn test_reload_recovers_high_record() {
        let mut engine = MemoryEngine::new();
        let mut ebm = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        ebm.set_bit(&engine, RecordNumber(40)).unwrap();
        ebm.set_bit(&engine, RecordNumber(70)).unwrap();
        ebm.clear_bit(&engine, RecordNumber(70)).unwrap();
        ebm.flush_all(&mut engine).unwrap();

        let reloaded = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        assert_eq!(reloaded.high_record_number(), Some(RecordNumber(40)));
        assert!(reloaded.is_live(&engine, RecordNumber(40)).unwrap());
        assert!(!reloaded.is_live(&engine, RecordNumber(70)).unwrap());
        assert_eq!(reloaded.segment_count(), 1);
        assert_eq!(engine.get(b"Games_ebm_4").unwrap(), None);
    }

    #[test]
    fn test_emptied_segments_leave_the_list() {
        let mut engine = MemoryEngine::new();
        let mut ebm = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        for n in [1u64, 20, 35, 100] {
            ebm.set_bit(&engine, RecordNumber(n)).unwrap();
        }
        ebm.flush_all(&mut engine).unwrap();
        assert_eq!(ebm.segment_count(), 4);

        ebm.clear_bit(&engine, RecordNumber(20)).unwrap();
        ebm.clear_bit(&engine, RecordNumber(35)).unwrap();
        assert_eq!(ebm.segment_count(), 2);
        ebm.flush_all(&mut engine).unwrap();
        assert_eq!(engine.get(b"Games_ebm_1").unwrap(), None);
        assert_eq!(engine.get(b"Games_ebm_2").unwrap(), None);

        // The rescan only visits segments that still hold records.
        ebm.clear_bit(&engine, RecordNumber(100)).unwrap();
        assert_eq!(ebm.high_record_number(), Some(RecordNumber(1)));

        ebm.clear_bit(&engine, RecordNumber(1)).unwrap();
        ebm.flush_all(&mut engine).unwrap();
        assert!(engine.is_empty());
        assert_eq!(ExistenceBitmap::load(&engine, "Games", codec16()).unwrap().segment_count(), 0);
    }

    #[test]
    fn test_segments_stored_as_bitmaps() {
        let mut engine = MemoryEngine::new();
        let mut ebm = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        ebm.set_bit(&engine, RecordNumber(17)).unwrap();
        ebm.flush(&mut engine, 1).unwrap();

        let stored = engine.get(b"Games_ebm_1").unwrap().unwrap();
        assert_eq!(stored, vec![SegmentKind::Bitmap.tag(), 0b0100_0000, 0]);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut engine = MemoryEngine::new();
        let mut ebm = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        ebm.set_bit(&engine, RecordNumber(3)).unwrap();
        ebm.flush(&mut engine, 0).unwrap();
        let first = engine.get(b"Games_ebm_0").unwrap();
        ebm.flush(&mut engine, 0).unwrap();
        assert_eq!(engine.get(b"Games_ebm_0").unwrap(), first);
        assert!(!ebm.is_dirty());
    }

    #[test]
    fn test_freed_record_numbers() {
        let mut engine = MemoryEngine::new();
        let mut ebm = ExistenceBitmap::load(&engine, "Games", codec16()).unwrap();
        for n in 0..40u64 {
            ebm.set_bit(&engine, RecordNumber(n)).unwrap();
        }
        ebm.clear_bit(&engine, RecordNumber(3)).unwrap();
        ebm.note_freed(&engine, 0).unwrap();
        ebm.clear_bit(&engine, RecordNumber(35)).unwrap();
        ebm.note_freed(&engine, 2).unwrap();

        assert_eq!(ebm.lowest_freed_record_number(&engine).unwrap(), Some(RecordNumber(3)));
        ebm.set_bit(&engine, RecordNumber(3)).unwrap();
        // Segment 0 is full again; segment 2 is the high segment.
        assert_eq!(ebm.lowest_freed_record_number(&engine).unwrap(), None);
        ebm.flush_all(&mut engine).unwrap();
        assert!(engine.get(b"Games_freed").unwrap().is_some());
    }
}
