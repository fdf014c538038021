use roaring::RoaringBitmap;
use crate::core::error::{Error, Result};
use crate::core::types::RecordNumber;
use crate::index::record_list::RecordList;
use crate::index::segment_table::{SegmentEntry, SegmentTable};
use crate::index::table_cache::{CacheStats, SegmentTableCache};
use crate::storage::codec::SegmentCodec;
use crate::storage::engine::Engine;
use crate::storage::keys::KeyLayout;

/// Segmented record sets for index values.
///
/// Each (file, field, value) owns a segment table record plus one stored
/// segment per non-empty segment. Empty segments are deleted, never stored,
/// and a value with no segments left has no table record either.
pub struct IndexValueStore {
    codec: SegmentCodec,
    keys: KeyLayout,
    tables: SegmentTableCache,
}

impl IndexValueStore {
    pub fn new(codec: SegmentCodec, cache_capacity: usize) -> Result<Self> {
        Ok(IndexValueStore {
            codec,
            keys: KeyLayout,
            tables: SegmentTableCache::new(cache_capacity)?,
        })
    }

    pub fn codec(&self) -> SegmentCodec {
        self.codec
    }

    pub fn load_table<E: Engine>(&self, engine: &E, file: &str, field: &str, value: &[u8]) -> Result<SegmentTable> {
        let key = self.keys.segment_table_key(file, field, value);
        if let Some(table) = self.tables.get(&key) {
            return Ok(table);
        }
        let table = match engine.get(&key)? {
            Some(bytes) => SegmentTable::from_bytes(&bytes)?,
            None => SegmentTable::new(),
        };
        self.tables.put(key, table.clone());
        Ok(table)
    }

    fn store_table<E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        table: &SegmentTable,
    ) -> Result<()> {
        let key = self.keys.segment_table_key(file, field, value);
        // Drop the cached copy first so a failed write cannot leave it ahead of the engine.
        self.tables.invalidate(&key);
        if table.is_empty() {
            engine.delete(&key)?;
        } else {
            engine.put(&key, &table.to_bytes()?)?;
        }
        self.tables.put(key, table.clone());
        Ok(())
    }

    /// Decode one stored segment, checking it against its table entry.
    pub fn read_segment<E: Engine>(
        &self,
        engine: &E,
        file: &str,
        field: &str,
        value: &[u8],
        segment: u64,
        entry: SegmentEntry,
    ) -> Result<RoaringBitmap> {
        let key = self.keys.segment_key(file, field, value, segment);
        let stored = engine.get(&key)?.ok_or_else(|| {
            Error::corrupt(format!(
                "Segment {} of {}_{} is listed but missing",
                segment, file, field
            ))
        })?;
        let (kind, offsets) = self.codec.decode_record(&stored)?;
        if kind != entry.kind || offsets.len() != entry.count as u64 {
            return Err(Error::corrupt(format!(
                "Segment {} of {}_{} holds {:?} with {} records, table says {:?} with {}",
                segment,
                file,
                field,
                kind,
                offsets.len(),
                entry.kind,
                entry.count
            )));
        }
        Ok(offsets)
    }

    /// Write `offsets` with the kind chosen for its size, or delete the segment if empty.
    fn write_segment<E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        segment: u64,
        offsets: &RoaringBitmap,
    ) -> Result<Option<SegmentEntry>> {
        let key = self.keys.segment_key(file, field, value, segment);
        if offsets.is_empty() {
            engine.delete(&key)?;
            return Ok(None);
        }
        let (kind, payload) = self.codec.encode(offsets);
        engine.put(&key, &self.codec.encode_record(kind, &payload))?;
        Ok(Some(SegmentEntry {
            kind,
            count: offsets.len() as u32,
        }))
    }

    fn existing<E: Engine>(
        &self,
        engine: &E,
        file: &str,
        field: &str,
        value: &[u8],
        table: &SegmentTable,
        segment: u64,
    ) -> Result<RoaringBitmap> {
        match table.get(segment) {
            Some(entry) => self.read_segment(engine, file, field, value, segment, entry),
            None => Ok(RoaringBitmap::new()),
        }
    }

    /// All records indexed under `value`, decoded before returning so a
    /// corrupt segment yields an error and no records.
    pub fn lookup<E: Engine>(&self, engine: &E, file: &str, field: &str, value: &[u8]) -> Result<RecordList> {
        let table = self.load_table(engine, file, field, value)?;
        let mut list = RecordList::new(self.codec.segment_size());
        for (segment, entry) in table.entries() {
            let offsets = self.read_segment(engine, file, field, value, segment, entry)?;
            list.insert_segment(segment, offsets);
        }
        Ok(list)
    }

    /// Record count for `value` read from its segment table alone.
    pub fn count<E: Engine>(&self, engine: &E, file: &str, field: &str, value: &[u8]) -> Result<u64> {
        Ok(self.load_table(engine, file, field, value)?.record_count())
    }

    /// Union each (segment, offsets) group into the stored segments of `value`.
    /// The table is read and written once. Returns how many records were added.
    pub fn merge_segments<'a, E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        groups: impl IntoIterator<Item = (u64, &'a RoaringBitmap)>,
    ) -> Result<u64> {
        let mut table = self.load_table(engine, file, field, value)?;
        let mut added = 0;
        for (segment, offsets) in groups {
            let existing = self.existing(engine, file, field, value, &table, segment)?;
            let merged = self.codec.union(&existing, offsets);
            if merged.len() == existing.len() {
                continue;
            }
            added += merged.len() - existing.len();
            if let Some(entry) = self.write_segment(engine, file, field, value, segment, &merged)? {
                table.set(segment, entry);
            }
        }
        if added > 0 {
            self.store_table(engine, file, field, value, &table)?;
        }
        Ok(added)
    }

    /// Subtract each (segment, offsets) group from the stored segments of `value`.
    /// Returns how many records were removed.
    pub fn remove_segments<'a, E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        groups: impl IntoIterator<Item = (u64, &'a RoaringBitmap)>,
    ) -> Result<u64> {
        let mut table = self.load_table(engine, file, field, value)?;
        let mut removed = 0;
        for (segment, offsets) in groups {
            if table.get(segment).is_none() {
                continue;
            }
            let existing = self.existing(engine, file, field, value, &table, segment)?;
            let remaining = self.codec.difference(&existing, offsets);
            if remaining.len() == existing.len() {
                continue;
            }
            removed += existing.len() - remaining.len();
            match self.write_segment(engine, file, field, value, segment, &remaining)? {
                Some(entry) => table.set(segment, entry),
                None => {
                    table.remove(segment);
                }
            }
        }
        if removed > 0 {
            self.store_table(engine, file, field, value, &table)?;
        }
        Ok(removed)
    }

    pub fn insert<E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        record: RecordNumber,
    ) -> Result<bool> {
        let (segment, offset) = self.codec.segment_size().split(record);
        let single: RoaringBitmap = [offset].into_iter().collect();
        Ok(self.merge_segments(engine, file, field, value, [(segment, &single)])? > 0)
    }

    pub fn remove<E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        record: RecordNumber,
    ) -> Result<bool> {
        let (segment, offset) = self.codec.segment_size().split(record);
        let single: RoaringBitmap = [offset].into_iter().collect();
        Ok(self.remove_segments(engine, file, field, value, [(segment, &single)])? > 0)
    }

    /// Move `record` from `old_value` to `new_value`. The insert goes first, so a
    /// failure in between leaves the record under both values rather than neither.
    pub fn rekey<E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        old_value: &[u8],
        new_value: &[u8],
        record: RecordNumber,
    ) -> Result<()> {
        if old_value == new_value {
            return Ok(());
        }
        self.insert(engine, file, field, new_value, record)?;
        self.remove(engine, file, field, old_value, record)?;
        Ok(())
    }

    /// Replace everything indexed under `value` with `records`.
    pub fn file_records<E: Engine>(
        &self,
        engine: &mut E,
        file: &str,
        field: &str,
        value: &[u8],
        records: &RecordList,
    ) -> Result<()> {
        let old = self.load_table(engine, file, field, value)?;
        let mut table = SegmentTable::new();
        for (segment, offsets) in records.segments() {
            if let Some(entry) = self.write_segment(engine, file, field, value, segment, offsets)? {
                table.set(segment, entry);
            }
        }
        for segment in old.segments() {
            if table.get(segment).is_none() {
                engine.delete(&self.keys.segment_key(file, field, value, segment))?;
            }
        }
        self.store_table(engine, file, field, value, &table)
    }

    /// Drop every segment and the table of `value`.
    pub fn unfile_records<E: Engine>(&self, engine: &mut E, file: &str, field: &str, value: &[u8]) -> Result<()> {
        let old = self.load_table(engine, file, field, value)?;
        for segment in old.segments() {
            engine.delete(&self.keys.segment_key(file, field, value, segment))?;
        }
        self.store_table(engine, file, field, value, &SegmentTable::new())
    }

    /// Forget cached tables, e.g. after the engine rolled back.
    pub fn clear_cache(&self) {
        self.tables.clear();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.tables.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::storage::codec::SegmentKind;
    use crate::storage::memory::MemoryEngine;
    use crate::storage::segment_size::SegmentSize;
    use std::path::Path;

    fn store() -> IndexValueStore {
        IndexValueStore::new(SegmentCodec::new(SegmentSize::for_testing()), 16).unwrap()
    }

    fn numbers(list: &RecordList) -> Vec<u64> {
        list.iter().map(|r| r.0).collect()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut engine = MemoryEngine::new();
        let store = store();
        for n in [300u64, 5, 130, 7] {
            assert!(store.insert(&mut engine, "Games", "Tag", b"endgame", RecordNumber(n)).unwrap());
        }
        assert!(!store.insert(&mut engine, "Games", "Tag", b"endgame", RecordNumber(5)).unwrap());

        let found = store.lookup(&engine, "Games", "Tag", b"endgame").unwrap();
        assert_eq!(numbers(&found), vec![5, 7, 130, 300]);
        assert_eq!(store.count(&engine, "Games", "Tag", b"endgame").unwrap(), 4);

        assert!(store.remove(&mut engine, "Games", "Tag", b"endgame", RecordNumber(300)).unwrap());
        assert!(!store.remove(&mut engine, "Games", "Tag", b"endgame", RecordNumber(300)).unwrap());
        assert_eq!(engine.get(b"Games_Tag_endgame_segment_2").unwrap(), None);
    }

    #[test]
    fn test_empty_value_leaves_no_keys() {
        let mut engine = MemoryEngine::new();
        let store = store();
        store.insert(&mut engine, "Games", "Tag", b"x", RecordNumber(9)).unwrap();
        store.remove(&mut engine, "Games", "Tag", b"x", RecordNumber(9)).unwrap();
        assert!(engine.is_empty());
        assert!(store.lookup(&engine, "Games", "Tag", b"x").unwrap().is_empty());
    }

    #[test]
    fn test_kind_follows_member_count() {
        let mut engine = MemoryEngine::new();
        let store = store();
        for n in 0..8u64 {
            store.insert(&mut engine, "Games", "Tag", b"x", RecordNumber(n)).unwrap();
        }
        let table = store.load_table(&engine, "Games", "Tag", b"x").unwrap();
        assert_eq!(table.get(0).unwrap().kind, SegmentKind::Bitmap);

        for n in 1..8u64 {
            store.remove(&mut engine, "Games", "Tag", b"x", RecordNumber(n)).unwrap();
        }
        let table = store.load_table(&engine, "Games", "Tag", b"x").unwrap();
        assert_eq!(table.get(0), Some(SegmentEntry { kind: SegmentKind::List, count: 1 }));
        assert_eq!(engine.get(b"Games_Tag_x_segment_0").unwrap(), Some(vec![1, 0, 0]));
    }

    #[test]
    fn test_rekey_moves_record() {
        let mut engine = MemoryEngine::new();
        let store = store();
        store.insert(&mut engine, "Games", "Tag", b"old", RecordNumber(3)).unwrap();
        store.rekey(&mut engine, "Games", "Tag", b"old", b"new", RecordNumber(3)).unwrap();
        assert!(store.lookup(&engine, "Games", "Tag", b"old").unwrap().is_empty());
        assert_eq!(numbers(&store.lookup(&engine, "Games", "Tag", b"new").unwrap()), vec![3]);
    }

    /// Refuses every write to keys starting with `locked`.
    struct LockedValueEngine {
        inner: MemoryEngine,
        locked: Vec<u8>,
    }

    impl LockedValueEngine {
        fn check(&self, key: &[u8]) -> Result<()> {
            if key.starts_with(&self.locked) {
                return Err(Error::new(ErrorKind::Io, "value is locked".to_string()));
            }
            Ok(())
        }
    }

    impl Engine for LockedValueEngine {
        fn open(_path: Option<&Path>) -> Result<Self> {
            Ok(LockedValueEngine { inner: MemoryEngine::new(), locked: Vec::new() })
        }
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            self.check(key)?;
            self.inner.put(key, value)
        }
        fn delete(&mut self, key: &[u8]) -> Result<()> {
            self.check(key)?;
            self.inner.delete(key)
        }
    }

    #[test]
    fn test_rekey_failure_leaves_record_under_both_values() {
        let mut engine = LockedValueEngine { inner: MemoryEngine::new(), locked: b"unused".to_vec() };
        let store = store();
        store.insert(&mut engine, "Games", "Tag", b"old", RecordNumber(3)).unwrap();

        engine.locked = b"Games_Tag_old".to_vec();
        let err = store.rekey(&mut engine, "Games", "Tag", b"old", b"new", RecordNumber(3)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Io);

        assert_eq!(numbers(&store.lookup(&engine, "Games", "Tag", b"new").unwrap()), vec![3]);
        assert_eq!(numbers(&store.lookup(&engine, "Games", "Tag", b"old").unwrap()), vec![3]);
        store.clear_cache();
        assert_eq!(numbers(&store.lookup(&engine, "Games", "Tag", b"old").unwrap()), vec![3]);
    }

    #[test]
    fn test_corrupt_segment_returns_nothing() {
        let mut engine = MemoryEngine::new();
        let store = store();
        for n in 0..20u64 {
            store.insert(&mut engine, "Games", "Tag", b"x", RecordNumber(n * 10)).unwrap();
        }
        let mut stored = engine.get(b"Games_Tag_x_segment_0").unwrap().unwrap();
        stored.pop();
        engine.put(b"Games_Tag_x_segment_0", &stored).unwrap();

        let err = store.lookup(&engine, "Games", "Tag", b"x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CorruptSegment);
    }

    #[test]
    fn test_file_and_unfile_records() {
        let mut engine = MemoryEngine::new();
        let store = store();
        let size = SegmentSize::for_testing();
        store.insert(&mut engine, "Games", "Tag", b"x", RecordNumber(500)).unwrap();

        let records = RecordList::from_records(size, [1u64, 2, 200].map(RecordNumber));
        store.file_records(&mut engine, "Games", "Tag", b"x", &records).unwrap();
        assert_eq!(numbers(&store.lookup(&engine, "Games", "Tag", b"x").unwrap()), vec![1, 2, 200]);
        assert_eq!(engine.get(b"Games_Tag_x_segment_3").unwrap(), None);

        store.unfile_records(&mut engine, "Games", "Tag", b"x").unwrap();
        assert!(engine.is_empty());
    }
}
