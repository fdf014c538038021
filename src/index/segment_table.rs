use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};
use crate::core::error::Result;
use crate::storage::codec::SegmentKind;

/// How one stored segment of a value is encoded and how many records it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub kind: SegmentKind,
    pub count: u32,
}

/// Segments present for one (file, field, value), stored under the value key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    entries: BTreeMap<u64, SegmentEntry>,
}

impl SegmentTable {
    pub fn new() -> Self {
        SegmentTable::default()
    }

    pub fn get(&self, segment: u64) -> Option<SegmentEntry> {
        self.entries.get(&segment).copied()
    }

    pub fn set(&mut self, segment: u64, entry: SegmentEntry) {
        self.entries.insert(segment, entry);
    }

    pub fn remove(&mut self, segment: u64) -> Option<SegmentEntry> {
        self.entries.remove(&segment)
    }

    /// Entries in ascending segment order.
    pub fn entries(&self) -> impl Iterator<Item = (u64, SegmentEntry)> + '_ {
        self.entries.iter().map(|(s, e)| (*s, *e))
    }

    pub fn segments(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_count(&self) -> u64 {
        self.entries.values().map(|e| e.count as u64).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_order() {
        let mut table = SegmentTable::new();
        table.set(7, SegmentEntry { kind: SegmentKind::Bitmap, count: 90 });
        table.set(2, SegmentEntry { kind: SegmentKind::List, count: 3 });
        assert_eq!(table.segments(), vec![2, 7]);
        assert_eq!(table.record_count(), 93);

        let restored = SegmentTable::from_bytes(&table.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, table);

        table.remove(2);
        table.remove(7);
        assert!(table.is_empty());
    }
}
