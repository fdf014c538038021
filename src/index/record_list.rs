use std::collections::BTreeMap;
use roaring::RoaringBitmap;
use crate::core::types::RecordNumber;
use crate::storage::segment_size::SegmentSize;

/// Set of record numbers held per segment.
///
/// Segment order then offset order is ascending record-number order, so
/// `iter` never sorts. Set operations expect both lists to share a segment size.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordList {
    size: SegmentSize,
    segments: BTreeMap<u64, RoaringBitmap>,
}

impl RecordList {
    pub fn new(size: SegmentSize) -> Self {
        RecordList {
            size,
            segments: BTreeMap::new(),
        }
    }

    pub fn from_records(size: SegmentSize, records: impl IntoIterator<Item = RecordNumber>) -> Self {
        let mut list = RecordList::new(size);
        for record in records {
            list.insert(record);
        }
        list
    }

    pub fn segment_size(&self) -> SegmentSize {
        self.size
    }

    pub fn insert(&mut self, record: RecordNumber) -> bool {
        let (segment, offset) = self.size.split(record);
        self.segments.entry(segment).or_default().insert(offset)
    }

    pub fn remove(&mut self, record: RecordNumber) -> bool {
        let (segment, offset) = self.size.split(record);
        let Some(offsets) = self.segments.get_mut(&segment) else {
            return false;
        };
        let removed = offsets.remove(offset);
        if offsets.is_empty() {
            self.segments.remove(&segment);
        }
        removed
    }

    /// Add every offset of `offsets` to `segment`.
    pub fn insert_segment(&mut self, segment: u64, offsets: RoaringBitmap) {
        if offsets.is_empty() {
            return;
        }
        *self.segments.entry(segment).or_default() |= offsets;
    }

    pub fn contains(&self, record: RecordNumber) -> bool {
        let (segment, offset) = self.size.split(record);
        self.segments.get(&segment).is_some_and(|o| o.contains(offset))
    }

    pub fn len(&self) -> u64 {
        self.segments.values().map(|o| o.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Non-empty segments in ascending order.
    pub fn segments(&self) -> impl Iterator<Item = (u64, &RoaringBitmap)> + '_ {
        self.segments.iter().map(|(s, o)| (*s, o))
    }

    /// Fresh ascending iterator; each call starts from the lowest record.
    pub fn iter(&self) -> impl Iterator<Item = RecordNumber> + '_ {
        let size = self.size;
        self.segments
            .iter()
            .flat_map(move |(segment, offsets)| offsets.iter().map(move |o| size.join(*segment, o)))
    }

    pub fn to_vec(&self) -> Vec<RecordNumber> {
        self.iter().collect()
    }

    pub fn union(&self, other: &RecordList) -> RecordList {
        let mut result = self.clone();
        for (segment, offsets) in &other.segments {
            *result.segments.entry(*segment).or_default() |= offsets;
        }
        result
    }

    pub fn intersect(&self, other: &RecordList) -> RecordList {
        let mut result = RecordList::new(self.size);
        for (segment, offsets) in &self.segments {
            if let Some(theirs) = other.segments.get(segment) {
                result.insert_segment(*segment, offsets & theirs);
            }
        }
        result
    }

    pub fn difference(&self, other: &RecordList) -> RecordList {
        let mut result = RecordList::new(self.size);
        for (segment, offsets) in &self.segments {
            match other.segments.get(segment) {
                Some(theirs) => result.insert_segment(*segment, offsets - theirs),
                None => result.insert_segment(*segment, offsets.clone()),
            }
        }
        result
    }
}
