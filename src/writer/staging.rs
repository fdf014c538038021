use std::collections::BTreeMap;
use roaring::RoaringBitmap;
use crate::core::types::RecordNumber;
use crate::storage::segment_size::SegmentSize;

type FieldKey = (String, String);
type ValueSegments = BTreeMap<Vec<u8>, BTreeMap<u64, RoaringBitmap>>;

/// One staged (value, segment) group ready to merge.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedGroup {
    pub value: Vec<u8>,
    pub segment: u64,
    pub offsets: RoaringBitmap,
}

/// Index associations collected during a deferred-update session.
///
/// Accumulated per (file, field), then per value and segment, so a drain comes
/// out in ascending (value, segment) order without sorting.
#[derive(Debug)]
pub struct DeferredStagingArea {
    size: SegmentSize,
    staged: BTreeMap<FieldKey, ValueSegments>,
    count: usize,
}

impl DeferredStagingArea {
    pub fn new(size: SegmentSize) -> Self {
        DeferredStagingArea {
            size,
            staged: BTreeMap::new(),
            count: 0,
        }
    }

    /// Stage `record` under `value`. Returns false if it was already staged.
    pub fn add(&mut self, file: &str, field: &str, value: &[u8], record: RecordNumber) -> bool {
        let (segment, offset) = self.size.split(record);
        let inserted = self
            .staged
            .entry((file.to_string(), field.to_string()))
            .or_default()
            .entry(value.to_vec())
            .or_default()
            .entry(segment)
            .or_default()
            .insert(offset);
        if inserted {
            self.count += 1;
        }
        inserted
    }

    /// Withdraw a staged association. Returns false if it was not staged.
    pub fn remove(&mut self, file: &str, field: &str, value: &[u8], record: RecordNumber) -> bool {
        let (segment, offset) = self.size.split(record);
        let key = (file.to_string(), field.to_string());
        let Some(values) = self.staged.get_mut(&key) else {
            return false;
        };
        let Some(segments) = values.get_mut(value) else {
            return false;
        };
        let Some(offsets) = segments.get_mut(&segment) else {
            return false;
        };
        let removed = offsets.remove(offset);
        if offsets.is_empty() {
            segments.remove(&segment);
        }
        if segments.is_empty() {
            values.remove(value);
        }
        if values.is_empty() {
            self.staged.remove(&key);
        }
        if removed {
            self.count -= 1;
        }
        removed
    }

    /// Take every group staged for (file, field), ascending by (value, segment).
    pub fn drain(&mut self, file: &str, field: &str) -> impl Iterator<Item = StagedGroup> + use<> {
        let values = self
            .staged
            .remove(&(file.to_string(), field.to_string()))
            .unwrap_or_default();
        let drained: u64 = values.values().flat_map(|s| s.values()).map(|o| o.len()).sum();
        self.count -= drained as usize;
        values.into_iter().flat_map(|(value, segments)| {
            segments.into_iter().map(move |(segment, offsets)| StagedGroup {
                value: value.clone(),
                segment,
                offsets,
            })
        })
    }

    /// Put drained groups back, e.g. after a failed merge.
    pub fn restage(&mut self, file: &str, field: &str, groups: Vec<StagedGroup>) {
        let values = self.staged.entry((file.to_string(), field.to_string())).or_default();
        for group in groups {
            let offsets = values.entry(group.value).or_default().entry(group.segment).or_default();
            let before = offsets.len();
            *offsets |= group.offsets;
            self.count += (offsets.len() - before) as usize;
        }
    }

    /// Staged associations across all files and fields.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// (file, field) pairs with staged data, in order.
    pub fn fields(&self) -> Vec<FieldKey> {
        self.staged.keys().cloned().collect()
    }

    pub fn fields_of(&self, file: &str) -> Vec<String> {
        self.staged
            .keys()
            .filter(|(f, _)| f == file)
            .map(|(_, field)| field.clone())
            .collect()
    }

    pub fn clear(&mut self) {
        self.staged.clear();
        self.count = 0;
    }
}
