use crate::core::error::{Error, ErrorKind, Result};
use crate::storage::segment_size::SegmentSize;

#[derive(Debug, Clone)]
pub struct Config {
    pub segment_size: SegmentSize,              // Requested; a stored size wins on open
    pub deferred_update_points: Option<Vec<u32>>, // Offsets in a segment where deferred updates merge
    pub deferred_flush_threshold: Option<usize>,  // Staged associations forcing a merge
    pub segment_table_cache_size: usize,        // LRU capacity for segment tables
    pub reuse_record_numbers: bool,             // Refill freed record numbers in normal mode
}

impl Default for Config {
    fn default() -> Self {
        Config {
            segment_size: SegmentSize::default(),
            deferred_update_points: None,
            deferred_flush_threshold: None,
            segment_table_cache_size: 1024,
            reuse_record_numbers: false,
        }
    }
}

impl Config {
    pub fn with_segment_size(mut self, segment_size: SegmentSize) -> Self {
        self.segment_size = segment_size;
        self
    }

    pub fn with_deferred_update_points(mut self, points: Vec<u32>) -> Self {
        self.deferred_update_points = Some(points);
        self
    }

    pub fn with_deferred_flush_threshold(mut self, threshold: usize) -> Self {
        self.deferred_flush_threshold = Some(threshold);
        self
    }

    pub fn with_segment_table_cache_size(mut self, capacity: usize) -> Self {
        self.segment_table_cache_size = capacity;
        self
    }

    pub fn with_reuse_record_numbers(mut self, reuse: bool) -> Self {
        self.reuse_record_numbers = reuse;
        self
    }

    /// Update points for `size`, sorted and deduplicated.
    pub fn update_points(&self, size: SegmentSize) -> Result<Vec<u32>> {
        let mut points = match &self.deferred_update_points {
            Some(points) => points.clone(),
            None => size.default_deferred_update_points(),
        };
        if let Some(bad) = points.iter().find(|p| **p >= size.records()) {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!(
                    "Deferred update point {} outside segment of {} records",
                    bad,
                    size.records()
                ),
            ));
        }
        points.sort_unstable();
        points.dedup();
        Ok(points)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_table_cache_size == 0 {
            return Err(Error::new(
                ErrorKind::Configuration,
                "Segment table cache size must be positive".to_string(),
            ));
        }
        if self.deferred_flush_threshold == Some(0) {
            return Err(Error::new(
                ErrorKind::Configuration,
                "Deferred flush threshold must be positive".to_string(),
            ));
        }
        self.update_points(self.segment_size).map(|_| ())
    }
}
