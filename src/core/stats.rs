use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use crate::index::table_cache::CacheStats;

/// Database statistics for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub mode: DatabaseMode,
    pub segment_size_bytes: u32,
    pub records_per_segment: u32,

    // Deferred session
    pub staged_associations: usize,

    pub table_cache: CacheStats,
    pub files: BTreeMap<String, FileStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStats {
    pub live_records: u64,
    pub high_record_number: Option<u64>,
    pub existence_segments: usize,
    /// High record number when the current deferred session began.
    pub deferred_start: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatabaseMode {
    Closed,
    Normal,
    Deferred,
}
