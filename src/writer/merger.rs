use tracing::{debug, warn};
use crate::core::error::Result;
use crate::index::value_store::IndexValueStore;
use crate::storage::engine::Engine;
use crate::storage::existence::ExistenceBitmap;
use crate::writer::staging::{DeferredStagingArea, StagedGroup};

/// Counts from one or more field merges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub values: usize,
    pub segments: usize,
    pub records_added: u64,
}

impl MergeStats {
    fn absorb(&mut self, other: MergeStats) {
        self.values += other.values;
        self.segments += other.segments;
        self.records_added += other.records_added;
    }
}

/// Folds staged groups into the stored index segments.
pub struct Merger<'a, E: Engine> {
    engine: &'a mut E,
    store: &'a IndexValueStore,
    staging: &'a mut DeferredStagingArea,
}

impl<'a, E: Engine> Merger<'a, E> {
    pub fn new(engine: &'a mut E, store: &'a IndexValueStore, staging: &'a mut DeferredStagingArea) -> Self {
        Merger { engine, store, staging }
    }

    /// Merge everything staged for (file, field) inside one engine transaction.
    ///
    /// On failure the transaction is rolled back and the groups are staged
    /// again, so the field can be merged later.
    pub fn merge(&mut self, file: &str, field: &str) -> Result<MergeStats> {
        let groups: Vec<StagedGroup> = self.staging.drain(file, field).collect();
        if groups.is_empty() {
            return Ok(MergeStats::default());
        }

        let result = self
            .engine
            .begin()
            .and_then(|_| self.apply(file, field, &groups))
            .and_then(|stats| self.engine.commit().map(|_| stats));

        match result {
            Ok(stats) => {
                debug!(
                    file,
                    field,
                    values = stats.values,
                    segments = stats.segments,
                    added = stats.records_added,
                    "Merged staged index updates"
                );
                Ok(stats)
            }
            Err(e) => {
                if !self.engine.supports_transactions() {
                    // Merging is a union, so staging the groups again is safe.
                    warn!(file, field, error = %e, "Merge failed on an engine without transactions, segments may be partly merged");
                } else if let Err(rollback) = self.engine.rollback() {
                    warn!(file, field, error = %rollback, "Rollback after failed merge also failed");
                }
                self.store.clear_cache();
                self.staging.restage(file, field, groups);
                Err(e)
            }
        }
    }

    fn apply(&mut self, file: &str, field: &str, groups: &[StagedGroup]) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        // Groups arrive sorted, so each value is one contiguous run.
        for run in groups.chunk_by(|a, b| a.value == b.value) {
            let value = &run[0].value;
            stats.records_added += self.store.merge_segments(
                &mut *self.engine,
                file,
                field,
                value,
                run.iter().map(|g| (g.segment, &g.offsets)),
            )?;
            stats.values += 1;
            stats.segments += run.len();
        }
        Ok(stats)
    }

    /// Merge every staged field of `file`.
    pub fn merge_file(&mut self, file: &str) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        for field in self.staging.fields_of(file) {
            stats.absorb(self.merge(file, &field)?);
        }
        Ok(stats)
    }

    /// Write out every existence bitmap segment touched since the last flush.
    pub fn finalize(&mut self, ebm: &mut ExistenceBitmap) -> Result<()> {
        ebm.flush_all(&mut *self.engine)
    }
}
