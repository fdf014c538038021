use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use crate::core::config::Config;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::stats::{DatabaseMode, DatabaseStats, FileStats};
use crate::core::transaction::TransactionState;
use crate::core::types::{Record, RecordNumber};
use crate::index::record_list::RecordList;
use crate::index::table_cache::CacheStats;
use crate::index::value_store::IndexValueStore;
use crate::schema::schema::FileSpec;
use crate::storage::codec::SegmentCodec;
use crate::storage::engine::Engine;
use crate::storage::existence::ExistenceBitmap;
use crate::storage::keys::{
    KeyLayout, CONTROL_SEGMENTS_WRITTEN_KEY, CONTROL_SEGMENT_SIZE_KEY, CONTROL_SPECIFICATION_KEY,
};
use crate::storage::segment_size::SegmentSize;
use crate::writer::merger::Merger;
use crate::writer::staging::DeferredStagingArea;

/// Segmented record store over any `Engine`.
///
/// A database is either closed or open, and an open database is either in
/// normal mode (index updates applied as records change) or in a deferred
/// update session (index updates staged and merged in sorted batches).
pub struct Database<E: Engine> {
    path: Option<PathBuf>,
    engine: Option<E>,
    spec: FileSpec,
    config: Config,
    state: State,
    transaction: TransactionState,
}

enum State {
    Closed,
    Open(OpenState),
}

struct OpenState {
    size: SegmentSize,
    update_points: Vec<u32>,
    store: IndexValueStore,
    ebms: BTreeMap<String, ExistenceBitmap>,
    segments_written: bool,
    mode: Mode,
}

enum Mode {
    Normal,
    Deferred(DeferredSession),
}

struct DeferredSession {
    staging: DeferredStagingArea,
    /// High record number of each file when the session began.
    initial_high: BTreeMap<String, Option<RecordNumber>>,
}

impl OpenState {
    fn build<E: Engine>(engine: &E, spec: &FileSpec, config: &Config, size: SegmentSize) -> Result<Self> {
        let codec = SegmentCodec::new(size);
        let update_points = config.update_points(size)?;
        let store = IndexValueStore::new(codec, config.segment_table_cache_size)?;
        let ebms = Self::load_ebms(engine, spec, codec)?;
        let segments_written = engine.get(CONTROL_SEGMENTS_WRITTEN_KEY)?.is_some();
        Ok(OpenState {
            size,
            update_points,
            store,
            ebms,
            segments_written,
            mode: Mode::Normal,
        })
    }

    fn mark_segments_written<E: Engine>(&mut self, engine: &mut E) -> Result<()> {
        if !self.segments_written {
            engine.put(CONTROL_SEGMENTS_WRITTEN_KEY, &[1])?;
            self.segments_written = true;
        }
        Ok(())
    }

    /// Undo the parts of a failed `put_instance` that may have landed.
    fn retract_put<E: Engine>(
        &mut self,
        engine: &mut E,
        file: &str,
        fields: &[String],
        record: &Record,
        record_number: RecordNumber,
    ) -> Result<()> {
        if let Some(ebm) = self.ebms.get_mut(file) {
            ebm.clear_bit(engine, record_number)?;
        }
        for field in fields {
            for value in record.index_values(field) {
                self.store.remove(engine, file, field, value, record_number)?;
            }
        }
        engine.delete(&KeyLayout.record_key(file, record_number))
    }

    fn load_ebms<E: Engine>(
        engine: &E,
        spec: &FileSpec,
        codec: SegmentCodec,
    ) -> Result<BTreeMap<String, ExistenceBitmap>> {
        spec.file_names()
            .map(|file| Ok((file.to_string(), ExistenceBitmap::load(engine, file, codec)?)))
            .collect()
    }

    fn is_deferred(&self) -> bool {
        matches!(self.mode, Mode::Deferred(_))
    }

    fn ebm(&self, file: &str) -> Result<&ExistenceBitmap> {
        self.ebms.get(file).ok_or_else(|| unknown_file(file))
    }

    /// Merge staged updates of `files` and flush their existence bitmaps.
    fn deferred_updates<E: Engine>(&mut self, engine: &mut E, files: &[String]) -> Result<()> {
        let Mode::Deferred(session) = &mut self.mode else {
            return Ok(());
        };
        for file in files {
            let mut merger = Merger::new(&mut *engine, &self.store, &mut session.staging);
            let stats = merger.merge_file(file)?;
            if let Some(ebm) = self.ebms.get_mut(file) {
                merger.finalize(ebm)?;
            }
            if stats.values > 0 {
                debug!(
                    file = %file,
                    values = stats.values,
                    segments = stats.segments,
                    added = stats.records_added,
                    "Applied deferred updates"
                );
            }
        }
        Ok(())
    }
}

fn open_parts<'a, E: Engine>(
    engine: &'a mut Option<E>,
    state: &'a mut State,
) -> Result<(&'a mut E, &'a mut OpenState)> {
    match (engine, state) {
        (Some(engine), State::Open(open)) => Ok((engine, open)),
        _ => Err(not_open()),
    }
}

fn not_open() -> Error {
    Error::new(ErrorKind::InvalidState, "Database is not open".to_string())
}

fn unknown_file(file: &str) -> Error {
    Error::new(ErrorKind::InvalidArgument, format!("Unknown file '{}'", file))
}

fn decode_segment_size(bytes: &[u8]) -> Result<u32> {
    let raw: [u8; 4] = bytes.try_into().map_err(|_| {
        Error::new(
            ErrorKind::Parse,
            format!("Stored segment size has {} bytes, expected 4", bytes.len()),
        )
    })?;
    Ok(u32::from_be_bytes(raw))
}

fn read_record<E: Engine>(engine: &E, file: &str, record_number: RecordNumber) -> Result<Option<Record>> {
    match engine.get(&KeyLayout.record_key(file, record_number))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

impl<E: Engine> Database<E> {
    /// A closed database; the engine is opened at `path` by `open_database`.
    pub fn new(path: Option<&Path>, spec: FileSpec, config: Config) -> Result<Self> {
        spec.validate()?;
        config.validate()?;
        Ok(Database {
            path: path.map(Path::to_path_buf),
            engine: None,
            spec,
            config,
            state: State::Closed,
            transaction: TransactionState::Idle,
        })
    }

    /// A closed database that opens on an engine the caller already holds.
    pub fn with_engine(engine: E, spec: FileSpec, config: Config) -> Result<Self> {
        let mut database = Self::new(None, spec, config)?;
        database.engine = Some(engine);
        Ok(database)
    }

    pub fn open_database(&mut self) -> Result<()> {
        if matches!(self.state, State::Open(_)) {
            return Err(Error::new(ErrorKind::InvalidState, "Database is already open".to_string()));
        }
        let mut engine = match self.engine.take() {
            Some(engine) => engine,
            None => E::open(self.path.as_deref())?,
        };
        // A failed open keeps the engine so the caller can retry on it.
        let result = Self::open_on(&mut engine, &self.spec, &self.config);
        self.engine = Some(engine);
        let open = result?;

        info!(
            segment_bytes = open.size.bytes(),
            records_per_segment = open.size.records(),
            files = open.ebms.len(),
            "Opened database"
        );
        self.state = State::Open(open);
        self.transaction = TransactionState::Idle;
        Ok(())
    }

    fn open_on(engine: &mut E, spec: &FileSpec, config: &Config) -> Result<OpenState> {
        let requested = config.segment_size;
        match engine.get(CONTROL_SEGMENT_SIZE_KEY)? {
            Some(bytes) => {
                let stored = decode_segment_size(&bytes)?;
                if stored != requested.bytes() {
                    warn!(requested = requested.bytes(), stored, "Database was created with another segment size");
                    return Err(Error::new(
                        ErrorKind::SegmentSizeMismatch { requested: requested.bytes(), stored },
                        format!(
                            "Requested segment size {} bytes, database uses {} bytes",
                            requested.bytes(),
                            stored
                        ),
                    ));
                }
            }
            None => engine.put(CONTROL_SEGMENT_SIZE_KEY, &requested.bytes().to_be_bytes())?,
        }

        match engine.get(CONTROL_SPECIFICATION_KEY)? {
            Some(bytes) => {
                let json = String::from_utf8(bytes).map_err(|e| {
                    Error::new(ErrorKind::Parse, format!("Stored specification is not UTF-8: {}", e))
                })?;
                let stored = FileSpec::from_json(&json)?;
                if !spec.is_consistent_with(&stored) {
                    return Err(Error::new(
                        ErrorKind::Configuration,
                        "File specification differs from the one stored in the database".to_string(),
                    ));
                }
            }
            None => engine.put(CONTROL_SPECIFICATION_KEY, spec.to_json()?.as_bytes())?,
        }

        OpenState::build(engine, spec, config, requested)
    }

    /// Close the database and its engine. Refused while a transaction or
    /// unmerged deferred updates are outstanding.
    pub fn close_database(&mut self) -> Result<()> {
        let State::Open(open) = &mut self.state else {
            return Ok(());
        };
        if self.transaction.is_active() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "Cannot close with a transaction outstanding".to_string(),
            ));
        }
        if let Mode::Deferred(session) = &open.mode {
            if !session.staging.is_empty() || open.ebms.values().any(|e| e.is_dirty()) {
                return Err(Error::deferred_state(
                    "Cannot close with deferred updates not yet applied",
                ));
            }
        }
        if let Some(engine) = self.engine.as_mut() {
            for ebm in open.ebms.values_mut() {
                ebm.flush_all(engine)?;
            }
            engine.close()?;
        }
        let cache = open.store.cache_stats();
        info!(
            table_cache_hits = cache.hit_count,
            table_cache_hit_rate = cache.hit_rate(),
            "Closed database"
        );
        self.engine = None;
        self.state = State::Closed;
        Ok(())
    }

    /// Request a segment size. While closed this applies at the next open;
    /// while open it is only allowed before any segment has been written.
    pub fn set_segment_size(&mut self, size: SegmentSize) -> Result<()> {
        let (engine, open) = match (&mut self.engine, &mut self.state) {
            (_, State::Closed) => {
                self.config.segment_size = size;
                return Ok(());
            }
            (Some(engine), State::Open(open)) => (engine, open),
            (None, State::Open(_)) => return Err(not_open()),
        };
        if open.size == size {
            return Ok(());
        }
        if open.is_deferred()
            || self.transaction.is_active()
            || open.segments_written
            || open.ebms.values().any(|e| e.segment_count() > 0)
        {
            return Err(Error::new(
                ErrorKind::Configuration,
                format!(
                    "Segment size cannot change to {} bytes once segments exist",
                    size.bytes()
                ),
            ));
        }
        let mut config = self.config.clone();
        config.segment_size = size;
        let rebuilt = OpenState::build(engine, &self.spec, &config, size)?;
        engine.put(CONTROL_SEGMENT_SIZE_KEY, &size.bytes().to_be_bytes())?;
        *open = rebuilt;
        self.config = config;
        info!(segment_bytes = size.bytes(), "Changed segment size");
        Ok(())
    }

    pub fn segment_size(&self) -> SegmentSize {
        match &self.state {
            State::Open(open) => open.size,
            State::Closed => self.config.segment_size,
        }
    }

    pub fn spec(&self) -> &FileSpec {
        &self.spec
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, State::Open(_))
    }

    pub fn mode(&self) -> DatabaseMode {
        match &self.state {
            State::Closed => DatabaseMode::Closed,
            State::Open(open) if open.is_deferred() => DatabaseMode::Deferred,
            State::Open(_) => DatabaseMode::Normal,
        }
    }

    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut E> {
        self.engine.as_mut()
    }

    /// Hand back the engine; `None` once the database has been closed.
    pub fn into_engine(self) -> Option<E> {
        self.engine
    }

    fn read_parts(&self) -> Result<(&E, &OpenState)> {
        match (&self.engine, &self.state) {
            (Some(engine), State::Open(open)) => Ok((engine, open)),
            _ => Err(not_open()),
        }
    }

    fn check_field(&self, file: &str, field: &str) -> Result<()> {
        let definition = self.spec.file(file).ok_or_else(|| unknown_file(file))?;
        if !definition.secondary.contains(field) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("File '{}' has no indexed field '{}'", file, field),
            ));
        }
        Ok(())
    }

    /// Secondary fields of `file`, rejecting index values for any other field.
    fn indexed_fields(&self, file: &str, record: &Record) -> Result<Vec<String>> {
        let definition = self.spec.file(file).ok_or_else(|| unknown_file(file))?;
        if let Some(field) = record.index.keys().find(|f| !definition.secondary.contains(*f)) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("File '{}' has no indexed field '{}'", file, field),
            ));
        }
        Ok(definition.secondary.iter().cloned().collect())
    }

    // Transactions. A deferred session is not transactional: start and
    // commit do nothing and backout is refused.

    pub fn start_transaction(&mut self) -> Result<()> {
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;
        if open.is_deferred() {
            return Ok(());
        }
        if self.transaction.is_active() {
            return Err(Error::new(
                ErrorKind::InvalidState,
                "A transaction is already outstanding".to_string(),
            ));
        }
        engine.begin()?;
        self.transaction = TransactionState::Active;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;
        if open.is_deferred() || !self.transaction.is_active() {
            return Ok(());
        }
        engine.commit()?;
        self.transaction = TransactionState::Idle;
        Ok(())
    }

    /// Roll back the outstanding transaction and drop cached state derived from it.
    pub fn backout(&mut self) -> Result<()> {
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;
        if open.is_deferred() {
            return Err(Error::deferred_state(
                "Backout is not available during a deferred update session",
            ));
        }
        if !self.transaction.is_active() {
            return Ok(());
        }
        self.transaction = TransactionState::Idle;
        let rolled_back = engine.rollback();
        open.store.clear_cache();
        open.ebms = OpenState::load_ebms(engine, &self.spec, open.store.codec())?;
        open.segments_written = engine.get(CONTROL_SEGMENTS_WRITTEN_KEY)?.is_some();
        rolled_back
    }

    // Records.

    /// Store `record` under a new record number and index it.
    ///
    /// A failed put takes back whatever part of it was written, so the record
    /// number stays free and no index entry points at it.
    pub fn put_instance(&mut self, file: &str, record: &Record) -> Result<RecordNumber> {
        let fields = self.indexed_fields(file, record)?;
        let reuse = self.config.reuse_record_numbers;
        let threshold = self.config.deferred_flush_threshold;
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;

        let ebm = open.ebms.get_mut(file).ok_or_else(|| unknown_file(file))?;
        let record_number = match open.mode {
            Mode::Normal if reuse => match ebm.lowest_freed_record_number(engine)? {
                Some(free) => free,
                None => ebm.next_record_number(),
            },
            _ => ebm.next_record_number(),
        };
        open.mark_segments_written(engine)?;
        engine.put(&KeyLayout.record_key(file, record_number), &bincode::serialize(record)?)?;

        let (segment, offset) = open.size.split(record_number);
        if let Err(err) = Self::apply_put(engine, open, file, &fields, record, record_number) {
            warn!(file, record = record_number.0, error = %err, "Put failed, taking it back");
            if let Err(undo) = open.retract_put(engine, file, &fields, record, record_number) {
                warn!(file, record = record_number.0, error = %undo, "Could not take back failed put");
            }
            return Err(err);
        }

        let flush_files = match &open.mode {
            Mode::Normal => {
                if let Some(ebm) = open.ebms.get_mut(file) {
                    ebm.flush(engine, segment)?;
                }
                Vec::new()
            }
            Mode::Deferred(session) => {
                if threshold.is_some_and(|t| session.staging.len() >= t) {
                    open.ebms.keys().cloned().collect()
                } else if open.update_points.binary_search(&offset).is_ok() {
                    vec![file.to_string()]
                } else {
                    Vec::new()
                }
            }
        };
        open.deferred_updates(engine, &flush_files)?;
        Ok(record_number)
    }

    /// Mark a stored record live and index it, or stage its index values.
    fn apply_put(
        engine: &mut E,
        open: &mut OpenState,
        file: &str,
        fields: &[String],
        record: &Record,
        record_number: RecordNumber,
    ) -> Result<()> {
        let ebm = open.ebms.get_mut(file).ok_or_else(|| unknown_file(file))?;
        ebm.set_bit(engine, record_number)?;
        for field in fields {
            for value in record.index_values(field) {
                match &mut open.mode {
                    Mode::Normal => {
                        open.store.insert(engine, file, field, value, record_number)?;
                    }
                    Mode::Deferred(session) => {
                        session.staging.add(file, field, value, record_number);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove a record and every index entry it has.
    pub fn delete_instance(&mut self, file: &str, record_number: RecordNumber) -> Result<()> {
        self.spec.file(file).ok_or_else(|| unknown_file(file))?;
        let fields: Vec<String> = self.spec.secondary_fields(file).map(str::to_string).collect();
        let reuse = self.config.reuse_record_numbers;
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;

        let record = read_record(engine, file, record_number)?.ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("No record {} in file '{}'", record_number, file),
            )
        })?;
        for field in &fields {
            for value in record.index_values(field) {
                if let Mode::Deferred(session) = &mut open.mode {
                    session.staging.remove(file, field, value, record_number);
                }
                open.store.remove(engine, file, field, value, record_number)?;
            }
        }
        engine.delete(&KeyLayout.record_key(file, record_number))?;

        let deferred = open.is_deferred();
        let ebm = open.ebms.get_mut(file).ok_or_else(|| unknown_file(file))?;
        ebm.clear_bit(engine, record_number)?;
        let (segment, _) = open.size.split(record_number);
        if reuse {
            ebm.note_freed(engine, segment)?;
        }
        if !deferred {
            ebm.flush(engine, segment)?;
        }
        Ok(())
    }

    /// Replace a stored record, moving its index entries to the new values.
    /// New values are indexed before old ones are dropped.
    pub fn edit_instance(&mut self, file: &str, record_number: RecordNumber, record: &Record) -> Result<()> {
        let fields = self.indexed_fields(file, record)?;
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;

        let old = read_record(engine, file, record_number)?.ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                format!("No record {} in file '{}'", record_number, file),
            )
        })?;
        for field in &fields {
            let old_values = old.index_values(field);
            let new_values = record.index_values(field);
            let added: Vec<&[u8]> = new_values.iter().filter(|v| !old_values.contains(*v)).copied().collect();
            let dropped: Vec<&[u8]> = old_values.iter().filter(|v| !new_values.contains(*v)).copied().collect();

            match &mut open.mode {
                Mode::Normal if added.len() == 1 && dropped.len() == 1 => {
                    open.store.rekey(engine, file, field, dropped[0], added[0], record_number)?;
                }
                Mode::Normal => {
                    for value in &added {
                        open.store.insert(engine, file, field, value, record_number)?;
                    }
                    for value in &dropped {
                        open.store.remove(engine, file, field, value, record_number)?;
                    }
                }
                Mode::Deferred(session) => {
                    for value in &added {
                        session.staging.add(file, field, value, record_number);
                    }
                    for value in &dropped {
                        session.staging.remove(file, field, value, record_number);
                        open.store.remove(engine, file, field, value, record_number)?;
                    }
                }
            }
        }
        engine.put(&KeyLayout.record_key(file, record_number), &bincode::serialize(record)?)?;
        Ok(())
    }

    pub fn get_primary_record(&self, file: &str, record_number: RecordNumber) -> Result<Option<Record>> {
        let (engine, open) = self.read_parts()?;
        open.ebm(file)?;
        read_record(engine, file, record_number)
    }

    // Deferred update sessions.

    pub fn set_defer_update(&mut self) -> Result<()> {
        let active = self.transaction.is_active();
        let (_, open) = open_parts(&mut self.engine, &mut self.state)?;
        if open.is_deferred() {
            return Err(Error::deferred_state("Deferred update session already started"));
        }
        if active {
            return Err(Error::deferred_state(
                "Cannot start a deferred update session with a transaction outstanding",
            ));
        }
        let initial_high = open
            .ebms
            .iter()
            .map(|(file, ebm)| (file.clone(), ebm.high_record_number()))
            .collect();
        open.mode = Mode::Deferred(DeferredSession {
            staging: DeferredStagingArea::new(open.size),
            initial_high,
        });
        info!("Started deferred update session");
        Ok(())
    }

    /// Apply everything still staged, including a partly filled last segment.
    /// Does nothing outside a deferred session.
    pub fn do_final_segment_deferred_updates(&mut self) -> Result<()> {
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;
        let files: Vec<String> = match &open.mode {
            Mode::Normal => return Ok(()),
            Mode::Deferred(session) => {
                for (file, high) in &session.initial_high {
                    debug!(file = %file, initial_high = ?high.map(|h| h.0), "Applying final deferred updates");
                }
                open.ebms.keys().cloned().collect()
            }
        };
        open.deferred_updates(engine, &files)
    }

    pub fn unset_defer_update(&mut self) -> Result<()> {
        if self.mode() != DatabaseMode::Deferred {
            return Err(Error::deferred_state("No deferred update session to end"));
        }
        self.do_final_segment_deferred_updates()?;
        let (_, open) = open_parts(&mut self.engine, &mut self.state)?;
        open.mode = Mode::Normal;
        info!("Ended deferred update session");
        Ok(())
    }

    // Queries. During a deferred session these see merged data only.

    pub fn lookup(&self, file: &str, field: &str, value: &[u8]) -> Result<RecordList> {
        self.check_field(file, field)?;
        let (engine, open) = self.read_parts()?;
        open.store.lookup(engine, file, field, value)
    }

    pub fn count_records(&self, file: &str, field: &str, value: &[u8]) -> Result<u64> {
        self.check_field(file, field)?;
        let (engine, open) = self.read_parts()?;
        open.store.count(engine, file, field, value)
    }

    /// Every live record of `file`.
    pub fn recordlist_ebm(&self, file: &str) -> Result<RecordList> {
        let (engine, open) = self.read_parts()?;
        open.ebm(file)?.live_records(engine)
    }

    pub fn high_record_number(&self, file: &str) -> Result<Option<RecordNumber>> {
        let (_, open) = self.read_parts()?;
        Ok(open.ebm(file)?.high_record_number())
    }

    pub fn is_live(&self, file: &str, record_number: RecordNumber) -> Result<bool> {
        let (engine, open) = self.read_parts()?;
        open.ebm(file)?.is_live(engine, record_number)
    }

    // Whole index entries.

    /// Replace the records indexed under `value` with `records`.
    pub fn file_records_under(&mut self, file: &str, field: &str, value: &[u8], records: &RecordList) -> Result<()> {
        self.check_field(file, field)?;
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;
        if open.is_deferred() {
            return Err(Error::deferred_state(
                "Index entries cannot be replaced during a deferred update session",
            ));
        }
        if records.segment_size() != open.size {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "Record list was built for another segment size".to_string(),
            ));
        }
        if !records.is_empty() {
            open.mark_segments_written(engine)?;
        }
        open.store.file_records(engine, file, field, value, records)
    }

    pub fn unfile_records_under(&mut self, file: &str, field: &str, value: &[u8]) -> Result<()> {
        self.check_field(file, field)?;
        let (engine, open) = open_parts(&mut self.engine, &mut self.state)?;
        if open.is_deferred() {
            return Err(Error::deferred_state(
                "Index entries cannot be removed during a deferred update session",
            ));
        }
        open.store.unfile_records(engine, file, field, value)
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let size = self.segment_size();
        let (engine, open) = match (&self.engine, &self.state) {
            (Some(engine), State::Open(open)) => (engine, open),
            _ => {
                return Ok(DatabaseStats {
                    mode: DatabaseMode::Closed,
                    segment_size_bytes: size.bytes(),
                    records_per_segment: size.records(),
                    staged_associations: 0,
                    table_cache: CacheStats::default(),
                    files: BTreeMap::new(),
                });
            }
        };

        let (staged_associations, initial_high) = match &open.mode {
            Mode::Normal => (0, None),
            Mode::Deferred(session) => (session.staging.len(), Some(&session.initial_high)),
        };
        let mut files = BTreeMap::new();
        for (file, ebm) in &open.ebms {
            files.insert(
                file.clone(),
                FileStats {
                    live_records: ebm.live_records(engine)?.len(),
                    high_record_number: ebm.high_record_number().map(|h| h.0),
                    existence_segments: ebm.segment_count(),
                    deferred_start: initial_high
                        .and_then(|h| h.get(file).copied().flatten())
                        .map(|h| h.0),
                },
            );
        }

        Ok(DatabaseStats {
            mode: self.mode(),
            segment_size_bytes: size.bytes(),
            records_per_segment: size.records(),
            staged_associations,
            table_cache: open.store.cache_stats(),
            files,
        })
    }
}
