use segstore::index::segment_table::SegmentTable;
use segstore::storage::codec::{SegmentCodec, SegmentKind};
use segstore::storage::existence::ExistenceBitmap;
use segstore::{
    Config, Database, DatabaseMode, Engine, ErrorKind, FileEngine, FileSpec, MemoryEngine, Record,
    RecordNumber, SegmentSize,
};

fn games_spec() -> FileSpec {
    FileSpec::new().add_file("Games", "game", &["F", "Tag"])
}

fn size16() -> SegmentSize {
    SegmentSize::from_records(16).unwrap()
}

fn open_memory(config: Config) -> (Database<MemoryEngine>, MemoryEngine) {
    let engine = MemoryEngine::new();
    let mut db = Database::with_engine(engine.clone(), games_spec(), config).unwrap();
    db.open_database().unwrap();
    (db, engine)
}

fn numbers(db: &Database<MemoryEngine>, field: &str, value: &[u8]) -> Vec<u64> {
    db.lookup("Games", field, value).unwrap().iter().map(|r| r.0).collect()
}

fn table(engine: &MemoryEngine, key: &[u8]) -> SegmentTable {
    SegmentTable::from_bytes(&engine.get(key).unwrap().unwrap()).unwrap()
}

#[test]
fn test_kind_flips_to_bitmap_at_first_member() {
    let (mut db, engine) = open_memory(Config::default().with_segment_size(size16()));

    for n in 0..16u64 {
        let record = db.put_instance("Games", &Record::new(format!("g{}", n)).with_index("F", "X")).unwrap();
        assert_eq!(record, RecordNumber(n));

        // Bitmap is 2 bytes, so one 2-byte list entry already matches it.
        let entry = table(&engine, b"Games_F_X").get(0).unwrap();
        assert_eq!(entry.kind, SegmentKind::Bitmap);
        assert_eq!(entry.count as u64, n + 1);
        let stored = engine.get(b"Games_F_X_segment_0").unwrap().unwrap();
        assert_eq!(stored.len(), 3);
    }

    assert_eq!(numbers(&db, "F", b"X"), (0..16).collect::<Vec<_>>());
}

#[test]
fn test_deferred_session_merges_in_one_pass() {
    let (mut db, engine) = open_memory(Config::default().with_segment_size(size16()));
    db.set_defer_update().unwrap();

    let mut expected = Vec::new();
    for n in 0..1000u64 {
        let mut record = Record::new(format!("g{}", n));
        if n % 7 != 3 {
            record.add_index_value("Tag", "endgame");
            expected.push(n);
        }
        db.put_instance("Games", &record).unwrap();
    }
    db.unset_defer_update().unwrap();
    assert_eq!(db.mode(), DatabaseMode::Normal);

    assert_eq!(numbers(&db, "Tag", b"endgame"), expected);
    assert_eq!(db.count_records("Games", "Tag", b"endgame").unwrap(), expected.len() as u64);

    let segment_keys: Vec<Vec<u8>> = engine
        .keys()
        .into_iter()
        .filter(|k| k.starts_with(b"Games_Tag_endgame_segment_"))
        .collect();
    let segments = table(&engine, b"Games_Tag_endgame").segments();
    assert_eq!(segment_keys.len(), segments.len());
    assert_eq!(segments, (0..63u64).collect::<Vec<_>>());
}

#[test]
fn test_high_water_mark_follows_clears() {
    let mut engine = MemoryEngine::new();
    let codec = SegmentCodec::new(size16());
    let mut ebm = ExistenceBitmap::load(&engine, "Games", codec).unwrap();

    for n in [5u64, 5000, 5001] {
        ebm.set_bit(&engine, RecordNumber(n)).unwrap();
    }
    assert_eq!(ebm.high_record_number(), Some(RecordNumber(5001)));
    ebm.clear_bit(&engine, RecordNumber(5001)).unwrap();
    assert_eq!(ebm.high_record_number(), Some(RecordNumber(5000)));

    ebm.flush_all(&mut engine).unwrap();
    let reloaded = ExistenceBitmap::load(&engine, "Games", codec).unwrap();
    assert_eq!(reloaded.high_record_number(), Some(RecordNumber(5000)));
}

#[test]
fn test_reopen_with_stored_segment_size() {
    let dir = tempfile::tempdir().unwrap();
    {
        let config = Config::default().with_segment_size(size16());
        let mut db: Database<FileEngine> = Database::new(Some(dir.path()), games_spec(), config).unwrap();
        db.open_database().unwrap();
        db.put_instance("Games", &Record::new("g").with_index("Tag", "opening")).unwrap();
        db.close_database().unwrap();
    }

    let config = Config::default().with_segment_size(SegmentSize::configure(Some(4000)).unwrap());
    let mut db: Database<FileEngine> = Database::new(Some(dir.path()), games_spec(), config).unwrap();
    let err = db.open_database().unwrap_err();
    assert_eq!(err.kind, ErrorKind::SegmentSizeMismatch { requested: 4000, stored: 2 });
    assert!(!db.is_open());

    let stored = err.stored_segment_size().unwrap();
    db.set_segment_size(SegmentSize::configure(Some(stored)).unwrap()).unwrap();
    db.open_database().unwrap();
    assert_eq!(db.segment_size(), size16());
    let found: Vec<u64> = db.lookup("Games", "Tag", b"opening").unwrap().iter().map(|r| r.0).collect();
    assert_eq!(found, vec![0]);
    db.close_database().unwrap();
}

#[test]
fn test_corrupt_segment_is_reported() {
    let (mut db, _) = open_memory(Config::default().with_segment_size(size16()));
    for n in 0..40u64 {
        db.put_instance("Games", &Record::new(format!("g{}", n)).with_index("Tag", "x")).unwrap();
    }

    let engine = db.engine_mut().unwrap();
    let stored = engine.get(b"Games_Tag_x_segment_1").unwrap().unwrap();
    assert_eq!(stored[0], SegmentKind::Bitmap.tag());
    engine.put(b"Games_Tag_x_segment_1", &stored[..stored.len() - 1]).unwrap();

    let err = db.lookup("Games", "Tag", b"x").unwrap_err();
    assert_eq!(err.kind, ErrorKind::CorruptSegment);
}

#[test]
fn test_specification_must_match_stored() {
    let engine = MemoryEngine::new();
    let config = Config::default().with_segment_size(size16());
    let mut db = Database::with_engine(engine.clone(), games_spec(), config.clone()).unwrap();
    db.open_database().unwrap();
    db.close_database().unwrap();

    let changed = FileSpec::new().add_file("Games", "game", &["F", "Tag", "Event"]);
    let mut db = Database::with_engine(engine.clone(), changed, config.clone()).unwrap();
    assert_eq!(db.open_database().unwrap_err().kind, ErrorKind::Configuration);

    let mut db = Database::with_engine(engine, games_spec(), config).unwrap();
    db.open_database().unwrap();
}

#[test]
fn test_file_engine_rejects_memory_only_database() {
    let mut db: Database<FileEngine> = Database::new(None, games_spec(), Config::default()).unwrap();
    assert_eq!(db.open_database().unwrap_err().kind, ErrorKind::InvalidArgument);
}

#[test]
fn test_file_and_unfile_records_under() {
    let (mut db, _) = open_memory(Config::default().with_segment_size(size16()));
    for n in 0..30u64 {
        let tag = if n % 2 == 0 { "even" } else { "odd" };
        db.put_instance("Games", &Record::new(format!("g{}", n)).with_index("Tag", tag)).unwrap();
    }

    let live = db.recordlist_ebm("Games").unwrap();
    assert_eq!(live.len(), 30);
    let even = db.lookup("Games", "Tag", b"even").unwrap();
    db.file_records_under("Games", "Tag", b"all-even", &even).unwrap();
    assert_eq!(numbers(&db, "Tag", b"all-even"), numbers(&db, "Tag", b"even"));

    db.unfile_records_under("Games", "Tag", b"all-even").unwrap();
    assert!(db.lookup("Games", "Tag", b"all-even").unwrap().is_empty());
    assert_eq!(live.difference(&even).len(), 15);
}
