use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use segstore::{Config, Database, FileSpec, MemoryEngine, Record, SegmentSize};

/// Helper to create records with a few tag values each
fn create_records(count: usize) -> Vec<Record> {
    let mut rng = rand::thread_rng();
    let tags = ["opening", "middlegame", "endgame", "blitz", "rapid", "classical"];
    (0..count)
        .map(|i| {
            let mut record = Record::new(format!("game {}", i));
            for _ in 0..rng.gen_range(1..3) {
                record.add_index_value("Tag", tags[rng.gen_range(0..tags.len())]);
            }
            record.add_index_value("Event", format!("event-{}", rng.gen_range(0..50)));
            record
        })
        .collect()
}

fn open_database() -> Database<MemoryEngine> {
    let spec = FileSpec::new().add_file("Games", "game", &["Tag", "Event"]);
    let config = Config::default().with_segment_size(SegmentSize::for_testing());
    let mut db = Database::with_engine(MemoryEngine::new(), spec, config).unwrap();
    db.open_database().unwrap();
    db
}

/// Benchmark loading records with index updates applied per record
fn bench_normal_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("normal_load");

    for count in [1_000, 10_000].iter() {
        let records = create_records(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &records, |b, records| {
            b.iter(|| {
                let mut db = open_database();
                for record in records {
                    black_box(db.put_instance("Games", record).unwrap());
                }
            });
        });
    }

    group.finish();
}

/// Benchmark the same load through a deferred update session
fn bench_deferred_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("deferred_load");

    for count in [1_000, 10_000].iter() {
        let records = create_records(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &records, |b, records| {
            b.iter(|| {
                let mut db = open_database();
                db.set_defer_update().unwrap();
                for record in records {
                    black_box(db.put_instance("Games", record).unwrap());
                }
                db.unset_defer_update().unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark lookups of a dense value
fn bench_lookup(c: &mut Criterion) {
    let mut db = open_database();
    for record in create_records(10_000) {
        db.put_instance("Games", &record).unwrap();
    }

    c.bench_function("lookup_dense_value", |b| {
        b.iter(|| {
            let found = db.lookup("Games", "Tag", black_box(b"endgame")).unwrap();
            black_box(found.iter().count())
        });
    });
}

criterion_group!(benches, bench_normal_load, bench_deferred_load, bench_lookup);
criterion_main!(benches);
