use arbor::field::encode_int;
use arbor::{BlinkIndex, Field, Store, StoreConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

fn setup_store(rows: i32) -> (TempDir, Store, BlinkIndex) {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::default()
        .with_data_dir(temp_dir.path())
        .with_buffer_pool_size(4096);
    let store = Store::open(config).unwrap();
    let tx = store.begin();
    let index = store
        .create_index(&tx, "bench", Field::Int, Field::Bytes, true)
        .unwrap();
    for i in 0..rows {
        index
            .insert(&tx, &encode_int(i), format!("value{i:08}").as_bytes())
            .unwrap();
    }
    store.commit(&tx).unwrap();
    (temp_dir, store, index)
}

fn benchmark_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_insert");
    for count in [1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("sequential", count), &count, |b, &count| {
            b.iter_with_setup(
                || setup_store(0),
                |(dir, store, index)| {
                    let tx = store.begin();
                    for i in 0..count {
                        index.insert(&tx, &encode_int(i), b"payload").unwrap();
                    }
                    store.commit(&tx).unwrap();
                    (dir, store)
                },
            );
        });
        group.bench_with_input(BenchmarkId::new("scattered", count), &count, |b, &count| {
            b.iter_with_setup(
                || setup_store(0),
                |(dir, store, index)| {
                    let tx = store.begin();
                    for i in 0..count {
                        let k = (i as i64 * 7919 % count as i64) as i32;
                        index.insert(&tx, &encode_int(k), b"payload").unwrap();
                    }
                    store.commit(&tx).unwrap();
                    (dir, store)
                },
            );
        });
    }
    group.finish();
}

fn benchmark_point_lookup(c: &mut Criterion) {
    let (_dir, store, index) = setup_store(50_000);
    let tx = store.begin();
    let mut i = 0;
    c.bench_function("point_lookup", |b| {
        b.iter(|| {
            i = (i + 7919) % 50_000;
            black_box(index.get(&tx, &encode_int(black_box(i))).unwrap())
        })
    });
    store.commit(&tx).unwrap();
}

fn benchmark_scan(c: &mut Criterion) {
    let (_dir, store, index) = setup_store(50_000);
    let tx = store.begin();
    let mut group = c.benchmark_group("index_scan");
    group.throughput(Throughput::Elements(50_000));
    group.bench_function("full", |b| {
        b.iter(|| index.scan(&tx, None).map(|entry| entry.unwrap().1.len()).sum::<usize>())
    });
    group.finish();
    store.commit(&tx).unwrap();
}

criterion_group!(benches, benchmark_insert, benchmark_point_lookup, benchmark_scan);
criterion_main!(benches);
