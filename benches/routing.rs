use bson::oid::ObjectId;
use bson::{doc, Bson, Timestamp};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pasarela::core::order::compare_docs;
use pasarela::core::shard::{Shard, ShardPool};
use pasarela::core::Namespace;
use pasarela::topology::{hash_key, Snapshot};

fn build_snapshot(chunks_per_shard: usize) -> Snapshot {
    let epoch = ObjectId::new();
    let shards = vec![
        doc! { "_id": "s1", "host": "h1:27018" },
        doc! { "_id": "s2", "host": "h2:27018" },
    ];

    let mut chunks = Vec::new();
    let total = chunks_per_shard * 2;
    for i in 0..total {
        let min = if i == 0 { doc! { "k": Bson::MinKey } } else { doc! { "k": (i as i64) * 100 } };
        let max = if i == total - 1 {
            doc! { "k": Bson::MaxKey }
        } else {
            doc! { "k": ((i + 1) as i64) * 100 }
        };
        chunks.push(Bson::Document(doc! {
            "ns": "db.c",
            "lastmodEpoch": epoch,
            "lastmod": Timestamp { time: 1, increment: i as u32 + 1 },
            "min": min,
            "max": max,
            "shard": if i % 2 == 0 { "s1" } else { "s2" },
        }));
    }

    let raw = doc! {
        "shards": shards,
        "databases": [ { "_id": "db", "partitioned": true, "primary": "s1" } ],
        "collections": [ { "_id": "db.c", "key": { "k": 1 } } ],
        "chunks": chunks,
    };

    let pool = ShardPool::new();
    let config_shard = Shard::make("config", "cfg1:27019,cfg2:27019").unwrap();
    Snapshot::build(config_shard, raw, &pool).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let snapshot = rt.block_on(async { build_snapshot(128) });
    let ns = Namespace::parse("db.c").unwrap();

    c.bench_function("point_lookup", |b| {
        b.iter(|| {
            let hit = snapshot.find(&ns, &doc! { "k": black_box(12345_i64) });
            black_box(hit.len());
        })
    });

    c.bench_function("in_fanout", |b| {
        let selector = doc! { "k": { "$in": [5_i64, 105, 205, 10005, 20005] } };
        b.iter(|| {
            let hit = snapshot.find(&ns, black_box(&selector));
            black_box(hit.len());
        })
    });

    c.bench_function("hashed_key", |b| {
        b.iter(|| {
            black_box(hash_key(Some(&Bson::Int64(black_box(987654321)))));
        })
    });

    c.bench_function("doc_compare", |b| {
        let x = doc! { "k": 100_i64, "s": "abcdef" };
        let y = doc! { "k": 100_i64, "s": "abcdeg" };
        b.iter(|| black_box(compare_docs(black_box(&x), black_box(&y))));
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
