use cachet_core::{
    now_millis, CacheKey, CacheRecord, GlobPattern, JsonSerializer, Serializer, Staleness,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
    roles: Vec<String>,
    score: Option<i64>,
}

fn profile() -> Profile {
    Profile {
        id: 42,
        name: "Ada Lovelace".to_string(),
        roles: vec!["admin".to_string(), "editor".to_string()],
        score: Some(1_337),
    }
}

fn bench_keys(c: &mut Criterion) {
    c.bench_function("key/new_encode", |b| {
        b.iter(|| {
            let key = CacheKey::new("cache", "users", black_box("org-7:42")).expect("valid key");
            black_box(key.encode());
        })
    });

    c.bench_function("key/parse", |b| {
        b.iter(|| black_box(CacheKey::parse("cache", black_box("cache:users:org-7:42"))))
    });
}

fn bench_glob(c: &mut Criterion) {
    let glob = GlobPattern::new("cache:users:*:posts:*").expect("valid glob");
    let keys: Vec<String> = (0..256)
        .map(|i| format!("cache:users:{i}:posts:{}", i % 7))
        .collect();

    c.bench_function("glob/match_256", |b| {
        b.iter(|| keys.iter().filter(|k| glob.matches(black_box(k))).count())
    });
}

fn bench_records(c: &mut Criterion) {
    let serializer = JsonSerializer;
    let record = CacheRecord::with_window(
        profile(),
        now_millis(),
        Duration::from_secs(60),
        Duration::from_secs(30),
    );
    let bytes = serializer.serialize(&record).expect("encode record");

    c.bench_function("record/encode", |b| {
        b.iter(|| black_box(serializer.serialize(black_box(&record)).expect("encode")))
    });

    c.bench_function("record/decode_staleness", |b| {
        b.iter(|| {
            let decoded: CacheRecord<Profile> =
                serializer.deserialize(black_box(&bytes)).expect("decode");
            black_box(decoded.staleness(now_millis()) == Staleness::Fresh)
        })
    });
}

criterion_group!(benches, bench_keys, bench_glob, bench_records);
criterion_main!(benches);
