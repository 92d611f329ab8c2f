use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::Rng;
use std::sync::Arc;
use std::thread;
use tazeh_cache::{
    CacheEntry, CacheKey, Generation, MemoryStore, PolicySelector, ResourceRequest, Response,
    RoutingRules,
};
use url::Url;

const KEYSPACE: usize = 10_000;

fn keys() -> Vec<CacheKey> {
    (0..KEYSPACE)
        .map(|i| {
            ResourceRequest::parse("GET", &format!("https://app.example/assets/{i}.js"))
                .unwrap()
                .key()
        })
        .collect()
}

fn populated(keys: &[CacheKey]) -> MemoryStore {
    let store = MemoryStore::new();
    let gen = Generation::new("bench");
    for key in keys {
        store
            .insert(CacheEntry::new(
                key.clone(),
                Response::new(200, vec![0u8; 256]),
                gen.clone(),
            ))
            .unwrap();
    }
    store
}

fn bench_lookup(c: &mut Criterion) {
    let keys = keys();
    let store = populated(&keys);
    let mut rng = rand::thread_rng();

    c.bench_function("memory_store/lookup_hit", |b| {
        b.iter(|| {
            let key = &keys[rng.gen_range(0..KEYSPACE)];
            black_box(store.lookup(key));
        })
    });
}

fn bench_insert(c: &mut Criterion) {
    let keys = keys();
    let store = MemoryStore::new();
    let gen = Generation::new("bench");
    let mut rng = rand::thread_rng();

    c.bench_function("memory_store/insert_overwrite", |b| {
        b.iter(|| {
            let key = keys[rng.gen_range(0..KEYSPACE)].clone();
            store
                .insert(CacheEntry::new(key, Response::new(200, "x"), gen.clone()))
                .unwrap();
        })
    });
}

fn bench_contended_lookup(c: &mut Criterion) {
    let keys = Arc::new(keys());
    let store = Arc::new(populated(&keys));
    let mut group = c.benchmark_group("memory_store/contended_lookup");

    for threads in [1, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let store = Arc::clone(&store);
                        let keys = Arc::clone(&keys);
                        thread::spawn(move || {
                            let mut rng = rand::thread_rng();
                            for _ in 0..1_000 {
                                let key = &keys[rng.gen_range(0..KEYSPACE)];
                                black_box(store.lookup(key));
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            })
        });
    }
    group.finish();
}

fn bench_classify(c: &mut Criterion) {
    let selector = PolicySelector::new(RoutingRules::for_origin(
        Url::parse("https://app.example").unwrap(),
    ));
    let requests: Vec<ResourceRequest> = [
        ("GET", "https://app.example/assets/app.3f2a.js"),
        ("GET", "https://fonts.gstatic.com/s/vazirmatn/v1.woff2"),
        ("GET", "https://fonts.googleapis.com/css2?family=Vazirmatn"),
        ("GET", "https://app.example/tools/word-counter"),
        ("POST", "https://app.example/assets/app.3f2a.js"),
    ]
    .iter()
    .map(|(m, u)| ResourceRequest::parse(m, u).unwrap())
    .collect();

    c.bench_function("policy/classify", |b| {
        b.iter(|| {
            for req in &requests {
                black_box(selector.classify(req));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_lookup,
    bench_insert,
    bench_contended_lookup,
    bench_classify
);
criterion_main!(benches);
