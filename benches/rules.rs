//! Benchmarks for the rule stores.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::TempDir;

use warden::list::{List, ListType};
use warden::rule::{HashStore, RuleStore, SqlStore};

fn generate_rules(size: usize) -> Vec<String> {
    (0..size)
        .map(|i| {
            if i % 10 == 0 {
                format!("*.ads{i}.net")
            } else {
                format!("blocked{i}.com")
            }
        })
        .collect()
}

fn block_list() -> Arc<List> {
    Arc::new(List {
        name: "bench".to_string(),
        list_type: ListType::Block,
        tags: Vec::new(),
        source: String::new(),
    })
}

fn load<S: RuleStore>(mut store: S, list: &Arc<List>, rules: &[String]) -> S {
    for rule in rules {
        store.load(list, rule);
    }
    store.finalize();
    store
}

fn bench_find_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_match");

    for size in &[100, 1_000, 10_000, 100_000] {
        let rules = generate_rules(*size);
        let list = block_list();
        let candidates = [Arc::clone(&list)];

        let hash = load(HashStore::new(), &list, &rules);
        let dir = TempDir::new().unwrap();
        let sql = load(
            SqlStore::open(dir.path(), &candidates).unwrap(),
            &list,
            &rules,
        );

        // exact hit via the suffix walk
        group.bench_with_input(BenchmarkId::new("hash_exact_hit", size), &hash, |b, store| {
            b.iter(|| store.find_match(black_box(&candidates), black_box("sub.blocked1.com")));
        });
        group.bench_with_input(BenchmarkId::new("sql_exact_hit", size), &sql, |b, store| {
            b.iter(|| store.find_match(black_box(&candidates), black_box("sub.blocked1.com")));
        });

        // wildcard hit, paid for by the complex-rule scan
        group.bench_with_input(
            BenchmarkId::new("hash_wildcard_hit", size),
            &hash,
            |b, store| {
                b.iter(|| store.find_match(black_box(&candidates), black_box("px.ads10.net")));
            },
        );

        // miss: the worst case walks every suffix and every complex rule
        group.bench_with_input(BenchmarkId::new("hash_miss", size), &hash, |b, store| {
            b.iter(|| store.find_match(black_box(&candidates), black_box("a.b.example.org")));
        });
        group.bench_with_input(BenchmarkId::new("sql_miss", size), &sql, |b, store| {
            b.iter(|| store.find_match(black_box(&candidates), black_box("a.b.example.org")));
        });
    }

    group.finish();
}

fn bench_store_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_build");
    group.sample_size(10);

    for size in &[1_000, 10_000] {
        let rules = generate_rules(*size);
        let list = block_list();

        group.bench_with_input(BenchmarkId::new("hash", size), &rules, |b, rules| {
            b.iter(|| load(HashStore::new(), &list, black_box(rules)));
        });

        group.bench_with_input(BenchmarkId::new("sql", size), &rules, |b, rules| {
            b.iter(|| {
                let dir = TempDir::new().unwrap();
                let store = SqlStore::open(dir.path(), &[Arc::clone(&list)]).unwrap();
                load(store, &list, black_box(rules))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_find_match, bench_store_build);
criterion_main!(benches);
