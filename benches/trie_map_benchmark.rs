// The benchmarks aim to only measure times of the operations in their names.
// All use Bencher::iter_batched so the map and the key lists are prepared
// outside of the measured function.
// The counts of inserted/removed/searched elements are chosen at random from
// constant ranges, as are the keys, so that every run spreads over a
// different set of shards.
// The parallel benchmarks split one key list between a fixed number of
// threads writing to the same map.

extern crate criterion;
extern crate rand;
extern crate shardtrie;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use crossbeam_utils::thread::scope;
use rand::Rng;
use shardtrie::{ConcurrentIterator, ShardedTrieMap};

// ranges of counts for different benchmarks (MINs are inclusive, MAXes exclusive):
const INSERT_COUNT_MIN: usize = 12_000;
const INSERT_COUNT_MAX: usize = 14_000;
const INSERT_COUNT_FOR_REMOVE_MIN: usize = 34_000;
const INSERT_COUNT_FOR_REMOVE_MAX: usize = 36_000;
const REMOVE_COUNT_MIN: usize = 12_000;
const REMOVE_COUNT_MAX: usize = 14_000;
const SEARCH_COUNT_MIN: usize = 12_000;
const SEARCH_COUNT_MAX: usize = 14_000;
const ITER_COUNT: u64 = 100_000;
const THREADS: usize = 4;

pub fn insert_empty_value(c: &mut Criterion) {
    c.bench_function("insert_empty_value", |b| {
        b.iter_batched(
            || prepare_insert(()),
            |(map, list)| insert_vec(&map, list),
            BatchSize::SmallInput,
        )
    });
}

pub fn insert_struct_value(c: &mut Criterion) {
    c.bench_function("insert_struct_value", |b| {
        b.iter_batched(
            || prepare_insert(Struct::default()),
            |(map, list)| insert_vec(&map, list),
            BatchSize::SmallInput,
        )
    });
}

pub fn insert_parallel(c: &mut Criterion) {
    c.bench_function("insert_parallel", |b| {
        b.iter_batched(
            || prepare_insert(()),
            |(map, list)| {
                let chunk = list.len().div_ceil(THREADS);
                scope(|s| {
                    for part in list.chunks(chunk) {
                        let map = &map;
                        s.spawn(move |_| {
                            for (k, v) in part.iter() {
                                map.put(*k, *v);
                            }
                        });
                    }
                })
                .unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

pub fn remove_empty_value(c: &mut Criterion) {
    c.bench_function("remove_empty_value", |b| {
        b.iter_batched(
            || prepare_remove(()),
            |(ref map, ref list)| remove_vec(map, list),
            BatchSize::SmallInput,
        )
    });
}

pub fn remove_struct_value(c: &mut Criterion) {
    c.bench_function("remove_struct_value", |b| {
        b.iter_batched(
            || prepare_remove(Struct::default()),
            |(ref map, ref list)| remove_vec(map, list),
            BatchSize::SmallInput,
        )
    });
}

pub fn search_empty_value(c: &mut Criterion) {
    c.bench_function("search_empty_value", |b| {
        b.iter_batched(
            || prepare_search(()),
            |(ref map, ref list)| search_vec(map, list),
            BatchSize::SmallInput,
        )
    });
}

pub fn search_struct_value(c: &mut Criterion) {
    c.bench_function("search_struct_value", |b| {
        b.iter_batched(
            || prepare_search(Struct::default()),
            |(ref map, ref list)| search_vec(map, list),
            BatchSize::SmallInput,
        )
    });
}

pub fn for_each_entry(c: &mut Criterion) {
    let map: ShardedTrieMap<u64, u64> = (0..ITER_COUNT).map(|i| (i, i)).collect();
    c.bench_function("for_each_entry", |b| {
        b.iter(|| {
            let mut sum = 0u64;
            map.for_each_entry(|_, v| sum = sum.wrapping_add(*v));
            black_box(sum)
        })
    });
}

pub fn iterate_parallel(c: &mut Criterion) {
    let map: ShardedTrieMap<u64, u64> = (0..ITER_COUNT).map(|i| (i, i)).collect();
    c.bench_function("iterate_parallel", |b| {
        b.iter(|| {
            let iter = map.value_iter();
            scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|_| {
                        while let Ok(v) = iter.advance() {
                            black_box(v);
                        }
                    });
                }
            })
            .unwrap();
        })
    });
}

criterion_group!(
    insert,
    insert_empty_value,
    insert_struct_value,
    insert_parallel
);
criterion_group!(remove, remove_empty_value, remove_struct_value);
criterion_group!(search, search_empty_value, search_struct_value);
criterion_group!(iterate, for_each_entry, iterate_parallel);
criterion_main!(insert, remove, search, iterate);

// Utility functions:

fn insert_vec<V>(map: &ShardedTrieMap<u64, V>, list: Vec<(u64, V)>) {
    for (key, val) in list.into_iter() {
        map.put(key, val);
    }
}

fn remove_vec<V>(map: &ShardedTrieMap<u64, V>, list: &[u64]) {
    for i in list.iter() {
        map.remove(i);
    }
}

fn search_vec<V: Clone>(map: &ShardedTrieMap<u64, V>, list: &[u64]) {
    for i in list.iter() {
        black_box(map.get(black_box(i)));
    }
}

#[derive(Default, Clone, Copy)]
#[allow(dead_code)]
struct Struct {
    vars: [i64; 32],
}

fn prepare_insert<V: Clone>(value: V) -> (ShardedTrieMap<u64, V>, Vec<(u64, V)>) {
    let mut rng = rand::rng();
    let count = rng.random_range(INSERT_COUNT_MIN..INSERT_COUNT_MAX);
    let list = (0..count)
        .map(|_| (rng.random::<u64>(), value.clone()))
        .collect();
    (ShardedTrieMap::new(), list)
}

/// Prepares a remove benchmark with values in the map being clones of the 'value' parameter
fn prepare_remove<V: Clone>(value: V) -> (ShardedTrieMap<u64, V>, Vec<u64>) {
    let mut rng = rand::rng();
    let insert_count = rng.random_range(INSERT_COUNT_FOR_REMOVE_MIN..INSERT_COUNT_FOR_REMOVE_MAX);
    let remove_count = rng.random_range(REMOVE_COUNT_MIN..REMOVE_COUNT_MAX);
    let keys: Vec<u64> = (0..insert_count).map(|_| rng.random()).collect();
    let map = ShardedTrieMap::new();
    for k in keys.iter() {
        map.put(*k, value.clone());
    }
    let list = (0..remove_count)
        .map(|_| keys[rng.random_range(0..keys.len())])
        .collect();
    (map, list)
}

fn prepare_search<V: Clone>(value: V) -> (ShardedTrieMap<u64, V>, Vec<u64>) {
    let mut rng = rand::rng();
    let insert_count = rng.random_range(INSERT_COUNT_MIN..INSERT_COUNT_MAX);
    let search_count = rng.random_range(SEARCH_COUNT_MIN..SEARCH_COUNT_MAX);
    let map = ShardedTrieMap::new();
    for k in 0..insert_count as u64 {
        map.put(k, value.clone());
    }
    // Search a range a third larger than the inserted one, so some lookups miss.
    let search_limit = insert_count as u64 * 4 / 3;
    let list = (0..search_count)
        .map(|_| rng.random_range(0..search_limit))
        .collect();
    (map, list)
}
