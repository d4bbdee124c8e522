use criterion::{Criterion, criterion_group, criterion_main};

use core::time::Duration;
use std::hint::black_box;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fixmalloc::{Allocator, Config, LARGE_PAYLOAD, Mode, SMALL_PAYLOAD, SizeClass};

const NUM_ARGS: usize = 50_000;

use lazy_static::lazy_static;

lazy_static! {
    static ref FINE: Allocator = Allocator::init(8, Mode::Fine).unwrap();
    static ref COARSE: Allocator = Allocator::init(8, Mode::Coarse).unwrap();
    // No private memory, so every request goes through the overflow class locks.
    static ref SPILL: Allocator = Allocator::with_config(Config::new(8, Mode::Fine).with_arena_bytes(0)).unwrap();
}

fn randdist_reqsiz(r: &mut StdRng) -> usize {
    let randnum = r.random::<u8>();

    if randnum < 50 {
        r.random_range(1..16)
    } else if randnum < 150 {
        32
    } else if randnum < 200 {
        SMALL_PAYLOAD
    } else {
        r.random_range(SMALL_PAYLOAD + 1..=LARGE_PAYLOAD)
    }
}

fn reqs() -> Vec<usize> {
    let mut r = StdRng::seed_from_u64(0);
    (0..NUM_ARGS).map(|_| randdist_reqsiz(&mut r)).collect()
}

fn bench_size_class_of(c: &mut Criterion) {
    let mut r = StdRng::seed_from_u64(0);
    let reqsizs: Vec<usize> = (0..NUM_ARGS).map(|_| r.random_range(0..2 * LARGE_PAYLOAD)).collect();
    let mut i = 0;

    c.bench_function("size_class_of", |b| b.iter(|| {
        black_box(SizeClass::of(black_box(reqsizs[i % NUM_ARGS])));
        i += 1;
    }));
}

fn bench_allocate_release(c: &mut Criterion, name: &str, a: &Allocator) {
    let reqs = reqs();
    let mut i = 0;

    c.bench_function(name, |b| b.iter(|| {
        let block = a.allocate(black_box(reqs[i % reqs.len()]));
        a.release(black_box(block));
        i += 1;
    }));
}

fn bench_fine(c: &mut Criterion) {
    bench_allocate_release(c, "allocate_release_fine", &FINE);
}

fn bench_coarse(c: &mut Criterion) {
    bench_allocate_release(c, "allocate_release_coarse", &COARSE);
}

fn bench_overflow(c: &mut Criterion) {
    bench_allocate_release(c, "allocate_release_overflow", &SPILL);
}

fn bench_release_ptr(c: &mut Criterion) {
    let reqs = reqs();
    let mut i = 0;

    c.bench_function("allocate_release_ptr", |b| b.iter(|| {
        if let Some(block) = FINE.allocate(reqs[i % reqs.len()]) {
            FINE.release_ptr(black_box(block.as_ptr()));
        }
        i += 1;
    }));
}

fn bench_fill_then_drain(c: &mut Criterion) {
    // Hold a working set so the free lists are not just popping and pushing one chunk.
    c.bench_function("fill_then_drain_1000", |b| b.iter(|| {
        let blocks: Vec<_> = (0..1000).map_while(|_| FINE.allocate(SMALL_PAYLOAD)).collect();
        for block in blocks {
            FINE.release(block);
        }
    }));
}

criterion_group!{
    name = fixmalloc;
    config = Criterion::default().warm_up_time(Duration::from_millis(100)).measurement_time(Duration::from_millis(1000));
    targets = bench_size_class_of, bench_fine, bench_coarse, bench_overflow, bench_release_ptr, bench_fill_then_drain
}

criterion_main!(fixmalloc);
