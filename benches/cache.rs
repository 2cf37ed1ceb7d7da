// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Benchmark for the code cache's lookup and bookkeeping paths.
//!
//! Make sure the result of the benchmarked function is used,
//! whether by sending it to black_box, or to return it from the closure.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use x86dynarec::cache::CodeCache;
use x86dynarec::cpu_state::CpuStatus;
use x86dynarec::limits::INVALID_BLOCK_INDEX;
use x86dynarec::smc;

const BLOCK_COUNT: u32 = 512;

fn populated_cache() -> CodeCache {
    let mut cache = CodeCache::new();
    for i in 0..BLOCK_COUNT {
        let phys = i * 0x10;
        let idx = cache.block_init(phys, 0x8000_0000 + phys, CpuStatus::empty(), INVALID_BLOCK_INDEX).unwrap();
        cache.mark_code_present(idx, phys, 4);
        cache.link_into_pages(idx);
    }
    cache
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("hash_lookup hit", |b| {
        let cache = populated_cache();
        b.iter(|| {
            black_box(cache.hash_lookup(black_box((BLOCK_COUNT / 2) * 0x10)));
        })
    });

    c.bench_function("hash_lookup miss", |b| {
        let cache = populated_cache();
        b.iter(|| {
            black_box(cache.hash_lookup(black_box(0xDEAD_0000)));
        })
    });

    c.bench_function("block_init new slot", |b| {
        b.iter_batched(
            populated_cache,
            |mut cache| {
                black_box(cache.block_init(0xFFFF_0000, 0x8FFF_0000, CpuStatus::empty(), INVALID_BLOCK_INDEX));
            },
            criterion::BatchSize::SmallInput,
        )
    });

    c.bench_function("mark_write retires one block", |b| {
        b.iter_batched(
            populated_cache,
            |mut cache| {
                black_box(smc::mark_write(&mut cache, 0x10 * (BLOCK_COUNT / 2), 4));
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
