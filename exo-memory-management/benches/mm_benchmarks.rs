//! Memory management benchmarks

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use exo_kernel_sim::{RamDisk, SimKernel};
use exo_memory_management::{
    BLKSIZE, BlockCache, BlockCacheConfig, Env, Forked, MemoryLayout, PAGE_SIZE, PteFlags,
    Syscalls, VirtAddr, fork,
};

fn new_env() -> Env<SimKernel> {
    let kernel = Arc::new(SimKernel::default());
    let id = kernel.spawn().unwrap();
    Env::new(kernel, id, MemoryLayout::default())
}

fn bench_block_fault_in(c: &mut Criterion) {
    c.bench_function("bc_fault_in_64_blocks", |b| {
        b.iter(|| {
            let env = new_env();
            let config = BlockCacheConfig::default().with_self_check(false);
            let cache = BlockCache::init(&env, RamDisk::mkfs(128), config).unwrap();
            let mut buf = [0u8; 8];
            for blockno in 3..67 {
                let va = cache.diskaddr(&env, blockno).unwrap();
                env.read(va, &mut buf).unwrap();
            }
            black_box(cache.resident())
        })
    });
}

fn bench_flush(c: &mut Criterion) {
    let env = new_env();
    let config = BlockCacheConfig::default().with_self_check(false);
    let cache = BlockCache::init(&env, RamDisk::mkfs(64), config).unwrap();
    let va = cache.diskaddr(&env, 10).unwrap();
    let data = vec![0x5au8; BLKSIZE];

    c.bench_function("bc_dirty_then_flush", |b| {
        b.iter(|| {
            env.write(va, &data).unwrap();
            cache.flush_block(&env, black_box(va)).unwrap();
        })
    });
}

fn bench_fork(c: &mut Criterion) {
    c.bench_function("fork_32_pages", |b| {
        b.iter(|| {
            let mut env = new_env();
            let base = VirtAddr::new(0x0080_0000);
            for i in 0..32 {
                let va = base.add(i * PAGE_SIZE);
                env.kernel().page_alloc(env.id(), va, PteFlags::PUW).unwrap();
            }
            match fork(&mut env).unwrap() {
                Forked::Parent(child) => black_box(child),
                Forked::Child => unreachable!(),
            }
        })
    });
}

fn bench_cow_fault(c: &mut Criterion) {
    c.bench_function("cow_privatize_page", |b| {
        b.iter(|| {
            let mut env = new_env();
            let va = VirtAddr::new(0x0080_0000);
            env.kernel().page_alloc(env.id(), va, PteFlags::PUW).unwrap();
            fork(&mut env).unwrap();
            env.write(black_box(va), &[1]).unwrap();
        })
    });
}

criterion_group!(
    benches,
    bench_block_fault_in,
    bench_flush,
    bench_fork,
    bench_cow_fault
);

criterion_main!(benches);
