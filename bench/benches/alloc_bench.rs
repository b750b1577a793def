//! Local heap against general purpose allocators.
//!
//! Every workload is written once over the `Heap` trait, so each allocator
//! runs exactly the same allocate / free pattern.

use std::alloc::{GlobalAlloc, Layout, System};
use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sparsealloc::{LocalHeap, MmapArena};

trait Heap {
    fn alloc(&mut self, size: usize) -> *mut u8;
    fn free(&mut self, ptr: *mut u8, size: usize);
}

impl Heap for LocalHeap {
    #[inline]
    fn alloc(&mut self, size: usize) -> *mut u8 {
        match self.allocate(size) {
            Ok(allocation) => allocation.as_ptr(),
            Err(err) => panic!("local heap: {err}"),
        }
    }

    #[inline]
    fn free(&mut self, ptr: *mut u8, _size: usize) {
        self.destroy(ptr);
    }
}

/// Any global allocator, used through its `GlobalAlloc` entry points.
struct Global<A: GlobalAlloc>(A);

impl<A: GlobalAlloc> Heap for Global<A> {
    #[inline]
    fn alloc(&mut self, size: usize) -> *mut u8 {
        unsafe { self.0.alloc(Layout::from_size_align_unchecked(size, 16)) }
    }

    #[inline]
    fn free(&mut self, ptr: *mut u8, size: usize) {
        unsafe { self.0.dealloc(ptr, Layout::from_size_align_unchecked(size, 16)) }
    }
}

fn heaps() -> Vec<(&'static str, Box<dyn Heap>)> {
    let mut heaps: Vec<(&'static str, Box<dyn Heap>)> = vec![
        ("sparsealloc", Box::new(LocalHeap::new(MmapArena::new()))),
        ("system", Box::new(Global(System))),
        ("mimalloc", Box::new(Global(mimalloc::MiMalloc))),
        ("snmalloc", Box::new(Global(snmalloc_rs::SnMalloc))),
        ("rpmalloc", Box::new(Global(rpmalloc::RpMalloc))),
    ];
    #[cfg(not(target_env = "msvc"))]
    heaps.push(("jemalloc", Box::new(Global(tikv_jemallocator::Jemalloc))));
    heaps
}

// =============================================================================
// Workloads
// =============================================================================

fn bench_alloc_free_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_free_pair");
    for size in [16, 64, 256, 1024, 4096] {
        for (name, mut heap) in heaps() {
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, &size| {
                b.iter(|| {
                    let ptr = heap.alloc(black_box(size));
                    heap.free(black_box(ptr), size);
                });
            });
        }
    }
    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    const BATCH: usize = 1000;
    let mut group = c.benchmark_group("batch_alloc_then_free");
    group.throughput(Throughput::Elements(BATCH as u64));
    for size in [32, 512] {
        for (name, mut heap) in heaps() {
            let mut ptrs = Vec::with_capacity(BATCH);
            group.bench_with_input(BenchmarkId::new(name, size), &size, |b, &size| {
                b.iter(|| {
                    for _ in 0..BATCH {
                        ptrs.push(heap.alloc(size));
                    }
                    for ptr in ptrs.drain(..) {
                        heap.free(ptr, size);
                    }
                });
            });
        }
    }
    group.finish();
}

fn bench_mixed_sizes(c: &mut Criterion) {
    const LIVE: usize = 256;
    let sizes: Vec<usize> = (0..LIVE).map(|i| 8 + (i * 97) % 2000).collect();
    let mut group = c.benchmark_group("mixed_sizes_churn");
    for (name, mut heap) in heaps() {
        let mut live: Vec<(*mut u8, usize)> = sizes.iter().map(|&s| (heap.alloc(s), s)).collect();
        let mut cursor = 0;
        group.bench_function(name, |b| {
            b.iter(|| {
                let slot = cursor % LIVE;
                let (ptr, size) = live[slot];
                heap.free(ptr, size);
                let size = sizes[(cursor * 13) % LIVE];
                live[slot] = (heap.alloc(size), size);
                cursor += 1;
            });
        });
        for (ptr, size) in live {
            heap.free(ptr, size);
        }
    }
    group.finish();
}

criterion_group!(benches, bench_alloc_free_pair, bench_batch, bench_mixed_sizes);
criterion_main!(benches);
