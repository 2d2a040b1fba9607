//! Descriptor Heap Pool
//!
//! Shader-visible heaps are expensive to create, and shader tables are
//! recreated every frame. Heaps are therefore recycled: when a
//! [`DescriptorHeap`] is dropped its backend heap goes back into this pool,
//! tagged with the last fence value that may still read it.
//!
//! ```text
//!  allocate(type, n) ─► scan free list ─► same type, ≥ n descriptors,
//!                                          fence ≤ completed? ─► reuse
//!                              │
//!                              └─► evict stale entries, create a new heap
//! ```
//!
//! Entries whose fence lags the completed fence by more than `max_age`
//! are destroyed on the next allocation that misses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{
    CpuDescriptor, DescriptorHeapHandle, DescriptorHeapInfo, DescriptorHeapType,
    GpuDescriptorHandle, RayTracingBackend,
};
use crate::errors::Result;
use crate::stats::{self, RayTracingStats};

#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    info: DescriptorHeapInfo,
    heap_type: DescriptorHeapType,
    gpu_index: u32,
    num_descriptors: u32,
    fence_value: u64,
}

/// Recycles shader-visible descriptor heaps across frames.
#[derive(Debug)]
pub struct DescriptorHeapPool {
    backend: Arc<dyn RayTracingBackend>,
    stats: Arc<RayTracingStats>,
    max_age: u64,
    entries: Mutex<Vec<PoolEntry>>,
    allocated: AtomicU32,
}

impl DescriptorHeapPool {
    #[must_use]
    pub fn new(backend: Arc<dyn RayTracingBackend>, stats: Arc<RayTracingStats>, max_age: u64) -> Self {
        Self {
            backend,
            stats,
            max_age,
            entries: Mutex::new(Vec::new()),
            allocated: AtomicU32::new(0),
        }
    }

    /// Hands out a heap with room for at least `num_descriptors`.
    pub fn allocate(
        self: &Arc<Self>,
        gpu_index: u32,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<DescriptorHeap> {
        let mut entries = self.entries.lock();
        let completed = self.backend.completed_fence();

        let reusable = entries.iter().position(|e| {
            e.heap_type == heap_type
                && e.gpu_index == gpu_index
                && e.num_descriptors >= num_descriptors
                && e.fence_value <= completed
        });

        let entry = if let Some(index) = reusable {
            entries.swap_remove(index)
        } else {
            self.release_stale_locked(&mut entries, self.max_age, completed);
            drop(entries);

            let info = self
                .backend
                .create_descriptor_heap(gpu_index, heap_type, num_descriptors)?;
            match heap_type {
                DescriptorHeapType::View => {
                    stats::add(&self.stats.view_heaps, 1);
                    stats::add(&self.stats.view_descriptors, u64::from(num_descriptors));
                }
                DescriptorHeapType::Sampler => {
                    stats::add(&self.stats.sampler_heaps, 1);
                    stats::add(&self.stats.sampler_descriptors, u64::from(num_descriptors));
                }
            }
            log::debug!("Created {heap_type:?} descriptor heap with {num_descriptors} descriptors");
            PoolEntry {
                info,
                heap_type,
                gpu_index,
                num_descriptors,
                fence_value: 0,
            }
        };

        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(DescriptorHeap {
            entry,
            capacity: num_descriptors,
            descriptor_size: self.backend.descriptor_increment(heap_type),
            cursor: AtomicU32::new(0),
            fence_value: AtomicU64::new(entry.fence_value),
            exhausted: AtomicBool::new(false),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, entry: PoolEntry) {
        self.allocated.fetch_sub(1, Ordering::Relaxed);
        self.entries.lock().push(entry);
    }

    /// Destroys pooled heaps not used within `max_age` fences of `completed_fence`.
    pub fn release_stale(&self, max_age: u64, completed_fence: u64) {
        let mut entries = self.entries.lock();
        self.release_stale_locked(&mut entries, max_age, completed_fence);
    }

    fn release_stale_locked(&self, entries: &mut Vec<PoolEntry>, max_age: u64, completed_fence: u64) {
        entries.retain(|entry| {
            let stale = entry.fence_value + max_age <= completed_fence;
            if stale {
                self.destroy(entry);
            }
            !stale
        });
    }

    /// Destroys every pooled heap. Heaps still handed out are unaffected.
    pub fn flush(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.drain(..) {
            self.destroy(&entry);
        }
    }

    fn destroy(&self, entry: &PoolEntry) {
        self.backend.destroy_descriptor_heap(entry.info.handle);
        let descriptors = u64::from(entry.num_descriptors);
        match entry.heap_type {
            DescriptorHeapType::View => {
                stats::sub(&self.stats.view_heaps, 1);
                stats::sub(&self.stats.view_descriptors, descriptors);
            }
            DescriptorHeapType::Sampler => {
                stats::sub(&self.stats.sampler_heaps, 1);
                stats::sub(&self.stats.sampler_descriptors, descriptors);
            }
        }
    }

    /// Heaps waiting in the free list.
    #[must_use]
    pub fn pooled_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Heaps currently handed out.
    #[must_use]
    pub fn allocated_count(&self) -> u32 {
        self.allocated.load(Ordering::Relaxed)
    }
}

impl Drop for DescriptorHeapPool {
    fn drop(&mut self) {
        self.flush();
    }
}

// ─── DescriptorHeap ──────────────────────────────────────────────────────────

/// A bump-allocated shader-visible heap on loan from the pool.
#[derive(Debug)]
pub struct DescriptorHeap {
    entry: PoolEntry,
    capacity: u32,
    descriptor_size: u32,
    cursor: AtomicU32,
    fence_value: AtomicU64,
    exhausted: AtomicBool,
    pool: Arc<DescriptorHeapPool>,
}

impl DescriptorHeap {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> DescriptorHeapHandle {
        self.entry.info.handle
    }

    #[inline]
    #[must_use]
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.entry.heap_type
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Descriptors handed out so far.
    #[must_use]
    pub fn used(&self) -> u32 {
        self.cursor.load(Ordering::Relaxed).min(self.capacity)
    }

    /// Reserves `count` consecutive descriptors. `None` when the heap is full.
    pub fn allocate(&self, count: u32) -> Option<u32> {
        let result = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                let end = cursor.checked_add(count)?;
                (end <= self.capacity).then_some(end)
            });
        match result {
            Ok(base) => {
                let used = match self.entry.heap_type {
                    DescriptorHeapType::View => &self.pool.stats.used_view_descriptors,
                    DescriptorHeapType::Sampler => &self.pool.stats.used_sampler_descriptors,
                };
                stats::add(used, u64::from(count));
                Some(base)
            }
            Err(_) => {
                self.exhausted.store(true, Ordering::Relaxed);
                None
            }
        }
    }

    /// `true` after any allocation was refused.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    /// Copies descriptors into the heap starting at `index`.
    pub fn write(&self, index: u32, descriptors: &[CpuDescriptor]) {
        debug_assert!(index as usize + descriptors.len() <= self.capacity as usize);
        self.pool
            .backend
            .write_descriptors(self.entry.info.handle, index, descriptors);
    }

    #[inline]
    #[must_use]
    pub fn gpu_handle(&self, index: u32) -> GpuDescriptorHandle {
        GpuDescriptorHandle(
            self.entry.info.gpu_base + u64::from(index) * u64::from(self.descriptor_size),
        )
    }

    /// Records that GPU work up to `fence_value` may read this heap.
    pub fn update_sync_point(&self, fence_value: u64) {
        self.fence_value.fetch_max(fence_value, Ordering::AcqRel);
    }

    #[must_use]
    pub fn fence_value(&self) -> u64 {
        self.fence_value.load(Ordering::Acquire)
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        let used = u64::from(self.used());
        let counter = match self.entry.heap_type {
            DescriptorHeapType::View => &self.pool.stats.used_view_descriptors,
            DescriptorHeapType::Sampler => &self.pool.stats.used_sampler_descriptors,
        };
        stats::sub(counter, used);

        let mut entry = self.entry;
        entry.fence_value = self.fence_value();
        self.pool.release(entry);
    }
}
