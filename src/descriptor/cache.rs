//! Descriptor Table Cache
//!
//! Hit group records reference their resources through descriptor tables.
//! Thousands of records typically share a handful of distinct tables, so
//! tables are deduplicated by content within a shader table's lifetime.
//!
//! # Layout
//!
//! ```text
//! DescriptorCache
//! ├── DescriptorHeapSet      shared, one view heap + one sampler heap
//! │     bump cursors are atomic, so workers allocate without locking
//! └── [DescriptorTableCache] one per binding worker
//!       digest ─► [(base index, descriptors)]
//! ```
//!
//! A worker only ever consults its own table cache, so identical tables
//! bound by two workers occupy two ranges of the heap. Digest hits are
//! confirmed by a full descriptor comparison unless
//! [`DescriptorDedupMode::HashOnly`] is selected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_64;

use super::heap_pool::{DescriptorHeap, DescriptorHeapPool};
use crate::backend::{CpuDescriptor, DescriptorHeapType, GpuDescriptorHandle};
use crate::errors::Result;
use crate::settings::DescriptorDedupMode;
use crate::stats::{self, RayTracingStats};

// ─── Budget ──────────────────────────────────────────────────────────────────

/// Device-wide sizing policy for per-table descriptor heaps.
///
/// When a table runs out of view descriptors the floor is doubled (up to the
/// cap), so shader tables created afterwards get larger heaps.
#[derive(Debug)]
pub struct DescriptorBudget {
    view_floor: AtomicU32,
    view_max: u32,
    sampler_size: u32,
    sampler_warned: AtomicBool,
}

impl DescriptorBudget {
    #[must_use]
    pub fn new(view_floor: u32, view_max: u32, sampler_size: u32) -> Self {
        Self {
            view_floor: AtomicU32::new(view_floor.min(view_max)),
            view_max,
            sampler_size,
            sampler_warned: AtomicBool::new(false),
        }
    }

    /// View heap size for a table with `num_records` records needing at most
    /// `per_record` view descriptors each.
    #[must_use]
    pub fn view_heap_size(&self, num_records: u32, per_record: u32) -> u32 {
        let wanted = u64::from(num_records) * u64::from(per_record);
        let wanted = wanted.min(u64::from(self.view_max)) as u32;
        wanted.max(self.view_floor.load(Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn sampler_heap_size(&self) -> u32 {
        self.sampler_size
    }

    #[must_use]
    pub fn view_floor(&self) -> u32 {
        self.view_floor.load(Ordering::Relaxed)
    }

    /// Records that a heap of `capacity` descriptors ran out.
    ///
    /// Logs once per growth step; repeated overflows at the same size stay
    /// quiet.
    pub fn report_exhausted(&self, heap_type: DescriptorHeapType, capacity: u32) {
        match heap_type {
            DescriptorHeapType::View => {
                let grown = capacity.saturating_mul(2).min(self.view_max);
                let previous = self.view_floor.fetch_max(grown, Ordering::Relaxed);
                if previous < grown {
                    log::warn!(
                        "Ray tracing view descriptor heap exhausted ({capacity} descriptors). \
                         Bindings were dropped; new shader tables will reserve {grown}."
                    );
                }
            }
            DescriptorHeapType::Sampler => {
                if !self.sampler_warned.swap(true, Ordering::Relaxed) {
                    log::warn!(
                        "Ray tracing sampler descriptor heap exhausted ({capacity} descriptors). \
                         Bindings were dropped."
                    );
                }
            }
        }
    }
}

// ─── Heaps ───────────────────────────────────────────────────────────────────

/// The view and sampler heaps of one descriptor cache.
#[derive(Debug)]
pub struct DescriptorHeapSet {
    view: DescriptorHeap,
    sampler: DescriptorHeap,
    dedup: DescriptorDedupMode,
    budget: Arc<DescriptorBudget>,
    stats: Arc<RayTracingStats>,
}

impl DescriptorHeapSet {
    #[inline]
    #[must_use]
    pub fn heap(&self, heap_type: DescriptorHeapType) -> &DescriptorHeap {
        match heap_type {
            DescriptorHeapType::View => &self.view,
            DescriptorHeapType::Sampler => &self.sampler,
        }
    }

    #[inline]
    #[must_use]
    pub fn view_heap(&self) -> &DescriptorHeap {
        &self.view
    }

    #[inline]
    #[must_use]
    pub fn sampler_heap(&self) -> &DescriptorHeap {
        &self.sampler
    }

    /// GPU handle of the table starting at `index`.
    #[inline]
    #[must_use]
    pub fn table_handle(&self, heap_type: DescriptorHeapType, index: u32) -> GpuDescriptorHandle {
        self.heap(heap_type).gpu_handle(index)
    }

    /// Both heaps may be read by GPU work up to `fence_value`.
    pub fn update_sync_point(&self, fence_value: u64) {
        self.view.update_sync_point(fence_value);
        self.sampler.update_sync_point(fence_value);
    }
}

// ─── Per-worker table cache ──────────────────────────────────────────────────

#[derive(Debug)]
struct CachedTable {
    base: u32,
    /// Empty in hash-only mode.
    descriptors: SmallVec<[CpuDescriptor; 8]>,
}

/// Digest map from descriptor-table content to heap offset.
#[derive(Debug, Default)]
pub struct DescriptorTableCache {
    view_tables: FxHashMap<u64, SmallVec<[CachedTable; 1]>>,
    sampler_tables: FxHashMap<u64, SmallVec<[CachedTable; 1]>>,
}

impl DescriptorTableCache {
    /// Returns the heap offset of a table holding exactly `descriptors`,
    /// allocating and filling a new range on a miss.
    ///
    /// `None` when the heap has no room left. The caller drops the binding.
    pub fn allocate(
        &mut self,
        heaps: &DescriptorHeapSet,
        descriptors: &[CpuDescriptor],
        heap_type: DescriptorHeapType,
    ) -> Option<u32> {
        let digest = xxh3_64(bytemuck::cast_slice(descriptors));
        let tables = match heap_type {
            DescriptorHeapType::View => &mut self.view_tables,
            DescriptorHeapType::Sampler => &mut self.sampler_tables,
        };

        if let Some(candidates) = tables.get(&digest) {
            let hit = match heaps.dedup {
                DescriptorDedupMode::HashOnly => candidates.first(),
                DescriptorDedupMode::FullCompare => candidates
                    .iter()
                    .find(|table| table.descriptors.as_slice() == descriptors),
            };
            if let Some(table) = hit {
                return Some(table.base);
            }
        }

        let heap = heaps.heap(heap_type);
        let Some(base) = heap.allocate(descriptors.len() as u32) else {
            stats::add(&heaps.stats.descriptor_allocation_failures, 1);
            heaps.budget.report_exhausted(heap_type, heap.capacity());
            return None;
        };
        heap.write(base, descriptors);

        let stored = match heaps.dedup {
            DescriptorDedupMode::HashOnly => SmallVec::new(),
            DescriptorDedupMode::FullCompare => SmallVec::from_slice(descriptors),
        };
        tables.entry(digest).or_default().push(CachedTable {
            base,
            descriptors: stored,
        });
        Some(base)
    }

    /// Distinct tables allocated through this cache.
    #[must_use]
    pub fn len(&self) -> usize {
        self.view_tables.values().map(SmallVec::len).sum::<usize>()
            + self.sampler_tables.values().map(SmallVec::len).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── DescriptorCache ─────────────────────────────────────────────────────────

/// Heaps plus per-worker table caches backing one shader table (or one
/// transient dispatch).
#[derive(Debug)]
pub struct DescriptorCache {
    heaps: DescriptorHeapSet,
    workers: Vec<DescriptorTableCache>,
}

impl DescriptorCache {
    pub fn new(
        pool: &Arc<DescriptorHeapPool>,
        budget: Arc<DescriptorBudget>,
        stats: Arc<RayTracingStats>,
        dedup: DescriptorDedupMode,
        gpu_index: u32,
        num_view_descriptors: u32,
        num_sampler_descriptors: u32,
    ) -> Result<Self> {
        let view = pool.allocate(gpu_index, DescriptorHeapType::View, num_view_descriptors)?;
        let sampler = pool.allocate(gpu_index, DescriptorHeapType::Sampler, num_sampler_descriptors)?;
        Ok(Self {
            heaps: DescriptorHeapSet {
                view,
                sampler,
                dedup,
                budget,
                stats,
            },
            workers: vec![DescriptorTableCache::default()],
        })
    }

    #[inline]
    #[must_use]
    pub fn heaps(&self) -> &DescriptorHeapSet {
        &self.heaps
    }

    /// Makes sure at least `count` worker caches exist.
    pub fn ensure_workers(&mut self, count: usize) {
        if self.workers.len() < count {
            self.workers.resize_with(count, DescriptorTableCache::default);
        }
    }

    #[inline]
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Allocates (or reuses) a descriptor table on behalf of `worker_index`.
    pub fn allocate_descriptor_table(
        &mut self,
        descriptors: &[CpuDescriptor],
        heap_type: DescriptorHeapType,
        worker_index: usize,
    ) -> Option<u32> {
        self.ensure_workers(worker_index + 1);
        self.workers[worker_index].allocate(&self.heaps, descriptors, heap_type)
    }

    /// Splits the cache into the shared heaps and the worker caches so that
    /// workers can run concurrently.
    pub fn split_workers(&mut self) -> (&DescriptorHeapSet, &mut [DescriptorTableCache]) {
        (&self.heaps, &mut self.workers)
    }
}
