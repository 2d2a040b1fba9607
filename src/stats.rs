//! Ray tracing counters.
//!
//! Counters are plain relaxed atomics so that binding workers and compile
//! threads can bump them without coordination. Gauges (memory, live object
//! counts) go up and down; the rest only grow.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! define_stats {
    ($( $(#[$meta:meta])* $name:ident ),* $(,)?) => {
        /// Live counters shared by everything a [`RayTracingDevice`](crate::RayTracingDevice) owns.
        #[derive(Debug, Default)]
        pub struct RayTracingStats {
            $( $(#[$meta])* pub $name: AtomicU64, )*
        }

        /// A point-in-time copy of [`RayTracingStats`].
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct RayTracingStatsSnapshot {
            $( $(#[$meta])* pub $name: u64, )*
        }

        impl RayTracingStats {
            /// Reads every counter.
            #[must_use]
            pub fn snapshot(&self) -> RayTracingStatsSnapshot {
                RayTracingStatsSnapshot {
                    $( $name: self.$name.load(Ordering::Relaxed), )*
                }
            }
        }
    };
}

define_stats! {
    // --- Acceleration structures ---
    /// Live bottom-level acceleration structures.
    allocated_blas,
    /// Live top-level acceleration structures.
    allocated_tlas,
    /// Primitives across live BLAS.
    blas_triangles,
    /// Full BLAS builds issued.
    built_blas,
    /// BLAS refits issued.
    updated_blas,
    /// BLAS compactions completed.
    compacted_blas,
    /// TLAS builds issued.
    built_tlas,
    /// Bytes held by BLAS result buffers.
    blas_memory,
    /// Bytes held by TLAS result buffers.
    tlas_memory,

    // --- Descriptors ---
    /// Live view descriptor heaps (pooled ones included).
    view_heaps,
    /// Live sampler descriptor heaps (pooled ones included).
    sampler_heaps,
    /// View descriptors across live heaps.
    view_descriptors,
    /// Sampler descriptors across live heaps.
    sampler_descriptors,
    /// View descriptors written into tables.
    used_view_descriptors,
    /// Sampler descriptors written into tables.
    used_sampler_descriptors,
    /// Descriptor table allocations refused for lack of space.
    descriptor_allocation_failures,

    // --- Pipelines ---
    /// Single-shader collections created.
    created_collections,
    /// Collections served from the cache.
    collection_cache_hits,
    /// Link operations issued to the backend.
    linked_pipelines,
    /// Pipelines created, partial ones included.
    created_pipelines,
    /// Shaders compiled by the backend.
    compiled_shaders,

    // --- Binding ---
    /// Hit records filled from the shader-record cache.
    record_cache_hits,
    /// Shader parameter sets resolved into root arguments.
    resource_binding_resolutions,
    /// Local records written (identifier plus arguments).
    shader_record_writes,
    /// Ray dispatches recorded.
    dispatches,
}

/// Adds `value` to a counter.
#[inline]
pub(crate) fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

/// Subtracts `value` from a gauge.
#[inline]
pub(crate) fn sub(counter: &AtomicU64, value: u64) {
    counter.fetch_sub(value, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = RayTracingStats::default();
        add(&stats.built_blas, 3);
        add(&stats.blas_memory, 4096);
        sub(&stats.blas_memory, 1024);

        let snap = stats.snapshot();
        assert_eq!(snap.built_blas, 3);
        assert_eq!(snap.blas_memory, 3072);
        assert_eq!(snap.built_tlas, 0);
    }
}
