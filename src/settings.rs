//! Ray Tracing Settings
//!
//! Configuration knobs consumed by [`RayTracingDevice`](crate::RayTracingDevice)
//! at creation time. Most of them are debugging or tuning overrides; the
//! defaults are what production rendering should use.
//!
//! ```rust,ignore
//! use myth_raytracing::{RayTracingSettings, BuildModeOverride};
//!
//! let settings = RayTracingSettings {
//!     force_build_mode: BuildModeOverride::FastBuild,
//!     parallel_binding: false,
//!     ..Default::default()
//! };
//! ```

// ---------------------------------------------------------------------------
// DescriptorDedupMode
// ---------------------------------------------------------------------------

/// How descriptor table cache hits are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DescriptorDedupMode {
    /// A digest match is confirmed by comparing every descriptor.
    #[default]
    FullCompare,
    /// A digest match alone is trusted. Faster, but a 64-bit collision
    /// binds the wrong resources.
    HashOnly,
}

// ---------------------------------------------------------------------------
// BuildModeOverride
// ---------------------------------------------------------------------------

/// Overrides the build preference requested by each geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildModeOverride {
    /// Honor `fast_build` on each geometry initializer.
    #[default]
    Auto,
    /// Every BLAS prefers fast build.
    FastBuild,
    /// Every BLAS prefers fast trace.
    FastTrace,
}

impl BuildModeOverride {
    /// Resolves the effective "prefer fast build" flag for a geometry.
    #[inline]
    #[must_use]
    pub fn prefer_fast_build(self, requested: bool) -> bool {
        match self {
            Self::Auto => requested,
            Self::FastBuild => true,
            Self::FastTrace => false,
        }
    }
}

// ---------------------------------------------------------------------------
// RayTracingSettings
// ---------------------------------------------------------------------------

/// Device-wide ray tracing configuration.
///
/// # Fields
///
/// | Field                           | Description                                   | Default       |
/// |---------------------------------|-----------------------------------------------|---------------|
/// | `min_view_descriptor_heap_size` | Floor for per-table view heaps                | 1024          |
/// | `max_view_descriptor_heap_size` | Cap for per-table view heaps                  | 1 000 000     |
/// | `sampler_descriptor_heap_size`  | Per-table sampler heap size                   | 2048          |
/// | `record_cache`                  | Shader-record cache for hit-group binding     | `true`        |
/// | `descriptor_dedup`              | Descriptor table hit confirmation             | `FullCompare` |
/// | `force_build_mode`              | BLAS build preference override                | `Auto`        |
/// | `force_full_build`              | Turn BLAS updates into full rebuilds          | `false`       |
/// | `auto_compaction`               | Compact static fast-trace BLAS                | `true`        |
/// | `force_opaque`                  | Mark every instance opaque                    | `false`       |
/// | `disable_triangle_cull`         | Disable back-face culling on every instance   | `false`       |
/// | `parallel_binding`              | Bind hit groups on worker threads             | `true`        |
/// | `max_binding_workers`           | Upper bound on binding workers                | 8             |
/// | `binding_chunk_size`            | Bindings claimed per cursor step              | 128           |
/// | `compile_threads`               | Shader compile workers (0 = auto)             | 0             |
/// | `stale_heap_max_age`            | Fence age before pooled heaps are destroyed   | 100           |
/// | `slow_pipeline_warning_ms`      | Pipeline creation time worth logging          | 10.0          |
#[derive(Debug, Clone)]
pub struct RayTracingSettings {
    // === Descriptor Heaps ===
    /// Minimum number of view descriptors allocated for a shader table.
    ///
    /// The device doubles its working copy of this value whenever a table
    /// runs out of descriptors, so later tables start larger.
    pub min_view_descriptor_heap_size: u32,

    /// Hard cap on view descriptors per shader table.
    pub max_view_descriptor_heap_size: u32,

    /// Number of sampler descriptors per shader table.
    pub sampler_descriptor_heap_size: u32,

    /// How descriptor table digest hits are confirmed.
    pub descriptor_dedup: DescriptorDedupMode,

    // === Shader Binding ===
    /// Reuse local arguments of previously bound records with identical
    /// uniform buffers instead of resolving resources again.
    pub record_cache: bool,

    /// Bind hit groups on multiple worker threads.
    pub parallel_binding: bool,

    /// Maximum number of binding workers. Also bounded by hardware threads.
    pub max_binding_workers: usize,

    /// Number of bindings a worker claims from the shared cursor at once.
    pub binding_chunk_size: usize,

    /// Shader compile worker threads. `0` picks a count from the hardware.
    pub compile_threads: usize,

    // === Acceleration Structures ===
    /// Overrides the per-geometry build preference.
    pub force_build_mode: BuildModeOverride,

    /// Turn every BLAS update into a full rebuild.
    pub force_full_build: bool,

    /// Compact static, fast-trace, non-updatable BLAS after their first build.
    pub auto_compaction: bool,

    /// Force every TLAS instance opaque.
    pub force_opaque: bool,

    /// Disable triangle culling on every TLAS instance.
    pub disable_triangle_cull: bool,

    // === Housekeeping ===
    /// Pooled heaps whose release fence is this far behind the completed
    /// fence are destroyed.
    pub stale_heap_max_age: u64,

    /// Pipeline creation slower than this (in milliseconds) is logged.
    pub slow_pipeline_warning_ms: f32,
}

impl Default for RayTracingSettings {
    fn default() -> Self {
        Self {
            min_view_descriptor_heap_size: 1024,
            max_view_descriptor_heap_size: 1_000_000,
            sampler_descriptor_heap_size: 2048,
            descriptor_dedup: DescriptorDedupMode::default(),
            record_cache: true,
            parallel_binding: true,
            max_binding_workers: 8,
            binding_chunk_size: 128,
            compile_threads: 0,
            force_build_mode: BuildModeOverride::default(),
            force_full_build: false,
            auto_compaction: true,
            force_opaque: false,
            disable_triangle_cull: false,
            stale_heap_max_age: 100,
            slow_pipeline_warning_ms: 10.0,
        }
    }
}

impl RayTracingSettings {
    /// Number of shader compile workers to spawn.
    #[must_use]
    pub fn effective_compile_threads(&self) -> usize {
        if self.compile_threads > 0 {
            return self.compile_threads;
        }
        std::thread::available_parallelism()
            .map_or(2, std::num::NonZeroUsize::get)
            .clamp(1, 8)
    }

    /// Number of binding workers for `num_bindings` hit-group bindings.
    ///
    /// Returns 1 when parallel binding is disabled or the batch is too small
    /// to give every worker at least one chunk.
    #[must_use]
    pub fn binding_workers_for(&self, num_bindings: usize) -> usize {
        if !self.parallel_binding {
            return 1;
        }
        let chunk = self.binding_chunk_size.max(1);
        let hardware = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        let useful = num_bindings.div_ceil(chunk);
        hardware.min(self.max_binding_workers).min(useful).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_override_resolution() {
        assert!(BuildModeOverride::Auto.prefer_fast_build(true));
        assert!(!BuildModeOverride::Auto.prefer_fast_build(false));
        assert!(BuildModeOverride::FastBuild.prefer_fast_build(false));
        assert!(!BuildModeOverride::FastTrace.prefer_fast_build(true));
    }

    #[test]
    fn serial_binding_when_disabled() {
        let settings = RayTracingSettings {
            parallel_binding: false,
            ..Default::default()
        };
        assert_eq!(settings.binding_workers_for(100_000), 1);
    }

    #[test]
    fn small_batches_use_one_worker() {
        let settings = RayTracingSettings::default();
        assert_eq!(settings.binding_workers_for(10), 1);
        assert_eq!(settings.binding_workers_for(0), 1);
    }
}
