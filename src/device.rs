//! Ray Tracing Device
//!
//! [`RayTracingDevice`] is the single owner of the process-wide ray tracing
//! state:
//!
//! - **Backend**: the GPU implementation every resource is created through
//! - **`ShaderCollectionCache`**: compiled shader entry points shared by all pipelines
//! - **`DescriptorHeapPool`**: recycled shader-visible heaps
//! - **`DescriptorBudget`**: current heap sizing, grown on overflow
//! - **Built-in pipelines**: occlusion and intersection queries
//!
//! Everything that needs one of these receives it from the device; there is
//! no global state.
//!
//! # Lifecycle
//!
//! 1. Create with [`RayTracingDevice::new`]
//! 2. Create pipelines, geometries and scenes through the device
//! 3. Record work with [`create_command_context`](RayTracingDevice::create_command_context)
//! 4. Call [`end_frame`](RayTracingDevice::end_frame) once per frame
//!
//! ```rust,ignore
//! let device = RayTracingDevice::new(backend, RayTracingSettings::default(), blobs)?;
//! let geometry = device.create_geometry(init)?;
//! let mut scene = device.create_scene(scene_init)?;
//!
//! let mut ctx = device.create_command_context(0);
//! ctx.build_acceleration_structure(&geometry)?;
//! ctx.build_scene(&mut scene)?;
//! ctx.dispatch_rays(&mut scene, &pipeline, 0, &globals, 1920, 1080)?;
//! let fence = ctx.submit()?;
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::accel::{
    RayTracingGeometry, RayTracingGeometryInitializer, RayTracingScene, RayTracingSceneInitializer,
};
use crate::backend::RayTracingBackend;
use crate::descriptor::{DescriptorBudget, DescriptorCache, DescriptorHeapPool};
use crate::dispatch::RayTracingCommandContext;
use crate::errors::Result;
use crate::pipeline::{
    BuiltinPipelines, BuiltinShaderBlobs, BuiltinShaders, PipelineContext, RayTracingPipeline,
    RayTracingPipelineInitializer,
};
use crate::settings::RayTracingSettings;
use crate::shader::{MAX_SAMPLERS, MAX_SRVS, MAX_UAVS, ShaderCollectionCache};
use crate::shader_table::{ShaderTable, ShaderTableInitializer, needs_descriptor_cache};
use crate::stats::{RayTracingStats, RayTracingStatsSnapshot};

/// Owner of the ray tracing caches, pools and built-in pipelines.
#[derive(Debug)]
pub struct RayTracingDevice {
    backend: Arc<dyn RayTracingBackend>,
    settings: RayTracingSettings,
    stats: Arc<RayTracingStats>,
    collection_cache: ShaderCollectionCache,
    heap_pool: Arc<DescriptorHeapPool>,
    descriptor_budget: Arc<DescriptorBudget>,
    builtin_shaders: BuiltinShaders,
    builtin_pipelines: BuiltinPipelines,
    /// BLAS waiting for their compacted size, per GPU.
    pending_compaction: Mutex<Vec<(Weak<RayTracingGeometry>, u32)>>,
}

impl RayTracingDevice {
    /// Creates the device and its built-in pipelines.
    ///
    /// Built-in shaders are loaded from `builtin_blobs` synchronously.
    pub fn new(
        backend: Arc<dyn RayTracingBackend>,
        settings: RayTracingSettings,
        builtin_blobs: BuiltinShaderBlobs<'_>,
    ) -> Result<Self> {
        let stats = Arc::new(RayTracingStats::default());
        let collection_cache = ShaderCollectionCache::new(
            Arc::clone(&backend),
            Arc::clone(&stats),
            settings.effective_compile_threads(),
        );
        let heap_pool = Arc::new(DescriptorHeapPool::new(
            Arc::clone(&backend),
            Arc::clone(&stats),
            settings.stale_heap_max_age,
        ));
        let descriptor_budget = Arc::new(DescriptorBudget::new(
            settings.min_view_descriptor_heap_size,
            settings.max_view_descriptor_heap_size,
            settings.sampler_descriptor_heap_size,
        ));
        let builtin_shaders = BuiltinShaders::from_precompiled(builtin_blobs);

        let builtin_pipelines = BuiltinPipelines::create(&PipelineContext {
            backend: &backend,
            collection_cache: &collection_cache,
            stats: &stats,
            builtin_shaders: &builtin_shaders,
            settings: &settings,
        })?;

        log::info!(
            "Ray tracing device ready: {} GPU(s), {} compile threads",
            backend.num_gpus(),
            settings.effective_compile_threads()
        );

        Ok(Self {
            backend,
            settings,
            stats,
            collection_cache,
            heap_pool,
            descriptor_budget,
            builtin_shaders,
            builtin_pipelines,
            pending_compaction: Mutex::new(Vec::new()),
        })
    }

    // === Accessors ===

    #[inline]
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn RayTracingBackend> {
        &self.backend
    }

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &RayTracingSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> &Arc<RayTracingStats> {
        &self.stats
    }

    /// Shorthand for `stats().snapshot()`.
    #[must_use]
    pub fn stats_snapshot(&self) -> RayTracingStatsSnapshot {
        self.stats.snapshot()
    }

    #[inline]
    #[must_use]
    pub fn collection_cache(&self) -> &ShaderCollectionCache {
        &self.collection_cache
    }

    #[inline]
    #[must_use]
    pub fn heap_pool(&self) -> &Arc<DescriptorHeapPool> {
        &self.heap_pool
    }

    #[inline]
    #[must_use]
    pub fn descriptor_budget(&self) -> &Arc<DescriptorBudget> {
        &self.descriptor_budget
    }

    #[inline]
    #[must_use]
    pub fn builtin_shaders(&self) -> &BuiltinShaders {
        &self.builtin_shaders
    }

    #[inline]
    #[must_use]
    pub fn builtin_pipelines(&self) -> &BuiltinPipelines {
        &self.builtin_pipelines
    }

    // === Factories ===

    fn pipeline_context(&self) -> PipelineContext<'_> {
        PipelineContext {
            backend: &self.backend,
            collection_cache: &self.collection_cache,
            stats: &self.stats,
            builtin_shaders: &self.builtin_shaders,
            settings: &self.settings,
        }
    }

    /// Compiles (or reuses) every shader of `init` and links the pipeline.
    ///
    /// Blocks until all compiles have finished.
    pub fn create_pipeline(&self, init: RayTracingPipelineInitializer) -> Result<Arc<RayTracingPipeline>> {
        RayTracingPipeline::create(&self.pipeline_context(), init).map(Arc::new)
    }

    pub fn create_geometry(&self, init: RayTracingGeometryInitializer) -> Result<Arc<RayTracingGeometry>> {
        RayTracingGeometry::new(&self.backend, &self.stats, &self.settings, init).map(Arc::new)
    }

    pub fn create_scene(&self, init: RayTracingSceneInitializer) -> Result<RayTracingScene> {
        RayTracingScene::new(&self.backend, &self.stats, &self.settings, init)
    }

    /// A standalone shader table, with descriptor heaps if it has local data.
    pub fn create_shader_table(&self, init: &ShaderTableInitializer, gpu_index: u32) -> Result<ShaderTable> {
        let descriptor_cache = self.create_descriptor_cache(init, gpu_index)?;
        ShaderTable::new(&self.backend, init, gpu_index, descriptor_cache)
    }

    /// Heaps sized for the local records of a table shaped like `init`.
    ///
    /// `None` when the table has no local root data.
    pub(crate) fn create_descriptor_cache(
        &self,
        init: &ShaderTableInitializer,
        gpu_index: u32,
    ) -> Result<Option<DescriptorCache>> {
        if !needs_descriptor_cache(init) {
            return Ok(None);
        }
        let num_records = init.num_hit_records + init.num_callable_records;
        let num_view_descriptors = self
            .descriptor_budget
            .view_heap_size(num_records, init.max_view_descriptors_per_record);
        DescriptorCache::new(
            &self.heap_pool,
            Arc::clone(&self.descriptor_budget),
            Arc::clone(&self.stats),
            self.settings.descriptor_dedup,
            gpu_index,
            num_view_descriptors,
            self.descriptor_budget.sampler_heap_size(),
        )
        .map(Some)
    }

    /// Heaps for the global bindings of one dispatch.
    pub(crate) fn create_transient_descriptor_cache(&self, gpu_index: u32) -> Result<DescriptorCache> {
        DescriptorCache::new(
            &self.heap_pool,
            Arc::clone(&self.descriptor_budget),
            Arc::clone(&self.stats),
            self.settings.descriptor_dedup,
            gpu_index,
            MAX_SRVS + MAX_UAVS,
            MAX_SAMPLERS,
        )
    }

    /// Starts recording ray tracing work for `gpu_index`.
    #[must_use]
    pub fn create_command_context(&self, gpu_index: u32) -> RayTracingCommandContext<'_> {
        RayTracingCommandContext::new(self, gpu_index)
    }

    // === Compaction ===

    pub(crate) fn queue_compaction(&self, geometry: &Arc<RayTracingGeometry>, gpu_index: u32) {
        self.pending_compaction
            .lock()
            .push((Arc::downgrade(geometry), gpu_index));
    }

    /// Removes and returns the live candidates of `gpu_index`.
    pub(crate) fn take_compaction_candidates(&self, gpu_index: u32) -> Vec<Arc<RayTracingGeometry>> {
        let mut pending = self.pending_compaction.lock();
        let mut taken = Vec::new();
        pending.retain(|(geometry, gpu)| {
            if *gpu != gpu_index {
                return true;
            }
            if let Some(geometry) = geometry.upgrade() {
                taken.push(geometry);
            }
            false
        });
        taken
    }

    /// Number of geometries still waiting for compaction.
    #[must_use]
    pub fn pending_compaction_count(&self) -> usize {
        self.pending_compaction
            .lock()
            .iter()
            .filter(|(geometry, _)| geometry.strong_count() > 0)
            .count()
    }

    // === Frame ===

    /// Per-frame housekeeping: destroys pooled heaps that have been idle for
    /// `stale_heap_max_age` fences.
    pub fn end_frame(&self) {
        self.heap_pool
            .release_stale(self.settings.stale_heap_max_age, self.backend.completed_fence());
    }
}

impl Drop for RayTracingDevice {
    fn drop(&mut self) {
        self.collection_cache.reset();
        self.heap_pool.flush();
    }
}
