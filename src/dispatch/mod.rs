//! Dispatch Front End
//!
//! [`RayTracingCommandContext`] records everything a frame of ray tracing
//! needs into one [`CommandList`]: acceleration structure builds, shader
//! table bindings and ray dispatches. Nothing reaches the GPU before
//! [`submit`](RayTracingCommandContext::submit).
//!
//! Typical frame:
//!
//! ```text
//! build_acceleration_structure(..)   per dirty geometry
//! build_scene(..)                    TLAS + instance buffer
//! set_hit_group_bindings(..)         fills the scene's shader table
//! dispatch_rays(..)                  uploads the table, binds globals, dispatches
//! submit()                           fence value for this frame
//! ```

mod binder;
mod parallel;

pub use binder::{BoundView, ShaderBindings, UniformBuffer};
pub use parallel::{BindingSummary, HitGroupBinding};

use std::sync::Arc;

use binder::{DescriptorTarget, GlobalResourceBinder, LocalResourceBinder, set_shader_resources};
use parallel::{BindingJob, bind_hit_groups, stage_record};

use crate::accel::{
    AccelerationStructureUpdate, BlasState, BuildFlags, RayTracingGeometry, RayTracingScene, SceneLifetime,
};
use crate::command::{CommandList, DispatchRaysDesc};
use crate::descriptor::{DescriptorCache, DescriptorHeapSet, DescriptorTableCache};
use crate::device::RayTracingDevice;
use crate::errors::{RayTracingError, Result};
use crate::pipeline::RayTracingPipeline;
use crate::shader::RayTracingShader;
use crate::shader_table::{HIT_GROUP_SYSTEM_PARAMETERS_SIZE, HIT_GROUP_USER_DATA_OFFSET, ShaderTable};
use crate::stats;

/// Records ray tracing work for one GPU.
pub struct RayTracingCommandContext<'d> {
    device: &'d RayTracingDevice,
    commands: CommandList,
    pending_builds: Vec<Arc<RayTracingGeometry>>,
    transient_descriptor_caches: Vec<DescriptorCache>,
}

impl<'d> RayTracingCommandContext<'d> {
    pub(crate) fn new(device: &'d RayTracingDevice, gpu_index: u32) -> Self {
        assert!(
            gpu_index < device.backend().num_gpus(),
            "GPU {gpu_index} does not exist ({} available)",
            device.backend().num_gpus()
        );
        Self {
            device,
            commands: CommandList::new(gpu_index),
            pending_builds: Vec::new(),
            transient_descriptor_caches: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn gpu_index(&self) -> u32 {
        self.commands.gpu_index()
    }

    /// Commands recorded so far.
    #[inline]
    #[must_use]
    pub fn commands(&self) -> &CommandList {
        &self.commands
    }

    // ========================================================================
    // Acceleration structures
    // ========================================================================

    fn record_blas_build(&mut self, geometry: &Arc<RayTracingGeometry>, is_update: bool) -> Result<bool> {
        let recorded = geometry.build(&mut self.commands, is_update)?;
        if recorded {
            self.pending_builds.push(Arc::clone(geometry));
        }
        Ok(recorded)
    }

    /// Builds `geometry` from scratch if it is dirty on this GPU.
    pub fn build_acceleration_structure(&mut self, geometry: &Arc<RayTracingGeometry>) -> Result<bool> {
        self.record_blas_build(geometry, false)
    }

    /// Full builds for a batch, replacing vertex buffers where given.
    ///
    /// Every entry is rebuilt, dirty or not.
    pub fn build_acceleration_structures(&mut self, updates: &[AccelerationStructureUpdate]) -> Result<u32> {
        self.apply_batch(updates, false)
    }

    /// Refits a batch of updatable geometries in place, replacing vertex
    /// buffers where given.
    pub fn update_acceleration_structures(&mut self, updates: &[AccelerationStructureUpdate]) -> Result<u32> {
        self.apply_batch(updates, true)
    }

    fn apply_batch(&mut self, updates: &[AccelerationStructureUpdate], is_update: bool) -> Result<u32> {
        let mut recorded = 0;
        for update in updates {
            if let Some(vertex_buffer) = update.vertex_buffer {
                update.geometry.set_vertex_buffer(vertex_buffer);
            }
            update.geometry.mark_dirty();
            if self.record_blas_build(&update.geometry, is_update)? {
                recorded += 1;
            }
        }
        Ok(recorded)
    }

    /// Builds the scene's TLAS. Every referenced BLAS must be built first.
    pub fn build_scene(&mut self, scene: &mut RayTracingScene) -> Result<()> {
        scene.build(&mut self.commands)
    }

    /// Records compacting copies for every BLAS whose compacted size has
    /// been read back. Returns how many were compacted.
    pub fn compact_pending_acceleration_structures(&mut self) -> Result<u32> {
        let gpu_index = self.gpu_index();
        let mut compacted = 0;
        for geometry in self.device.take_compaction_candidates(gpu_index) {
            match geometry.state(gpu_index) {
                BlasState::ReadyPendingCompaction => {
                    if geometry.compact(&mut self.commands)? {
                        compacted += 1;
                    }
                }
                BlasState::Building => self.device.queue_compaction(&geometry, gpu_index),
                _ => {}
            }
        }
        if compacted > 0 {
            log::debug!("Compacted {compacted} bottom level acceleration structures");
        }
        Ok(compacted)
    }

    // ========================================================================
    // Shader table bindings
    // ========================================================================

    fn scene_table<'s>(
        device: &RayTracingDevice,
        scene: &'s mut RayTracingScene,
        pipeline: &RayTracingPipeline,
        gpu_index: u32,
    ) -> Result<&'s mut ShaderTable> {
        scene.find_or_create_shader_table(pipeline, gpu_index, |init| {
            device.create_descriptor_cache(init, gpu_index)
        })
    }

    /// Binds hit groups and their resources into the scene's shader table
    /// for `pipeline`.
    ///
    /// Large batches are split across worker threads. Bindings whose
    /// descriptor tables do not fit are dropped and logged.
    pub fn set_hit_group_bindings(
        &mut self,
        scene: &mut RayTracingScene,
        pipeline: &RayTracingPipeline,
        bindings: &[HitGroupBinding],
    ) -> Result<BindingSummary> {
        if !pipeline.allow_hit_group_indexing() {
            return Err(RayTracingError::InvalidShaderTable(
                "pipeline was created without hit group indexing".into(),
            ));
        }
        let num_hit_groups = pipeline.hit_group_shaders().len() as u32;
        let record_indices: Vec<u32> = bindings
            .iter()
            .map(|binding| {
                assert!(
                    binding.hit_group_index < num_hit_groups,
                    "hit group {} out of range ({num_hit_groups} in pipeline)",
                    binding.hit_group_index
                );
                scene.hit_record_index(binding.instance_index, binding.segment_index, binding.shader_slot)
            })
            .collect();

        let device = self.device;
        let settings = device.settings();
        let use_record_cache = settings.record_cache && scene.lifetime() == SceneLifetime::SingleFrame;
        let num_workers = settings.binding_workers_for(bindings.len());
        let gpu_index = self.gpu_index();

        let table = Self::scene_table(device, scene, pipeline, gpu_index)?;
        let job = BindingJob {
            backend: device.backend(),
            stats: device.stats(),
            pipeline,
            bindings,
            record_indices: &record_indices,
            use_record_cache,
            chunk_size: settings.binding_chunk_size,
            gpu_index,
        };
        let summary = bind_hit_groups(table, &job, num_workers)?;
        log::trace!(
            "Bound {} hit group records ({} cached, {} dropped) on {} worker(s)",
            summary.written,
            summary.cache_hits,
            summary.dropped,
            summary.workers
        );
        Ok(summary)
    }

    pub fn set_hit_group_binding(
        &mut self,
        scene: &mut RayTracingScene,
        pipeline: &RayTracingPipeline,
        binding: HitGroupBinding,
    ) -> Result<BindingSummary> {
        self.set_hit_group_bindings(scene, pipeline, std::slice::from_ref(&binding))
    }

    /// Binds callable shader `shader_index` of `pipeline` to callable slot
    /// `slot` of the scene's table. Returns `false` if the binding was
    /// dropped.
    pub fn set_callable_shader(
        &mut self,
        scene: &mut RayTracingScene,
        pipeline: &RayTracingPipeline,
        slot: u32,
        shader_index: u32,
        bindings: &ShaderBindings,
        user_data: u32,
    ) -> Result<bool> {
        let library = pipeline.callable_shaders();
        assert!(
            shader_index < library.len() as u32,
            "callable shader {shader_index} out of range ({} in pipeline)",
            library.len()
        );
        assert!(
            slot < scene.num_callable_shader_slots(),
            "callable slot {slot} out of range ({} slots)",
            scene.num_callable_shader_slots()
        );

        let device = self.device;
        let gpu_index = self.gpu_index();
        let table = Self::scene_table(device, scene, pipeline, gpu_index)?;
        let record_index = table.layout().callable_record_index_offset() + slot;

        let mut residency = Vec::new();
        let mut transient_buffers = Vec::new();
        let (record, bound) = {
            let mut targets = table.binding_targets(1);
            let Some(heaps) = targets.heaps else {
                return Err(RayTracingError::InvalidShaderTable(
                    "callable records need local root data".into(),
                ));
            };
            let mut record = stage_record(
                targets.layout,
                targets.data,
                record_index,
                &library.identifier(shader_index),
                user_data,
            );
            let shader = library.shader(shader_index);
            let mut binder = LocalResourceBinder {
                backend: device.backend(),
                gpu_index,
                root_signature: shader.root_signature(),
                record: &mut record,
                residency: &mut residency,
                transient_buffers: &mut transient_buffers,
            };
            let bound = set_shader_resources(
                shader,
                bindings,
                DescriptorTarget {
                    heaps,
                    cache: &mut targets.descriptor_workers[0],
                },
                &mut binder,
                device.stats(),
            )?;
            (record, bound)
        };

        if !bound {
            return Ok(false);
        }
        table.write_local_record(record_index, &record);
        table.extend_resource_references(residency);
        for buffer in transient_buffers {
            table.retain_transient_buffer(buffer);
        }
        stats::add(&device.stats().shader_record_writes, 1);
        Ok(true)
    }

    /// Points miss slot `slot` at miss shader `shader_index` of `pipeline`.
    ///
    /// Miss records carry no resources, only the identifier and user data.
    pub fn set_miss_shader(
        &mut self,
        scene: &mut RayTracingScene,
        pipeline: &RayTracingPipeline,
        slot: u32,
        shader_index: u32,
        user_data: u32,
    ) -> Result<()> {
        let library = pipeline.miss_shaders();
        assert!(
            shader_index < library.len() as u32,
            "miss shader {shader_index} out of range ({} in pipeline)",
            library.len()
        );

        let device = self.device;
        let table = Self::scene_table(device, scene, pipeline, self.gpu_index())?;
        assert!(
            slot < table.layout().miss.count,
            "miss slot {slot} out of range ({} slots)",
            table.layout().miss.count
        );
        let record_index = table.layout().miss_record_index_offset() + slot;
        table.set_local_shader_identifier(record_index, &library.identifier(shader_index));
        if table.layout().local_root_data_size >= HIT_GROUP_SYSTEM_PARAMETERS_SIZE {
            table.set_local_shader_parameter(record_index, HIT_GROUP_USER_DATA_OFFSET, &user_data);
        }
        stats::add(&device.stats().shader_record_writes, 1);
        Ok(())
    }

    /// Drops every shader table of `scene` together with its bindings.
    pub fn clear_bindings(&mut self, scene: &mut RayTracingScene) {
        scene.clear_shader_tables();
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Dispatches `width` x `height` rays through `pipeline` over `scene`.
    ///
    /// The scene's shader table for the pipeline is created on first use
    /// and uploaded whenever it changed since the last dispatch.
    pub fn dispatch_rays(
        &mut self,
        scene: &mut RayTracingScene,
        pipeline: &RayTracingPipeline,
        ray_gen_index: u32,
        global_bindings: &ShaderBindings,
        width: u32,
        height: u32,
    ) -> Result<()> {
        assert!(
            ray_gen_index < pipeline.ray_gen_shaders().len() as u32,
            "ray gen shader {ray_gen_index} out of range"
        );
        let device = self.device;
        let gpu_index = self.gpu_index();
        let fence_value = device.backend().current_fence();

        scene.update_residency(&mut self.commands);
        let table = Self::scene_table(device, scene, pipeline, gpu_index)?;
        if table.is_dirty() {
            table.copy_to_gpu()?;
        }
        let desc = table.dispatch_rays_desc(
            ray_gen_index,
            0,
            pipeline.allow_hit_group_indexing(),
            width,
            height,
        );
        table.update_residency(&mut self.commands, fence_value);

        let ray_gen = pipeline.ray_gen_shaders().shader(ray_gen_index);
        match table.descriptor_cache_mut() {
            Some(cache) => {
                let (heaps, workers) = cache.split_workers();
                record_dispatch(
                    device,
                    &mut self.commands,
                    pipeline,
                    ray_gen,
                    global_bindings,
                    heaps,
                    &mut workers[0],
                    desc,
                )
            }
            None => self.dispatch_with_transient_heaps(pipeline, ray_gen, global_bindings, desc),
        }
    }

    fn dispatch_with_transient_heaps(
        &mut self,
        pipeline: &RayTracingPipeline,
        ray_gen: &RayTracingShader,
        global_bindings: &ShaderBindings,
        desc: DispatchRaysDesc,
    ) -> Result<()> {
        let mut cache = self.device.create_transient_descriptor_cache(self.gpu_index())?;
        let result = {
            let (heaps, workers) = cache.split_workers();
            record_dispatch(
                self.device,
                &mut self.commands,
                pipeline,
                ray_gen,
                global_bindings,
                heaps,
                &mut workers[0],
                desc,
            )
        };
        self.transient_descriptor_caches.push(cache);
        result
    }

    fn trace_builtin(
        &mut self,
        pipeline: &RayTracingPipeline,
        scene: &RayTracingScene,
        rays: BoundView,
        outputs: &[BoundView],
        num_rays: u32,
    ) -> Result<()> {
        let gpu_index = self.gpu_index();
        let Some(scene_view) = scene.acceleration_structure_srv(gpu_index) else {
            return Err(RayTracingError::AccelerationStructureBuildFailed(format!(
                "scene '{}' has no top level acceleration structure on GPU {gpu_index}",
                scene.debug_name()
            )));
        };

        let desc = {
            let mut table = pipeline.default_shader_table(gpu_index);
            if table.is_dirty() {
                table.copy_to_gpu()?;
            }
            table.update_residency(&mut self.commands, self.device.backend().current_fence());
            table.dispatch_rays_desc(0, 0, false, num_rays, 1)
        };
        scene.update_residency(&mut self.commands);

        let mut bindings = ShaderBindings::default();
        bindings.set_srv(0, scene_view).set_srv(1, rays);
        for (slot, output) in outputs.iter().enumerate() {
            bindings.set_uav(slot as u32, *output);
        }
        let ray_gen = pipeline.ray_gen_shaders().shader(0);
        self.dispatch_with_transient_heaps(pipeline, ray_gen, &bindings, desc)
    }

    /// Traces `num_rays` occlusion rays against `scene`, writing one
    /// visibility value per ray into `output`.
    pub fn trace_occlusion(
        &mut self,
        scene: &RayTracingScene,
        rays: BoundView,
        output: BoundView,
        num_rays: u32,
    ) -> Result<()> {
        let pipeline = Arc::clone(&self.device.builtin_pipelines().occlusion);
        self.trace_builtin(&pipeline, scene, rays, &[output], num_rays)
    }

    /// Traces `num_rays` rays against `scene`, writing the closest hit of
    /// each ray into `output`.
    pub fn trace_intersection(
        &mut self,
        scene: &RayTracingScene,
        rays: BoundView,
        output: BoundView,
        num_rays: u32,
    ) -> Result<()> {
        let pipeline = Arc::clone(&self.device.builtin_pipelines().intersection);
        self.trace_builtin(&pipeline, scene, rays, &[output, output], num_rays)
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Hands the recorded commands to the backend and returns the fence
    /// value signaled when they complete.
    pub fn submit(self) -> Result<u64> {
        let Self {
            device,
            commands,
            pending_builds,
            transient_descriptor_caches,
        } = self;
        let gpu_index = commands.gpu_index();
        log::trace!(
            "Submitting {} ray tracing commands ({} dispatches) on GPU {gpu_index}",
            commands.commands().len(),
            commands.dispatch_count()
        );

        let fence_value = device.backend().submit(commands)?;

        for geometry in pending_builds {
            geometry.set_build_fence(gpu_index, fence_value);
            if geometry.build_flags().contains(BuildFlags::ALLOW_COMPACTION)
                && geometry.state(gpu_index) != BlasState::Dirty
            {
                device.queue_compaction(&geometry, gpu_index);
            }
        }
        for cache in &transient_descriptor_caches {
            cache.heaps().update_sync_point(fence_value);
        }
        Ok(fence_value)
    }
}

/// Binds the global root signature, heaps and ray gen resources, then
/// records the dispatch. A dropped global binding skips the dispatch.
#[allow(clippy::too_many_arguments)]
fn record_dispatch(
    device: &RayTracingDevice,
    commands: &mut CommandList,
    pipeline: &RayTracingPipeline,
    ray_gen: &RayTracingShader,
    global_bindings: &ShaderBindings,
    heaps: &DescriptorHeapSet,
    descriptors: &mut DescriptorTableCache,
    desc: DispatchRaysDesc,
) -> Result<()> {
    let Some(state_object) = pipeline.state_object() else {
        return Err(RayTracingError::InvalidPipeline(
            "partial pipelines cannot be dispatched".into(),
        ));
    };

    commands.set_root_signature(pipeline.global_root_signature().id());
    let previous_heaps = commands.set_descriptor_heaps(heaps.view_heap().handle(), heaps.sampler_heap().handle());

    let bound = set_shader_resources(
        ray_gen,
        global_bindings,
        DescriptorTarget {
            heaps,
            cache: descriptors,
        },
        &mut GlobalResourceBinder { commands: &mut *commands },
        device.stats(),
    )?;

    if bound {
        commands.set_pipeline_state(state_object.handle());
        commands.dispatch_rays(desc);
        stats::add(&device.stats().dispatches, 1);
    } else {
        log::warn!(
            "Skipping dispatch of '{}': global resources could not be bound",
            ray_gen.name()
        );
    }

    if let Some((view, sampler)) = previous_heaps {
        commands.set_descriptor_heaps(view, sampler);
    }
    Ok(())
}
