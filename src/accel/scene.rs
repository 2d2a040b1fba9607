//! Top-level acceleration structures and per-scene shader tables.

use std::mem::size_of;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Affine3A;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{AccelerationStructureBuild, AccelerationStructureInputs, BuildFlags, InstanceFlags};
use super::geometry::{GeometryType, RayTracingGeometry};
use crate::backend::{
    BufferDesc, BufferUsage, BufferView, CpuDescriptor, GpuAddress, GpuBuffer, RayTracingBackend,
    ResourceId,
};
use crate::command::{CommandList, GpuCommand, InstanceTransformCopy};
use crate::descriptor::DescriptorCache;
use crate::dispatch::BoundView;
use crate::errors::{RayTracingError, Result};
use crate::pipeline::{PipelineId, RayTracingPipeline};
use crate::settings::RayTracingSettings;
use crate::shader_table::{
    HIT_GROUP_SYSTEM_PARAMETERS_SIZE, HitGroupSystemParameters, ShaderTable, ShaderTableInitializer,
};
use crate::stats::{self, RayTracingStats};

/// Instance IDs and hit group contributions are 24-bit fields.
const MAX_INSTANCE_FIELD: u32 = 0x00FF_FFFF;

const INDICES_PER_PRIMITIVE: u32 = 3;

/// How long a scene and its shader tables stay valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SceneLifetime {
    /// Built, bound and dispatched within one frame.
    #[default]
    SingleFrame,
    MultiFrame,
}

/// Where the transforms of an instance come from.
#[derive(Debug, Clone)]
pub enum InstanceTransforms {
    /// Host transforms, one native instance each.
    Cpu(Vec<Affine3A>),
    /// Row-major 3x4 float matrices written by an earlier GPU pass.
    Gpu {
        source: BufferView,
        num_transforms: u32,
    },
}

impl InstanceTransforms {
    #[must_use]
    pub fn len(&self) -> u32 {
        match self {
            Self::Cpu(transforms) => transforms.len() as u32,
            Self::Gpu { num_transforms, .. } => *num_transforms,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One geometry placed in a scene, possibly many times.
#[derive(Debug, Clone)]
pub struct RayTracingGeometryInstance {
    pub geometry: Arc<RayTracingGeometry>,
    pub transforms: InstanceTransforms,
    /// Ray mask, tested against the mask passed to `TraceRay`.
    pub mask: u8,
    /// Instance ID visible to hit shaders (24 bits).
    pub user_data: u32,
    pub force_opaque: bool,
    /// Disables back-face culling.
    pub double_sided: bool,
}

impl RayTracingGeometryInstance {
    /// A single instance with full mask.
    #[must_use]
    pub fn new(geometry: Arc<RayTracingGeometry>, transform: Affine3A) -> Self {
        Self {
            geometry,
            transforms: InstanceTransforms::Cpu(vec![transform]),
            mask: 0xFF,
            user_data: 0,
            force_opaque: false,
            double_sided: false,
        }
    }
}

/// Driver-format instance description (64 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct RayTracingInstanceDesc {
    /// Row-major 3x4 object-to-world matrix.
    pub transform: [[f32; 4]; 3],
    /// Instance ID in the low 24 bits, mask above.
    pub instance_id_and_mask: u32,
    /// Hit group contribution in the low 24 bits, flags above.
    pub contribution_and_flags: u32,
    pub acceleration_structure: GpuAddress,
}

impl RayTracingInstanceDesc {
    #[must_use]
    pub fn new(
        transform: &Affine3A,
        instance_id: u32,
        mask: u8,
        hit_group_contribution: u32,
        flags: InstanceFlags,
        acceleration_structure: GpuAddress,
    ) -> Self {
        debug_assert!(instance_id <= MAX_INSTANCE_FIELD);
        debug_assert!(hit_group_contribution <= MAX_INSTANCE_FIELD);
        Self {
            transform: affine_to_rows(transform),
            instance_id_and_mask: (instance_id & MAX_INSTANCE_FIELD) | (u32::from(mask) << 24),
            contribution_and_flags: (hit_group_contribution & MAX_INSTANCE_FIELD)
                | (u32::from(flags.bits()) << 24),
            acceleration_structure,
        }
    }

    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & MAX_INSTANCE_FIELD
    }

    #[inline]
    #[must_use]
    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    #[inline]
    #[must_use]
    pub fn hit_group_contribution(&self) -> u32 {
        self.contribution_and_flags & MAX_INSTANCE_FIELD
    }

    #[inline]
    #[must_use]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_truncate((self.contribution_and_flags >> 24) as u8)
    }
}

fn affine_to_rows(transform: &Affine3A) -> [[f32; 4]; 3] {
    let translation = transform.translation.to_array();
    std::array::from_fn(|row| {
        let r = transform.matrix3.row(row);
        [r.x, r.y, r.z, translation[row]]
    })
}

/// Description of a [`RayTracingScene`].
#[derive(Debug, Clone, Default)]
pub struct RayTracingSceneInitializer {
    pub debug_name: String,
    pub instances: Vec<RayTracingGeometryInstance>,
    /// Hit group records per geometry segment (one per ray type).
    pub shader_slots_per_geometry_segment: u32,
    pub num_callable_shader_slots: u32,
    pub lifetime: SceneLifetime,
}

#[derive(Debug, Default)]
struct SceneGpuState {
    acceleration_structure: Option<GpuBuffer>,
    // Kept alive until the next build; the recorded build reads them.
    instance_buffer: Option<GpuBuffer>,
    scratch: Option<GpuBuffer>,
    view: Option<CpuDescriptor>,
    residency: FxHashSet<ResourceId>,
    shader_tables: FxHashMap<PipelineId, ShaderTable>,
}

/// A set of geometry instances, its TLAS and the shader tables of every
/// pipeline dispatched against it.
#[derive(Debug)]
pub struct RayTracingScene {
    debug_name: String,
    lifetime: SceneLifetime,
    instances: Vec<RayTracingGeometryInstance>,
    shader_slots_per_geometry_segment: u32,
    num_callable_shader_slots: u32,
    segment_prefix_sum: Vec<u32>,
    base_instance_prefix_sum: Vec<u32>,
    num_total_segments: u32,
    num_native_instances: u32,
    force_opaque: bool,
    disable_triangle_cull: bool,
    gpus: Vec<SceneGpuState>,
    backend: Arc<dyn RayTracingBackend>,
    stats: Arc<RayTracingStats>,
}

impl RayTracingScene {
    pub(crate) fn new(
        backend: &Arc<dyn RayTracingBackend>,
        stats: &Arc<RayTracingStats>,
        settings: &RayTracingSettings,
        init: RayTracingSceneInitializer,
    ) -> Result<Self> {
        if init.lifetime != SceneLifetime::SingleFrame {
            return Err(RayTracingError::UnsupportedSceneLifetime);
        }

        let mut segment_prefix_sum = Vec::with_capacity(init.instances.len());
        let mut base_instance_prefix_sum = Vec::with_capacity(init.instances.len());
        let mut num_total_segments = 0u32;
        let mut num_native_instances = 0u32;
        for instance in &init.instances {
            segment_prefix_sum.push(num_total_segments);
            base_instance_prefix_sum.push(num_native_instances);
            num_total_segments += instance.geometry.num_segments();
            num_native_instances += instance.transforms.len();
        }

        let max_contribution = u64::from(num_total_segments)
            * u64::from(init.shader_slots_per_geometry_segment);
        if max_contribution > u64::from(MAX_INSTANCE_FIELD) {
            return Err(RayTracingError::InvalidShaderTable(format!(
                "scene '{}' needs {max_contribution} hit records, more than a 24-bit contribution can address",
                init.debug_name
            )));
        }

        stats::add(&stats.allocated_tlas, 1);
        log::debug!(
            "Created ray tracing scene '{}': {} instances ({} native), {} segments",
            init.debug_name,
            init.instances.len(),
            num_native_instances,
            num_total_segments
        );

        Ok(Self {
            debug_name: init.debug_name,
            lifetime: init.lifetime,
            instances: init.instances,
            shader_slots_per_geometry_segment: init.shader_slots_per_geometry_segment,
            num_callable_shader_slots: init.num_callable_shader_slots,
            segment_prefix_sum,
            base_instance_prefix_sum,
            num_total_segments,
            num_native_instances,
            force_opaque: settings.force_opaque,
            disable_triangle_cull: settings.disable_triangle_cull,
            gpus: (0..backend.num_gpus().max(1)).map(|_| SceneGpuState::default()).collect(),
            backend: Arc::clone(backend),
            stats: Arc::clone(stats),
        })
    }

    #[inline]
    #[must_use]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[inline]
    #[must_use]
    pub fn lifetime(&self) -> SceneLifetime {
        self.lifetime
    }

    #[inline]
    #[must_use]
    pub fn instances(&self) -> &[RayTracingGeometryInstance] {
        &self.instances
    }

    #[inline]
    #[must_use]
    pub fn shader_slots_per_geometry_segment(&self) -> u32 {
        self.shader_slots_per_geometry_segment
    }

    #[inline]
    #[must_use]
    pub fn num_callable_shader_slots(&self) -> u32 {
        self.num_callable_shader_slots
    }

    #[inline]
    #[must_use]
    pub fn num_total_segments(&self) -> u32 {
        self.num_total_segments
    }

    /// Number of TLAS entries (one per transform).
    #[inline]
    #[must_use]
    pub fn num_native_instances(&self) -> u32 {
        self.num_native_instances
    }

    #[inline]
    #[must_use]
    pub fn segment_prefix_sum(&self) -> &[u32] {
        &self.segment_prefix_sum
    }

    #[inline]
    #[must_use]
    pub fn base_instance_prefix_sum(&self) -> &[u32] {
        &self.base_instance_prefix_sum
    }

    /// Index of the first hit record of `segment_index` of `instance_index`.
    ///
    /// Slot `s` of that segment lives at `hit_record_base_index(..) + s`.
    #[inline]
    #[must_use]
    pub fn hit_record_base_index(&self, instance_index: u32, segment_index: u32) -> u32 {
        (self.segment_prefix_sum[instance_index as usize] + segment_index)
            * self.shader_slots_per_geometry_segment
    }

    /// Record index of `shader_slot` of `segment_index` of `instance_index`.
    ///
    /// # Panics
    ///
    /// When any of the three is out of range for this scene.
    #[must_use]
    pub fn hit_record_index(&self, instance_index: u32, segment_index: u32, shader_slot: u32) -> u32 {
        let instance = self
            .instances
            .get(instance_index as usize)
            .unwrap_or_else(|| panic!("instance {instance_index} is not part of scene '{}'", self.debug_name));
        assert!(
            segment_index < instance.geometry.num_segments(),
            "instance {instance_index} has {} segments, got segment {segment_index}",
            instance.geometry.num_segments()
        );
        assert!(
            shader_slot < self.shader_slots_per_geometry_segment,
            "shader slot {shader_slot} exceeds the {} slots per segment of scene '{}'",
            self.shader_slots_per_geometry_segment,
            self.debug_name
        );
        self.hit_record_base_index(instance_index, segment_index) + shader_slot
    }

    /// Hit records a pipeline with hit group indexing needs for this scene.
    #[inline]
    #[must_use]
    pub fn num_hit_records(&self) -> u32 {
        self.num_total_segments * self.shader_slots_per_geometry_segment
    }

    fn instance_flags(&self, instance: &RayTracingGeometryInstance) -> InstanceFlags {
        let mut flags = InstanceFlags::TRIANGLE_FRONT_COUNTERCLOCKWISE;
        if instance.force_opaque || self.force_opaque {
            flags |= InstanceFlags::FORCE_OPAQUE;
        }
        if instance.double_sided || self.disable_triangle_cull {
            flags |= InstanceFlags::TRIANGLE_CULL_DISABLE;
        }
        flags
    }

    /// Instance descriptions for `gpu_index`, in TLAS order.
    ///
    /// GPU-sourced instances get identity transforms, patched on the GPU
    /// during the build. Fails when a referenced BLAS has not been built.
    pub fn instance_descs(&self, gpu_index: u32) -> Result<Vec<RayTracingInstanceDesc>> {
        let mut descs = Vec::with_capacity(self.num_native_instances as usize);
        for (index, instance) in self.instances.iter().enumerate() {
            let geometry = &instance.geometry;
            let address = match geometry.acceleration_structure_address(gpu_index) {
                Some(address) if !geometry.is_dirty(gpu_index) => address,
                _ => {
                    return Err(RayTracingError::AccelerationStructureBuildFailed(format!(
                        "scene '{}': instance {index} references geometry '{}' whose acceleration \
                         structure has not been built",
                        self.debug_name,
                        geometry.debug_name()
                    )));
                }
            };

            let flags = self.instance_flags(instance);
            let contribution =
                self.segment_prefix_sum[index] * self.shader_slots_per_geometry_segment;
            let make = |transform: &Affine3A| {
                RayTracingInstanceDesc::new(
                    transform,
                    instance.user_data,
                    instance.mask,
                    contribution,
                    flags,
                    address,
                )
            };
            match &instance.transforms {
                InstanceTransforms::Cpu(transforms) => descs.extend(transforms.iter().map(make)),
                InstanceTransforms::Gpu { num_transforms, .. } => {
                    descs.extend((0..*num_transforms).map(|_| make(&Affine3A::IDENTITY)));
                }
            }
        }
        Ok(descs)
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        gpu_index: u32,
        label: &'static str,
    ) -> Result<GpuBuffer> {
        GpuBuffer::new(
            &self.backend,
            &BufferDesc {
                size,
                usage,
                gpu_index,
                label,
            },
        )
    }

    /// Records the TLAS build for `commands`' GPU.
    ///
    /// The TLAS is always built from scratch. Barriers on both sides order
    /// it after the BLAS builds and before any dispatch.
    pub(crate) fn build(&mut self, commands: &mut CommandList) -> Result<()> {
        let gpu_index = commands.gpu_index();
        let descs = self.instance_descs(gpu_index)?;
        let desc_bytes: &[u8] = bytemuck::cast_slice(&descs);

        let instance_buffer = self.create_buffer(
            (desc_bytes.len() as u64).max(size_of::<RayTracingInstanceDesc>() as u64),
            BufferUsage::InstanceUpload,
            gpu_index,
            "tlas instance descriptions",
        )?;
        instance_buffer.write(0, desc_bytes);

        let inputs = AccelerationStructureInputs::top_level(
            BuildFlags::PREFER_FAST_TRACE,
            descs.len() as u32,
            instance_buffer.address(),
        );
        let prebuild = self
            .backend
            .acceleration_structure_prebuild_info(&inputs)
            .map_err(|e| {
                RayTracingError::AccelerationStructureBuildFailed(format!(
                    "scene '{}': {e}",
                    self.debug_name
                ))
            })?;
        let result = self.create_buffer(
            prebuild.result_size,
            BufferUsage::AccelerationStructure,
            gpu_index,
            "top level acceleration structure",
        )?;
        let scratch = self.create_buffer(
            prebuild.scratch_size,
            BufferUsage::Scratch,
            gpu_index,
            "acceleration structure scratch",
        )?;

        // GPU-sourced transforms overwrite the placeholders before the build.
        let mut first_instance = 0u32;
        for (index, instance) in self.instances.iter().enumerate() {
            if let InstanceTransforms::Gpu {
                source,
                num_transforms,
            } = &instance.transforms
            {
                debug_assert_eq!(first_instance, self.base_instance_prefix_sum[index]);
                commands.update_residency(source.resource);
                commands.push(GpuCommand::CopyInstanceTransforms(InstanceTransformCopy {
                    source: source.address,
                    dest: instance_buffer.address(),
                    first_instance,
                    num_instances: *num_transforms,
                }));
            }
            first_instance += instance.transforms.len();
        }

        let mut residency = FxHashSet::default();
        residency.insert(result.resource_id());
        for instance in &self.instances {
            if let Some(blas) = instance.geometry.acceleration_structure_resource(gpu_index) {
                residency.insert(blas);
            }
        }
        commands.extend_residency(residency.iter().copied());
        commands.update_residency(instance_buffer.resource_id());
        commands.update_residency(scratch.resource_id());

        commands.uav_barrier();
        commands.build_acceleration_structure(AccelerationStructureBuild {
            inputs,
            dest: result.address(),
            scratch: scratch.address(),
            source: None,
        });
        commands.uav_barrier();

        stats::add(&self.stats.built_tlas, 1);
        stats::add(&self.stats.tlas_memory, result.size());

        let view = self.backend.acceleration_structure_view(result.address());
        let state = &mut self.gpus[gpu_index as usize];
        if let Some(old) = state.acceleration_structure.replace(result) {
            stats::sub(&self.stats.tlas_memory, old.size());
            commands.retain_buffer(old);
        }
        let replaced = [
            state.instance_buffer.replace(instance_buffer),
            state.scratch.replace(scratch),
        ];
        for old in replaced.into_iter().flatten() {
            commands.retain_buffer(old);
        }
        state.view = Some(view);
        state.residency = residency;

        log::debug!(
            "Recorded TLAS build of scene '{}' with {} native instances",
            self.debug_name,
            descs.len()
        );
        Ok(())
    }

    /// Whether the TLAS of `gpu_index` has been recorded.
    #[must_use]
    pub fn is_built(&self, gpu_index: u32) -> bool {
        self.gpus[gpu_index as usize].acceleration_structure.is_some()
    }

    #[must_use]
    pub fn acceleration_structure_address(&self, gpu_index: u32) -> Option<GpuAddress> {
        self.gpus[gpu_index as usize]
            .acceleration_structure
            .as_ref()
            .map(GpuBuffer::address)
    }

    /// Shader resource view of the TLAS, bound as a global SRV.
    #[must_use]
    pub fn acceleration_structure_view(&self, gpu_index: u32) -> Option<CpuDescriptor> {
        self.gpus[gpu_index as usize].view
    }

    /// The TLAS as a bindable shader resource.
    #[must_use]
    pub fn acceleration_structure_srv(&self, gpu_index: u32) -> Option<BoundView> {
        let state = &self.gpus[gpu_index as usize];
        let buffer = state.acceleration_structure.as_ref()?;
        Some(BoundView {
            descriptor: state.view?,
            resource: buffer.resource_id(),
        })
    }

    /// Instance description buffer of the last build.
    #[must_use]
    pub fn instance_buffer(&self, gpu_index: u32) -> Option<&GpuBuffer> {
        self.gpus[gpu_index as usize].instance_buffer.as_ref()
    }

    /// Makes the TLAS and every referenced BLAS resident for `commands`.
    pub fn update_residency(&self, commands: &mut CommandList) {
        let state = &self.gpus[commands.gpu_index() as usize];
        commands.extend_residency(state.residency.iter().copied());
    }

    // --- Shader tables ---

    #[must_use]
    pub fn shader_table(&self, pipeline: PipelineId, gpu_index: u32) -> Option<&ShaderTable> {
        self.gpus[gpu_index as usize].shader_tables.get(&pipeline)
    }

    pub fn shader_table_mut(
        &mut self,
        pipeline: PipelineId,
        gpu_index: u32,
    ) -> Option<&mut ShaderTable> {
        self.gpus[gpu_index as usize].shader_tables.get_mut(&pipeline)
    }

    #[must_use]
    pub fn shader_table_count(&self, gpu_index: u32) -> usize {
        self.gpus[gpu_index as usize].shader_tables.len()
    }

    /// Drops every shader table (and its bindings) of every GPU.
    pub fn clear_shader_tables(&mut self) {
        for state in &mut self.gpus {
            state.shader_tables.clear();
        }
    }

    /// Shape of the shader table `pipeline` needs for this scene.
    #[must_use]
    pub fn shader_table_initializer(&self, pipeline: &RayTracingPipeline) -> ShaderTableInitializer {
        let num_hit_records = if pipeline.allow_hit_group_indexing() {
            self.num_hit_records()
        } else {
            0
        };
        ShaderTableInitializer {
            num_ray_gen_records: pipeline.ray_gen_shaders().len() as u32,
            num_miss_records: pipeline.miss_shaders().len() as u32,
            num_hit_records,
            num_callable_records: self.num_callable_shader_slots,
            local_root_data_size: pipeline.max_local_root_signature_size(),
            max_view_descriptors_per_record: pipeline.max_view_descriptors_per_record(),
        }
    }

    /// Returns the table of `pipeline` on `gpu_index`, creating it on first use.
    ///
    /// New tables get the pipeline's ray gen, miss and default hit group
    /// identifiers. When hit group indexing is on, every hit record also gets
    /// the system parameters of its segment; identifiers stay NULL until a
    /// hit group is bound.
    pub(crate) fn find_or_create_shader_table(
        &mut self,
        pipeline: &RayTracingPipeline,
        gpu_index: u32,
        create_descriptor_cache: impl FnOnce(&ShaderTableInitializer) -> Result<Option<DescriptorCache>>,
    ) -> Result<&mut ShaderTable> {
        let id = pipeline.id();
        if !self.gpus[gpu_index as usize].shader_tables.contains_key(&id) {
            let table = self.create_shader_table(pipeline, gpu_index, create_descriptor_cache)?;
            self.gpus[gpu_index as usize].shader_tables.insert(id, table);
        }
        self.gpus[gpu_index as usize]
            .shader_tables
            .get_mut(&id)
            .ok_or_else(|| RayTracingError::InvalidShaderTable("shader table vanished".into()))
    }

    fn create_shader_table(
        &self,
        pipeline: &RayTracingPipeline,
        gpu_index: u32,
        create_descriptor_cache: impl FnOnce(&ShaderTableInitializer) -> Result<Option<DescriptorCache>>,
    ) -> Result<ShaderTable> {
        if pipeline.is_partial() {
            return Err(RayTracingError::InvalidPipeline(
                "partial pipelines cannot be dispatched".into(),
            ));
        }

        let init = self.shader_table_initializer(pipeline);
        if init.num_hit_records > 0 && init.local_root_data_size < HIT_GROUP_SYSTEM_PARAMETERS_SIZE {
            return Err(RayTracingError::InvalidShaderTable(format!(
                "hit group local root signatures must hold {HIT_GROUP_SYSTEM_PARAMETERS_SIZE} bytes \
                 of system parameters, pipeline provides {}",
                init.local_root_data_size
            )));
        }

        let descriptor_cache = create_descriptor_cache(&init)?;
        let mut table = ShaderTable::new(&self.backend, &init, gpu_index, descriptor_cache)?;
        table.set_ray_gen_identifiers(pipeline.ray_gen_shaders().identifiers());
        table.set_miss_identifiers(pipeline.miss_shaders().identifiers());
        if !pipeline.hit_group_shaders().is_empty() {
            table.set_default_hit_group_identifier(&pipeline.hit_group_shaders().identifier(0));
        }

        if init.num_hit_records > 0 {
            for (instance_index, instance) in self.instances.iter().enumerate() {
                let instance_index = instance_index as u32;
                let geometry = &instance.geometry;
                let vertex_buffer = geometry.vertex_buffer();
                table.add_resource_reference(vertex_buffer.resource);
                if let Some(ib) = geometry.index_buffer() {
                    table.add_resource_reference(ib.buffer.resource);
                }

                let index_stride = geometry.index_stride();
                for (segment_index, segment) in geometry.segments().iter().enumerate() {
                    let mut parameters = HitGroupSystemParameters {
                        index_buffer: geometry.index_buffer().map_or(0, |ib| ib.buffer.address),
                        vertex_buffer: vertex_buffer.address
                            + u64::from(geometry.vertex_offset_in_bytes()),
                        ..Default::default()
                    };
                    let constants = &mut parameters.root_constants;
                    constants.set_vertex_and_index_stride(geometry.vertex_stride(), index_stride);
                    if geometry.geometry_type() == GeometryType::Triangles {
                        constants.index_buffer_offset_in_bytes =
                            index_stride * segment.first_primitive * INDICES_PER_PRIMITIVE;
                    }
                    constants.user_data = instance.user_data;
                    constants.base_instance_index = self.base_instance_prefix_sum[instance_index as usize];

                    let base = self.hit_record_base_index(instance_index, segment_index as u32);
                    for slot in 0..self.shader_slots_per_geometry_segment {
                        table.set_local_shader_parameter(base + slot, 0, &parameters);
                    }
                }
            }
        }

        log::debug!(
            "Created shader table for pipeline {:?} on scene '{}' ({} hit records)",
            pipeline.id(),
            self.debug_name,
            init.num_hit_records
        );
        Ok(table)
    }
}

impl Drop for RayTracingScene {
    fn drop(&mut self) {
        let held: u64 = self
            .gpus
            .iter()
            .filter_map(|state| state.acceleration_structure.as_ref())
            .map(GpuBuffer::size)
            .sum();
        stats::sub(&self.stats.tlas_memory, held);
        stats::sub(&self.stats.allocated_tlas, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn instance_desc_is_driver_sized() {
        assert_eq!(size_of::<RayTracingInstanceDesc>(), 64);
    }

    #[test]
    fn packs_id_mask_contribution_and_flags() {
        let desc = RayTracingInstanceDesc::new(
            &Affine3A::IDENTITY,
            0x12_3456,
            0xA5,
            42,
            InstanceFlags::FORCE_OPAQUE | InstanceFlags::TRIANGLE_CULL_DISABLE,
            0x1000,
        );
        assert_eq!(desc.instance_id(), 0x12_3456);
        assert_eq!(desc.mask(), 0xA5);
        assert_eq!(desc.hit_group_contribution(), 42);
        assert_eq!(
            desc.flags(),
            InstanceFlags::FORCE_OPAQUE | InstanceFlags::TRIANGLE_CULL_DISABLE
        );
    }

    #[test]
    fn transform_rows_carry_translation_in_last_column() {
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::splat(2.0),
            Quat::IDENTITY,
            Vec3::new(1.0, 2.0, 3.0),
        );
        let rows = affine_to_rows(&transform);
        assert_eq!(rows[0], [2.0, 0.0, 0.0, 1.0]);
        assert_eq!(rows[1], [0.0, 2.0, 0.0, 2.0]);
        assert_eq!(rows[2], [0.0, 0.0, 2.0, 3.0]);
    }
}
