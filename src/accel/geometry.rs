//! Bottom-level acceleration structures.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{
    AabbsDesc, AccelerationStructureBuild, AccelerationStructureInputs, BuildFlags, GeometryDesc,
    GeometryFlags, TrianglesDesc,
};
use crate::backend::{
    BufferDesc, BufferUsage, BufferView, GpuAddress, GpuBuffer, RayTracingBackend, ResourceId,
};
use crate::command::{CommandList, GpuCommand};
use crate::errors::{RayTracingError, Result};
use crate::settings::RayTracingSettings;
use crate::stats::{self, RayTracingStats};

const INDICES_PER_PRIMITIVE: u32 = 3;

/// Bytes of one procedural primitive's bounding box (min and max corners).
const AABB_SIZE: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeometryType {
    #[default]
    Triangles,
    /// Axis-aligned boxes intersected by a custom intersection shader.
    Procedural,
}

/// Position formats accepted for triangle geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexFormat {
    #[default]
    Float3,
    Float2,
    Half2,
}

impl VertexFormat {
    #[must_use]
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Self::Float3 => 12,
            Self::Float2 => 8,
            Self::Half2 => 4,
        }
    }
}

/// An index buffer and its element size (2 or 4 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBuffer {
    pub buffer: BufferView,
    pub stride: u32,
}

/// A range of primitives sharing hit group slots and geometry flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometrySegment {
    pub first_primitive: u32,
    pub num_primitives: u32,
    /// `false` marks the segment opaque.
    pub allow_any_hit_shader: bool,
    pub allow_duplicate_any_hit_shader_invocation: bool,
}

impl Default for GeometrySegment {
    fn default() -> Self {
        Self {
            first_primitive: 0,
            num_primitives: 0,
            allow_any_hit_shader: true,
            allow_duplicate_any_hit_shader_invocation: true,
        }
    }
}

impl GeometrySegment {
    fn geometry_flags(&self) -> GeometryFlags {
        let mut flags = GeometryFlags::empty();
        if !self.allow_any_hit_shader {
            flags |= GeometryFlags::OPAQUE;
        }
        if !self.allow_duplicate_any_hit_shader_invocation {
            flags |= GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION;
        }
        flags
    }
}

/// Description of a [`RayTracingGeometry`].
#[derive(Debug, Clone)]
pub struct RayTracingGeometryInitializer {
    pub debug_name: String,
    pub geometry_type: GeometryType,
    /// Positions (triangles) or bounding boxes (procedural).
    pub vertex_buffer: BufferView,
    pub vertex_format: VertexFormat,
    pub vertex_stride: u32,
    pub vertex_byte_offset: u32,
    pub base_vertex_index: u32,
    pub index_buffer: Option<IndexBuffer>,
    pub total_primitive_count: u32,
    /// One segment covering every primitive when empty.
    pub segments: Vec<GeometrySegment>,
    pub fast_build: bool,
    pub allow_update: bool,
}

impl RayTracingGeometryInitializer {
    /// Non-indexed or indexed float3 triangles.
    #[must_use]
    pub fn triangles(
        vertex_buffer: BufferView,
        index_buffer: Option<IndexBuffer>,
        total_primitive_count: u32,
    ) -> Self {
        Self {
            debug_name: String::new(),
            geometry_type: GeometryType::Triangles,
            vertex_buffer,
            vertex_format: VertexFormat::Float3,
            vertex_stride: VertexFormat::Float3.size_in_bytes(),
            vertex_byte_offset: 0,
            base_vertex_index: 0,
            index_buffer,
            total_primitive_count,
            segments: Vec::new(),
            fast_build: false,
            allow_update: false,
        }
    }

    /// Bounding boxes read from `aabb_buffer`, one per primitive.
    #[must_use]
    pub fn procedural(aabb_buffer: BufferView, total_primitive_count: u32) -> Self {
        Self {
            geometry_type: GeometryType::Procedural,
            vertex_stride: AABB_SIZE,
            ..Self::triangles(aabb_buffer, None, total_primitive_count)
        }
    }

    fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(RayTracingError::InvalidGeometry(message));

        if self.vertex_stride == 0 || self.vertex_stride % 4 != 0 {
            return fail(format!(
                "'{}': vertex stride {} must be a non-zero multiple of 4",
                self.debug_name, self.vertex_stride
            ));
        }
        match self.geometry_type {
            GeometryType::Triangles if self.vertex_stride < self.vertex_format.size_in_bytes() => {
                return fail(format!(
                    "'{}': vertex stride {} is smaller than a {:?} position",
                    self.debug_name, self.vertex_stride, self.vertex_format
                ));
            }
            GeometryType::Procedural if self.vertex_stride < AABB_SIZE => {
                return fail(format!(
                    "'{}': procedural geometry needs at least {AABB_SIZE} bytes per bounding box",
                    self.debug_name
                ));
            }
            _ => {}
        }
        if let Some(index_buffer) = &self.index_buffer {
            if index_buffer.stride != 2 && index_buffer.stride != 4 {
                return fail(format!(
                    "'{}': index buffer must be 16 or 32 bit, got stride {}",
                    self.debug_name, index_buffer.stride
                ));
            }
            if self.geometry_type == GeometryType::Procedural {
                return fail(format!(
                    "'{}': procedural geometry cannot be indexed",
                    self.debug_name
                ));
            }
        }

        let mut covered = 0u64;
        for segment in &self.segments {
            let end = u64::from(segment.first_primitive) + u64::from(segment.num_primitives);
            if end > u64::from(self.total_primitive_count) {
                return fail(format!(
                    "'{}': segment [{}, {end}) exceeds {} primitives",
                    self.debug_name, segment.first_primitive, self.total_primitive_count
                ));
            }
            covered += u64::from(segment.num_primitives);
        }
        if !self.segments.is_empty() && covered != u64::from(self.total_primitive_count) {
            return fail(format!(
                "'{}': segments cover {covered} of {} primitives",
                self.debug_name, self.total_primitive_count
            ));
        }
        if self.index_buffer.is_none()
            && self.geometry_type == GeometryType::Triangles
            && self.segments.len() > 1
        {
            return fail(format!(
                "'{}': non-indexed geometry supports a single segment",
                self.debug_name
            ));
        }
        Ok(())
    }
}

/// Lifecycle of a BLAS on one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlasState {
    /// Needs a build before it can be referenced.
    Dirty,
    /// Build recorded; its fence has not passed yet.
    Building,
    Ready,
    /// Built; the compacted size readback is available.
    ReadyPendingCompaction,
    /// Replaced by an exactly sized copy.
    Compacted,
}

impl BlasState {
    /// Whether the structure can be referenced by a TLAS build.
    #[must_use]
    pub fn is_built(self) -> bool {
        !matches!(self, Self::Dirty)
    }
}

/// Batch entry for building or refitting several geometries at once.
#[derive(Debug, Clone)]
pub struct AccelerationStructureUpdate {
    pub geometry: Arc<RayTracingGeometry>,
    /// Replaces the geometry's vertex buffer before building.
    pub vertex_buffer: Option<BufferView>,
}

#[derive(Debug)]
struct BlasSlot {
    state: BlasState,
    result: Option<GpuBuffer>,
    scratch: Option<GpuBuffer>,
    compacted_size_readback: Option<GpuBuffer>,
    /// The result buffer holds an exactly sized copy.
    compacted: bool,
    /// Fence of the submission that carries the last build.
    build_fence: u64,
}

impl BlasSlot {
    fn new() -> Self {
        Self {
            state: BlasState::Dirty,
            result: None,
            scratch: None,
            compacted_size_readback: None,
            compacted: false,
            build_fence: u64::MAX,
        }
    }
}

/// Mesh geometry plus its per-GPU bottom-level acceleration structure.
#[derive(Debug)]
pub struct RayTracingGeometry {
    debug_name: String,
    geometry_type: GeometryType,
    vertex_buffer: Mutex<BufferView>,
    vertex_format: VertexFormat,
    vertex_stride: u32,
    vertex_offset_in_bytes: u32,
    index_buffer: Option<IndexBuffer>,
    total_primitive_count: u32,
    segments: SmallVec<[GeometrySegment; 1]>,
    build_flags: BuildFlags,
    force_full_build: bool,
    slots: Vec<Mutex<BlasSlot>>,
    backend: Arc<dyn RayTracingBackend>,
    stats: Arc<RayTracingStats>,
}

impl RayTracingGeometry {
    pub(crate) fn new(
        backend: &Arc<dyn RayTracingBackend>,
        stats: &Arc<RayTracingStats>,
        settings: &RayTracingSettings,
        init: RayTracingGeometryInitializer,
    ) -> Result<Self> {
        init.validate()?;

        let prefer_fast_build = settings.force_build_mode.prefer_fast_build(init.fast_build);
        let build_flags =
            BuildFlags::for_geometry(prefer_fast_build, init.allow_update, settings.auto_compaction);

        let segments: SmallVec<[GeometrySegment; 1]> = if init.segments.is_empty() {
            SmallVec::from_elem(
                GeometrySegment {
                    num_primitives: init.total_primitive_count,
                    ..Default::default()
                },
                1,
            )
        } else {
            SmallVec::from_vec(init.segments)
        };

        stats::add(&stats.allocated_blas, 1);
        stats::add(&stats.blas_triangles, u64::from(init.total_primitive_count));

        Ok(Self {
            debug_name: init.debug_name,
            geometry_type: init.geometry_type,
            vertex_buffer: Mutex::new(init.vertex_buffer),
            vertex_format: init.vertex_format,
            vertex_stride: init.vertex_stride,
            vertex_offset_in_bytes: init.base_vertex_index * init.vertex_stride
                + init.vertex_byte_offset,
            index_buffer: init.index_buffer,
            total_primitive_count: init.total_primitive_count,
            segments,
            build_flags,
            force_full_build: settings.force_full_build,
            slots: (0..backend.num_gpus().max(1))
                .map(|_| Mutex::new(BlasSlot::new()))
                .collect(),
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
    pub fn geometry_type(&self) -> GeometryType {
        self.geometry_type
    }

    #[must_use]
    pub fn vertex_buffer(&self) -> BufferView {
        *self.vertex_buffer.lock()
    }

    /// Points the geometry at new vertex data. Takes effect on the next build.
    pub fn set_vertex_buffer(&self, vertex_buffer: BufferView) {
        *self.vertex_buffer.lock() = vertex_buffer;
    }

    #[inline]
    #[must_use]
    pub fn vertex_stride(&self) -> u32 {
        self.vertex_stride
    }

    #[inline]
    #[must_use]
    pub fn vertex_offset_in_bytes(&self) -> u32 {
        self.vertex_offset_in_bytes
    }

    #[inline]
    #[must_use]
    pub fn index_buffer(&self) -> Option<&IndexBuffer> {
        self.index_buffer.as_ref()
    }

    /// 0 for non-indexed geometry.
    #[inline]
    #[must_use]
    pub fn index_stride(&self) -> u32 {
        self.index_buffer.map_or(0, |ib| ib.stride)
    }

    #[inline]
    #[must_use]
    pub fn total_primitive_count(&self) -> u32 {
        self.total_primitive_count
    }

    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[GeometrySegment] {
        &self.segments
    }

    #[inline]
    #[must_use]
    pub fn num_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    #[inline]
    #[must_use]
    pub fn build_flags(&self) -> BuildFlags {
        self.build_flags
    }

    #[inline]
    #[must_use]
    pub fn allows_update(&self) -> bool {
        self.build_flags.contains(BuildFlags::ALLOW_UPDATE)
    }

    /// Current lifecycle state on `gpu_index`.
    #[must_use]
    pub fn state(&self, gpu_index: u32) -> BlasState {
        let mut slot = self.slot(gpu_index);
        self.refresh(&mut slot);
        slot.state
    }

    #[must_use]
    pub fn is_dirty(&self, gpu_index: u32) -> bool {
        self.slot(gpu_index).state == BlasState::Dirty
    }

    /// Requests a rebuild on every GPU. Pending compaction is abandoned; the
    /// readback buffer is released by the next build, which may still be
    /// behind a recorded size query.
    pub fn mark_dirty(&self) {
        for slot in &self.slots {
            slot.lock().state = BlasState::Dirty;
        }
    }

    /// Address of the built structure, if any.
    #[must_use]
    pub fn acceleration_structure_address(&self, gpu_index: u32) -> Option<GpuAddress> {
        self.slot(gpu_index).result.as_ref().map(GpuBuffer::address)
    }

    /// Size of the result buffer, if any.
    #[must_use]
    pub fn acceleration_structure_size(&self, gpu_index: u32) -> Option<u64> {
        self.slot(gpu_index).result.as_ref().map(GpuBuffer::size)
    }

    #[must_use]
    pub fn acceleration_structure_resource(&self, gpu_index: u32) -> Option<ResourceId> {
        self.slot(gpu_index).result.as_ref().map(GpuBuffer::resource_id)
    }

    /// Whether a scratch buffer is currently held.
    #[must_use]
    pub fn has_scratch_buffer(&self, gpu_index: u32) -> bool {
        self.slot(gpu_index).scratch.is_some()
    }

    fn slot(&self, gpu_index: u32) -> parking_lot::MutexGuard<'_, BlasSlot> {
        self.slots[gpu_index as usize].lock()
    }

    fn refresh(&self, slot: &mut BlasSlot) {
        if slot.state == BlasState::Building && self.backend.completed_fence() >= slot.build_fence {
            slot.state = if slot.compacted_size_readback.is_some() {
                BlasState::ReadyPendingCompaction
            } else {
                BlasState::Ready
            };
        }
    }

    /// Driver-level description of every segment.
    #[must_use]
    pub fn geometry_descs(&self) -> Vec<GeometryDesc> {
        let vertex_buffer = self.vertex_buffer();
        let vertex_start = vertex_buffer.address + u64::from(self.vertex_offset_in_bytes);
        let stride = u64::from(self.vertex_stride);

        self.segments
            .iter()
            .map(|segment| {
                let flags = segment.geometry_flags();
                match self.geometry_type {
                    GeometryType::Triangles => {
                        let available_vertices = (vertex_buffer.size / stride) as u32;
                        let (index_buffer, index_stride, index_count, vertex_count) =
                            match &self.index_buffer {
                                Some(ib) => (
                                    ib.buffer.address
                                        + u64::from(ib.stride)
                                            * u64::from(segment.first_primitive)
                                            * u64::from(INDICES_PER_PRIMITIVE),
                                    ib.stride,
                                    segment.num_primitives * INDICES_PER_PRIMITIVE,
                                    available_vertices,
                                ),
                                None => (
                                    0,
                                    0,
                                    0,
                                    available_vertices
                                        .min(self.total_primitive_count * INDICES_PER_PRIMITIVE),
                                ),
                            };
                        GeometryDesc::Triangles(TrianglesDesc {
                            flags,
                            vertex_buffer: vertex_start,
                            vertex_stride: stride,
                            vertex_count,
                            vertex_format: self.vertex_format,
                            index_buffer,
                            index_stride,
                            index_count,
                        })
                    }
                    GeometryType::Procedural => GeometryDesc::Procedural(AabbsDesc {
                        flags,
                        aabbs: vertex_start
                            + u64::from(segment.first_primitive) * stride,
                        stride,
                        count: u64::from(segment.num_primitives),
                    }),
                }
            })
            .collect()
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

    /// Records a build (or refit) into `commands` if the structure is dirty.
    ///
    /// Returns whether a build was recorded. Refits fall back to full builds
    /// on the first build and when full builds are forced.
    pub(crate) fn build(&self, commands: &mut CommandList, is_update: bool) -> Result<bool> {
        let gpu_index = commands.gpu_index();
        let mut slot = self.slot(gpu_index);

        if slot.state != BlasState::Dirty {
            log::trace!("BLAS '{}' is up to date, skipping build", self.debug_name);
            return Ok(false);
        }
        if is_update && !self.allows_update() {
            return Err(RayTracingError::InvalidGeometry(format!(
                "'{}' was created without allow_update and cannot be refit",
                self.debug_name
            )));
        }

        let is_update = is_update && !self.force_full_build && slot.result.is_some();
        let mut flags = self.build_flags;
        if is_update {
            flags |= BuildFlags::PERFORM_UPDATE;
        }
        let inputs = AccelerationStructureInputs::bottom_level(flags, self.geometry_descs());

        // Compacted buffers are too small for a fresh build.
        let needs_result = slot.result.is_none() || (!is_update && slot.compacted);
        if needs_result || slot.scratch.is_none() {
            let prebuild = self
                .backend
                .acceleration_structure_prebuild_info(&inputs)
                .map_err(|e| {
                    RayTracingError::AccelerationStructureBuildFailed(format!(
                        "'{}': {e}",
                        self.debug_name
                    ))
                })?;

            if needs_result {
                let result = self.create_buffer(
                    prebuild.result_size,
                    BufferUsage::AccelerationStructure,
                    gpu_index,
                    "bottom level acceleration structure",
                )?;
                stats::add(&self.stats.blas_memory, result.size());
                if let Some(old) = slot.result.replace(result) {
                    stats::sub(&self.stats.blas_memory, old.size());
                    commands.retain_buffer(old);
                }
                slot.compacted = false;
            }
            if slot.scratch.is_none() {
                let scratch = self.create_buffer(
                    prebuild.scratch_size.max(prebuild.update_scratch_size),
                    BufferUsage::Scratch,
                    gpu_index,
                    "acceleration structure scratch",
                )?;
                stats::add(&self.stats.blas_memory, scratch.size());
                slot.scratch = Some(scratch);
            }
        }

        let (Some(result), Some(scratch)) = (&slot.result, &slot.scratch) else {
            return Err(RayTracingError::AccelerationStructureBuildFailed(format!(
                "'{}': buffers missing after allocation",
                self.debug_name
            )));
        };
        let dest = result.address();

        commands.update_residency(self.vertex_buffer().resource);
        if let Some(ib) = &self.index_buffer {
            commands.update_residency(ib.buffer.resource);
        }
        commands.update_residency(result.resource_id());
        commands.update_residency(scratch.resource_id());

        commands.build_acceleration_structure(AccelerationStructureBuild {
            inputs,
            dest,
            scratch: scratch.address(),
            source: is_update.then_some(dest),
        });

        if is_update {
            stats::add(&self.stats.updated_blas, 1);
        } else {
            stats::add(&self.stats.built_blas, 1);
        }

        if let Some(stale) = slot.compacted_size_readback.take() {
            commands.retain_buffer(stale);
        }
        if !is_update && self.build_flags.contains(BuildFlags::ALLOW_COMPACTION) {
            let readback =
                self.create_buffer(8, BufferUsage::Readback, gpu_index, "compacted size readback")?;
            commands.uav_barrier();
            commands.push(GpuCommand::EmitCompactedSize {
                source: dest,
                dest: readback.handle(),
                offset: 0,
            });
            commands.update_residency(readback.resource_id());
            slot.compacted_size_readback = Some(readback);
        }

        // Static structures never need scratch memory again. The recorded
        // build still reads it, so the list holds it until submission completes.
        if !self.allows_update() {
            if let Some(scratch) = slot.scratch.take() {
                stats::sub(&self.stats.blas_memory, scratch.size());
                commands.retain_buffer(scratch);
            }
        }

        slot.state = BlasState::Building;
        slot.build_fence = u64::MAX;

        log::trace!(
            "Recorded {} of BLAS '{}' ({} primitives, {} segments)",
            if is_update { "refit" } else { "build" },
            self.debug_name,
            self.total_primitive_count,
            self.segments.len()
        );
        Ok(true)
    }

    /// Associates the last recorded build on `gpu_index` with the fence of
    /// the submission that carries it.
    pub(crate) fn set_build_fence(&self, gpu_index: u32, fence_value: u64) {
        let mut slot = self.slot(gpu_index);
        if slot.state == BlasState::Building {
            slot.build_fence = slot.build_fence.min(fence_value);
        }
    }

    /// Records the compacting copy once the compacted size is known.
    ///
    /// Returns whether a compaction was recorded. Structures whose reported
    /// size is not smaller than the current buffer become `Ready` instead.
    pub(crate) fn compact(&self, commands: &mut CommandList) -> Result<bool> {
        let gpu_index = commands.gpu_index();
        let mut slot = self.slot(gpu_index);
        self.refresh(&mut slot);
        if slot.state != BlasState::ReadyPendingCompaction {
            return Ok(false);
        }

        let Some(readback) = slot.compacted_size_readback.take() else {
            slot.state = BlasState::Ready;
            return Ok(false);
        };
        let mut bytes = [0u8; 8];
        readback.read(0, &mut bytes);
        let compacted_size = u64::from_le_bytes(bytes);

        let Some(current) = slot.result.as_ref() else {
            slot.state = BlasState::Dirty;
            return Ok(false);
        };
        if compacted_size == 0 || compacted_size >= current.size() {
            log::debug!(
                "BLAS '{}' does not shrink ({compacted_size} >= {} bytes), skipping compaction",
                self.debug_name,
                current.size()
            );
            slot.state = BlasState::Ready;
            return Ok(false);
        }

        let compacted = self.create_buffer(
            compacted_size,
            BufferUsage::AccelerationStructure,
            gpu_index,
            "compacted bottom level acceleration structure",
        )?;
        commands.push(GpuCommand::CompactAccelerationStructure {
            dest: compacted.address(),
            source: current.address(),
        });
        commands.update_residency(current.resource_id());
        commands.update_residency(compacted.resource_id());

        log::debug!(
            "Compacting BLAS '{}' from {} to {compacted_size} bytes",
            self.debug_name,
            current.size()
        );
        stats::add(&self.stats.blas_memory, compacted.size());
        stats::add(&self.stats.compacted_blas, 1);
        if let Some(old) = slot.result.replace(compacted) {
            stats::sub(&self.stats.blas_memory, old.size());
            commands.retain_buffer(old);
        }
        slot.state = BlasState::Compacted;
        slot.compacted = true;
        Ok(true)
    }
}

impl Drop for RayTracingGeometry {
    fn drop(&mut self) {
        let held: u64 = self
            .slots
            .iter()
            .map(|slot| {
                let slot = slot.lock();
                slot.result.as_ref().map_or(0, GpuBuffer::size)
                    + slot.scratch.as_ref().map_or(0, GpuBuffer::size)
            })
            .sum();
        stats::sub(&self.stats.blas_memory, held);
        stats::sub(&self.stats.blas_triangles, u64::from(self.total_primitive_count));
        stats::sub(&self.stats.allocated_blas, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(size: u64) -> BufferView {
        BufferView {
            resource: ResourceId::next(),
            address: 0x1000,
            size,
        }
    }

    #[test]
    fn default_segment_covers_all_primitives() {
        let init = RayTracingGeometryInitializer::triangles(view(36 * 12), None, 12);
        assert!(init.validate().is_ok());
    }

    #[test]
    fn rejects_partial_segment_coverage() {
        let mut init = RayTracingGeometryInitializer::triangles(
            view(1024),
            Some(IndexBuffer {
                buffer: view(1024),
                stride: 2,
            }),
            10,
        );
        init.segments = vec![GeometrySegment {
            num_primitives: 4,
            ..Default::default()
        }];
        assert!(matches!(init.validate(), Err(RayTracingError::InvalidGeometry(_))));
    }

    #[test]
    fn rejects_bad_strides() {
        let mut init = RayTracingGeometryInitializer::triangles(view(1024), None, 4);
        init.vertex_stride = 10;
        assert!(init.validate().is_err());

        let mut init = RayTracingGeometryInitializer::procedural(view(1024), 4);
        init.vertex_stride = 16;
        assert!(init.validate().is_err());
    }

    #[test]
    fn segment_flags() {
        let segment = GeometrySegment {
            allow_any_hit_shader: false,
            allow_duplicate_any_hit_shader_invocation: false,
            ..Default::default()
        };
        assert_eq!(
            segment.geometry_flags(),
            GeometryFlags::OPAQUE | GeometryFlags::NO_DUPLICATE_ANYHIT_INVOCATION
        );
        assert!(GeometrySegment::default().geometry_flags().is_empty());
    }
}
