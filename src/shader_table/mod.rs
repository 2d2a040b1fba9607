//! Shader Binding Tables
//!
//! A [`ShaderTable`] is one CPU-side byte arena laid out by
//! [`ShaderTableLayout`], uploaded to a GPU buffer before dispatch. Record
//! writes only touch the arena and mark the table dirty; the GPU address is
//! available again after [`ShaderTable::copy_to_gpu`].
//!
//! Besides the bytes, a table owns what its records reference:
//!
//! - the descriptor heaps its descriptor tables live in ([`DescriptorCache`])
//! - one [`ShaderRecordCache`] per binding worker
//! - the set of resources that must be resident while it is in use
//! - transient constant buffers created for loose parameters

mod layout;
mod record_cache;
mod system_parameters;

pub use layout::{
    DEFAULT_HIT_GROUP_RECORD_SIZE, RAY_GEN_RECORD_STRIDE, SHADER_RECORD_ALIGNMENT,
    SHADER_TABLE_ALIGNMENT, ShaderTableInitializer, ShaderTableLayout, ShaderTableRegion,
};
pub use record_cache::{MAX_RECORD_CACHE_UNIFORM_BUFFERS, ShaderRecordCache, ShaderRecordCacheKey};
pub use system_parameters::{
    HIT_GROUP_SYSTEM_PARAMETERS_SIZE, HIT_GROUP_USER_DATA_OFFSET, HitGroupSystemParameters,
    HitGroupSystemRootConstants,
};

use std::sync::Arc;

use bytemuck::Pod;
use rustc_hash::FxHashSet;

use crate::backend::{
    BufferDesc, BufferUsage, GpuAddress, GpuBuffer, RayTracingBackend, ResourceId,
};
use crate::command::{
    CommandList, DispatchRaysDesc, GpuAddressRange, GpuAddressRangeAndStride,
};
use crate::descriptor::{DescriptorCache, DescriptorHeapSet, DescriptorTableCache};
use crate::errors::Result;
use crate::identifier::{SHADER_IDENTIFIER_SIZE, ShaderIdentifier};

const ID_SIZE: u32 = SHADER_IDENTIFIER_SIZE as u32;

/// Whether a table with this shape binds local resources and therefore needs
/// its own descriptor heaps.
#[must_use]
pub fn needs_descriptor_cache(init: &ShaderTableInitializer) -> bool {
    (init.num_hit_records + init.num_callable_records) * init.local_root_data_size != 0
}

/// What parallel binding workers get to see of a table.
///
/// Record bytes are read-only; workers stage their writes and the owning
/// thread applies them afterwards.
pub(crate) struct BindingTargets<'a> {
    pub layout: &'a ShaderTableLayout,
    pub data: &'a [u8],
    pub heaps: Option<&'a DescriptorHeapSet>,
    pub descriptor_workers: &'a mut [DescriptorTableCache],
    pub record_caches: &'a mut [ShaderRecordCache],
}

/// CPU arena plus GPU copy of one shader binding table.
#[derive(Debug)]
pub struct ShaderTable {
    layout: ShaderTableLayout,
    gpu_index: u32,
    data: Vec<u8>,
    dirty: bool,
    buffer: Option<Arc<GpuBuffer>>,
    backend: Arc<dyn RayTracingBackend>,
    descriptor_cache: Option<DescriptorCache>,
    record_caches: Vec<ShaderRecordCache>,
    residency: FxHashSet<ResourceId>,
    transient_buffers: Vec<Arc<GpuBuffer>>,
    max_view_descriptors_per_record: u32,
}

impl ShaderTable {
    /// Lays out the table and zero-fills every record (all identifiers NULL).
    pub fn new(
        backend: &Arc<dyn RayTracingBackend>,
        init: &ShaderTableInitializer,
        gpu_index: u32,
        descriptor_cache: Option<DescriptorCache>,
    ) -> Result<Self> {
        let layout = ShaderTableLayout::new(init)?;
        log::trace!(
            "Shader table: {} ray gen, {} hit, {} callable, {} miss records, {} bytes",
            init.num_ray_gen_records,
            init.num_hit_records,
            init.num_callable_records,
            init.num_miss_records,
            layout.total_size
        );
        Ok(Self {
            layout,
            gpu_index,
            data: vec![0; layout.total_size as usize],
            dirty: true,
            buffer: None,
            backend: Arc::clone(backend),
            descriptor_cache,
            record_caches: vec![ShaderRecordCache::default()],
            residency: FxHashSet::default(),
            transient_buffers: Vec::new(),
            max_view_descriptors_per_record: init.max_view_descriptors_per_record,
        })
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> &ShaderTableLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub fn gpu_index(&self) -> u32 {
        self.gpu_index
    }

    #[inline]
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    #[must_use]
    pub fn max_view_descriptors_per_record(&self) -> u32 {
        self.max_view_descriptors_per_record
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) {
        let offset = offset as usize;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.dirty = true;
    }

    fn read_identifier(&self, offset: u32) -> ShaderIdentifier {
        let offset = offset as usize;
        let mut bytes = [0u8; SHADER_IDENTIFIER_SIZE];
        bytes.copy_from_slice(&self.data[offset..offset + SHADER_IDENTIFIER_SIZE]);
        ShaderIdentifier(bytes)
    }

    // --- Identifier-only records ---

    pub fn set_ray_gen_identifier(&mut self, index: u32, identifier: &ShaderIdentifier) {
        let offset = self.layout.ray_gen.record_offset(index);
        self.write(offset, identifier.as_bytes());
    }

    pub fn set_default_hit_group_identifier(&mut self, identifier: &ShaderIdentifier) {
        let offset = self.layout.default_hit_group.offset;
        self.write(offset, identifier.as_bytes());
    }

    /// Writes the identifier of miss record `index` (arguments untouched).
    pub fn set_miss_identifier(&mut self, index: u32, identifier: &ShaderIdentifier) {
        let offset = self.layout.miss.record_offset(index);
        self.write(offset, identifier.as_bytes());
    }

    pub fn set_ray_gen_identifiers(&mut self, identifiers: &[ShaderIdentifier]) {
        assert_eq!(identifiers.len(), self.layout.ray_gen.count as usize);
        for (index, identifier) in identifiers.iter().enumerate() {
            self.set_ray_gen_identifier(index as u32, identifier);
        }
    }

    pub fn set_miss_identifiers(&mut self, identifiers: &[ShaderIdentifier]) {
        assert_eq!(identifiers.len(), self.layout.miss.count as usize);
        for (index, identifier) in identifiers.iter().enumerate() {
            self.set_miss_identifier(index as u32, identifier);
        }
    }

    #[must_use]
    pub fn ray_gen_identifier(&self, index: u32) -> ShaderIdentifier {
        self.read_identifier(self.layout.ray_gen.record_offset(index))
    }

    #[must_use]
    pub fn default_hit_group_identifier(&self) -> ShaderIdentifier {
        self.read_identifier(self.layout.default_hit_group.offset)
    }

    #[must_use]
    pub fn miss_identifier(&self, index: u32) -> ShaderIdentifier {
        self.read_identifier(self.layout.miss.record_offset(index))
    }

    // --- Local records ---

    /// Writes the identifier of local record `record_index`.
    pub fn set_local_shader_identifier(&mut self, record_index: u32, identifier: &ShaderIdentifier) {
        let offset = self.layout.local_record_offset(record_index);
        self.write(offset, identifier.as_bytes());
    }

    /// Writes `data` into the local arguments of a record, `offset` bytes
    /// past the identifier.
    ///
    /// # Panics
    ///
    /// When the write is not DWORD aligned or runs past the record's
    /// declared local data.
    pub fn set_local_shader_parameters(&mut self, record_index: u32, offset: u32, data: &[u8]) {
        let size = data.len() as u32;
        assert!(offset % 4 == 0, "shader record parameters must be DWORD aligned");
        assert!(size % 4 == 0, "shader record parameter size must be a multiple of 4");
        assert!(
            ID_SIZE + offset + size <= self.layout.local_record_size_unaligned,
            "shader record write out of bounds: {} bytes at offset {offset}, record holds {}",
            size,
            self.layout.local_root_data_size
        );
        let base = self.layout.local_record_offset(record_index);
        self.write(base + ID_SIZE + offset, data);
    }

    /// Typed variant of [`set_local_shader_parameters`](Self::set_local_shader_parameters).
    pub fn set_local_shader_parameter<T: Pod>(&mut self, record_index: u32, offset: u32, value: &T) {
        self.set_local_shader_parameters(record_index, offset, bytemuck::bytes_of(value));
    }

    /// Copies local arguments from `offset` to the end of the record.
    pub fn copy_local_shader_parameters(&mut self, dest_record: u32, source_record: u32, offset: u32) {
        assert!(offset <= self.layout.local_root_data_size);
        let len = (self.layout.local_root_data_size - offset) as usize;
        let source = (self.layout.local_record_offset(source_record) + ID_SIZE + offset) as usize;
        let dest = (self.layout.local_record_offset(dest_record) + ID_SIZE + offset) as usize;
        self.data.copy_within(source..source + len, dest);
        self.dirty = true;
    }

    /// Replaces a whole local record (identifier plus arguments).
    pub fn write_local_record(&mut self, record_index: u32, bytes: &[u8]) {
        assert!(
            bytes.len() as u32 <= self.layout.local_record_size_unaligned,
            "local record of {} bytes exceeds {}",
            bytes.len(),
            self.layout.local_record_size_unaligned
        );
        let offset = self.layout.local_record_offset(record_index);
        self.write(offset, bytes);
    }

    /// Identifier and local arguments of a record (without stride padding).
    #[must_use]
    pub fn local_record(&self, record_index: u32) -> &[u8] {
        let offset = self.layout.local_record_offset(record_index) as usize;
        &self.data[offset..offset + self.layout.local_record_size_unaligned as usize]
    }

    #[must_use]
    pub fn local_shader_identifier(&self, record_index: u32) -> ShaderIdentifier {
        self.read_identifier(self.layout.local_record_offset(record_index))
    }

    // --- Upload ---

    /// Uploads the arena into a fresh GPU buffer and clears the dirty flag.
    ///
    /// The previous buffer is released; the backend keeps it alive until
    /// in-flight dispatches that read it have completed.
    pub fn copy_to_gpu(&mut self) -> Result<()> {
        let buffer = GpuBuffer::new(
            &self.backend,
            &BufferDesc {
                size: self.data.len() as u64,
                usage: BufferUsage::ShaderTable,
                gpu_index: self.gpu_index,
                label: "shader binding table",
            },
        )?;
        buffer.write(0, &self.data);
        self.buffer = Some(Arc::new(buffer));
        self.dirty = false;
        Ok(())
    }

    /// GPU address of the uploaded table.
    ///
    /// # Panics
    ///
    /// When a record was written since the last [`copy_to_gpu`](Self::copy_to_gpu).
    #[must_use]
    pub fn shader_table_address(&self) -> GpuAddress {
        assert!(
            !self.dirty,
            "shader table update is pending; call copy_to_gpu() before taking its GPU address"
        );
        self.buffer
            .as_ref()
            .map(|buffer| buffer.address())
            .unwrap_or_else(|| panic!("shader table was never uploaded"))
    }

    /// Record ranges for a dispatch using ray gen record `ray_gen_index` and
    /// miss records from `miss_base_index` on.
    ///
    /// Without hit group indexing every hit resolves to the default hit group.
    #[must_use]
    pub fn dispatch_rays_desc(
        &self,
        ray_gen_index: u32,
        miss_base_index: u32,
        allow_hit_group_indexing: bool,
        width: u32,
        height: u32,
    ) -> DispatchRaysDesc {
        let base = self.shader_table_address();
        let layout = &self.layout;
        let stride = u64::from(layout.local_record_stride());

        let ray_generation = GpuAddressRange {
            start: base + u64::from(layout.ray_gen.record_offset(ray_gen_index)),
            size: u64::from(RAY_GEN_RECORD_STRIDE),
        };

        let miss_start = base
            + u64::from(layout.miss.offset)
            + u64::from(miss_base_index) * stride;
        assert!(
            miss_start % u64::from(SHADER_TABLE_ALIGNMENT) == 0,
            "miss table start {miss_start:#x} is not {SHADER_TABLE_ALIGNMENT}-byte aligned"
        );
        let miss = GpuAddressRangeAndStride {
            start: miss_start,
            size: u64::from(layout.miss.count.saturating_sub(miss_base_index)) * stride,
            stride,
        };

        let hit_group = if allow_hit_group_indexing {
            GpuAddressRangeAndStride {
                start: base + u64::from(layout.hit_group.offset),
                size: u64::from(layout.hit_group.size()),
                stride,
            }
        } else {
            // Zero stride pins every hit to the single default record.
            GpuAddressRangeAndStride {
                start: base + u64::from(layout.default_hit_group.offset),
                size: u64::from(SHADER_TABLE_ALIGNMENT),
                stride: 0,
            }
        };

        let callable = if layout.callable.count > 0 {
            GpuAddressRangeAndStride {
                start: base + u64::from(layout.callable.offset),
                size: u64::from(layout.callable.size()),
                stride,
            }
        } else {
            GpuAddressRangeAndStride::default()
        };

        DispatchRaysDesc {
            ray_generation,
            miss,
            hit_group,
            callable,
            width,
            height,
            depth: 1,
        }
    }

    // --- Bindings ---

    #[inline]
    #[must_use]
    pub fn descriptor_cache(&self) -> Option<&DescriptorCache> {
        self.descriptor_cache.as_ref()
    }

    #[inline]
    pub fn descriptor_cache_mut(&mut self) -> Option<&mut DescriptorCache> {
        self.descriptor_cache.as_mut()
    }

    #[must_use]
    pub fn record_caches(&self) -> &[ShaderRecordCache] {
        &self.record_caches
    }

    /// Hands out disjoint per-worker state for `num_workers` binding workers.
    pub(crate) fn binding_targets(&mut self, num_workers: usize) -> BindingTargets<'_> {
        if self.record_caches.len() < num_workers {
            self.record_caches.resize_with(num_workers, ShaderRecordCache::default);
        }
        let (heaps, descriptor_workers) = match self.descriptor_cache.as_mut() {
            Some(cache) => {
                cache.ensure_workers(num_workers);
                let (heaps, workers) = cache.split_workers();
                (Some(heaps), workers)
            }
            None => (None, Default::default()),
        };
        BindingTargets {
            layout: &self.layout,
            data: &self.data,
            heaps,
            descriptor_workers,
            record_caches: &mut self.record_caches,
        }
    }

    /// Keeps `resource` resident whenever this table is dispatched.
    pub fn add_resource_reference(&mut self, resource: ResourceId) {
        self.residency.insert(resource);
    }

    pub fn extend_resource_references(&mut self, resources: impl IntoIterator<Item = ResourceId>) {
        self.residency.extend(resources);
    }

    #[must_use]
    pub fn residency(&self) -> &FxHashSet<ResourceId> {
        &self.residency
    }

    /// Keeps a loose-parameter constant buffer alive as long as the table.
    pub fn retain_transient_buffer(&mut self, buffer: Arc<GpuBuffer>) {
        self.residency.insert(buffer.resource_id());
        self.transient_buffers.push(buffer);
    }

    #[must_use]
    pub fn transient_buffer_count(&self) -> usize {
        self.transient_buffers.len()
    }

    /// Adds everything the table references to `commands`' residency set,
    /// keeps its buffers alive until `commands` completes and tags its
    /// descriptor heaps with the fence that will read them.
    pub fn update_residency(&self, commands: &mut CommandList, fence_value: u64) {
        commands.extend_residency(self.residency.iter().copied());
        if let Some(buffer) = &self.buffer {
            commands.retain_buffer(Arc::clone(buffer));
        }
        for buffer in &self.transient_buffers {
            commands.retain_buffer(Arc::clone(buffer));
        }
        if let Some(cache) = &self.descriptor_cache {
            cache.heaps().update_sync_point(fence_value);
        }
    }
}
