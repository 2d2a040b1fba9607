//! Shader resource resolution.
//!
//! [`set_shader_resources`] turns a [`ShaderBindings`] set into descriptor
//! tables and root arguments for one shader. Where those arguments land is
//! up to the [`ResourceBinder`]:
//!
//! - [`GlobalResourceBinder`] records root-parameter commands for the ray
//!   generation shader of a dispatch.
//! - [`LocalResourceBinder`] writes into the local arguments of a staged
//!   shader record.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::backend::{
    BufferDesc, BufferUsage, CpuDescriptor, GpuAddress, GpuBuffer, GpuDescriptorHandle,
    DescriptorHeapType, RayTracingBackend, ResourceId,
};
use crate::command::{CommandList, GpuCommand};
use crate::descriptor::{DescriptorHeapSet, DescriptorTableCache};
use crate::errors::Result;
use crate::identifier::SHADER_IDENTIFIER_SIZE;
use crate::shader::{
    DescriptorRangeType, MAX_CBS, MAX_SAMPLERS, MAX_SRVS, MAX_UAVS, RayTracingShader, RootSignature,
};
use crate::stats::{self, RayTracingStats};

/// A shader-visible view and the resource behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundView {
    pub descriptor: CpuDescriptor,
    pub resource: ResourceId,
}

/// A constant buffer plus the views and samplers of its resource table.
///
/// Binding a uniform buffer also binds every entry of its table at the
/// entry's slot. The buffer's `resource` identifies the whole table.
#[derive(Debug, Clone, Default)]
pub struct UniformBuffer {
    pub resource: ResourceId,
    pub address: GpuAddress,
    pub srvs: Vec<(u32, BoundView)>,
    pub uavs: Vec<(u32, BoundView)>,
    pub samplers: Vec<(u32, CpuDescriptor)>,
}

impl UniformBuffer {
    /// A constant buffer without a resource table.
    #[must_use]
    pub fn new(resource: ResourceId, address: GpuAddress) -> Self {
        Self {
            resource,
            address,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_srv(mut self, slot: u32, view: BoundView) -> Self {
        self.srvs.push((slot, view));
        self
    }

    #[must_use]
    pub fn with_uav(mut self, slot: u32, view: BoundView) -> Self {
        self.uavs.push((slot, view));
        self
    }

    #[must_use]
    pub fn with_sampler(mut self, slot: u32, sampler: CpuDescriptor) -> Self {
        self.samplers.push((slot, sampler));
        self
    }
}

/// Resources bound to one shader, by slot.
#[derive(Debug, Clone, Default)]
pub struct ShaderBindings {
    pub srvs: Vec<Option<BoundView>>,
    pub uavs: Vec<Option<BoundView>>,
    pub samplers: Vec<Option<CpuDescriptor>>,
    pub uniform_buffers: Vec<Option<Arc<UniformBuffer>>>,
    /// Raw constants uploaded into a transient constant buffer (local
    /// shaders only).
    pub loose_parameters: Vec<u8>,
}

fn put<T>(slots: &mut Vec<Option<T>>, slot: u32, value: T) {
    let slot = slot as usize;
    if slots.len() <= slot {
        slots.resize_with(slot + 1, || None);
    }
    slots[slot] = Some(value);
}

impl ShaderBindings {
    pub fn set_srv(&mut self, slot: u32, view: BoundView) -> &mut Self {
        put(&mut self.srvs, slot, view);
        self
    }

    pub fn set_uav(&mut self, slot: u32, view: BoundView) -> &mut Self {
        put(&mut self.uavs, slot, view);
        self
    }

    pub fn set_sampler(&mut self, slot: u32, sampler: CpuDescriptor) -> &mut Self {
        put(&mut self.samplers, slot, sampler);
        self
    }

    pub fn set_uniform_buffer(&mut self, slot: u32, buffer: Arc<UniformBuffer>) -> &mut Self {
        put(&mut self.uniform_buffers, slot, buffer);
        self
    }

    /// Identities of the bound uniform buffers, in slot order.
    ///
    /// `None` when a slot is empty.
    #[must_use]
    pub fn uniform_buffer_identities(&self) -> Option<SmallVec<[ResourceId; 4]>> {
        self.uniform_buffers
            .iter()
            .map(|buffer| buffer.as_ref().map(|b| b.resource))
            .collect()
    }

    /// Whether everything bound comes through uniform buffers, so that the
    /// buffer identities fully describe the binding.
    #[must_use]
    pub fn is_uniform_buffer_only(&self) -> bool {
        self.loose_parameters.is_empty()
            && self.srvs.iter().all(Option::is_none)
            && self.uavs.iter().all(Option::is_none)
            && self.samplers.iter().all(Option::is_none)
    }
}

/// Destination of resolved root arguments.
pub(crate) trait ResourceBinder {
    fn set_root_descriptor_table(&mut self, slot: u32, table: GpuDescriptorHandle);

    fn set_root_cbv(&mut self, slot: u32, address: GpuAddress);

    /// Uploads loose parameters and returns the buffer address.
    fn create_transient_constant_buffer(&mut self, data: &[u8]) -> Result<GpuAddress>;

    fn add_resource_reference(&mut self, resource: ResourceId);
}

/// Records global root arguments into a command list.
pub(crate) struct GlobalResourceBinder<'a> {
    pub commands: &'a mut CommandList,
}

impl ResourceBinder for GlobalResourceBinder<'_> {
    fn set_root_descriptor_table(&mut self, slot: u32, table: GpuDescriptorHandle) {
        self.commands
            .push(GpuCommand::SetRootDescriptorTable { slot, table });
    }

    fn set_root_cbv(&mut self, slot: u32, address: GpuAddress) {
        self.commands
            .push(GpuCommand::SetRootConstantBuffer { slot, address });
    }

    fn create_transient_constant_buffer(&mut self, _data: &[u8]) -> Result<GpuAddress> {
        panic!("loose parameters are not supported for global ray tracing shaders");
    }

    fn add_resource_reference(&mut self, resource: ResourceId) {
        self.commands.update_residency(resource);
    }
}

/// Writes local root arguments into a staged record.
///
/// `record` holds the shader identifier followed by the local arguments.
pub(crate) struct LocalResourceBinder<'a> {
    pub backend: &'a Arc<dyn RayTracingBackend>,
    pub gpu_index: u32,
    pub root_signature: &'a RootSignature,
    pub record: &'a mut [u8],
    pub residency: &'a mut Vec<ResourceId>,
    pub transient_buffers: &'a mut Vec<Arc<GpuBuffer>>,
}

impl LocalResourceBinder<'_> {
    fn write(&mut self, offset: u32, bytes: &[u8]) {
        let start = SHADER_IDENTIFIER_SIZE + offset as usize;
        assert!(
            start + bytes.len() <= self.record.len(),
            "local root argument at offset {offset} runs past the {}-byte record",
            self.record.len()
        );
        self.record[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl ResourceBinder for LocalResourceBinder<'_> {
    fn set_root_descriptor_table(&mut self, slot: u32, table: GpuDescriptorHandle) {
        let offset = self.root_signature.bind_slot_offset(slot);
        self.write(offset, &table.0.to_le_bytes());
    }

    fn set_root_cbv(&mut self, slot: u32, address: GpuAddress) {
        let offset = self.root_signature.bind_slot_offset(slot);
        self.write(offset, &address.to_le_bytes());
    }

    fn create_transient_constant_buffer(&mut self, data: &[u8]) -> Result<GpuAddress> {
        let buffer = GpuBuffer::new(
            self.backend,
            &BufferDesc {
                size: data.len() as u64,
                usage: BufferUsage::Constants,
                gpu_index: self.gpu_index,
                label: "ray tracing loose parameters",
            },
        )?;
        buffer.write(0, data);
        let address = buffer.address();
        self.transient_buffers.push(Arc::new(buffer));
        Ok(address)
    }

    fn add_resource_reference(&mut self, resource: ResourceId) {
        self.residency.push(resource);
    }
}

/// Where a binding's descriptor tables are allocated.
pub(crate) struct DescriptorTarget<'a> {
    pub heaps: &'a DescriptorHeapSet,
    pub cache: &'a mut DescriptorTableCache,
}

/// All bits `[0, count)` are set in `mask`.
fn is_complete(count: u32, mask: u64) -> bool {
    if count > 64 {
        return false;
    }
    let expected = if count == 64 { u64::MAX } else { (1u64 << count) - 1 };
    mask & expected == expected
}

/// Resolves `bindings` for `shader` and hands the results to `binder`.
///
/// Returns `Ok(false)` when a descriptor table could not be allocated; the
/// binding is dropped and the heap budget has already logged the overflow.
///
/// # Panics
///
/// When the bindings leave a resource the shader declares unbound.
pub(crate) fn set_shader_resources(
    shader: &RayTracingShader,
    bindings: &ShaderBindings,
    descriptors: DescriptorTarget<'_>,
    binder: &mut impl ResourceBinder,
    stats: &RayTracingStats,
) -> Result<bool> {
    let counts = shader.resource_counts();
    let root_signature = shader.root_signature();

    let mut srvs = [CpuDescriptor::default(); MAX_SRVS as usize];
    let mut uavs = [CpuDescriptor::default(); MAX_UAVS as usize];
    let mut samplers = [CpuDescriptor::default(); MAX_SAMPLERS as usize];
    let mut cbvs = [0 as GpuAddress; MAX_CBS as usize];
    let (mut srv_mask, mut uav_mask, mut sampler_mask, mut cbv_mask) = (0u64, 0u64, 0u64, 0u64);
    let mut referenced: SmallVec<[ResourceId; 16]> = SmallVec::new();

    for (slot, view) in bindings.srvs.iter().enumerate().take(MAX_SRVS as usize) {
        if let Some(view) = view {
            srvs[slot] = view.descriptor;
            srv_mask |= 1 << slot;
            referenced.push(view.resource);
        }
    }
    for (slot, view) in bindings.uavs.iter().enumerate().take(MAX_UAVS as usize) {
        if let Some(view) = view {
            uavs[slot] = view.descriptor;
            uav_mask |= 1 << slot;
            referenced.push(view.resource);
        }
    }
    for (slot, sampler) in bindings.samplers.iter().enumerate().take(MAX_SAMPLERS as usize) {
        if let Some(sampler) = sampler {
            samplers[slot] = *sampler;
            sampler_mask |= 1 << slot;
        }
    }
    for (slot, buffer) in bindings.uniform_buffers.iter().enumerate().take(MAX_CBS as usize) {
        let Some(buffer) = buffer else { continue };
        cbvs[slot] = buffer.address;
        cbv_mask |= 1 << slot;
        referenced.push(buffer.resource);

        // Resource table entries.
        for &(bind, view) in &buffer.srvs {
            srvs[bind as usize] = view.descriptor;
            srv_mask |= 1 << bind;
            referenced.push(view.resource);
        }
        for &(bind, view) in &buffer.uavs {
            uavs[bind as usize] = view.descriptor;
            uav_mask |= 1 << bind;
            referenced.push(view.resource);
        }
        for &(bind, sampler) in &buffer.samplers {
            samplers[bind as usize] = sampler;
            sampler_mask |= 1 << bind;
        }
    }

    if let Some(index) = shader.loose_parameter_index() {
        assert!(
            !bindings.loose_parameters.is_empty(),
            "shader '{}' reads loose parameters but none were provided",
            shader.name()
        );
        cbvs[index as usize] = binder.create_transient_constant_buffer(&bindings.loose_parameters)?;
        cbv_mask |= 1 << index;
    }

    assert!(is_complete(counts.num_srvs, srv_mask), "shader '{}' has unbound SRVs", shader.name());
    assert!(is_complete(counts.num_uavs, uav_mask), "shader '{}' has unbound UAVs", shader.name());
    assert!(is_complete(counts.num_cbs, cbv_mask), "shader '{}' has unbound constant buffers", shader.name());
    assert!(
        is_complete(counts.num_samplers, sampler_mask),
        "shader '{}' has unbound samplers",
        shader.name()
    );

    stats::add(&stats.resource_binding_resolutions, 1);
    let DescriptorTarget { heaps, cache } = descriptors;

    let tables = [
        (DescriptorRangeType::Srv, DescriptorHeapType::View, &srvs[..counts.num_srvs as usize]),
        (DescriptorRangeType::Uav, DescriptorHeapType::View, &uavs[..counts.num_uavs as usize]),
        (
            DescriptorRangeType::Sampler,
            DescriptorHeapType::Sampler,
            &samplers[..counts.num_samplers as usize],
        ),
    ];
    for (range, heap_type, descriptors) in tables {
        if descriptors.is_empty() {
            continue;
        }
        let Some(base) = cache.allocate(heaps, descriptors, heap_type) else {
            log::warn!(
                "Dropped {range:?} binding of ray tracing shader '{}': descriptor heap is full",
                shader.name()
            );
            return Ok(false);
        };

        let Some(slot) = root_signature.table_slot(range) else {
            panic!("root signature of '{}' has no {range:?} table", shader.name());
        };
        binder.set_root_descriptor_table(slot, heaps.table_handle(heap_type, base));
    }

    for index in 0..counts.num_cbs {
        let Some(slot) = root_signature.cbv_slot(index) else {
            panic!("root signature of '{}' has no constant buffer {index}", shader.name());
        };
        binder.set_root_cbv(slot, cbvs[index as usize]);
    }

    for resource in referenced {
        binder.add_resource_reference(resource);
    }
    Ok(true)
}
