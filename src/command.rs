//! Recorded GPU commands
//!
//! [`CommandList`] is the only thing the ray tracing layer hands to the
//! backend for execution. Besides the commands themselves it carries the set
//! of resources the GPU will touch, so the backend can make them resident.
//!
//! Buffers replaced or released while a command still refers to them are
//! handed to the list with [`retain_buffer`](CommandList::retain_buffer). The
//! backend drops them only once the submission has completed.
//!
//! State-setting commands are filtered the way a tracked render pass filters
//! pipeline and bind group changes: setting the same root signature, pipeline
//! or descriptor heaps twice in a row records nothing.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::accel::AccelerationStructureBuild;
use crate::backend::{
    BufferHandle, DescriptorHeapHandle, GpuAddress, GpuBuffer, GpuDescriptorHandle, ResourceId,
    StateObjectHandle,
};
use crate::shader::RootSignatureId;

/// A GPU address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuAddressRange {
    pub start: GpuAddress,
    pub size: u64,
}

/// A GPU address range split into fixed-stride records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuAddressRangeAndStride {
    pub start: GpuAddress,
    pub size: u64,
    pub stride: u64,
}

/// Shader table ranges and grid size of one ray dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchRaysDesc {
    pub ray_generation: GpuAddressRange,
    pub miss: GpuAddressRangeAndStride,
    pub hit_group: GpuAddressRangeAndStride,
    pub callable: GpuAddressRangeAndStride,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Source of per-instance transforms written by a GPU pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceTransformCopy {
    /// Start of the transform source (3x4 row-major float matrices).
    pub source: GpuAddress,
    /// Instance description array being patched.
    pub dest: GpuAddress,
    pub first_instance: u32,
    pub num_instances: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    /// Orders all prior UAV writes (acceleration structure builds included)
    /// before anything that follows.
    UavBarrier,
    BuildAccelerationStructure(Box<AccelerationStructureBuild>),
    /// Writes the compacted size (`u64`) of `source` into a readback buffer.
    EmitCompactedSize {
        source: GpuAddress,
        dest: BufferHandle,
        offset: u64,
    },
    CompactAccelerationStructure {
        dest: GpuAddress,
        source: GpuAddress,
    },
    CopyInstanceTransforms(InstanceTransformCopy),
    SetRootSignature(RootSignatureId),
    SetDescriptorHeaps {
        view: DescriptorHeapHandle,
        sampler: DescriptorHeapHandle,
    },
    SetRootDescriptorTable {
        slot: u32,
        table: GpuDescriptorHandle,
    },
    SetRootConstantBuffer {
        slot: u32,
        address: GpuAddress,
    },
    SetRootShaderResource {
        slot: u32,
        address: GpuAddress,
    },
    SetPipelineState(StateObjectHandle),
    DispatchRays(DispatchRaysDesc),
}

/// Commands and residency for one submission to one GPU.
#[derive(Debug, Default)]
pub struct CommandList {
    gpu_index: u32,
    commands: Vec<GpuCommand>,
    residency: FxHashSet<ResourceId>,
    retained: Vec<Arc<GpuBuffer>>,

    bound_root_signature: Option<RootSignatureId>,
    bound_pipeline: Option<StateObjectHandle>,
    bound_heaps: Option<(DescriptorHeapHandle, DescriptorHeapHandle)>,
}

impl CommandList {
    #[must_use]
    pub fn new(gpu_index: u32) -> Self {
        Self {
            gpu_index,
            ..Default::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn gpu_index(&self) -> u32 {
        self.gpu_index
    }

    #[inline]
    #[must_use]
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    #[inline]
    #[must_use]
    pub fn residency(&self) -> &FxHashSet<ResourceId> {
        &self.residency
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: GpuCommand) {
        self.commands.push(command);
    }

    /// Marks a resource as referenced by this submission.
    #[inline]
    pub fn update_residency(&mut self, resource: ResourceId) {
        self.residency.insert(resource);
    }

    pub fn extend_residency(&mut self, resources: impl IntoIterator<Item = ResourceId>) {
        self.residency.extend(resources);
    }

    /// Keeps `buffer` alive until the submission carrying this list has
    /// completed. The buffer also becomes resident.
    pub fn retain_buffer(&mut self, buffer: impl Into<Arc<GpuBuffer>>) {
        let buffer = buffer.into();
        self.residency.insert(buffer.resource_id());
        self.retained.push(buffer);
    }

    #[must_use]
    pub fn retained_buffer_count(&self) -> usize {
        self.retained.len()
    }

    /// Hands the retained buffers over to whoever tracks the submission.
    #[must_use]
    pub fn take_retained_buffers(&mut self) -> Vec<Arc<GpuBuffer>> {
        std::mem::take(&mut self.retained)
    }

    pub fn uav_barrier(&mut self) {
        self.commands.push(GpuCommand::UavBarrier);
    }

    pub fn build_acceleration_structure(&mut self, build: AccelerationStructureBuild) {
        self.commands
            .push(GpuCommand::BuildAccelerationStructure(Box::new(build)));
    }

    pub fn set_root_signature(&mut self, id: RootSignatureId) {
        if self.bound_root_signature != Some(id) {
            self.commands.push(GpuCommand::SetRootSignature(id));
            self.bound_root_signature = Some(id);
        }
    }

    pub fn set_pipeline_state(&mut self, state_object: StateObjectHandle) {
        if self.bound_pipeline != Some(state_object) {
            self.commands.push(GpuCommand::SetPipelineState(state_object));
            self.bound_pipeline = Some(state_object);
        }
    }

    /// Binds shader-visible heaps, returning the previously bound pair.
    pub fn set_descriptor_heaps(
        &mut self,
        view: DescriptorHeapHandle,
        sampler: DescriptorHeapHandle,
    ) -> Option<(DescriptorHeapHandle, DescriptorHeapHandle)> {
        let previous = self.bound_heaps;
        if previous != Some((view, sampler)) {
            self.commands
                .push(GpuCommand::SetDescriptorHeaps { view, sampler });
            self.bound_heaps = Some((view, sampler));
        }
        previous
    }

    pub fn dispatch_rays(&mut self, desc: DispatchRaysDesc) {
        self.commands.push(GpuCommand::DispatchRays(desc));
    }

    /// Number of recorded dispatches.
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, GpuCommand::DispatchRays(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redundant_state_is_filtered() {
        let mut list = CommandList::new(0);
        list.set_root_signature(RootSignatureId(7));
        list.set_root_signature(RootSignatureId(7));
        list.set_pipeline_state(StateObjectHandle(1));
        list.set_pipeline_state(StateObjectHandle(1));
        list.set_pipeline_state(StateObjectHandle(2));
        assert_eq!(list.commands().len(), 3);
    }

    #[test]
    fn descriptor_heaps_return_previous_binding() {
        let mut list = CommandList::new(0);
        let a = (DescriptorHeapHandle(1), DescriptorHeapHandle(2));
        let b = (DescriptorHeapHandle(3), DescriptorHeapHandle(4));

        assert_eq!(list.set_descriptor_heaps(a.0, a.1), None);
        assert_eq!(list.set_descriptor_heaps(a.0, a.1), Some(a));
        assert_eq!(list.set_descriptor_heaps(b.0, b.1), Some(a));
        assert_eq!(list.commands().len(), 2);
    }

    #[test]
    fn residency_is_deduplicated() {
        let mut list = CommandList::new(0);
        list.update_residency(ResourceId(5));
        list.extend_residency([ResourceId(5), ResourceId(6)]);
        assert_eq!(list.residency().len(), 2);
    }
}
