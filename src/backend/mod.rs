//! Backend Abstraction
//!
//! The ray tracing layer never talks to a graphics API directly. Everything
//! that needs the driver goes through [`RayTracingBackend`], a trait object
//! chosen once when the [`RayTracingDevice`](crate::RayTracingDevice) is
//! created.
//!
//! # Handles
//!
//! Backend objects are referred to by small typed ids ([`BufferHandle`],
//! [`DescriptorHeapHandle`], [`StateObjectHandle`]). The layer above only
//! stores and forwards them, so there is no need to downcast a generic
//! resource to a concrete backend type.
//!
//! Objects with a destructor on the backend side are wrapped in RAII owners
//! ([`GpuBuffer`], [`StateObject`]). Dropping them hands the handle back;
//! backends must keep the memory alive until in-flight submissions that may
//! reference it have completed.
//!
//! ```text
//! RayTracingDevice ──► Arc<dyn RayTracingBackend>
//!                            │
//!          ┌─────────────────┼────────────────────┐
//!          ▼                 ▼                    ▼
//!     GpuBuffer         StateObject       DescriptorHeapHandle
//!   (SBT, BLAS, TLAS)  (collections,      (pooled by DescriptorHeapPool)
//!                       pipelines)
//! ```

mod null;

pub use null::NullBackend;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::{Pod, Zeroable};

use crate::accel::{AccelerationStructureInputs, PrebuildInfo};
use crate::command::CommandList;
use crate::errors::{RayTracingError, Result};
use crate::identifier::ShaderIdentifier;
use crate::shader::RootSignature;

/// Virtual address of GPU memory.
pub type GpuAddress = u64;

// ─── Identity ────────────────────────────────────────────────────────────────

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a GPU resource, used for residency tracking
/// and as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// Allocates a fresh id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

macro_rules! backend_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

backend_handle!(
    /// Backend buffer.
    BufferHandle
);
backend_handle!(
    /// Backend shader-visible descriptor heap.
    DescriptorHeapHandle
);
backend_handle!(
    /// Backend state object: a single-shader collection or a linked pipeline.
    StateObjectHandle
);

/// CPU-side descriptor as produced by the resource layer. Copied verbatim
/// into shader-visible heaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(transparent)]
pub struct CpuDescriptor(pub u64);

/// GPU-visible descriptor handle (start of a descriptor table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GpuDescriptorHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapType {
    /// CBV / SRV / UAV descriptors.
    View,
    Sampler,
}

// ─── Buffers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsage {
    /// CPU-written, GPU-read shader binding table.
    ShaderTable,
    /// Acceleration structure storage.
    AccelerationStructure,
    /// Scratch memory for acceleration structure builds.
    Scratch,
    /// CPU-written TLAS instance descriptions.
    InstanceUpload,
    /// GPU-written, CPU-read results.
    Readback,
    /// CPU-written constants (loose shader parameters).
    Constants,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub gpu_index: u32,
    pub label: &'static str,
}

/// A GPU buffer owned by the ray tracing layer. Released on drop.
pub struct GpuBuffer {
    handle: BufferHandle,
    address: GpuAddress,
    size: u64,
    usage: BufferUsage,
    resource_id: ResourceId,
    backend: Arc<dyn RayTracingBackend>,
}

impl GpuBuffer {
    pub fn new(backend: &Arc<dyn RayTracingBackend>, desc: &BufferDesc) -> Result<Self> {
        let (handle, address) = backend.create_buffer(desc)?;
        Ok(Self {
            handle,
            address,
            size: desc.size,
            usage: desc.usage,
            resource_id: ResourceId::next(),
            backend: Arc::clone(backend),
        })
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn address(&self) -> GpuAddress {
        self.address
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    #[inline]
    #[must_use]
    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    /// Copies `data` into the buffer at `offset` (CPU-visible buffers only).
    pub fn write(&self, offset: u64, data: &[u8]) {
        debug_assert!(offset + data.len() as u64 <= self.size);
        self.backend.write_buffer(self.handle, offset, data);
    }

    /// Reads back `out.len()` bytes from `offset`.
    pub fn read(&self, offset: u64, out: &mut [u8]) {
        debug_assert!(offset + out.len() as u64 <= self.size);
        self.backend.read_buffer(self.handle, offset, out);
    }

    /// A non-owning view of the whole buffer.
    #[must_use]
    pub fn view(&self) -> BufferView {
        BufferView {
            resource: self.resource_id,
            address: self.address,
            size: self.size,
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.handle);
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("handle", &self.handle)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Reference to a buffer owned elsewhere (vertex/index buffers, uniform
/// buffers, resource tables).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferView {
    pub resource: ResourceId,
    pub address: GpuAddress,
    pub size: u64,
}

// ─── State objects ───────────────────────────────────────────────────────────

/// A compiled collection or linked pipeline. Released on drop.
pub struct StateObject {
    handle: StateObjectHandle,
    backend: Arc<dyn RayTracingBackend>,
}

impl StateObject {
    #[must_use]
    pub fn from_handle(backend: &Arc<dyn RayTracingBackend>, handle: StateObjectHandle) -> Self {
        Self {
            handle,
            backend: Arc::clone(backend),
        }
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> StateObjectHandle {
        self.handle
    }

    /// Looks up the identifier of an exported shader.
    #[must_use]
    pub fn shader_identifier(&self, export_name: &str) -> Option<ShaderIdentifier> {
        self.backend.shader_identifier(self.handle, export_name)
    }
}

impl Drop for StateObject {
    fn drop(&mut self) {
        self.backend.destroy_state_object(self.handle);
    }
}

impl fmt::Debug for StateObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateObject").field(&self.handle).finish()
    }
}

/// An entry point exported under a new, collision-free name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRename {
    pub export_name: String,
    pub entry_point: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitGroupKind {
    Triangles,
    /// Custom intersection shader over AABBs.
    Procedural,
}

/// Hit group subobject of a collection.
#[derive(Debug, Clone)]
pub struct HitGroupDesc {
    pub export_name: String,
    pub closest_hit: Option<String>,
    pub any_hit: Option<String>,
    pub intersection: Option<String>,
    pub kind: HitGroupKind,
}

/// Everything needed to compile one shader into a standalone collection.
#[derive(Debug)]
pub struct CollectionDesc<'a> {
    pub debug_name: &'a str,
    pub bytecode: &'a [u8],
    pub exports: &'a [ExportRename],
    pub hit_group: Option<&'a HitGroupDesc>,
    pub global_root_signature: &'a RootSignature,
    pub local_root_signature: &'a RootSignature,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

/// Links collections (optionally on top of a base pipeline) into a
/// dispatchable pipeline.
#[derive(Debug)]
pub struct PipelineLinkDesc<'a> {
    pub collections: &'a [StateObjectHandle],
    pub base: Option<StateObjectHandle>,
    pub global_root_signature: &'a RootSignature,
    pub max_payload_size: u32,
    pub max_attribute_size: u32,
    pub max_recursion_depth: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapInfo {
    pub handle: DescriptorHeapHandle,
    /// GPU handle of descriptor 0.
    pub gpu_base: u64,
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// The driver-facing half of the ray tracing layer.
///
/// All methods take `&self`; implementations synchronize internally since
/// compile workers and binding workers call into the backend concurrently.
pub trait RayTracingBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Number of linked GPUs. Per-GPU state is indexed `0..num_gpus()`.
    fn num_gpus(&self) -> u32 {
        1
    }

    // --- Shaders and pipelines ---

    fn create_collection(&self, desc: &CollectionDesc<'_>) -> Result<StateObjectHandle>;

    /// Loads a precompiled collection exporting `exports`.
    fn deserialize_collection(&self, blob: &[u8], exports: &[String]) -> Result<StateObjectHandle>;

    fn link_pipeline(&self, desc: &PipelineLinkDesc<'_>) -> Result<StateObjectHandle>;

    fn shader_identifier(
        &self,
        state_object: StateObjectHandle,
        export_name: &str,
    ) -> Option<ShaderIdentifier>;

    fn destroy_state_object(&self, state_object: StateObjectHandle);

    // --- Descriptors ---

    fn create_descriptor_heap(
        &self,
        gpu_index: u32,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<DescriptorHeapInfo>;

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapHandle);

    /// Distance in bytes between consecutive GPU descriptor handles.
    fn descriptor_increment(&self, heap_type: DescriptorHeapType) -> u32;

    fn write_descriptors(&self, heap: DescriptorHeapHandle, first: u32, descriptors: &[CpuDescriptor]);

    // --- Buffers ---

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(BufferHandle, GpuAddress)>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]);

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u8]);

    // --- Acceleration structures ---

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<PrebuildInfo>;

    /// Shader resource view of a TLAS.
    fn acceleration_structure_view(&self, address: GpuAddress) -> CpuDescriptor;

    // --- Submission ---

    /// Executes a recorded command list. Returns the fence value that is
    /// signaled once the GPU has finished it.
    fn submit(&self, commands: CommandList) -> Result<u64>;

    /// Fence value the next submission will signal.
    fn current_fence(&self) -> u64;

    /// Highest fence value the GPU has completed.
    fn completed_fence(&self) -> u64;

    /// Blocks until `value` has completed.
    fn wait_for_fence(&self, value: u64);
}

/// Builds a `BackendError` from any displayable value.
pub(crate) fn backend_error(message: impl fmt::Display) -> RayTracingError {
    RayTracingError::BackendError(message.to_string())
}
