//! In-memory backend.
//!
//! [`NullBackend`] executes everything on the CPU with deterministic results.
//! Buffers and descriptor heaps are plain byte and descriptor arrays, shader
//! identifiers are derived from export names, and acceleration structure
//! builds only record the sizes the driver would have reported. Tests and
//! benchmarks use it to observe what the ray tracing layer asked for.
//!
//! Fences complete as soon as a submission is made unless
//! [`set_auto_complete(false)`](NullBackend::set_auto_complete) is used, in
//! which case they advance only through [`complete_all`](NullBackend::complete_all)
//! or [`wait_for_fence`](RayTracingBackend::wait_for_fence). Buffers retained
//! by a submitted [`CommandList`] are dropped when its fence completes.
//! Commands that address memory no live buffer covers are counted as
//! dangling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use slotmap::{Key, KeyData, SlotMap, new_key_type};
use xxhash_rust::xxh3::xxh3_128;

use super::{
    BufferDesc, BufferHandle, CollectionDesc, CpuDescriptor, DescriptorHeapHandle,
    DescriptorHeapInfo, DescriptorHeapType, GpuAddress, GpuBuffer, PipelineLinkDesc, RayTracingBackend,
    StateObjectHandle, backend_error,
};
use crate::accel::{
    ACCELERATION_STRUCTURE_ALIGNMENT, AccelerationStructureInputs, AccelerationStructureKind,
    PrebuildInfo, align_up,
};
use crate::command::{CommandList, GpuCommand};
use crate::errors::{RayTracingError, Result};
use crate::identifier::{SHADER_IDENTIFIER_SIZE, ShaderIdentifier};

new_key_type! {
    struct BufferKey;
    struct HeapKey;
    struct StateKey;
}

const BASE_ADDRESS: GpuAddress = 0x1_0000_0000;
const RESOURCE_ALIGNMENT: u64 = 64 * 1024;
const VIEW_DESCRIPTOR_SIZE: u32 = 32;
const SAMPLER_DESCRIPTOR_SIZE: u32 = 16;

#[derive(Debug)]
struct NullBuffer {
    data: Vec<u8>,
    address: GpuAddress,
}

#[derive(Debug)]
struct NullHeap {
    descriptors: Vec<CpuDescriptor>,
}

#[derive(Debug)]
struct NullStateObject {
    exports: FxHashSet<String>,
    linked: bool,
}

#[derive(Debug, Default)]
struct NullState {
    buffers: SlotMap<BufferKey, NullBuffer>,
    heaps: SlotMap<HeapKey, NullHeap>,
    state_objects: SlotMap<StateKey, NullStateObject>,
    next_address: GpuAddress,
    /// Compacted size of every acceleration structure built so far.
    built_structures: FxHashMap<GpuAddress, u64>,
    submissions: Vec<Vec<GpuCommand>>,
    resident: FxHashSet<crate::backend::ResourceId>,
    dangling_references: usize,
}

/// Deterministic CPU backend.
#[derive(Debug)]
pub struct NullBackend {
    state: Mutex<NullState>,
    failing_entry_points: Mutex<FxHashSet<String>>,
    compile_delay: Mutex<Duration>,
    submitted_fence: AtomicU64,
    completed_fence: AtomicU64,
    auto_complete: AtomicBool,
    /// Buffers kept alive by submissions, with their fence.
    in_flight: Mutex<Vec<(u64, Vec<Arc<GpuBuffer>>)>>,
    links: AtomicU64,
    collections: AtomicU64,
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl NullBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NullState {
                next_address: BASE_ADDRESS,
                ..Default::default()
            }),
            failing_entry_points: Mutex::new(FxHashSet::default()),
            compile_delay: Mutex::new(Duration::ZERO),
            submitted_fence: AtomicU64::new(0),
            completed_fence: AtomicU64::new(0),
            auto_complete: AtomicBool::new(true),
            in_flight: Mutex::new(Vec::new()),
            links: AtomicU64::new(0),
            collections: AtomicU64::new(0),
        }
    }

    // --- Test controls ---

    /// Collections exporting this entry point fail to compile.
    pub fn fail_compilation_of(&self, entry_point: impl Into<String>) {
        self.failing_entry_points.lock().insert(entry_point.into());
    }

    /// Artificial latency added to every collection compile.
    pub fn set_compile_delay(&self, delay: Duration) {
        *self.compile_delay.lock() = delay;
    }

    /// Whether submissions complete immediately.
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
        if enabled {
            self.complete_all();
        }
    }

    /// Completes every submitted fence.
    pub fn complete_all(&self) {
        self.completed_fence
            .fetch_max(self.submitted_fence.load(Ordering::Acquire), Ordering::AcqRel);
        self.release_completed();
    }

    fn release_completed(&self) {
        let completed = self.completed_fence.load(Ordering::Acquire);
        // Dropped outside the lock: the last reference destroys the buffer.
        let _released: Vec<_> = {
            let mut in_flight = self.in_flight.lock();
            let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *in_flight)
                .into_iter()
                .partition(|(fence, _)| *fence <= completed);
            *in_flight = pending;
            done
        };
    }

    // --- Introspection ---

    /// Link operations performed.
    #[must_use]
    pub fn link_count(&self) -> u64 {
        self.links.load(Ordering::Relaxed)
    }

    /// Collections created (compiled or deserialized).
    #[must_use]
    pub fn collection_count(&self) -> u64 {
        self.collections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Buffers held by submissions whose fence has not completed.
    #[must_use]
    pub fn in_flight_buffer_count(&self) -> usize {
        self.in_flight.lock().iter().map(|(_, buffers)| buffers.len()).sum()
    }

    /// Submitted commands that addressed memory of an already destroyed buffer.
    #[must_use]
    pub fn dangling_reference_count(&self) -> usize {
        self.state.lock().dangling_references
    }

    #[must_use]
    pub fn live_heap_count(&self) -> usize {
        self.state.lock().heaps.len()
    }

    #[must_use]
    pub fn live_state_object_count(&self) -> usize {
        self.state.lock().state_objects.len()
    }

    /// Contents of a live buffer.
    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        let key = BufferKey::from(KeyData::from_ffi(buffer.0));
        self.state.lock().buffers.get(key).map(|b| b.data.clone())
    }

    /// Descriptors currently stored in a heap.
    #[must_use]
    pub fn heap_descriptors(&self, heap: DescriptorHeapHandle) -> Option<Vec<CpuDescriptor>> {
        let key = HeapKey::from(KeyData::from_ffi(heap.0));
        self.state.lock().heaps.get(key).map(|h| h.descriptors.clone())
    }

    /// Every command submitted so far, in order.
    #[must_use]
    pub fn submitted_commands(&self) -> Vec<GpuCommand> {
        self.state.lock().submissions.iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    /// Resources made resident by any submission.
    #[must_use]
    pub fn resident_resources(&self) -> FxHashSet<crate::backend::ResourceId> {
        self.state.lock().resident.clone()
    }

    /// Size the driver reports for compacting a BLAS with `primitives` primitives.
    #[must_use]
    pub fn compacted_size_for(primitives: u64) -> u64 {
        align_up(128 + primitives * 40, ACCELERATION_STRUCTURE_ALIGNMENT)
    }

    fn identifier_for(export_name: &str) -> ShaderIdentifier {
        let digest = xxh3_128(export_name.as_bytes()).to_le_bytes();
        let mut bytes = [0u8; SHADER_IDENTIFIER_SIZE];
        bytes[..16].copy_from_slice(&digest);
        bytes[16..].copy_from_slice(&digest);
        // Neither all-zero (NULL) nor all-0xFF (INVALID).
        bytes[SHADER_IDENTIFIER_SIZE - 1] = 0x5A;
        ShaderIdentifier(bytes)
    }

    fn insert_state_object(&self, exports: FxHashSet<String>, linked: bool) -> StateObjectHandle {
        let key = self
            .state
            .lock()
            .state_objects
            .insert(NullStateObject { exports, linked });
        StateObjectHandle(key.data().as_ffi())
    }

    fn check_live(state: &mut NullState, address: GpuAddress, what: &str) {
        let live = state
            .buffers
            .values()
            .any(|b| (b.address..b.address + b.data.len() as u64).contains(&address));
        if !live {
            log::error!("{what} at {address:#x} refers to a destroyed buffer");
            state.dangling_references += 1;
        }
    }

    fn execute(state: &mut NullState, command: &GpuCommand) {
        match command {
            GpuCommand::BuildAccelerationStructure(build) => {
                Self::check_live(state, build.dest, "build destination");
                Self::check_live(state, build.scratch, "build scratch");
                if let Some(source) = build.source {
                    Self::check_live(state, source, "refit source");
                }
                let primitives = build.inputs.primitive_count();
                state
                    .built_structures
                    .insert(build.dest, Self::compacted_size_for(primitives));
            }
            GpuCommand::EmitCompactedSize {
                source,
                dest,
                offset,
            } => {
                let size = state.built_structures.get(source).copied().unwrap_or(0);
                let key = BufferKey::from(KeyData::from_ffi(dest.0));
                if let Some(buffer) = state.buffers.get_mut(key) {
                    let offset = *offset as usize;
                    buffer.data[offset..offset + 8].copy_from_slice(&size.to_le_bytes());
                }
            }
            GpuCommand::CompactAccelerationStructure { dest, source } => {
                Self::check_live(state, *source, "compaction source");
                Self::check_live(state, *dest, "compaction destination");
                if let Some(size) = state.built_structures.get(source).copied() {
                    state.built_structures.insert(*dest, size);
                }
            }
            _ => {}
        }
    }
}

impl RayTracingBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn create_collection(&self, desc: &CollectionDesc<'_>) -> Result<StateObjectHandle> {
        let delay = *self.compile_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if desc.bytecode.is_empty() {
            return Err(RayTracingError::CompilationFailed(format!(
                "'{}' has no bytecode",
                desc.debug_name
            )));
        }
        {
            let failing = self.failing_entry_points.lock();
            if let Some(bad) = desc.exports.iter().find(|e| failing.contains(&e.entry_point)) {
                return Err(RayTracingError::CompilationFailed(format!(
                    "entry point '{}' of '{}' rejected",
                    bad.entry_point, desc.debug_name
                )));
            }
        }

        let mut exports: FxHashSet<String> =
            desc.exports.iter().map(|e| e.export_name.clone()).collect();
        if let Some(hit_group) = desc.hit_group {
            exports.insert(hit_group.export_name.clone());
        }
        self.collections.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_state_object(exports, false))
    }

    fn deserialize_collection(&self, blob: &[u8], exports: &[String]) -> Result<StateObjectHandle> {
        if blob.is_empty() {
            return Err(RayTracingError::CompilationFailed(
                "empty precompiled collection".into(),
            ));
        }
        self.collections.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_state_object(exports.iter().cloned().collect(), false))
    }

    fn link_pipeline(&self, desc: &PipelineLinkDesc<'_>) -> Result<StateObjectHandle> {
        let mut exports = FxHashSet::default();
        {
            let state = self.state.lock();
            let sources = desc.base.iter().chain(desc.collections.iter());
            for handle in sources {
                let key = StateKey::from(KeyData::from_ffi(handle.0));
                let object = state
                    .state_objects
                    .get(key)
                    .ok_or_else(|| backend_error(format!("unknown state object {handle:?}")))?;
                exports.extend(object.exports.iter().cloned());
            }
        }
        self.links.fetch_add(1, Ordering::Relaxed);
        Ok(self.insert_state_object(exports, true))
    }

    fn shader_identifier(
        &self,
        state_object: StateObjectHandle,
        export_name: &str,
    ) -> Option<ShaderIdentifier> {
        let key = StateKey::from(KeyData::from_ffi(state_object.0));
        let state = self.state.lock();
        let object = state.state_objects.get(key)?;
        object
            .exports
            .contains(export_name)
            .then(|| Self::identifier_for(export_name))
    }

    fn destroy_state_object(&self, state_object: StateObjectHandle) {
        let key = StateKey::from(KeyData::from_ffi(state_object.0));
        let removed = self.state.lock().state_objects.remove(key);
        if let Some(object) = removed {
            log::trace!(
                "Null backend released {} with {} exports",
                if object.linked { "pipeline" } else { "collection" },
                object.exports.len()
            );
        }
    }

    fn create_descriptor_heap(
        &self,
        _gpu_index: u32,
        heap_type: DescriptorHeapType,
        num_descriptors: u32,
    ) -> Result<DescriptorHeapInfo> {
        let increment = u64::from(self.descriptor_increment(heap_type));
        let mut state = self.state.lock();
        let gpu_base = state.next_address;
        state.next_address += align_up(u64::from(num_descriptors) * increment, RESOURCE_ALIGNMENT);
        let key = state.heaps.insert(NullHeap {
            descriptors: vec![CpuDescriptor::default(); num_descriptors as usize],
        });
        Ok(DescriptorHeapInfo {
            handle: DescriptorHeapHandle(key.data().as_ffi()),
            gpu_base,
        })
    }

    fn destroy_descriptor_heap(&self, heap: DescriptorHeapHandle) {
        let key = HeapKey::from(KeyData::from_ffi(heap.0));
        self.state.lock().heaps.remove(key);
    }

    fn descriptor_increment(&self, heap_type: DescriptorHeapType) -> u32 {
        match heap_type {
            DescriptorHeapType::View => VIEW_DESCRIPTOR_SIZE,
            DescriptorHeapType::Sampler => SAMPLER_DESCRIPTOR_SIZE,
        }
    }

    fn write_descriptors(&self, heap: DescriptorHeapHandle, first: u32, descriptors: &[CpuDescriptor]) {
        let key = HeapKey::from(KeyData::from_ffi(heap.0));
        let mut state = self.state.lock();
        if let Some(heap) = state.heaps.get_mut(key) {
            let first = first as usize;
            heap.descriptors[first..first + descriptors.len()].copy_from_slice(descriptors);
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<(BufferHandle, GpuAddress)> {
        if desc.size == 0 {
            return Err(RayTracingError::ResourceCreationFailed {
                what: desc.label,
                size: 0,
            });
        }
        let mut state = self.state.lock();
        let address = state.next_address;
        state.next_address += align_up(desc.size, RESOURCE_ALIGNMENT);
        let key = state.buffers.insert(NullBuffer {
            data: vec![0; desc.size as usize],
            address,
        });
        Ok((BufferHandle(key.data().as_ffi()), address))
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let key = BufferKey::from(KeyData::from_ffi(buffer.0));
        let mut state = self.state.lock();
        if let Some(removed) = state.buffers.remove(key) {
            state.built_structures.remove(&removed.address);
        }
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let key = BufferKey::from(KeyData::from_ffi(buffer.0));
        if let Some(buffer) = self.state.lock().buffers.get_mut(key) {
            let offset = offset as usize;
            buffer.data[offset..offset + data.len()].copy_from_slice(data);
        }
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u64, out: &mut [u8]) {
        let key = BufferKey::from(KeyData::from_ffi(buffer.0));
        if let Some(buffer) = self.state.lock().buffers.get(key) {
            let offset = offset as usize;
            out.copy_from_slice(&buffer.data[offset..offset + out.len()]);
        }
    }

    fn acceleration_structure_prebuild_info(
        &self,
        inputs: &AccelerationStructureInputs,
    ) -> Result<PrebuildInfo> {
        let primitives = inputs.primitive_count();
        let per_primitive = match inputs.kind {
            AccelerationStructureKind::BottomLevel => 64,
            AccelerationStructureKind::TopLevel => 128,
        };
        Ok(PrebuildInfo {
            result_size: align_up(256 + primitives * per_primitive, ACCELERATION_STRUCTURE_ALIGNMENT),
            scratch_size: align_up(128 + primitives * 32, ACCELERATION_STRUCTURE_ALIGNMENT),
            update_scratch_size: align_up(128 + primitives * 16, ACCELERATION_STRUCTURE_ALIGNMENT),
        })
    }

    fn acceleration_structure_view(&self, address: GpuAddress) -> CpuDescriptor {
        CpuDescriptor(address | 1)
    }

    fn submit(&self, mut commands: CommandList) -> Result<u64> {
        let retained = commands.take_retained_buffers();
        {
            let mut state = self.state.lock();
            for command in commands.commands() {
                Self::execute(&mut state, command);
            }
            state.resident.extend(commands.residency().iter().copied());
            state.submissions.push(commands.commands().to_vec());
        }
        let fence = self.submitted_fence.fetch_add(1, Ordering::AcqRel) + 1;
        if !retained.is_empty() {
            self.in_flight.lock().push((fence, retained));
        }
        if self.auto_complete.load(Ordering::Acquire) {
            self.completed_fence.fetch_max(fence, Ordering::AcqRel);
        }
        self.release_completed();
        Ok(fence)
    }

    fn current_fence(&self) -> u64 {
        self.submitted_fence.load(Ordering::Acquire) + 1
    }

    fn completed_fence(&self) -> u64 {
        self.completed_fence.load(Ordering::Acquire)
    }

    fn wait_for_fence(&self, value: u64) {
        let submitted = self.submitted_fence.load(Ordering::Acquire);
        self.completed_fence
            .fetch_max(value.min(submitted), Ordering::AcqRel);
        self.release_completed();
    }
}
