//! Descriptor Tests
//!
//! Tests for:
//! - Descriptor table deduplication within a shader table
//! - Heap exhaustion: dropped bindings, budget growth, earlier tables intact
//! - Heap pool: recycling only after the GPU is done with a heap

use myth_raytracing::backend::{CpuDescriptor, DescriptorHeapType, ResourceId};
use myth_raytracing::shader::ShaderResourceCounts;
use myth_raytracing::{
    BoundView, DescriptorDedupMode, HitGroupBinding, RayTracingDevice, RayTracingPipelineInitializer,
    RayTracingScene, RayTracingSceneInitializer, RayTracingSettings, ShaderBindings,
};

mod common;
use common::{device, device_with, hit_group, indexed_triangles, instance, ray_gen};

/// Identifier plus system parameters; the SRV table follows.
const SRV_TABLE: usize = 64;

fn srvs(n: u32) -> ShaderResourceCounts {
    ShaderResourceCounts {
        num_srvs: n,
        ..Default::default()
    }
}

fn view(descriptor: u64) -> BoundView {
    BoundView {
        descriptor: CpuDescriptor(descriptor),
        resource: ResourceId::next(),
    }
}

fn srv_pair(a: u64, b: u64) -> ShaderBindings {
    let mut bindings = ShaderBindings::default();
    bindings.set_srv(0, view(a)).set_srv(1, view(b));
    bindings
}

fn scene(device: &RayTracingDevice, num_instances: usize) -> RayTracingScene {
    let geometry = device.create_geometry(indexed_triangles(1, 1)).unwrap();
    device
        .create_scene(RayTracingSceneInitializer {
            debug_name: "descriptor scene".into(),
            instances: (0..num_instances).map(|_| instance(&geometry)).collect(),
            shader_slots_per_geometry_segment: 1,
            ..Default::default()
        })
        .unwrap()
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
}

fn bind_pairs(
    device: &RayTracingDevice,
    scene: &mut RayTracingScene,
    code: &str,
    pairs: &[(u64, u64)],
) -> (std::sync::Arc<myth_raytracing::RayTracingPipeline>, myth_raytracing::BindingSummary) {
    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen(&format!("rg_{code}"))],
            hit_group_shaders: vec![hit_group(code, srvs(2))],
            allow_hit_group_indexing: true,
            ..Default::default()
        })
        .unwrap();
    let bindings: Vec<_> = pairs
        .iter()
        .enumerate()
        .map(|(i, &(a, b))| HitGroupBinding {
            instance_index: i as u32,
            bindings: srv_pair(a, b),
            ..Default::default()
        })
        .collect();
    let mut ctx = device.create_command_context(0);
    let summary = ctx.set_hit_group_bindings(scene, &pipeline, &bindings).unwrap();
    (pipeline, summary)
}

// ============================================================================
// Deduplication
// ============================================================================

#[test]
fn identical_tables_share_one_heap_range() {
    for dedup in [DescriptorDedupMode::FullCompare, DescriptorDedupMode::HashOnly] {
        let (_, device) = device_with(RayTracingSettings {
            descriptor_dedup: dedup,
            parallel_binding: false,
            ..Default::default()
        });
        let mut scene = scene(&device, 3);
        let (pipeline, summary) =
            bind_pairs(&device, &mut scene, "hit_dedup", &[(11, 12), (11, 12), (13, 14)]);
        assert_eq!(summary.written, 3);

        let table = scene.shader_table(pipeline.id(), 0).unwrap();
        let first = read_u64(table.local_record(0), SRV_TABLE);
        let second = read_u64(table.local_record(1), SRV_TABLE);
        let third = read_u64(table.local_record(2), SRV_TABLE);
        assert_eq!(first, second);
        assert_ne!(first, third);

        let heaps = table.descriptor_cache().unwrap().heaps();
        assert_eq!(heaps.view_heap().used(), 4);
    }
}

#[test]
fn deduplicated_table_holds_the_bound_descriptors() {
    let (backend, device) = device_with(RayTracingSettings {
        parallel_binding: false,
        ..Default::default()
    });
    let mut scene = scene(&device, 2);
    let (pipeline, _) = bind_pairs(&device, &mut scene, "hit_contents", &[(21, 22), (21, 22)]);

    let table = scene.shader_table(pipeline.id(), 0).unwrap();
    let heap = table.descriptor_cache().unwrap().heaps().view_heap();
    let descriptors = backend.heap_descriptors(heap.handle()).unwrap();
    assert_eq!(&descriptors[..2], &[CpuDescriptor(21), CpuDescriptor(22)]);
    assert_eq!(read_u64(table.local_record(0), SRV_TABLE), heap.gpu_handle(0).0);
}

// ============================================================================
// Exhaustion
// ============================================================================

#[test]
fn full_heap_drops_binding_and_grows_budget() {
    let (backend, device) = device_with(RayTracingSettings {
        min_view_descriptor_heap_size: 4,
        max_view_descriptor_heap_size: 4,
        parallel_binding: false,
        ..Default::default()
    });
    let mut scene = scene(&device, 3);
    let (pipeline, summary) =
        bind_pairs(&device, &mut scene, "hit_full", &[(31, 32), (33, 34), (35, 36)]);

    assert_eq!(summary.written, 2);
    assert_eq!(summary.dropped, 1);
    assert_eq!(device.stats_snapshot().descriptor_allocation_failures, 1);

    // Tables written before the overflow are untouched.
    let table = scene.shader_table(pipeline.id(), 0).unwrap();
    let heap = table.descriptor_cache().unwrap().heaps().view_heap();
    assert!(heap.is_exhausted());
    let descriptors = backend.heap_descriptors(heap.handle()).unwrap();
    assert_eq!(
        descriptors,
        vec![CpuDescriptor(31), CpuDescriptor(32), CpuDescriptor(33), CpuDescriptor(34)]
    );
    assert!(table.local_shader_identifier(2).is_null());
}

#[test]
fn budget_floor_doubles_up_to_the_cap() {
    let (_, device) = device_with(RayTracingSettings {
        min_view_descriptor_heap_size: 4,
        max_view_descriptor_heap_size: 16,
        parallel_binding: false,
        ..Default::default()
    });
    let mut scene = scene(&device, 3);
    let (_, summary) = bind_pairs(&device, &mut scene, "hit_grow", &[(41, 42), (43, 44), (45, 46)]);

    // Three records of two descriptors ask for 6, above the floor of 4.
    assert_eq!(summary.dropped, 0);

    let budget = device.descriptor_budget();
    assert_eq!(budget.view_heap_size(1, 1), 4);
    budget.report_exhausted(DescriptorHeapType::View, 4);
    assert_eq!(budget.view_floor(), 8);
    budget.report_exhausted(DescriptorHeapType::View, 16);
    assert_eq!(budget.view_floor(), 16);
    assert_eq!(budget.view_heap_size(1_000, 8), 16);
}

#[test]
fn used_descriptor_gauge_follows_heap_lifetime() {
    let (_, device) = device_with(RayTracingSettings {
        parallel_binding: false,
        ..Default::default()
    });
    let before = device.stats_snapshot().used_view_descriptors;
    {
        let mut scene = scene(&device, 2);
        bind_pairs(&device, &mut scene, "hit_gauge", &[(51, 52), (53, 54)]);
        assert_eq!(device.stats_snapshot().used_view_descriptors, before + 4);
    }
    assert_eq!(device.stats_snapshot().used_view_descriptors, before);
}

// ============================================================================
// Heap Pool
// ============================================================================

#[test]
fn heaps_are_recycled_once_their_fence_completes() {
    let (backend, device) = device();
    backend.set_auto_complete(false);
    let pool = device.heap_pool();

    let heap = pool.allocate(0, DescriptorHeapType::View, 64).unwrap();
    let fence = device.create_command_context(0).submit().unwrap();
    heap.update_sync_point(fence);
    drop(heap);
    let live = backend.live_heap_count();

    // Still in flight: a second heap is created.
    let second = pool.allocate(0, DescriptorHeapType::View, 64).unwrap();
    assert_eq!(backend.live_heap_count(), live + 1);
    drop(second);

    backend.complete_all();
    let _third = pool.allocate(0, DescriptorHeapType::View, 64).unwrap();
    let _fourth = pool.allocate(0, DescriptorHeapType::View, 32).unwrap();
    assert_eq!(backend.live_heap_count(), live + 1);
    assert_eq!(pool.allocated_count(), 2);
}

#[test]
fn stale_heaps_are_destroyed_at_end_of_frame() {
    let (backend, device) = device_with(RayTracingSettings {
        stale_heap_max_age: 2,
        ..Default::default()
    });
    let pool = device.heap_pool();
    drop(pool.allocate(0, DescriptorHeapType::Sampler, 16).unwrap());
    let pooled = pool.pooled_count();
    let live = backend.live_heap_count();
    assert!(pooled >= 1);

    for _ in 0..3 {
        device.create_command_context(0).submit().unwrap();
    }
    device.end_frame();

    assert_eq!(pool.pooled_count(), 0);
    assert_eq!(backend.live_heap_count(), live - pooled);
}
