//! Acceleration Structure Tests
//!
//! Tests for:
//! - BLAS lifecycle: build, fence, compaction
//! - Refits: first update builds, later updates refit in place
//! - Batches: vertex buffer replacement
//! - TLAS: instance flags, hit group contributions, GPU-sourced transforms
//! - Hit record indexing across instances, segments and slots
//! - Memory gauges

use std::collections::HashSet;
use std::sync::Arc;

use glam::{Affine3A, Vec3};

use myth_raytracing::accel::{
    AccelerationStructureBuild, AccelerationStructureKind, BuildFlags, InstanceFlags,
};
use myth_raytracing::command::GpuCommand;
use myth_raytracing::{
    AccelerationStructureUpdate, BlasState, InstanceTransforms,
    NullBackend, RayTracingDevice, RayTracingError, RayTracingGeometry, RayTracingGeometryInitializer,
    RayTracingSceneInitializer, RayTracingSettings, SceneLifetime,
};

mod common;
use common::{device, device_with, fake_buffer, indexed_triangles, instance};

fn builds(commands: &[GpuCommand]) -> Vec<&AccelerationStructureBuild> {
    commands
        .iter()
        .filter_map(|command| match command {
            GpuCommand::BuildAccelerationStructure(build) => Some(build.as_ref()),
            _ => None,
        })
        .collect()
}

fn updatable(device: &RayTracingDevice) -> Arc<RayTracingGeometry> {
    let mut init = indexed_triangles(6, 1);
    init.allow_update = true;
    device.create_geometry(init).unwrap()
}

fn build_now(device: &RayTracingDevice, geometry: &Arc<RayTracingGeometry>) {
    let mut ctx = device.create_command_context(0);
    assert!(ctx.build_acceleration_structure(geometry).unwrap());
    ctx.submit().unwrap();
}

// ============================================================================
// BLAS Lifecycle
// ============================================================================

#[test]
fn static_blas_is_compacted_after_its_build_completes() {
    let (_, device) = device();
    let geometry = device.create_geometry(indexed_triangles(12, 1)).unwrap();
    assert_eq!(geometry.state(0), BlasState::Dirty);
    assert!(geometry.build_flags().contains(BuildFlags::ALLOW_COMPACTION));

    let mut ctx = device.create_command_context(0);
    assert!(ctx.build_acceleration_structure(&geometry).unwrap());
    assert!(!ctx.build_acceleration_structure(&geometry).unwrap());
    assert_eq!(geometry.state(0), BlasState::Building);
    assert!(ctx
        .commands()
        .commands()
        .iter()
        .any(|c| matches!(c, GpuCommand::EmitCompactedSize { .. })));
    ctx.submit().unwrap();

    assert_eq!(geometry.state(0), BlasState::ReadyPendingCompaction);
    assert_eq!(device.pending_compaction_count(), 1);
    assert_eq!(geometry.acceleration_structure_size(0), Some(1024));
    assert!(!geometry.has_scratch_buffer(0));

    let mut ctx = device.create_command_context(0);
    assert_eq!(ctx.compact_pending_acceleration_structures().unwrap(), 1);
    assert_eq!(geometry.state(0), BlasState::Compacted);
    assert_eq!(
        geometry.acceleration_structure_size(0),
        Some(NullBackend::compacted_size_for(12))
    );
    assert_eq!(geometry.acceleration_structure_size(0), Some(768));
    ctx.submit().unwrap();

    assert_eq!(device.pending_compaction_count(), 0);
    assert_eq!(device.stats_snapshot().compacted_blas, 1);
}

#[test]
fn compaction_waits_for_the_build_fence() {
    let (backend, device) = device();
    backend.set_auto_complete(false);
    let geometry = device.create_geometry(indexed_triangles(12, 1)).unwrap();
    build_now(&device, &geometry);
    assert_eq!(geometry.state(0), BlasState::Building);

    let mut ctx = device.create_command_context(0);
    assert_eq!(ctx.compact_pending_acceleration_structures().unwrap(), 0);
    assert_eq!(device.pending_compaction_count(), 1);

    backend.complete_all();
    assert_eq!(ctx.compact_pending_acceleration_structures().unwrap(), 1);
    assert_eq!(geometry.state(0), BlasState::Compacted);
}

#[test]
fn released_buffers_live_until_the_submission_completes() {
    let (backend, device) = device();
    backend.set_auto_complete(false);
    let geometry = device.create_geometry(indexed_triangles(12, 1)).unwrap();
    let live = backend.live_buffer_count();

    // Result, scratch and size readback, though the geometry keeps no scratch.
    let mut ctx = device.create_command_context(0);
    assert!(ctx.build_acceleration_structure(&geometry).unwrap());
    assert!(!geometry.has_scratch_buffer(0));
    assert_eq!(ctx.commands().retained_buffer_count(), 1);
    assert_eq!(backend.live_buffer_count(), live + 3);

    ctx.submit().unwrap();
    assert_eq!(backend.in_flight_buffer_count(), 1);
    assert_eq!(backend.live_buffer_count(), live + 3);
    backend.complete_all();
    assert_eq!(backend.in_flight_buffer_count(), 0);
    assert_eq!(backend.live_buffer_count(), live + 2);

    // The compacting copy reads the full-size result it replaces.
    let mut ctx = device.create_command_context(0);
    assert_eq!(ctx.compact_pending_acceleration_structures().unwrap(), 1);
    assert_eq!(backend.live_buffer_count(), live + 2);
    ctx.submit().unwrap();
    assert_eq!(backend.live_buffer_count(), live + 2);
    backend.complete_all();
    assert_eq!(backend.live_buffer_count(), live + 1);

    assert_eq!(backend.dangling_reference_count(), 0);
}

#[test]
fn rebuilt_tlas_keeps_previous_buffers_for_pending_commands() {
    let (backend, device) = device();
    let geometry = device.create_geometry(indexed_triangles(4, 1)).unwrap();
    let mut scene = device
        .create_scene(RayTracingSceneInitializer {
            instances: vec![instance(&geometry)],
            shader_slots_per_geometry_segment: 1,
            ..Default::default()
        })
        .unwrap();
    backend.set_auto_complete(false);

    let mut ctx = device.create_command_context(0);
    ctx.build_acceleration_structure(&geometry).unwrap();
    ctx.build_scene(&mut scene).unwrap();
    let first_tlas = scene.acceleration_structure_address(0).unwrap();
    let retained = ctx.commands().retained_buffer_count();
    ctx.build_scene(&mut scene).unwrap();
    assert_ne!(scene.acceleration_structure_address(0), Some(first_tlas));
    // Old result, instance buffer and scratch.
    assert_eq!(ctx.commands().retained_buffer_count(), retained + 3);

    ctx.submit().unwrap();
    assert_eq!(builds(&backend.submitted_commands()).len(), 3);
    assert_eq!(backend.dangling_reference_count(), 0);

    let live = backend.live_buffer_count();
    backend.complete_all();
    assert_eq!(backend.live_buffer_count(), live - (retained + 3));
}

#[test]
fn fast_build_and_updatable_geometry_skip_compaction() {
    let (_, device) = device();
    let mut fast = indexed_triangles(4, 1);
    fast.fast_build = true;
    let fast = device.create_geometry(fast).unwrap();
    let refit = updatable(&device);

    for geometry in [&fast, &refit] {
        assert!(!geometry.build_flags().contains(BuildFlags::ALLOW_COMPACTION));
        build_now(&device, geometry);
        assert_eq!(geometry.state(0), BlasState::Ready);
    }
    assert!(fast.build_flags().contains(BuildFlags::PREFER_FAST_BUILD));
    assert!(refit.has_scratch_buffer(0));
    assert!(!fast.has_scratch_buffer(0));
    assert_eq!(device.pending_compaction_count(), 0);
}

#[test]
fn forced_build_mode_overrides_geometry_preference() {
    let (_, device) = device_with(RayTracingSettings {
        force_build_mode: myth_raytracing::BuildModeOverride::FastBuild,
        ..Default::default()
    });
    let geometry = device.create_geometry(indexed_triangles(4, 1)).unwrap();
    assert!(geometry.build_flags().contains(BuildFlags::PREFER_FAST_BUILD));
    assert!(!geometry.build_flags().contains(BuildFlags::ALLOW_COMPACTION));
}

#[test]
fn rebuilding_a_compacted_blas_restores_full_size() {
    let (_, device) = device();
    let geometry = device.create_geometry(indexed_triangles(12, 1)).unwrap();
    build_now(&device, &geometry);
    let mut ctx = device.create_command_context(0);
    ctx.compact_pending_acceleration_structures().unwrap();
    ctx.submit().unwrap();
    assert_eq!(geometry.acceleration_structure_size(0), Some(768));

    geometry.mark_dirty();
    assert!(geometry.is_dirty(0));
    build_now(&device, &geometry);
    assert_eq!(geometry.acceleration_structure_size(0), Some(1024));
    assert_eq!(device.stats_snapshot().built_blas, 2);
}

#[test]
fn invalid_geometry_is_rejected() {
    let (_, device) = device();
    let mut init = indexed_triangles(4, 2);
    init.segments[1].num_primitives = 3;
    assert!(matches!(
        device.create_geometry(init),
        Err(RayTracingError::InvalidGeometry(_))
    ));

    let mut init = RayTracingGeometryInitializer::triangles(fake_buffer(120), None, 10);
    init.vertex_stride = 6;
    assert!(device.create_geometry(init).is_err());
}

// ============================================================================
// Refits
// ============================================================================

#[test]
fn refit_requires_allow_update() {
    let (_, device) = device();
    let geometry = device.create_geometry(indexed_triangles(4, 1)).unwrap();
    let mut ctx = device.create_command_context(0);
    let err = ctx
        .update_acceleration_structures(&[AccelerationStructureUpdate {
            geometry,
            vertex_buffer: None,
        }])
        .unwrap_err();
    assert!(matches!(err, RayTracingError::InvalidGeometry(_)));
}

#[test]
fn first_update_builds_then_refits_in_place() {
    let (_, device) = device();
    let geometry = updatable(&device);
    let update = [AccelerationStructureUpdate {
        geometry: Arc::clone(&geometry),
        vertex_buffer: None,
    }];

    let mut ctx = device.create_command_context(0);
    assert_eq!(ctx.update_acceleration_structures(&update).unwrap(), 1);
    {
        let recorded = builds(ctx.commands().commands());
        assert_eq!(recorded.len(), 1);
        assert!(!recorded[0].inputs.flags.contains(BuildFlags::PERFORM_UPDATE));
        assert_eq!(recorded[0].source, None);
    }
    ctx.submit().unwrap();

    let mut ctx = device.create_command_context(0);
    assert_eq!(ctx.update_acceleration_structures(&update).unwrap(), 1);
    let recorded = builds(ctx.commands().commands());
    assert!(recorded[0].inputs.flags.contains(BuildFlags::PERFORM_UPDATE));
    assert_eq!(recorded[0].source, Some(recorded[0].dest));
    assert_eq!(Some(recorded[0].dest), geometry.acceleration_structure_address(0));

    let stats = device.stats_snapshot();
    assert_eq!(stats.built_blas, 1);
    assert_eq!(stats.updated_blas, 1);
}

#[test]
fn forced_full_builds_turn_refits_into_builds() {
    let (_, device) = device_with(RayTracingSettings {
        force_full_build: true,
        ..Default::default()
    });
    let geometry = updatable(&device);
    let update = [AccelerationStructureUpdate {
        geometry,
        vertex_buffer: None,
    }];

    for _ in 0..2 {
        let mut ctx = device.create_command_context(0);
        ctx.update_acceleration_structures(&update).unwrap();
        let recorded = builds(ctx.commands().commands());
        assert!(!recorded[0].inputs.flags.contains(BuildFlags::PERFORM_UPDATE));
        ctx.submit().unwrap();
    }
    assert_eq!(device.stats_snapshot().built_blas, 2);
    assert_eq!(device.stats_snapshot().updated_blas, 0);
}

#[test]
fn batch_build_replaces_vertex_buffers() {
    let (_, device) = device();
    let a = device.create_geometry(indexed_triangles(2, 1)).unwrap();
    let b = device.create_geometry(indexed_triangles(2, 1)).unwrap();
    build_now(&device, &a);
    build_now(&device, &b);

    let replacement = fake_buffer(2 * 3 * 12);
    let mut ctx = device.create_command_context(0);
    let recorded = ctx
        .build_acceleration_structures(&[
            AccelerationStructureUpdate {
                geometry: Arc::clone(&a),
                vertex_buffer: Some(replacement),
            },
            AccelerationStructureUpdate {
                geometry: Arc::clone(&b),
                vertex_buffer: None,
            },
        ])
        .unwrap();

    assert_eq!(recorded, 2);
    assert_eq!(a.vertex_buffer(), replacement);
    assert!(ctx.commands().residency().contains(&replacement.resource));
}

// ============================================================================
// TLAS
// ============================================================================

#[test]
fn scene_build_requires_built_blas() {
    let (_, device) = device();
    let geometry = device.create_geometry(indexed_triangles(2, 1)).unwrap();
    let mut scene = device
        .create_scene(RayTracingSceneInitializer {
            debug_name: "unbuilt".into(),
            instances: vec![instance(&geometry)],
            shader_slots_per_geometry_segment: 1,
            ..Default::default()
        })
        .unwrap();

    let mut ctx = device.create_command_context(0);
    let err = ctx.build_scene(&mut scene).unwrap_err();
    assert!(matches!(err, RayTracingError::AccelerationStructureBuildFailed(_)));
    assert!(!scene.is_built(0));

    ctx.build_acceleration_structure(&geometry).unwrap();
    ctx.build_scene(&mut scene).unwrap();
    assert!(scene.is_built(0));
    assert!(scene.acceleration_structure_srv(0).is_some());

    let recorded = builds(ctx.commands().commands());
    let tlas = recorded.last().unwrap();
    assert_eq!(tlas.inputs.kind, AccelerationStructureKind::TopLevel);
    assert!(tlas.inputs.flags.contains(BuildFlags::PREFER_FAST_TRACE));
    assert_eq!(tlas.source, None);
}

#[test]
fn instance_flags_follow_instance_and_settings() {
    let flags_of = |settings: RayTracingSettings| {
        let (_, device) = device_with(settings);
        let geometry = device.create_geometry(indexed_triangles(2, 1)).unwrap();
        build_now(&device, &geometry);

        let plain = instance(&geometry);
        let mut opaque = instance(&geometry);
        opaque.force_opaque = true;
        let mut double_sided = instance(&geometry);
        double_sided.double_sided = true;

        let scene = device
            .create_scene(RayTracingSceneInitializer {
                instances: vec![plain, opaque, double_sided],
                shader_slots_per_geometry_segment: 1,
                ..Default::default()
            })
            .unwrap();
        scene
            .instance_descs(0)
            .unwrap()
            .iter()
            .map(|desc| desc.flags())
            .collect::<Vec<_>>()
    };

    let ccw = InstanceFlags::TRIANGLE_FRONT_COUNTERCLOCKWISE;
    let flags = flags_of(RayTracingSettings::default());
    assert_eq!(flags[0], ccw);
    assert_eq!(flags[1], ccw | InstanceFlags::FORCE_OPAQUE);
    assert_eq!(flags[2], ccw | InstanceFlags::TRIANGLE_CULL_DISABLE);

    let flags = flags_of(RayTracingSettings {
        force_opaque: true,
        disable_triangle_cull: true,
        ..Default::default()
    });
    let all = ccw | InstanceFlags::FORCE_OPAQUE | InstanceFlags::TRIANGLE_CULL_DISABLE;
    assert!(flags.iter().all(|f| *f == all));
}

#[test]
fn contributions_and_record_indices_partition_the_hit_region() {
    let (_, device) = device();
    let geometries: Vec<_> = [1, 3, 2]
        .into_iter()
        .map(|segments| device.create_geometry(indexed_triangles(2, segments)).unwrap())
        .collect();
    for geometry in &geometries {
        build_now(&device, geometry);
    }
    let scene = device
        .create_scene(RayTracingSceneInitializer {
            instances: geometries.iter().map(instance).collect(),
            shader_slots_per_geometry_segment: 2,
            ..Default::default()
        })
        .unwrap();

    let contributions: Vec<_> = scene
        .instance_descs(0)
        .unwrap()
        .iter()
        .map(|desc| desc.hit_group_contribution())
        .collect();
    assert_eq!(contributions, vec![0, 2, 8]);
    assert_eq!(scene.num_hit_records(), 12);

    let mut seen = HashSet::new();
    for (i, geometry) in geometries.iter().enumerate() {
        for segment in 0..geometry.num_segments() {
            for slot in 0..2 {
                let index = scene.hit_record_index(i as u32, segment, slot);
                assert!(index < scene.num_hit_records());
                assert!(seen.insert(index));
            }
        }
    }
    assert_eq!(seen.len(), 12);
}

#[test]
fn gpu_transforms_are_copied_before_the_build() {
    let (_, device) = device();
    let geometry = device.create_geometry(indexed_triangles(2, 1)).unwrap();
    build_now(&device, &geometry);

    let mut cpu = instance(&geometry);
    cpu.transforms = InstanceTransforms::Cpu(vec![
        Affine3A::from_translation(Vec3::X),
        Affine3A::from_translation(Vec3::Y),
    ]);
    let transforms = fake_buffer(3 * 48);
    let mut gpu = instance(&geometry);
    gpu.transforms = InstanceTransforms::Gpu {
        source: transforms,
        num_transforms: 3,
    };

    let mut scene = device
        .create_scene(RayTracingSceneInitializer {
            instances: vec![cpu, gpu],
            shader_slots_per_geometry_segment: 1,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(scene.num_native_instances(), 5);
    assert_eq!(scene.base_instance_prefix_sum(), &[0, 2]);

    let mut ctx = device.create_command_context(0);
    ctx.build_scene(&mut scene).unwrap();

    let commands = ctx.commands().commands();
    let copy_at = commands
        .iter()
        .position(|c| matches!(c, GpuCommand::CopyInstanceTransforms(_)))
        .unwrap();
    let build_at = commands
        .iter()
        .position(|c| matches!(c, GpuCommand::BuildAccelerationStructure(_)))
        .unwrap();
    assert!(copy_at < build_at);
    let GpuCommand::CopyInstanceTransforms(copy) = &commands[copy_at] else {
        unreachable!()
    };
    assert_eq!(copy.source, transforms.address);
    assert_eq!(copy.first_instance, 2);
    assert_eq!(copy.num_instances, 3);
    assert_eq!(copy.dest, scene.instance_buffer(0).unwrap().address());
    assert!(ctx.commands().residency().contains(&transforms.resource));
}

#[test]
fn multi_frame_scenes_are_unsupported() {
    let (_, device) = device();
    let err = device
        .create_scene(RayTracingSceneInitializer {
            lifetime: SceneLifetime::MultiFrame,
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RayTracingError::UnsupportedSceneLifetime));
}

// ============================================================================
// Memory Gauges
// ============================================================================

#[test]
fn gauges_return_to_zero_after_drop() {
    let (backend, device) = device();
    let buffers_before = backend.live_buffer_count();
    {
        let geometry = device.create_geometry(indexed_triangles(8, 2)).unwrap();
        let mut scene = device
            .create_scene(RayTracingSceneInitializer {
                instances: vec![instance(&geometry)],
                shader_slots_per_geometry_segment: 1,
                ..Default::default()
            })
            .unwrap();
        let mut ctx = device.create_command_context(0);
        ctx.build_acceleration_structure(&geometry).unwrap();
        ctx.build_scene(&mut scene).unwrap();
        ctx.submit().unwrap();

        let stats = device.stats_snapshot();
        assert_eq!(stats.allocated_blas, 1);
        assert_eq!(stats.allocated_tlas, 1);
        assert!(stats.blas_memory > 0);
        assert!(stats.tlas_memory > 0);
    }

    let stats = device.stats_snapshot();
    assert_eq!(stats.allocated_blas, 0);
    assert_eq!(stats.allocated_tlas, 0);
    assert_eq!(stats.blas_memory, 0);
    assert_eq!(stats.tlas_memory, 0);
    assert_eq!(stats.blas_triangles, 0);
    assert_eq!(backend.live_buffer_count(), buffers_before);
}
