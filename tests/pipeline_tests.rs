//! Pipeline Tests
//!
//! Tests for:
//! - Creation: identifiers, default miss / closest hit substitution
//! - Validation: missing ray gen, global root signature mismatch, resources on miss slot 0
//! - Incremental linking: base pipeline reuse, extension with new collections
//! - Partial pipelines: no state object, no default shader table
//! - Built-in pipelines created with the device

use std::sync::Arc;

use myth_raytracing::shader::{ShaderFrequency, ShaderResourceCounts};
use myth_raytracing::{RayTracingError, RayTracingPipelineInitializer, ShaderIdentifier};

mod common;
use common::{cbs, device, hit_group, miss, ray_gen, shader};

// ============================================================================
// Creation
// ============================================================================

#[test]
fn pipeline_queries_identifiers_for_every_shader() {
    let (_, device) = device();
    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_ids")],
            miss_shaders: vec![miss("miss_ids")],
            hit_group_shaders: vec![hit_group("hit_a", cbs(1)), hit_group("hit_b", cbs(2))],
            ..Default::default()
        })
        .unwrap();

    let libraries = [
        pipeline.ray_gen_shaders(),
        pipeline.miss_shaders(),
        pipeline.hit_group_shaders(),
    ];
    for library in libraries {
        for id in library.identifiers() {
            assert!(id.is_valid());
            assert!(!id.is_null());
        }
    }
    assert_ne!(
        pipeline.hit_group_shaders().identifier(0),
        pipeline.hit_group_shaders().identifier(1)
    );
    assert!(pipeline.allow_hit_group_indexing());
    // System parameters plus two root CBVs.
    assert_eq!(pipeline.max_local_root_signature_size(), 32 + 16);
}

#[test]
fn defaults_fill_in_missing_miss_and_hit_groups() {
    let (_, device) = device();
    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_defaults")],
            allow_hit_group_indexing: true,
            ..Default::default()
        })
        .unwrap();

    let builtins = device.builtin_shaders();
    assert_eq!(pipeline.miss_shaders().len(), 1);
    assert!(Arc::ptr_eq(pipeline.miss_shaders().shader(0), &builtins.default_miss));
    assert!(Arc::ptr_eq(
        pipeline.hit_group_shaders().shader(0),
        &builtins.default_closest_hit
    ));
    assert!(!pipeline.allow_hit_group_indexing());
}

#[test]
fn default_shader_table_is_uploaded_on_demand() {
    let (_, device) = device();
    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_default_table_0"), ray_gen("rg_default_table_1")],
            ..Default::default()
        })
        .unwrap();

    let mut table = pipeline.default_shader_table(0);
    assert_eq!(table.ray_gen_identifier(1), pipeline.ray_gen_shaders().identifier(1));
    assert_eq!(table.default_hit_group_identifier(), pipeline.hit_group_shaders().identifier(0));
    table.copy_to_gpu().unwrap();
    assert!(!table.is_dirty());
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn missing_ray_gen_is_rejected() {
    let (_, device) = device();
    let err = device
        .create_pipeline(RayTracingPipelineInitializer::default())
        .unwrap_err();
    assert!(matches!(err, RayTracingError::MissingRayGenShader));
}

#[test]
fn ray_gen_shaders_must_share_the_global_root_signature() {
    let (_, device) = device();
    let textured = shader(
        "rg_textured",
        ShaderFrequency::RayGen,
        "rg_textured",
        ShaderResourceCounts {
            num_srvs: 2,
            ..Default::default()
        },
    );
    let buffered = shader("rg_buffered", ShaderFrequency::RayGen, "rg_buffered", cbs(1));

    let err = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![textured, buffered],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RayTracingError::InvalidPipeline(_)));
}

#[test]
fn miss_slot_zero_must_not_bind_resources() {
    let (_, device) = device();
    let bound_miss = shader("miss_bound", ShaderFrequency::Miss, "miss_bound", cbs(1));
    let ray_gen = shader("rg_cb", ShaderFrequency::RayGen, "rg_cb", cbs(1));

    let err = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen],
            miss_shaders: vec![bound_miss],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RayTracingError::InvalidPipeline(_)));
}

#[test]
fn wrong_frequency_is_rejected() {
    let (_, device) = device();
    let err = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_freq")],
            hit_group_shaders: vec![miss("not_a_hit_group")],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RayTracingError::InvalidPipeline(_)));
}

// ============================================================================
// Incremental Linking
// ============================================================================

#[test]
fn extension_without_new_collections_reuses_base() {
    let (backend, device) = device();
    let rg = ray_gen("rg_base");
    let hit = hit_group("hit_base", cbs(1));
    let base = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![Arc::clone(&rg)],
            hit_group_shaders: vec![Arc::clone(&hit)],
            ..Default::default()
        })
        .unwrap();
    let links = backend.link_count();

    let extension = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![rg],
            hit_group_shaders: vec![hit],
            base_pipeline: Some(Arc::clone(&base)),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(backend.link_count(), links);
    assert!(Arc::ptr_eq(
        extension.state_object().unwrap(),
        base.state_object().unwrap()
    ));
    assert_ne!(extension.id(), base.id());
}

#[test]
fn extension_links_only_new_collections() {
    let (backend, device) = device();
    let rg = ray_gen("rg_grow");
    let base = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![Arc::clone(&rg)],
            hit_group_shaders: vec![hit_group("hit_grow_a", cbs(1))],
            ..Default::default()
        })
        .unwrap();
    let links = backend.link_count();
    let collections = backend.collection_count();

    let extension = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![rg],
            hit_group_shaders: vec![hit_group("hit_grow_a", cbs(1)), hit_group("hit_grow_b", cbs(1))],
            base_pipeline: Some(Arc::clone(&base)),
            ..Default::default()
        })
        .unwrap();

    assert_eq!(backend.link_count(), links + 1);
    assert_eq!(backend.collection_count(), collections + 1);
    assert_eq!(extension.unique_collections().len(), base.unique_collections().len() + 1);
    assert!(!extension.hit_group_shaders().identifier(1).is_null());
}

#[test]
fn base_with_other_payload_is_rejected() {
    let (_, device) = device();
    let rg = ray_gen("rg_payload_base");
    let base = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![Arc::clone(&rg)],
            max_payload_size: 16,
            ..Default::default()
        })
        .unwrap();

    let err = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![rg],
            max_payload_size: 64,
            base_pipeline: Some(base),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, RayTracingError::InvalidPipeline(_)));
}

// ============================================================================
// Partial Pipelines
// ============================================================================

#[test]
fn partial_pipeline_compiles_without_linking() {
    let (backend, device) = device();
    let links = backend.link_count();
    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_partial")],
            hit_group_shaders: vec![hit_group("hit_partial", cbs(1))],
            partial: true,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(backend.link_count(), links);
    assert!(pipeline.is_partial());
    assert!(pipeline.state_object().is_none());
    assert_eq!(pipeline.ray_gen_shaders().identifier(0), ShaderIdentifier::INVALID);

    // The collections are cached for the full pipeline later on.
    let hits_before = device.stats_snapshot().collection_cache_hits;
    let full = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_partial")],
            hit_group_shaders: vec![hit_group("hit_partial", cbs(1))],
            ..Default::default()
        })
        .unwrap();
    assert!(full.collection_cache_hits() >= 2);
    assert!(device.stats_snapshot().collection_cache_hits >= hits_before + 2);
}

#[test]
#[should_panic(expected = "partial ray tracing pipelines have no default shader table")]
fn partial_pipeline_has_no_default_table() {
    let (_, device) = device();
    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_partial_table")],
            partial: true,
            ..Default::default()
        })
        .unwrap();
    let _table = pipeline.default_shader_table(0);
}

// ============================================================================
// Built-in Pipelines
// ============================================================================

#[test]
fn builtin_pipelines_are_linked_at_startup() {
    let (_, device) = device();
    let builtins = device.builtin_pipelines();

    for pipeline in [&builtins.occlusion, &builtins.intersection] {
        assert!(pipeline.state_object().is_some());
        assert!(!pipeline.allow_hit_group_indexing());
        assert!(!pipeline.ray_gen_shaders().identifier(0).is_null());
    }
    assert_eq!(
        builtins.occlusion.ray_gen_shaders().shader(0).resource_counts().num_uavs,
        1
    );
    assert_eq!(
        builtins.intersection.ray_gen_shaders().shader(0).resource_counts().num_uavs,
        2
    );
}
