//! Shader Collection Cache Tests
//!
//! Tests for:
//! - Cache key: same shader, payload and root signatures share one entry
//! - Concurrent requests: one compile, one collection object
//! - Payload size and collection type produce distinct entries
//! - Compile failures: entry without state object, NULL identifier in pipelines
//! - Reset: waits for pending compiles and empties the cache

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use myth_raytracing::backend::NullBackend;
use myth_raytracing::shader::{
    CollectionType, CompletionEvent, RootSignature, RootSignatureKind, ShaderCollectionCache,
    ShaderFrequency,
};
use myth_raytracing::stats::RayTracingStats;
use myth_raytracing::{RayTracingBackend, RayTracingPipelineInitializer};

mod common;
use common::{cbs, device, hit_group, miss, ray_gen, shader};

fn cache(threads: usize) -> (Arc<NullBackend>, Arc<RayTracingStats>, ShaderCollectionCache) {
    let backend = Arc::new(NullBackend::new());
    let stats = Arc::new(RayTracingStats::default());
    let dyn_backend: Arc<dyn RayTracingBackend> = backend.clone();
    let cache = ShaderCollectionCache::new(dyn_backend, Arc::clone(&stats), threads);
    (backend, stats, cache)
}

fn global() -> Arc<RootSignature> {
    Arc::new(RootSignature::empty(RootSignatureKind::Global))
}

// ============================================================================
// Cache Keys
// ============================================================================

#[test]
fn identical_requests_share_one_entry() {
    let (backend, stats, cache) = cache(2);
    let shader = ray_gen("rg_identical");
    let global = global();

    let first = cache.get_or_compile(&shader, &global, 24, CollectionType::RayGen);
    let second = cache.get_or_compile(&shader, &global, 24, CollectionType::RayGen);
    CompletionEvent::wait_all(first.completion.iter().chain(second.completion.iter()));

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert!(Arc::ptr_eq(&first.entry, &second.entry));
    assert_eq!(cache.len(), 1);
    assert_eq!(backend.collection_count(), 1);
    assert_eq!(stats.snapshot().collection_cache_hits, 1);
}

#[test]
fn payload_size_is_part_of_the_key() {
    let (backend, _, cache) = cache(1);
    let shader = miss("miss_payload");
    let global = global();

    let small = cache.get_or_compile(&shader, &global, 16, CollectionType::Miss);
    let large = cache.get_or_compile(&shader, &global, 64, CollectionType::Miss);
    CompletionEvent::wait_all(small.completion.iter().chain(large.completion.iter()));

    assert!(!Arc::ptr_eq(&small.entry, &large.entry));
    assert_eq!(backend.collection_count(), 2);
}

#[test]
fn hit_group_entries_export_renamed_entry_points() {
    let (_, _, cache) = cache(1);
    let shader = hit_group("chs_exports", cbs(1));
    let request = cache.get_or_compile(&shader, &global(), 24, CollectionType::HitGroup);
    CompletionEvent::wait_all(request.completion.iter());

    let names = request.entry.export_names();
    assert!(names[0].starts_with("HitGroup_"));
    assert!(names.iter().any(|name| name.starts_with("CHS_")));
    assert!(request.entry.state_object().is_some());
    // Only precompiled collections carry an identifier before linking.
    assert!(request.entry.identifier().is_none());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_requests_compile_once() {
    let (backend, _, cache) = cache(4);
    backend.set_compile_delay(Duration::from_millis(20));
    let shader = shader("rg_race", ShaderFrequency::RayGen, "rg_race", Default::default());
    let global = global();

    let entries: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let request = cache.get_or_compile(&shader, &global, 24, CollectionType::RayGen);
                    if let Some(completion) = &request.completion {
                        completion.wait();
                    }
                    request.entry
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(entries.iter().all(|e| Arc::ptr_eq(e, &entries[0])));
    assert!(entries[0].is_complete());
    assert!(entries[0].state_object().is_some());
    assert_eq!(backend.collection_count(), 1);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn failed_compile_leaves_entry_without_state_object() {
    let (backend, _, cache) = cache(1);
    let mut desc = myth_raytracing::shader::RayTracingShaderDesc::new(
        "broken",
        ShaderFrequency::Miss,
        myth_raytracing::shader::ShaderCode::Bytecode(Arc::from(&b"broken"[..])),
    );
    desc.entry_point = "broken_main".into();
    let broken = Arc::new(myth_raytracing::RayTracingShader::new(desc));
    backend.fail_compilation_of("broken_main");

    let request = cache.get_or_compile(&broken, &global(), 24, CollectionType::Miss);
    CompletionEvent::wait_all(request.completion.iter());

    assert!(request.entry.is_complete());
    assert!(request.entry.failed());
    assert!(request.entry.state_object().is_none());
}

#[test]
fn failed_hit_group_gets_null_identifier_in_pipeline() {
    let (backend, device) = device();
    let mut desc = myth_raytracing::shader::RayTracingShaderDesc::new(
        "broken hit",
        ShaderFrequency::HitGroup,
        myth_raytracing::shader::ShaderCode::Bytecode(Arc::from(&b"broken hit"[..])),
    );
    desc.entry_point = "broken_chs".into();
    let broken = Arc::new(myth_raytracing::RayTracingShader::new(desc));
    backend.fail_compilation_of("broken_chs");

    let pipeline = device
        .create_pipeline(RayTracingPipelineInitializer {
            ray_gen_shaders: vec![ray_gen("rg_with_broken_hit")],
            hit_group_shaders: vec![hit_group("good_hit", cbs(0)), broken],
            ..Default::default()
        })
        .unwrap();

    let hits = pipeline.hit_group_shaders();
    assert!(!hits.identifier(0).is_null());
    assert!(hits.identifier(1).is_null());
    assert!(pipeline.state_object().is_some());
}

// ============================================================================
// Reset
// ============================================================================

#[test]
fn reset_clears_entries_after_pending_compiles() {
    let (backend, _, cache) = cache(2);
    backend.set_compile_delay(Duration::from_millis(10));
    let global = global();
    let requests: Vec<_> = (0..4)
        .map(|i| cache.get_or_compile(&ray_gen(&format!("rg_reset_{i}")), &global, 24, CollectionType::RayGen))
        .collect();

    cache.reset();

    assert!(cache.is_empty());
    assert!(requests.iter().all(|r| r.entry.is_complete()));
}
