//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use glam::Affine3A;

use myth_raytracing::accel::IndexBuffer;
use myth_raytracing::backend::{BufferView, NullBackend, ResourceId};
use myth_raytracing::shader::{
    RayTracingShader, RayTracingShaderDesc, ShaderCode, ShaderFrequency, ShaderResourceCounts,
};
use myth_raytracing::{
    BuiltinShaderBlobs, RayTracingDevice, RayTracingGeometry, RayTracingGeometryInitializer,
    RayTracingGeometryInstance, RayTracingSettings,
};

pub fn builtin_blobs() -> BuiltinShaderBlobs<'static> {
    BuiltinShaderBlobs {
        occlusion_ray_gen: b"builtin occlusion ray gen",
        intersection_ray_gen: b"builtin intersection ray gen",
        intersection_closest_hit: b"builtin intersection closest hit",
        default_closest_hit: b"builtin default closest hit",
        default_miss: b"builtin default miss",
    }
}

pub fn device_with(settings: RayTracingSettings) -> (Arc<NullBackend>, RayTracingDevice) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(NullBackend::new());
    let device = RayTracingDevice::new(backend.clone(), settings, builtin_blobs())
        .expect("device creation");
    (backend, device)
}

pub fn device() -> (Arc<NullBackend>, RayTracingDevice) {
    device_with(RayTracingSettings::default())
}

pub fn shader(
    name: &str,
    frequency: ShaderFrequency,
    code: &str,
    counts: ShaderResourceCounts,
) -> Arc<RayTracingShader> {
    let mut desc = RayTracingShaderDesc::new(name, frequency, ShaderCode::Bytecode(Arc::from(code.as_bytes())));
    desc.resource_counts = counts;
    Arc::new(RayTracingShader::new(desc))
}

pub fn ray_gen(code: &str) -> Arc<RayTracingShader> {
    shader(code, ShaderFrequency::RayGen, code, ShaderResourceCounts::default())
}

pub fn miss(code: &str) -> Arc<RayTracingShader> {
    shader(code, ShaderFrequency::Miss, code, ShaderResourceCounts::default())
}

pub fn hit_group(code: &str, counts: ShaderResourceCounts) -> Arc<RayTracingShader> {
    shader(code, ShaderFrequency::HitGroup, code, counts)
}

pub fn cbs(num_cbs: u32) -> ShaderResourceCounts {
    ShaderResourceCounts {
        num_cbs,
        ..Default::default()
    }
}

pub fn fake_buffer(size: u64) -> BufferView {
    BufferView {
        resource: ResourceId::next(),
        address: 0x4000_0000 + ResourceId::next().0 * 0x1_0000,
        size,
    }
}

/// Indexed triangles split into `segments` equal segments.
pub fn indexed_triangles(triangles_per_segment: u32, segments: u32) -> RayTracingGeometryInitializer {
    use myth_raytracing::GeometrySegment;

    let total = triangles_per_segment * segments;
    let mut init = RayTracingGeometryInitializer::triangles(
        fake_buffer(u64::from(total) * 3 * 12),
        Some(IndexBuffer {
            buffer: fake_buffer(u64::from(total) * 3 * 4),
            stride: 4,
        }),
        total,
    );
    init.debug_name = format!("mesh x{segments}");
    init.segments = (0..segments)
        .map(|i| GeometrySegment {
            first_primitive: i * triangles_per_segment,
            num_primitives: triangles_per_segment,
            ..Default::default()
        })
        .collect();
    init
}

pub fn instance(geometry: &Arc<RayTracingGeometry>) -> RayTracingGeometryInstance {
    RayTracingGeometryInstance::new(Arc::clone(geometry), Affine3A::IDENTITY)
}
