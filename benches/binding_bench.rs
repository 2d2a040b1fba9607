use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use myth_raytracing::accel::IndexBuffer;
use myth_raytracing::backend::{BufferView, ResourceId};
use myth_raytracing::shader::{RayTracingShaderDesc, ShaderCode, ShaderFrequency, ShaderResourceCounts};
use myth_raytracing::{
    BuiltinShaderBlobs, HitGroupBinding, NullBackend, RayTracingDevice, RayTracingGeometryInitializer,
    RayTracingGeometryInstance, RayTracingPipelineInitializer, RayTracingSceneInitializer,
    RayTracingSettings, RayTracingShader, ShaderBindings, UniformBuffer,
};

const INSTANCES: u32 = 10_000;
const MATERIALS: u32 = 64;

fn device(parallel_binding: bool) -> RayTracingDevice {
    RayTracingDevice::new(
        Arc::new(NullBackend::new()),
        RayTracingSettings {
            parallel_binding,
            ..Default::default()
        },
        BuiltinShaderBlobs {
            occlusion_ray_gen: b"occlusion",
            intersection_ray_gen: b"intersection",
            intersection_closest_hit: b"intersection chs",
            default_closest_hit: b"default chs",
            default_miss: b"default miss",
        },
    )
    .unwrap()
}

fn shader(name: &str, frequency: ShaderFrequency, num_cbs: u32) -> Arc<RayTracingShader> {
    let mut desc = RayTracingShaderDesc::new(name, frequency, ShaderCode::Bytecode(Arc::from(name.as_bytes())));
    desc.resource_counts = ShaderResourceCounts {
        num_cbs,
        ..Default::default()
    };
    Arc::new(RayTracingShader::new(desc))
}

fn buffer(size: u64) -> BufferView {
    BufferView {
        resource: ResourceId::next(),
        address: 0x1000_0000 + ResourceId::next().0 * 0x1_0000,
        size,
    }
}

fn bench_hit_group_binding(c: &mut Criterion) {
    let mut group = c.benchmark_group("Hit Group Binding");

    for (label, parallel, record_cache) in [
        ("serial", false, true),
        ("parallel", true, true),
        ("serial, no record cache", false, false),
    ] {
        let device = device(parallel);
        let geometry = device
            .create_geometry(RayTracingGeometryInitializer::triangles(
                buffer(36),
                Some(IndexBuffer {
                    buffer: buffer(12),
                    stride: 4,
                }),
                1,
            ))
            .unwrap();
        let mut scene = device
            .create_scene(RayTracingSceneInitializer {
                debug_name: "bench".into(),
                instances: (0..INSTANCES)
                    .map(|_| RayTracingGeometryInstance::new(Arc::clone(&geometry), glam::Affine3A::IDENTITY))
                    .collect(),
                shader_slots_per_geometry_segment: 1,
                ..Default::default()
            })
            .unwrap();
        let pipeline = device
            .create_pipeline(RayTracingPipelineInitializer {
                ray_gen_shaders: vec![shader("bench rg", ShaderFrequency::RayGen, 0)],
                hit_group_shaders: (0..4)
                    .map(|i| shader(&format!("bench chs {i}"), ShaderFrequency::HitGroup, 2))
                    .collect(),
                allow_hit_group_indexing: true,
                ..Default::default()
            })
            .unwrap();

        let materials: Vec<_> = (0..MATERIALS)
            .map(|i| Arc::new(UniformBuffer::new(ResourceId::next(), 0x8000_0000 + u64::from(i) * 256)))
            .collect();
        let per_frame = Arc::new(UniformBuffer::new(ResourceId::next(), 0x9000_0000));
        let bindings: Vec<_> = (0..INSTANCES)
            .map(|i| {
                let mut b = ShaderBindings::default();
                b.set_uniform_buffer(0, Arc::clone(&per_frame));
                if record_cache {
                    b.set_uniform_buffer(1, Arc::clone(&materials[(i % MATERIALS) as usize]));
                } else {
                    // Unique buffers defeat the record cache.
                    b.set_uniform_buffer(1, Arc::new(UniformBuffer::new(ResourceId::next(), 0xA000_0000)));
                }
                HitGroupBinding {
                    instance_index: i,
                    hit_group_index: i % 4,
                    bindings: b,
                    user_data: i,
                    ..Default::default()
                }
            })
            .collect();

        group.bench_function(label, |b| {
            b.iter(|| {
                let mut ctx = device.create_command_context(0);
                ctx.clear_bindings(&mut scene);
                let summary = ctx
                    .set_hit_group_bindings(&mut scene, &pipeline, black_box(&bindings))
                    .unwrap();
                black_box(summary);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_hit_group_binding);
criterion_main!(benches);
