//! Built-in shaders and pipelines.
//!
//! The device ships with two ready-made pipelines used for batch ray
//! queries, plus the default miss and closest hit shaders substituted into
//! pipelines that do not provide their own. All of them come from
//! precompiled collections and are loaded synchronously at device start-up.
//!
//! | Pipeline       | Ray gen bindings                          | Hit group               |
//! |----------------|-------------------------------------------|-------------------------|
//! | occlusion      | SRV0 scene, SRV1 rays, UAV0 visibility    | default closest hit     |
//! | intersection   | SRV0 scene, SRV1 rays, UAV0/UAV1 hits     | intersection closest hit|

use std::sync::Arc;

use super::{PipelineContext, RayTracingPipeline, RayTracingPipelineInitializer};
use crate::errors::Result;
use crate::shader::{
    RayTracingShader, RayTracingShaderDesc, ShaderCode, ShaderFrequency, ShaderResourceCounts,
};

/// Precompiled collection blobs for the built-in shaders.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinShaderBlobs<'a> {
    pub occlusion_ray_gen: &'a [u8],
    pub intersection_ray_gen: &'a [u8],
    pub intersection_closest_hit: &'a [u8],
    pub default_closest_hit: &'a [u8],
    pub default_miss: &'a [u8],
}

/// Shaders every device provides.
#[derive(Debug, Clone)]
pub struct BuiltinShaders {
    pub occlusion_ray_gen: Arc<RayTracingShader>,
    pub intersection_ray_gen: Arc<RayTracingShader>,
    pub intersection_closest_hit: Arc<RayTracingShader>,
    pub default_closest_hit: Arc<RayTracingShader>,
    pub default_miss: Arc<RayTracingShader>,
}

fn precompiled(
    name: &str,
    frequency: ShaderFrequency,
    blob: &[u8],
    resource_counts: ShaderResourceCounts,
) -> Arc<RayTracingShader> {
    let mut desc = RayTracingShaderDesc::new(name, frequency, ShaderCode::Precompiled(Arc::from(blob)));
    desc.resource_counts = resource_counts;
    Arc::new(RayTracingShader::new(desc))
}

impl BuiltinShaders {
    #[must_use]
    pub fn from_precompiled(blobs: BuiltinShaderBlobs<'_>) -> Self {
        let ray_query = |num_uavs| ShaderResourceCounts {
            num_srvs: 2,
            num_uavs,
            ..Default::default()
        };
        Self {
            occlusion_ray_gen: precompiled(
                "OcclusionMainRG",
                ShaderFrequency::RayGen,
                blobs.occlusion_ray_gen,
                ray_query(1),
            ),
            intersection_ray_gen: precompiled(
                "IntersectionMainRG",
                ShaderFrequency::RayGen,
                blobs.intersection_ray_gen,
                ray_query(2),
            ),
            intersection_closest_hit: precompiled(
                "IntersectionMainCHS",
                ShaderFrequency::HitGroup,
                blobs.intersection_closest_hit,
                ShaderResourceCounts::default(),
            ),
            default_closest_hit: precompiled(
                "DefaultMainCHS",
                ShaderFrequency::HitGroup,
                blobs.default_closest_hit,
                ShaderResourceCounts::default(),
            ),
            default_miss: precompiled(
                "DefaultMainMS",
                ShaderFrequency::Miss,
                blobs.default_miss,
                ShaderResourceCounts::default(),
            ),
        }
    }
}

/// Pipelines created once per device.
#[derive(Debug)]
pub struct BuiltinPipelines {
    pub occlusion: Arc<RayTracingPipeline>,
    pub intersection: Arc<RayTracingPipeline>,
}

impl BuiltinPipelines {
    pub(crate) fn create(ctx: &PipelineContext<'_>) -> Result<Self> {
        let shaders = ctx.builtin_shaders;

        let occlusion = RayTracingPipeline::create(
            ctx,
            RayTracingPipelineInitializer {
                ray_gen_shaders: vec![Arc::clone(&shaders.occlusion_ray_gen)],
                miss_shaders: vec![Arc::clone(&shaders.default_miss)],
                hit_group_shaders: vec![Arc::clone(&shaders.default_closest_hit)],
                allow_hit_group_indexing: false,
                ..Default::default()
            },
        )?;

        let intersection = RayTracingPipeline::create(
            ctx,
            RayTracingPipelineInitializer {
                ray_gen_shaders: vec![Arc::clone(&shaders.intersection_ray_gen)],
                miss_shaders: vec![Arc::clone(&shaders.default_miss)],
                hit_group_shaders: vec![Arc::clone(&shaders.intersection_closest_hit)],
                allow_hit_group_indexing: false,
                ..Default::default()
            },
        )?;

        log::debug!("Built-in ray tracing pipelines created");
        Ok(Self {
            occlusion: Arc::new(occlusion),
            intersection: Arc::new(intersection),
        })
    }
}
