//! # Myth Ray Tracing
//!
//! GPU ray tracing pipeline and shader binding table management.
//!
//! The crate sits between a renderer and a low-level GPU API. It compiles and
//! deduplicates ray tracing shaders, links them into pipelines, lays out
//! shader binding tables, builds acceleration structures, and records ray
//! dispatches with their resource bindings.
//!
//! # Modules
//!
//! - [`device`]: [`RayTracingDevice`], owner of every cache and pool
//! - [`shader`]: shaders, root signatures and the collection cache
//! - [`pipeline`]: linked pipelines and built-in pipelines
//! - [`shader_table`]: binding table layout, records and the record cache
//! - [`descriptor`]: pooled descriptor heaps and table deduplication
//! - [`accel`]: bottom-level geometry and top-level scenes
//! - [`dispatch`]: command recording, binding and dispatch
//! - [`backend`]: the GPU seam plus an in-memory [`NullBackend`]

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::too_many_arguments)]

pub mod accel;
pub mod backend;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod errors;
pub mod identifier;
pub mod pipeline;
pub mod settings;
pub mod shader;
pub mod shader_table;
pub mod stats;

pub use accel::{
    AccelerationStructureUpdate, BlasState, GeometrySegment, GeometryType, IndexBuffer,
    InstanceTransforms, RayTracingGeometry, RayTracingGeometryInitializer, RayTracingGeometryInstance,
    RayTracingScene, RayTracingSceneInitializer, SceneLifetime, VertexFormat,
};
pub use backend::{BufferView, GpuBuffer, NullBackend, RayTracingBackend, ResourceId};
pub use command::CommandList;
pub use device::RayTracingDevice;
pub use dispatch::{
    BindingSummary, BoundView, HitGroupBinding, RayTracingCommandContext, ShaderBindings, UniformBuffer,
};
pub use errors::{RayTracingError, Result};
pub use identifier::ShaderIdentifier;
pub use pipeline::{BuiltinShaderBlobs, RayTracingPipeline, RayTracingPipelineInitializer};
pub use settings::{BuildModeOverride, DescriptorDedupMode, RayTracingSettings};
pub use shader::{RayTracingShader, ShaderCollectionCache};
pub use shader_table::{ShaderTable, ShaderTableInitializer, ShaderTableLayout};
pub use stats::{RayTracingStats, RayTracingStatsSnapshot};
