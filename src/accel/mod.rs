//! Acceleration Structures
//!
//! Bottom-level structures ([`RayTracingGeometry`]) are built per mesh and
//! may be refit or compacted. Top-level structures are owned by a
//! [`RayTracingScene`], rebuilt from scratch whenever the scene is built.
//!
//! # BLAS lifecycle
//!
//! ```text
//!            build            fence passed
//!  Dirty ──────────► Building ───────────► Ready
//!    ▲                  │
//!    │                  │ compaction eligible, fence passed
//!    │                  ▼
//!    │        ReadyPendingCompaction ──────► Compacted
//!    │                        compact copy       │
//!    └───────────── mark_dirty / update ─────────┘
//! ```

mod flags;
mod geometry;
mod scene;

pub use flags::{BuildFlags, GeometryFlags, InstanceFlags};
pub use geometry::{
    AccelerationStructureUpdate, BlasState, GeometrySegment, GeometryType, IndexBuffer,
    RayTracingGeometry, RayTracingGeometryInitializer, VertexFormat,
};
pub use scene::{
    InstanceTransforms, RayTracingGeometryInstance, RayTracingInstanceDesc, RayTracingScene,
    RayTracingSceneInitializer, SceneLifetime,
};

use crate::backend::GpuAddress;

/// Required alignment of acceleration structure result buffers.
pub const ACCELERATION_STRUCTURE_ALIGNMENT: u64 = 256;

/// Required alignment of scratch buffers.
pub const SCRATCH_ALIGNMENT: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationStructureKind {
    BottomLevel,
    TopLevel,
}

/// Triangle geometry as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct TrianglesDesc {
    pub flags: GeometryFlags,
    pub vertex_buffer: GpuAddress,
    pub vertex_stride: u64,
    pub vertex_count: u32,
    pub vertex_format: VertexFormat,
    /// Zero for non-indexed geometry.
    pub index_buffer: GpuAddress,
    /// 0 (non-indexed), 2 or 4.
    pub index_stride: u32,
    pub index_count: u32,
}

/// Procedural (AABB) geometry as seen by the driver.
#[derive(Debug, Clone, PartialEq)]
pub struct AabbsDesc {
    pub flags: GeometryFlags,
    pub aabbs: GpuAddress,
    pub stride: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeometryDesc {
    Triangles(TrianglesDesc),
    Procedural(AabbsDesc),
}

impl GeometryDesc {
    #[must_use]
    pub fn primitive_count(&self) -> u64 {
        match self {
            Self::Triangles(t) if t.index_stride == 0 => u64::from(t.vertex_count) / 3,
            Self::Triangles(t) => u64::from(t.index_count) / 3,
            Self::Procedural(a) => a.count,
        }
    }
}

/// Build inputs for one acceleration structure.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationStructureInputs {
    pub kind: AccelerationStructureKind,
    pub flags: BuildFlags,
    /// Bottom-level only.
    pub geometries: Vec<GeometryDesc>,
    /// Top-level only.
    pub num_instances: u32,
    /// Top-level only: address of the instance description array.
    pub instance_descs: GpuAddress,
}

impl AccelerationStructureInputs {
    #[must_use]
    pub fn bottom_level(flags: BuildFlags, geometries: Vec<GeometryDesc>) -> Self {
        Self {
            kind: AccelerationStructureKind::BottomLevel,
            flags,
            geometries,
            num_instances: 0,
            instance_descs: 0,
        }
    }

    #[must_use]
    pub fn top_level(flags: BuildFlags, num_instances: u32, instance_descs: GpuAddress) -> Self {
        Self {
            kind: AccelerationStructureKind::TopLevel,
            flags,
            geometries: Vec::new(),
            num_instances,
            instance_descs,
        }
    }

    /// Primitives (BLAS) or instances (TLAS) covered by the build.
    #[must_use]
    pub fn primitive_count(&self) -> u64 {
        match self.kind {
            AccelerationStructureKind::BottomLevel => {
                self.geometries.iter().map(GeometryDesc::primitive_count).sum()
            }
            AccelerationStructureKind::TopLevel => u64::from(self.num_instances),
        }
    }
}

/// Driver-reported memory requirements of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrebuildInfo {
    pub result_size: u64,
    pub scratch_size: u64,
    pub update_scratch_size: u64,
}

/// A recorded acceleration structure build.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelerationStructureBuild {
    pub inputs: AccelerationStructureInputs,
    pub dest: GpuAddress,
    pub scratch: GpuAddress,
    /// Previous result when refitting. Equal to `dest` for in-place updates.
    pub source: Option<GpuAddress>,
}

#[inline]
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
