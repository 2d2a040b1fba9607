//! Ray Tracing Shaders
//!
//! A [`RayTracingShader`] is one compiled entry point (or hit group) plus the
//! description of the resources it binds. Shaders are compiled into
//! single-shader collections by the [`ShaderCollectionCache`] and linked into
//! pipelines later.
//!
//! # Root signatures
//!
//! Ray generation and miss shaders bind through the *global* root signature
//! (root commands on the command list). Hit groups and callable shaders bind
//! through a *local* root signature whose arguments live inside their shader
//! table record. Local layouts always start with the hit group system
//! parameters:
//!
//! ```text
//! offset  0  root SRV        index buffer address
//! offset  8  root SRV        vertex buffer address
//! offset 16  root constants  strides | index offset | user data | base instance
//! offset 32  SRV table, UAV table, sampler table, CBV 0..n
//! ```

mod collection_cache;
mod compile;
mod root_signature;

pub use collection_cache::{
    CollectionKey, CollectionRequest, CollectionType, ShaderCollectionCache, ShaderCollectionEntry,
};
pub use compile::CompletionEvent;
pub use root_signature::{
    DescriptorRangeType, RootParameter, RootSignature, RootSignatureId, RootSignatureKind,
    ShaderResourceCounts,
};

use std::sync::Arc;

use xxhash_rust::xxh3::Xxh3;

/// Largest local argument block a record may carry.
pub const MAX_LOCAL_ROOT_DATA_SIZE: u32 = 4096;

/// Bound on SRVs a single shader may declare.
pub const MAX_SRVS: u32 = 64;
/// Bound on UAVs a single shader may declare.
pub const MAX_UAVS: u32 = 16;
/// Bound on samplers a single shader may declare.
pub const MAX_SAMPLERS: u32 = 16;
/// Bound on constant buffers a single shader may declare.
pub const MAX_CBS: u32 = 16;

/// Hit attribute size used by every collection (two barycentrics).
pub const MAX_ATTRIBUTE_SIZE: u32 = 8;
/// Collections are compiled without recursion from hit shaders.
pub const MAX_RECURSION_DEPTH: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderFrequency {
    RayGen,
    Miss,
    HitGroup,
    Callable,
}

impl ShaderFrequency {
    /// Whether shaders of this frequency bind through a local root signature.
    #[inline]
    #[must_use]
    pub fn uses_local_root_signature(self) -> bool {
        matches!(self, Self::HitGroup | Self::Callable)
    }
}

/// Compiled shader code.
#[derive(Debug, Clone)]
pub enum ShaderCode {
    /// Library bytecode compiled into a collection asynchronously.
    Bytecode(Arc<[u8]>),
    /// A serialized collection, loaded synchronously.
    Precompiled(Arc<[u8]>),
}

impl ShaderCode {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Bytecode(bytes) | Self::Precompiled(bytes) => bytes,
        }
    }

    #[must_use]
    pub fn is_precompiled(&self) -> bool {
        matches!(self, Self::Precompiled(_))
    }
}

/// Construction parameters of a [`RayTracingShader`].
#[derive(Debug, Clone)]
pub struct RayTracingShaderDesc {
    pub name: String,
    pub frequency: ShaderFrequency,
    pub code: ShaderCode,
    /// Closest-hit entry for hit groups.
    pub entry_point: String,
    pub any_hit_entry_point: Option<String>,
    pub intersection_entry_point: Option<String>,
    pub resource_counts: ShaderResourceCounts,
    /// Constant buffer index receiving loose parameters, if any.
    pub loose_parameter_index: Option<u32>,
    /// Explicit root signature. Derived from `resource_counts` when `None`.
    pub root_signature: Option<Arc<RootSignature>>,
    /// Content hash. Derived from code and entry points when `None`.
    pub hash: Option<u64>,
}

impl RayTracingShaderDesc {
    #[must_use]
    pub fn new(name: impl Into<String>, frequency: ShaderFrequency, code: ShaderCode) -> Self {
        Self {
            name: name.into(),
            frequency,
            code,
            entry_point: String::from("main"),
            any_hit_entry_point: None,
            intersection_entry_point: None,
            resource_counts: ShaderResourceCounts::default(),
            loose_parameter_index: None,
            root_signature: None,
            hash: None,
        }
    }
}

/// One ray tracing shader ready to be compiled into a collection.
#[derive(Debug)]
pub struct RayTracingShader {
    name: String,
    frequency: ShaderFrequency,
    hash: u64,
    code: ShaderCode,
    entry_point: String,
    any_hit_entry_point: Option<String>,
    intersection_entry_point: Option<String>,
    resource_counts: ShaderResourceCounts,
    loose_parameter_index: Option<u32>,
    root_signature: Arc<RootSignature>,
}

impl RayTracingShader {
    #[must_use]
    pub fn new(desc: RayTracingShaderDesc) -> Self {
        let hash = desc.hash.unwrap_or_else(|| {
            let mut hasher = Xxh3::new();
            hasher.update(desc.code.bytes());
            hasher.update(desc.entry_point.as_bytes());
            for entry in [&desc.any_hit_entry_point, &desc.intersection_entry_point]
                .into_iter()
                .flatten()
            {
                hasher.update(b"|");
                hasher.update(entry.as_bytes());
            }
            hasher.digest()
        });

        let root_signature = desc.root_signature.unwrap_or_else(|| {
            let kind = if desc.frequency.uses_local_root_signature() {
                RootSignatureKind::Local
            } else {
                RootSignatureKind::Global
            };
            Arc::new(RootSignature::for_resources(kind, &desc.resource_counts))
        });

        Self {
            name: desc.name,
            frequency: desc.frequency,
            hash,
            code: desc.code,
            entry_point: desc.entry_point,
            any_hit_entry_point: desc.any_hit_entry_point,
            intersection_entry_point: desc.intersection_entry_point,
            resource_counts: desc.resource_counts,
            loose_parameter_index: desc.loose_parameter_index,
            root_signature,
        }
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    #[must_use]
    pub fn frequency(&self) -> ShaderFrequency {
        self.frequency
    }

    /// 64-bit content hash.
    #[inline]
    #[must_use]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    #[inline]
    #[must_use]
    pub fn code(&self) -> &ShaderCode {
        &self.code
    }

    #[inline]
    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    #[inline]
    #[must_use]
    pub fn any_hit_entry_point(&self) -> Option<&str> {
        self.any_hit_entry_point.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn intersection_entry_point(&self) -> Option<&str> {
        self.intersection_entry_point.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn resource_counts(&self) -> &ShaderResourceCounts {
        &self.resource_counts
    }

    #[inline]
    #[must_use]
    pub fn loose_parameter_index(&self) -> Option<u32> {
        self.loose_parameter_index
    }

    /// Global signature for ray generation and miss shaders, local signature
    /// for hit groups and callable shaders.
    #[inline]
    #[must_use]
    pub fn root_signature(&self) -> &Arc<RootSignature> {
        &self.root_signature
    }
}
