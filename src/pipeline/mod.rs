//! Ray Tracing Pipelines
//!
//! A [`RayTracingPipeline`] links the single-shader collections of every
//! shader it uses into one dispatchable state object and records the
//! identifier of each exported shader.
//!
//! # Creation
//!
//! ```text
//!  shaders ─► ShaderCollectionCache::get_or_compile ─► wait for completions
//!                                                            │
//!         base pipeline? ── yes ─► link only new collections ┤ (none new: reuse base)
//!                        └─ no ──► link every collection ────┤
//!                                                            ▼
//!                            query identifiers ─► default shader tables
//! ```
//!
//! Shaders that fail to compile are left out of the link. Their identifier
//! is NULL, so any record referencing them is skipped by the GPU.
//!
//! # Default shader tables
//!
//! Every linked pipeline owns one small [`ShaderTable`] per GPU holding the
//! ray generation and miss identifiers plus a default hit group (the first
//! hit group). Dispatches that do not index hit groups per instance use it
//! instead of a scene table.

mod builtin;
mod library;

pub use builtin::{BuiltinPipelines, BuiltinShaderBlobs, BuiltinShaders};
pub use library::ShaderLibrary;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashSet;

use crate::backend::{PipelineLinkDesc, RayTracingBackend, StateObject, StateObjectHandle};
use crate::errors::{RayTracingError, Result};
use crate::identifier::ShaderIdentifier;
use crate::settings::RayTracingSettings;
use crate::shader::{
    CollectionType, CompletionEvent, MAX_ATTRIBUTE_SIZE, MAX_LOCAL_ROOT_DATA_SIZE,
    MAX_RECURSION_DEPTH, RayTracingShader, RootSignature, ShaderCollectionCache,
    ShaderCollectionEntry, ShaderFrequency,
};
use crate::shader_table::{ShaderTable, ShaderTableInitializer};
use crate::stats::{self, RayTracingStats};

/// Payload bound used when an initializer does not set one.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 24;

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a pipeline. Scenes key their shader tables by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(pub u64);

impl PipelineId {
    fn next() -> Self {
        Self(NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Description of a pipeline to create.
#[derive(Debug, Clone)]
pub struct RayTracingPipelineInitializer {
    pub ray_gen_shaders: Vec<Arc<RayTracingShader>>,
    /// Slot 0 is the default miss shader and must not bind resources.
    /// The built-in default miss shader is used when empty.
    pub miss_shaders: Vec<Arc<RayTracingShader>>,
    /// The built-in default closest hit shader is used when empty, and hit
    /// group indexing is turned off.
    pub hit_group_shaders: Vec<Arc<RayTracingShader>>,
    pub callable_shaders: Vec<Arc<RayTracingShader>>,
    pub max_payload_size: u32,
    /// Whether scene shader tables carry per-instance hit records.
    pub allow_hit_group_indexing: bool,
    /// Pipeline to extend. Only collections it does not already contain are
    /// linked.
    pub base_pipeline: Option<Arc<RayTracingPipeline>>,
    /// Compile the collections but skip linking.
    pub partial: bool,
}

impl Default for RayTracingPipelineInitializer {
    fn default() -> Self {
        Self {
            ray_gen_shaders: Vec::new(),
            miss_shaders: Vec::new(),
            hit_group_shaders: Vec::new(),
            callable_shaders: Vec::new(),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            allow_hit_group_indexing: true,
            base_pipeline: None,
            partial: false,
        }
    }
}

/// Device services pipeline creation draws on.
pub(crate) struct PipelineContext<'a> {
    pub backend: &'a Arc<dyn RayTracingBackend>,
    pub collection_cache: &'a ShaderCollectionCache,
    pub stats: &'a Arc<RayTracingStats>,
    pub builtin_shaders: &'a BuiltinShaders,
    pub settings: &'a RayTracingSettings,
}

/// A linked ray tracing pipeline.
#[derive(Debug)]
pub struct RayTracingPipeline {
    id: PipelineId,
    ray_gen: ShaderLibrary,
    miss: ShaderLibrary,
    hit_group: ShaderLibrary,
    callable: ShaderLibrary,
    global_root_signature: Arc<RootSignature>,
    state_object: Option<Arc<StateObject>>,
    /// Every collection linked into `state_object`, base pipeline's included.
    unique_collections: Vec<Arc<ShaderCollectionEntry>>,
    max_payload_size: u32,
    allow_hit_group_indexing: bool,
    max_local_root_signature_size: u32,
    max_view_descriptors_per_record: u32,
    default_shader_tables: Vec<Mutex<ShaderTable>>,
    compile_time: Duration,
    link_time: Duration,
    collection_cache_hits: u32,
}

fn check_frequency(shaders: &[Arc<RayTracingShader>], expected: ShaderFrequency) -> Result<()> {
    match shaders.iter().find(|shader| shader.frequency() != expected) {
        Some(shader) => Err(RayTracingError::InvalidPipeline(format!(
            "shader '{}' is a {:?} shader but was passed as {expected:?}",
            shader.name(),
            shader.frequency()
        ))),
        None => Ok(()),
    }
}

/// Ray generation and miss shaders bind through the pipeline's global root
/// signature. Shaders that bind nothing fit any global signature.
fn uses_global_root_signature(shader: &RayTracingShader, global: &RootSignature) -> bool {
    let signature = shader.root_signature();
    signature.id() == global.id() || signature.parameters().is_empty()
}

impl RayTracingPipeline {
    pub(crate) fn create(
        ctx: &PipelineContext<'_>,
        init: RayTracingPipelineInitializer,
    ) -> Result<Self> {
        let start = Instant::now();

        let RayTracingPipelineInitializer {
            ray_gen_shaders,
            mut miss_shaders,
            mut hit_group_shaders,
            callable_shaders,
            max_payload_size,
            mut allow_hit_group_indexing,
            base_pipeline,
            partial,
        } = init;

        if ray_gen_shaders.is_empty() {
            return Err(RayTracingError::MissingRayGenShader);
        }
        if miss_shaders.is_empty() {
            miss_shaders.push(Arc::clone(&ctx.builtin_shaders.default_miss));
        }
        if hit_group_shaders.is_empty() {
            hit_group_shaders.push(Arc::clone(&ctx.builtin_shaders.default_closest_hit));
            allow_hit_group_indexing = false;
        }

        check_frequency(&ray_gen_shaders, ShaderFrequency::RayGen)?;
        check_frequency(&miss_shaders, ShaderFrequency::Miss)?;
        check_frequency(&hit_group_shaders, ShaderFrequency::HitGroup)?;
        check_frequency(&callable_shaders, ShaderFrequency::Callable)?;

        // --- Root signatures ---

        let global_root_signature = Arc::clone(ray_gen_shaders[0].root_signature());
        if let Some(shader) = ray_gen_shaders
            .iter()
            .chain(&miss_shaders)
            .find(|shader| !uses_global_root_signature(shader, &global_root_signature))
        {
            return Err(RayTracingError::InvalidPipeline(format!(
                "shader '{}' does not use the pipeline's global root signature",
                shader.name()
            )));
        }
        if !miss_shaders[0].resource_counts().is_empty() {
            return Err(RayTracingError::InvalidPipeline(format!(
                "miss shader slot 0 ('{}') is the default miss shader and must not bind resources",
                miss_shaders[0].name()
            )));
        }

        if let Some(base) = &base_pipeline {
            if base.is_partial() {
                return Err(RayTracingError::InvalidPipeline(
                    "a partial pipeline cannot be used as a base pipeline".into(),
                ));
            }
            if base.global_root_signature.id() != global_root_signature.id()
                || base.max_payload_size != max_payload_size
            {
                return Err(RayTracingError::InvalidPipeline(
                    "base pipeline uses a different global root signature or payload size".into(),
                ));
            }
        }

        let mut max_local_root_signature_size = 0;
        let mut max_view_descriptors_per_record = 0;
        for shader in hit_group_shaders.iter().chain(&callable_shaders) {
            max_local_root_signature_size = max_local_root_signature_size
                .max(shader.root_signature().total_size_in_bytes());
            max_view_descriptors_per_record =
                max_view_descriptors_per_record.max(shader.resource_counts().view_descriptors());
        }
        if max_local_root_signature_size > MAX_LOCAL_ROOT_DATA_SIZE {
            return Err(RayTracingError::LocalRootSignatureTooLarge {
                size: max_local_root_signature_size,
                max: MAX_LOCAL_ROOT_DATA_SIZE,
            });
        }

        // --- Collections ---

        let compile_start = Instant::now();
        let mut completions: Vec<CompletionEvent> = Vec::new();
        let mut seen_exports: FxHashSet<String> = FxHashSet::default();
        let mut collection_cache_hits = 0u32;

        let mut request = |shaders: &[Arc<RayTracingShader>], collection_type: CollectionType| {
            shaders
                .iter()
                .map(|shader| {
                    let request = ctx.collection_cache.get_or_compile(
                        shader,
                        &global_root_signature,
                        max_payload_size,
                        collection_type,
                    );
                    let first_use = seen_exports.insert(request.entry.primary_export_name().to_owned());
                    if first_use && request.cache_hit {
                        collection_cache_hits += 1;
                    }
                    completions.extend(request.completion);
                    request.entry
                })
                .collect::<Vec<_>>()
        };

        let ray_gen_entries = request(&ray_gen_shaders, CollectionType::RayGen);
        let miss_entries = request(&miss_shaders, CollectionType::Miss);
        let hit_group_entries = request(&hit_group_shaders, CollectionType::HitGroup);
        let callable_entries = request(&callable_shaders, CollectionType::Callable);

        CompletionEvent::wait_all(completions.iter());
        let compile_time = compile_start.elapsed();

        let mut ray_gen = ShaderLibrary::new(ray_gen_shaders, ray_gen_entries);
        let mut miss = ShaderLibrary::new(miss_shaders, miss_entries);
        let mut hit_group = ShaderLibrary::new(hit_group_shaders, hit_group_entries);
        let mut callable = ShaderLibrary::new(callable_shaders, callable_entries);

        // --- Link ---

        let mut unique_collections: Vec<Arc<ShaderCollectionEntry>> = base_pipeline
            .as_ref()
            .map(|base| base.unique_collections.clone())
            .unwrap_or_default();
        let mut linked_exports: FxHashSet<&str> = unique_collections
            .iter()
            .map(|entry| entry.primary_export_name())
            .collect();

        let mut new_collections: Vec<Arc<ShaderCollectionEntry>> = Vec::new();
        for entry in ray_gen
            .entries()
            .iter()
            .chain(miss.entries())
            .chain(hit_group.entries())
            .chain(callable.entries())
        {
            if entry.state_object().is_none() {
                continue;
            }
            if linked_exports.insert(entry.primary_export_name()) {
                new_collections.push(Arc::clone(entry));
            }
        }
        drop(linked_exports);

        let link_start = Instant::now();
        let state_object = if partial {
            None
        } else {
            match base_pipeline.as_ref().and_then(|base| base.state_object.as_ref()) {
                Some(base_object) if new_collections.is_empty() => {
                    log::debug!("Pipeline extension adds no collections, reusing base pipeline");
                    Some(Arc::clone(base_object))
                }
                base_object => {
                    let handles: Vec<StateObjectHandle> = new_collections
                        .iter()
                        .filter_map(|entry| entry.state_object().map(StateObject::handle))
                        .collect();
                    let handle = ctx.backend.link_pipeline(&PipelineLinkDesc {
                        collections: &handles,
                        base: base_object.map(|object| object.handle()),
                        global_root_signature: &global_root_signature,
                        max_payload_size,
                        max_attribute_size: MAX_ATTRIBUTE_SIZE,
                        max_recursion_depth: MAX_RECURSION_DEPTH,
                    })?;
                    stats::add(&ctx.stats.linked_pipelines, 1);
                    Some(Arc::new(StateObject::from_handle(ctx.backend, handle)))
                }
            }
        };
        let link_time = link_start.elapsed();
        unique_collections.extend(new_collections);

        // --- Identifiers ---

        if let Some(state_object) = &state_object {
            for library in [&mut ray_gen, &mut miss, &mut hit_group, &mut callable] {
                let identifiers = query_identifiers(state_object, library);
                library.set_identifiers(identifiers);
            }
        }

        let default_shader_tables = match &state_object {
            Some(_) => (0..ctx.backend.num_gpus())
                .map(|gpu_index| {
                    create_default_shader_table(ctx.backend, &ray_gen, &miss, &hit_group, gpu_index)
                        .map(Mutex::new)
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        stats::add(&ctx.stats.created_pipelines, 1);

        let pipeline = Self {
            id: PipelineId::next(),
            ray_gen,
            miss,
            hit_group,
            callable,
            global_root_signature,
            state_object,
            unique_collections,
            max_payload_size,
            allow_hit_group_indexing,
            max_local_root_signature_size,
            max_view_descriptors_per_record,
            default_shader_tables,
            compile_time,
            link_time,
            collection_cache_hits,
        };

        let total_ms = start.elapsed().as_secs_f32() * 1000.0;
        if total_ms > ctx.settings.slow_pipeline_warning_ms {
            log::info!(
                "Ray tracing pipeline {:?} created in {total_ms:.2} ms (compile {:.2} ms, link {:.2} ms): \
                 {} ray gen, {} miss, {} hit group, {} callable shaders, {}/{} collections from cache",
                pipeline.id,
                pipeline.compile_time.as_secs_f32() * 1000.0,
                pipeline.link_time.as_secs_f32() * 1000.0,
                pipeline.ray_gen.len(),
                pipeline.miss.len(),
                pipeline.hit_group.len(),
                pipeline.callable.len(),
                pipeline.collection_cache_hits,
                pipeline.unique_collections.len(),
            );
        }

        Ok(pipeline)
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> PipelineId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn ray_gen_shaders(&self) -> &ShaderLibrary {
        &self.ray_gen
    }

    #[inline]
    #[must_use]
    pub fn miss_shaders(&self) -> &ShaderLibrary {
        &self.miss
    }

    #[inline]
    #[must_use]
    pub fn hit_group_shaders(&self) -> &ShaderLibrary {
        &self.hit_group
    }

    #[inline]
    #[must_use]
    pub fn callable_shaders(&self) -> &ShaderLibrary {
        &self.callable
    }

    #[inline]
    #[must_use]
    pub fn global_root_signature(&self) -> &Arc<RootSignature> {
        &self.global_root_signature
    }

    /// The linked state object. `None` for partial pipelines.
    #[inline]
    #[must_use]
    pub fn state_object(&self) -> Option<&Arc<StateObject>> {
        self.state_object.as_ref()
    }

    /// Compiled but never linked. Cannot be dispatched.
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.state_object.is_none()
    }

    #[inline]
    #[must_use]
    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    #[inline]
    #[must_use]
    pub fn allow_hit_group_indexing(&self) -> bool {
        self.allow_hit_group_indexing
    }

    /// Largest local argument block of any hit group or callable shader.
    #[inline]
    #[must_use]
    pub fn max_local_root_signature_size(&self) -> u32 {
        self.max_local_root_signature_size
    }

    #[inline]
    #[must_use]
    pub fn max_view_descriptors_per_record(&self) -> u32 {
        self.max_view_descriptors_per_record
    }

    /// Collections linked into this pipeline, base pipeline's included.
    #[inline]
    #[must_use]
    pub fn unique_collections(&self) -> &[Arc<ShaderCollectionEntry>] {
        &self.unique_collections
    }

    /// Collections that came out of the cache instead of being compiled.
    #[inline]
    #[must_use]
    pub fn collection_cache_hits(&self) -> u32 {
        self.collection_cache_hits
    }

    #[inline]
    #[must_use]
    pub fn compile_time(&self) -> Duration {
        self.compile_time
    }

    #[inline]
    #[must_use]
    pub fn link_time(&self) -> Duration {
        self.link_time
    }

    /// The identifier-only shader table of `gpu_index`.
    ///
    /// # Panics
    ///
    /// For partial pipelines, which have no default tables.
    pub fn default_shader_table(&self, gpu_index: u32) -> MutexGuard<'_, ShaderTable> {
        assert!(
            !self.is_partial(),
            "partial ray tracing pipelines have no default shader table"
        );
        self.default_shader_tables[gpu_index as usize].lock()
    }
}

fn query_identifiers(state_object: &StateObject, library: &ShaderLibrary) -> Vec<ShaderIdentifier> {
    library
        .entries()
        .iter()
        .map(|entry| {
            if entry.failed() {
                log::warn!(
                    "Ray tracing shader '{}' failed to compile; its records use a NULL identifier",
                    entry.shader().name()
                );
                return ShaderIdentifier::NULL;
            }
            state_object
                .shader_identifier(entry.primary_export_name())
                .unwrap_or_else(|| {
                    log::warn!(
                        "Linked pipeline does not export '{}' (shader '{}')",
                        entry.primary_export_name(),
                        entry.shader().name()
                    );
                    ShaderIdentifier::NULL
                })
        })
        .collect()
}

fn create_default_shader_table(
    backend: &Arc<dyn RayTracingBackend>,
    ray_gen: &ShaderLibrary,
    miss: &ShaderLibrary,
    hit_group: &ShaderLibrary,
    gpu_index: u32,
) -> Result<ShaderTable> {
    let init = ShaderTableInitializer {
        num_ray_gen_records: ray_gen.len() as u32,
        num_miss_records: miss.len() as u32,
        ..Default::default()
    };
    let mut table = ShaderTable::new(backend, &init, gpu_index, None)?;
    table.set_ray_gen_identifiers(ray_gen.identifiers());
    table.set_miss_identifiers(miss.identifiers());
    table.set_default_hit_group_identifier(&hit_group.identifier(0));
    Ok(table)
}
