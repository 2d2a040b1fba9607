//! Shader Collection Cache
//!
//! Deduplicates compiled single-shader collections across every pipeline
//! created on a device.
//!
//! # Keying
//!
//! Entries are keyed by [`CollectionKey`]: the shader's content hash, the
//! payload size bound and the identities of the global and local root
//! signatures. Ray generation and miss collections always use the empty local
//! signature; hit groups and callable shaders use their own.
//!
//! # Concurrency
//!
//! ```text
//!  thread A ─ read lock ─ miss ─ write lock ─ insert entry + event ─┐
//!                                                                   ├─► compile pool ─► signal
//!  thread B ─ read lock ─ hit (entry pending) ─ wait on event ◄─────┘
//! ```
//!
//! Lookups take the shared lock. The thread that wins the race to insert a
//! missing key installs the entry together with its [`CompletionEvent`] and
//! queues the compile; every other requester gets the same entry and waits on
//! that event. A shader is therefore compiled at most once per key.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::{SmallVec, smallvec};

use super::compile::{CompileJob, CompilePool, CompletionEvent};
use super::{
    MAX_ATTRIBUTE_SIZE, MAX_RECURSION_DEPTH, RayTracingShader, RootSignature, RootSignatureId,
    RootSignatureKind,
};
use crate::backend::{
    CollectionDesc, ExportRename, HitGroupDesc, HitGroupKind, RayTracingBackend, StateObject,
};
use crate::identifier::ShaderIdentifier;
use crate::stats::{self, RayTracingStats};

/// Role a shader plays inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionType {
    RayGen,
    Miss,
    HitGroup,
    Callable,
}

impl CollectionType {
    /// Prefix of the primary export name.
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::RayGen => "RayGen",
            Self::Miss => "Miss",
            Self::HitGroup => "HitGroup",
            Self::Callable => "Callable",
        }
    }

    #[must_use]
    pub fn uses_local_root_signature(self) -> bool {
        matches!(self, Self::HitGroup | Self::Callable)
    }
}

/// Export name for a shader hash, e.g. `HitGroup_00000000deadbeef`.
#[must_use]
pub(crate) fn export_name(prefix: &str, hash: u64) -> String {
    format!("{prefix}_{hash:016x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub shader_hash: u64,
    pub max_payload_size: u32,
    pub global_root_signature: RootSignatureId,
    pub local_root_signature: RootSignatureId,
}

// ─── Entry ───────────────────────────────────────────────────────────────────

/// A cached collection. Shared by every pipeline that uses the shader.
#[derive(Debug)]
pub struct ShaderCollectionEntry {
    key: CollectionKey,
    collection_type: CollectionType,
    shader: Arc<RayTracingShader>,
    local_root_signature: Arc<RootSignature>,
    /// Primary export first, then renamed hit group entry points.
    export_names: SmallVec<[String; 4]>,
    state_object: OnceLock<Option<StateObject>>,
    identifier: OnceLock<ShaderIdentifier>,
    completion: CompletionEvent,
    compile_time_us: AtomicU64,
}

impl ShaderCollectionEntry {
    fn new(
        key: CollectionKey,
        collection_type: CollectionType,
        shader: Arc<RayTracingShader>,
        local_root_signature: Arc<RootSignature>,
    ) -> Self {
        let hash = shader.hash();
        let mut export_names: SmallVec<[String; 4]> =
            smallvec![export_name(collection_type.prefix(), hash)];
        if collection_type == CollectionType::HitGroup {
            export_names.push(export_name("CHS", hash));
            if shader.any_hit_entry_point().is_some() {
                export_names.push(export_name("AHS", hash));
            }
            if shader.intersection_entry_point().is_some() {
                export_names.push(export_name("IS", hash));
            }
        }

        Self {
            key,
            collection_type,
            shader,
            local_root_signature,
            export_names,
            state_object: OnceLock::new(),
            identifier: OnceLock::new(),
            completion: CompletionEvent::new(),
            compile_time_us: AtomicU64::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> &CollectionKey {
        &self.key
    }

    #[inline]
    #[must_use]
    pub fn collection_type(&self) -> CollectionType {
        self.collection_type
    }

    #[inline]
    #[must_use]
    pub fn shader(&self) -> &Arc<RayTracingShader> {
        &self.shader
    }

    #[inline]
    #[must_use]
    pub fn local_root_signature(&self) -> &Arc<RootSignature> {
        &self.local_root_signature
    }

    /// Name under which the shader (or hit group) is exported.
    #[inline]
    #[must_use]
    pub fn primary_export_name(&self) -> &str {
        &self.export_names[0]
    }

    #[inline]
    #[must_use]
    pub fn export_names(&self) -> &[String] {
        &self.export_names
    }

    #[inline]
    #[must_use]
    pub fn completion(&self) -> &CompletionEvent {
        &self.completion
    }

    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completion.is_complete()
    }

    /// The compiled collection. `None` while compiling or after a failure.
    #[must_use]
    pub fn state_object(&self) -> Option<&StateObject> {
        self.state_object.get().and_then(Option::as_ref)
    }

    /// `true` once compilation finished without producing a collection.
    #[must_use]
    pub fn failed(&self) -> bool {
        matches!(self.state_object.get(), Some(None))
    }

    /// Identifier queried at load time. Only set for precompiled shaders.
    #[must_use]
    pub fn identifier(&self) -> Option<ShaderIdentifier> {
        self.identifier.get().copied()
    }

    #[must_use]
    pub fn compile_time(&self) -> Duration {
        Duration::from_micros(self.compile_time_us.load(Ordering::Relaxed))
    }

    fn hit_group_kind(&self) -> HitGroupKind {
        if self.shader.intersection_entry_point().is_some() {
            HitGroupKind::Procedural
        } else {
            HitGroupKind::Triangles
        }
    }

    pub(crate) fn compile(&self, backend: &Arc<dyn RayTracingBackend>, global_root_signature: &RootSignature) {
        let shader = &self.shader;
        let mut exports: SmallVec<[ExportRename; 3]> = SmallVec::new();
        let mut hit_group = None;

        if self.collection_type == CollectionType::HitGroup {
            let mut names = self.export_names[1..].iter();
            let mut rename = |entry_point: &str| {
                let export_name = names.next().cloned().unwrap_or_default();
                exports.push(ExportRename {
                    export_name: export_name.clone(),
                    entry_point: entry_point.to_owned(),
                });
                export_name
            };
            let closest_hit = rename(shader.entry_point());
            let any_hit = shader.any_hit_entry_point().map(&mut rename);
            let intersection = shader.intersection_entry_point().map(&mut rename);
            hit_group = Some(HitGroupDesc {
                export_name: self.primary_export_name().to_owned(),
                closest_hit: Some(closest_hit),
                any_hit,
                intersection,
                kind: self.hit_group_kind(),
            });
        } else {
            exports.push(ExportRename {
                export_name: self.primary_export_name().to_owned(),
                entry_point: shader.entry_point().to_owned(),
            });
        }

        let desc = CollectionDesc {
            debug_name: shader.name(),
            bytecode: shader.code().bytes(),
            exports: &exports,
            hit_group: hit_group.as_ref(),
            global_root_signature,
            local_root_signature: &self.local_root_signature,
            max_payload_size: self.key.max_payload_size,
            max_attribute_size: MAX_ATTRIBUTE_SIZE,
            max_recursion_depth: MAX_RECURSION_DEPTH,
        };

        let state_object = match backend.create_collection(&desc) {
            Ok(handle) => Some(StateObject::from_handle(backend, handle)),
            Err(e) => {
                log::error!(
                    "Failed to compile ray tracing shader '{}' ({}): {e}",
                    shader.name(),
                    self.primary_export_name()
                );
                None
            }
        };
        let _ = self.state_object.set(state_object);
    }

    fn load_precompiled(&self, backend: &Arc<dyn RayTracingBackend>) {
        let exports = self.export_names.to_vec();
        let state_object = match backend.deserialize_collection(self.shader.code().bytes(), &exports) {
            Ok(handle) => {
                let state_object = StateObject::from_handle(backend, handle);
                let identifier = state_object
                    .shader_identifier(self.primary_export_name())
                    .unwrap_or(ShaderIdentifier::NULL);
                let _ = self.identifier.set(identifier);
                Some(state_object)
            }
            Err(e) => {
                log::error!(
                    "Failed to load precompiled ray tracing shader '{}': {e}",
                    self.shader.name()
                );
                None
            }
        };
        let _ = self.state_object.set(state_object);
    }

    pub(crate) fn finish(&self, elapsed: Duration) {
        self.compile_time_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.completion.signal();
    }
}

/// Result of [`ShaderCollectionCache::get_or_compile`].
#[derive(Debug, Clone)]
pub struct CollectionRequest {
    pub entry: Arc<ShaderCollectionEntry>,
    pub cache_hit: bool,
    /// Event to wait on before using the entry. `None` when already complete.
    pub completion: Option<CompletionEvent>,
}

// ─── Cache ───────────────────────────────────────────────────────────────────

/// Device-wide cache of compiled shader collections.
pub struct ShaderCollectionCache {
    backend: Arc<dyn RayTracingBackend>,
    stats: Arc<RayTracingStats>,
    entries: RwLock<FxHashMap<CollectionKey, Arc<ShaderCollectionEntry>>>,
    default_local_root_signature: Arc<RootSignature>,
    pool: CompilePool,
}

impl ShaderCollectionCache {
    #[must_use]
    pub fn new(
        backend: Arc<dyn RayTracingBackend>,
        stats: Arc<RayTracingStats>,
        compile_threads: usize,
    ) -> Self {
        let pool = CompilePool::new(compile_threads, Arc::clone(&backend), Arc::clone(&stats));
        Self {
            backend,
            stats,
            entries: RwLock::new(FxHashMap::default()),
            default_local_root_signature: Arc::new(RootSignature::empty(RootSignatureKind::Local)),
            pool,
        }
    }

    /// Looks up or starts compiling the collection for `shader`.
    ///
    /// The returned entry may still be compiling; wait on
    /// [`CollectionRequest::completion`] before reading its state object.
    pub fn get_or_compile(
        &self,
        shader: &Arc<RayTracingShader>,
        global_root_signature: &Arc<RootSignature>,
        max_payload_size: u32,
        collection_type: CollectionType,
    ) -> CollectionRequest {
        let local_root_signature = if collection_type.uses_local_root_signature() {
            Arc::clone(shader.root_signature())
        } else {
            Arc::clone(&self.default_local_root_signature)
        };
        let key = CollectionKey {
            shader_hash: shader.hash(),
            max_payload_size,
            global_root_signature: global_root_signature.id(),
            local_root_signature: local_root_signature.id(),
        };

        if let Some(entry) = self.entries.read().get(&key) {
            return self.cache_hit(Arc::clone(entry));
        }

        let (entry, inserted) = {
            let mut entries = self.entries.write();
            match entries.entry(key) {
                Entry::Occupied(occupied) => (Arc::clone(occupied.get()), false),
                Entry::Vacant(vacant) => {
                    let entry = Arc::new(ShaderCollectionEntry::new(
                        key,
                        collection_type,
                        Arc::clone(shader),
                        local_root_signature,
                    ));
                    (Arc::clone(vacant.insert(entry)), true)
                }
            }
        };
        if !inserted {
            return self.cache_hit(entry);
        }

        if shader.code().is_precompiled() {
            let start = Instant::now();
            entry.load_precompiled(&self.backend);
            stats::add(&self.stats.created_collections, 1);
            entry.finish(start.elapsed());
        } else {
            self.pool.submit(CompileJob {
                entry: Arc::clone(&entry),
                global_root_signature: Arc::clone(global_root_signature),
            });
        }

        let completion = (!entry.is_complete()).then(|| entry.completion().clone());
        CollectionRequest {
            entry,
            cache_hit: false,
            completion,
        }
    }

    fn cache_hit(&self, entry: Arc<ShaderCollectionEntry>) -> CollectionRequest {
        stats::add(&self.stats.collection_cache_hits, 1);
        let completion = (!entry.is_complete()).then(|| entry.completion().clone());
        CollectionRequest {
            entry,
            cache_hit: true,
            completion,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drops every cached collection after waiting for pending compiles.
    ///
    /// Pipelines keep their own references, so live pipelines stay valid.
    pub fn reset(&self) {
        let entries = std::mem::take(&mut *self.entries.write());
        CompletionEvent::wait_all(entries.values().map(|e| e.completion()));
        if !entries.is_empty() {
            log::info!("Ray tracing collection cache reset ({} entries)", entries.len());
        }
    }
}

impl std::fmt::Debug for ShaderCollectionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderCollectionCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}
