//! Shader record cache.
//!
//! Binding a hit group resolves every resource into descriptor tables and
//! root arguments. Records that use the same hit group with the same uniform
//! buffers end up with identical local arguments, so the first such record
//! is remembered and later ones copy its bytes instead.
//!
//! The cache is only valid while every argument is derived from the key:
//! single-frame scenes, no loose parameters, 1 to
//! [`MAX_RECORD_CACHE_UNIFORM_BUFFERS`] uniform buffers.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};
use smallvec::SmallVec;

use crate::backend::ResourceId;

/// Upper bound on uniform buffers a cacheable binding may carry.
pub const MAX_RECORD_CACHE_UNIFORM_BUFFERS: usize = 4;

/// Hit group index plus the ordered identities of its uniform buffers.
#[derive(Debug, Clone)]
pub struct ShaderRecordCacheKey {
    shader_index: u32,
    uniform_buffers: SmallVec<[ResourceId; MAX_RECORD_CACHE_UNIFORM_BUFFERS]>,
    cached_hash: u64,
}

impl ShaderRecordCacheKey {
    /// `None` when the buffer count is outside the cacheable range.
    #[must_use]
    pub fn new(shader_index: u32, uniform_buffers: &[ResourceId]) -> Option<Self> {
        if uniform_buffers.is_empty() || uniform_buffers.len() > MAX_RECORD_CACHE_UNIFORM_BUFFERS {
            return None;
        }

        let mut hasher = FxHasher::default();
        shader_index.hash(&mut hasher);
        uniform_buffers.len().hash(&mut hasher);
        for id in uniform_buffers {
            id.hash(&mut hasher);
        }

        Some(Self {
            shader_index,
            uniform_buffers: SmallVec::from_slice(uniform_buffers),
            cached_hash: hasher.finish(),
        })
    }

    #[inline]
    #[must_use]
    pub fn shader_index(&self) -> u32 {
        self.shader_index
    }
}

impl PartialEq for ShaderRecordCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.cached_hash == other.cached_hash
            && self.shader_index == other.shader_index
            && self.uniform_buffers == other.uniform_buffers
    }
}

impl Eq for ShaderRecordCacheKey {}

impl Hash for ShaderRecordCacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.cached_hash);
    }
}

/// Key to first-record map owned by one binding worker.
#[derive(Debug, Default)]
pub struct ShaderRecordCache {
    records: FxHashMap<ShaderRecordCacheKey, u32>,
}

impl ShaderRecordCache {
    /// Record previously bound with this key.
    #[inline]
    #[must_use]
    pub fn find(&self, key: &ShaderRecordCacheKey) -> Option<u32> {
        self.records.get(key).copied()
    }

    /// Remembers `record_index` as the source for `key`. Keeps the first record.
    pub fn insert(&mut self, key: ShaderRecordCacheKey, record_index: u32) {
        self.records.entry(key).or_insert(record_index);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
