use std::sync::Arc;

use crate::identifier::ShaderIdentifier;
use crate::shader::{RayTracingShader, ShaderCollectionEntry};

/// Shaders of one frequency inside a pipeline, in slot order.
///
/// Slot `i` of the pipeline's shader array maps to `shaders[i]`, its cache
/// entry and its identifier in the linked pipeline.
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    shaders: Vec<Arc<RayTracingShader>>,
    entries: Vec<Arc<ShaderCollectionEntry>>,
    identifiers: Vec<ShaderIdentifier>,
}

impl ShaderLibrary {
    pub(crate) fn new(
        shaders: Vec<Arc<RayTracingShader>>,
        entries: Vec<Arc<ShaderCollectionEntry>>,
    ) -> Self {
        debug_assert_eq!(shaders.len(), entries.len());
        let identifiers = vec![ShaderIdentifier::INVALID; shaders.len()];
        Self {
            shaders,
            entries,
            identifiers,
        }
    }

    /// Slot of the shader with content hash `hash`.
    #[must_use]
    pub fn find(&self, hash: u64) -> Option<u32> {
        self.shaders
            .iter()
            .position(|shader| shader.hash() == hash)
            .map(|index| index as u32)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.shaders.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shaders.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn shader(&self, index: u32) -> &Arc<RayTracingShader> {
        &self.shaders[index as usize]
    }

    #[inline]
    #[must_use]
    pub fn shaders(&self) -> &[Arc<RayTracingShader>] {
        &self.shaders
    }

    #[inline]
    #[must_use]
    pub fn entry(&self, index: u32) -> &Arc<ShaderCollectionEntry> {
        &self.entries[index as usize]
    }

    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[Arc<ShaderCollectionEntry>] {
        &self.entries
    }

    /// Identifier of slot `index`. NULL for shaders that failed to compile.
    #[inline]
    #[must_use]
    pub fn identifier(&self, index: u32) -> ShaderIdentifier {
        self.identifiers[index as usize]
    }

    #[inline]
    #[must_use]
    pub fn identifiers(&self) -> &[ShaderIdentifier] {
        &self.identifiers
    }

    pub(crate) fn set_identifiers(&mut self, identifiers: Vec<ShaderIdentifier>) {
        debug_assert_eq!(identifiers.len(), self.shaders.len());
        self.identifiers = identifiers;
    }
}
