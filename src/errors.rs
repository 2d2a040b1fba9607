//! Error Types
//!
//! This module defines the error types used throughout the ray tracing layer.
//!
//! # Overview
//!
//! The main error type [`RayTracingError`] covers the failures that cannot be
//! recovered locally:
//! - Backend resource creation and submission failures
//! - Invalid pipeline, geometry and shader table descriptions
//! - Acceleration structure builds rejected by the driver
//!
//! Shader compile failures and descriptor heap exhaustion are *not* errors at
//! this level. They degrade gracefully (null shader identifiers, dropped
//! bindings) and are reported through the `log` facade instead.
//!
//! # Usage
//!
//! All fallible public APIs return [`Result<T>`] which is an alias for
//! `std::result::Result<T, RayTracingError>`.
//!
//! ```rust,ignore
//! use myth_raytracing::errors::{RayTracingError, Result};
//!
//! fn create_scene() -> Result<()> {
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// The main error type for the ray tracing layer.
#[derive(Error, Debug)]
pub enum RayTracingError {
    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// The backend reported a failure that has no more specific variant.
    #[error("Ray tracing backend error: {0}")]
    BackendError(String),

    /// A GPU resource (buffer, heap, state object) could not be created.
    #[error("Failed to create {what} ({size} bytes)")]
    ResourceCreationFailed {
        /// Kind of resource being created
        what: &'static str,
        /// Requested size in bytes (or descriptor count for heaps)
        size: u64,
    },

    /// A shader collection or pipeline state object failed to compile or link.
    #[error("Shader compilation failed: {0}")]
    CompilationFailed(String),

    // ========================================================================
    // Pipeline Errors
    // ========================================================================
    /// A pipeline description is inconsistent.
    #[error("Invalid ray tracing pipeline: {0}")]
    InvalidPipeline(String),

    /// Pipelines require at least one ray generation shader.
    #[error("Ray tracing pipeline requires at least one ray generation shader")]
    MissingRayGenShader,

    /// A local root signature exceeds the per-record argument budget.
    #[error("Local root signature is {size} bytes, the maximum is {max}")]
    LocalRootSignatureTooLarge {
        /// Size of the offending root signature
        size: u32,
        /// Maximum supported local argument size
        max: u32,
    },

    // ========================================================================
    // Shader Table Errors
    // ========================================================================
    /// A shader table description is inconsistent.
    #[error("Invalid shader table: {0}")]
    InvalidShaderTable(String),

    // ========================================================================
    // Acceleration Structure Errors
    // ========================================================================
    /// Geometry validation failed.
    #[error("Invalid ray tracing geometry: {0}")]
    InvalidGeometry(String),

    /// The driver rejected an acceleration structure build.
    #[error("Acceleration structure build failed: {0}")]
    AccelerationStructureBuildFailed(String),

    /// Only single-frame scenes are supported.
    #[error("Unsupported ray tracing scene lifetime")]
    UnsupportedSceneLifetime,
}

/// Alias for `Result<T, RayTracingError>`.
pub type Result<T> = std::result::Result<T, RayTracingError>;
