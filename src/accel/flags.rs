use bitflags::bitflags;

bitflags! {
    /// Acceleration structure build flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct BuildFlags: u32 {
        const ALLOW_UPDATE      = 1 << 0;
        const ALLOW_COMPACTION  = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
        const MINIMIZE_MEMORY   = 1 << 4;
        /// Refit from the previous result instead of building from scratch.
        const PERFORM_UPDATE    = 1 << 5;
    }
}

bitflags! {
    /// Per-segment geometry flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct GeometryFlags: u32 {
        /// Any-hit shaders are never invoked for this geometry.
        const OPAQUE                         = 1 << 0;
        const NO_DUPLICATE_ANYHIT_INVOCATION = 1 << 1;
    }
}

bitflags! {
    /// Per-instance flags packed into the TLAS instance description.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE           = 1 << 0;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 1 << 1;
        const FORCE_OPAQUE                    = 1 << 2;
        const FORCE_NON_OPAQUE                = 1 << 3;
    }
}

impl BuildFlags {
    /// Flags for a BLAS with the given preferences.
    ///
    /// Compaction is only requested for static fast-trace structures.
    #[must_use]
    pub fn for_geometry(prefer_fast_build: bool, allow_update: bool, allow_compaction: bool) -> Self {
        let mut flags = if prefer_fast_build {
            Self::PREFER_FAST_BUILD
        } else {
            Self::PREFER_FAST_TRACE
        };
        if allow_update {
            flags |= Self::ALLOW_UPDATE;
        }
        if allow_compaction && !prefer_fast_build && !allow_update {
            flags |= Self::ALLOW_COMPACTION;
        }
        flags
    }
}
