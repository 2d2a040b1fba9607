use std::mem::{offset_of, size_of};

use bytemuck::{Pod, Zeroable};

/// Root constants every hit group receives.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HitGroupSystemRootConstants {
    /// Index stride in the low 8 bits, vertex stride above.
    pub config: u32,
    pub index_buffer_offset_in_bytes: u32,
    /// Per-instance user data, readable by hit shaders.
    pub user_data: u32,
    /// First native instance of the owning scene instance.
    pub base_instance_index: u32,
}

impl HitGroupSystemRootConstants {
    pub fn set_vertex_and_index_stride(&mut self, vertex_stride: u32, index_stride: u32) {
        debug_assert!(index_stride <= 0xFF);
        debug_assert!(vertex_stride <= 0x00FF_FFFF);
        self.config = (index_stride & 0xFF) | (vertex_stride << 8);
    }

    #[inline]
    #[must_use]
    pub fn index_stride(&self) -> u32 {
        self.config & 0xFF
    }

    #[inline]
    #[must_use]
    pub fn vertex_stride(&self) -> u32 {
        self.config >> 8
    }
}

/// Leading local arguments of every hit group record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HitGroupSystemParameters {
    pub index_buffer: u64,
    pub vertex_buffer: u64,
    pub root_constants: HitGroupSystemRootConstants,
}

/// Bytes occupied by [`HitGroupSystemParameters`].
pub const HIT_GROUP_SYSTEM_PARAMETERS_SIZE: u32 = size_of::<HitGroupSystemParameters>() as u32;

/// Offset of the user data word inside the local arguments.
pub const HIT_GROUP_USER_DATA_OFFSET: u32 = (offset_of!(HitGroupSystemParameters, root_constants)
    + offset_of!(HitGroupSystemRootConstants, user_data)) as u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_local_root_signature() {
        assert_eq!(HIT_GROUP_SYSTEM_PARAMETERS_SIZE, 32);
        assert_eq!(HIT_GROUP_USER_DATA_OFFSET, 24);
    }

    #[test]
    fn strides_pack_into_config() {
        let mut constants = HitGroupSystemRootConstants::default();
        constants.set_vertex_and_index_stride(12, 4);
        assert_eq!(constants.index_stride(), 4);
        assert_eq!(constants.vertex_stride(), 12);
    }
}
