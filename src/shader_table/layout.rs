//! Shader table layout math.
//!
//! Pure functions of the initializer: no allocation, no GPU state.
//!
//! ```text
//! ┌────────────┬─────────────┬─────────────┬──────────────┬─────────────┐
//! │ ray gen    │ default hit │ hit groups  │ callables    │ miss        │
//! │ 64 B each  │ identifier  │ local stride│ local stride │ local stride│
//! └────────────┴─────────────┴─────────────┴──────────────┴─────────────┘
//!  each region starts on a 64-byte boundary
//! ```
//!
//! Hit group, callable and miss records are all *local* records: a shader
//! identifier followed by up to `local_root_data_size` bytes of arguments,
//! padded to a 32-byte stride. They share one record index space
//! (hit groups first, then callables, then miss shaders); each index is
//! resolved through its own region so region padding never skews offsets.

use crate::errors::{RayTracingError, Result};
use crate::identifier::SHADER_IDENTIFIER_SIZE;
use crate::shader::MAX_LOCAL_ROOT_DATA_SIZE;

/// Alignment of every region start.
pub const SHADER_TABLE_ALIGNMENT: u32 = 64;
/// Alignment of local record strides.
pub const SHADER_RECORD_ALIGNMENT: u32 = 32;
/// Stride of ray generation records (identifier only, table aligned).
pub const RAY_GEN_RECORD_STRIDE: u32 = SHADER_TABLE_ALIGNMENT;
/// Size of the default hit group record (identifier only).
pub const DEFAULT_HIT_GROUP_RECORD_SIZE: u32 = SHADER_IDENTIFIER_SIZE as u32;

const ID_SIZE: u32 = SHADER_IDENTIFIER_SIZE as u32;

/// Record counts and local argument size of a shader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderTableInitializer {
    pub num_ray_gen_records: u32,
    pub num_miss_records: u32,
    pub num_hit_records: u32,
    pub num_callable_records: u32,
    /// Bytes of local arguments following each local record's identifier.
    pub local_root_data_size: u32,
    /// Largest number of view descriptors any one record binds.
    pub max_view_descriptors_per_record: u32,
}

/// A run of equally sized records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderTableRegion {
    pub offset: u32,
    pub stride: u32,
    pub count: u32,
}

impl ShaderTableRegion {
    /// Bytes covered by the records (without trailing alignment padding).
    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.stride * self.count
    }

    /// Byte offset of record `index`.
    #[inline]
    #[must_use]
    pub fn record_offset(&self, index: u32) -> u32 {
        assert!(
            index < self.count,
            "shader record {index} out of range (region holds {})",
            self.count
        );
        self.offset + index * self.stride
    }
}

/// Byte layout of a shader table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderTableLayout {
    pub ray_gen: ShaderTableRegion,
    pub default_hit_group: ShaderTableRegion,
    pub hit_group: ShaderTableRegion,
    pub callable: ShaderTableRegion,
    pub miss: ShaderTableRegion,
    /// Identifier plus local arguments, before stride padding.
    pub local_record_size_unaligned: u32,
    pub local_root_data_size: u32,
    pub total_size: u32,
}

#[inline]
fn align(value: u32, alignment: u32) -> u32 {
    value.next_multiple_of(alignment)
}

impl ShaderTableLayout {
    pub fn new(init: &ShaderTableInitializer) -> Result<Self> {
        if init.num_ray_gen_records == 0 {
            return Err(RayTracingError::InvalidShaderTable(
                "at least one ray generation record is required".into(),
            ));
        }
        if init.local_root_data_size > MAX_LOCAL_ROOT_DATA_SIZE {
            return Err(RayTracingError::LocalRootSignatureTooLarge {
                size: init.local_root_data_size,
                max: MAX_LOCAL_ROOT_DATA_SIZE,
            });
        }

        let local_record_size_unaligned = ID_SIZE + init.local_root_data_size;
        let local_stride = align(local_record_size_unaligned, SHADER_RECORD_ALIGNMENT);

        let mut cursor = 0u32;
        let mut region = |stride: u32, count: u32| {
            let region = ShaderTableRegion {
                offset: cursor,
                stride,
                count,
            };
            cursor = stride
                .checked_mul(count)
                .and_then(|size| cursor.checked_add(size))
                .and_then(|end| end.checked_next_multiple_of(SHADER_TABLE_ALIGNMENT))
                .ok_or_else(|| {
                    RayTracingError::InvalidShaderTable(format!(
                        "{count} records of {stride} bytes at offset {cursor} exceed the addressable table size"
                    ))
                })?;
            Ok::<_, RayTracingError>(region)
        };

        let ray_gen = region(RAY_GEN_RECORD_STRIDE, init.num_ray_gen_records)?;
        let default_hit_group = region(DEFAULT_HIT_GROUP_RECORD_SIZE, 1)?;
        let hit_group = region(local_stride, init.num_hit_records)?;
        let callable = region(local_stride, init.num_callable_records)?;
        let miss = region(local_stride, init.num_miss_records)?;

        Ok(Self {
            ray_gen,
            default_hit_group,
            hit_group,
            callable,
            miss,
            local_record_size_unaligned,
            local_root_data_size: init.local_root_data_size,
            total_size: cursor,
        })
    }

    #[inline]
    #[must_use]
    pub fn local_record_stride(&self) -> u32 {
        self.hit_group.stride
    }

    /// First local record index of the callable region.
    #[inline]
    #[must_use]
    pub fn callable_record_index_offset(&self) -> u32 {
        self.hit_group.count
    }

    /// First local record index of the miss region.
    #[inline]
    #[must_use]
    pub fn miss_record_index_offset(&self) -> u32 {
        self.hit_group.count + self.callable.count
    }

    #[inline]
    #[must_use]
    pub fn num_local_records(&self) -> u32 {
        self.hit_group.count + self.callable.count + self.miss.count
    }

    /// Byte offset of local record `record_index`.
    #[must_use]
    pub fn local_record_offset(&self, record_index: u32) -> u32 {
        let callable_start = self.callable_record_index_offset();
        let miss_start = self.miss_record_index_offset();
        assert!(
            record_index < self.num_local_records(),
            "local record {record_index} out of range ({} records)",
            self.num_local_records()
        );
        if record_index < callable_start {
            self.hit_group.record_offset(record_index)
        } else if record_index < miss_start {
            self.callable.record_offset(record_index - callable_start)
        } else {
            self.miss.record_offset(record_index - miss_start)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init(rg: u32, miss: u32, hit: u32, callable: u32, local: u32) -> ShaderTableInitializer {
        ShaderTableInitializer {
            num_ray_gen_records: rg,
            num_miss_records: miss,
            num_hit_records: hit,
            num_callable_records: callable,
            local_root_data_size: local,
            max_view_descriptors_per_record: 0,
        }
    }

    #[test]
    fn regions_follow_fixed_order_and_alignment() {
        let layout = ShaderTableLayout::new(&init(2, 1, 3, 2, 40)).unwrap();

        assert_eq!(layout.ray_gen.offset, 0);
        assert_eq!(layout.default_hit_group.offset, 128);
        assert_eq!(layout.hit_group.offset, 192);
        // 32 + 40 = 72 -> stride 96, 3 records = 288 -> next region at 512.
        assert_eq!(layout.local_record_stride(), 96);
        assert_eq!(layout.callable.offset, 512);
        assert_eq!(layout.miss.offset, 704);
        assert_eq!(layout.total_size, 832);

        for region in [layout.ray_gen, layout.default_hit_group, layout.hit_group, layout.callable, layout.miss] {
            assert_eq!(region.offset % SHADER_TABLE_ALIGNMENT, 0);
        }
    }

    #[test]
    fn local_index_space_maps_through_regions() {
        let layout = ShaderTableLayout::new(&init(1, 2, 3, 2, 40)).unwrap();
        assert_eq!(layout.callable_record_index_offset(), 3);
        assert_eq!(layout.miss_record_index_offset(), 5);
        assert_eq!(layout.num_local_records(), 7);

        assert_eq!(layout.local_record_offset(2), layout.hit_group.offset + 2 * 96);
        assert_eq!(layout.local_record_offset(3), layout.callable.offset);
        assert_eq!(layout.local_record_offset(6), layout.miss.offset + 96);
    }

    #[test]
    fn identifier_only_tables() {
        let layout = ShaderTableLayout::new(&init(1, 1, 0, 0, 0)).unwrap();
        assert_eq!(layout.local_record_stride(), 32);
        assert_eq!(layout.hit_group.size(), 0);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn rejects_missing_ray_gen_and_oversized_arguments() {
        assert!(ShaderTableLayout::new(&init(0, 1, 1, 0, 0)).is_err());
        assert!(matches!(
            ShaderTableLayout::new(&init(1, 1, 1, 0, MAX_LOCAL_ROOT_DATA_SIZE + 4)),
            Err(RayTracingError::LocalRootSignatureTooLarge { .. })
        ));
    }

    #[test]
    fn oversized_tables_are_rejected() {
        // A single region past 4 GiB.
        assert!(matches!(
            ShaderTableLayout::new(&init(1, 1, 0xFF_FFFF, 0, MAX_LOCAL_ROOT_DATA_SIZE)),
            Err(RayTracingError::InvalidShaderTable(_))
        ));
        // Two 2 GiB regions that only overflow together.
        assert!(matches!(
            ShaderTableLayout::new(&init(1, 0, 0x80_0000, 0x80_0000, 224)),
            Err(RayTracingError::InvalidShaderTable(_))
        ));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn record_index_past_end_panics() {
        let layout = ShaderTableLayout::new(&init(1, 1, 2, 0, 0)).unwrap();
        let _ = layout.local_record_offset(3);
    }
}
