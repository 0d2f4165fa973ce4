//! Binary interface shared by the engine, both device backends and the WGSL
//! programs.
//!
//! Set indices, binding numbers and push-constant offsets here must match the
//! `@group`/`@binding` declarations in `hal/wgpu_backend/shaders/*.wgsl`
//! exactly. A mismatch is silent corruption, not a type error.

use crate::hal::{BindingDesc, BindingKind, PipelineLayoutDesc, SetLayoutDesc};

/// Pixels per tile edge
pub const TILE_SIZE: u32 = 16;
/// Invocations per workgroup for the linear passes
pub const WORKGROUP_SIZE: u32 = 256;
/// Sorted entries handled by one radix workgroup
pub const RADIX_BLOCK: u32 = 256;
/// Key bits consumed per radix pass
pub const RADIX_BITS: u32 = 2;
pub const RADIX_BUCKETS: u32 = 1 << RADIX_BITS;
/// Low key bits holding the depth
pub const DEPTH_BITS: u32 = 32;

pub const SET_FRAME: u32 = 0;
pub const SET_HANDLES: u32 = 1;
pub const SET_TRANSFORMS: u32 = 2;

/// Set 0: per-frame resources
pub mod frame {
    pub const OUTPUT_IMAGE: u32 = 0;
    pub const CAMERA: u32 = 1;
    pub const POINTS: u32 = 2;
    pub const SPLATS: u32 = 3;
    pub const TILE_COUNTS: u32 = 4;
    pub const TILE_OFFSETS: u32 = 5;
    pub const TILES_RENDERED: u32 = 6;
    pub const SORT_KEYS: u32 = 7;
    pub const SORT_VALUES: u32 = 8;
    pub const SORT_KEYS_ALT: u32 = 9;
    pub const SORT_VALUES_ALT: u32 = 10;
    pub const RADIX_BLOCKS_A: u32 = 11;
    pub const RADIX_BLOCKS_B: u32 = 12;
    pub const RADIX_GLOBAL_PREFIX: u32 = 13;
    pub const TILE_RANGES: u32 = 14;
    pub const PREFIX_BLOCK_SUMS: u32 = 15;
}

/// Set 1: transform handle/index buffers, shared across frames
pub mod handles {
    /// transform slot -> index into the host's transform table
    pub const TRANSFORM_HANDLES: u32 = 0;
    /// Gaussian -> transform slot
    pub const TRANSFORM_INDICES: u32 = 1;
}

/// Set 2: host transform table
pub mod transforms {
    pub const TRANSFORMS: u32 = 0;
}

pub const PUSH_POINT_COUNT: u32 = 0;
pub const PUSH_SH_DEGREE: u32 = 4;
pub const PUSH_TILES_RENDERED: u32 = 8;
pub const PUSH_PASS: u32 = 12;

/// Push-constant block. `pass` is the radix pass index for radix/coalesce, the
/// stage for prefix, and the completed radix pass count for range/blend.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PushConstants {
    pub point_count: u32,
    pub sh_degree: u32,
    pub tiles_rendered: u32,
    pub pass: u32,
}

pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<PushConstants>() as u32;

/// Stages of the three-dispatch prefix sum
pub mod prefix_stage {
    pub const BLOCK_SCAN: u32 = 0;
    pub const SCAN_BLOCK_SUMS: u32 = 1;
    pub const ADD_BLOCK_BASE: u32 = 2;
}

/// The seven compute programs
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Project,
    Prefix,
    Keygen,
    Radix,
    Coalesce,
    Range,
    Blend,
}

impl ProgramKind {
    pub const ALL: [ProgramKind; 7] = [
        ProgramKind::Project,
        ProgramKind::Prefix,
        ProgramKind::Keygen,
        ProgramKind::Radix,
        ProgramKind::Coalesce,
        ProgramKind::Range,
        ProgramKind::Blend,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ProgramKind::Project => "project",
            ProgramKind::Prefix => "prefix",
            ProgramKind::Keygen => "keygen",
            ProgramKind::Radix => "radix",
            ProgramKind::Coalesce => "coalesce",
            ProgramKind::Range => "range",
            ProgramKind::Blend => "blend",
        }
    }

    pub fn workgroup_size(self) -> [u32; 3] {
        match self {
            ProgramKind::Blend => [TILE_SIZE, TILE_SIZE, 1],
            _ => [WORKGROUP_SIZE, 1, 1],
        }
    }
}

fn storage(binding: u32) -> BindingDesc {
    BindingDesc {
        binding,
        kind: BindingKind::StorageBuffer { read_only: false },
    }
}

fn storage_read(binding: u32) -> BindingDesc {
    BindingDesc {
        binding,
        kind: BindingKind::StorageBuffer { read_only: true },
    }
}

/// The single pipeline layout every program is created against
pub fn pipeline_layout() -> PipelineLayoutDesc {
    let frame_set = SetLayoutDesc {
        bindings: vec![
            BindingDesc {
                binding: frame::OUTPUT_IMAGE,
                kind: BindingKind::StorageImage,
            },
            BindingDesc {
                binding: frame::CAMERA,
                kind: BindingKind::UniformBuffer,
            },
            storage_read(frame::POINTS),
            storage(frame::SPLATS),
            storage(frame::TILE_COUNTS),
            storage(frame::TILE_OFFSETS),
            storage(frame::TILES_RENDERED),
            storage(frame::SORT_KEYS),
            storage(frame::SORT_VALUES),
            storage(frame::SORT_KEYS_ALT),
            storage(frame::SORT_VALUES_ALT),
            storage(frame::RADIX_BLOCKS_A),
            storage(frame::RADIX_BLOCKS_B),
            storage(frame::RADIX_GLOBAL_PREFIX),
            storage(frame::TILE_RANGES),
            storage(frame::PREFIX_BLOCK_SUMS),
        ],
    };

    let handle_set = SetLayoutDesc {
        bindings: vec![
            storage_read(handles::TRANSFORM_HANDLES),
            storage_read(handles::TRANSFORM_INDICES),
        ],
    };

    let transform_set = SetLayoutDesc {
        bindings: vec![storage_read(transforms::TRANSFORMS)],
    };

    PipelineLayoutDesc {
        sets: vec![frame_set, handle_set, transform_set],
        push_constant_size: PUSH_CONSTANT_SIZE,
    }
}

/// Tiles along each axis for a framebuffer
pub fn tile_grid(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(TILE_SIZE), height.div_ceil(TILE_SIZE))
}

/// Radix passes needed to sort keys whose tile part spans `tile_count` tiles.
///
/// `ceil((bit_length(tile_count) + DEPTH_BITS) / RADIX_BITS)`
pub fn radix_pass_count(tile_count: u32) -> u32 {
    let tile_bits = u32::BITS - tile_count.leading_zeros();
    (tile_bits + DEPTH_BITS).div_ceil(RADIX_BITS)
}

/// Radix blocks covering `entries` sort entries
pub fn radix_block_count(entries: u32) -> u32 {
    entries.div_ceil(RADIX_BLOCK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_has_nineteen_bindings_in_three_sets() {
        let layout = pipeline_layout();
        assert_eq!(layout.sets.len(), 3);
        assert_eq!(layout.sets[SET_FRAME as usize].bindings.len(), 16);
        assert_eq!(layout.sets[SET_HANDLES as usize].bindings.len(), 2);
        assert_eq!(layout.sets[SET_TRANSFORMS as usize].bindings.len(), 1);
        assert_eq!(layout.binding_count(), 19);
    }

    #[test]
    fn test_binding_numbers_are_unique_and_dense() {
        for set in pipeline_layout().sets {
            let mut numbers: Vec<u32> = set.bindings.iter().map(|b| b.binding).collect();
            numbers.sort_unstable();
            let expected: Vec<u32> = (0..numbers.len() as u32).collect();
            assert_eq!(numbers, expected);
        }
    }

    #[test]
    fn test_push_constant_offsets_match_struct() {
        assert_eq!(PUSH_CONSTANT_SIZE, 16);
        let pc = PushConstants {
            point_count: 1,
            sh_degree: 2,
            tiles_rendered: 3,
            pass: 4,
        };
        let bytes = bytemuck::bytes_of(&pc);
        let read = |offset: u32| {
            let at = offset as usize;
            u32::from_ne_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        assert_eq!(read(PUSH_POINT_COUNT), 1);
        assert_eq!(read(PUSH_SH_DEGREE), 2);
        assert_eq!(read(PUSH_TILES_RENDERED), 3);
        assert_eq!(read(PUSH_PASS), 4);
    }

    #[test]
    fn test_radix_pass_count() {
        // 256x256 framebuffer: 16x16 tiles = 256, bit length 9
        assert_eq!(radix_pass_count(256), 21);
        assert_eq!(radix_pass_count(1), 17);
        assert_eq!(radix_pass_count(0), 16);
        assert_eq!(radix_pass_count(8160), 23);
    }

    #[test]
    fn test_tile_grid_rounds_up() {
        assert_eq!(tile_grid(256, 256), (16, 16));
        assert_eq!(tile_grid(1920, 1080), (120, 68));
        assert_eq!(tile_grid(1, 1), (1, 1));
    }
}
