//! Per-Gaussian record formats shared with the compute programs.

use glam::{Quat, Vec3};

/// Spherical-harmonics coefficients per color channel (degree 3)
pub const SH_COEFFS: usize = 16;

/// One Gaussian as uploaded to the points buffer.
///
/// Layout is bit-exact with the WGSL `GaussianPoint` struct: any importer must
/// produce exactly these 240 bytes per record. Values are uploaded verbatim;
/// opacity is already activated, scale is linear, rotation is (x, y, z, w).
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GaussianPoint {
    pub position: [f32; 3],
    pub opacity: f32,
    pub rotation: [f32; 4],
    /// xyz scale, w unused
    pub scale: [f32; 4],
    /// Coefficient-major RGB: `sh[3 * k + channel]`
    pub sh: [f32; 3 * SH_COEFFS],
}

pub const POINT_RECORD_SIZE: u64 = std::mem::size_of::<GaussianPoint>() as u64;

impl Default for GaussianPoint {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            opacity: 1.0,
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0, 1.0, 1.0, 0.0],
            sh: [0.0; 3 * SH_COEFFS],
        }
    }
}

impl GaussianPoint {
    pub fn new(position: Vec3, scale: Vec3, rotation: Quat, opacity: f32) -> Self {
        Self {
            position: position.to_array(),
            opacity,
            rotation: rotation.to_array(),
            scale: [scale.x, scale.y, scale.z, 0.0],
            ..Default::default()
        }
    }

    /// Set the DC term so a degree-0 evaluation yields `rgb`
    pub fn with_base_color(mut self, rgb: [f32; 3]) -> Self {
        for (channel, value) in rgb.iter().enumerate() {
            self.sh[channel] = (value - 0.5) / super::project::SH_C0;
        }
        self
    }

    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }

    pub fn scale(&self) -> Vec3 {
        Vec3::new(self.scale[0], self.scale[1], self.scale[2])
    }

    pub fn rotation(&self) -> Quat {
        Quat::from_array(self.rotation)
    }

    /// RGB of coefficient `k`
    pub fn sh_coeff(&self, k: usize) -> Vec3 {
        Vec3::new(self.sh[3 * k], self.sh[3 * k + 1], self.sh[3 * k + 2])
    }
}

/// Screen-space projection of one Gaussian, written by the project pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Splat {
    /// Pixel coordinates, y down
    pub center: [f32; 2],
    /// Positive view depth
    pub depth: f32,
    pub opacity: f32,
    /// Inverse 2D covariance (a, b, c, unused)
    pub conic: [f32; 4],
    /// Evaluated RGB, alpha unused
    pub color: [f32; 4],
    /// Inclusive-exclusive tile rectangle
    pub tile_min: [u32; 2],
    pub tile_max: [u32; 2],
}

pub const SPLAT_RECORD_SIZE: u64 = std::mem::size_of::<Splat>() as u64;

impl Splat {
    pub fn tile_count(&self) -> u32 {
        let w = self.tile_max[0].saturating_sub(self.tile_min[0]);
        let h = self.tile_max[1].saturating_sub(self.tile_min[1]);
        w * h
    }
}

/// Tile id in the high word, depth bits in the low word.
///
/// Depth is positive, so its IEEE bits order the same way as its value.
pub fn sort_key(tile: u32, depth: f32) -> u64 {
    ((tile as u64) << 32) | depth.to_bits() as u64
}

pub fn key_tile(key: u64) -> u32 {
    (key >> 32) as u32
}

pub fn key_depth(key: u64) -> f32 {
    f32::from_bits(key as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(POINT_RECORD_SIZE, 240);
        assert_eq!(SPLAT_RECORD_SIZE, 64);
    }

    #[test]
    fn test_point_field_offsets() {
        let point = GaussianPoint {
            position: [1.0, 2.0, 3.0],
            opacity: 4.0,
            rotation: [5.0, 6.0, 7.0, 8.0],
            scale: [9.0, 10.0, 11.0, 12.0],
            sh: [13.0; 48],
        };
        let floats: &[f32] = bytemuck::cast_slice(bytemuck::bytes_of(&point));
        assert_eq!(&floats[..4], &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(&floats[4..8], &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(&floats[8..12], &[9.0, 10.0, 11.0, 12.0]);
        assert_eq!(floats[12], 13.0);
        assert_eq!(floats.len(), 60);
    }

    #[test]
    fn test_sort_key_orders_by_tile_then_depth() {
        let near_tile0 = sort_key(0, 1.0);
        let far_tile0 = sort_key(0, 50.0);
        let near_tile1 = sort_key(1, 0.5);
        assert!(near_tile0 < far_tile0);
        assert!(far_tile0 < near_tile1);
        assert_eq!(key_tile(near_tile1), 1);
        assert_eq!(key_depth(far_tile0), 50.0);
    }
}
