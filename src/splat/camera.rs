//! Camera contract and its uniform block.

use glam::{Mat4, Vec3};

use crate::layout::tile_grid;

/// View and projection parameters supplied by the host each frame
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraState {
    /// World to view transform; the camera looks down -Z
    pub view: Mat4,
    pub position: Vec3,
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for CameraState {
    fn default() -> Self {
        Self::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y, 60f32.to_radians())
    }
}

impl CameraState {
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov_y: f32) -> Self {
        Self {
            view: Mat4::look_at_rh(eye, target, up),
            position: eye,
            fov_y,
            near: 0.1,
            far: 1000.0,
        }
    }

    /// Focal length in pixels for a framebuffer height
    pub fn focal(&self, height: u32) -> f32 {
        height as f32 / (2.0 * (self.fov_y * 0.5).tan())
    }

    /// Pixel position of a world point, `None` when outside the clip range
    #[cfg(test)]
    pub(crate) fn project(&self, world: Vec3, width: u32, height: u32) -> Option<glam::Vec2> {
        let v = self.view.transform_point3(world);
        let z = -v.z;
        if z <= self.near || z > self.far {
            return None;
        }
        let f = self.focal(height);
        Some(glam::Vec2::new(
            f * v.x / z + width as f32 * 0.5,
            height as f32 * 0.5 - f * v.y / z,
        ))
    }

    pub fn uniform(&self, width: u32, height: u32, background: [f32; 3]) -> CameraUniform {
        let f = self.focal(height);
        let (tiles_x, tiles_y) = tile_grid(width, height);
        CameraUniform {
            view: self.view.to_cols_array_2d(),
            focal: [f, f, width as f32 * 0.5, height as f32 * 0.5],
            position: [self.position.x, self.position.y, self.position.z, 1.0],
            viewport: [width, height, tiles_x, tiles_y],
            clip: [self.near, self.far, 0.0, 0.0],
            background: [background[0], background[1], background[2], 1.0],
        }
    }
}

/// Uniform block at set 0, binding 1
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraUniform {
    /// Column-major world to view
    pub view: [[f32; 4]; 4],
    /// fx, fy, cx, cy in pixels
    pub focal: [f32; 4],
    pub position: [f32; 4],
    /// width, height, tiles_x, tiles_y
    pub viewport: [u32; 4],
    /// near, far
    pub clip: [f32; 4],
    pub background: [f32; 4],
}

pub const CAMERA_UNIFORM_SIZE: u64 = std::mem::size_of::<CameraUniform>() as u64;

impl CameraUniform {
    pub fn view_matrix(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view)
    }

    pub fn tiles(&self) -> (u32, u32) {
        (self.viewport[2], self.viewport[3])
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.viewport[0], self.viewport[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uniform_size_matches_wgsl() {
        assert_eq!(CAMERA_UNIFORM_SIZE, 144);
    }

    #[test]
    fn test_target_projects_to_center() {
        let camera = CameraState::default();
        let p = camera.project(Vec3::ZERO, 256, 256).unwrap();
        assert_relative_eq!(p.x, 128.0, epsilon = 1e-4);
        assert_relative_eq!(p.y, 128.0, epsilon = 1e-4);
    }

    #[test]
    fn test_behind_camera_is_clipped() {
        let camera = CameraState::default();
        assert!(camera.project(Vec3::new(0.0, 0.0, 10.0), 256, 256).is_none());
    }

    #[test]
    fn test_up_is_toward_smaller_y() {
        let camera = CameraState::default();
        let p = camera.project(Vec3::new(0.0, 1.0, 0.0), 256, 256).unwrap();
        assert!(p.y < 128.0);
    }

    #[test]
    fn test_uniform_carries_tile_grid() {
        let uniform = CameraState::default().uniform(1920, 1080, [0.0; 3]);
        assert_eq!(uniform.tiles(), (120, 68));
        assert_eq!(uniform.extent(), (1920, 1080));
    }
}
