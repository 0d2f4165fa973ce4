//! Orbit camera driven by the viewers' keyboard and mouse controls

use glam::Vec3;

use crate::splat::CameraState;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OrbitCamera {
    pub target: Vec3,
    /// Radians around +Y
    pub yaw: f32,
    /// Radians above the XZ plane, kept short of the poles
    pub pitch: f32,
    pub distance: f32,
    pub fov_y: f32,
}

const PITCH_LIMIT: f32 = 1.5;
const MIN_DISTANCE: f32 = 0.2;

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            yaw: 0.0,
            pitch: 0.2,
            distance: 5.0,
            fov_y: 60f32.to_radians(),
        }
    }
}

impl OrbitCamera {
    pub fn rotate(&mut self, d_yaw: f32, d_pitch: f32) {
        self.yaw = (self.yaw + d_yaw).rem_euclid(std::f32::consts::TAU);
        self.pitch = (self.pitch + d_pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    /// Multiply the distance; factors below 1 move closer
    pub fn zoom(&mut self, factor: f32) {
        self.distance = (self.distance * factor).max(MIN_DISTANCE);
    }

    pub fn eye(&self) -> Vec3 {
        let (sin_yaw, cos_yaw) = self.yaw.sin_cos();
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        self.target + self.distance * Vec3::new(cos_pitch * sin_yaw, sin_pitch, cos_pitch * cos_yaw)
    }

    pub fn camera(&self) -> CameraState {
        CameraState::look_at(self.eye(), self.target, Vec3::Y, self.fov_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_default_eye_sits_on_positive_z() {
        let orbit = OrbitCamera {
            pitch: 0.0,
            ..Default::default()
        };
        let eye = orbit.eye();
        assert_relative_eq!(eye.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(eye.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(eye.z, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pitch_is_clamped_and_zoom_bounded() {
        let mut orbit = OrbitCamera::default();
        orbit.rotate(0.0, 10.0);
        assert_relative_eq!(orbit.pitch, PITCH_LIMIT);
        orbit.zoom(0.0);
        assert_relative_eq!(orbit.distance, MIN_DISTANCE);
    }

    #[test]
    fn test_target_projects_to_screen_center() {
        let orbit = OrbitCamera {
            yaw: 0.7,
            pitch: -0.3,
            ..Default::default()
        };
        let center = orbit.camera().project(orbit.target, 64, 48).unwrap();
        assert_relative_eq!(center.x, 32.0, epsilon = 1e-3);
        assert_relative_eq!(center.y, 24.0, epsilon = 1e-3);
    }
}
