//! Projection of one 3D Gaussian to its screen-space splat.
//!
//! This is the host form of `project.wgsl`; the software device runs it per
//! Gaussian and the two must stay in lockstep.

use glam::{Mat3, Mat4, Quat, Vec3};

use super::camera::CameraUniform;
use super::point::{GaussianPoint, Splat};
use crate::layout::TILE_SIZE;

pub const SH_C0: f32 = 0.282_094_8;
pub const SH_C1: f32 = 0.488_602_5;
pub const SH_C2: [f32; 5] = [1.092_548_4, -1.092_548_4, 0.315_391_57, -1.092_548_4, 0.546_274_2];
pub const SH_C3: [f32; 7] = [
    -0.590_043_6,
    2.890_611_4,
    -0.457_045_8,
    0.373_176_33,
    -0.457_045_8,
    1.445_305_7,
    -0.590_043_6,
];

/// Screen-space variance added to every splat so it covers at least a pixel
pub const LOW_PASS: f32 = 0.3;
/// Lower bound on the eigenvalue discriminant
const MIN_DISCRIMINANT: f32 = 0.1;

/// Σ = R S (R S)^T
pub fn covariance_3d(scale: Vec3, rotation: Quat) -> Mat3 {
    let r = Mat3::from_quat(rotation);
    let rs = Mat3::from_cols(r.x_axis * scale.x, r.y_axis * scale.y, r.z_axis * scale.z);
    rs * rs.transpose()
}

/// View-space covariance projected through the perspective Jacobian.
///
/// Returns (a, b, c) of the symmetric 2x2 `[[a, b], [b, c]]` in pixels.
pub fn project_covariance(cov_view: Mat3, view_pos: Vec3, fx: f32, fy: f32) -> (f32, f32, f32) {
    let z = -view_pos.z;
    let z2 = z * z;
    // Third row zero; only the top-left 2x2 of J Σ J^T is kept
    let j = Mat3::from_cols(
        Vec3::new(fx / z, 0.0, 0.0),
        Vec3::new(0.0, -fy / z, 0.0),
        Vec3::new(fx * view_pos.x / z2, -fy * view_pos.y / z2, 0.0),
    );
    let cov = j * cov_view * j.transpose();
    (cov.x_axis.x, cov.y_axis.x, cov.y_axis.y)
}

/// Color seen from direction `dir` (unit vector from camera to Gaussian)
pub fn eval_sh(point: &GaussianPoint, degree: u32, dir: Vec3) -> Vec3 {
    let sh = |k: usize| point.sh_coeff(k);
    let mut color = SH_C0 * sh(0);

    if degree > 0 {
        let (x, y, z) = (dir.x, dir.y, dir.z);
        color += -SH_C1 * y * sh(1) + SH_C1 * z * sh(2) - SH_C1 * x * sh(3);

        if degree > 1 {
            let (xx, yy, zz) = (x * x, y * y, z * z);
            let (xy, yz, xz) = (x * y, y * z, x * z);
            color += SH_C2[0] * xy * sh(4)
                + SH_C2[1] * yz * sh(5)
                + SH_C2[2] * (2.0 * zz - xx - yy) * sh(6)
                + SH_C2[3] * xz * sh(7)
                + SH_C2[4] * (xx - yy) * sh(8);

            if degree > 2 {
                color += SH_C3[0] * y * (3.0 * xx - yy) * sh(9)
                    + SH_C3[1] * xy * z * sh(10)
                    + SH_C3[2] * y * (4.0 * zz - xx - yy) * sh(11)
                    + SH_C3[3] * z * (2.0 * zz - 3.0 * xx - 3.0 * yy) * sh(12)
                    + SH_C3[4] * x * (4.0 * zz - xx - yy) * sh(13)
                    + SH_C3[5] * z * (xx - yy) * sh(14)
                    + SH_C3[6] * x * (xx - 3.0 * yy) * sh(15);
            }
        }
    }

    (color + Vec3::splat(0.5)).max(Vec3::ZERO)
}

/// Project one Gaussian under instance transform `model`.
///
/// A culled Gaussian yields an empty tile rectangle and so no sort entries.
pub fn project_point(point: &GaussianPoint, model: Mat4, camera: &CameraUniform, sh_degree: u32) -> Splat {
    let world = model.transform_point3(point.position());
    let view = camera.view_matrix();
    let v = view.transform_point3(world);
    let z = -v.z;
    if z <= camera.clip[0] || z > camera.clip[1] {
        return Splat::default();
    }

    let m = Mat3::from_mat4(model);
    let w = Mat3::from_mat4(view);
    let cov_world = m * covariance_3d(point.scale(), point.rotation()) * m.transpose();
    let cov_view = w * cov_world * w.transpose();

    let [fx, fy, cx, cy] = camera.focal;
    let (a, b, c) = project_covariance(cov_view, v, fx, fy);
    let (a, c) = (a + LOW_PASS, c + LOW_PASS);
    let det = a * c - b * b;
    if det <= 0.0 {
        return Splat::default();
    }

    let mid = 0.5 * (a + c);
    let lambda = mid + (mid * mid - det).max(MIN_DISCRIMINANT).sqrt();
    let radius = (3.0 * lambda.sqrt()).ceil();

    let px = fx * v.x / z + cx;
    let py = cy - fy * v.y / z;

    let (tiles_x, tiles_y) = camera.tiles();
    let tile = TILE_SIZE as f32;
    let lo = |p: f32, n: u32| ((p - radius) / tile).floor().clamp(0.0, n as f32) as u32;
    let hi = |p: f32, n: u32| ((p + radius) / tile).ceil().clamp(0.0, n as f32) as u32;

    let dir = (world - Vec3::new(camera.position[0], camera.position[1], camera.position[2])).normalize_or_zero();
    let rgb = eval_sh(point, sh_degree, dir);

    Splat {
        center: [px, py],
        depth: z,
        opacity: point.opacity,
        conic: [c / det, -b / det, a / det, 0.0],
        color: [rgb.x, rgb.y, rgb.z, 1.0],
        tile_min: [lo(px, tiles_x), lo(py, tiles_y)],
        tile_max: [hi(px, tiles_x), hi(py, tiles_y)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::camera::CameraState;
    use approx::assert_relative_eq;

    fn head_on() -> CameraUniform {
        CameraState {
            view: Mat4::IDENTITY,
            position: Vec3::ZERO,
            fov_y: 60f32.to_radians(),
            near: 0.1,
            far: 100.0,
        }
        .uniform(256, 256, [0.0; 3])
    }

    #[test]
    fn test_scaled_covariance_diagonal() {
        let cov = covariance_3d(Vec3::new(2.0, 1.0, 0.5), Quat::IDENTITY);
        assert_relative_eq!(cov.x_axis.x, 4.0, epsilon = 1e-6);
        assert_relative_eq!(cov.y_axis.y, 1.0, epsilon = 1e-6);
        assert_relative_eq!(cov.z_axis.z, 0.25, epsilon = 1e-6);
        assert_relative_eq!(cov.x_axis.y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rotation_preserves_isotropic_covariance() {
        let rot = Quat::from_rotation_y(0.7) * Quat::from_rotation_x(0.3);
        let cov = covariance_3d(Vec3::splat(1.5), rot);
        assert_relative_eq!(cov.x_axis.x, 2.25, epsilon = 1e-5);
        assert_relative_eq!(cov.z_axis.y, 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_degree_zero_base_color_roundtrip() {
        let point = GaussianPoint::default().with_base_color([0.2, 0.4, 0.8]);
        let rgb = eval_sh(&point, 0, Vec3::Z);
        assert_relative_eq!(rgb.x, 0.2, epsilon = 1e-5);
        assert_relative_eq!(rgb.y, 0.4, epsilon = 1e-5);
        assert_relative_eq!(rgb.z, 0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_higher_degrees_ignored_below_degree() {
        let mut point = GaussianPoint::default();
        point.sh[3] = 1.0;
        let dir = Vec3::new(0.0, 1.0, 0.0);
        let flat = eval_sh(&point, 0, dir);
        let lit = eval_sh(&point, 1, dir);
        assert_relative_eq!(flat.x, 0.5, epsilon = 1e-6);
        assert!(lit.x < flat.x);
    }

    #[test]
    fn test_center_gaussian_projects_to_center() {
        let camera = head_on();
        let point = GaussianPoint::new(Vec3::new(0.0, 0.0, -5.0), Vec3::splat(0.05), Quat::IDENTITY, 0.8);
        let splat = project_point(&point, Mat4::IDENTITY, &camera, 0);
        assert_relative_eq!(splat.center[0], 128.0, epsilon = 1e-3);
        assert_relative_eq!(splat.center[1], 128.0, epsilon = 1e-3);
        assert_relative_eq!(splat.depth, 5.0, epsilon = 1e-5);
        assert!(splat.tile_count() >= 1);
        assert_eq!(splat.opacity, 0.8);
    }

    #[test]
    fn test_behind_camera_is_culled() {
        let camera = head_on();
        let point = GaussianPoint::new(Vec3::new(0.0, 0.0, 5.0), Vec3::splat(0.05), Quat::IDENTITY, 1.0);
        assert_eq!(project_point(&point, Mat4::IDENTITY, &camera, 0).tile_count(), 0);
    }

    #[test]
    fn test_model_transform_moves_gaussian() {
        let camera = head_on();
        let point = GaussianPoint::new(Vec3::ZERO, Vec3::splat(0.05), Quat::IDENTITY, 1.0);
        let model = Mat4::from_translation(Vec3::new(0.0, 0.0, -4.0));
        let splat = project_point(&point, model, &camera, 0);
        assert_relative_eq!(splat.depth, 4.0, epsilon = 1e-5);
    }

    #[test]
    fn test_tile_rect_clamped_to_screen() {
        let camera = head_on();
        let point = GaussianPoint::new(Vec3::new(0.0, 0.0, -1.0), Vec3::splat(5.0), Quat::IDENTITY, 1.0);
        let splat = project_point(&point, Mat4::IDENTITY, &camera, 0);
        assert_eq!(splat.tile_min, [0, 0]);
        assert_eq!(splat.tile_max, [16, 16]);
        assert_eq!(splat.tile_count(), 256);
    }
}
