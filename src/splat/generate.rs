//! Deterministic random point clouds for demos, benchmarks and tests.

use glam::{Mat4, Quat, Vec3, Vec4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::point::GaussianPoint;
use super::scene::PointCloud;

#[derive(Debug, Clone)]
pub struct CloudSettings {
    pub count: u32,
    pub seed: u64,
    /// Standard deviation of positions around the origin
    pub spread: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub sh_degree: u8,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            count: 10_000,
            seed: 0x5EED_5EED,
            spread: 1.0,
            min_scale: 0.01,
            max_scale: 0.06,
            sh_degree: 1,
        }
    }
}

/// Gaussians scattered normally around the origin, one shared group
pub fn random_cloud(settings: &CloudSettings) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let points = (0..settings.count)
        .map(|_| random_point(&mut rng, settings))
        .collect();
    PointCloud::from_points(points)
}

/// `clusters` instanced groups placed on a ring, each with its own transform
pub fn clustered_cloud(settings: &CloudSettings, clusters: u32) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let mut cloud = PointCloud::new();
    let clusters = clusters.max(1);
    let per_cluster = settings.count / clusters;

    for c in 0..clusters {
        let angle = c as f32 / clusters as f32 * std::f32::consts::TAU;
        let offset = Vec3::new(angle.cos(), 0.0, angle.sin()) * settings.spread * 3.0;
        let points = (0..per_cluster).map(|_| random_point(&mut rng, settings)).collect();
        cloud.push_group(points, Mat4::from_translation(offset));
    }
    cloud
}

fn random_point<R: Rng + ?Sized>(rng: &mut R, settings: &CloudSettings) -> GaussianPoint {
    let position = Vec3::new(
        random_normal(rng, settings.spread),
        random_normal(rng, settings.spread),
        random_normal(rng, settings.spread),
    );
    let scale_range = settings.min_scale..=settings.max_scale.max(settings.min_scale);
    let scale = Vec3::new(
        rng.gen_range(scale_range.clone()),
        rng.gen_range(scale_range.clone()),
        rng.gen_range(scale_range),
    );
    let axis = Vec4::new(
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
        rng.gen_range(-1.0..=1.0),
    );
    let rotation = match axis.length() {
        len if len > 1e-6 => Quat::from_vec4(axis / len),
        _ => Quat::IDENTITY,
    };
    let opacity = rng.gen_range(0.3..=1.0);

    let mut point = GaussianPoint::new(position, scale, rotation, opacity)
        .with_base_color([rng.r#gen(), rng.r#gen(), rng.r#gen()]);

    let coeffs = match settings.sh_degree {
        0 => 1,
        1 => 4,
        2 => 9,
        _ => 16,
    };
    for value in &mut point.sh[3..3 * coeffs] {
        *value = rng.gen_range(-0.2..=0.2);
    }
    point
}

fn random_normal<R: Rng + ?Sized>(rng: &mut R, std_dev: f32) -> f32 {
    let u1 = rng.r#gen::<f32>().max(f32::MIN_POSITIVE);
    let u2 = rng.r#gen::<f32>();
    std_dev * (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::scene::SplatScene;

    #[test]
    fn test_same_seed_same_cloud() {
        let settings = CloudSettings {
            count: 64,
            ..Default::default()
        };
        let a = random_cloud(&settings);
        let b = random_cloud(&settings);
        assert_eq!(a.point_bytes(), b.point_bytes());
        assert_eq!(a.gaussian_count(), 64);
    }

    #[test]
    fn test_clusters_get_own_transforms() {
        let settings = CloudSettings {
            count: 40,
            ..Default::default()
        };
        let cloud = clustered_cloud(&settings, 4);
        assert_eq!(cloud.groups().len(), 4);
        assert_eq!(cloud.transforms().len(), 4);
        assert_eq!(cloud.gaussian_count(), 40);
    }

    #[test]
    fn test_generated_rotations_are_unit() {
        let cloud = random_cloud(&CloudSettings {
            count: 32,
            ..Default::default()
        });
        for point in cloud.points() {
            assert!((point.rotation().length() - 1.0).abs() < 1e-4);
        }
    }
}
