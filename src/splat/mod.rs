//! Point-cloud data model: Gaussian records, splats, scenes and cameras.

pub mod camera;
pub mod generate;
pub mod point;
pub mod project;
pub mod scene;

pub use camera::{CAMERA_UNIFORM_SIZE, CameraState, CameraUniform};
pub use generate::{CloudSettings, clustered_cloud, random_cloud};
pub use point::{GaussianPoint, POINT_RECORD_SIZE, SPLAT_RECORD_SIZE, Splat, key_depth, key_tile, sort_key};
pub use scene::{Entity, PointCloud, SplatGroup, SplatScene};
