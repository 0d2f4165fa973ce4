//! Tile-based Gaussian splat rasterizer on a compute-capable device.
//!
//! A frame runs in two submissions: projection and a prefix sum whose total
//! (tiles rendered) is read back to size the sort buffers, then key
//! generation, a radix sort, per-tile ranges and front-to-back blending into
//! a storage image that `draw` copies into the presenter's swap image.

pub mod config;
pub mod engine;
pub mod error;
pub mod hal;
pub mod interactive;
pub mod layout;
pub mod present;
pub mod render;
pub mod splat;
pub mod transfer;

#[cfg(test)]
mod tests;

// Re-export public API
pub use config::{CompileSettings, EngineConfig};
pub use engine::{ComputeEngine, FrameReport, Phase, SlotState};
pub use error::{EngineError, EngineResult};
pub use hal::software::{SoftwareConfig, SoftwareDevice};
pub use hal::{GpuDevice, GpuError, GpuResult};
pub use present::{HeadlessPresenter, Presentation};
pub use render::save_ppm;
pub use splat::{CameraState, GaussianPoint, PointCloud, SplatScene};
pub use transfer::TransferQueue;
