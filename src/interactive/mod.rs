//! Interactive and batch front ends over the compute engine

pub mod gpu_viewer;
pub mod orbit;
pub mod session;
mod viewer;

pub use gpu_viewer::{GpuViewerConfig, run_gpu_viewer};
pub use orbit::OrbitCamera;
pub use session::{FrameOutput, Session};
pub use viewer::{InteractiveViewer, ViewerConfig};
