//! An engine bound to a headless presenter, driven one frame at a time.
//!
//! Every surface in the binary (both viewers, the benchmark and the
//! single-frame export) runs frames through this type.

use std::sync::{Arc, Weak};

use crate::config::{CompileSettings, EngineConfig};
use crate::engine::{ComputeEngine, FrameReport};
use crate::error::EngineResult;
use crate::hal::{GpuDevice, ImageId};
use crate::present::{HeadlessPresenter, Presentation};
use crate::splat::{CameraState, SplatScene};

/// What one call to [`Session::frame`] produced
#[derive(Copy, Clone, Debug)]
pub struct FrameOutput {
    pub report: FrameReport,
    /// Swap image holding the frame, when the device can present
    pub swap_image: Option<ImageId>,
}

pub struct Session {
    // Dropped first: unregisters its resize callback from the presenter
    engine: ComputeEngine,
    presenter: Arc<HeadlessPresenter>,
}

impl Session {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        size: (u32, u32),
        frames_in_flight: u32,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let presenter = Arc::new(HeadlessPresenter::new(
            Arc::clone(&device),
            frames_in_flight,
            size.0,
            size.1,
        )?);
        let weak: Weak<HeadlessPresenter> = Arc::downgrade(&presenter);
        let engine = ComputeEngine::new(device, weak, config)?;
        Ok(Self { engine, presenter })
    }

    pub fn load(&mut self, scene: &dyn SplatScene, settings: CompileSettings) -> EngineResult<()> {
        self.engine.compile(scene, settings)
    }

    /// Compute a frame, then draw and present it when the device has a
    /// graphics family. Compute-only devices just advance the frame index.
    pub fn frame(&mut self, camera: &CameraState) -> EngineResult<FrameOutput> {
        let report = self.engine.compute(camera)?;
        if !self.presenter.supports_presentation() {
            self.presenter.advance();
            return Ok(FrameOutput {
                report,
                swap_image: None,
            });
        }
        let swap_image = self.presenter.acquire()?;
        self.engine.draw(swap_image)?;
        self.presenter.present()?;
        Ok(FrameOutput {
            report,
            swap_image: Some(swap_image),
        })
    }

    /// RGBA8 pixels of the frame last computed into `slot`
    pub fn pixels(&mut self, slot: u32) -> EngineResult<Vec<u8>> {
        self.engine.read_output(slot)
    }

    pub fn resize(&self, width: u32, height: u32) -> EngineResult<()> {
        self.presenter.resize(width, height)
    }

    pub fn engine(&self) -> &ComputeEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ComputeEngine {
        &mut self.engine
    }

    pub fn presenter(&self) -> &Arc<HeadlessPresenter> {
        &self.presenter
    }

    pub fn size(&self) -> (u32, u32) {
        self.presenter.framebuffer_size()
    }
}
