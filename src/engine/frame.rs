//! Per-slot frame resources and the slot state machine.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::hal::{
    BufferDesc, BufferUsage, CommandBufferId, DescriptorWrite, GpuDevice, ImageDesc, ImageFormat, ImageUsage,
    LayoutId, MemoryLocation, OwnedBuffer, OwnedCommandPool, OwnedDescriptorSet, OwnedFence, OwnedImage,
    OwnedSemaphore,
};
use crate::layout::{SET_FRAME, frame};
use crate::splat::CAMERA_UNIFORM_SIZE;

use super::buffers::{PointScratch, SceneBuffers, TileBuffers, ranges_buffer};

/// Which half of the two-phase pipeline a submission carries
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Project and prefix sum, followed by the tiles-rendered readback
    Project,
    /// Keygen, radix sort, ranges and blend
    Sort,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    Idle,
    PreFrameSubmitted(Phase),
    AwaitingReadback,
    DrawSubmitted,
    /// Draw is queued and the swap image may be presented
    PresentReady,
}

impl SlotState {
    pub fn can_transition(self, to: SlotState) -> bool {
        use Phase::*;
        use SlotState::*;
        matches!(
            (self, to),
            (Idle, PreFrameSubmitted(Project))
                // no Gaussians: nothing to project or read back
                | (Idle, AwaitingReadback)
                | (PreFrameSubmitted(Project), AwaitingReadback)
                | (AwaitingReadback, PreFrameSubmitted(Sort))
                | (PreFrameSubmitted(Sort), DrawSubmitted)
                | (DrawSubmitted, PresentReady)
                | (PresentReady, Idle)
                // compute-only frames are never drawn
                | (PreFrameSubmitted(Sort), Idle)
        )
    }
}

/// One in-flight frame's resources, reused across frames
pub struct FrameSlot {
    pub index: u32,
    state: SlotState,
    pub output: OwnedImage,
    pub camera: OwnedBuffer,
    pub tiles_rendered: OwnedBuffer,
    pub tiles: TileBuffers,
    pub ranges: OwnedBuffer,
    pub scratch: PointScratch,
    pub descriptors: OwnedDescriptorSet,
    pub project_cb: CommandBufferId,
    pub sort_cb: CommandBufferId,
    pub draw_cb: Option<CommandBufferId>,
    /// Compute to graphics handoff of the output image
    pub ownership: OwnedSemaphore,
    /// `ownership` was signaled and no graphics submission has waited on it yet
    pub ownership_pending: bool,
    /// Signaled by the phase-2 submission; guards reuse of the slot
    pub pre_frame: OwnedFence,
    pub readback: OwnedFence,
    /// Largest tiles-rendered value seen by this slot
    pub max_tiles_rendered: u32,
}

pub fn output_image(device: &Arc<dyn GpuDevice>, width: u32, height: u32) -> EngineResult<OwnedImage> {
    Ok(OwnedImage::create(
        device,
        &ImageDesc {
            label: "splat output",
            width,
            height,
            format: ImageFormat::Rgba8Unorm,
            usage: ImageUsage::STORAGE | ImageUsage::TRANSFER_SRC,
        },
    )?)
}

impl FrameSlot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        index: u32,
        layout: LayoutId,
        extent: (u32, u32),
        tile_capacity: u32,
        point_count: u32,
        compute_pool: &OwnedCommandPool,
        graphics_pool: Option<&OwnedCommandPool>,
    ) -> EngineResult<Self> {
        let camera = OwnedBuffer::create(
            device,
            &BufferDesc {
                label: "camera uniform",
                size: CAMERA_UNIFORM_SIZE,
                usage: BufferUsage::UNIFORM,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        let tiles_rendered = OwnedBuffer::create(
            device,
            &BufferDesc {
                label: "tiles rendered",
                size: 4,
                usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                location: MemoryLocation::GpuToCpu,
            },
        )?;
        let draw_cb = match graphics_pool {
            Some(pool) => Some(device.allocate_command_buffer(pool.id())?),
            None => None,
        };

        Ok(Self {
            index,
            state: SlotState::Idle,
            output: output_image(device, extent.0, extent.1)?,
            camera,
            tiles_rendered,
            tiles: TileBuffers::allocate(device, tile_capacity)?,
            ranges: ranges_buffer(device, extent)?,
            scratch: PointScratch::allocate(device, point_count)?,
            descriptors: OwnedDescriptorSet::create(device, layout, SET_FRAME)?,
            project_cb: device.allocate_command_buffer(compute_pool.id())?,
            sort_cb: device.allocate_command_buffer(compute_pool.id())?,
            draw_cb,
            ownership: OwnedSemaphore::create(device)?,
            ownership_pending: false,
            pre_frame: OwnedFence::create(device, true)?,
            readback: OwnedFence::create(device, false)?,
            max_tiles_rendered: 0,
        })
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// A frame failed after its first submission and before its second
    pub fn is_stranded(&self) -> bool {
        matches!(
            self.state,
            SlotState::PreFrameSubmitted(Phase::Project) | SlotState::AwaitingReadback
        )
    }

    /// Drop whatever frame the slot was in the middle of. Only valid once the
    /// device is idle.
    pub fn abandon(&mut self) {
        log::debug!("Slot {}: abandoning {:?}", self.index, self.state);
        self.state = SlotState::Idle;
    }

    pub fn transition(&mut self, to: SlotState) -> EngineResult<()> {
        if !self.state.can_transition(to) {
            return Err(EngineError::InvalidSlotTransition { from: self.state, to });
        }
        log::trace!("Slot {}: {:?} -> {:?}", self.index, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Every set-0 binding for this slot
    pub fn descriptor_writes(&self, scene: &SceneBuffers) -> Vec<DescriptorWrite> {
        let mut writes = vec![
            DescriptorWrite::image(frame::OUTPUT_IMAGE, self.output.id()),
            DescriptorWrite::buffer(frame::CAMERA, self.camera.id()),
            DescriptorWrite::buffer(frame::POINTS, scene.points.id()),
            DescriptorWrite::buffer(frame::SPLATS, self.scratch.splats.id()),
            DescriptorWrite::buffer(frame::TILE_COUNTS, self.scratch.tile_counts.id()),
            DescriptorWrite::buffer(frame::TILE_OFFSETS, self.scratch.tile_offsets.id()),
            DescriptorWrite::buffer(frame::TILES_RENDERED, self.tiles_rendered.id()),
            DescriptorWrite::buffer(frame::TILE_RANGES, self.ranges.id()),
            DescriptorWrite::buffer(frame::PREFIX_BLOCK_SUMS, self.scratch.block_sums.id()),
        ];
        writes.extend(self.tiles.descriptor_writes());
        writes
    }

    pub fn write_descriptors(&self, scene: &SceneBuffers) -> EngineResult<()> {
        let device = self.descriptors.device();
        device.update_descriptor_set(self.descriptors.id(), &self.descriptor_writes(scene))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_frame_cycle_is_legal() {
        let cycle = [
            SlotState::Idle,
            SlotState::PreFrameSubmitted(Phase::Project),
            SlotState::AwaitingReadback,
            SlotState::PreFrameSubmitted(Phase::Sort),
            SlotState::DrawSubmitted,
            SlotState::PresentReady,
            SlotState::Idle,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_skipping_phases_is_rejected() {
        assert!(!SlotState::Idle.can_transition(SlotState::PreFrameSubmitted(Phase::Sort)));
        assert!(!SlotState::Idle.can_transition(SlotState::DrawSubmitted));
        assert!(!SlotState::AwaitingReadback.can_transition(SlotState::DrawSubmitted));
        assert!(!SlotState::DrawSubmitted.can_transition(SlotState::Idle));
        assert!(!SlotState::PresentReady.can_transition(SlotState::DrawSubmitted));
    }

    #[test]
    fn test_empty_scene_and_compute_only_shortcuts() {
        assert!(SlotState::Idle.can_transition(SlotState::AwaitingReadback));
        assert!(SlotState::PreFrameSubmitted(Phase::Sort).can_transition(SlotState::Idle));
    }
}
