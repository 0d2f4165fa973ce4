//! Tile-based Gaussian splat rasterizer on the compute queue.
//!
//! Each frame runs in two submissions. Phase 1 projects every Gaussian and
//! prefix-sums its tile coverage; the host reads the total back, grows the
//! slot's sort buffers if needed, then phase 2 sorts `(tile, depth)` keys,
//! finds per-tile ranges and blends the output image. `draw` copies that image
//! into a swap image on the graphics queue.

mod buffers;
mod frame;
mod passes;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::{CompileSettings, EngineConfig};
use crate::error::{EngineError, EngineResult};
use crate::hal::{
    BufferDesc, BufferUsage, CommandList, DescriptorWrite, DeviceCapabilities, GpuDevice, GpuError, ImageId,
    ImageLayout, MemoryLocation, OwnedBuffer, OwnedCommandPool, OwnedDescriptorSet, OwnedFence, OwnedLayout,
    OwnershipTransfer, QueueFamilies, SemaphoreWait, Stage, SubmitInfo, SyncPoint,
};
use crate::layout::{self, PushConstants, SET_HANDLES, SET_TRANSFORMS, pipeline_layout, radix_pass_count, tile_grid};
use crate::present::{Presentation, ResizeToken};
use crate::splat::{CameraState, Entity, SplatScene};
use crate::transfer::TransferQueue;

pub use buffers::{TransformSlots, assign_transform_slots, grown_capacity};
pub use frame::{Phase, SlotState};

use buffers::{PointScratch, SceneBuffers, TileBuffers, ranges_buffer, upload_transforms};
use frame::{FrameSlot, output_image};
use passes::{BoundSets, Programs, SortPass};

/// What one `compute` call did
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameReport {
    pub slot: u32,
    /// Sort entries written by this frame
    pub tiles_rendered: u32,
    /// Sort entries the slot can hold after this frame
    pub tile_capacity: u32,
    /// The slot's tile buffers were reallocated this frame
    pub grew: bool,
    pub radix_passes: u32,
}

pub struct ComputeEngine {
    // Dropped before the pools and layout they were created from
    slots: Vec<FrameSlot>,
    scene: SceneBuffers,
    transform_slots: TransformSlots,
    handle_set: OwnedDescriptorSet,
    transform_set: OwnedDescriptorSet,
    programs: Programs,
    _layout: OwnedLayout,
    _compute_pool: OwnedCommandPool,
    _graphics_pool: Option<OwnedCommandPool>,
    transfer: TransferQueue,

    device: Arc<dyn GpuDevice>,
    queues: QueueFamilies,
    presentation: Weak<dyn Presentation>,
    resize_token: ResizeToken,
    pending_resize: Arc<Mutex<Option<(u32, u32)>>>,
    config: EngineConfig,
    extent: (u32, u32),
    radix_passes: u32,
    sh_degree: u32,
}

impl ComputeEngine {
    pub fn new(
        device: Arc<dyn GpuDevice>,
        presentation: Weak<dyn Presentation>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let info = device.info().clone();
        let missing = info.capabilities.missing(&DeviceCapabilities::REQUIRED);
        if !missing.is_empty() {
            return Err(EngineError::NoCapableDevice { missing });
        }
        let present = presentation.upgrade().ok_or(EngineError::PresentationGone)?;
        let queues = info.queues;
        log::info!(
            "Compute engine on {}: compute family {}, graphics {:?}, transfer {}, async compute {}",
            info.name,
            queues.compute,
            queues.graphics,
            queues.transfer,
            queues.async_compute()
        );

        let layout = OwnedLayout::create(&device, &pipeline_layout())?;
        let programs = Programs::create(&device, layout.id())?;
        let compute_pool = OwnedCommandPool::create(&device, queues.compute)?;
        let graphics_pool = match queues.graphics {
            Some(graphics) if present.supports_presentation() => Some(OwnedCommandPool::create(&device, graphics)?),
            _ => None,
        };
        let transfer = TransferQueue::new(Arc::clone(&device))?;

        let scene = SceneBuffers::empty(&device)?;
        let handle_set = OwnedDescriptorSet::create(&device, layout.id(), SET_HANDLES)?;
        device.update_descriptor_set(handle_set.id(), &scene.handle_writes())?;
        let transform_set = OwnedDescriptorSet::create(&device, layout.id(), SET_TRANSFORMS)?;
        device.update_descriptor_set(transform_set.id(), &scene.transform_writes())?;

        let extent = present.framebuffer_size();
        let mut slots = Vec::new();
        for index in 0..present.frames_in_flight().max(1) {
            let slot = FrameSlot::new(
                &device,
                index,
                layout.id(),
                extent,
                config.initial_tile_capacity,
                0,
                &compute_pool,
                graphics_pool.as_ref(),
            )?;
            slot.write_descriptors(&scene)?;
            slots.push(slot);
        }

        let pending_resize = Arc::new(Mutex::new(None));
        let resize_token = {
            let pending = Arc::clone(&pending_resize);
            present.register_resize(Box::new(move |width, height| {
                *pending.lock() = Some((width, height));
            }))
        };

        let (tiles_x, tiles_y) = tile_grid(extent.0, extent.1);
        let radix_passes = radix_pass_count(tiles_x * tiles_y);
        log::debug!(
            "{} frame slots at {}x{}, {} radix passes",
            slots.len(),
            extent.0,
            extent.1,
            radix_passes
        );

        Ok(Self {
            slots,
            scene,
            transform_slots: TransformSlots::default(),
            handle_set,
            transform_set,
            programs,
            _layout: layout,
            _compute_pool: compute_pool,
            _graphics_pool: graphics_pool,
            transfer,
            device,
            queues,
            presentation,
            resize_token,
            pending_resize,
            config,
            extent,
            radix_passes,
            sh_degree: CompileSettings::default().effective_sh_degree(),
        })
    }

    /// Upload a scene, replacing the previous one.
    ///
    /// Waits for the device and the transfer worker first; nothing references the
    /// old scene's buffers or staging memory once they are replaced.
    pub fn compile(&mut self, scene: &dyn SplatScene, settings: CompileSettings) -> EngineResult<()> {
        self.device.wait_idle()?;
        self.transfer.wait_empty();

        let count = scene.gaussian_count();
        if count == 0 {
            log::warn!("Compiling a scene with no Gaussians");
        }
        let slots = assign_transform_slots(scene)?;
        let (buffers, queued) = SceneBuffers::upload(&self.device, &self.transfer, scene, &slots)?;
        self.sh_degree = settings.effective_sh_degree();

        for slot in &mut self.slots {
            slot.scratch = PointScratch::allocate(&self.device, count)?;
            slot.write_descriptors(&buffers)?;
        }
        self.device
            .update_descriptor_set(self.handle_set.id(), &buffers.handle_writes())?;
        self.device
            .update_descriptor_set(self.transform_set.id(), &buffers.transform_writes())?;

        log::info!(
            "Compiled scene: {} Gaussians, {} transform slots, {} bytes uploaded, SH degree {}",
            count,
            slots.handles.len(),
            queued,
            self.sh_degree
        );
        self.scene = buffers;
        self.transform_slots = slots;
        Ok(())
    }

    /// Re-upload the host transform table of the compiled scene
    pub fn update_transforms(&mut self, scene: &dyn SplatScene) -> EngineResult<()> {
        let table_len = scene.transforms().len();
        if self.transform_slots.handles.iter().any(|&index| index as usize >= table_len) {
            return Err(EngineError::InvalidScene(format!(
                "transform table shrank to {} entries",
                table_len
            )));
        }
        self.device.wait_idle()?;
        let transforms = upload_transforms(&self.device, &self.transfer, scene.transforms())?;
        self.device.update_descriptor_set(
            self.transform_set.id(),
            &[DescriptorWrite::buffer(layout::transforms::TRANSFORMS, transforms.id())],
        )?;
        self.scene.transforms = transforms;
        Ok(())
    }

    fn presentation(&self) -> EngineResult<Arc<dyn Presentation>> {
        self.presentation.upgrade().ok_or(EngineError::PresentationGone)
    }

    fn apply_pending_resize(&mut self) -> EngineResult<()> {
        let Some((width, height)) = self.pending_resize.lock().take() else {
            return Ok(());
        };
        let extent = (width.max(1), height.max(1));
        if extent == self.extent {
            return Ok(());
        }
        self.device.wait_idle()?;
        for slot in &mut self.slots {
            slot.output = output_image(&self.device, extent.0, extent.1)?;
            slot.ranges = ranges_buffer(&self.device, extent)?;
            slot.write_descriptors(&self.scene)?;
        }
        let (tiles_x, tiles_y) = tile_grid(extent.0, extent.1);
        self.radix_passes = radix_pass_count(tiles_x * tiles_y);
        log::debug!(
            "Output resized to {}x{}, {} radix passes",
            extent.0,
            extent.1,
            self.radix_passes
        );
        self.extent = extent;
        Ok(())
    }

    fn handoff(&self) -> Option<OwnershipTransfer> {
        match self.queues.graphics {
            Some(graphics) if self.queues.async_compute() => Some(OwnershipTransfer {
                src_family: self.queues.compute,
                dst_family: graphics,
            }),
            _ => None,
        }
    }

    /// Consume an ownership signal that no draw waited on
    fn drain_ownership(&mut self, index: usize) -> EngineResult<()> {
        let slot = &mut self.slots[index];
        if !slot.ownership_pending {
            return Ok(());
        }
        let graphics = self.queues.graphics.ok_or(EngineError::PresentationUnsupported)?;
        self.device.submit(
            graphics,
            &[SubmitInfo {
                waits: vec![SemaphoreWait {
                    semaphore: slot.ownership.id(),
                    stage: Stage::AllCommands,
                }],
                ..Default::default()
            }],
            None,
        )?;
        slot.ownership_pending = false;
        Ok(())
    }

    /// Render one frame into the current slot's output image.
    ///
    /// A frame that fails between its two submissions leaves the slot `Idle`,
    /// so the next frame on it starts over.
    pub fn compute(&mut self, camera: &CameraState) -> EngineResult<FrameReport> {
        let presentation = self.presentation()?;
        self.apply_pending_resize()?;

        let index = (presentation.current_frame() as usize) % self.slots.len();
        let result = self.run_frame(index, camera);
        if result.is_err() {
            self.recover_slot(index);
        }
        result
    }

    /// Return a slot stranded by a failed frame to `Idle` once the device no
    /// longer uses it. The pre-frame fence is signaled again if the failure
    /// came after it was reset.
    fn recover_slot(&mut self, index: usize) {
        if !self.slots[index].is_stranded() {
            return;
        }
        if let Err(e) = self.device.wait_idle() {
            log::error!("Waiting for device idle after a failed frame: {}", e);
        }
        let pre_frame = self.slots[index].pre_frame.id();
        if !self.device.fence_signaled(pre_frame).unwrap_or(true) {
            if let Err(e) = self.device.submit(self.queues.compute, &[], Some(pre_frame)) {
                log::error!("Re-signaling pre-frame fence of slot {}: {}", index, e);
            }
        }
        self.slots[index].abandon();
    }

    fn run_frame(&mut self, index: usize, camera: &CameraState) -> EngineResult<FrameReport> {
        let timeout = self.config.fence_timeout();
        self.device.wait_fence(self.slots[index].pre_frame.id(), timeout)?;
        if matches!(
            self.slots[index].state(),
            SlotState::PresentReady | SlotState::PreFrameSubmitted(Phase::Sort)
        ) {
            self.slots[index].transition(SlotState::Idle)?;
        }
        self.drain_ownership(index)?;

        let handoff = self.handoff();
        let device = &self.device;
        let compute = self.queues.compute;
        let sets = BoundSets {
            frame: self.slots[index].descriptors.id(),
            handles: self.handle_set.id(),
            transforms: self.transform_set.id(),
        };
        let slot = &mut self.slots[index];
        let uniform = camera.uniform(self.extent.0, self.extent.1, self.config.background);
        device.write_mapped(slot.camera.id(), 0, bytemuck::bytes_of(&uniform))?;

        let point_count = self.scene.point_count;
        let push = PushConstants {
            point_count,
            sh_degree: self.sh_degree,
            tiles_rendered: 0,
            pass: 0,
        };

        let tiles_rendered = if point_count == 0 {
            slot.transition(SlotState::AwaitingReadback)?;
            0
        } else {
            let mut list = CommandList::new();
            passes::record_project(&mut list, &self.programs, sets, push);
            device.record(slot.project_cb, list)?;
            device.reset_fence(slot.readback.id())?;
            device.submit(
                compute,
                &[SubmitInfo {
                    command_buffers: vec![slot.project_cb],
                    ..Default::default()
                }],
                Some(slot.readback.id()),
            )?;
            slot.transition(SlotState::PreFrameSubmitted(Phase::Project))?;

            device.wait_fence(slot.readback.id(), timeout)?;
            slot.transition(SlotState::AwaitingReadback)?;
            let mut bytes = [0u8; 4];
            device.read_mapped(slot.tiles_rendered.id(), 0, &mut bytes)?;
            u32::from_le_bytes(bytes)
        };

        let mut grew = false;
        if tiles_rendered > slot.tiles.capacity {
            let capacity = grown_capacity(tiles_rendered, self.config.effective_growth());
            log::debug!(
                "Slot {}: growing tile buffers {} -> {} ({} tiles rendered)",
                slot.index,
                slot.tiles.capacity,
                capacity,
                tiles_rendered
            );
            slot.tiles = TileBuffers::allocate(device, capacity)?;
            slot.write_descriptors(&self.scene)?;
            grew = true;
        }
        slot.max_tiles_rendered = slot.max_tiles_rendered.max(tiles_rendered);

        let pass = SortPass {
            push: PushConstants {
                tiles_rendered,
                ..push
            },
            radix_passes: self.radix_passes,
            tiles: tile_grid(self.extent.0, self.extent.1),
            ranges: slot.ranges.id(),
            output: slot.output.id(),
            handoff,
        };
        let mut list = CommandList::new();
        passes::record_sort(&mut list, &self.programs, sets, &pass);
        device.record(slot.sort_cb, list)?;

        let signals = match handoff {
            Some(_) => vec![slot.ownership.id()],
            None => Vec::new(),
        };
        device.reset_fence(slot.pre_frame.id())?;
        device.submit(
            compute,
            &[SubmitInfo {
                command_buffers: vec![slot.sort_cb],
                signals,
                ..Default::default()
            }],
            Some(slot.pre_frame.id()),
        )?;
        slot.ownership_pending = handoff.is_some();
        slot.transition(SlotState::PreFrameSubmitted(Phase::Sort))?;

        Ok(FrameReport {
            slot: slot.index,
            tiles_rendered,
            tile_capacity: slot.tiles.capacity,
            grew,
            radix_passes: self.radix_passes,
        })
    }

    /// Copy the current slot's output into `swap_image` on the graphics queue.
    ///
    /// Waits on the frame's `image_acquired` (and the compute handoff under async
    /// compute), signals `render_done` and the frame's in-flight fence.
    pub fn draw(&mut self, swap_image: ImageId) -> EngineResult<()> {
        let presentation = self.presentation()?;
        let graphics = match self.queues.graphics {
            Some(graphics) if presentation.supports_presentation() => graphics,
            _ => return Err(EngineError::PresentationUnsupported),
        };
        let frame = presentation.current_frame();
        let sync = presentation.frame_sync(frame);
        let handoff = self.handoff();
        let slot_count = self.slots.len();
        let slot = &mut self.slots[frame as usize % slot_count];
        if !slot.state().can_transition(SlotState::DrawSubmitted) {
            return Err(EngineError::InvalidSlotTransition {
                from: slot.state(),
                to: SlotState::DrawSubmitted,
            });
        }
        let draw_cb = slot.draw_cb.ok_or(EngineError::PresentationUnsupported)?;

        let acquire = handoff.filter(|_| slot.ownership_pending);
        let mut list = CommandList::new();
        passes::record_draw(&mut list, slot.output.id(), swap_image, acquire);
        self.device.record(draw_cb, list)?;

        let mut waits = vec![SemaphoreWait {
            semaphore: sync.image_acquired,
            stage: Stage::Transfer,
        }];
        if acquire.is_some() {
            waits.push(SemaphoreWait {
                semaphore: slot.ownership.id(),
                stage: Stage::Transfer,
            });
        }
        self.device.submit(
            graphics,
            &[SubmitInfo {
                command_buffers: vec![draw_cb],
                waits,
                signals: vec![sync.render_done],
            }],
            Some(sync.in_flight),
        )?;
        slot.ownership_pending = false;
        slot.transition(SlotState::DrawSubmitted)?;
        slot.transition(SlotState::PresentReady)?;
        Ok(())
    }

    /// Copy a slot's output image to the host as tightly packed RGBA8 rows
    pub fn read_output(&mut self, slot: u32) -> EngineResult<Vec<u8>> {
        let index = slot as usize;
        if index >= self.slots.len() {
            return Err(GpuError::InvalidHandle("frame slot").into());
        }
        self.device.wait_idle()?;

        // Under async compute the image ends every frame released to graphics
        let handoff = self.handoff();
        let family = match handoff {
            Some(handoff) => handoff.dst_family,
            None => self.queues.compute,
        };
        let slot = &mut self.slots[index];
        let acquire = handoff.filter(|_| slot.ownership_pending);

        let size = self.extent.0 as u64 * self.extent.1 as u64 * 4;
        let staging = OwnedBuffer::create(
            &self.device,
            &BufferDesc {
                label: "output readback",
                size,
                usage: BufferUsage::TRANSFER_DST,
                location: MemoryLocation::GpuToCpu,
            },
        )?;
        let pool = OwnedCommandPool::create(&self.device, family)?;
        let command_buffer = self.device.allocate_command_buffer(pool.id())?;
        let fence = OwnedFence::create(&self.device, false)?;

        let mut list = CommandList::new();
        if let Some(acquire) = acquire {
            list.image_barrier(passes::output_handoff(slot.output.id(), acquire));
        }
        list.copy_image_to_buffer(slot.output.id(), ImageLayout::TransferSrc, staging.id())
            .memory_barrier(SyncPoint::TRANSFER_WRITE, SyncPoint::HOST_READ);
        self.device.record(command_buffer, list)?;

        let waits = match acquire {
            Some(_) => vec![SemaphoreWait {
                semaphore: slot.ownership.id(),
                stage: Stage::Transfer,
            }],
            None => Vec::new(),
        };
        self.device.submit(
            family,
            &[SubmitInfo {
                command_buffers: vec![command_buffer],
                waits,
                ..Default::default()
            }],
            Some(fence.id()),
        )?;
        self.device.wait_fence(fence.id(), self.config.fence_timeout())?;
        if acquire.is_some() {
            slot.ownership_pending = false;
        }

        let mut pixels = vec![0u8; size as usize];
        self.device.read_mapped(staging.id(), 0, &mut pixels)?;
        Ok(pixels)
    }

    /// Transform slot assigned to `entity` by the last compile
    pub fn transform_slot(&self, entity: Entity) -> Option<u32> {
        self.transform_slots.by_entity.get(&entity).copied()
    }

    pub fn transfers(&self) -> &TransferQueue {
        &self.transfer
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn queues(&self) -> QueueFamilies {
        self.queues
    }

    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slot_state(&self, slot: u32) -> Option<SlotState> {
        self.slots.get(slot as usize).map(FrameSlot::state)
    }

    pub fn tile_capacity(&self, slot: u32) -> Option<u32> {
        self.slots.get(slot as usize).map(|slot| slot.tiles.capacity)
    }

    #[cfg(test)]
    pub(crate) fn ranges_buffer(&self, slot: u32) -> Option<crate::hal::BufferId> {
        self.slots.get(slot as usize).map(|slot| slot.ranges.id())
    }

    /// Largest tiles-rendered value a slot has seen
    pub fn max_tiles_rendered(&self, slot: u32) -> Option<u32> {
        self.slots.get(slot as usize).map(|slot| slot.max_tiles_rendered)
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn radix_passes(&self) -> u32 {
        self.radix_passes
    }

    pub fn point_count(&self) -> u32 {
        self.scene.point_count
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Drop for ComputeEngine {
    fn drop(&mut self) {
        self.transfer.wait_empty();
        if let Err(e) = self.device.wait_idle() {
            log::error!("Waiting for device idle on engine teardown: {}", e);
        }
        if let Some(presentation) = self.presentation.upgrade() {
            presentation.unregister_resize(self.resize_token);
        }
    }
}
