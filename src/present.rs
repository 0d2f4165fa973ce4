//! Presentation contract consumed by the compute engine.
//!
//! The engine never owns its presenter: it holds a `Weak` reference and asks it
//! for the frame index, framebuffer size and per-frame synchronization objects.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::hal::{
    FenceId, GpuDevice, GpuError, ImageDesc, ImageFormat, ImageId, ImageLayout, ImageUsage, OwnedFence,
    OwnedImage, OwnedSemaphore, SemaphoreId, SemaphoreWait, Stage, SubmitInfo,
};

/// Synchronization objects of one in-flight frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameSync {
    /// Signaled when the swap image may be written
    pub image_acquired: SemaphoreId,
    /// Signaled by the engine's draw submission
    pub render_done: SemaphoreId,
    /// Signaled when the draw submission completes
    pub in_flight: FenceId,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResizeToken(u64);

pub type ResizeCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub trait Presentation: Send + Sync {
    fn frames_in_flight(&self) -> u32;
    fn framebuffer_size(&self) -> (u32, u32);
    fn current_frame(&self) -> u32;
    fn frame_sync(&self, frame: u32) -> FrameSync;
    /// Whether a graphics queue and swap images exist
    fn supports_presentation(&self) -> bool;
    fn register_resize(&self, callback: ResizeCallback) -> ResizeToken;
    fn unregister_resize(&self, token: ResizeToken);
}

/// Registered resize callbacks, shared by presenters
#[derive(Default)]
pub struct ResizeCallbacks {
    next: AtomicU64,
    callbacks: Mutex<Vec<(ResizeToken, ResizeCallback)>>,
}

impl ResizeCallbacks {
    pub fn register(&self, callback: ResizeCallback) -> ResizeToken {
        let token = ResizeToken(self.next.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((token, callback));
        token
    }

    pub fn unregister(&self, token: ResizeToken) {
        self.callbacks.lock().retain(|(t, _)| *t != token);
    }

    pub fn fire(&self, width: u32, height: u32) {
        for (_, callback) in self.callbacks.lock().iter() {
            callback(width, height);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct HeadlessFrame {
    swap_image: Option<OwnedImage>,
    image_acquired: OwnedSemaphore,
    render_done: OwnedSemaphore,
    in_flight: OwnedFence,
}

/// Offscreen presenter with device-side swap images.
///
/// `acquire` and `present` run the same semaphore protocol a swapchain would,
/// using empty submissions on the graphics queue.
pub struct HeadlessPresenter {
    device: Arc<dyn GpuDevice>,
    graphics: Option<u32>,
    frames: Mutex<Vec<HeadlessFrame>>,
    size: Mutex<(u32, u32)>,
    current: AtomicU32,
    resize: ResizeCallbacks,
}

impl HeadlessPresenter {
    pub fn new(device: Arc<dyn GpuDevice>, frames_in_flight: u32, width: u32, height: u32) -> EngineResult<Self> {
        let graphics = device.info().queues.graphics;
        let mut frames = Vec::with_capacity(frames_in_flight as usize);
        for _ in 0..frames_in_flight.max(1) {
            frames.push(HeadlessFrame {
                swap_image: Self::swap_image_for(&device, graphics, width, height)?,
                image_acquired: OwnedSemaphore::create(&device)?,
                render_done: OwnedSemaphore::create(&device)?,
                in_flight: OwnedFence::create(&device, true)?,
            });
        }
        Ok(Self {
            device,
            graphics,
            frames: Mutex::new(frames),
            size: Mutex::new((width.max(1), height.max(1))),
            current: AtomicU32::new(0),
            resize: ResizeCallbacks::default(),
        })
    }

    fn swap_image_for(
        device: &Arc<dyn GpuDevice>,
        graphics: Option<u32>,
        width: u32,
        height: u32,
    ) -> EngineResult<Option<OwnedImage>> {
        if graphics.is_none() {
            return Ok(None);
        }
        let image = OwnedImage::create(
            device,
            &ImageDesc {
                label: "swap image",
                width: width.max(1),
                height: height.max(1),
                format: ImageFormat::Rgba8Unorm,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
            },
        )?;
        Ok(Some(image))
    }

    /// Wait for the current frame's previous draw, then signal `image_acquired`.
    /// Returns the swap image the engine should draw into.
    pub fn acquire(&self) -> EngineResult<ImageId> {
        let graphics = self.graphics.ok_or(EngineError::PresentationUnsupported)?;
        let frames = self.frames.lock();
        let frame = &frames[self.current_frame() as usize % frames.len()];
        let image = frame
            .swap_image
            .as_ref()
            .map(|image| image.id())
            .ok_or(EngineError::PresentationUnsupported)?;

        self.device.wait_fence(frame.in_flight.id(), None)?;
        self.device.reset_fence(frame.in_flight.id())?;
        self.device.submit(
            graphics,
            &[SubmitInfo {
                signals: vec![frame.image_acquired.id()],
                ..Default::default()
            }],
            None,
        )?;
        Ok(image)
    }

    /// Consume `render_done`, check the swap image is presentable and advance.
    pub fn present(&self) -> EngineResult<()> {
        let graphics = self.graphics.ok_or(EngineError::PresentationUnsupported)?;
        {
            let frames = self.frames.lock();
            let frame = &frames[self.current_frame() as usize % frames.len()];
            self.device.submit(
                graphics,
                &[SubmitInfo {
                    waits: vec![SemaphoreWait {
                        semaphore: frame.render_done.id(),
                        stage: Stage::AllCommands,
                    }],
                    ..Default::default()
                }],
                None,
            )?;
            if let Some(image) = &frame.swap_image {
                let layout = self.device.image_layout(image.id()).unwrap_or(ImageLayout::Undefined);
                if layout != ImageLayout::PresentSrc {
                    return Err(GpuError::LayoutMismatch {
                        resource: "swap image".into(),
                        expected: ImageLayout::PresentSrc,
                        found: layout,
                    }
                    .into());
                }
            }
        }
        self.advance();
        Ok(())
    }

    /// Move to the next frame index without presenting (compute-only loops)
    pub fn advance(&self) {
        let count = self.frames_in_flight();
        let next = (self.current.load(Ordering::Acquire) + 1) % count;
        self.current.store(next, Ordering::Release);
    }

    pub fn swap_image(&self, frame: u32) -> Option<ImageId> {
        let frames = self.frames.lock();
        frames
            .get(frame as usize)
            .and_then(|frame| frame.swap_image.as_ref())
            .map(|image| image.id())
    }

    /// Recreate swap images at the new size and notify listeners
    pub fn resize(&self, width: u32, height: u32) -> EngineResult<()> {
        let (width, height) = (width.max(1), height.max(1));
        if *self.size.lock() == (width, height) {
            return Ok(());
        }
        self.device.wait_idle()?;
        {
            let mut frames = self.frames.lock();
            for frame in frames.iter_mut() {
                frame.swap_image = Self::swap_image_for(&self.device, self.graphics, width, height)?;
            }
        }
        *self.size.lock() = (width, height);
        log::debug!("Headless framebuffer resized to {}x{}", width, height);
        self.resize.fire(width, height);
        Ok(())
    }

    pub fn resize_listeners(&self) -> usize {
        self.resize.len()
    }
}

impl Presentation for HeadlessPresenter {
    fn frames_in_flight(&self) -> u32 {
        self.frames.lock().len() as u32
    }

    fn framebuffer_size(&self) -> (u32, u32) {
        *self.size.lock()
    }

    fn current_frame(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    fn frame_sync(&self, frame: u32) -> FrameSync {
        let frames = self.frames.lock();
        let frame = &frames[frame as usize % frames.len()];
        FrameSync {
            image_acquired: frame.image_acquired.id(),
            render_done: frame.render_done.id(),
            in_flight: frame.in_flight.id(),
        }
    }

    fn supports_presentation(&self) -> bool {
        self.graphics.is_some()
    }

    fn register_resize(&self, callback: ResizeCallback) -> ResizeToken {
        self.resize.register(callback)
    }

    fn unregister_resize(&self, token: ResizeToken) {
        self.resize.unregister(token);
    }
}
