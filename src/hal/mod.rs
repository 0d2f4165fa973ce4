//! Explicit-synchronization device interface.
//!
//! The engine records command lists against this interface and submits them to
//! queue families with binary semaphores and fences, the way a low-level GPU API
//! expects. Two backends implement it:
//! - [`wgpu_backend::WgpuDevice`] drives a real adapter through wgpu
//! - [`software::SoftwareDevice`] executes the same programs on the host and
//!   validates layouts, queue-family ownership and barriers

pub mod arena;
pub mod owned;
pub mod software;
pub mod wgpu_backend;

use std::ops::BitOr;
use std::time::Duration;

use thiserror::Error;

use crate::layout::ProgramKind;
pub use arena::RawHandle;
pub use owned::{
    Owned, OwnedBuffer, OwnedCommandPool, OwnedDescriptorSet, OwnedFence, OwnedImage, OwnedLayout,
    OwnedProgram, OwnedSemaphore,
};

macro_rules! define_ids {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {$(
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(RawHandle);

        impl $name {
            pub fn from_raw(raw: RawHandle) -> Self {
                Self(raw)
            }

            pub fn raw(self) -> RawHandle {
                self.0
            }
        }
    )*};
}

define_ids!(
    /// Device buffer
    BufferId,
    /// Device image (2D, single mip)
    ImageId,
    /// Binary semaphore
    SemaphoreId,
    /// Host-waitable fence
    FenceId,
    /// Pipeline layout shared by all compute programs
    LayoutId,
    /// Compute program
    ProgramId,
    /// Descriptor set instance
    DescriptorSetId,
    /// Command pool bound to one queue family
    CommandPoolId,
    /// Command buffer allocated from a pool
    CommandBufferId,
);

/// Errors reported by a device backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    #[error("out of device memory allocating {label} ({size} bytes)")]
    OutOfMemory { label: String, size: u64 },

    #[error("invalid or destroyed {0} handle")]
    InvalidHandle(&'static str),

    #[error("{resource} is owned by queue family {owner} but was used on family {used_on}")]
    OwnershipViolation {
        resource: String,
        owner: u32,
        used_on: u32,
    },

    #[error("{resource} expected layout {expected:?}, found {found:?}")]
    LayoutMismatch {
        resource: String,
        expected: ImageLayout,
        found: ImageLayout,
    },

    #[error("semaphore waited without a pending signal")]
    SemaphoreNotSignaled,

    #[error("semaphore signaled twice without an intervening wait")]
    SemaphoreAlreadySignaled,

    #[error("command pool accessed concurrently from two threads")]
    PoolContention,

    #[error("unsynchronized access: {0}")]
    Hazard(String),

    #[error("{resource}: access [{offset}, {offset}+{len}) exceeds size {size}")]
    OutOfBounds {
        resource: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("buffer is not host visible")]
    NotHostVisible,

    #[error("fence wait timed out")]
    Timeout,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {0}")]
    Backend(String),
}

pub type GpuResult<T> = Result<T, GpuError>;

/// Where a buffer's memory lives
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    GpuOnly,
    /// Host-visible, written by the host (staging, uniforms)
    CpuToGpu,
    /// Host-visible, read back by the host
    GpuToCpu,
}

impl MemoryLocation {
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const STORAGE: Self = Self(1 << 0);
    pub const UNIFORM: Self = Self(1 << 1);
    pub const TRANSFER_SRC: Self = Self(1 << 2);
    pub const TRANSFER_DST: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct ImageUsage(u32);

impl ImageUsage {
    pub const STORAGE: Self = Self(1 << 0);
    pub const SAMPLED: Self = Self(1 << 1);
    pub const TRANSFER_SRC: Self = Self(1 << 2);
    pub const TRANSFER_DST: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ImageUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Rgba8Unorm,
}

impl ImageFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageFormat::Rgba8Unorm => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ImageDesc<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    None,
    TopOfPipe,
    Transfer,
    Compute,
    Host,
    AllCommands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Access {
    None,
    TransferRead,
    TransferWrite,
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    HostRead,
    MemoryReadWrite,
}

/// Pipeline stage plus the memory access performed there
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncPoint {
    pub stage: Stage,
    pub access: Access,
}

impl SyncPoint {
    pub const NONE: Self = Self::new(Stage::None, Access::None);
    pub const TOP: Self = Self::new(Stage::TopOfPipe, Access::None);
    pub const TRANSFER_READ: Self = Self::new(Stage::Transfer, Access::TransferRead);
    pub const TRANSFER_WRITE: Self = Self::new(Stage::Transfer, Access::TransferWrite);
    pub const COMPUTE_READ: Self = Self::new(Stage::Compute, Access::ShaderRead);
    pub const COMPUTE_WRITE: Self = Self::new(Stage::Compute, Access::ShaderWrite);
    pub const COMPUTE_READ_WRITE: Self = Self::new(Stage::Compute, Access::ShaderReadWrite);
    pub const HOST_READ: Self = Self::new(Stage::Host, Access::HostRead);
    pub const ALL: Self = Self::new(Stage::AllCommands, Access::MemoryReadWrite);

    pub const fn new(stage: Stage, access: Access) -> Self {
        Self { stage, access }
    }
}

/// Queue-family indices the device exposes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Present only when on-screen output is supported
    pub graphics: Option<u32>,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    /// Compute runs on a different family than graphics, so every frame needs an
    /// ownership transfer of the output image.
    pub fn async_compute(&self) -> bool {
        self.graphics.is_some_and(|graphics| graphics != self.compute)
    }

    pub fn contains(&self, family: u32) -> bool {
        self.graphics == Some(family) || self.compute == family || self.transfer == family
    }

    /// Distinct family indices, graphics first
    pub fn distinct(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(3);
        for family in [self.graphics, Some(self.compute), Some(self.transfer)]
            .into_iter()
            .flatten()
        {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    pub shader_int64: bool,
    pub shader_int64_atomics: bool,
    pub runtime_descriptor_arrays: bool,
    pub synchronization2: bool,
}

impl DeviceCapabilities {
    pub const REQUIRED: Self = Self {
        shader_int64: true,
        shader_int64_atomics: true,
        runtime_descriptor_arrays: true,
        synchronization2: true,
    };

    /// Names of required capabilities this device lacks
    pub fn missing(&self, required: &DeviceCapabilities) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if required.shader_int64 && !self.shader_int64 {
            missing.push("64-bit integer shader arithmetic");
        }
        if required.shader_int64_atomics && !self.shader_int64_atomics {
            missing.push("64-bit integer atomics");
        }
        if required.runtime_descriptor_arrays && !self.runtime_descriptor_arrays {
            missing.push("runtime-sized descriptor arrays");
        }
        if required.synchronization2 && !self.synchronization2 {
            missing.push("synchronization2 barriers");
        }
        missing
    }
}

#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub capabilities: DeviceCapabilities,
    pub queues: QueueFamilies,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    /// Rgba8Unorm storage image, written by compute
    StorageImage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BindingDesc {
    pub binding: u32,
    pub kind: BindingKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SetLayoutDesc {
    pub bindings: Vec<BindingDesc>,
}

impl SetLayoutDesc {
    pub fn kind_of(&self, binding: u32) -> Option<BindingKind> {
        self.bindings
            .iter()
            .find(|desc| desc.binding == binding)
            .map(|desc| desc.kind)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PipelineLayoutDesc {
    pub sets: Vec<SetLayoutDesc>,
    pub push_constant_size: u32,
}

impl PipelineLayoutDesc {
    pub fn binding_count(&self) -> usize {
        self.sets.iter().map(|set| set.bindings.len()).sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorResource {
    Buffer(BufferId),
    Image(ImageId),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub resource: DescriptorResource,
}

impl DescriptorWrite {
    pub fn buffer(binding: u32, buffer: BufferId) -> Self {
        Self {
            binding,
            resource: DescriptorResource::Buffer(buffer),
        }
    }

    pub fn image(binding: u32, image: ImageId) -> Self {
        Self {
            binding,
            resource: DescriptorResource::Image(image),
        }
    }
}

/// Release (on `src_family`) / acquire (on `dst_family`) pair of a queue-family
/// ownership transfer. The same barrier is recorded on both queues.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OwnershipTransfer {
    pub src_family: u32,
    pub dst_family: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferId,
    pub src: SyncPoint,
    pub dst: SyncPoint,
    pub ownership: Option<OwnershipTransfer>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageId,
    pub src: SyncPoint,
    pub dst: SyncPoint,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub ownership: Option<OwnershipTransfer>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    BindProgram(ProgramId),
    BindDescriptorSet {
        index: u32,
        set: DescriptorSetId,
    },
    PushConstants {
        offset: u32,
        data: Vec<u8>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBuffer {
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    },
    /// Tightly packed rows, whole image
    CopyBufferToImage {
        src: BufferId,
        dst: ImageId,
        dst_layout: ImageLayout,
    },
    /// Tightly packed rows, whole image
    CopyImageToBuffer {
        src: ImageId,
        src_layout: ImageLayout,
        dst: BufferId,
    },
    CopyImage {
        src: ImageId,
        src_layout: ImageLayout,
        dst: ImageId,
        dst_layout: ImageLayout,
    },
    FillBuffer {
        dst: BufferId,
        offset: u64,
        size: Option<u64>,
        value: u32,
    },
    MemoryBarrier {
        src: SyncPoint,
        dst: SyncPoint,
    },
    BufferBarrier(BufferBarrier),
    ImageBarrier(ImageBarrier),
}

/// Host-side recording of one command buffer's contents
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_program(&mut self, program: ProgramId) -> &mut Self {
        self.commands.push(Command::BindProgram(program));
        self
    }

    pub fn bind_descriptor_set(&mut self, index: u32, set: DescriptorSetId) -> &mut Self {
        self.commands.push(Command::BindDescriptorSet { index, set });
        self
    }

    pub fn push_constants(&mut self, offset: u32, data: &[u8]) -> &mut Self {
        self.commands.push(Command::PushConstants {
            offset,
            data: data.to_vec(),
        });
        self
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> &mut Self {
        self.commands.push(Command::Dispatch { x, y, z });
        self
    }

    pub fn copy_buffer(&mut self, src: BufferId, dst: BufferId, dst_offset: u64, size: u64) -> &mut Self {
        self.commands.push(Command::CopyBuffer {
            src,
            src_offset: 0,
            dst,
            dst_offset,
            size,
        });
        self
    }

    pub fn copy_buffer_to_image(&mut self, src: BufferId, dst: ImageId, dst_layout: ImageLayout) -> &mut Self {
        self.commands.push(Command::CopyBufferToImage { src, dst, dst_layout });
        self
    }

    pub fn copy_image_to_buffer(&mut self, src: ImageId, src_layout: ImageLayout, dst: BufferId) -> &mut Self {
        self.commands.push(Command::CopyImageToBuffer { src, src_layout, dst });
        self
    }

    pub fn copy_image(
        &mut self,
        src: ImageId,
        src_layout: ImageLayout,
        dst: ImageId,
        dst_layout: ImageLayout,
    ) -> &mut Self {
        self.commands.push(Command::CopyImage {
            src,
            src_layout,
            dst,
            dst_layout,
        });
        self
    }

    pub fn fill_buffer(&mut self, dst: BufferId, value: u32) -> &mut Self {
        self.commands.push(Command::FillBuffer {
            dst,
            offset: 0,
            size: None,
            value,
        });
        self
    }

    pub fn memory_barrier(&mut self, src: SyncPoint, dst: SyncPoint) -> &mut Self {
        self.commands.push(Command::MemoryBarrier { src, dst });
        self
    }

    pub fn buffer_barrier(&mut self, barrier: BufferBarrier) -> &mut Self {
        self.commands.push(Command::BufferBarrier(barrier));
        self
    }

    pub fn image_barrier(&mut self, barrier: ImageBarrier) -> &mut Self {
        self.commands.push(Command::ImageBarrier(barrier));
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: SemaphoreId,
    pub stage: Stage,
}

/// One batch of a queue submission
#[derive(Clone, Debug, Default)]
pub struct SubmitInfo {
    pub command_buffers: Vec<CommandBufferId>,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<SemaphoreId>,
}

/// Device operations the engine relies on.
///
/// Command pools (and the command buffers allocated from them) are externally
/// synchronized: callers must not touch one pool from two threads at once.
pub trait GpuDevice: Send + Sync {
    fn info(&self) -> &DeviceInfo;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> GpuResult<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId);
    fn buffer_size(&self, buffer: BufferId) -> Option<u64>;
    /// Write into host-visible memory
    fn write_mapped(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()>;
    /// Invalidate and read host-visible memory
    fn read_mapped(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> GpuResult<()>;

    fn create_image(&self, desc: &ImageDesc<'_>) -> GpuResult<ImageId>;
    fn destroy_image(&self, image: ImageId);
    /// Layout the image is in after all submitted work executes
    fn image_layout(&self, image: ImageId) -> Option<ImageLayout>;

    fn create_semaphore(&self) -> GpuResult<SemaphoreId>;
    fn destroy_semaphore(&self, semaphore: SemaphoreId);

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceId>;
    fn destroy_fence(&self, fence: FenceId);
    /// `None` waits without limit
    fn wait_fence(&self, fence: FenceId, timeout: Option<Duration>) -> GpuResult<()>;
    fn reset_fence(&self, fence: FenceId) -> GpuResult<()>;
    fn fence_signaled(&self, fence: FenceId) -> GpuResult<bool>;

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> GpuResult<LayoutId>;
    fn destroy_pipeline_layout(&self, layout: LayoutId);
    fn create_program(&self, layout: LayoutId, kind: ProgramKind) -> GpuResult<ProgramId>;
    fn destroy_program(&self, program: ProgramId);

    fn create_descriptor_set(&self, layout: LayoutId, index: u32) -> GpuResult<DescriptorSetId>;
    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]) -> GpuResult<()>;
    fn destroy_descriptor_set(&self, set: DescriptorSetId);

    fn create_command_pool(&self, family: u32) -> GpuResult<CommandPoolId>;
    /// Frees every command buffer still allocated from the pool
    fn destroy_command_pool(&self, pool: CommandPoolId);
    fn allocate_command_buffer(&self, pool: CommandPoolId) -> GpuResult<CommandBufferId>;
    /// Replace the command buffer's contents
    fn record(&self, command_buffer: CommandBufferId, commands: CommandList) -> GpuResult<()>;
    fn free_command_buffers(&self, pool: CommandPoolId, command_buffers: &[CommandBufferId]);

    fn submit(&self, family: u32, submits: &[SubmitInfo], fence: Option<FenceId>) -> GpuResult<()>;
    fn wait_idle(&self) -> GpuResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_compute_requires_graphics_on_other_family() {
        let shared = QueueFamilies { graphics: Some(0), compute: 0, transfer: 1 };
        let split = QueueFamilies { graphics: Some(0), compute: 1, transfer: 2 };
        let headless = QueueFamilies { graphics: None, compute: 1, transfer: 2 };

        assert!(!shared.async_compute());
        assert!(split.async_compute());
        assert!(!headless.async_compute());
        assert_eq!(split.distinct(), vec![0, 1, 2]);
        assert_eq!(shared.distinct(), vec![0, 1]);
    }

    #[test]
    fn test_missing_capabilities_are_named() {
        let caps = DeviceCapabilities {
            shader_int64: true,
            shader_int64_atomics: false,
            runtime_descriptor_arrays: true,
            synchronization2: false,
        };
        let missing = caps.missing(&DeviceCapabilities::REQUIRED);
        assert_eq!(missing.len(), 2);
        assert!(DeviceCapabilities::REQUIRED.missing(&DeviceCapabilities::REQUIRED).is_empty());
    }
}
