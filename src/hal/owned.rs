//! Scope-bound owners for device objects.
//!
//! Each owner keeps the device alive and destroys its object on drop, so a
//! setup path that bails out halfway with `?` releases whatever it created.

use std::fmt;
use std::sync::Arc;

use super::{
    BufferDesc, BufferId, CommandPoolId, DescriptorSetId, FenceId, GpuDevice, GpuResult, ImageDesc,
    ImageId, LayoutId, PipelineLayoutDesc, ProgramId, SemaphoreId,
};
use crate::layout::ProgramKind;

/// Device object that can be destroyed through [`GpuDevice`]
pub trait DeviceObject: Copy {
    fn destroy(self, device: &dyn GpuDevice);
}

impl DeviceObject for BufferId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_buffer(self);
    }
}

impl DeviceObject for ImageId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_image(self);
    }
}

impl DeviceObject for SemaphoreId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_semaphore(self);
    }
}

impl DeviceObject for FenceId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_fence(self);
    }
}

impl DeviceObject for LayoutId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_pipeline_layout(self);
    }
}

impl DeviceObject for ProgramId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_program(self);
    }
}

impl DeviceObject for DescriptorSetId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_descriptor_set(self);
    }
}

impl DeviceObject for CommandPoolId {
    fn destroy(self, device: &dyn GpuDevice) {
        device.destroy_command_pool(self);
    }
}

pub struct Owned<T: DeviceObject> {
    device: Arc<dyn GpuDevice>,
    id: T,
}

impl<T: DeviceObject> Owned<T> {
    /// Take ownership of an object created on `device`
    pub fn new(device: Arc<dyn GpuDevice>, id: T) -> Self {
        Self { device, id }
    }

    pub fn id(&self) -> T {
        self.id
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }
}

impl<T: DeviceObject> Drop for Owned<T> {
    fn drop(&mut self) {
        self.id.destroy(self.device.as_ref());
    }
}

impl<T: DeviceObject + fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.id).finish()
    }
}

pub type OwnedBuffer = Owned<BufferId>;
pub type OwnedImage = Owned<ImageId>;
pub type OwnedSemaphore = Owned<SemaphoreId>;
pub type OwnedFence = Owned<FenceId>;
pub type OwnedLayout = Owned<LayoutId>;
pub type OwnedProgram = Owned<ProgramId>;
pub type OwnedDescriptorSet = Owned<DescriptorSetId>;
pub type OwnedCommandPool = Owned<CommandPoolId>;

impl Owned<BufferId> {
    pub fn create(device: &Arc<dyn GpuDevice>, desc: &BufferDesc<'_>) -> GpuResult<Self> {
        let id = device.create_buffer(desc)?;
        Ok(Self::new(Arc::clone(device), id))
    }

    pub fn size(&self) -> u64 {
        self.device.buffer_size(self.id).unwrap_or(0)
    }
}

impl Owned<ImageId> {
    pub fn create(device: &Arc<dyn GpuDevice>, desc: &ImageDesc<'_>) -> GpuResult<Self> {
        let id = device.create_image(desc)?;
        Ok(Self::new(Arc::clone(device), id))
    }
}

impl Owned<SemaphoreId> {
    pub fn create(device: &Arc<dyn GpuDevice>) -> GpuResult<Self> {
        let id = device.create_semaphore()?;
        Ok(Self::new(Arc::clone(device), id))
    }
}

impl Owned<FenceId> {
    pub fn create(device: &Arc<dyn GpuDevice>, signaled: bool) -> GpuResult<Self> {
        let id = device.create_fence(signaled)?;
        Ok(Self::new(Arc::clone(device), id))
    }
}

impl Owned<LayoutId> {
    pub fn create(device: &Arc<dyn GpuDevice>, desc: &PipelineLayoutDesc) -> GpuResult<Self> {
        let id = device.create_pipeline_layout(desc)?;
        Ok(Self::new(Arc::clone(device), id))
    }
}

impl Owned<ProgramId> {
    pub fn create(device: &Arc<dyn GpuDevice>, layout: LayoutId, kind: ProgramKind) -> GpuResult<Self> {
        let id = device.create_program(layout, kind)?;
        Ok(Self::new(Arc::clone(device), id))
    }
}

impl Owned<DescriptorSetId> {
    pub fn create(device: &Arc<dyn GpuDevice>, layout: LayoutId, index: u32) -> GpuResult<Self> {
        let id = device.create_descriptor_set(layout, index)?;
        Ok(Self::new(Arc::clone(device), id))
    }
}

impl Owned<CommandPoolId> {
    pub fn create(device: &Arc<dyn GpuDevice>, family: u32) -> GpuResult<Self> {
        let id = device.create_command_pool(family)?;
        Ok(Self::new(Arc::clone(device), id))
    }
}
