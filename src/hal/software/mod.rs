//! Host-executed device.
//!
//! Submissions run synchronously on the calling thread, with the compute
//! programs executed by the rayon kernels in [`kernels`]. Alongside execution
//! the device validates what a GPU driver would leave undefined:
//! - image layouts named by copies, barriers and storage bindings
//! - queue-family ownership, including release/acquire pairs
//! - binary semaphore signal/wait pairing
//! - reads or writes of a resource written earlier in the same command buffer
//!   with no barrier in between
//! - concurrent use of one command pool
//!
//! Every submitted batch is appended to a log tests can inspect.

pub mod kernels;
pub mod memory;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::arena::Arena;
use super::{
    BufferBarrier, BufferDesc, BufferId, BufferUsage, Command, CommandBufferId, CommandList, CommandPoolId,
    DescriptorResource, DescriptorSetId, DescriptorWrite, DeviceCapabilities, DeviceInfo, FenceId, GpuDevice,
    GpuError, GpuResult, ImageBarrier, ImageDesc, ImageId, ImageLayout, ImageUsage, LayoutId, MemoryLocation,
    PipelineLayoutDesc, ProgramId, QueueFamilies, SemaphoreId, SubmitInfo, BindingKind,
};
use crate::layout::{PUSH_CONSTANT_SIZE, ProgramKind, PushConstants};
use kernels::{Bound, Slot};
use memory::{ImageMemory, Memory};

/// Shape of the simulated adapter
#[derive(Debug, Clone)]
pub struct SoftwareConfig {
    /// Expose a graphics family for on-screen output
    pub presentation: bool,
    /// Put compute on its own family (needs `presentation`)
    pub async_compute: bool,
    /// Give transfers a family of their own
    pub dedicated_transfer: bool,
    pub capabilities: DeviceCapabilities,
    /// Total bytes the device may allocate
    pub memory_limit: Option<u64>,
    /// Every submission to this family fails with a backend error
    pub failing_family: Option<u32>,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            presentation: true,
            async_compute: false,
            dedicated_transfer: true,
            capabilities: DeviceCapabilities::REQUIRED,
            memory_limit: None,
            failing_family: None,
        }
    }
}

impl SoftwareConfig {
    pub fn queue_families(&self) -> QueueFamilies {
        let graphics = self.presentation.then_some(0);
        let compute = match graphics {
            Some(g) if self.async_compute => g + 1,
            Some(g) => g,
            None => 0,
        };
        let transfer = if self.dedicated_transfer { compute + 1 } else { graphics.unwrap_or(compute) };
        QueueFamilies {
            graphics,
            compute,
            transfer,
        }
    }
}

/// One submitted batch as the device saw it
#[derive(Clone, Debug, PartialEq)]
pub struct SubmissionRecord {
    pub family: u32,
    pub waits: Vec<SemaphoreId>,
    pub signals: Vec<SemaphoreId>,
    pub fence: Option<FenceId>,
    pub dispatches: Vec<ProgramKind>,
    /// Copy and fill commands executed
    pub copies: usize,
}

impl SubmissionRecord {
    pub fn dispatched(&self, kind: ProgramKind) -> usize {
        self.dispatches.iter().filter(|&&k| k == kind).count()
    }
}

struct SwBuffer {
    label: String,
    memory: Memory,
    usage: BufferUsage,
    location: MemoryLocation,
    owner: Option<u32>,
    in_transit: Option<u32>,
}

struct SwImage {
    label: String,
    memory: ImageMemory,
    usage: ImageUsage,
    layout: ImageLayout,
    owner: Option<u32>,
    in_transit: Option<u32>,
}

struct SwProgram {
    kind: ProgramKind,
}

struct SwDescriptorSet {
    kinds: Vec<(u32, BindingKind)>,
    bindings: Vec<(u32, DescriptorResource)>,
}

struct SwPool {
    family: u32,
    busy: Arc<AtomicBool>,
    command_buffers: Vec<CommandBufferId>,
}

struct SwCommandBuffer {
    pool: CommandPoolId,
    commands: CommandList,
}

#[derive(Default)]
struct State {
    buffers: Arena<SwBuffer>,
    images: Arena<SwImage>,
    semaphores: Arena<bool>,
    fences: Arena<bool>,
    layouts: Arena<PipelineLayoutDesc>,
    programs: Arena<SwProgram>,
    sets: Arena<SwDescriptorSet>,
    pools: Arena<SwPool>,
    command_buffers: Arena<SwCommandBuffer>,
    allocated: u64,
    memory_limit: Option<u64>,
    contention: usize,
    log: Vec<SubmissionRecord>,
}

pub struct SoftwareDevice {
    info: DeviceInfo,
    failing_family: Option<u32>,
    state: Mutex<State>,
    fence_signaled: Condvar,
}

/// Marks a command pool busy until dropped
struct PoolGuard(Arc<AtomicBool>);

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
enum Resource {
    Buffer(BufferId),
    Image(ImageId),
}

impl SoftwareDevice {
    pub fn new(config: SoftwareConfig) -> Self {
        let queues = config.queue_families();
        log::info!(
            "Software device: graphics {:?}, compute {}, transfer {} (async compute: {})",
            queues.graphics,
            queues.compute,
            queues.transfer,
            queues.async_compute()
        );
        Self {
            info: DeviceInfo {
                name: "software rasterizer".to_string(),
                capabilities: config.capabilities,
                queues,
            },
            failing_family: config.failing_family,
            state: Mutex::new(State {
                memory_limit: config.memory_limit,
                ..Default::default()
            }),
            fence_signaled: Condvar::new(),
        }
    }

    /// Every batch submitted so far, oldest first
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().log.clone()
    }

    /// Change the allocation cap; existing allocations are kept
    pub fn set_memory_limit(&self, limit: Option<u64>) {
        self.state.lock().memory_limit = limit;
    }

    pub fn clear_submissions(&self) {
        self.state.lock().log.clear();
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_images(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_semaphores(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Times a command pool was entered while another thread held it
    pub fn pool_contention(&self) -> usize {
        self.state.lock().contention
    }

    pub fn image_owner(&self, image: ImageId) -> Option<u32> {
        self.state.lock().images.get(image.raw()).and_then(|img| img.owner)
    }

    pub fn buffer_owner(&self, buffer: BufferId) -> Option<u32> {
        self.state.lock().buffers.get(buffer.raw()).and_then(|buf| buf.owner)
    }

    /// Snapshot of a buffer's memory, whatever its location
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(buffer.raw()).map(|buf| buf.memory.bytes().to_vec())
    }

    fn reserve(&self, state: &mut State, label: &str, size: u64) -> GpuResult<()> {
        if let Some(limit) = state.memory_limit {
            if state.allocated + size > limit {
                return Err(GpuError::OutOfMemory {
                    label: label.to_string(),
                    size,
                });
            }
        }
        state.allocated += size;
        Ok(())
    }

    fn enter_pool(&self, pool: CommandPoolId) -> GpuResult<PoolGuard> {
        let busy = {
            let state = self.state.lock();
            let pool = state.pools.get(pool.raw()).ok_or(GpuError::InvalidHandle("command pool"))?;
            Arc::clone(&pool.busy)
        };
        if busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.state.lock().contention += 1;
            return Err(GpuError::PoolContention);
        }
        Ok(PoolGuard(busy))
    }
}

impl State {
    fn buffer(&mut self, id: BufferId) -> GpuResult<&mut SwBuffer> {
        self.buffers.get_mut(id.raw()).ok_or(GpuError::InvalidHandle("buffer"))
    }

    fn image(&mut self, id: ImageId) -> GpuResult<&mut SwImage> {
        self.images.get_mut(id.raw()).ok_or(GpuError::InvalidHandle("image"))
    }

    fn label(&self, resource: Resource) -> String {
        match resource {
            Resource::Buffer(id) => self.buffers.get(id.raw()).map(|b| b.label.clone()),
            Resource::Image(id) => self.images.get(id.raw()).map(|i| i.label.clone()),
        }
        .unwrap_or_else(|| "<destroyed>".to_string())
    }

    /// First use on a family claims the resource; later use elsewhere must go
    /// through a release/acquire pair.
    fn claim(&mut self, resource: Resource, family: u32) -> GpuResult<()> {
        let (owner, in_transit, label) = match resource {
            Resource::Buffer(id) => {
                let buf = self.buffer(id)?;
                (&mut buf.owner, buf.in_transit, &buf.label)
            }
            Resource::Image(id) => {
                let img = self.image(id)?;
                (&mut img.owner, img.in_transit, &img.label)
            }
        };
        match (*owner, in_transit) {
            (None, None) => {
                *owner = Some(family);
                Ok(())
            }
            (Some(current), None) if current == family => Ok(()),
            (current, _) => Err(GpuError::OwnershipViolation {
                resource: label.clone(),
                owner: current.unwrap_or(family),
                used_on: family,
            }),
        }
    }

    fn expect_layout(&mut self, image: ImageId, expected: ImageLayout) -> GpuResult<()> {
        let img = self.image(image)?;
        if img.layout != expected {
            return Err(GpuError::LayoutMismatch {
                resource: img.label.clone(),
                expected,
                found: img.layout,
            });
        }
        Ok(())
    }
}

/// Per-command-buffer execution state
struct Exec {
    program: Option<ProgramKind>,
    sets: [Option<DescriptorSetId>; 3],
    push: [u8; PUSH_CONSTANT_SIZE as usize],
    unsynchronized: HashSet<Resource>,
}

impl Exec {
    fn new() -> Self {
        Self {
            program: None,
            sets: [None; 3],
            push: [0; PUSH_CONSTANT_SIZE as usize],
            unsynchronized: HashSet::new(),
        }
    }

    fn touch(&self, state: &State, resource: Resource, what: &str) -> GpuResult<()> {
        if self.unsynchronized.contains(&resource) {
            return Err(GpuError::Hazard(format!(
                "{} touches {} written earlier in the command buffer without a barrier",
                what,
                state.label(resource)
            )));
        }
        Ok(())
    }
}

fn execute(state: &mut State, family: u32, commands: &CommandList, record: &mut SubmissionRecord) -> GpuResult<()> {
    let mut exec = Exec::new();

    for command in commands.commands() {
        match command {
            Command::BindProgram(program) => {
                let program = state.programs.get(program.raw()).ok_or(GpuError::InvalidHandle("program"))?;
                exec.program = Some(program.kind);
            }
            Command::BindDescriptorSet { index, set } => {
                if !state.sets.contains(set.raw()) {
                    return Err(GpuError::InvalidHandle("descriptor set"));
                }
                let slot = exec
                    .sets
                    .get_mut(*index as usize)
                    .ok_or_else(|| GpuError::Unsupported(format!("descriptor set index {}", index)))?;
                *slot = Some(*set);
            }
            Command::PushConstants { offset, data } => {
                let start = *offset as usize;
                let end = start + data.len();
                if end > exec.push.len() {
                    return Err(GpuError::OutOfBounds {
                        resource: "push constants".into(),
                        offset: *offset as u64,
                        len: data.len() as u64,
                        size: PUSH_CONSTANT_SIZE as u64,
                    });
                }
                exec.push[start..end].copy_from_slice(data);
            }
            Command::Dispatch { x, y, z } => {
                let kind = exec
                    .program
                    .ok_or_else(|| GpuError::Backend("dispatch with no program bound".into()))?;
                dispatch(state, family, &mut exec, kind, [*x, *y, *z])?;
                record.dispatches.push(kind);
            }
            Command::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                size,
            } => {
                for resource in [Resource::Buffer(*src), Resource::Buffer(*dst)] {
                    exec.touch(state, resource, "buffer copy")?;
                    state.claim(resource, family)?;
                }
                let src_buf = state.buffer(*src)?;
                let range = src_buf.memory.range(*src_offset, *size, &src_buf.label)?;
                let data = src_buf.memory.bytes()[range].to_vec();
                let dst_buf = state.buffer(*dst)?;
                let range = dst_buf.memory.range(*dst_offset, *size, &dst_buf.label)?;
                dst_buf.memory.bytes_mut()[range].copy_from_slice(&data);
                exec.unsynchronized.insert(Resource::Buffer(*dst));
                record.copies += 1;
            }
            Command::CopyBufferToImage { src, dst, dst_layout } => {
                exec.touch(state, Resource::Buffer(*src), "buffer to image copy")?;
                exec.touch(state, Resource::Image(*dst), "buffer to image copy")?;
                state.claim(Resource::Buffer(*src), family)?;
                state.claim(Resource::Image(*dst), family)?;
                state.expect_layout(*dst, *dst_layout)?;
                let src_buf = state.buffer(*src)?;
                let data = src_buf.memory.bytes().to_vec();
                let img = state.image(*dst)?;
                let len = img.memory.byte_len();
                if data.len() < len {
                    return Err(GpuError::OutOfBounds {
                        resource: img.label.clone(),
                        offset: 0,
                        len: len as u64,
                        size: data.len() as u64,
                    });
                }
                img.memory.bytes_mut().copy_from_slice(&data[..len]);
                exec.unsynchronized.insert(Resource::Image(*dst));
                record.copies += 1;
            }
            Command::CopyImageToBuffer { src, src_layout, dst } => {
                exec.touch(state, Resource::Image(*src), "image to buffer copy")?;
                exec.touch(state, Resource::Buffer(*dst), "image to buffer copy")?;
                state.claim(Resource::Image(*src), family)?;
                state.claim(Resource::Buffer(*dst), family)?;
                state.expect_layout(*src, *src_layout)?;
                let data = state.image(*src)?.memory.bytes().to_vec();
                let dst_buf = state.buffer(*dst)?;
                let range = dst_buf.memory.range(0, data.len() as u64, &dst_buf.label)?;
                dst_buf.memory.bytes_mut()[range].copy_from_slice(&data);
                exec.unsynchronized.insert(Resource::Buffer(*dst));
                record.copies += 1;
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
            } => {
                exec.touch(state, Resource::Image(*src), "image copy")?;
                exec.touch(state, Resource::Image(*dst), "image copy")?;
                state.claim(Resource::Image(*src), family)?;
                state.claim(Resource::Image(*dst), family)?;
                state.expect_layout(*src, *src_layout)?;
                state.expect_layout(*dst, *dst_layout)?;
                let src_img = state.image(*src)?;
                let extent = (src_img.memory.width, src_img.memory.height);
                let pixels = src_img.memory.pixels.clone();
                let dst_img = state.image(*dst)?;
                if (dst_img.memory.width, dst_img.memory.height) != extent {
                    return Err(GpuError::Unsupported(format!(
                        "image copy {}x{} into {}x{}",
                        extent.0, extent.1, dst_img.memory.width, dst_img.memory.height
                    )));
                }
                dst_img.memory.pixels = pixels;
                exec.unsynchronized.insert(Resource::Image(*dst));
                record.copies += 1;
            }
            Command::FillBuffer {
                dst,
                offset,
                size,
                value,
            } => {
                exec.touch(state, Resource::Buffer(*dst), "buffer fill")?;
                state.claim(Resource::Buffer(*dst), family)?;
                let buf = state.buffer(*dst)?;
                let len = size.unwrap_or((buf.memory.size() as u64).saturating_sub(*offset));
                let range = buf.memory.range(*offset, len, &buf.label)?;
                let pattern = value.to_le_bytes();
                for chunk in buf.memory.bytes_mut()[range].chunks_mut(4) {
                    chunk.copy_from_slice(&pattern[..chunk.len()]);
                }
                exec.unsynchronized.insert(Resource::Buffer(*dst));
                record.copies += 1;
            }
            Command::MemoryBarrier { .. } => exec.unsynchronized.clear(),
            Command::BufferBarrier(barrier) => {
                exec.unsynchronized.remove(&Resource::Buffer(barrier.buffer));
                buffer_barrier(state, family, barrier)?;
            }
            Command::ImageBarrier(barrier) => {
                exec.unsynchronized.remove(&Resource::Image(barrier.image));
                image_barrier(state, family, barrier)?;
            }
        }
    }
    Ok(())
}

fn dispatch(state: &mut State, family: u32, exec: &mut Exec, kind: ProgramKind, groups: [u32; 3]) -> GpuResult<()> {
    let push: PushConstants = bytemuck::pod_read_unaligned(&exec.push);
    let footprint = kernels::footprint(kind, &push);

    let mut resolved: Vec<(Slot, kernels::Use, Resource)> = Vec::with_capacity(footprint.len());
    for (slot, usage) in footprint {
        let set_id = exec.sets[slot.0 as usize]
            .ok_or_else(|| GpuError::Backend(format!("{}: descriptor set {} not bound", kind.name(), slot.0)))?;
        let set = state.sets.get(set_id.raw()).ok_or(GpuError::InvalidHandle("descriptor set"))?;
        let resource = set
            .bindings
            .iter()
            .find(|(binding, _)| *binding == slot.1)
            .map(|(_, resource)| match resource {
                DescriptorResource::Buffer(id) => Resource::Buffer(*id),
                DescriptorResource::Image(id) => Resource::Image(*id),
            })
            .ok_or_else(|| {
                GpuError::Backend(format!("{}: set {} binding {} never written", kind.name(), slot.0, slot.1))
            })?;
        if resolved.iter().any(|(_, _, r)| *r == resource) {
            return Err(GpuError::Hazard(format!(
                "{}: {} bound to two bindings of one dispatch",
                kind.name(),
                state.label(resource)
            )));
        }
        resolved.push((slot, usage, resource));
    }

    for (_, _, resource) in &resolved {
        exec.touch(state, *resource, kind.name())?;
        state.claim(*resource, family)?;
        if let Resource::Image(id) = resource {
            state.expect_layout(*id, ImageLayout::General)?;
        }
    }

    let mut bound = Bound::default();
    for (slot, usage, resource) in &resolved {
        match resource {
            Resource::Buffer(id) => {
                let memory = std::mem::take(&mut state.buffer(*id)?.memory);
                if usage.writes() {
                    bound.writes.push((*slot, memory));
                } else {
                    bound.reads.push((*slot, memory));
                }
            }
            Resource::Image(id) => {
                bound.image = Some(std::mem::take(&mut state.image(*id)?.memory));
            }
        }
    }

    let result = kernels::dispatch(kind, &push, groups, &mut bound);

    let mut returned: Vec<(Slot, Memory)> = bound.reads.into_iter().chain(bound.writes).collect();
    for (slot, _, resource) in &resolved {
        match resource {
            Resource::Buffer(id) => {
                if let Some(at) = returned.iter().position(|(s, _)| s == slot) {
                    let (_, memory) = returned.swap_remove(at);
                    state.buffer(*id)?.memory = memory;
                }
            }
            Resource::Image(id) => {
                if let Some(image) = bound.image.take() {
                    state.image(*id)?.memory = image;
                }
            }
        }
    }
    result?;

    for (_, usage, resource) in resolved {
        if usage.writes() {
            exec.unsynchronized.insert(resource);
        }
    }
    Ok(())
}

fn buffer_barrier(state: &mut State, family: u32, barrier: &BufferBarrier) -> GpuResult<()> {
    let buf = state.buffer(barrier.buffer)?;
    match barrier.ownership {
        Some(transfer) if transfer.src_family != transfer.dst_family => {
            if family == transfer.src_family {
                if buf.owner.is_some_and(|owner| owner != family) || buf.in_transit.is_some() {
                    return Err(GpuError::OwnershipViolation {
                        resource: buf.label.clone(),
                        owner: buf.owner.unwrap_or(family),
                        used_on: family,
                    });
                }
                buf.owner = Some(family);
                buf.in_transit = Some(transfer.dst_family);
            } else if family == transfer.dst_family {
                if buf.in_transit != Some(family) {
                    return Err(GpuError::OwnershipViolation {
                        resource: buf.label.clone(),
                        owner: buf.owner.unwrap_or(transfer.src_family),
                        used_on: family,
                    });
                }
                buf.owner = Some(family);
                buf.in_transit = None;
            } else {
                return Err(GpuError::Backend(format!(
                    "{}: ownership barrier recorded on family {} outside its transfer",
                    buf.label, family
                )));
            }
            Ok(())
        }
        _ => state.claim(Resource::Buffer(barrier.buffer), family),
    }
}

fn image_barrier(state: &mut State, family: u32, barrier: &ImageBarrier) -> GpuResult<()> {
    let img = state.image(barrier.image)?;
    let layout_ok = barrier.old_layout == ImageLayout::Undefined || barrier.old_layout == img.layout;

    match barrier.ownership {
        Some(transfer) if transfer.src_family != transfer.dst_family => {
            if family == transfer.src_family {
                if img.owner.is_some_and(|owner| owner != family) || img.in_transit.is_some() {
                    return Err(GpuError::OwnershipViolation {
                        resource: img.label.clone(),
                        owner: img.owner.unwrap_or(family),
                        used_on: family,
                    });
                }
                if !layout_ok {
                    return Err(GpuError::LayoutMismatch {
                        resource: img.label.clone(),
                        expected: barrier.old_layout,
                        found: img.layout,
                    });
                }
                img.owner = Some(family);
                img.in_transit = Some(transfer.dst_family);
                img.layout = barrier.new_layout;
            } else if family == transfer.dst_family {
                if img.in_transit != Some(family) {
                    return Err(GpuError::OwnershipViolation {
                        resource: img.label.clone(),
                        owner: img.owner.unwrap_or(transfer.src_family),
                        used_on: family,
                    });
                }
                img.owner = Some(family);
                img.in_transit = None;
                img.layout = barrier.new_layout;
            } else {
                return Err(GpuError::Backend(format!(
                    "{}: ownership barrier recorded on family {} outside its transfer",
                    img.label, family
                )));
            }
        }
        _ => {
            if barrier.old_layout == ImageLayout::Undefined {
                // Contents are discarded, so any family may take the image
                img.owner = Some(family);
                img.in_transit = None;
            } else {
                if !layout_ok {
                    return Err(GpuError::LayoutMismatch {
                        resource: img.label.clone(),
                        expected: barrier.old_layout,
                        found: img.layout,
                    });
                }
                state.claim(Resource::Image(barrier.image), family)?;
            }
            state.image(barrier.image)?.layout = barrier.new_layout;
        }
    }
    Ok(())
}

impl GpuDevice for SoftwareDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> GpuResult<BufferId> {
        if desc.size == 0 {
            return Err(GpuError::Unsupported(format!("zero-sized buffer {}", desc.label)));
        }
        let mut state = self.state.lock();
        self.reserve(&mut state, desc.label, desc.size)?;
        let raw = state.buffers.insert(SwBuffer {
            label: desc.label.to_string(),
            memory: Memory::zeroed(desc.size as usize),
            usage: desc.usage,
            location: desc.location,
            owner: None,
            in_transit: None,
        });
        Ok(BufferId::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut state = self.state.lock();
        if let Some(buf) = state.buffers.remove(buffer.raw()) {
            state.allocated -= buf.memory.size() as u64;
        }
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        let state = self.state.lock();
        state.buffers.get(buffer.raw()).map(|buf| buf.memory.size() as u64)
    }

    fn write_mapped(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut state = self.state.lock();
        let buf = state.buffer(buffer)?;
        if !buf.location.is_host_visible() {
            return Err(GpuError::NotHostVisible);
        }
        let range = buf.memory.range(offset, data.len() as u64, &buf.label)?;
        buf.memory.bytes_mut()[range].copy_from_slice(data);
        Ok(())
    }

    fn read_mapped(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        let mut state = self.state.lock();
        let buf = state.buffer(buffer)?;
        if !buf.location.is_host_visible() {
            return Err(GpuError::NotHostVisible);
        }
        let range = buf.memory.range(offset, out.len() as u64, &buf.label)?;
        out.copy_from_slice(&buf.memory.bytes()[range]);
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> GpuResult<ImageId> {
        if desc.width == 0 || desc.height == 0 {
            return Err(GpuError::Unsupported(format!("empty image {}", desc.label)));
        }
        let mut state = self.state.lock();
        let size = desc.width as u64 * desc.height as u64 * desc.format.bytes_per_pixel() as u64;
        self.reserve(&mut state, desc.label, size)?;
        let raw = state.images.insert(SwImage {
            label: desc.label.to_string(),
            memory: ImageMemory::new(desc.width, desc.height),
            usage: desc.usage,
            layout: ImageLayout::Undefined,
            owner: None,
            in_transit: None,
        });
        Ok(ImageId::from_raw(raw))
    }

    fn destroy_image(&self, image: ImageId) {
        let mut state = self.state.lock();
        if let Some(img) = state.images.remove(image.raw()) {
            state.allocated -= img.memory.byte_len() as u64;
        }
    }

    fn image_layout(&self, image: ImageId) -> Option<ImageLayout> {
        self.state.lock().images.get(image.raw()).map(|img| img.layout)
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreId> {
        Ok(SemaphoreId::from_raw(self.state.lock().semaphores.insert(false)))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.state.lock().semaphores.remove(semaphore.raw());
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceId> {
        Ok(FenceId::from_raw(self.state.lock().fences.insert(signaled)))
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(fence.raw());
    }

    fn wait_fence(&self, fence: FenceId, timeout: Option<Duration>) -> GpuResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            match state.fences.get(fence.raw()) {
                None => return Err(GpuError::InvalidHandle("fence")),
                Some(true) => return Ok(()),
                Some(false) => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut state, deadline).timed_out() {
                        return match state.fences.get(fence.raw()) {
                            Some(true) => Ok(()),
                            Some(false) => Err(GpuError::Timeout),
                            None => Err(GpuError::InvalidHandle("fence")),
                        };
                    }
                }
                None => self.fence_signaled.wait(&mut state),
            }
        }
    }

    fn reset_fence(&self, fence: FenceId) -> GpuResult<()> {
        let mut state = self.state.lock();
        let signaled = state.fences.get_mut(fence.raw()).ok_or(GpuError::InvalidHandle("fence"))?;
        *signaled = false;
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceId) -> GpuResult<bool> {
        self.state
            .lock()
            .fences
            .get(fence.raw())
            .copied()
            .ok_or(GpuError::InvalidHandle("fence"))
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> GpuResult<LayoutId> {
        if desc.push_constant_size > PUSH_CONSTANT_SIZE {
            return Err(GpuError::Unsupported(format!(
                "{} bytes of push constants",
                desc.push_constant_size
            )));
        }
        Ok(LayoutId::from_raw(self.state.lock().layouts.insert(desc.clone())))
    }

    fn destroy_pipeline_layout(&self, layout: LayoutId) {
        self.state.lock().layouts.remove(layout.raw());
    }

    fn create_program(&self, layout: LayoutId, kind: ProgramKind) -> GpuResult<ProgramId> {
        let mut state = self.state.lock();
        if !state.layouts.contains(layout.raw()) {
            return Err(GpuError::InvalidHandle("pipeline layout"));
        }
        Ok(ProgramId::from_raw(state.programs.insert(SwProgram { kind })))
    }

    fn destroy_program(&self, program: ProgramId) {
        self.state.lock().programs.remove(program.raw());
    }

    fn create_descriptor_set(&self, layout: LayoutId, index: u32) -> GpuResult<DescriptorSetId> {
        let mut state = self.state.lock();
        let desc = state.layouts.get(layout.raw()).ok_or(GpuError::InvalidHandle("pipeline layout"))?;
        let set = desc
            .sets
            .get(index as usize)
            .ok_or_else(|| GpuError::Unsupported(format!("layout has no set {}", index)))?;
        let kinds = set.bindings.iter().map(|b| (b.binding, b.kind)).collect();
        let raw = state.sets.insert(SwDescriptorSet {
            kinds,
            bindings: Vec::new(),
        });
        Ok(DescriptorSetId::from_raw(raw))
    }

    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]) -> GpuResult<()> {
        let mut state = self.state.lock();
        for write in writes {
            match write.resource {
                DescriptorResource::Buffer(id) => {
                    let buf = state.buffer(id)?;
                    let usable = buf.usage.contains(BufferUsage::STORAGE) || buf.usage.contains(BufferUsage::UNIFORM);
                    if !usable {
                        return Err(GpuError::Unsupported(format!("{} is not bindable", buf.label)));
                    }
                }
                DescriptorResource::Image(id) => {
                    let img = state.image(id)?;
                    if !img.usage.contains(ImageUsage::STORAGE) {
                        return Err(GpuError::Unsupported(format!("{} is not a storage image", img.label)));
                    }
                }
            }
        }

        let target = state.sets.get_mut(set.raw()).ok_or(GpuError::InvalidHandle("descriptor set"))?;
        for write in writes {
            let kind = target
                .kinds
                .iter()
                .find(|(binding, _)| *binding == write.binding)
                .map(|(_, kind)| *kind)
                .ok_or_else(|| GpuError::Unsupported(format!("no binding {} in set", write.binding)))?;
            let matches = matches!(
                (kind, write.resource),
                (BindingKind::StorageImage, DescriptorResource::Image(_))
                    | (BindingKind::UniformBuffer, DescriptorResource::Buffer(_))
                    | (BindingKind::StorageBuffer { .. }, DescriptorResource::Buffer(_))
            );
            if !matches {
                return Err(GpuError::Unsupported(format!(
                    "binding {} is {:?}, got {:?}",
                    write.binding, kind, write.resource
                )));
            }
            target.bindings.retain(|(binding, _)| *binding != write.binding);
            target.bindings.push((write.binding, write.resource));
        }
        Ok(())
    }

    fn destroy_descriptor_set(&self, set: DescriptorSetId) {
        self.state.lock().sets.remove(set.raw());
    }

    fn create_command_pool(&self, family: u32) -> GpuResult<CommandPoolId> {
        if !self.info.queues.contains(family) {
            return Err(GpuError::Unsupported(format!("queue family {}", family)));
        }
        let raw = self.state.lock().pools.insert(SwPool {
            family,
            busy: Arc::new(AtomicBool::new(false)),
            command_buffers: Vec::new(),
        });
        Ok(CommandPoolId::from_raw(raw))
    }

    fn destroy_command_pool(&self, pool: CommandPoolId) {
        let mut state = self.state.lock();
        if let Some(pool) = state.pools.remove(pool.raw()) {
            for cb in pool.command_buffers {
                state.command_buffers.remove(cb.raw());
            }
        }
    }

    fn allocate_command_buffer(&self, pool: CommandPoolId) -> GpuResult<CommandBufferId> {
        let _guard = self.enter_pool(pool)?;
        let mut state = self.state.lock();
        let raw = state.command_buffers.insert(SwCommandBuffer {
            pool,
            commands: CommandList::new(),
        });
        let id = CommandBufferId::from_raw(raw);
        state
            .pools
            .get_mut(pool.raw())
            .ok_or(GpuError::InvalidHandle("command pool"))?
            .command_buffers
            .push(id);
        Ok(id)
    }

    fn record(&self, command_buffer: CommandBufferId, commands: CommandList) -> GpuResult<()> {
        let pool = self
            .state
            .lock()
            .command_buffers
            .get(command_buffer.raw())
            .map(|cb| cb.pool)
            .ok_or(GpuError::InvalidHandle("command buffer"))?;
        let _guard = self.enter_pool(pool)?;
        let mut state = self.state.lock();
        let cb = state
            .command_buffers
            .get_mut(command_buffer.raw())
            .ok_or(GpuError::InvalidHandle("command buffer"))?;
        cb.commands = commands;
        Ok(())
    }

    fn free_command_buffers(&self, pool: CommandPoolId, command_buffers: &[CommandBufferId]) {
        let _guard = match self.enter_pool(pool) {
            Ok(guard) => guard,
            Err(e) => {
                log::error!("Freeing command buffers: {}", e);
                return;
            }
        };
        let mut state = self.state.lock();
        for cb in command_buffers {
            state.command_buffers.remove(cb.raw());
        }
        if let Some(pool) = state.pools.get_mut(pool.raw()) {
            pool.command_buffers.retain(|cb| !command_buffers.contains(cb));
        }
    }

    fn submit(&self, family: u32, submits: &[SubmitInfo], fence: Option<FenceId>) -> GpuResult<()> {
        if !self.info.queues.contains(family) {
            return Err(GpuError::Unsupported(format!("queue family {}", family)));
        }
        if self.failing_family == Some(family) {
            return Err(GpuError::Backend(format!("submission to family {} rejected", family)));
        }
        let mut state = self.state.lock();
        if let Some(fence) = fence {
            match state.fences.get(fence.raw()) {
                None => return Err(GpuError::InvalidHandle("fence")),
                Some(true) => return Err(GpuError::Backend("fence submitted while still signaled".into())),
                Some(false) => {}
            }
        }

        for (i, batch) in submits.iter().enumerate() {
            for wait in &batch.waits {
                let signaled = state
                    .semaphores
                    .get_mut(wait.semaphore.raw())
                    .ok_or(GpuError::InvalidHandle("semaphore"))?;
                if !*signaled {
                    return Err(GpuError::SemaphoreNotSignaled);
                }
                *signaled = false;
            }

            let mut record = SubmissionRecord {
                family,
                waits: batch.waits.iter().map(|w| w.semaphore).collect(),
                signals: batch.signals.clone(),
                fence: if i + 1 == submits.len() { fence } else { None },
                dispatches: Vec::new(),
                copies: 0,
            };

            for cb in &batch.command_buffers {
                let entry = state
                    .command_buffers
                    .get(cb.raw())
                    .ok_or(GpuError::InvalidHandle("command buffer"))?;
                let pool_family = state.pools.get(entry.pool.raw()).map(|pool| pool.family);
                if pool_family != Some(family) {
                    return Err(GpuError::Unsupported(format!(
                        "command buffer from family {:?} submitted to family {}",
                        pool_family, family
                    )));
                }
                let commands = entry.commands.clone();
                execute(&mut state, family, &commands, &mut record)?;
            }

            for semaphore in &batch.signals {
                let signaled = state
                    .semaphores
                    .get_mut(semaphore.raw())
                    .ok_or(GpuError::InvalidHandle("semaphore"))?;
                if *signaled {
                    return Err(GpuError::SemaphoreAlreadySignaled);
                }
                *signaled = true;
            }
            state.log.push(record);
        }

        if let Some(fence) = fence {
            if let Some(signaled) = state.fences.get_mut(fence.raw()) {
                *signaled = true;
            }
            self.fence_signaled.notify_all();
        }
        Ok(())
    }

    fn wait_idle(&self) -> GpuResult<()> {
        Ok(())
    }
}
