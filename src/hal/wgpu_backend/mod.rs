//! wgpu-backed device.
//!
//! wgpu exposes a single queue and tracks hazards and image layouts itself, so
//! this backend maps every queue family onto that queue. Barriers only update
//! the layout the engine reads back through [`GpuDevice::image_layout`].
//! Binary semaphores are validated host-side the same way the software device
//! does. Fences are tied to queue submission indices.

pub mod context;
pub mod display;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::arena::Arena;
use super::{
    BindingKind, BufferDesc, BufferId, Command, CommandBufferId, CommandList, CommandPoolId, DescriptorResource,
    DescriptorSetId, DescriptorWrite, DeviceCapabilities, DeviceInfo, FenceId, GpuDevice, GpuError, GpuResult,
    ImageDesc, ImageId, ImageLayout, LayoutId, MemoryLocation, PipelineLayoutDesc, ProgramId, QueueFamilies,
    SemaphoreId, SubmitInfo,
};
use crate::layout::ProgramKind;

/// Smallest allocation; runtime-sized arrays need at least one element bound
const MIN_BUFFER_SIZE: u64 = 256;

fn align4(size: u64) -> u64 {
    size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

fn program_source(kind: ProgramKind) -> &'static str {
    match kind {
        ProgramKind::Project => include_str!("shaders/project.wgsl"),
        ProgramKind::Prefix => include_str!("shaders/prefix.wgsl"),
        ProgramKind::Keygen => include_str!("shaders/keygen.wgsl"),
        ProgramKind::Radix => include_str!("shaders/radix.wgsl"),
        ProgramKind::Coalesce => include_str!("shaders/coalesce.wgsl"),
        ProgramKind::Range => include_str!("shaders/range.wgsl"),
        ProgramKind::Blend => include_str!("shaders/blend.wgsl"),
    }
}

/// Capabilities as the engine understands them, derived from adapter features
pub fn capabilities_from(features: wgpu::Features) -> DeviceCapabilities {
    DeviceCapabilities {
        shader_int64: features.contains(wgpu::Features::SHADER_INT64),
        shader_int64_atomics: features.contains(wgpu::Features::SHADER_INT64_ATOMIC_MIN_MAX),
        runtime_descriptor_arrays: true,
        synchronization2: true,
    }
}

/// Features requested from the adapter: push constants plus whatever 64-bit
/// integer support it offers
pub fn wanted_features(available: wgpu::Features) -> wgpu::Features {
    let optional = wgpu::Features::SHADER_INT64 | wgpu::Features::SHADER_INT64_ATOMIC_MIN_MAX;
    wgpu::Features::PUSH_CONSTANTS | (available & optional)
}

struct WgpuBuffer {
    buffer: wgpu::Buffer,
    /// Size the caller asked for; the allocation may be larger
    size: u64,
    location: MemoryLocation,
}

struct WgpuImage {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
    layout: ImageLayout,
}

enum FenceState {
    Signaled,
    Unsignaled,
    Pending {
        index: wgpu::SubmissionIndex,
        done: Arc<AtomicBool>,
    },
}

struct WgpuLayout {
    sets: Vec<wgpu::BindGroupLayout>,
    pipeline_layout: wgpu::PipelineLayout,
}

struct WgpuProgram {
    pipeline: wgpu::ComputePipeline,
}

struct WgpuDescriptorSet {
    layout: LayoutId,
    index: u32,
    writes: Vec<DescriptorWrite>,
}

struct WgpuPool {
    family: u32,
    command_buffers: Vec<CommandBufferId>,
}

struct WgpuCommandBuffer {
    pool: CommandPoolId,
    commands: CommandList,
}

#[derive(Default)]
struct State {
    buffers: Arena<WgpuBuffer>,
    images: Arena<WgpuImage>,
    semaphores: Arena<bool>,
    fences: Arena<FenceState>,
    layouts: Arena<WgpuLayout>,
    programs: Arena<WgpuProgram>,
    sets: Arena<WgpuDescriptorSet>,
    pools: Arena<WgpuPool>,
    command_buffers: Arena<WgpuCommandBuffer>,
}

impl State {
    fn buffer(&self, id: BufferId) -> GpuResult<&WgpuBuffer> {
        self.buffers.get(id.raw()).ok_or(GpuError::InvalidHandle("buffer"))
    }

    fn image(&self, id: ImageId) -> GpuResult<&WgpuImage> {
        self.images.get(id.raw()).ok_or(GpuError::InvalidHandle("image"))
    }
}

pub struct WgpuDevice {
    info: DeviceInfo,
    device: wgpu::Device,
    queue: wgpu::Queue,
    state: Mutex<State>,
}

impl WgpuDevice {
    /// Wrap an opened device. `presentation` exposes a graphics family.
    pub fn new(name: String, device: wgpu::Device, queue: wgpu::Queue, presentation: bool) -> Self {
        let capabilities = capabilities_from(device.features());
        let queues = QueueFamilies {
            graphics: presentation.then_some(0),
            compute: 0,
            transfer: 0,
        };
        log::info!("wgpu device {} ready (presentation: {})", name, presentation);
        Self {
            info: DeviceInfo {
                name,
                capabilities,
                queues,
            },
            device,
            queue,
            state: Mutex::new(State::default()),
        }
    }

    pub fn raw_device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn raw_queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Run `f` with a sampled view of `image`
    pub fn with_texture_view<R>(&self, image: ImageId, f: impl FnOnce(&wgpu::TextureView) -> R) -> GpuResult<R> {
        let state = self.state.lock();
        Ok(f(&state.image(image)?.view))
    }

    fn scoped<R>(&self, f: impl FnOnce() -> R) -> GpuResult<R> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = f();
        let validation = pollster::block_on(self.device.pop_error_scope());
        let memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(error) = memory {
            return Err(GpuError::OutOfMemory {
                label: error.to_string(),
                size: 0,
            });
        }
        if let Some(error) = validation {
            return Err(GpuError::Backend(error.to_string()));
        }
        Ok(result)
    }

    fn mark_fences_signaled(state: &mut State) {
        let finished: Vec<_> = state
            .fences
            .iter()
            .filter(|(_, fence)| matches!(fence, FenceState::Pending { .. }))
            .map(|(handle, _)| handle)
            .collect();
        for handle in finished {
            if let Some(fence) = state.fences.get_mut(handle) {
                *fence = FenceState::Signaled;
            }
        }
    }

    fn bind_group(&self, state: &State, set: DescriptorSetId) -> GpuResult<wgpu::BindGroup> {
        let entry = state.sets.get(set.raw()).ok_or(GpuError::InvalidHandle("descriptor set"))?;
        let layout = state
            .layouts
            .get(entry.layout.raw())
            .ok_or(GpuError::InvalidHandle("pipeline layout"))?;
        let set_layout = layout
            .sets
            .get(entry.index as usize)
            .ok_or(GpuError::InvalidHandle("descriptor set layout"))?;

        let mut entries = Vec::with_capacity(entry.writes.len());
        for write in &entry.writes {
            let resource = match write.resource {
                DescriptorResource::Buffer(buffer) => state.buffer(buffer)?.buffer.as_entire_binding(),
                DescriptorResource::Image(image) => wgpu::BindingResource::TextureView(&state.image(image)?.view),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: write.binding,
                resource,
            });
        }
        Ok(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("splat descriptor set"),
            layout: set_layout,
            entries: &entries,
        }))
    }

    /// Encode one command list. Image layout changes are returned rather than
    /// applied so the state stays borrowed immutably while encoding.
    fn encode(
        &self,
        state: &State,
        encoder: &mut wgpu::CommandEncoder,
        commands: &CommandList,
    ) -> GpuResult<Vec<(ImageId, ImageLayout)>> {
        let mut layouts = Vec::new();
        let mut program = None;
        let mut bound: Vec<Option<DescriptorSetId>> = Vec::new();
        let mut push = Vec::new();
        let mut groups: HashMap<DescriptorSetId, wgpu::BindGroup> = HashMap::new();

        for command in commands.commands() {
            match command {
                Command::BindProgram(id) => program = Some(*id),
                Command::BindDescriptorSet { index, set } => {
                    let index = *index as usize;
                    if bound.len() <= index {
                        bound.resize(index + 1, None);
                    }
                    bound[index] = Some(*set);
                }
                Command::PushConstants { offset, data } => {
                    let end = *offset as usize + data.len();
                    if push.len() < end {
                        push.resize(end, 0u8);
                    }
                    push[*offset as usize..end].copy_from_slice(data);
                }
                Command::Dispatch { x, y, z } => {
                    let program = program.ok_or_else(|| GpuError::Backend("dispatch without a program".into()))?;
                    let pipeline = &state
                        .programs
                        .get(program.raw())
                        .ok_or(GpuError::InvalidHandle("program"))?
                        .pipeline;
                    for set in bound.iter().flatten() {
                        if !groups.contains_key(set) {
                            let group = self.bind_group(state, *set)?;
                            groups.insert(*set, group);
                        }
                    }

                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some("splat dispatch"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    for (index, set) in bound.iter().enumerate() {
                        if let Some(group) = set.and_then(|set| groups.get(&set)) {
                            pass.set_bind_group(index as u32, group, &[]);
                        }
                    }
                    if !push.is_empty() {
                        pass.set_push_constants(0, &push);
                    }
                    pass.dispatch_workgroups(*x, *y, *z);
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src = state.buffer(*src)?;
                    let dst = state.buffer(*dst)?;
                    encoder.copy_buffer_to_buffer(&src.buffer, *src_offset, &dst.buffer, *dst_offset, align4(*size));
                }
                Command::CopyBufferToImage { src, dst, .. } => {
                    let src = state.buffer(*src)?;
                    let dst = state.image(*dst)?;
                    self.copy_buffer_to_texture(encoder, &src.buffer, dst);
                }
                Command::CopyImageToBuffer { src, dst, .. } => {
                    let src = state.image(*src)?;
                    let dst = state.buffer(*dst)?;
                    self.copy_texture_to_buffer(encoder, src, &dst.buffer);
                }
                Command::CopyImage { src, dst, .. } => {
                    let src = state.image(*src)?;
                    let dst = state.image(*dst)?;
                    encoder.copy_texture_to_texture(
                        src.texture.as_image_copy(),
                        dst.texture.as_image_copy(),
                        wgpu::Extent3d {
                            width: src.width.min(dst.width),
                            height: src.height.min(dst.height),
                            depth_or_array_layers: 1,
                        },
                    );
                }
                Command::FillBuffer {
                    dst,
                    offset,
                    size,
                    value,
                } => {
                    if *value != 0 {
                        return Err(GpuError::Unsupported(format!("fill with non-zero value {:#x}", value)));
                    }
                    let dst = state.buffer(*dst)?;
                    encoder.clear_buffer(&dst.buffer, *offset, size.map(align4));
                }
                Command::MemoryBarrier { .. } | Command::BufferBarrier(_) => {}
                Command::ImageBarrier(barrier) => layouts.push((barrier.image, barrier.new_layout)),
            }
        }
        Ok(layouts)
    }

    fn padded_row(width: u32) -> u32 {
        (width * 4).div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT
    }

    fn row_staging(&self, image: &WgpuImage) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("row staging"),
            size: Self::padded_row(image.width) as u64 * image.height as u64,
            usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn texel_layout(image: &WgpuImage, bytes_per_row: u32) -> wgpu::TexelCopyBufferLayout {
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(bytes_per_row),
            rows_per_image: Some(image.height),
        }
    }

    fn extent(image: &WgpuImage) -> wgpu::Extent3d {
        wgpu::Extent3d {
            width: image.width,
            height: image.height,
            depth_or_array_layers: 1,
        }
    }

    /// Tightly packed buffer rows into the texture, through a row-aligned
    /// staging buffer when the row pitch needs padding
    fn copy_buffer_to_texture(&self, encoder: &mut wgpu::CommandEncoder, src: &wgpu::Buffer, dst: &WgpuImage) {
        let row = dst.width * 4;
        let padded = Self::padded_row(dst.width);
        if row == padded {
            encoder.copy_buffer_to_texture(
                wgpu::TexelCopyBufferInfo {
                    buffer: src,
                    layout: Self::texel_layout(dst, row),
                },
                dst.texture.as_image_copy(),
                Self::extent(dst),
            );
            return;
        }
        let staging = self.row_staging(dst);
        for y in 0..dst.height as u64 {
            encoder.copy_buffer_to_buffer(src, y * row as u64, &staging, y * padded as u64, row as u64);
        }
        encoder.copy_buffer_to_texture(
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: Self::texel_layout(dst, padded),
            },
            dst.texture.as_image_copy(),
            Self::extent(dst),
        );
    }

    fn copy_texture_to_buffer(&self, encoder: &mut wgpu::CommandEncoder, src: &WgpuImage, dst: &wgpu::Buffer) {
        let row = src.width * 4;
        let padded = Self::padded_row(src.width);
        if row == padded {
            encoder.copy_texture_to_buffer(
                src.texture.as_image_copy(),
                wgpu::TexelCopyBufferInfo {
                    buffer: dst,
                    layout: Self::texel_layout(src, row),
                },
                Self::extent(src),
            );
            return;
        }
        let staging = self.row_staging(src);
        encoder.copy_texture_to_buffer(
            src.texture.as_image_copy(),
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: Self::texel_layout(src, padded),
            },
            Self::extent(src),
        );
        for y in 0..src.height as u64 {
            encoder.copy_buffer_to_buffer(&staging, y * padded as u64, dst, y * row as u64, row as u64);
        }
    }
}

fn check_range(what: &str, offset: u64, len: u64, size: u64) -> GpuResult<()> {
    if offset.checked_add(len).is_none_or(|end| end > size) {
        return Err(GpuError::OutOfBounds {
            resource: what.to_string(),
            offset,
            len,
            size,
        });
    }
    Ok(())
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    match kind {
        BindingKind::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageImage => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::Rgba8Unorm,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    }
}

impl GpuDevice for WgpuDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> GpuResult<BufferId> {
        let mut usage = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
        if desc.usage.contains(super::BufferUsage::STORAGE) {
            usage |= wgpu::BufferUsages::STORAGE;
        }
        if desc.usage.contains(super::BufferUsage::UNIFORM) {
            usage |= wgpu::BufferUsages::UNIFORM;
        }
        let size = align4(desc.size).max(MIN_BUFFER_SIZE);
        let buffer = self.scoped(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size,
                usage,
                mapped_at_creation: false,
            })
        });
        let buffer = match buffer {
            Ok(buffer) => buffer,
            Err(GpuError::OutOfMemory { .. }) => {
                return Err(GpuError::OutOfMemory {
                    label: desc.label.to_string(),
                    size: desc.size,
                });
            }
            Err(error) => return Err(error),
        };
        let handle = self.state.lock().buffers.insert(WgpuBuffer {
            buffer,
            size: desc.size,
            location: desc.location,
        });
        Ok(BufferId::from_raw(handle))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        self.state.lock().buffers.remove(buffer.raw());
    }

    fn buffer_size(&self, buffer: BufferId) -> Option<u64> {
        self.state.lock().buffers.get(buffer.raw()).map(|b| b.size)
    }

    fn write_mapped(&self, buffer: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let state = self.state.lock();
        let entry = state.buffer(buffer)?;
        if entry.location == MemoryLocation::GpuOnly {
            return Err(GpuError::NotHostVisible);
        }
        check_range("mapped write", offset, data.len() as u64, entry.size)?;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(GpuError::Unsupported(format!("unaligned mapped write at {}", offset)));
        }
        let padded = align4(data.len() as u64) as usize;
        if padded == data.len() {
            self.queue.write_buffer(&entry.buffer, offset, data);
        } else {
            let mut bytes = data.to_vec();
            bytes.resize(padded, 0);
            self.queue.write_buffer(&entry.buffer, offset, &bytes);
        }
        Ok(())
    }

    fn read_mapped(&self, buffer: BufferId, offset: u64, out: &mut [u8]) -> GpuResult<()> {
        let len = out.len() as u64;
        let start = offset - offset % wgpu::COPY_BUFFER_ALIGNMENT;
        let readback = {
            let state = self.state.lock();
            let entry = state.buffer(buffer)?;
            if entry.location == MemoryLocation::GpuOnly {
                return Err(GpuError::NotHostVisible);
            }
            check_range("mapped read", offset, len, entry.size)?;
            if len == 0 {
                return Ok(());
            }
            let end = align4(offset + len);

            let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("mapped readback"),
                size: end - start,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("mapped readback"),
            });
            encoder.copy_buffer_to_buffer(&entry.buffer, start, &readback, 0, end - start);
            self.queue.submit(std::iter::once(encoder.finish()));
            readback
        };

        let slice = readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::Backend(e.to_string()))?
            .map_err(|e| GpuError::Backend(e.to_string()))?;

        let at = (offset - start) as usize;
        out.copy_from_slice(&slice.get_mapped_range()[at..at + out.len()]);
        readback.unmap();
        Ok(())
    }

    fn create_image(&self, desc: &ImageDesc<'_>) -> GpuResult<ImageId> {
        let texture = self.scoped(|| {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(desc.label),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let handle = self.state.lock().images.insert(WgpuImage {
            texture,
            view,
            width: desc.width,
            height: desc.height,
            layout: ImageLayout::Undefined,
        });
        Ok(ImageId::from_raw(handle))
    }

    fn destroy_image(&self, image: ImageId) {
        self.state.lock().images.remove(image.raw());
    }

    fn image_layout(&self, image: ImageId) -> Option<ImageLayout> {
        self.state.lock().images.get(image.raw()).map(|i| i.layout)
    }

    fn create_semaphore(&self) -> GpuResult<SemaphoreId> {
        Ok(SemaphoreId::from_raw(self.state.lock().semaphores.insert(false)))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        self.state.lock().semaphores.remove(semaphore.raw());
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<FenceId> {
        let fence = if signaled { FenceState::Signaled } else { FenceState::Unsignaled };
        Ok(FenceId::from_raw(self.state.lock().fences.insert(fence)))
    }

    fn destroy_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(fence.raw());
    }

    // wgpu has no bounded wait on a submission; the timeout is not enforced
    fn wait_fence(&self, fence: FenceId, _timeout: Option<Duration>) -> GpuResult<()> {
        let index = match self.state.lock().fences.get(fence.raw()) {
            None => return Err(GpuError::InvalidHandle("fence")),
            Some(FenceState::Signaled) => return Ok(()),
            Some(FenceState::Unsignaled) => return Err(GpuError::Backend("waited on a fence that was never submitted".into())),
            Some(FenceState::Pending { index, .. }) => index.clone(),
        };
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        if let Some(state) = self.state.lock().fences.get_mut(fence.raw()) {
            if matches!(state, FenceState::Pending { .. }) {
                *state = FenceState::Signaled;
            }
        }
        Ok(())
    }

    fn reset_fence(&self, fence: FenceId) -> GpuResult<()> {
        let mut state = self.state.lock();
        let entry = state.fences.get_mut(fence.raw()).ok_or(GpuError::InvalidHandle("fence"))?;
        *entry = FenceState::Unsignaled;
        Ok(())
    }

    fn fence_signaled(&self, fence: FenceId) -> GpuResult<bool> {
        self.device.poll(wgpu::Maintain::Poll);
        let mut state = self.state.lock();
        let entry = state.fences.get_mut(fence.raw()).ok_or(GpuError::InvalidHandle("fence"))?;
        let signaled = match entry {
            FenceState::Signaled => true,
            FenceState::Unsignaled => false,
            FenceState::Pending { done, .. } => done.load(Ordering::Acquire),
        };
        if signaled {
            *entry = FenceState::Signaled;
        }
        Ok(signaled)
    }

    fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> GpuResult<LayoutId> {
        let sets: Vec<wgpu::BindGroupLayout> = desc
            .sets
            .iter()
            .map(|set| {
                let entries: Vec<wgpu::BindGroupLayoutEntry> = set
                    .bindings
                    .iter()
                    .map(|binding| wgpu::BindGroupLayoutEntry {
                        binding: binding.binding,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: binding_type(binding.kind),
                        count: None,
                    })
                    .collect();
                self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("splat set layout"),
                    entries: &entries,
                })
            })
            .collect();
        let set_refs: Vec<&wgpu::BindGroupLayout> = sets.iter().collect();
        let push_constant_ranges = [wgpu::PushConstantRange {
            stages: wgpu::ShaderStages::COMPUTE,
            range: 0..desc.push_constant_size,
        }];
        let pipeline_layout = self.scoped(|| {
            self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("splat pipeline layout"),
                bind_group_layouts: &set_refs,
                push_constant_ranges: if desc.push_constant_size > 0 { &push_constant_ranges } else { &[] },
            })
        })?;
        let handle = self.state.lock().layouts.insert(WgpuLayout {
            sets,
            pipeline_layout,
        });
        Ok(LayoutId::from_raw(handle))
    }

    fn destroy_pipeline_layout(&self, layout: LayoutId) {
        self.state.lock().layouts.remove(layout.raw());
    }

    fn create_program(&self, layout: LayoutId, kind: ProgramKind) -> GpuResult<ProgramId> {
        let pipeline = {
            let state = self.state.lock();
            let layout = state
                .layouts
                .get(layout.raw())
                .ok_or(GpuError::InvalidHandle("pipeline layout"))?;
            self.scoped(|| {
                let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(kind.name()),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(program_source(kind))),
                });
                self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(kind.name()),
                    layout: Some(&layout.pipeline_layout),
                    module: &module,
                    entry_point: Some("main"),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })?
        };
        log::debug!("Compiled {} program", kind.name());
        let handle = self.state.lock().programs.insert(WgpuProgram { pipeline });
        Ok(ProgramId::from_raw(handle))
    }

    fn destroy_program(&self, program: ProgramId) {
        self.state.lock().programs.remove(program.raw());
    }

    fn create_descriptor_set(&self, layout: LayoutId, index: u32) -> GpuResult<DescriptorSetId> {
        let mut state = self.state.lock();
        let sets = state
            .layouts
            .get(layout.raw())
            .ok_or(GpuError::InvalidHandle("pipeline layout"))?
            .sets
            .len();
        if index as usize >= sets {
            return Err(GpuError::InvalidHandle("descriptor set index"));
        }
        let handle = state.sets.insert(WgpuDescriptorSet {
            layout,
            index,
            writes: Vec::new(),
        });
        Ok(DescriptorSetId::from_raw(handle))
    }

    fn update_descriptor_set(&self, set: DescriptorSetId, writes: &[DescriptorWrite]) -> GpuResult<()> {
        let mut state = self.state.lock();
        let entry = state.sets.get_mut(set.raw()).ok_or(GpuError::InvalidHandle("descriptor set"))?;
        for write in writes {
            match entry.writes.iter_mut().find(|w| w.binding == write.binding) {
                Some(existing) => *existing = *write,
                None => entry.writes.push(*write),
            }
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
        let handle = self.state.lock().pools.insert(WgpuPool {
            family,
            command_buffers: Vec::new(),
        });
        Ok(CommandPoolId::from_raw(handle))
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
        let mut state = self.state.lock();
        if !state.pools.contains(pool.raw()) {
            return Err(GpuError::InvalidHandle("command pool"));
        }
        let cb = CommandBufferId::from_raw(state.command_buffers.insert(WgpuCommandBuffer {
            pool,
            commands: CommandList::new(),
        }));
        if let Some(entry) = state.pools.get_mut(pool.raw()) {
            entry.command_buffers.push(cb);
        }
        Ok(cb)
    }

    fn record(&self, command_buffer: CommandBufferId, commands: CommandList) -> GpuResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .command_buffers
            .get_mut(command_buffer.raw())
            .ok_or(GpuError::InvalidHandle("command buffer"))?;
        entry.commands = commands;
        Ok(())
    }

    fn free_command_buffers(&self, pool: CommandPoolId, command_buffers: &[CommandBufferId]) {
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
        let mut state = self.state.lock();
        if let Some(fence) = fence {
            match state.fences.get(fence.raw()) {
                None => return Err(GpuError::InvalidHandle("fence")),
                Some(FenceState::Unsignaled) => {}
                Some(_) => return Err(GpuError::Backend("fence submitted while still signaled".into())),
            }
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("splat submission"),
        });
        let mut layouts = Vec::new();
        for batch in submits {
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
                let encoded = self.scoped(|| self.encode(&state, &mut encoder, &entry.commands))?;
                layouts.extend(encoded?);
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
        }

        let index = self.scoped(|| self.queue.submit(std::iter::once(encoder.finish())))?;
        for (image, layout) in layouts {
            if let Some(entry) = state.images.get_mut(image.raw()) {
                entry.layout = layout;
            }
        }
        if let Some(fence) = fence {
            let done = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&done);
            self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
            if let Some(entry) = state.fences.get_mut(fence.raw()) {
                *entry = FenceState::Pending { index, done };
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> GpuResult<()> {
        self.device.poll(wgpu::Maintain::Wait);
        Self::mark_fences_signaled(&mut self.state.lock());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_follow_features() {
        let none = capabilities_from(wgpu::Features::empty());
        assert!(!none.shader_int64);
        assert!(!none.shader_int64_atomics);
        assert_eq!(none.missing(&DeviceCapabilities::REQUIRED).len(), 2);

        let full = capabilities_from(wgpu::Features::SHADER_INT64 | wgpu::Features::SHADER_INT64_ATOMIC_MIN_MAX);
        assert!(full.missing(&DeviceCapabilities::REQUIRED).is_empty());
    }

    #[test]
    fn test_wanted_features_never_request_unavailable_ones() {
        let wanted = wanted_features(wgpu::Features::SHADER_INT64);
        assert!(wanted.contains(wgpu::Features::PUSH_CONSTANTS));
        assert!(wanted.contains(wgpu::Features::SHADER_INT64));
        assert!(!wanted.contains(wgpu::Features::SHADER_INT64_ATOMIC_MIN_MAX));
    }

    #[test]
    fn test_program_sources_declare_main() {
        for kind in ProgramKind::ALL {
            let source = program_source(kind);
            assert!(source.contains("fn main("), "{} has no entry point", kind.name());
            assert!(source.contains("var<push_constant>"), "{}", kind.name());
        }
    }

    #[test]
    fn test_row_padding() {
        assert_eq!(WgpuDevice::padded_row(64), 256);
        assert_eq!(WgpuDevice::padded_row(65), 512);
        assert_eq!(WgpuDevice::padded_row(1), 256);
    }
}
