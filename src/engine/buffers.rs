//! Device buffers owned by the engine: scene uploads, per-point scratch and the
//! tile-proportional sort buffers that grow with the tiles-rendered count.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Mat4;

use crate::error::{EngineError, EngineResult};
use crate::hal::{BufferDesc, BufferUsage, DescriptorWrite, GpuDevice, GpuResult, MemoryLocation, OwnedBuffer, SyncPoint};
use crate::layout::{RADIX_BLOCK, RADIX_BUCKETS, WORKGROUP_SIZE, frame, handles, radix_block_count, tile_grid, transforms};
use crate::splat::{Entity, POINT_RECORD_SIZE, SPLAT_RECORD_SIZE, SplatGroup, SplatScene};
use crate::transfer::{TransferQueue, TransferTarget};

/// Smallest buffer the engine creates; empty scenes still bind something
const MIN_BUFFER_SIZE: u64 = 16;

fn device_buffer(device: &Arc<dyn GpuDevice>, label: &str, size: u64) -> GpuResult<OwnedBuffer> {
    OwnedBuffer::create(
        device,
        &BufferDesc {
            label,
            size: size.max(MIN_BUFFER_SIZE),
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        },
    )
}

/// Capacity after growing to hold `tiles_rendered` entries:
/// `max(t, ceil(t * growth))`, rounded up to whole radix blocks
pub fn grown_capacity(tiles_rendered: u32, growth: f32) -> u32 {
    let scaled = (tiles_rendered as f64 * growth.max(1.0) as f64).ceil() as u64;
    let wanted = scaled.max(tiles_rendered as u64);
    let ceiling = (u32::MAX / RADIX_BLOCK * RADIX_BLOCK) as u64;
    wanted.next_multiple_of(RADIX_BLOCK as u64).min(ceiling) as u32
}

/// Sort keys, values, their ping-pong twins and the radix block descriptors
pub struct TileBuffers {
    /// Sort entries each buffer holds
    pub capacity: u32,
    pub keys: OwnedBuffer,
    pub values: OwnedBuffer,
    pub keys_alt: OwnedBuffer,
    pub values_alt: OwnedBuffer,
    pub blocks_a: OwnedBuffer,
    pub blocks_b: OwnedBuffer,
    pub global_prefix: OwnedBuffer,
}

impl TileBuffers {
    pub fn allocate(device: &Arc<dyn GpuDevice>, capacity: u32) -> GpuResult<Self> {
        let capacity = capacity.max(1).next_multiple_of(RADIX_BLOCK);
        let entries = capacity as u64;
        let cells = radix_block_count(capacity) as u64 * RADIX_BUCKETS as u64;
        Ok(Self {
            capacity,
            keys: device_buffer(device, "sort keys", entries * 8)?,
            values: device_buffer(device, "sort values", entries * 4)?,
            keys_alt: device_buffer(device, "sort keys alt", entries * 8)?,
            values_alt: device_buffer(device, "sort values alt", entries * 4)?,
            blocks_a: device_buffer(device, "radix blocks a", cells * 4)?,
            blocks_b: device_buffer(device, "radix blocks b", cells * 4)?,
            global_prefix: device_buffer(device, "radix global prefix", cells * 4)?,
        })
    }

    pub fn descriptor_writes(&self) -> [DescriptorWrite; 7] {
        [
            DescriptorWrite::buffer(frame::SORT_KEYS, self.keys.id()),
            DescriptorWrite::buffer(frame::SORT_VALUES, self.values.id()),
            DescriptorWrite::buffer(frame::SORT_KEYS_ALT, self.keys_alt.id()),
            DescriptorWrite::buffer(frame::SORT_VALUES_ALT, self.values_alt.id()),
            DescriptorWrite::buffer(frame::RADIX_BLOCKS_A, self.blocks_a.id()),
            DescriptorWrite::buffer(frame::RADIX_BLOCKS_B, self.blocks_b.id()),
            DescriptorWrite::buffer(frame::RADIX_GLOBAL_PREFIX, self.global_prefix.id()),
        ]
    }

    /// Byte size of every buffer, in binding order
    pub fn sizes(&self) -> [u64; 7] {
        [
            self.keys.size(),
            self.values.size(),
            self.keys_alt.size(),
            self.values_alt.size(),
            self.blocks_a.size(),
            self.blocks_b.size(),
            self.global_prefix.size(),
        ]
    }
}

/// `[start, end)` pair per screen tile
pub fn ranges_buffer(device: &Arc<dyn GpuDevice>, extent: (u32, u32)) -> GpuResult<OwnedBuffer> {
    let (tiles_x, tiles_y) = tile_grid(extent.0, extent.1);
    device_buffer(device, "tile ranges", tiles_x as u64 * tiles_y as u64 * 8)
}

/// Per-Gaussian work buffers of one slot, sized at compile
pub struct PointScratch {
    pub splats: OwnedBuffer,
    pub tile_counts: OwnedBuffer,
    pub tile_offsets: OwnedBuffer,
    pub block_sums: OwnedBuffer,
}

impl PointScratch {
    pub fn allocate(device: &Arc<dyn GpuDevice>, point_count: u32) -> GpuResult<Self> {
        let n = point_count as u64;
        Ok(Self {
            splats: device_buffer(device, "splats", n * SPLAT_RECORD_SIZE)?,
            tile_counts: device_buffer(device, "tile counts", n * 4)?,
            tile_offsets: device_buffer(device, "tile offsets", n * 4)?,
            block_sums: device_buffer(device, "prefix block sums", n.div_ceil(WORKGROUP_SIZE as u64) * 4)?,
        })
    }
}

/// Transform slot assignment for one scene
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransformSlots {
    /// Slot to index in the host transform table
    pub handles: Vec<u32>,
    /// Gaussian to slot
    pub indices: Vec<u32>,
    /// Entity to slot
    pub by_entity: HashMap<Entity, u32>,
}

/// Shared groups take one slot; individual entities take one each, in upload order.
pub fn assign_transform_slots(scene: &dyn SplatScene) -> EngineResult<TransformSlots> {
    let table_len = scene.transforms().len() as u32;
    let mut slots = TransformSlots::default();
    slots.indices.reserve(scene.gaussian_count() as usize);

    let claim = |slots: &mut TransformSlots, entity: Entity| -> EngineResult<u32> {
        let index = scene
            .transform_index(entity)
            .filter(|&index| index < table_len)
            .ok_or_else(|| EngineError::InvalidScene(format!("entity {:?} has no transform", entity)))?;
        let slot = slots.handles.len() as u32;
        slots.handles.push(index);
        slots.by_entity.insert(entity, slot);
        Ok(slot)
    };

    for group in scene.groups() {
        match group {
            SplatGroup::Shared { entity, len } => {
                let slot = claim(&mut slots, *entity)?;
                slots.indices.extend(std::iter::repeat_n(slot, *len as usize));
            }
            SplatGroup::Individual { entities } => {
                for entity in entities {
                    let slot = claim(&mut slots, *entity)?;
                    slots.indices.push(slot);
                }
            }
        }
    }

    if slots.indices.len() as u32 != scene.gaussian_count() {
        return Err(EngineError::InvalidScene(format!(
            "groups cover {} Gaussians but the scene has {}",
            slots.indices.len(),
            scene.gaussian_count()
        )));
    }
    Ok(slots)
}

/// Scene data bound at sets 0 (points), 1 and 2
pub struct SceneBuffers {
    pub point_count: u32,
    pub points: OwnedBuffer,
    pub transform_handles: OwnedBuffer,
    pub transform_indices: OwnedBuffer,
    pub transforms: OwnedBuffer,
}

fn transform_table(transforms: &[Mat4]) -> Vec<[[f32; 4]; 4]> {
    if transforms.is_empty() {
        return vec![Mat4::IDENTITY.to_cols_array_2d()];
    }
    transforms.iter().map(Mat4::to_cols_array_2d).collect()
}

/// Upload `data` into a fresh device buffer owned by the compute family
fn upload(device: &Arc<dyn GpuDevice>, transfer: &TransferQueue, label: &str, data: &[u8]) -> EngineResult<OwnedBuffer> {
    let buffer = device_buffer(device, label, data.len() as u64)?;
    transfer.transfer(
        data,
        TransferTarget::Buffer {
            buffer: buffer.id(),
            offset: 0,
        },
        device.info().queues.compute,
        SyncPoint::COMPUTE_READ,
    )?;
    Ok(buffer)
}

pub fn upload_transforms(
    device: &Arc<dyn GpuDevice>,
    transfer: &TransferQueue,
    transforms: &[Mat4],
) -> EngineResult<OwnedBuffer> {
    let table = transform_table(transforms);
    upload(device, transfer, "transforms", bytemuck::cast_slice(&table))
}

impl SceneBuffers {
    /// Placeholder bindings for an engine with no compiled scene
    pub fn empty(device: &Arc<dyn GpuDevice>) -> GpuResult<Self> {
        Ok(Self {
            point_count: 0,
            points: device_buffer(device, "points", POINT_RECORD_SIZE)?,
            transform_handles: device_buffer(device, "transform handles", 4)?,
            transform_indices: device_buffer(device, "transform indices", 4)?,
            transforms: device_buffer(device, "transforms", 64)?,
        })
    }

    /// Validate and upload a scene. Returns the buffers and the bytes queued.
    pub fn upload(
        device: &Arc<dyn GpuDevice>,
        transfer: &TransferQueue,
        scene: &dyn SplatScene,
        slots: &TransformSlots,
    ) -> EngineResult<(Self, u64)> {
        let count = scene.gaussian_count();
        let expected = count as u64 * POINT_RECORD_SIZE;
        let points = scene.point_bytes();
        if points.len() as u64 != expected {
            return Err(EngineError::InvalidScene(format!(
                "{} point bytes for {} Gaussians, expected {}",
                points.len(),
                count,
                expected
            )));
        }

        let table = transform_table(scene.transforms());
        let table_bytes: &[u8] = bytemuck::cast_slice(&table);
        let handle_bytes: &[u8] = bytemuck::cast_slice(&slots.handles);
        let index_bytes: &[u8] = bytemuck::cast_slice(&slots.indices);
        let queued = (points.len() + table_bytes.len() + handle_bytes.len() + index_bytes.len()) as u64;

        let buffers = Self {
            point_count: count,
            points: upload(device, transfer, "points", points)?,
            transform_handles: upload(device, transfer, "transform handles", handle_bytes)?,
            transform_indices: upload(device, transfer, "transform indices", index_bytes)?,
            transforms: upload(device, transfer, "transforms", table_bytes)?,
        };
        Ok((buffers, queued))
    }

    pub fn handle_writes(&self) -> [DescriptorWrite; 2] {
        [
            DescriptorWrite::buffer(handles::TRANSFORM_HANDLES, self.transform_handles.id()),
            DescriptorWrite::buffer(handles::TRANSFORM_INDICES, self.transform_indices.id()),
        ]
    }

    pub fn transform_writes(&self) -> [DescriptorWrite; 1] {
        [DescriptorWrite::buffer(transforms::TRANSFORMS, self.transforms.id())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat::{GaussianPoint, PointCloud};

    struct BrokenScene {
        groups: Vec<SplatGroup>,
        transforms: Vec<Mat4>,
    }

    impl SplatScene for BrokenScene {
        fn gaussian_count(&self) -> u32 {
            3
        }

        fn point_bytes(&self) -> &[u8] {
            &[]
        }

        fn groups(&self) -> &[SplatGroup] {
            &self.groups
        }

        fn transform_index(&self, entity: Entity) -> Option<u32> {
            Some(entity.0)
        }

        fn transforms(&self) -> &[Mat4] {
            &self.transforms
        }
    }

    #[test]
    fn test_growth_rounds_to_radix_blocks() {
        assert_eq!(grown_capacity(1, 1.5), 256);
        assert_eq!(grown_capacity(1000, 1.5), 1536);
        assert_eq!(grown_capacity(1000, 0.5), 1024);
        assert_eq!(grown_capacity(0, 2.0), 0);
    }

    #[test]
    fn test_growth_is_monotonic_and_sufficient() {
        let mut last = 0;
        for t in [3u32, 700, 701, 5000, 5001, 123_457] {
            let capacity = grown_capacity(t, 1.25);
            assert!(capacity >= t);
            assert!(capacity >= last);
            assert_eq!(capacity % RADIX_BLOCK, 0);
            last = capacity;
        }
    }

    #[test]
    fn test_shared_and_individual_slots() {
        let mut cloud = PointCloud::new();
        let group = cloud.push_group(vec![GaussianPoint::default(); 3], Mat4::IDENTITY);
        let a = cloud.push_individual(GaussianPoint::default(), Mat4::from_translation(glam::Vec3::X));
        let b = cloud.push_individual(GaussianPoint::default(), Mat4::from_translation(glam::Vec3::Y));

        let slots = assign_transform_slots(&cloud).unwrap();
        assert_eq!(slots.indices, vec![0, 0, 0, 1, 2]);
        assert_eq!(slots.handles.len(), 3);
        assert_eq!(slots.by_entity[&group], 0);
        assert_eq!(slots.by_entity[&a], 1);
        assert_eq!(slots.by_entity[&b], 2);
    }

    #[test]
    fn test_group_count_mismatch_is_invalid_scene() {
        let scene = BrokenScene {
            groups: vec![SplatGroup::Shared {
                entity: Entity(0),
                len: 2,
            }],
            transforms: vec![Mat4::IDENTITY],
        };
        assert!(matches!(assign_transform_slots(&scene), Err(EngineError::InvalidScene(_))));
    }

    #[test]
    fn test_missing_transform_is_invalid_scene() {
        let scene = BrokenScene {
            groups: vec![SplatGroup::Shared {
                entity: Entity(4),
                len: 3,
            }],
            transforms: vec![Mat4::IDENTITY],
        };
        assert!(matches!(assign_transform_slots(&scene), Err(EngineError::InvalidScene(_))));
    }
}
