//! Host implementations of the seven compute programs.
//!
//! Each kernel mirrors its WGSL counterpart: same bindings, same push
//! constants, same workgroup decomposition. Work beyond the dispatched
//! workgroups is left untouched, as on a GPU.

use glam::{Mat4, Vec3};
use rayon::prelude::*;

use super::memory::{ImageMemory, Memory};
use crate::hal::{GpuError, GpuResult};
use crate::layout::{
    ProgramKind, PushConstants, RADIX_BITS, RADIX_BLOCK, RADIX_BUCKETS, SET_FRAME, SET_HANDLES,
    SET_TRANSFORMS, TILE_SIZE, WORKGROUP_SIZE, frame, handles, prefix_stage, transforms,
};
use crate::splat::project::project_point;
use crate::splat::{CameraUniform, GaussianPoint, Splat, key_tile, sort_key};

/// Set and binding of one program resource
pub type Slot = (u32, u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Use {
    Read,
    Write,
    ReadWrite,
}

impl Use {
    pub fn writes(self) -> bool {
        !matches!(self, Use::Read)
    }
}

const fn f(binding: u32) -> Slot {
    (SET_FRAME, binding)
}

/// Source and destination sort buffers for radix pass `pass`
fn ping_pong(pass: u32) -> ((Slot, Slot), (Slot, Slot)) {
    let primary = (f(frame::SORT_KEYS), f(frame::SORT_VALUES));
    let alt = (f(frame::SORT_KEYS_ALT), f(frame::SORT_VALUES_ALT));
    if pass % 2 == 0 { (primary, alt) } else { (alt, primary) }
}

fn blocks_for(pass: u32) -> Slot {
    if pass % 2 == 0 {
        f(frame::RADIX_BLOCKS_A)
    } else {
        f(frame::RADIX_BLOCKS_B)
    }
}

/// Sort buffers holding the result after `passes` radix passes
pub fn sorted_after(passes: u32) -> (Slot, Slot) {
    if passes % 2 == 1 {
        (f(frame::SORT_KEYS_ALT), f(frame::SORT_VALUES_ALT))
    } else {
        (f(frame::SORT_KEYS), f(frame::SORT_VALUES))
    }
}

/// Resources a dispatch touches, in the order its kernel expects them
pub fn footprint(kind: ProgramKind, push: &PushConstants) -> Vec<(Slot, Use)> {
    use Use::*;
    match kind {
        ProgramKind::Project => vec![
            (f(frame::CAMERA), Read),
            (f(frame::POINTS), Read),
            ((SET_HANDLES, handles::TRANSFORM_HANDLES), Read),
            ((SET_HANDLES, handles::TRANSFORM_INDICES), Read),
            ((SET_TRANSFORMS, transforms::TRANSFORMS), Read),
            (f(frame::SPLATS), Write),
            (f(frame::TILE_COUNTS), Write),
        ],
        ProgramKind::Prefix => match push.pass {
            prefix_stage::BLOCK_SCAN => vec![
                (f(frame::TILE_COUNTS), Read),
                (f(frame::TILE_OFFSETS), Write),
                (f(frame::PREFIX_BLOCK_SUMS), Write),
            ],
            prefix_stage::SCAN_BLOCK_SUMS => vec![
                (f(frame::PREFIX_BLOCK_SUMS), ReadWrite),
                (f(frame::TILES_RENDERED), Write),
            ],
            _ => vec![
                (f(frame::PREFIX_BLOCK_SUMS), Read),
                (f(frame::TILE_OFFSETS), ReadWrite),
            ],
        },
        ProgramKind::Keygen => vec![
            (f(frame::CAMERA), Read),
            (f(frame::SPLATS), Read),
            (f(frame::TILE_OFFSETS), Read),
            (f(frame::SORT_KEYS), Write),
            (f(frame::SORT_VALUES), Write),
        ],
        ProgramKind::Radix => {
            let ((keys, _), _) = ping_pong(push.pass);
            vec![(keys, Read), (blocks_for(push.pass), Write)]
        }
        ProgramKind::Coalesce => {
            let ((keys, values), (keys_out, values_out)) = ping_pong(push.pass);
            vec![
                (keys, Read),
                (values, Read),
                (blocks_for(push.pass), Read),
                (f(frame::RADIX_GLOBAL_PREFIX), Write),
                (keys_out, Write),
                (values_out, Write),
            ]
        }
        ProgramKind::Range => {
            let (keys, _) = sorted_after(push.pass);
            vec![(keys, Read), (f(frame::TILE_RANGES), ReadWrite)]
        }
        ProgramKind::Blend => {
            let (_, values) = sorted_after(push.pass);
            vec![
                (f(frame::CAMERA), Read),
                (f(frame::SPLATS), Read),
                (values, Read),
                (f(frame::TILE_RANGES), Read),
                (f(frame::OUTPUT_IMAGE), Write),
            ]
        }
    }
}

/// Resources taken out of the device for the duration of one dispatch
#[derive(Default)]
pub struct Bound {
    pub reads: Vec<(Slot, Memory)>,
    /// Written resources, in footprint order
    pub writes: Vec<(Slot, Memory)>,
    pub image: Option<ImageMemory>,
}

fn view<T: bytemuck::Pod>(reads: &[(Slot, Memory)], slot: Slot) -> GpuResult<&[T]> {
    reads
        .iter()
        .find(|(s, _)| *s == slot)
        .ok_or_else(|| GpuError::Backend(format!("binding {:?} not bound", slot)))?
        .1
        .typed()
}

fn need(name: &str, len: usize, required: usize) -> GpuResult<()> {
    if len < required {
        return Err(GpuError::OutOfBounds {
            resource: name.to_string(),
            offset: 0,
            len: required as u64,
            size: len as u64,
        });
    }
    Ok(())
}

fn bad_footprint(kind: ProgramKind) -> GpuError {
    GpuError::Backend(format!("{} dispatched with unexpected bindings", kind.name()))
}

/// Run `kind` over `groups` workgroups
pub fn dispatch(kind: ProgramKind, push: &PushConstants, groups: [u32; 3], io: &mut Bound) -> GpuResult<()> {
    let Bound { reads, writes, image } = io;
    let reads: &[(Slot, Memory)] = reads;
    let linear = (groups[0] as usize) * (groups[1] as usize) * (groups[2] as usize);

    match kind {
        ProgramKind::Project => {
            let [(_, splats), (_, counts)] = writes.as_mut_slice() else {
                return Err(bad_footprint(kind));
            };
            let camera = view::<CameraUniform>(reads, f(frame::CAMERA))?;
            need("camera", camera.len(), 1)?;
            let n = (push.point_count as usize).min(linear * WORKGROUP_SIZE as usize);
            project(
                view(reads, f(frame::POINTS))?,
                view(reads, (SET_HANDLES, handles::TRANSFORM_HANDLES))?,
                view(reads, (SET_HANDLES, handles::TRANSFORM_INDICES))?,
                view(reads, (SET_TRANSFORMS, transforms::TRANSFORMS))?,
                &camera[0],
                push.sh_degree,
                n,
                splats.typed_mut()?,
                counts.typed_mut()?,
            )
        }
        ProgramKind::Prefix => {
            let n = (push.point_count as usize).min(linear * WORKGROUP_SIZE as usize);
            match push.pass {
                prefix_stage::BLOCK_SCAN => {
                    let [(_, offsets), (_, sums)] = writes.as_mut_slice() else {
                        return Err(bad_footprint(kind));
                    };
                    prefix_block_scan(view(reads, f(frame::TILE_COUNTS))?, n, offsets.typed_mut()?, sums.typed_mut()?)
                }
                prefix_stage::SCAN_BLOCK_SUMS => {
                    let [(_, sums), (_, total)] = writes.as_mut_slice() else {
                        return Err(bad_footprint(kind));
                    };
                    let blocks = (push.point_count as usize).div_ceil(WORKGROUP_SIZE as usize);
                    prefix_scan_block_sums(sums.typed_mut()?, blocks, total.typed_mut()?)
                }
                _ => {
                    let [(_, offsets)] = writes.as_mut_slice() else {
                        return Err(bad_footprint(kind));
                    };
                    prefix_add_block_base(view(reads, f(frame::PREFIX_BLOCK_SUMS))?, n, offsets.typed_mut()?)
                }
            }
        }
        ProgramKind::Keygen => {
            let [(_, keys), (_, values)] = writes.as_mut_slice() else {
                return Err(bad_footprint(kind));
            };
            let camera = view::<CameraUniform>(reads, f(frame::CAMERA))?;
            need("camera", camera.len(), 1)?;
            let n = (push.point_count as usize).min(linear * WORKGROUP_SIZE as usize);
            keygen(
                view(reads, f(frame::SPLATS))?,
                view(reads, f(frame::TILE_OFFSETS))?,
                n,
                camera[0].tiles().0,
                push.tiles_rendered as usize,
                keys.typed_mut()?,
                values.typed_mut()?,
            )
        }
        ProgramKind::Radix => {
            let [(_, blocks)] = writes.as_mut_slice() else {
                return Err(bad_footprint(kind));
            };
            let ((keys, _), _) = ping_pong(push.pass);
            let n = (push.tiles_rendered as usize).min(linear * RADIX_BLOCK as usize);
            radix_histogram(view(reads, keys)?, n, push.tiles_rendered as usize, push.pass, blocks.typed_mut()?)
        }
        ProgramKind::Coalesce => {
            let [(_, global), (_, keys_out), (_, values_out)] = writes.as_mut_slice() else {
                return Err(bad_footprint(kind));
            };
            let ((keys, values), _) = ping_pong(push.pass);
            let n = (push.tiles_rendered as usize).min(linear * RADIX_BLOCK as usize);
            radix_coalesce(
                view(reads, keys)?,
                view(reads, values)?,
                view(reads, blocks_for(push.pass))?,
                n,
                push.tiles_rendered as usize,
                push.pass,
                global.typed_mut()?,
                keys_out.typed_mut()?,
                values_out.typed_mut()?,
            )
        }
        ProgramKind::Range => {
            let [(_, ranges)] = writes.as_mut_slice() else {
                return Err(bad_footprint(kind));
            };
            let (keys, _) = sorted_after(push.pass);
            let n = (push.tiles_rendered as usize).min(linear * WORKGROUP_SIZE as usize);
            tile_ranges(view(reads, keys)?, n, push.tiles_rendered as usize, ranges.typed_mut()?)
        }
        ProgramKind::Blend => {
            let image = image.as_mut().ok_or_else(|| bad_footprint(kind))?;
            let camera = view::<CameraUniform>(reads, f(frame::CAMERA))?;
            need("camera", camera.len(), 1)?;
            let (_, values) = sorted_after(push.pass);
            blend(
                view(reads, f(frame::SPLATS))?,
                view(reads, values)?,
                view(reads, f(frame::TILE_RANGES))?,
                &camera[0],
                [groups[0] * TILE_SIZE, groups[1] * TILE_SIZE],
                image,
            )
        }
    }
}

/// One invocation per Gaussian: splat record plus tile count
#[allow(clippy::too_many_arguments)]
pub fn project(
    points: &[GaussianPoint],
    transform_handles: &[u32],
    transform_indices: &[u32],
    transform_table: &[[[f32; 4]; 4]],
    camera: &CameraUniform,
    sh_degree: u32,
    n: usize,
    splats: &mut [Splat],
    counts: &mut [u32],
) -> GpuResult<()> {
    need("points", points.len(), n)?;
    need("splats", splats.len(), n)?;
    need("tile counts", counts.len(), n)?;
    need("transform indices", transform_indices.len(), n)?;

    splats[..n]
        .par_iter_mut()
        .zip(counts[..n].par_iter_mut())
        .enumerate()
        .for_each(|(i, (splat, count))| {
            let model = transform_indices
                .get(i)
                .and_then(|&slot| transform_handles.get(slot as usize))
                .and_then(|&handle| transform_table.get(handle as usize))
                .map(Mat4::from_cols_array_2d)
                .unwrap_or(Mat4::IDENTITY);
            *splat = project_point(&points[i], model, camera, sh_degree);
            *count = splat.tile_count();
        });
    Ok(())
}

/// Stage 0: exclusive scan inside each 256-entry block, block totals out
pub fn prefix_block_scan(counts: &[u32], n: usize, offsets: &mut [u32], block_sums: &mut [u32]) -> GpuResult<()> {
    let block = WORKGROUP_SIZE as usize;
    need("tile counts", counts.len(), n)?;
    need("tile offsets", offsets.len(), n)?;
    need("prefix block sums", block_sums.len(), n.div_ceil(block))?;

    offsets[..n]
        .par_chunks_mut(block)
        .zip(counts[..n].par_chunks(block))
        .zip(block_sums.par_iter_mut())
        .for_each(|((out, input), sum)| {
            let mut running = 0u32;
            for (o, c) in out.iter_mut().zip(input) {
                *o = running;
                running += c;
            }
            *sum = running;
        });
    Ok(())
}

/// Stage 1: single workgroup scans the block totals and publishes the grand total
pub fn prefix_scan_block_sums(block_sums: &mut [u32], blocks: usize, total: &mut [u32]) -> GpuResult<()> {
    need("prefix block sums", block_sums.len(), blocks)?;
    need("tiles rendered", total.len(), 1)?;
    let mut running = 0u32;
    for sum in &mut block_sums[..blocks] {
        let value = *sum;
        *sum = running;
        running += value;
    }
    total[0] = running;
    Ok(())
}

/// Stage 2: add each block's base to its local offsets
pub fn prefix_add_block_base(block_sums: &[u32], n: usize, offsets: &mut [u32]) -> GpuResult<()> {
    let block = WORKGROUP_SIZE as usize;
    need("tile offsets", offsets.len(), n)?;
    need("prefix block sums", block_sums.len(), n.div_ceil(block))?;
    offsets[..n]
        .par_chunks_mut(block)
        .zip(block_sums.par_iter())
        .for_each(|(out, base)| out.iter_mut().for_each(|o| *o += base));
    Ok(())
}

/// One invocation per Gaussian: a (key, index) pair per covered tile
pub fn keygen(
    splats: &[Splat],
    offsets: &[u32],
    n: usize,
    tiles_x: u32,
    entries: usize,
    keys: &mut [u64],
    values: &mut [u32],
) -> GpuResult<()> {
    need("splats", splats.len(), n)?;
    need("tile offsets", offsets.len(), n)?;
    need("sort keys", keys.len(), entries)?;
    need("sort values", values.len(), entries)?;

    let emitted: Vec<(usize, Vec<u64>)> = splats[..n]
        .par_iter()
        .zip(offsets[..n].par_iter())
        .map(|(splat, &offset)| {
            let mut out = Vec::with_capacity(splat.tile_count() as usize);
            for ty in splat.tile_min[1]..splat.tile_max[1] {
                for tx in splat.tile_min[0]..splat.tile_max[0] {
                    out.push(sort_key(ty * tiles_x + tx, splat.depth));
                }
            }
            (offset as usize, out)
        })
        .collect();

    for (index, (offset, splat_keys)) in emitted.into_iter().enumerate() {
        for (k, key) in splat_keys.into_iter().enumerate() {
            let at = offset + k;
            if at < entries {
                keys[at] = key;
                values[at] = index as u32;
            }
        }
    }
    Ok(())
}

fn digit(key: u64, pass: u32) -> usize {
    (key.checked_shr(RADIX_BITS * pass).unwrap_or(0) & (RADIX_BUCKETS as u64 - 1)) as usize
}

/// Per-block digit counts, digit-major: `blocks[d * block_count + b]`
pub fn radix_histogram(keys: &[u64], n: usize, entries: usize, pass: u32, blocks: &mut [u32]) -> GpuResult<()> {
    let block = RADIX_BLOCK as usize;
    let buckets = RADIX_BUCKETS as usize;
    let block_count = entries.div_ceil(block);
    need("sort keys", keys.len(), n)?;
    need("radix blocks", blocks.len(), block_count * buckets)?;

    let counts: Vec<[u32; 4]> = keys[..n]
        .par_chunks(block)
        .map(|chunk| {
            let mut count = [0u32; 4];
            for &key in chunk {
                count[digit(key, pass)] += 1;
            }
            count
        })
        .collect();

    for (b, count) in counts.iter().enumerate() {
        for (d, &c) in count.iter().enumerate() {
            blocks[d * block_count + b] = c;
        }
    }
    Ok(())
}

/// Scan the histogram into global bases, then scatter each block stably
#[allow(clippy::too_many_arguments)]
pub fn radix_coalesce(
    keys: &[u64],
    values: &[u32],
    blocks: &[u32],
    n: usize,
    entries: usize,
    pass: u32,
    global_prefix: &mut [u32],
    keys_out: &mut [u64],
    values_out: &mut [u32],
) -> GpuResult<()> {
    let block = RADIX_BLOCK as usize;
    let buckets = RADIX_BUCKETS as usize;
    let block_count = entries.div_ceil(block);
    let cells = block_count * buckets;
    need("sort keys", keys.len(), n)?;
    need("sort values", values.len(), n)?;
    need("radix blocks", blocks.len(), cells)?;
    need("radix global prefix", global_prefix.len(), cells)?;
    need("sort keys out", keys_out.len(), entries)?;
    need("sort values out", values_out.len(), entries)?;

    let mut running = 0u32;
    for (base, &count) in global_prefix[..cells].iter_mut().zip(&blocks[..cells]) {
        *base = running;
        running += count;
    }

    let global: &[u32] = &*global_prefix;
    let destinations: Vec<Vec<usize>> = keys[..n]
        .par_chunks(block)
        .enumerate()
        .map(|(b, chunk)| {
            let mut rank = [0u32; 4];
            chunk
                .iter()
                .map(|&key| {
                    let d = digit(key, pass);
                    let at = global[d * block_count + b] + rank[d];
                    rank[d] += 1;
                    at as usize
                })
                .collect()
        })
        .collect();

    for (i, at) in destinations.into_iter().flatten().enumerate() {
        if at < entries {
            keys_out[at] = keys[i];
            values_out[at] = values[i];
        }
    }
    Ok(())
}

/// `[start, end)` per tile from sorted keys; untouched tiles keep their cleared value
pub fn tile_ranges(keys: &[u64], n: usize, entries: usize, ranges: &mut [[u32; 2]]) -> GpuResult<()> {
    need("sort keys", keys.len(), n)?;
    for i in 0..n {
        let tile = key_tile(keys[i]) as usize;
        if tile >= ranges.len() {
            continue;
        }
        if i == 0 {
            ranges[tile][0] = 0;
        } else {
            let prev = key_tile(keys[i - 1]) as usize;
            if prev != tile {
                if prev < ranges.len() {
                    ranges[prev][1] = i as u32;
                }
                ranges[tile][0] = i as u32;
            }
        }
        if i + 1 == entries {
            ranges[tile][1] = entries as u32;
        }
    }
    Ok(())
}

/// Minimum alpha a splat must reach to contribute
pub const ALPHA_THRESHOLD: f32 = 1.0 / 255.0;
/// Transmittance below which a pixel stops compositing
pub const SATURATION: f32 = 1e-4;
pub const MAX_ALPHA: f32 = 0.99;

/// Front-to-back compositing, one invocation per pixel of each dispatched tile
pub fn blend(
    splats: &[Splat],
    values: &[u32],
    ranges: &[[u32; 2]],
    camera: &CameraUniform,
    dispatched: [u32; 2],
    image: &mut ImageMemory,
) -> GpuResult<()> {
    let (tiles_x, tiles_y) = camera.tiles();
    need("tile ranges", ranges.len(), (tiles_x * tiles_y) as usize)?;
    let width = image.width;
    let height = image.height;
    let background = Vec3::new(camera.background[0], camera.background[1], camera.background[2]);

    image
        .pixels
        .par_iter_mut()
        .enumerate()
        .try_for_each(|(index, pixel)| -> GpuResult<()> {
            let x = index as u32 % width;
            let y = index as u32 / width;
            if x >= dispatched[0] || y >= dispatched[1] || y >= height {
                return Ok(());
            }
            let tile = ((y / TILE_SIZE) * tiles_x + x / TILE_SIZE) as usize;
            let [start, end] = ranges.get(tile).copied().unwrap_or([0, 0]);
            let px = x as f32 + 0.5;
            let py = y as f32 + 0.5;

            let mut color = Vec3::ZERO;
            let mut transmittance = 1.0f32;
            for i in start..end {
                let splat_index = *values
                    .get(i as usize)
                    .ok_or_else(|| GpuError::Backend("sort value out of range".into()))?;
                let splat = splats
                    .get(splat_index as usize)
                    .ok_or_else(|| GpuError::Backend("splat out of range".into()))?;
                let dx = px - splat.center[0];
                let dy = py - splat.center[1];
                let [a, b, c, _] = splat.conic;
                let power = -0.5 * (a * dx * dx + c * dy * dy) - b * dx * dy;
                if power > 0.0 {
                    continue;
                }
                let alpha = (splat.opacity * power.exp()).min(MAX_ALPHA);
                if alpha < ALPHA_THRESHOLD {
                    continue;
                }
                color += Vec3::new(splat.color[0], splat.color[1], splat.color[2]) * alpha * transmittance;
                transmittance *= 1.0 - alpha;
                if transmittance < SATURATION {
                    break;
                }
            }

            let rgb = color + background * transmittance;
            *pixel = pack_rgba8(rgb);
            Ok(())
        })
}

pub fn pack_rgba8(rgb: Vec3) -> [u8; 4] {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    [q(rgb.x), q(rgb.y), q(rgb.z), 255]
}
