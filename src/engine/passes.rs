//! Command recording for the two compute phases and the draw copy.
//!
//! Passes are ordered only by the barriers recorded here; nothing relies on
//! implicit ordering between dispatches.

use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::hal::{
    BufferBarrier, BufferId, CommandList, DescriptorSetId, GpuDevice, ImageBarrier, ImageId, ImageLayout,
    LayoutId, OwnedProgram, OwnershipTransfer, ProgramId, SyncPoint,
};
use crate::layout::{
    ProgramKind, PushConstants, RADIX_BLOCK, SET_FRAME, SET_HANDLES, SET_TRANSFORMS, WORKGROUP_SIZE, prefix_stage,
    radix_block_count,
};

/// The seven compute programs, in `ProgramKind::ALL` order
pub struct Programs {
    programs: Vec<OwnedProgram>,
}

impl Programs {
    pub fn create(device: &Arc<dyn GpuDevice>, layout: LayoutId) -> EngineResult<Self> {
        let mut programs = Vec::with_capacity(ProgramKind::ALL.len());
        for kind in ProgramKind::ALL {
            let program = OwnedProgram::create(device, layout, kind).map_err(|e| EngineError::ProgramCreation {
                program: kind.name(),
                reason: e.to_string(),
            })?;
            programs.push(program);
        }
        Ok(Self { programs })
    }

    pub fn get(&self, kind: ProgramKind) -> ProgramId {
        self.programs[kind as usize].id()
    }
}

/// Descriptor sets bound for every compute pass of one slot
#[derive(Copy, Clone, Debug)]
pub struct BoundSets {
    pub frame: DescriptorSetId,
    pub handles: DescriptorSetId,
    pub transforms: DescriptorSetId,
}

fn bind_sets(list: &mut CommandList, sets: BoundSets) {
    list.bind_descriptor_set(SET_FRAME, sets.frame)
        .bind_descriptor_set(SET_HANDLES, sets.handles)
        .bind_descriptor_set(SET_TRANSFORMS, sets.transforms);
}

fn compute_barrier(list: &mut CommandList) {
    list.memory_barrier(SyncPoint::COMPUTE_WRITE, SyncPoint::COMPUTE_READ_WRITE);
}

fn run(list: &mut CommandList, programs: &Programs, kind: ProgramKind, push: PushConstants, groups: [u32; 3]) {
    list.bind_program(programs.get(kind))
        .push_constants(0, bytemuck::bytes_of(&push))
        .dispatch(groups[0], groups[1], groups[2]);
}

fn linear(items: u32) -> [u32; 3] {
    [items.div_ceil(WORKGROUP_SIZE), 1, 1]
}

/// Phase 1: project every Gaussian, then a three-stage exclusive scan of the
/// tile counts whose total lands in the host-readable tiles-rendered buffer.
pub fn record_project(list: &mut CommandList, programs: &Programs, sets: BoundSets, push: PushConstants) {
    let n = push.point_count;
    bind_sets(list, sets);
    run(list, programs, ProgramKind::Project, push, linear(n));
    compute_barrier(list);

    let stage = |pass| PushConstants { pass, ..push };
    run(list, programs, ProgramKind::Prefix, stage(prefix_stage::BLOCK_SCAN), linear(n));
    compute_barrier(list);
    run(list, programs, ProgramKind::Prefix, stage(prefix_stage::SCAN_BLOCK_SUMS), [1, 1, 1]);
    compute_barrier(list);
    run(list, programs, ProgramKind::Prefix, stage(prefix_stage::ADD_BLOCK_BASE), linear(n));
    list.memory_barrier(SyncPoint::COMPUTE_WRITE, SyncPoint::HOST_READ);
}

/// Output image barrier handing it from compute to graphics. Recorded once on
/// each queue: as the release after blend and as the acquire before the copy.
pub fn output_handoff(output: ImageId, handoff: OwnershipTransfer) -> ImageBarrier {
    ImageBarrier {
        image: output,
        src: SyncPoint::COMPUTE_WRITE,
        dst: SyncPoint::TRANSFER_READ,
        old_layout: ImageLayout::General,
        new_layout: ImageLayout::TransferSrc,
        ownership: Some(handoff),
    }
}

pub struct SortPass {
    pub push: PushConstants,
    pub radix_passes: u32,
    pub tiles: (u32, u32),
    pub ranges: BufferId,
    pub output: ImageId,
    /// Set under async compute
    pub handoff: Option<OwnershipTransfer>,
}

/// Phase 2: keygen, radix sort, tile ranges and blend into the output image
pub fn record_sort(list: &mut CommandList, programs: &Programs, sets: BoundSets, pass: &SortPass) {
    let push = pass.push;
    let entries = push.tiles_rendered;
    let sorted = PushConstants {
        pass: pass.radix_passes,
        ..push
    };
    bind_sets(list, sets);

    if entries > 0 {
        run(list, programs, ProgramKind::Keygen, push, linear(push.point_count));
        compute_barrier(list);

        let blocks = [radix_block_count(entries), 1, 1];
        debug_assert!(blocks[0] * RADIX_BLOCK >= entries);
        for radix_pass in 0..pass.radix_passes {
            let step = PushConstants {
                pass: radix_pass,
                ..push
            };
            run(list, programs, ProgramKind::Radix, step, blocks);
            compute_barrier(list);
            run(list, programs, ProgramKind::Coalesce, step, blocks);
            compute_barrier(list);
        }
    }

    list.fill_buffer(pass.ranges, 0).buffer_barrier(BufferBarrier {
        buffer: pass.ranges,
        src: SyncPoint::TRANSFER_WRITE,
        dst: SyncPoint::COMPUTE_READ_WRITE,
        ownership: None,
    });
    if entries > 0 {
        run(list, programs, ProgramKind::Range, sorted, linear(entries));
        compute_barrier(list);
    }

    list.image_barrier(ImageBarrier {
        image: pass.output,
        src: SyncPoint::TOP,
        dst: SyncPoint::COMPUTE_WRITE,
        old_layout: ImageLayout::Undefined,
        new_layout: ImageLayout::General,
        ownership: None,
    });
    run(list, programs, ProgramKind::Blend, sorted, [pass.tiles.0, pass.tiles.1, 1]);

    list.image_barrier(match pass.handoff {
        Some(handoff) => output_handoff(pass.output, handoff),
        None => ImageBarrier {
            image: pass.output,
            src: SyncPoint::COMPUTE_WRITE,
            dst: SyncPoint::TRANSFER_READ,
            old_layout: ImageLayout::General,
            new_layout: ImageLayout::TransferSrc,
            ownership: None,
        },
    });
}

/// Graphics queue: copy the output image into the swap image
pub fn record_draw(list: &mut CommandList, output: ImageId, swap: ImageId, handoff: Option<OwnershipTransfer>) {
    if let Some(handoff) = handoff {
        list.image_barrier(output_handoff(output, handoff));
    }
    list.image_barrier(ImageBarrier {
        image: swap,
        src: SyncPoint::TOP,
        dst: SyncPoint::TRANSFER_WRITE,
        old_layout: ImageLayout::Undefined,
        new_layout: ImageLayout::TransferDst,
        ownership: None,
    })
    .copy_image(output, ImageLayout::TransferSrc, swap, ImageLayout::TransferDst)
    .image_barrier(ImageBarrier {
        image: swap,
        src: SyncPoint::TRANSFER_WRITE,
        dst: SyncPoint::NONE,
        old_layout: ImageLayout::TransferDst,
        new_layout: ImageLayout::PresentSrc,
        ownership: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::Command;
    use crate::hal::software::{SoftwareConfig, SoftwareDevice};
    use crate::hal::{OwnedDescriptorSet, OwnedLayout};
    use crate::layout::pipeline_layout;

    struct Fixture {
        programs: Programs,
        sets: BoundSets,
        _owned: Vec<OwnedDescriptorSet>,
        _layout: OwnedLayout,
    }

    fn fixture() -> Fixture {
        let device: Arc<dyn GpuDevice> = Arc::new(SoftwareDevice::new(SoftwareConfig::default()));
        let layout = OwnedLayout::create(&device, &pipeline_layout()).unwrap();
        let programs = Programs::create(&device, layout.id()).unwrap();
        let owned: Vec<_> = (0..3)
            .map(|i| OwnedDescriptorSet::create(&device, layout.id(), i).unwrap())
            .collect();
        let sets = BoundSets {
            frame: owned[0].id(),
            handles: owned[1].id(),
            transforms: owned[2].id(),
        };
        Fixture {
            programs,
            sets,
            _owned: owned,
            _layout: layout,
        }
    }

    fn dispatched(list: &CommandList, programs: &Programs, kind: ProgramKind) -> usize {
        let id = programs.get(kind);
        list.commands()
            .windows(3)
            .filter(|w| matches!(w[0], Command::BindProgram(p) if p == id) && matches!(w[2], Command::Dispatch { .. }))
            .count()
    }

    #[test]
    fn test_every_dispatch_is_followed_by_a_barrier_before_the_next() {
        let fx = fixture();
        let mut list = CommandList::new();
        let push = PushConstants {
            point_count: 10,
            sh_degree: 3,
            tiles_rendered: 40,
            pass: 0,
        };
        record_project(&mut list, &fx.programs, fx.sets, push);
        let mut pending = false;
        for command in list.commands() {
            match command {
                Command::Dispatch { .. } => {
                    assert!(!pending, "dispatch without an intervening barrier");
                    pending = true;
                }
                Command::MemoryBarrier { .. } => pending = false,
                _ => {}
            }
        }
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Prefix), 3);
    }

    #[test]
    fn test_sort_records_two_steps_per_radix_pass() {
        let fx = fixture();
        let mut list = CommandList::new();
        let device: Arc<dyn GpuDevice> = Arc::new(SoftwareDevice::new(SoftwareConfig::default()));
        let ranges = device
            .create_buffer(&crate::hal::BufferDesc {
                label: "ranges",
                size: 64,
                usage: crate::hal::BufferUsage::STORAGE,
                location: crate::hal::MemoryLocation::GpuOnly,
            })
            .unwrap();
        let pass = SortPass {
            push: PushConstants {
                point_count: 4,
                sh_degree: 0,
                tiles_rendered: 600,
                pass: 0,
            },
            radix_passes: 21,
            tiles: (16, 16),
            ranges,
            output: ImageId::from_raw(crate::hal::RawHandle {
                index: 0,
                generation: 0,
            }),
            handoff: None,
        };
        record_sort(&mut list, &fx.programs, fx.sets, &pass);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Radix), 21);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Coalesce), 21);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Keygen), 1);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Blend), 1);

        let range_push = list.commands().iter().rev().find_map(|c| match c {
            Command::PushConstants { data, .. } => Some(bytemuck::pod_read_unaligned::<PushConstants>(data)),
            _ => None,
        });
        assert_eq!(range_push.map(|p| p.pass), Some(21));
    }

    #[test]
    fn test_empty_frame_skips_sort_but_still_blends() {
        let fx = fixture();
        let mut list = CommandList::new();
        let pass = SortPass {
            push: PushConstants::default(),
            radix_passes: 17,
            tiles: (16, 16),
            ranges: BufferId::from_raw(crate::hal::RawHandle {
                index: 0,
                generation: 0,
            }),
            output: ImageId::from_raw(crate::hal::RawHandle {
                index: 0,
                generation: 0,
            }),
            handoff: None,
        };
        record_sort(&mut list, &fx.programs, fx.sets, &pass);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Keygen), 0);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Radix), 0);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Range), 0);
        assert_eq!(dispatched(&list, &fx.programs, ProgramKind::Blend), 1);
    }
}
