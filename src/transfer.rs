//! Staged uploads on the transfer queue with asynchronous reclamation.
//!
//! `transfer` copies host data into a staging buffer, records the copy on the
//! transfer family and, when the destination lives on another family, hands
//! ownership over with a release/acquire pair chained by a binary semaphore.
//! It returns immediately. A single worker thread waits on each upload's fence
//! and then frees its command buffers, staging buffer, semaphore and fence.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::error::{EngineError, EngineResult};
use crate::hal::{
    BufferBarrier, BufferDesc, BufferId, BufferUsage, CommandBufferId, CommandList, CommandPoolId, FenceId, GpuDevice,
    GpuError, ImageBarrier, ImageId, ImageLayout, MemoryLocation, OwnedBuffer, OwnedCommandPool, OwnedFence,
    OwnedSemaphore, OwnershipTransfer, SemaphoreId, SemaphoreWait, SubmitInfo, SyncPoint,
};

/// Where uploaded bytes land
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferTarget {
    Buffer { buffer: BufferId, offset: u64 },
    /// Whole image, tightly packed rows; left in `final_layout`
    Image { image: ImageId, final_layout: ImageLayout },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Submitted,
    WaitingOnFence,
    Reclaimed,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub submitted: u64,
    pub reclaimed: u64,
    pub bytes: u64,
}

/// Identifies one upload for [`TransferQueue::task_state`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferTicket(u64);

struct DeletionTask {
    ticket: TransferTicket,
    command_buffers: Vec<(u32, CommandBufferId)>,
    // Held only to be dropped, in declaration order, once the fence has signaled
    _staging: OwnedBuffer,
    _semaphore: Option<OwnedSemaphore>,
    fence: OwnedFence,
}

/// Both halves of one upload, recorded but not yet submitted
struct Upload {
    copy: CommandList,
    /// Empty unless ownership moves to `dst_family`
    acquire: CommandList,
    src_family: u32,
    dst_family: u32,
    dst_sync: SyncPoint,
    semaphore: Option<SemaphoreId>,
    fence: FenceId,
}

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<DeletionTask>,
    active: Option<TransferTicket>,
    stop: bool,
    stats: TransferStats,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<TaskQueue>,
    work: Condvar,
    drained: Condvar,
}

type Pools = Arc<Mutex<Vec<(u32, OwnedCommandPool)>>>;

pub struct TransferQueue {
    device: Arc<dyn GpuDevice>,
    pools: Pools,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    next_ticket: AtomicU64,
}

fn pool_for(pools: &[(u32, OwnedCommandPool)], family: u32) -> EngineResult<CommandPoolId> {
    pools
        .iter()
        .find(|(f, _)| *f == family)
        .map(|(_, pool)| pool.id())
        .ok_or(EngineError::UnsupportedQueueFamily(family))
}

impl TransferQueue {
    /// One command pool per queue family and one deletion worker
    pub fn new(device: Arc<dyn GpuDevice>) -> EngineResult<Self> {
        let mut pools = Vec::new();
        for family in device.info().queues.distinct() {
            pools.push((family, OwnedCommandPool::create(&device, family)?));
        }
        let pools: Pools = Arc::new(Mutex::new(pools));
        let shared = Arc::new(Shared::default());

        let worker = {
            let device = Arc::clone(&device);
            let pools = Arc::clone(&pools);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("transfer-reclaim".into())
                .spawn(move || reclaim_loop(device, pools, shared))
                .map_err(|e| GpuError::Backend(format!("spawning reclaim worker: {}", e)))?
        };

        Ok(Self {
            device,
            pools,
            shared,
            worker: Some(worker),
            next_ticket: AtomicU64::new(0),
        })
    }

    /// Upload `data` to `target`, leaving it owned by `dst_family` and visible at
    /// `dst_sync`. Returns `None` without doing anything when `data` is empty.
    pub fn transfer(
        &self,
        data: &[u8],
        target: TransferTarget,
        dst_family: u32,
        dst_sync: SyncPoint,
    ) -> EngineResult<Option<TransferTicket>> {
        if data.is_empty() {
            log::warn!("Transfer requested with no data, ignoring");
            return Ok(None);
        }
        let queues = self.device.info().queues;
        if !queues.contains(dst_family) {
            return Err(EngineError::UnsupportedQueueFamily(dst_family));
        }
        let src_family = queues.transfer;
        let handoff = (dst_family != src_family).then_some(OwnershipTransfer {
            src_family,
            dst_family,
        });

        let staging = OwnedBuffer::create(
            &self.device,
            &BufferDesc {
                label: "transfer staging",
                size: data.len() as u64,
                usage: BufferUsage::TRANSFER_SRC,
                location: MemoryLocation::CpuToGpu,
            },
        )?;
        self.device.write_mapped(staging.id(), 0, data)?;
        let fence = OwnedFence::create(&self.device, false)?;
        let semaphore = match handoff {
            Some(_) => Some(OwnedSemaphore::create(&self.device)?),
            None => None,
        };

        let mut copy = CommandList::new();
        let mut acquire = CommandList::new();
        match target {
            TransferTarget::Buffer { buffer, offset } => {
                copy.copy_buffer(staging.id(), buffer, offset, data.len() as u64);
                let barrier = BufferBarrier {
                    buffer,
                    src: SyncPoint::TRANSFER_WRITE,
                    dst: dst_sync,
                    ownership: handoff,
                };
                copy.buffer_barrier(barrier);
                acquire.buffer_barrier(barrier);
            }
            TransferTarget::Image { image, final_layout } => {
                copy.image_barrier(ImageBarrier {
                    image,
                    src: SyncPoint::TOP,
                    dst: SyncPoint::TRANSFER_WRITE,
                    old_layout: ImageLayout::Undefined,
                    new_layout: ImageLayout::TransferDst,
                    ownership: None,
                })
                .copy_buffer_to_image(staging.id(), image, ImageLayout::TransferDst);
                let barrier = ImageBarrier {
                    image,
                    src: SyncPoint::TRANSFER_WRITE,
                    dst: dst_sync,
                    old_layout: ImageLayout::TransferDst,
                    new_layout: final_layout,
                    ownership: handoff,
                };
                copy.image_barrier(barrier);
                acquire.image_barrier(barrier);
            }
        }

        let mut command_buffers = Vec::with_capacity(2);
        let mut submitted = false;
        let upload = Upload {
            copy,
            acquire,
            src_family,
            dst_family,
            dst_sync,
            semaphore: semaphore.as_ref().map(|s| s.id()),
            fence: fence.id(),
        };
        if let Err(e) = self.submit_upload(upload, &mut command_buffers, &mut submitted) {
            // The copy may still be reading staging memory
            if submitted {
                if let Err(idle) = self.device.wait_idle() {
                    log::error!("Waiting for device idle after a failed upload: {}", idle);
                }
            }
            self.free_command_buffers(&command_buffers);
            return Err(e);
        }

        let ticket = TransferTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed));
        let mut queue = self.shared.queue.lock();
        queue.stats.submitted += 1;
        queue.stats.bytes += data.len() as u64;
        queue.tasks.push_back(DeletionTask {
            ticket,
            command_buffers,
            _staging: staging,
            _semaphore: semaphore,
            fence,
        });
        self.shared.work.notify_one();
        Ok(Some(ticket))
    }

    /// Record both halves of an upload and submit them. Allocated command
    /// buffers land in `command_buffers` even when a later step fails, and
    /// `submitted` is set once the copy is on the queue.
    fn submit_upload(
        &self,
        upload: Upload,
        command_buffers: &mut Vec<(u32, CommandBufferId)>,
        submitted: &mut bool,
    ) -> EngineResult<()> {
        let pools = self.pools.lock();
        let copy_cb = self
            .device
            .allocate_command_buffer(pool_for(&pools, upload.src_family)?)?;
        command_buffers.push((upload.src_family, copy_cb));
        self.device.record(copy_cb, upload.copy)?;

        let Some(semaphore) = upload.semaphore else {
            self.device.submit(
                upload.src_family,
                &[SubmitInfo {
                    command_buffers: vec![copy_cb],
                    ..Default::default()
                }],
                Some(upload.fence),
            )?;
            *submitted = true;
            return Ok(());
        };

        let acquire_cb = self
            .device
            .allocate_command_buffer(pool_for(&pools, upload.dst_family)?)?;
        command_buffers.push((upload.dst_family, acquire_cb));
        self.device.record(acquire_cb, upload.acquire)?;

        self.device.submit(
            upload.src_family,
            &[SubmitInfo {
                command_buffers: vec![copy_cb],
                signals: vec![semaphore],
                ..Default::default()
            }],
            None,
        )?;
        *submitted = true;
        self.device.submit(
            upload.dst_family,
            &[SubmitInfo {
                command_buffers: vec![acquire_cb],
                waits: vec![SemaphoreWait {
                    semaphore,
                    stage: upload.dst_sync.stage,
                }],
                ..Default::default()
            }],
            Some(upload.fence),
        )?;
        Ok(())
    }

    fn free_command_buffers(&self, command_buffers: &[(u32, CommandBufferId)]) {
        let pools = self.pools.lock();
        for (family, command_buffer) in command_buffers {
            match pool_for(&pools, *family) {
                Ok(pool) => self.device.free_command_buffers(pool, &[*command_buffer]),
                Err(e) => log::error!("Freeing transfer command buffer: {}", e),
            }
        }
    }

    /// Block until every submitted upload has been reclaimed
    pub fn wait_empty(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.tasks.is_empty() || queue.active.is_some() {
            self.shared.drained.wait(&mut queue);
        }
    }

    pub fn task_state(&self, ticket: TransferTicket) -> TaskState {
        let queue = self.shared.queue.lock();
        if queue.active == Some(ticket) {
            TaskState::WaitingOnFence
        } else if queue.tasks.iter().any(|task| task.ticket == ticket) {
            TaskState::Submitted
        } else {
            TaskState::Reclaimed
        }
    }

    pub fn stats(&self) -> TransferStats {
        self.shared.queue.lock().stats
    }

    pub fn pending(&self) -> usize {
        let queue = self.shared.queue.lock();
        queue.tasks.len() + usize::from(queue.active.is_some())
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        self.shared.queue.lock().stop = true;
        self.shared.work.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Transfer reclaim worker panicked");
            }
        }
    }
}

fn reclaim_loop(device: Arc<dyn GpuDevice>, pools: Pools, shared: Arc<Shared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    queue.active = Some(task.ticket);
                    break task;
                }
                if queue.stop {
                    return;
                }
                shared.work.wait(&mut queue);
            }
        };

        if let Err(e) = device.wait_fence(task.fence.id(), None) {
            log::error!("Transfer fence wait failed, reclaiming anyway: {}", e);
        }
        {
            let pools = pools.lock();
            for (family, command_buffer) in &task.command_buffers {
                match pool_for(&pools, *family) {
                    Ok(pool) => device.free_command_buffers(pool, &[*command_buffer]),
                    Err(e) => log::error!("Freeing transfer command buffer: {}", e),
                }
            }
        }
        let ticket = task.ticket;
        drop(task);
        log::debug!("Reclaimed transfer task {:?}", ticket);

        let mut queue = shared.queue.lock();
        queue.active = None;
        queue.stats.reclaimed += 1;
        shared.drained.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::software::{SoftwareConfig, SoftwareDevice};
    use crate::hal::{ImageDesc, ImageFormat, ImageUsage, OwnedImage};

    fn setup(config: SoftwareConfig) -> (Arc<SoftwareDevice>, Arc<dyn GpuDevice>, TransferQueue) {
        let software = Arc::new(SoftwareDevice::new(config));
        let device: Arc<dyn GpuDevice> = software.clone();
        let queue = TransferQueue::new(Arc::clone(&device)).unwrap();
        (software, device, queue)
    }

    fn readable(device: &Arc<dyn GpuDevice>, size: u64) -> OwnedBuffer {
        OwnedBuffer::create(
            device,
            &BufferDesc {
                label: "destination",
                size,
                usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
                location: MemoryLocation::GpuToCpu,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_zero_size_is_noop() {
        let (software, device, queue) = setup(SoftwareConfig::default());
        let dst = readable(&device, 16);
        let compute = device.info().queues.compute;
        let ticket = queue
            .transfer(&[], TransferTarget::Buffer { buffer: dst.id(), offset: 0 }, compute, SyncPoint::COMPUTE_READ)
            .unwrap();
        assert_eq!(ticket, None);
        assert!(software.submissions().is_empty());
        assert_eq!(queue.stats(), TransferStats::default());
    }

    #[test]
    fn test_unknown_family_fails_fast() {
        let (_software, device, queue) = setup(SoftwareConfig::default());
        let dst = readable(&device, 16);
        let err = queue
            .transfer(&[1, 2, 3, 4], TransferTarget::Buffer { buffer: dst.id(), offset: 0 }, 7, SyncPoint::ALL)
            .unwrap_err();
        assert_eq!(err, EngineError::UnsupportedQueueFamily(7));
    }

    #[test]
    fn test_cross_family_upload_hands_over_ownership() {
        let (software, device, queue) = setup(SoftwareConfig {
            async_compute: true,
            ..Default::default()
        });
        let families = device.info().queues;
        let dst = readable(&device, 8);
        let ticket = queue
            .transfer(
                &[1, 2, 3, 4, 5, 6, 7, 8],
                TransferTarget::Buffer { buffer: dst.id(), offset: 0 },
                families.compute,
                SyncPoint::COMPUTE_READ,
            )
            .unwrap()
            .unwrap();
        queue.wait_empty();
        assert_eq!(queue.task_state(ticket), TaskState::Reclaimed);

        let log = software.submissions();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].family, families.transfer);
        assert_eq!(log[0].signals.len(), 1);
        assert_eq!(log[1].family, families.compute);
        assert_eq!(log[1].waits, log[0].signals);
        assert!(log[1].fence.is_some());

        assert_eq!(software.buffer_owner(dst.id()), Some(families.compute));
        let mut out = [0u8; 8];
        device.read_mapped(dst.id(), 0, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);

        // Only the destination survives reclamation
        assert_eq!(software.live_buffers(), 1);
        assert_eq!(software.live_semaphores(), 0);
        assert_eq!(software.live_command_buffers(), 0);
    }

    #[test]
    fn test_failed_acquire_releases_upload_resources() {
        let mut config = SoftwareConfig {
            async_compute: true,
            ..Default::default()
        };
        let families = config.queue_families();
        config.failing_family = Some(families.compute);
        let (software, device, queue) = setup(config);
        let dst = readable(&device, 4);
        let err = queue
            .transfer(
                &[1, 2, 3, 4],
                TransferTarget::Buffer { buffer: dst.id(), offset: 0 },
                families.compute,
                SyncPoint::COMPUTE_READ,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Gpu(GpuError::Backend(_))), "{:?}", err);

        // The copy went out before the acquire was rejected
        let log = software.submissions();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].family, families.transfer);

        assert_eq!(queue.pending(), 0);
        assert_eq!(software.live_buffers(), 1);
        assert_eq!(software.live_semaphores(), 0);
        assert_eq!(software.live_command_buffers(), 0);
    }

    #[test]
    fn test_same_family_upload_needs_no_semaphore() {
        let (software, device, queue) = setup(SoftwareConfig {
            dedicated_transfer: false,
            ..Default::default()
        });
        let dst = readable(&device, 4);
        queue
            .transfer(
                &[9, 9, 9, 9],
                TransferTarget::Buffer { buffer: dst.id(), offset: 0 },
                device.info().queues.compute,
                SyncPoint::COMPUTE_READ,
            )
            .unwrap();
        queue.wait_empty();
        let log = software.submissions();
        assert_eq!(log.len(), 1);
        assert!(log[0].signals.is_empty() && log[0].waits.is_empty());
    }

    #[test]
    fn test_image_upload_ends_in_requested_layout() {
        let (software, device, queue) = setup(SoftwareConfig::default());
        let image = OwnedImage::create(
            &device,
            &ImageDesc {
                label: "texture",
                width: 2,
                height: 2,
                format: ImageFormat::Rgba8Unorm,
                usage: ImageUsage::TRANSFER_DST | ImageUsage::STORAGE,
            },
        )
        .unwrap();
        queue
            .transfer(
                &[255u8; 16],
                TransferTarget::Image {
                    image: image.id(),
                    final_layout: ImageLayout::General,
                },
                device.info().queues.compute,
                SyncPoint::COMPUTE_READ,
            )
            .unwrap();
        queue.wait_empty();
        assert_eq!(device.image_layout(image.id()), Some(ImageLayout::General));
        assert_eq!(software.image_owner(image.id()), Some(device.info().queues.compute));
    }

    #[test]
    fn test_wait_empty_drains_every_task() {
        let (software, device, queue) = setup(SoftwareConfig::default());
        let dst = readable(&device, 64);
        let transfer = device.info().queues.transfer;
        for i in 0..8u64 {
            // Every upload targets the transfer family so repeated writes stay legal
            queue
                .transfer(
                    &[i as u8; 8],
                    TransferTarget::Buffer {
                        buffer: dst.id(),
                        offset: i * 8,
                    },
                    transfer,
                    SyncPoint::TRANSFER_READ,
                )
                .unwrap();
        }
        queue.wait_empty();
        assert_eq!(queue.pending(), 0);
        let stats = queue.stats();
        assert_eq!((stats.submitted, stats.reclaimed, stats.bytes), (8, 8, 64));
        assert_eq!(software.live_buffers(), 1);
    }

    #[test]
    fn test_drop_reclaims_outstanding_tasks() {
        let (software, device, queue) = setup(SoftwareConfig::default());
        let dst = readable(&device, 4);
        queue
            .transfer(
                &[1, 1, 1, 1],
                TransferTarget::Buffer { buffer: dst.id(), offset: 0 },
                device.info().queues.compute,
                SyncPoint::COMPUTE_READ,
            )
            .unwrap();
        drop(queue);
        assert_eq!(software.live_buffers(), 1);
        assert_eq!(software.live_command_buffers(), 0);
    }

    #[test]
    fn test_allocation_failure_surfaces() {
        let (_software, device, queue) = setup(SoftwareConfig {
            memory_limit: Some(8),
            ..Default::default()
        });
        let dst = readable(&device, 8);
        let err = queue
            .transfer(
                &[0; 8],
                TransferTarget::Buffer { buffer: dst.id(), offset: 0 },
                device.info().queues.compute,
                SyncPoint::COMPUTE_READ,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Gpu(GpuError::OutOfMemory { .. })));
    }
}
