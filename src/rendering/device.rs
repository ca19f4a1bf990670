use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DescriptorKind {
    UniformBuffer,
    CombinedImageSampler,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorPoolSizes {
    pub sets: u32,
    pub uniform_buffers: u32,
    pub combined_image_samplers: u32,
}

impl DescriptorPoolSizes {
    pub fn covers(&self, other: &DescriptorPoolSizes) -> bool {
        self.sets >= other.sets
            && self.uniform_buffers >= other.uniform_buffers
            && self.combined_image_samplers >= other.combined_image_samplers
    }

    pub fn max(&self, other: &DescriptorPoolSizes) -> DescriptorPoolSizes {
        DescriptorPoolSizes {
            sets: self.sets.max(other.sets),
            uniform_buffers: self.uniform_buffers.max(other.uniform_buffers),
            combined_image_samplers: self.combined_image_samplers.max(other.combined_image_samplers),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CopyCommand {
    UploadBuffer { target: BufferHandle, bytes: usize },
    UploadImage { target: ImageHandle, bytes: usize },
}

/// The graphics API the compile pipeline drives. Allocation happens up front
/// (reservation), uploads are recorded and submitted asynchronously, and
/// [`GpuDevice::wait`] blocks in device order.
pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, bytes: usize) -> Result<BufferHandle, anyhow::Error>;

    fn create_image(&self, width: u32, height: u32, bytes: usize) -> Result<ImageHandle, anyhow::Error>;

    fn create_descriptor_pool(&self, sizes: &DescriptorPoolSizes) -> Result<DescriptorPoolHandle, anyhow::Error>;

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        kind: DescriptorKind,
    ) -> Result<DescriptorSetHandle, anyhow::Error>;

    /// Queues the recorded copies; returns without waiting for them.
    fn submit(&self, commands: Vec<CopyCommand>) -> Result<SubmissionHandle, anyhow::Error>;

    /// Blocks the calling thread until the submission has completed.
    fn wait(&self, submission: SubmissionHandle) -> Result<(), anyhow::Error>;
}

struct PoolState {
    remaining_sets: u32,
    remaining_uniform_buffers: u32,
    remaining_combined_image_samplers: u32,
}

/// Bookkeeping-only [`GpuDevice`] used by the demo driver and the tests. Waits
/// can be given a simulated duration so overlap between in-flight submissions
/// is observable, and pool creation / submission failures can be injected.
pub struct SoftwareDevice {
    next_handle: AtomicU64,
    work_duration: Duration,
    pools: Mutex<HashMap<u64, PoolState>>,
    submissions: Mutex<HashMap<u64, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    buffers_created: AtomicUsize,
    images_created: AtomicUsize,
    sets_allocated: AtomicUsize,
    bytes_uploaded: AtomicUsize,
    fail_pool_creation: AtomicBool,
    fail_submission: AtomicBool,
}

impl SoftwareDevice {
    pub fn new() -> Self {
        Self::with_work_duration(Duration::ZERO)
    }

    pub fn with_work_duration(work_duration: Duration) -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            work_duration,
            pools: Mutex::new(HashMap::new()),
            submissions: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            buffers_created: AtomicUsize::new(0),
            images_created: AtomicUsize::new(0),
            sets_allocated: AtomicUsize::new(0),
            bytes_uploaded: AtomicUsize::new(0),
            fail_pool_creation: AtomicBool::new(false),
            fail_submission: AtomicBool::new(false),
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    /// Highest number of submissions that were in flight at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::SeqCst)
    }

    pub fn images_created(&self) -> usize {
        self.images_created.load(Ordering::SeqCst)
    }

    pub fn sets_allocated(&self) -> usize {
        self.sets_allocated.load(Ordering::SeqCst)
    }

    pub fn bytes_uploaded(&self) -> usize {
        self.bytes_uploaded.load(Ordering::SeqCst)
    }

    pub fn inject_pool_failure(&self, fail: bool) {
        self.fail_pool_creation.store(fail, Ordering::SeqCst);
    }

    pub fn inject_submission_failure(&self, fail: bool) {
        self.fail_submission.store(fail, Ordering::SeqCst);
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for SoftwareDevice {
    fn create_buffer(&self, _bytes: usize) -> Result<BufferHandle, anyhow::Error> {
        self.buffers_created.fetch_add(1, Ordering::SeqCst);
        Ok(BufferHandle(self.next_handle()))
    }

    fn create_image(&self, _width: u32, _height: u32, _bytes: usize) -> Result<ImageHandle, anyhow::Error> {
        self.images_created.fetch_add(1, Ordering::SeqCst);
        Ok(ImageHandle(self.next_handle()))
    }

    fn create_descriptor_pool(&self, sizes: &DescriptorPoolSizes) -> Result<DescriptorPoolHandle, anyhow::Error> {
        if self.fail_pool_creation.load(Ordering::SeqCst) {
            bail!("out of device memory for a descriptor pool of {} sets", sizes.sets);
        }
        if sizes.sets == 0 {
            bail!("refusing to create an empty descriptor pool");
        }

        let handle = self.next_handle();
        self.pools.lock().expect("device pools lock").insert(
            handle,
            PoolState {
                remaining_sets: sizes.sets,
                remaining_uniform_buffers: sizes.uniform_buffers,
                remaining_combined_image_samplers: sizes.combined_image_samplers,
            },
        );
        Ok(DescriptorPoolHandle(handle))
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        kind: DescriptorKind,
    ) -> Result<DescriptorSetHandle, anyhow::Error> {
        let mut pools = self.pools.lock().expect("device pools lock");
        let state = pools
            .get_mut(&pool.0)
            .ok_or_else(|| anyhow!("unknown descriptor pool {:?}", pool))?;

        if state.remaining_sets == 0 {
            bail!("descriptor pool {:?} is out of sets", pool);
        }
        let remaining = match kind {
            DescriptorKind::UniformBuffer => &mut state.remaining_uniform_buffers,
            DescriptorKind::CombinedImageSampler => &mut state.remaining_combined_image_samplers,
        };
        if *remaining == 0 {
            bail!("descriptor pool {:?} is out of {:?} descriptors", pool, kind);
        }
        *remaining -= 1;
        state.remaining_sets -= 1;
        drop(pools);

        self.sets_allocated.fetch_add(1, Ordering::SeqCst);
        Ok(DescriptorSetHandle(self.next_handle()))
    }

    fn submit(&self, commands: Vec<CopyCommand>) -> Result<SubmissionHandle, anyhow::Error> {
        if self.fail_submission.load(Ordering::SeqCst) {
            bail!("device lost during submission");
        }

        let bytes: usize = commands
            .iter()
            .map(|command| match command {
                CopyCommand::UploadBuffer { bytes, .. } => *bytes,
                CopyCommand::UploadImage { bytes, .. } => *bytes,
            })
            .sum();
        self.bytes_uploaded.fetch_add(bytes, Ordering::SeqCst);

        let handle = self.next_handle();
        self.submissions
            .lock()
            .expect("device submissions lock")
            .insert(handle, commands.len());

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        Ok(SubmissionHandle(handle))
    }

    fn wait(&self, submission: SubmissionHandle) -> Result<(), anyhow::Error> {
        self.submissions
            .lock()
            .expect("device submissions lock")
            .remove(&submission.0)
            .ok_or_else(|| anyhow!("wait on unknown submission {:?}", submission))?;

        if !self.work_duration.is_zero() {
            std::thread::sleep(self.work_duration);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_pool_exhaustion_is_an_error() {
        let device = SoftwareDevice::new();
        let pool = device
            .create_descriptor_pool(&DescriptorPoolSizes {
                sets: 1,
                uniform_buffers: 1,
                combined_image_samplers: 0,
            })
            .expect("pool creation");

        device
            .allocate_descriptor_set(pool, DescriptorKind::UniformBuffer)
            .expect("first allocation fits");
        assert!(device.allocate_descriptor_set(pool, DescriptorKind::UniformBuffer).is_err());
    }

    #[test]
    fn waits_retire_submissions() {
        let device = SoftwareDevice::new();
        let submission = device
            .submit(vec![CopyCommand::UploadBuffer {
                target: BufferHandle(1),
                bytes: 64,
            }])
            .expect("submission");

        device.wait(submission).expect("wait");
        assert_eq!(device.peak_in_flight(), 1);
        assert_eq!(device.bytes_uploaded(), 64);
        assert!(device.wait(submission).is_err(), "double wait is a caller bug");
    }

    #[test]
    fn injected_pool_failure_is_recoverable() {
        let device = SoftwareDevice::new();
        device.inject_pool_failure(true);
        assert!(
            device
                .create_descriptor_pool(&DescriptorPoolSizes {
                    sets: 4,
                    uniform_buffers: 4,
                    combined_image_samplers: 0,
                })
                .is_err()
        );

        device.inject_pool_failure(false);
        assert!(
            device
                .create_descriptor_pool(&DescriptorPoolSizes {
                    sets: 4,
                    uniform_buffers: 4,
                    combined_image_samplers: 0,
                })
                .is_ok()
        );
    }
}
