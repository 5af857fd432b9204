//! The Hardware Abstraction Layer surface the core consumes. HN4 core never implements a HAL itself — mount/unmount, concrete
//! synchronous I/O, timekeeping and allocation are a higher layer's job. This
//! module only defines the trait boundary and the small set of value types
//! that cross it.

use crate::error::HnResult;

/// A device handle opaque to the core; the HAL decides what it means
/// (file descriptor, NVMe namespace, etc).
pub type DeviceHandle = u64;

/// Operations the router and the write paths can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalOp {
    Read,
    Write,
    Flush,
    Discard,
    ZoneAppend,
}

/// Hardware capability bits reported by [`Hal::get_caps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwFlags {
    pub rotational: bool,
    pub zns_native: bool,
    pub nvm: bool,
}

/// Static capabilities of one device in the array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    pub logical_block_size: u32,
    pub total_capacity_bytes: u128,
    pub zone_size_bytes: u64,
    pub hw_flags: HwFlags,
}

/// The HAL surface consumed by the core. Every method may
/// block the calling thread; none of them are async suspension points in the
/// usual sense; callers that need concurrency run this trait behind their
/// own thread pool.
pub trait Hal: Send + Sync {
    /// Synchronous block I/O. `lba` is in sectors; `n_sectors` is the
    /// transfer length. `buf` holds write data going in, read data coming
    /// back.
    fn sync_io(
        &self,
        device: DeviceHandle,
        op: HalOp,
        lba: u64,
        buf: &mut [u8],
        n_sectors: u32,
    ) -> HnResult<()>;

    /// Flush a device's write cache / commit a write barrier.
    fn barrier(&self, device: DeviceHandle) -> HnResult<()>;

    /// Static capability query.
    fn get_caps(&self, device: DeviceHandle) -> HnResult<DeviceCaps>;

    /// Issue a read-ahead hint; best-effort, errors are ignored by callers.
    fn prefetch(&self, device: DeviceHandle, lba: u64, n_sectors: u32);

    /// Monotonic wall-clock time in nanoseconds.
    fn get_time_ns(&self) -> u64;

    /// Yield the calling thread for approximately `micros` microseconds.
    fn micro_sleep(&self, micros: u64);
}
