//! An in-memory [`Hal`] used only by this crate's own unit tests, keeping
//! test fixtures colocated with the code they exercise rather than in a
//! separate harness crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{HnError, HnResult};
use crate::hal::{DeviceCaps, DeviceHandle, Hal, HalOp, HwFlags};

struct MockDevice {
    bytes: Vec<u8>,
    caps: DeviceCaps,
    fail_next_write: Option<HnError>,
    fail_next_read: Option<HnError>,
}

/// A fixed sector size used by every mock device; real geometry is exercised
/// through `DeviceCaps`, not through this constant.
const SECTOR_SIZE: u64 = 512;

pub struct MockHal {
    devices: Mutex<HashMap<DeviceHandle, MockDevice>>,
    clock: AtomicU64,
    prefetch_calls: Mutex<Vec<(DeviceHandle, u64, u32)>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(1),
            prefetch_calls: Mutex::new(Vec::new()),
        }
    }

    /// The `(lba, n_sectors)` arguments of every `prefetch` call issued
    /// against `handle`, in order.
    pub fn prefetch_calls(&self, handle: DeviceHandle) -> Vec<(u64, u32)> {
        self.prefetch_calls
            .lock()
            .iter()
            .filter(|(h, _, _)| *h == handle)
            .map(|(_, lba, n)| (*lba, *n))
            .collect()
    }

    pub fn add_device(&self, handle: DeviceHandle, capacity_bytes: u128, hw_flags: HwFlags) {
        let mut guard = self.devices.lock();
        guard.insert(
            handle,
            MockDevice {
                bytes: vec![0u8; capacity_bytes as usize],
                caps: DeviceCaps {
                    logical_block_size: SECTOR_SIZE as u32,
                    total_capacity_bytes: capacity_bytes,
                    zone_size_bytes: 0,
                    hw_flags,
                },
                fail_next_write: None,
                fail_next_read: None,
            },
        );
    }

    pub fn set_zone_size(&self, handle: DeviceHandle, zone_size_bytes: u64) {
        let mut guard = self.devices.lock();
        if let Some(d) = guard.get_mut(&handle) {
            d.caps.zone_size_bytes = zone_size_bytes;
        }
    }

    pub fn write_raw(&self, handle: DeviceHandle, lba: u64, data: &[u8]) {
        let mut guard = self.devices.lock();
        let dev = guard.get_mut(&handle).expect("unknown mock device");
        let off = (lba * SECTOR_SIZE) as usize;
        dev.bytes[off..off + data.len()].copy_from_slice(data);
    }

    pub fn was_written(&self, handle: DeviceHandle, lba: u64) -> bool {
        let guard = self.devices.lock();
        let dev = match guard.get(&handle) {
            Some(d) => d,
            None => return false,
        };
        let off = (lba * SECTOR_SIZE) as usize;
        dev.bytes[off..].iter().take(SECTOR_SIZE as usize).any(|&b| b != 0)
    }

    pub fn fail_next_write(&self, handle: DeviceHandle, err: HnError) {
        let mut guard = self.devices.lock();
        if let Some(d) = guard.get_mut(&handle) {
            d.fail_next_write = Some(err);
        }
    }

    pub fn fail_next_read(&self, handle: DeviceHandle, err: HnError) {
        let mut guard = self.devices.lock();
        if let Some(d) = guard.get_mut(&handle) {
            d.fail_next_read = Some(err);
        }
    }
}

/// Initialize `env_logger` so `RUST_LOG=debug cargo test -- --nocapture`
/// surfaces the `log` records this crate emits (e.g. `addr.rs`'s overflow
/// log, `router.rs`'s mirror-failure warning). Safe to call from multiple
/// tests; only the first call installs the logger.
pub fn init_test_logging() {
    let _ = env_logger::try_init();
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl Hal for MockHal {
    fn sync_io(
        &self,
        device: DeviceHandle,
        op: HalOp,
        lba: u64,
        buf: &mut [u8],
        n_sectors: u32,
    ) -> HnResult<()> {
        let mut guard = self.devices.lock();
        let dev = guard.get_mut(&device).ok_or(HnError::HwIo)?;
        let off = (lba * SECTOR_SIZE) as usize;
        let len = (n_sectors as u64 * SECTOR_SIZE) as usize;

        if off + len > dev.bytes.len() {
            return Err(HnError::Geometry);
        }

        match op {
            HalOp::Read => {
                if let Some(e) = dev.fail_next_read.take() {
                    return Err(e);
                }
                let n = buf.len().min(len);
                buf[..n].copy_from_slice(&dev.bytes[off..off + n]);
                Ok(())
            }
            HalOp::Write | HalOp::ZoneAppend => {
                if let Some(e) = dev.fail_next_write.take() {
                    return Err(e);
                }
                let n = buf.len().min(len);
                dev.bytes[off..off + n].copy_from_slice(&buf[..n]);
                Ok(())
            }
            HalOp::Flush | HalOp::Discard => Ok(()),
        }
    }

    fn barrier(&self, device: DeviceHandle) -> HnResult<()> {
        let guard = self.devices.lock();
        guard.get(&device).ok_or(HnError::HwIo).map(|_| ())
    }

    fn get_caps(&self, device: DeviceHandle) -> HnResult<DeviceCaps> {
        let guard = self.devices.lock();
        guard.get(&device).map(|d| d.caps).ok_or(HnError::HwIo)
    }

    fn prefetch(&self, device: DeviceHandle, lba: u64, n_sectors: u32) {
        self.prefetch_calls.lock().push((device, lba, n_sectors));
    }

    fn get_time_ns(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn micro_sleep(&self, _micros: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let hal = MockHal::new();
        hal.add_device(1, 4096, HwFlags::default());
        let mut wbuf = vec![0xAAu8; 512];
        hal.sync_io(1, HalOp::Write, 0, &mut wbuf, 1).unwrap();
        let mut rbuf = vec![0u8; 512];
        hal.sync_io(1, HalOp::Read, 0, &mut rbuf, 1).unwrap();
        assert_eq!(wbuf, rbuf);
    }

    #[test]
    fn out_of_bounds_is_geometry_error() {
        let hal = MockHal::new();
        hal.add_device(1, 1024, HwFlags::default());
        let mut buf = vec![0u8; 512];
        let result = hal.sync_io(1, HalOp::Read, 10, &mut buf, 1);
        assert_eq!(result, Err(HnError::Geometry));
    }
}
