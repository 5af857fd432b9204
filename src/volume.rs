//! The Volume data model: device array, superblock info, state flags and
//! format profile.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::hal::DeviceHandle;
use crate::qmask::QMask;

/// Upper bound on the number of devices in an array.
pub const MAX_DEVICES: usize = 16;

/// On-disk magic numbers, named per `spec.md` §6 rather than left as inline
/// literals.
pub mod magic {
    /// Generic FS-block header magic, stamped at the start of any Flux/
    /// Horizon data block that carries a verifiable header+CRC (distinct
    /// from the Cortex anchor, which has no magic of its own — it is
    /// identified positionally by its slot, not by a tag in the block).
    pub const BLOCK: u32 = 0x484E_3442; // "HN4B"
    /// Superblock magic, for the primary copy at sector 0.
    pub const SB: u32 = 0x484E_3453; // "HN4S"
    /// Superblock magic for the trailing mirror copy.
    pub const TAIL: u32 = 0x484E_3454; // "HN4T"
    /// RAM-resident ("nano") Cortex image magic.
    pub const NANO: u32 = 0x484E_344E; // "HN4N"
}

/// Offset of the CRC32C field within a generic FS block stamped with
/// [`magic::BLOCK`]: `magic:u32` at offset 0, `header_crc:u32` at offset 4,
/// covering everything from offset 8 onward.
pub const BLOCK_HEADER_CRC_OFFSET: usize = 4;
pub const BLOCK_HEADER_PAYLOAD_START: usize = 8;

/// Online/offline status of one array member. Transitions are monotonic:
/// once `Offline`, a device never returns to `Online` without external
/// intervention (out of scope for this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceStatus {
    Online = 1,
    Offline = 0,
}

/// One member of a multi-device array.
#[derive(Debug)]
pub struct DeviceEntry {
    pub handle: DeviceHandle,
    status: AtomicU8,
}

impl DeviceEntry {
    pub fn new(handle: DeviceHandle) -> Self {
        Self {
            handle,
            status: AtomicU8::new(DeviceStatus::Online as u8),
        }
    }

    pub fn status(&self) -> DeviceStatus {
        match self.status.load(Ordering::Acquire) {
            1 => DeviceStatus::Online,
            _ => DeviceStatus::Offline,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status() == DeviceStatus::Online
    }

    /// Mark this device offline. Monotonic: marking an already-offline
    /// device offline again is a silent no-op, never a resurrection.
    pub fn mark_offline(&self) {
        self.status
            .store(DeviceStatus::Offline as u8, Ordering::Release);
    }
}

impl Clone for DeviceEntry {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle,
            status: AtomicU8::new(self.status.load(Ordering::Acquire)),
        }
    }
}

/// How the array's devices are combined into one logical volume address
/// space. A closed set, encoded as a tagged variant rather than a dispatch
/// table, since new array modes aren't added without touching the router
/// anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayMode {
    Mirror,
    Shard,
    Parity,
}

/// Volume-wide state flags, OR-combined.
pub mod state_flags {
    pub const DEGRADED: u32 = 1 << 0;
    pub const DIRTY: u32 = 1 << 1;
    pub const CLEAN: u32 = 1 << 2;
    pub const PANIC: u32 = 1 << 3;
}

/// Format profile, affects router retry/placement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatProfile {
    HyperCloud,
    Generic,
    Archive,
    Usb,
}

/// Device type/media tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Ssd,
    Nvm,
    Hdd,
    Zns,
    Usb,
    Tape,
}

/// Superblock-resident geometry and identity.
#[derive(Debug, Clone, Copy)]
pub struct SuperblockInfo {
    pub uuid: u128,
    pub block_size: u32,
    pub sector_size: u32,
    pub capacity_sectors: u128,
    pub epoch_id: u64,
    pub lba_epoch_start: u64,
    pub lba_cortex_start: u64,
    pub lba_bitmap_start: u64,
    pub lba_qmask_start: u64,
    pub lba_flux_start: u64,
    pub lba_horizon_start: u64,
    pub device_sectors: u64,
}

/// The snapshot of array topology the router copies out from under the
/// spinlock: device count, mode, and per-device
/// entries, taken as a stack-local value so routing logic never holds the
/// lock while it issues I/O.
#[derive(Clone)]
pub struct ArrayTopologySnapshot {
    pub mode: ArrayMode,
    pub devices: Vec<DeviceEntry>,
}

/// A mounted HN4 volume: the array, its protecting lock, superblock info,
/// state flags, Q-Mask and health counters.
pub struct Volume {
    pub info: SuperblockInfo,
    pub media: MediaKind,
    pub profile: FormatProfile,
    pub read_only: bool,
    state_flags: AtomicU32,
    /// Protects `mode`/`devices` mutation; routing only ever holds this
    /// long enough to clone a [`ArrayTopologySnapshot`].
    array: Mutex<ArrayTopologyInner>,
    pub quality_mask: Option<QMask>,
    pub heal_count: std::sync::atomic::AtomicU64,
    pub toxic_blocks: std::sync::atomic::AtomicU64,
    /// RAM-resident copy of the Cortex region, when the mount chose to keep
    /// one. Guarded separately from `array` so slot reads/writes don't
    /// contend with topology changes.
    nano_cortex: Option<Mutex<Vec<u8>>>,
}

struct ArrayTopologyInner {
    mode: ArrayMode,
    devices: Vec<DeviceEntry>,
}

impl Volume {
    pub fn new(
        info: SuperblockInfo,
        media: MediaKind,
        profile: FormatProfile,
        mode: ArrayMode,
        devices: Vec<DeviceEntry>,
        read_only: bool,
    ) -> Self {
        assert!(devices.len() <= MAX_DEVICES);
        let block_count = info.capacity_sectors.min(u64::MAX as u128) as u64;
        Self {
            info,
            media,
            profile,
            read_only,
            state_flags: AtomicU32::new(state_flags::CLEAN),
            array: Mutex::new(ArrayTopologyInner { mode, devices }),
            quality_mask: Some(QMask::new(block_count.max(1))),
            heal_count: std::sync::atomic::AtomicU64::new(0),
            toxic_blocks: std::sync::atomic::AtomicU64::new(0),
            nano_cortex: None,
        }
    }

    /// Attach a RAM-resident Cortex image, sized in bytes.
    pub fn with_nano_cortex(mut self, bytes: Vec<u8>) -> Self {
        self.nano_cortex = Some(Mutex::new(bytes));
        self
    }

    /// Drop the Q-Mask entirely, as a read-only artifact mounted without one
    /// would: [`crate::automedic::repair_block`] skips quality-state updates
    /// when this is `None`.
    pub fn without_quality_mask(mut self) -> Self {
        self.quality_mask = None;
        self
    }

    /// True if this volume keeps a RAM-resident Cortex copy.
    pub fn has_nano_cortex(&self) -> bool {
        self.nano_cortex.is_some()
    }

    /// Run `f` with exclusive access to the RAM-resident Cortex bytes.
    /// Returns `None` if the volume has no RAM-resident copy.
    pub fn with_nano_cortex_slot<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.nano_cortex.as_ref().map(|m| {
            let mut guard = m.lock();
            f(&mut guard)
        })
    }

    /// Snapshot the array topology under the spinlock, then release it
    /// immediately. Callers issue I/O only against the
    /// returned snapshot.
    pub fn snapshot_topology(&self) -> ArrayTopologySnapshot {
        let guard = self.array.lock();
        let snapshot = ArrayTopologySnapshot {
            mode: guard.mode,
            devices: guard.devices.iter().map(|d| d.clone()).collect(),
        };
        drop(guard);
        // Sequentially-consistent fence: subsequent atomic observations of
        // device state are at least as fresh as this snapshot.
        std::sync::atomic::fence(Ordering::SeqCst);
        snapshot
    }

    /// Mark the device at `idx` (within the live array, not a snapshot)
    /// offline and OR the given flags into the volume's state.
    pub fn mark_device_offline_and_flag(&self, idx: usize, flags: u32) {
        let guard = self.array.lock();
        if let Some(dev) = guard.devices.get(idx) {
            dev.mark_offline();
        }
        drop(guard);
        self.state_flags.fetch_or(flags, Ordering::Release);
    }

    pub fn state_flags(&self) -> u32 {
        self.state_flags.load(Ordering::Acquire)
    }

    pub fn set_state_flags(&self, flags: u32) {
        self.state_flags.fetch_or(flags, Ordering::Release);
    }

    pub fn device_count(&self) -> usize {
        self.array.lock().devices.len()
    }
}
