//! The Cortex: an open-addressed, CRC-verified, generation-aware metadata
//! table keyed by 128-bit object identities.

use crate::endian::{
    crc32c_one_shot, load_le128, load_le32, load_le64, store_le128, store_le32, store_le64,
};
use crate::error::{HnError, HnResult};
use crate::hal::{DeviceHandle, Hal, HalOp};
use crate::ids::{murmur3_fmix64, ObjectId};
use crate::volume::Volume;

/// Fixed on-disk size of one anchor slot, in bytes.
pub const ANCHOR_SIZE: usize = 128;

/// Bounded probe cap, preventing unbounded scans on a degenerate table.
pub const MAX_PROBES: u32 = 1024;

pub mod data_class {
    pub const VALID: u64 = 1 << 0;
    pub const TOMBSTONE: u64 = 1 << 1;
    pub const EXTENDED: u64 = 1 << 2;
    pub const NANO: u64 = 1 << 3;
}

const OFF_SEED_ID: usize = 0;
pub(crate) const OFF_DATA_CLASS: usize = 16;
const OFF_WRITE_GEN: usize = 24;
const OFF_TAG_FILTER: usize = 28;
const OFF_CREATE_CLOCK: usize = 36;
const OFF_MOD_CLOCK: usize = 40;
const OFF_ORBIT_VECTOR: usize = 48;
const OFF_INLINE_BUFFER: usize = 54;
const OFF_CHECKSUM: usize = 78;

/// One Cortex entry, decoded from its fixed-size on-disk slot
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Anchor {
    pub seed_id: ObjectId,
    pub data_class: u64,
    pub write_gen: u32,
    pub tag_filter: u64,
    pub create_clock: u32,
    pub mod_clock: u64,
    pub orbit_vector: [u8; 6],
    pub inline_buffer: [u8; 24],
    pub checksum: u32,
}

impl Anchor {
    pub fn is_valid(&self) -> bool {
        self.data_class & data_class::VALID != 0
    }

    pub fn is_tombstone(&self) -> bool {
        self.data_class & data_class::TOMBSTONE != 0
    }

    pub fn is_extended(&self) -> bool {
        self.data_class & data_class::EXTENDED != 0
    }

    /// An empty wall slot: all-zero id and `data_class==0`, the sentinel
    /// that terminates an open-addressed probe chain.
    pub fn is_wall(bytes: &[u8]) -> bool {
        load_le128(bytes, OFF_SEED_ID) == 0 && load_le64(bytes, OFF_DATA_CLASS) == 0
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            seed_id: ObjectId::from_le_bytes(
                &bytes[OFF_SEED_ID..OFF_SEED_ID + 16].try_into().unwrap(),
            ),
            data_class: load_le64(bytes, OFF_DATA_CLASS),
            write_gen: load_le32(bytes, OFF_WRITE_GEN),
            tag_filter: load_le64(bytes, OFF_TAG_FILTER),
            create_clock: load_le32(bytes, OFF_CREATE_CLOCK),
            mod_clock: load_le64(bytes, OFF_MOD_CLOCK),
            orbit_vector: bytes[OFF_ORBIT_VECTOR..OFF_ORBIT_VECTOR + 6]
                .try_into()
                .unwrap(),
            inline_buffer: bytes[OFF_INLINE_BUFFER..OFF_INLINE_BUFFER + 24]
                .try_into()
                .unwrap(),
            checksum: load_le32(bytes, OFF_CHECKSUM),
        }
    }

    pub fn encode(&self, out: &mut [u8; ANCHOR_SIZE]) {
        for b in out.iter_mut() {
            *b = 0;
        }
        out[OFF_SEED_ID..OFF_SEED_ID + 16].copy_from_slice(&self.seed_id.to_le_bytes());
        store_le64(out, OFF_DATA_CLASS, self.data_class);
        store_le32(out, OFF_WRITE_GEN, self.write_gen);
        store_le64(out, OFF_TAG_FILTER, self.tag_filter);
        store_le32(out, OFF_CREATE_CLOCK, self.create_clock);
        store_le64(out, OFF_MOD_CLOCK, self.mod_clock);
        out[OFF_ORBIT_VECTOR..OFF_ORBIT_VECTOR + 6].copy_from_slice(&self.orbit_vector);
        out[OFF_INLINE_BUFFER..OFF_INLINE_BUFFER + 24].copy_from_slice(&self.inline_buffer);
        store_le32(out, OFF_CHECKSUM, self.checksum);
    }

    /// Recompute the anchor checksum, covering the anchor with the
    /// checksum field itself zeroed.
    pub fn recompute_checksum(&mut self) {
        let mut buf = [0u8; ANCHOR_SIZE];
        self.checksum = 0;
        self.encode(&mut buf);
        self.checksum = crc32c_one_shot(&buf[..OFF_CHECKSUM]);
    }

    pub(crate) fn checksum_matches(bytes: &[u8]) -> bool {
        let mut local = bytes[..ANCHOR_SIZE].to_vec();
        store_le32(&mut local, OFF_CHECKSUM, 0);
        crc32c_one_shot(&local[..OFF_CHECKSUM]) == load_le32(bytes, OFF_CHECKSUM)
    }
}

/// Slot hash: fold `lo ^ hi`, then apply the Murmur3 finalizer.
pub fn slot_hash(seed_id: ObjectId) -> u64 {
    murmur3_fmix64(seed_id.folded())
}

pub(crate) fn total_slots(vol: &Volume) -> HnResult<u64> {
    let bytes = vol
        .info
        .lba_bitmap_start
        .checked_sub(vol.info.lba_cortex_start)
        .ok_or(HnError::Geometry)?
        .checked_mul(vol.info.sector_size as u64)
        .ok_or(HnError::Geometry)?;
    Ok(bytes / ANCHOR_SIZE as u64)
}

/// `write_gen` comparison tolerant of 32-bit wraparound:
/// treats the difference as a signed 32-bit quantity.
fn gen_is_newer(candidate: u32, incumbent: u32) -> bool {
    (candidate.wrapping_sub(incumbent) as i32) > 0
}

/// Outcome of a successful, non-tombstoned lookup.
pub struct ScanHit {
    pub anchor: Anchor,
    pub slot_idx: u64,
}

/// Probe the table for `target`'s slot, following the open-addressed chain
/// from its hashed home slot until a wall, a match, or [`MAX_PROBES`].
pub fn scan_slot(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, target: ObjectId) -> HnResult<ScanHit> {
    let total = total_slots(vol)?;
    if total == 0 {
        return Err(HnError::Geometry);
    }
    let start = slot_hash(target) % total;

    let mut best: Option<(Anchor, u64)> = None;

    for step in 0..MAX_PROBES as u64 {
        let slot_idx = (start + step) % total;
        let bytes = read_slot(vol, hal, device, slot_idx)?;

        if Anchor::is_wall(&bytes) {
            break;
        }

        let class = load_le64(&bytes, OFF_DATA_CLASS);
        if class & (data_class::VALID | data_class::TOMBSTONE) == 0 {
            continue;
        }

        let id_bytes: [u8; 16] = bytes[OFF_SEED_ID..OFF_SEED_ID + 16].try_into().unwrap();
        if ObjectId::from_le_bytes(&id_bytes) != target {
            continue;
        }

        if !Anchor::checksum_matches(&bytes) {
            continue;
        }

        let anchor = Anchor::decode(&bytes);
        match &best {
            Some((cur, _)) if !gen_is_newer(anchor.write_gen, cur.write_gen) => {}
            _ => best = Some((anchor, slot_idx)),
        }
    }

    match best {
        None => Err(HnError::NotFound),
        Some((anchor, slot_idx)) if anchor.is_tombstone() => {
            let _ = slot_idx;
            Err(HnError::Tombstone)
        }
        Some((anchor, slot_idx)) => Ok(ScanHit { anchor, slot_idx }),
    }
}

/// Read one slot's raw bytes, preferring the RAM-resident Cortex when the
/// volume keeps one and falling back to HAL reads otherwise.
pub(crate) fn read_slot(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, slot_idx: u64) -> HnResult<Vec<u8>> {
    let byte_off = slot_idx * ANCHOR_SIZE as u64;

    if let Some(bytes) = vol.with_nano_cortex_slot(|mem| {
        let start = byte_off as usize;
        if start + ANCHOR_SIZE <= mem.len() {
            Some(mem[start..start + ANCHOR_SIZE].to_vec())
        } else {
            None
        }
    }) {
        if let Some(v) = bytes {
            return Ok(v);
        }
    }

    let sector_size = vol.info.sector_size as u64;
    let cortex_byte_base = vol.info.lba_cortex_start * sector_size;
    let abs_byte = cortex_byte_base + byte_off;
    let sector_idx = abs_byte / sector_size;
    let byte_in_sector = abs_byte % sector_size;

    let n_sectors: u32 = if byte_in_sector + ANCHOR_SIZE as u64 > sector_size {
        2
    } else {
        1
    };

    let mut buf = vec![0u8; (n_sectors as u64 * sector_size) as usize];
    hal.sync_io(device, HalOp::Read, sector_idx, &mut buf, n_sectors)?;

    let local_off = byte_in_sector as usize;
    Ok(buf[local_off..local_off + ANCHOR_SIZE].to_vec())
}
