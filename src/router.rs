//! The Spatial Router: turns a logical volume LBA+op into physical device
//! I/O across a device array.

use crate::endian::{crc32c_one_shot, load_le32};
use crate::error::{HnError, HnResult};
use crate::hal::{DeviceCaps, Hal, HalOp};
use crate::ids::{murmur3_fmix64, ObjectId};
use crate::volume::{
    self, ArrayMode, ArrayTopologySnapshot, FormatProfile, Volume, BLOCK_HEADER_CRC_OFFSET,
    BLOCK_HEADER_PAYLOAD_START,
};

/// Success outcomes the router can report. Plain success and the two
/// informational codes are modeled as variants of the `Ok` side of a
/// `Result` rather than folded into the error enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Ok,
    InfoSparse,
    InfoHealed,
}

const STRIPE_UNIT_SECTORS: u64 = 128;
const ROTATIONAL_REGION_SHIFT: u32 = 21;

/// Critical failures cause a device to be taken offline.
fn is_critical(e: HnError) -> bool {
    matches!(
        e,
        HnError::HwIo | HnError::DataRot | HnError::MediaToxic | HnError::AtomicsTimeout
    )
}

/// Dispatch one logical I/O to the array's devices per its topology mode.
pub fn route(
    vol: &Volume,
    hal: &dyn Hal,
    op: HalOp,
    lba: u64,
    buf: &mut [u8],
    len_sectors: u32,
    file_id: ObjectId,
) -> HnResult<RouteOutcome> {
    let snapshot = vol.snapshot_topology();

    if snapshot.devices.len() == 1 {
        let dev = snapshot.devices[0].handle;
        hal.sync_io(dev, op, lba, buf, len_sectors)?;
        return Ok(RouteOutcome::Ok);
    }

    match snapshot.mode {
        ArrayMode::Mirror => route_mirror(vol, hal, &snapshot, op, lba, buf, len_sectors),
        ArrayMode::Shard => route_shard(vol, hal, &snapshot, op, lba, buf, len_sectors, file_id),
        ArrayMode::Parity => route_parity(vol, hal, &snapshot, op, lba, buf, len_sectors),
    }
}

fn is_rotational(hal: &dyn Hal, device: u64) -> bool {
    hal.get_caps(device)
        .map(|c| c.hw_flags.rotational)
        .unwrap_or(false)
}

// --- MIRROR ------------------------------------------------------------

fn route_mirror(
    vol: &Volume,
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    op: HalOp,
    lba: u64,
    buf: &mut [u8],
    len_sectors: u32,
) -> HnResult<RouteOutcome> {
    match op {
        HalOp::Read => mirror_read(vol, hal, snapshot, lba, buf, len_sectors),
        HalOp::Write | HalOp::Flush | HalOp::Discard => {
            mirror_write(vol, hal, snapshot, op, lba, buf, len_sectors)
        }
        HalOp::ZoneAppend => Err(HnError::ProfileMismatch),
    }
}

fn mirror_read(
    vol: &Volume,
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    lba: u64,
    buf: &mut [u8],
    len_sectors: u32,
) -> HnResult<RouteOutcome> {
    let count = snapshot.devices.len();
    let start = if count > 0 && is_rotational(hal, snapshot.devices[0].handle) {
        ((lba >> ROTATIONAL_REGION_SHIFT) as usize) % count
    } else {
        0
    };

    let mut last_err = HnError::HwIo;
    for attempt in 0..3 {
        for step in 0..count {
            let idx = (start + step) % count;
            let dev = &snapshot.devices[idx];
            if !dev.is_online() {
                continue;
            }

            match hal.sync_io(dev.handle, HalOp::Read, lba, buf, len_sectors) {
                Ok(()) => return Ok(RouteOutcome::Ok),
                Err(e) if is_critical(e) => {
                    log::warn!("mirror member {} failed critically: {:?}", idx, e);
                    vol.mark_device_offline_and_flag(
                        idx,
                        crate::volume::state_flags::DEGRADED | crate::volume::state_flags::DIRTY,
                    );
                    last_err = e;
                }
                Err(e) => {
                    last_err = e;
                }
            }
        }

        if attempt < 2 {
            hal.micro_sleep(1_000);
        }
    }

    Err(last_err)
}

fn mirror_write(
    vol: &Volume,
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    op: HalOp,
    lba: u64,
    buf: &mut [u8],
    len_sectors: u32,
) -> HnResult<RouteOutcome> {
    let online_total = snapshot.devices.iter().filter(|d| d.is_online()).count();
    let mut successes = 0usize;
    let mut any_failed = false;

    for (idx, dev) in snapshot.devices.iter().enumerate() {
        if !dev.is_online() {
            continue;
        }

        let mut result = hal.sync_io(dev.handle, op, lba, buf, len_sectors);

        if result.is_err() && vol.profile == FormatProfile::Usb {
            let retryable = !matches!(result, Err(HnError::MediaToxic));
            if retryable {
                hal.micro_sleep(5_000);
                result = hal.sync_io(dev.handle, op, lba, buf, len_sectors);
            }
        }

        match result {
            Ok(()) => successes += 1,
            Err(e) => {
                any_failed = true;
                if is_critical(e) {
                    vol.mark_device_offline_and_flag(
                        idx,
                        crate::volume::state_flags::DEGRADED | crate::volume::state_flags::DIRTY,
                    );
                } else {
                    vol.set_state_flags(
                        crate::volume::state_flags::DEGRADED | crate::volume::state_flags::DIRTY,
                    );
                }
            }
        }
    }

    if any_failed || successes != online_total {
        // Strict consensus: the router does not roll back the mirrors that
        // did succeed; reconciliation happens at next mount via epoch/
        // generation resolution.
        return Err(HnError::HwIo);
    }

    Ok(RouteOutcome::Ok)
}

// --- SHARD ---------------------------------------------------------------

fn route_shard(
    vol: &Volume,
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    op: HalOp,
    lba: u64,
    buf: &mut [u8],
    len_sectors: u32,
    file_id: ObjectId,
) -> HnResult<RouteOutcome> {
    let count = snapshot.devices.len();
    let idx = shard_target_index(hal, snapshot, file_id, count);
    let dev = &snapshot.devices[idx];

    if !dev.is_online() {
        return Err(HnError::HwIo);
    }

    let caps = hal.get_caps(dev.handle)?;
    let mut actual_op = op;

    let zone_boundary = caps.zone_size_bytes > 0
        && caps.logical_block_size > 0
        && (lba * caps.logical_block_size as u64) % caps.zone_size_bytes == 0;

    if caps.hw_flags.zns_native && op == HalOp::Write && zone_boundary {
        actual_op = HalOp::ZoneAppend;
    } else {
        let device_sectors = device_sectors(&caps);
        if lba + len_sectors as u64 > device_sectors {
            return Err(HnError::Geometry);
        }
    }

    hal.sync_io(dev.handle, actual_op, lba, buf, len_sectors)?;
    Ok(RouteOutcome::Ok)
}

fn device_sectors(caps: &DeviceCaps) -> u64 {
    if caps.logical_block_size == 0 {
        return u64::MAX;
    }
    (caps.total_capacity_bytes / caps.logical_block_size as u128).min(u64::MAX as u128) as u64
}

fn shard_target_index(
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    file_id: ObjectId,
    count: usize,
) -> usize {
    if count == 0 {
        return 0;
    }

    let rotational = is_rotational(hal, snapshot.devices[0].handle);

    if rotational && file_id.looks_time_ordered() {
        (file_id.hi as u128 % count as u128) as usize
    } else {
        let mixed = murmur3_fmix64(file_id.lo ^ file_id.hi);
        (mixed as u128 % count as u128) as usize
    }
}

// --- PARITY ----------------------------------------------------------------

fn route_parity(
    vol: &Volume,
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    op: HalOp,
    lba: u64,
    buf: &mut [u8],
    len_sectors: u32,
) -> HnResult<RouteOutcome> {
    if snapshot
        .devices
        .iter()
        .any(|d| hal.get_caps(d.handle).map(|c| c.hw_flags.zns_native).unwrap_or(false))
    {
        return Err(HnError::ProfileMismatch);
    }

    if op != HalOp::Read {
        return Err(HnError::AccessDenied);
    }

    let count = snapshot.devices.len();
    if count < 2 {
        return Err(HnError::Geometry);
    }
    let data_disks = count - 1;
    let sector_size = vol.info.sector_size.max(1) as u64;

    let mut remaining = len_sectors as u64;
    let mut cur_lba = lba;
    let mut buf_off: usize = 0;
    let mut any_healed = false;

    while remaining > 0 {
        let chunk_start_in_unit = cur_lba % STRIPE_UNIT_SECTORS;
        let chunk_len = (STRIPE_UNIT_SECTORS - chunk_start_in_unit).min(remaining);
        let chunk_bytes = ((chunk_len * sector_size) as usize).min(buf.len() - buf_off);

        let healed = read_parity_chunk(
            vol,
            hal,
            snapshot,
            cur_lba,
            &mut buf[buf_off..buf_off + chunk_bytes],
            chunk_len as u32,
            data_disks,
        )?;
        any_healed |= healed;

        cur_lba += chunk_len;
        remaining -= chunk_len;
        buf_off += chunk_bytes;
    }

    Ok(if any_healed {
        RouteOutcome::InfoHealed
    } else {
        RouteOutcome::Ok
    })
}

/// Reads one stripe-unit-bounded chunk, reconstructing via XOR if the data
/// device is unavailable. Returns `true` if reconstruction was needed.
fn read_parity_chunk(
    vol: &Volume,
    hal: &dyn Hal,
    snapshot: &ArrayTopologySnapshot,
    lba: u64,
    out: &mut [u8],
    len_sectors: u32,
    data_disks: usize,
) -> HnResult<bool> {
    let count = snapshot.devices.len();
    let stripe_row = lba / (data_disks as u64 * STRIPE_UNIT_SECTORS);
    let offset_in_stripe = lba % (data_disks as u64 * STRIPE_UNIT_SECTORS);
    let logical_col = (offset_in_stripe / STRIPE_UNIT_SECTORS) as usize;
    let offset_within_column = offset_in_stripe % STRIPE_UNIT_SECTORS;

    let parity_col = (count - 1) - (stripe_row as usize % count);
    let physical_col = if logical_col >= parity_col {
        logical_col + 1
    } else {
        logical_col
    };

    let physical_lba = stripe_row * STRIPE_UNIT_SECTORS + offset_within_column;

    let mut last_err = HnError::HwIo;
    for _ in 0..3 {
        let dev = &snapshot.devices[physical_col];
        if !dev.is_online() {
            break;
        }
        match hal.sync_io(dev.handle, HalOp::Read, physical_lba, out, len_sectors) {
            Ok(()) => return Ok(false),
            Err(e) if is_critical(e) => {
                vol.mark_device_offline_and_flag(
                    physical_col,
                    crate::volume::state_flags::DEGRADED | crate::volume::state_flags::DIRTY,
                );
                last_err = e;
                break;
            }
            Err(e) => last_err = e,
        }
    }
    let _ = last_err;

    // Degraded reconstruction: XOR every other device's same physical chunk.
    for b in out.iter_mut() {
        *b = 0;
    }
    let mut peer_buf = vec![0u8; out.len()];

    for (col, dev) in snapshot.devices.iter().enumerate() {
        if col == physical_col {
            continue;
        }
        if !dev.is_online() {
            return Err(HnError::ParityBroken);
        }
        match hal.sync_io(dev.handle, HalOp::Read, physical_lba, &mut peer_buf, len_sectors) {
            Ok(()) => xor_into(out, &peer_buf),
            Err(e) if is_critical(e) => {
                vol.mark_device_offline_and_flag(
                    col,
                    crate::volume::state_flags::DEGRADED | crate::volume::state_flags::DIRTY,
                );
                return Err(HnError::ParityBroken);
            }
            Err(_) => return Err(HnError::ParityBroken),
        }
    }

    // If the reconstructed chunk is exactly one FS block and looks like a
    // block header (magic match), the header's own CRC must also check out;
    // a reconstruction that produces a block-shaped buffer with a broken
    // header CRC is itself a double fault.
    if out.len() == vol.info.block_size as usize
        && out.len() >= BLOCK_HEADER_PAYLOAD_START
        && load_le32(out, 0) == volume::magic::BLOCK
    {
        let stored_crc = load_le32(out, BLOCK_HEADER_CRC_OFFSET);
        let computed_crc = crc32c_one_shot(&out[BLOCK_HEADER_PAYLOAD_START..]);
        if computed_crc != stored_crc {
            return Err(HnError::ParityBroken);
        }
    }

    Ok(true)
}

/// Aliasing-safe XOR of `src` into `dst`. `dst == src` (same buffer) is a
/// no-op, matching the involution property `xor(xor(a,b),b) == a`.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    if std::ptr::eq(dst.as_ptr(), src.as_ptr()) {
        return;
    }
    debug_assert_eq!(dst.len(), src.len());
    let n = dst.len().min(src.len());

    let mut i = 0;
    while i + 32 <= n {
        for j in 0..32 {
            dst[i + j] ^= src[i + j];
        }
        i += 32;
    }
    while i + 8 <= n {
        for j in 0..8 {
            dst[i + j] ^= src[i + j];
        }
        i += 8;
    }
    while i < n {
        dst[i] ^= src[i];
        i += 1;
    }
}
