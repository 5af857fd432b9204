//! Auto-Medic: single-block reactive healing.
//!
//! `repair_block` rewrites a physical block, verifies the write via
//! read-back, and degrades the block's [`crate::qmask::QMask`] entry under
//! the same bounded-CAS discipline the quality mask itself enforces.

use crate::error::{HnError, HnResult};
use crate::hal::{DeviceHandle, Hal, HalOp};
use crate::ids::ObjectId;
use crate::qmask::Quality;
use crate::router::{self, RouteOutcome};
use crate::volume::Volume;

/// Rewrite one block in place and verify it by reading it back.
///
/// `lba` is the target LBA in sectors; `new_payload` must cover exactly
/// `len_bytes`, a multiple of the device sector size.
pub fn repair_block(
    vol: &Volume,
    hal: &dyn Hal,
    device: DeviceHandle,
    lba: u64,
    new_payload: &[u8],
) -> HnResult<()> {
    if vol.read_only {
        return Err(HnError::AccessDenied);
    }

    let len_bytes = new_payload.len();
    if len_bytes == 0 {
        return Ok(());
    }

    let sector_size = vol.info.sector_size.max(1) as u64;
    if len_bytes as u64 % sector_size != 0 {
        return Err(HnError::AlignmentFail);
    }
    let len_sectors = (len_bytes as u64 / sector_size) as u32;

    if lba.saturating_add(len_sectors as u64) > vol.info.device_sectors {
        return Err(HnError::Geometry);
    }

    // Q-Mask bookkeeping happens before the write: TOXIC blocks still get a
    // best-effort physical write attempt, but the repair is reported as
    // MEDIA_TOXIC regardless of whether that write lands.
    let fs_block_sectors =
        (vol.info.block_size / vol.info.sector_size.max(1)).max(1) as u64;
    let block_count = (len_sectors as u64 + fs_block_sectors - 1) / fs_block_sectors;
    let first_block = lba / fs_block_sectors;

    let mut any_toxic = false;
    if let Some(qmask) = &vol.quality_mask {
        for i in 0..block_count.max(1) {
            let block_idx = first_block + i;
            if qmask.get(block_idx) == Quality::Toxic {
                any_toxic = true;
            }
        }
    }

    let mut write_buf = new_payload.to_vec();
    let write_result = router::route(
        vol,
        hal,
        HalOp::Write,
        lba,
        &mut write_buf,
        len_sectors,
        ObjectId::ZERO,
    );

    if any_toxic {
        // Sticky regardless of whether the best-effort write above
        // succeeded.
        let _ = write_result;
        return Err(HnError::MediaToxic);
    }

    write_result?;

    let mut scratch = vec![0u8; len_bytes];
    let outcome = router::route(
        vol,
        hal,
        HalOp::Read,
        lba,
        &mut scratch,
        len_sectors,
        ObjectId::ZERO,
    )?;
    match outcome {
        RouteOutcome::Ok | RouteOutcome::InfoSparse | RouteOutcome::InfoHealed => {}
    }

    if scratch != new_payload {
        return Err(HnError::DataRot);
    }

    if let Some(qmask) = &vol.quality_mask {
        for i in 0..block_count.max(1) {
            qmask.degrade_after_repair(first_block + i)?;
        }
    }

    vol.heal_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    Ok(())
}
