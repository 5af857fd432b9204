//! Bloom-filter tag matching combined with a linear Cortex sweep.

use crate::cortex::{data_class, read_slot, total_slots, Anchor, ANCHOR_SIZE, OFF_DATA_CLASS};
use crate::endian::load_le64;
use crate::error::{HnError, HnResult};
use crate::hal::{DeviceCaps, DeviceHandle, Hal};
use crate::names::name_matches;
use crate::volume::Volume;

const BATCH_BYTES_FLASH: u64 = 64 * 1024;
const BATCH_BYTES_ROTATIONAL: u64 = 256 * 1024;

/// FNV-1a 64-bit, the basis for the tag Bloom filter.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET_BASIS;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// Map one tag segment to a 3-bit-set 64-bit mask: the FNV-1a hash split
/// into three non-overlapping 6-bit index extracts.
fn segment_mask(segment: &[u8]) -> u64 {
    let h = fnv1a64(segment);
    let mut mask = 0u64;
    mask |= 1u64 << (h & 0x3f);
    mask |= 1u64 << ((h >> 6) & 0x3f);
    mask |= 1u64 << ((h >> 12) & 0x3f);
    mask
}

/// Build the containment mask for a tag string. Hierarchical tags
/// containing `/` or `:` contribute one mask per segment, OR-combined.
pub fn generate_tag_mask(tag: &str) -> u64 {
    tag.split(|c| c == '/' || c == ':')
        .filter(|s| !s.is_empty())
        .fold(0u64, |acc, seg| acc | segment_mask(seg.as_bytes()))
}

/// A resonance query: a required tag mask, an optional exact name, and a
/// containment threshold (100 = strict).
pub struct ResonanceQuery<'a> {
    pub required_tags: Option<u64>,
    pub name: Option<&'a [u8]>,
    pub threshold_pct: u8,
}

fn batch_sectors(caps: &DeviceCaps, sector_size: u64) -> u64 {
    let batch_bytes = if caps.hw_flags.rotational {
        BATCH_BYTES_ROTATIONAL
    } else {
        BATCH_BYTES_FLASH
    };
    ((batch_bytes + sector_size - 1) / sector_size).max(1)
}

/// Linear batched sweep over the Cortex region. Returns the
/// surviving candidate with the highest `(score, write_gen)` pair.
pub fn scan(
    vol: &Volume,
    hal: &dyn Hal,
    device: DeviceHandle,
    query: &ResonanceQuery,
) -> HnResult<Anchor> {
    if query.required_tags.is_none() && query.name.is_none() {
        return Err(HnError::InvalidArgument);
    }

    let total = total_slots(vol)?;
    let caps = hal.get_caps(device)?;
    let sector_size = vol.info.sector_size.max(1) as u64;
    let sectors_per_batch = batch_sectors(&caps, sector_size);
    let slots_per_batch = ((sectors_per_batch * sector_size) / ANCHOR_SIZE as u64).max(1);

    let required = query.required_tags.unwrap_or(0);
    let required_popcount = required.count_ones();

    let mut best: Option<(u32, u32, Anchor)> = None; // (score, write_gen, anchor)

    let mut batch_start = 0u64;
    while batch_start < total {
        let batch_end = (batch_start + slots_per_batch).min(total);

        let batch_start_byte = batch_start * ANCHOR_SIZE as u64;
        let batch_end_byte = batch_end * ANCHOR_SIZE as u64;
        let batch_start_lba = vol.info.lba_cortex_start + batch_start_byte / sector_size;
        let batch_end_lba =
            vol.info.lba_cortex_start + (batch_end_byte + sector_size - 1) / sector_size;
        let batch_len_sectors = (batch_end_lba - batch_start_lba).max(1) as u32;
        hal.prefetch(device, batch_start_lba, batch_len_sectors);

        for slot_idx in batch_start..batch_end {
            let bytes = match read_slot(vol, hal, device, slot_idx) {
                Ok(b) => b,
                Err(_) => continue,
            };

            let class = load_le64(&bytes, OFF_DATA_CLASS);
            if class & data_class::VALID == 0 || class & data_class::TOMBSTONE != 0 {
                continue;
            }

            let anchor = Anchor::decode(&bytes);

            let score = if let Some(req) = query.required_tags {
                let intersection = anchor.tag_filter & req;
                let score = intersection.count_ones();
                let threshold = (query.threshold_pct as u32 * required_popcount) / 100;
                if score < threshold {
                    continue;
                }
                score
            } else {
                0
            };

            if let Some(target) = query.name {
                if !name_matches(vol, hal, device, &anchor, target) {
                    continue;
                }
            }

            if !Anchor::checksum_matches(&bytes) {
                continue;
            }

            let better = match &best {
                None => true,
                Some((best_score, best_gen, _)) => {
                    (score, anchor.write_gen) > (*best_score, *best_gen)
                }
            };
            if better {
                best = Some((score, anchor.write_gen, anchor));
            }
        }

        batch_start = batch_end;
    }

    best.map(|(_, _, a)| a).ok_or(HnError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cortex::ANCHOR_SIZE;
    use crate::hal::HwFlags;
    use crate::ids::ObjectId;
    use crate::testutil::MockHal;
    use crate::volume::{ArrayMode, DeviceEntry, FormatProfile, MediaKind, SuperblockInfo};

    fn info() -> SuperblockInfo {
        SuperblockInfo {
            uuid: 1,
            block_size: 4096,
            sector_size: 512,
            capacity_sectors: 1 << 16,
            epoch_id: 1,
            lba_epoch_start: 1,
            lba_cortex_start: 8,
            lba_bitmap_start: 8 + (ANCHOR_SIZE as u64 * 16) / 512,
            lba_qmask_start: 2000,
            lba_flux_start: 4000,
            lba_horizon_start: 5000,
            device_sectors: 1 << 16,
        }
    }

    fn make_volume() -> Volume {
        Volume::new(
            info(),
            MediaKind::Ssd,
            FormatProfile::Generic,
            ArrayMode::Mirror,
            vec![DeviceEntry::new(1)],
            false,
        )
    }

    fn write_anchor_at(hal: &MockHal, vol: &Volume, slot_idx: u64, mut anchor: Anchor) {
        anchor.recompute_checksum();
        let mut buf = [0u8; ANCHOR_SIZE];
        anchor.encode(&mut buf);

        let sector_size = vol.info.sector_size as u64;
        let abs_byte = vol.info.lba_cortex_start * sector_size + slot_idx * ANCHOR_SIZE as u64;
        let sector_idx = abs_byte / sector_size;
        let byte_in_sector = (abs_byte % sector_size) as usize;
        let n_sectors: u32 = if byte_in_sector + ANCHOR_SIZE > sector_size as usize {
            2
        } else {
            1
        };
        let mut raw = vec![0u8; (n_sectors as u64 * sector_size) as usize];
        hal.sync_io(1, crate::hal::HalOp::Read, sector_idx, &mut raw, n_sectors).ok();
        raw[byte_in_sector..byte_in_sector + ANCHOR_SIZE].copy_from_slice(&buf);
        hal.sync_io(1, crate::hal::HalOp::Write, sector_idx, &mut raw, n_sectors).unwrap();
    }

    fn blank_anchor(id: u64, tag_filter: u64, write_gen: u32) -> Anchor {
        Anchor {
            seed_id: ObjectId::new(id, 0),
            data_class: data_class::VALID,
            write_gen,
            tag_filter,
            create_clock: 0,
            mod_clock: 0,
            orbit_vector: [0; 6],
            inline_buffer: [0; 24],
            checksum: 0,
        }
    }

    // Highest tag-intersection score wins; ties break on the newer write_gen.
    #[test]
    fn tag_query_picks_best_intersection_and_tie_breaks_on_gen() {
        let hal = MockHal::new();
        hal.add_device(1, 1 << 20, HwFlags::default());
        let vol = make_volume();

        write_anchor_at(&hal, &vol, 0, blank_anchor(1, 0b0111, 1));
        write_anchor_at(&hal, &vol, 1, blank_anchor(2, 0b1011, 5));
        write_anchor_at(&hal, &vol, 2, blank_anchor(3, 0b1110, 9));

        let query = ResonanceQuery {
            required_tags: Some(0b0110),
            name: None,
            threshold_pct: 100,
        };
        let hit = scan(&vol, &hal, 1, &query).unwrap();
        // 0b0111 & 0b0110 = 0b0110 (score 2); 0b1011 & 0b0110 = 0b0010 (score
        // 1, below threshold); 0b1110 & 0b0110 = 0b0110 (score 2, gen 9).
        assert_eq!(hit.write_gen, 9);
    }

    // A tombstoned anchor must never surface from a resonance scan, even if
    // it still carries the VALID bit alongside TOMBSTONE.
    #[test]
    fn tombstoned_anchor_is_skipped_even_with_valid_bit_set() {
        let hal = MockHal::new();
        hal.add_device(1, 1 << 20, HwFlags::default());
        let vol = make_volume();

        let mut tombstoned = blank_anchor(1, 0b0110, 50);
        tombstoned.data_class = data_class::VALID | data_class::TOMBSTONE;
        write_anchor_at(&hal, &vol, 0, tombstoned);
        write_anchor_at(&hal, &vol, 1, blank_anchor(2, 0b0110, 1));

        let query = ResonanceQuery {
            required_tags: Some(0b0110),
            name: None,
            threshold_pct: 100,
        };
        let hit = scan(&vol, &hal, 1, &query).unwrap();
        assert_eq!(hit.write_gen, 1);
    }

    #[test]
    fn empty_query_is_invalid_argument() {
        let hal = MockHal::new();
        hal.add_device(1, 1 << 20, HwFlags::default());
        let vol = make_volume();
        let query = ResonanceQuery {
            required_tags: None,
            name: None,
            threshold_pct: 100,
        };
        assert_eq!(scan(&vol, &hal, 1, &query).err(), Some(HnError::InvalidArgument));
    }

    // The sweep issues one prefetch hint per batch, with real LBA/length
    // arguments sized per `batch_sectors` — not a content-free call repeated
    // once per slot.
    #[test]
    fn scan_issues_one_prefetch_per_real_batch() {
        const TOTAL_SLOTS: u64 = 1100;
        let cortex_sectors = (TOTAL_SLOTS * ANCHOR_SIZE as u64) / 512;

        let mut scan_info = info();
        scan_info.lba_cortex_start = 8;
        scan_info.lba_bitmap_start = 8 + cortex_sectors;

        let hal = MockHal::new();
        hal.add_device(1, 1 << 20, HwFlags::default());
        let vol = Volume::new(
            scan_info,
            MediaKind::Ssd,
            FormatProfile::Generic,
            ArrayMode::Mirror,
            vec![DeviceEntry::new(1)],
            false,
        );

        let query = ResonanceQuery {
            required_tags: Some(0b0110),
            name: None,
            threshold_pct: 100,
        };
        assert_eq!(scan(&vol, &hal, 1, &query).err(), Some(HnError::NotFound));

        let calls = hal.prefetch_calls(1);
        // Flash batching: 64 KiB / 512 B sectors = 128 sectors/batch, i.e.
        // 512 slots/batch; 1100 slots needs 3 batches.
        assert_eq!(calls, vec![(8, 128), (136, 128), (264, 19)]);
    }

    #[test]
    fn hierarchical_tag_segments_or_combine() {
        let whole = generate_tag_mask("a/b:c");
        let parts = segment_mask(b"a") | segment_mask(b"b") | segment_mask(b"c");
        assert_eq!(whole, parts);
    }
}
