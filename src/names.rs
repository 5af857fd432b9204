//! Inline vs extended name resolution and extension-block chain traversal.

use crate::cortex::{data_class, Anchor};
use crate::endian::load_le64;
use crate::hal::{DeviceHandle, Hal, HalOp};
use crate::volume::Volume;

/// Metadata extension block magic.
pub const MAGIC_META: u32 = 0x484E_344D;

/// Maximum extension-chain hops walked before giving up.
pub const MAX_CHAIN_DEPTH: u32 = 16;

const EXT_HEADER_SIZE: usize = 16;
const OFF_MAGIC: usize = 0;
const OFF_TYPE: usize = 4;
const OFF_NEXT_EXT_LBA: usize = 8;
const OFF_PAYLOAD: usize = EXT_HEADER_SIZE;

/// Extension block payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtType {
    Tag,
    LongName,
    Vector,
    Signet,
}

impl ExtType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ExtType::Tag),
            1 => Some(ExtType::LongName),
            2 => Some(ExtType::Vector),
            3 => Some(ExtType::Signet),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ExtType::Tag => 0,
            ExtType::LongName => 1,
            ExtType::Vector => 2,
            ExtType::Signet => 3,
        }
    }
}

/// A decoded extension block header; the payload stays as raw bytes since
/// its shape depends on `ext_type`.
pub struct ExtBlock {
    pub ext_type: ExtType,
    pub next_ext_lba: u64,
    pub payload: Vec<u8>,
}

/// Sentinel meaning "no further link" in `next_ext_lba` / inline head fields.
pub const LBA_SENTINEL: u64 = u64::MAX;

/// Validate an extension-chain pointer. Invalid pointers
/// abort traversal silently rather than raising an error, matching the
/// spec's "failing validation aborts traversal silently" rule.
fn validate_ext_lba(vol: &Volume, lba: u64) -> bool {
    if lba == LBA_SENTINEL || lba == 0 {
        return false;
    }
    let block_size_sectors = (vol.info.block_size / vol.info.sector_size.max(1)).max(1) as u64;
    if lba % block_size_sectors != 0 {
        return false;
    }
    if lba < vol.info.lba_flux_start {
        return false;
    }
    if lba >= vol.info.device_sectors {
        return false;
    }
    true
}

fn read_ext_block(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, lba: u64) -> Option<ExtBlock> {
    let block_size_sectors = (vol.info.block_size / vol.info.sector_size.max(1)).max(1);
    let mut buf = vec![0u8; vol.info.block_size as usize];
    hal.sync_io(device, HalOp::Read, lba, &mut buf, block_size_sectors).ok()?;

    let magic = u32::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
    if magic != MAGIC_META {
        return None;
    }

    let ext_type = ExtType::from_byte(buf[OFF_TYPE])?;
    let next_ext_lba = load_le64(&buf, OFF_NEXT_EXT_LBA);
    let payload = buf[OFF_PAYLOAD..].to_vec();

    Some(ExtBlock {
        ext_type,
        next_ext_lba,
        payload,
    })
}

/// Encode a fresh extension block header + payload into a full FS block.
pub fn encode_ext_block(block_size: usize, ext_type: ExtType, next_ext_lba: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; block_size];
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC_META.to_le_bytes());
    buf[OFF_TYPE] = ext_type.to_byte();
    buf[OFF_NEXT_EXT_LBA..OFF_NEXT_EXT_LBA + 8].copy_from_slice(&next_ext_lba.to_le_bytes());
    let n = payload.len().min(block_size - OFF_PAYLOAD);
    buf[OFF_PAYLOAD..OFF_PAYLOAD + n].copy_from_slice(&payload[..n]);
    buf
}

/// Resolve an anchor's name, whether inline or chained through extension
/// blocks. Returns the raw name bytes (no trailing NUL).
pub fn resolve_name(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, anchor: &Anchor) -> Vec<u8> {
    if anchor.data_class & data_class::EXTENDED == 0 {
        return inline_short_name(&anchor.inline_buffer);
    }

    let head_lba = load_le64(&anchor.inline_buffer, 0);
    walk_longname_chain(vol, hal, device, head_lba)
}

fn inline_short_name(buf: &[u8; 24]) -> Vec<u8> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf[..end].to_vec()
}

fn walk_longname_chain(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, head_lba: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let mut cur = head_lba;
    let mut prev: Option<u64> = None;
    let mut hops = 0u32;

    while hops < MAX_CHAIN_DEPTH {
        if !validate_ext_lba(vol, cur) {
            break;
        }
        if prev == Some(cur) {
            break; // self-loop: identical next_ext_lba two iterations running
        }

        let block = match read_ext_block(vol, hal, device, cur) {
            Some(b) => b,
            None => break,
        };

        if block.ext_type != ExtType::LongName {
            break;
        }

        match block.payload.iter().position(|&b| b == 0) {
            Some(nul) => {
                out.extend_from_slice(&block.payload[..nul]);
                break;
            }
            None => out.extend_from_slice(&block.payload),
        }

        prev = Some(cur);
        cur = block.next_ext_lba;
        hops += 1;
    }

    out
}

/// Compare an anchor's resolved name against `target`.
pub fn name_matches(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, anchor: &Anchor, target: &[u8]) -> bool {
    resolve_name(vol, hal, device, anchor) == target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::HwFlags;
    use crate::ids::ObjectId;
    use crate::testutil::MockHal;
    use crate::volume::{ArrayMode, DeviceEntry, FormatProfile, MediaKind, SuperblockInfo};

    fn info() -> SuperblockInfo {
        SuperblockInfo {
            uuid: 1,
            block_size: 512,
            sector_size: 512,
            capacity_sectors: 1 << 16,
            epoch_id: 1,
            lba_epoch_start: 1,
            lba_cortex_start: 8,
            lba_bitmap_start: 16,
            lba_qmask_start: 20,
            lba_flux_start: 32,
            lba_horizon_start: 64,
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

    #[test]
    fn inline_name_stops_at_nul() {
        let mut buf = [0u8; 24];
        buf[..5].copy_from_slice(b"hello");
        let anchor = Anchor {
            seed_id: ObjectId::ZERO,
            data_class: data_class::VALID,
            write_gen: 1,
            tag_filter: 0,
            create_clock: 0,
            mod_clock: 0,
            orbit_vector: [0; 6],
            inline_buffer: buf,
            checksum: 0,
        };
        assert_eq!(inline_short_name(&anchor.inline_buffer), b"hello");
    }

    #[test]
    fn longname_chain_concatenates_across_blocks() {
        let hal = MockHal::new();
        hal.add_device(1, 1 << 20, HwFlags::default());

        // A tiny block size (exactly header + payload, no implicit zero
        // padding past the real payload bytes) keeps each hop's content
        // from being cut short by the encoder's zero-fill.
        let mut custom_info = info();
        custom_info.block_size = 22; // 16-byte header + 6-byte payload
        let vol = Volume::new(
            custom_info,
            MediaKind::Ssd,
            FormatProfile::Generic,
            ArrayMode::Mirror,
            vec![DeviceEntry::new(1)],
            false,
        );

        // second block (tail): "world\0"
        let tail = encode_ext_block(22, ExtType::LongName, LBA_SENTINEL, b"world\0");
        hal.write_raw(1, 64, &tail);
        // first block: "hello " -> next = 64
        let head = encode_ext_block(22, ExtType::LongName, 64, b"hello ");
        hal.write_raw(1, 32, &head);

        let mut inline = [0u8; 24];
        inline[0..8].copy_from_slice(&32u64.to_le_bytes());
        let anchor = Anchor {
            seed_id: ObjectId::ZERO,
            data_class: data_class::VALID | data_class::EXTENDED,
            write_gen: 1,
            tag_filter: 0,
            create_clock: 0,
            mod_clock: 0,
            orbit_vector: [0; 6],
            inline_buffer: inline,
            checksum: 0,
        };

        let name = resolve_name(&vol, &hal, 1, &anchor);
        assert_eq!(name, b"hello world");
    }

    #[test]
    fn self_loop_terminates_traversal() {
        let hal = MockHal::new();
        hal.add_device(1, 1 << 20, HwFlags::default());
        let vol = make_volume();

        // Block at 32 points to itself, payload filled with no NUL byte so
        // the chain can only be stopped by self-loop detection.
        let full_payload = vec![b'x'; 512 - 16];
        let looping = encode_ext_block(512, ExtType::LongName, 32, &full_payload);
        hal.write_raw(1, 32, &looping);

        let result = walk_longname_chain(&vol, &hal, 1, 32);
        // First hop reads the block and appends the full payload, second
        // hop detects the repeated next_ext_lba and stops.
        assert_eq!(result, full_payload);
    }

    #[test]
    fn invalid_ext_lba_aborts_silently() {
        let vol = make_volume();
        assert!(!validate_ext_lba(&vol, LBA_SENTINEL));
        assert!(!validate_ext_lba(&vol, 0));
        assert!(!validate_ext_lba(&vol, 31)); // below flux_start
        assert!(!validate_ext_lba(&vol, 1 << 20)); // past device_sectors
    }
}
