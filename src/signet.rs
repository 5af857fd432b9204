//! The Signet provenance chain: append-only signed records anchored to a
//! Cortex entry, with topology hashing to detect tampering.

use crate::alloc::Allocator;
use crate::cortex::{data_class, Anchor};
use crate::endian::{crc32c_one_shot, load_le128, load_le64, store_le32, store_le128, store_le64};
use crate::error::{HnError, HnResult};
use crate::hal::{DeviceHandle, Hal, HalOp};
use crate::ids::{murmur3_fmix64, ObjectId};
use crate::names::{encode_ext_block, ExtType, LBA_SENTINEL, MAGIC_META, MAX_CHAIN_DEPTH};
use crate::router::{self, RouteOutcome};
use crate::volume::Volume;

/// Current wire protocol version; `validate_chain_and_get_tail` rejects any
/// Signet block claiming a newer one.
pub const PROTOCOL_VERSION: u16 = 1;

const EXT_HEADER_SIZE: usize = 16;
/// Signet payload identity magic ("SIGN"), distinct from the shared
/// extension-header `MAGIC_META` tag: this one identifies the payload's own
/// bytes as a Signet record, independent of how it's linked into the chain.
const SIGNET_MAGIC: u32 = 0x5349_474E;
// Signet payload layout, relative to the start of the extension payload.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_AUTHOR_ID: usize = 6;
const OFF_TIMESTAMP_NS: usize = 14;
const OFF_BOUND_SEED_ID: usize = 22;
const OFF_VOLUME_UUID: usize = 38;
const OFF_PREV_SEAL_HASH: usize = 54;
const OFF_SELF_BLOCK_IDX: usize = 70;
const OFF_SIGNATURE: usize = 78;
const OFF_PUBKEY_FP: usize = 142;
const OFF_INTEGRITY_CRC: usize = 174;
const SIGNET_PAYLOAD_SIZE: usize = 178;

/// A decoded Signet extension payload.
#[derive(Debug, Clone)]
pub struct SignetPayload {
    pub magic: u32,
    pub version: u16,
    pub author_id: u64,
    pub timestamp_ns: u64,
    pub bound_seed_id: ObjectId,
    pub volume_uuid: u128,
    pub prev_seal_hash: u128,
    pub self_block_idx: u64,
    pub signature: [u8; 64],
    pub pubkey_fp: [u8; 32],
    pub integrity_crc: u32,
}

impl SignetPayload {
    fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < SIGNET_PAYLOAD_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes(payload[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap()),
            version: u16::from_le_bytes(payload[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap()),
            author_id: load_le64(payload, OFF_AUTHOR_ID),
            timestamp_ns: load_le64(payload, OFF_TIMESTAMP_NS),
            bound_seed_id: ObjectId::from_le_bytes(
                &payload[OFF_BOUND_SEED_ID..OFF_BOUND_SEED_ID + 16].try_into().unwrap(),
            ),
            volume_uuid: load_le128(payload, OFF_VOLUME_UUID),
            prev_seal_hash: load_le128(payload, OFF_PREV_SEAL_HASH),
            self_block_idx: load_le64(payload, OFF_SELF_BLOCK_IDX),
            signature: payload[OFF_SIGNATURE..OFF_SIGNATURE + 64].try_into().unwrap(),
            pubkey_fp: payload[OFF_PUBKEY_FP..OFF_PUBKEY_FP + 32].try_into().unwrap(),
            integrity_crc: u32::from_le_bytes(
                payload[OFF_INTEGRITY_CRC..OFF_INTEGRITY_CRC + 4].try_into().unwrap(),
            ),
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SIGNET_PAYLOAD_SIZE];
        store_le32(&mut buf, OFF_MAGIC, self.magic);
        buf[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.version.to_le_bytes());
        store_le64(&mut buf, OFF_AUTHOR_ID, self.author_id);
        store_le64(&mut buf, OFF_TIMESTAMP_NS, self.timestamp_ns);
        buf[OFF_BOUND_SEED_ID..OFF_BOUND_SEED_ID + 16]
            .copy_from_slice(&self.bound_seed_id.to_le_bytes());
        store_le128(&mut buf, OFF_VOLUME_UUID, self.volume_uuid);
        store_le128(&mut buf, OFF_PREV_SEAL_HASH, self.prev_seal_hash);
        store_le64(&mut buf, OFF_SELF_BLOCK_IDX, self.self_block_idx);
        buf[OFF_SIGNATURE..OFF_SIGNATURE + 64].copy_from_slice(&self.signature);
        buf[OFF_PUBKEY_FP..OFF_PUBKEY_FP + 32].copy_from_slice(&self.pubkey_fp);
        store_le32(&mut buf, OFF_INTEGRITY_CRC, self.integrity_crc);
        buf
    }
}

// --- SipHash-2-4, 128-bit variant --------------------------------------

struct SipState {
    v0: u64,
    v1: u64,
    v2: u64,
    v3: u64,
}

fn rotl(x: u64, b: u32) -> u64 {
    (x << b) | (x >> (64 - b))
}

impl SipState {
    fn new(k0: u64, k1: u64) -> Self {
        Self {
            v0: 0x736f6d6570736575 ^ k0,
            v1: 0x646f72616e646f6d ^ k1,
            v2: 0x6c7967656e657261 ^ k0,
            v3: 0x7465646279746573 ^ k1,
        }
    }

    fn round(&mut self) {
        self.v0 = self.v0.wrapping_add(self.v1);
        self.v1 = rotl(self.v1, 13);
        self.v1 ^= self.v0;
        self.v0 = rotl(self.v0, 32);
        self.v2 = self.v2.wrapping_add(self.v3);
        self.v3 = rotl(self.v3, 16);
        self.v3 ^= self.v2;
        self.v0 = self.v0.wrapping_add(self.v3);
        self.v3 = rotl(self.v3, 21);
        self.v3 ^= self.v0;
        self.v2 = self.v2.wrapping_add(self.v1);
        self.v1 = rotl(self.v1, 17);
        self.v1 ^= self.v2;
        self.v2 = rotl(self.v2, 32);
    }

    /// Returns `(low, high)` where `low` is the standard SipHash-2-4 digest
    /// and `high = v1 ^ v3` of the finalized state, a volume-specific widening
    /// mix not found in published SipHash implementations.
    fn finish(mut self, data: &[u8]) -> (u64, u64) {
        let len = data.len();
        let chunks = data.chunks_exact(8);
        let remainder = chunks.remainder();

        for chunk in chunks {
            let m = u64::from_le_bytes(chunk.try_into().unwrap());
            self.v3 ^= m;
            self.round();
            self.round();
            self.v0 ^= m;
        }

        let mut last = [0u8; 8];
        last[..remainder.len()].copy_from_slice(remainder);
        last[7] = (len & 0xff) as u8;
        let m = u64::from_le_bytes(last);
        self.v3 ^= m;
        self.round();
        self.round();
        self.v0 ^= m;

        self.v2 ^= 0xff;
        self.round();
        self.round();
        self.round();
        self.round();

        let low = self.v0 ^ self.v1 ^ self.v2 ^ self.v3;
        let high = self.v1 ^ self.v3;
        (low, high)
    }
}

/// Keyed SipHash-2-4 with 128-bit output, keyed by the volume UUID.
pub fn siphash128(key: u128, data: &[u8]) -> u128 {
    let k0 = key as u64;
    let k1 = (key >> 64) as u64;
    let (low, high) = SipState::new(k0, k1).finish(data);
    (low as u128) | ((high as u128) << 64)
}

/// Two-pass SipHash-128 fingerprint of a 32-byte public key.
fn pubkey_fingerprint(volume_uuid: u128, pubkey: &[u8; 32]) -> [u8; 32] {
    let first = siphash128(volume_uuid, pubkey);
    let second = siphash128(volume_uuid, &first.to_le_bytes());
    let mut out = [0u8; 32];
    out[0..16].copy_from_slice(&first.to_le_bytes());
    out[16..32].copy_from_slice(&second.to_le_bytes());
    out
}

/// Hash the header+payload of one Signet extension block for chain-link
/// verification.
fn hash_signet_block(volume_uuid: u128, block_bytes: &[u8]) -> u128 {
    siphash128(volume_uuid, &block_bytes[..EXT_HEADER_SIZE + SIGNET_PAYLOAD_SIZE])
}

// --- Chain validation ----------------------------------------------------

/// Outcome of walking the existing chain: the hash of the current head,
/// used to link a new Signet block.
pub struct ChainTail {
    pub head_hash: u128,
}

/// `validate_chain_and_get_tail`: walk newest→oldest,
/// checking depth, bounds, magic, CRC, version, volume/seed binding,
/// monotonic timestamps, and prev-hash linkage between adjacent Signet
/// blocks. Non-Signet blocks (e.g. LONGNAME) interrupt topology checking
/// without being errors.
pub fn validate_chain_and_get_tail(
    vol: &Volume,
    hal: &dyn Hal,
    device: DeviceHandle,
    head_lba: u64,
    bound_seed_id: ObjectId,
) -> HnResult<ChainTail> {
    if head_lba == LBA_SENTINEL {
        return Ok(ChainTail { head_hash: 0 });
    }

    let head_hash = hash_block_at(vol, hal, device, head_lba)?;

    let mut cur = head_lba;
    let mut depth = 0u32;
    let mut prev_timestamp: Option<u64> = None;
    // The prev_seal_hash claimed by the most recently visited Signet block;
    // the next Signet block we read must hash to this value.
    let mut expected_hash: Option<u128> = None;

    loop {
        if depth >= MAX_CHAIN_DEPTH {
            return Err(HnError::Tampered);
        }
        if cur >= vol.info.device_sectors {
            return Err(HnError::Tampered);
        }

        let block_size_sectors = (vol.info.block_size / vol.info.sector_size.max(1)).max(1);
        let mut buf = vec![0u8; vol.info.block_size as usize];
        hal.sync_io(device, HalOp::Read, cur, &mut buf, block_size_sectors)
            .map_err(|_| HnError::HwIo)?;

        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC_META {
            return Err(HnError::Tampered);
        }
        let ext_type_byte = buf[4];
        let next_ext_lba = load_le64(&buf, 8);

        if ext_type_byte != ExtType::Signet.to_byte() {
            // Non-Signet link: traverse through without topology checks.
            if next_ext_lba == LBA_SENTINEL {
                break;
            }
            cur = next_ext_lba;
            depth += 1;
            continue;
        }

        let payload_bytes = &buf[EXT_HEADER_SIZE..EXT_HEADER_SIZE + SIGNET_PAYLOAD_SIZE];
        let stored_crc = u32::from_le_bytes(
            payload_bytes[OFF_INTEGRITY_CRC..OFF_INTEGRITY_CRC + 4].try_into().unwrap(),
        );
        let mut crc_input = buf[..EXT_HEADER_SIZE + SIGNET_PAYLOAD_SIZE].to_vec();
        store_le32(&mut crc_input, EXT_HEADER_SIZE + OFF_INTEGRITY_CRC, 0);
        let computed_crc = crc32c_one_shot(&crc_input);
        if computed_crc != stored_crc {
            return Err(HnError::DataRot);
        }

        let payload = SignetPayload::decode(payload_bytes).ok_or(HnError::Tampered)?;

        if payload.magic != SIGNET_MAGIC {
            return Err(HnError::Tampered);
        }
        if payload.version > PROTOCOL_VERSION {
            return Err(HnError::VersionIncompat);
        }
        if payload.volume_uuid != vol.info.uuid {
            return Err(HnError::IdMismatch);
        }
        if payload.bound_seed_id != bound_seed_id {
            return Err(HnError::IdMismatch);
        }
        if let Some(prev_ts) = prev_timestamp {
            if payload.timestamp_ns > prev_ts {
                return Err(HnError::Tampered);
            }
        }
        prev_timestamp = Some(payload.timestamp_ns);

        let this_hash = hash_signet_block(vol.info.uuid, &buf);

        // The previously-visited (newer) Signet block's prev_seal_hash must
        // equal this (older) block's own hash.
        if let Some(expected) = expected_hash {
            if expected != this_hash {
                return Err(HnError::Tampered);
            }
        }

        if next_ext_lba == LBA_SENTINEL {
            if payload.prev_seal_hash != 0 {
                return Err(HnError::Tampered);
            }
            return Ok(ChainTail { head_hash });
        }

        expected_hash = Some(payload.prev_seal_hash);
        cur = next_ext_lba;
        depth += 1;
    }

    // Chain exhausted via non-Signet blocks only (no Signet blocks present).
    Ok(ChainTail { head_hash })
}

/// Read and hash the block at `lba`; used to compute the hash of the
/// current chain head before walking it.
fn hash_block_at(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, lba: u64) -> HnResult<u128> {
    let block_size_sectors = (vol.info.block_size / vol.info.sector_size.max(1)).max(1);
    let mut buf = vec![0u8; vol.info.block_size as usize];
    hal.sync_io(device, HalOp::Read, lba, &mut buf, block_size_sectors)
        .map_err(|_| HnError::HwIo)?;
    Ok(hash_signet_block(vol.info.uuid, &buf))
}

// --- Brand (write) operation ----------------------------------------------

/// `wyhash_mix`-style 64-bit avalanche mix used by the orbit-vector etch
///: a second, distinct constant from the Murmur3
/// finalizer so the etch doesn't just repeat the Cortex hash.
fn wyhash_mix(a: u64, b: u64) -> u64 {
    let r = (a as u128).wrapping_mul(b as u128);
    ((r >> 64) as u64) ^ (r as u64)
}

const ETCH_MAGIC: u64 = 0x9E37_79B9_7F4A_7C15;

/// Mutate the 6-byte orbit vector in place: the "etch".
fn etch_orbit_vector(orbit_vector: &mut [u8; 6], signature: &[u8; 64], volume_uuid: u128) {
    let mut bytes8 = [0u8; 8];
    bytes8[..6].copy_from_slice(orbit_vector);
    let mut vector_u64 = u64::from_le_bytes(bytes8);

    let sig_hash = siphash128(volume_uuid, signature);
    let entropy = murmur3_fmix64((sig_hash as u64) ^ ((sig_hash >> 64) as u64));
    let mixed = wyhash_mix(entropy, ETCH_MAGIC);

    vector_u64 ^= mixed;
    vector_u64 = vector_u64.rotate_left(19) & 0x0000_FFFF_FFFF_FFFF;
    vector_u64 |= 1; // odd parity

    let out = vector_u64.to_le_bytes();
    orbit_vector.copy_from_slice(&out[..6]);
}

/// Attach a provenance signature to `anchor`, migrating its name storage
/// from inline to extended if it isn't already.
///
/// On success, `anchor` is mutated in place (EXTENDED set, inline buffer
/// repointed, orbit vector etched, checksum recomputed); the caller is
/// responsible for durably writing the mutated anchor.
pub fn brand(
    vol: &Volume,
    hal: &dyn Hal,
    allocator: &dyn Allocator,
    device: DeviceHandle,
    anchor: &mut Anchor,
    author_id: u64,
    signature: [u8; 64],
    pubkey: [u8; 32],
) -> HnResult<()> {
    if vol.read_only {
        return Err(HnError::AccessDenied);
    }

    let mut chain_head = if anchor.is_extended() {
        load_le64(&anchor.inline_buffer, 0)
    } else {
        LBA_SENTINEL
    };

    if !anchor.is_extended() && anchor.inline_buffer.iter().any(|&b| b != 0) {
        // Migrate: move the prior inline bytes into a LONGNAME block.
        let migrated_lba = allocator.alloc_horizon(vol)?;
        let block = encode_ext_block(
            vol.info.block_size as usize,
            ExtType::LongName,
            LBA_SENTINEL,
            &anchor.inline_buffer,
        );
        write_block(vol, hal, device, migrated_lba, block)?;
        chain_head = migrated_lba;
    }

    let tail = validate_chain_and_get_tail(vol, hal, device, chain_head, anchor.seed_id)?;

    let new_lba = allocator.alloc_horizon(vol)?;

    let pubkey_fp = pubkey_fingerprint(vol.info.uuid, &pubkey);
    let payload = SignetPayload {
        magic: SIGNET_MAGIC,
        version: PROTOCOL_VERSION,
        author_id,
        timestamp_ns: hal.get_time_ns(),
        bound_seed_id: anchor.seed_id,
        volume_uuid: vol.info.uuid,
        prev_seal_hash: tail.head_hash,
        self_block_idx: new_lba,
        signature,
        pubkey_fp,
        integrity_crc: 0,
    };

    let mut payload_bytes = payload.encode();
    let mut header_and_payload = vec![0u8; EXT_HEADER_SIZE];
    header_and_payload[0..4].copy_from_slice(&MAGIC_META.to_le_bytes());
    header_and_payload[4] = ExtType::Signet.to_byte();
    header_and_payload[8..16].copy_from_slice(&chain_head.to_le_bytes());
    header_and_payload.append(&mut payload_bytes);

    let crc = {
        let mut tmp = header_and_payload.clone();
        store_le32(&mut tmp, EXT_HEADER_SIZE + OFF_INTEGRITY_CRC, 0);
        crc32c_one_shot(&tmp)
    };
    store_le32(&mut header_and_payload, EXT_HEADER_SIZE + OFF_INTEGRITY_CRC, crc);

    let mut block = vec![0u8; vol.info.block_size as usize];
    let n = header_and_payload.len().min(block.len());
    block[..n].copy_from_slice(&header_and_payload[..n]);

    if let Err(e) = write_block(vol, hal, device, new_lba, block) {
        let _ = allocator.free_block(vol, new_lba);
        return Err(e);
    }
    hal.barrier(device).map_err(|_| HnError::HwIo)?;

    etch_orbit_vector(&mut anchor.orbit_vector, &signature, vol.info.uuid);

    anchor.inline_buffer = [0u8; 24];
    store_le64(&mut anchor.inline_buffer, 0, new_lba);
    anchor.data_class |= data_class::EXTENDED;
    anchor.recompute_checksum();

    Ok(())
}

fn write_block(vol: &Volume, hal: &dyn Hal, device: DeviceHandle, lba: u64, block: Vec<u8>) -> HnResult<()> {
    let block_size_sectors = (vol.info.block_size / vol.info.sector_size.max(1)).max(1);
    let mut buf = block;
    let outcome = router::route(
        vol,
        hal,
        HalOp::Write,
        lba,
        &mut buf,
        block_size_sectors,
        ObjectId::ZERO,
    )?;
    match outcome {
        RouteOutcome::Ok | RouteOutcome::InfoHealed | RouteOutcome::InfoSparse => Ok(()),
    }
}
