//! Little-endian load/store helpers and the CRC32C façade.
//!
//! On-disk structures are never derived through a generic serialization
//! framework: every field is read and written through these helpers against
//! named byte offsets, so the wire format never depends on Rust's
//! unspecified struct layout.

/// Load a little-endian `u16` from `buf[off..off+2]`.
pub fn load_le16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

/// Load a little-endian `u32` from `buf[off..off+4]`.
pub fn load_le32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Load a little-endian `u64` from `buf[off..off+8]`.
pub fn load_le64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Load a little-endian `u128` from `buf[off..off+16]`.
pub fn load_le128(buf: &[u8], off: usize) -> u128 {
    u128::from_le_bytes(buf[off..off + 16].try_into().unwrap())
}

/// Store a little-endian `u16` into `buf[off..off+2]`.
pub fn store_le16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

/// Store a little-endian `u32` into `buf[off..off+4]`.
pub fn store_le32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Store a little-endian `u64` into `buf[off..off+8]`.
pub fn store_le64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Store a little-endian `u128` into `buf[off..off+16]`.
pub fn store_le128(buf: &mut [u8], off: usize, v: u128) {
    buf[off..off + 16].copy_from_slice(&v.to_le_bytes());
}

/// CRC32C (Castagnoli) over a byte range, with an explicit seed so callers
/// can chain partial regions (e.g. header then payload) the way the Signet
/// CRC is computed over header+payload but excludes the CRC field itself.
///
/// Uses the same inverted-seed/inverted-result convention as ext4's
/// `ext4_style_crc32c_le` helper.
pub fn crc32c(seed: u32, buf: &[u8]) -> u32 {
    crc::crc32::update(seed ^ !0, &crc::crc32::CASTAGNOLI_TABLE, buf) ^ !0u32
}

/// CRC32C over a single buffer starting from the canonical all-ones seed.
pub fn crc32c_one_shot(buf: &[u8]) -> u32 {
    crc32c(!0, buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_le16() {
        let mut buf = [0u8; 2];
        store_le16(&mut buf, 0, 0xBEEF);
        assert_eq!(load_le16(&buf, 0), 0xBEEF);
    }

    #[test]
    fn round_trip_le32() {
        let mut buf = [0u8; 8];
        store_le32(&mut buf, 2, 0xDEADBEEF);
        assert_eq!(load_le32(&buf, 2), 0xDEADBEEF);
    }

    #[test]
    fn round_trip_le64() {
        let mut buf = [0u8; 8];
        store_le64(&mut buf, 0, 0x0123_4567_89AB_CDEF);
        assert_eq!(load_le64(&buf, 0), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn round_trip_le128() {
        let mut buf = [0u8; 16];
        let v: u128 = 0x1111_2222_3333_4444_5555_6666_7777_8888;
        store_le128(&mut buf, 0, v);
        assert_eq!(load_le128(&buf, 0), v);
    }

    #[test]
    fn crc32c_is_deterministic_and_sensitive_to_payload() {
        let a = crc32c_one_shot(b"hn4-cortex-anchor");
        let b = crc32c_one_shot(b"hn4-cortex-anchor");
        let c = crc32c_one_shot(b"hn4-cortex-anchos");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn crc32c_seed_chains_header_then_payload() {
        let whole = crc32c_one_shot(b"headerpayload");
        let chained = crc32c(crc32c(!0, b"header"), b"payload");
        assert_eq!(whole, chained);
    }
}
