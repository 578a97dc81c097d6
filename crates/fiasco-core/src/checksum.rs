//! Checksum routines used across the flasher.
//!
//! Two hashes exist in the wild firmware formats:
//! - a 16-bit XOR fold over little-endian word pairs, stamped into every
//!   image record, and
//! - a reflected CRC32 (polynomial 0xEDB88320) used by the cold-flash
//!   handshake framing and the config-area block format.

/// XOR-fold the input as a sequence of little-endian 16-bit words.
///
/// A trailing odd byte does not participate in the fold. This matches the
/// hash stored in existing firmware containers, so the behavior is frozen.
pub fn fold16(data: &[u8]) -> u16 {
    let mut hash: u16 = 0;
    for pair in data.chunks_exact(2) {
        hash ^= u16::from_le_bytes([pair[0], pair[1]]);
    }
    hash
}

/// Incremental variant of [`fold16`] for streamed content.
///
/// Feed only even-length chunks between calls; the image reader streams in
/// power-of-two blocks so the constraint holds at every call site.
pub fn fold16_update(hash: u16, data: &[u8]) -> u16 {
    hash ^ fold16(data)
}

/// Reflected CRC32, polynomial 0xEDB88320, bytes processed LSB-first.
///
/// `seed` is the running register value, letting callers chain calls over
/// split buffers. The cold-flash framing and the config-area parser both go
/// through here and must stay bit-identical.
pub fn crc32_reflected(seed: u32, data: &[u8]) -> u32 {
    let mut crc = seed;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// One-shot CRC32 with the conventional 0xFFFFFFFF pre/post conditioning.
pub fn crc32(data: &[u8]) -> u32 {
    !crc32_reflected(0xFFFF_FFFF, data)
}
