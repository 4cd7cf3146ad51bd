//! Table-driven CRC-32 (FCS-32 / IEEE 802.3, reflected), used exclusively to
//! protect frame headers on the wire. Payload integrity is left to the
//! transport (UDP/TCP checksums); see `spec.md` §4.1.
//!
//! Polynomial `0xEDB88320` (reflected form of `0x04C11DB7`), initial value
//! `0xFFFFFFFF`, no final XOR. The result is stored little-endian on the
//! wire regardless of host byte order.

use std::sync::OnceLock;

const POLY: u32 = 0xEDB8_8320;
pub const INIT_FCS: u32 = 0xFFFF_FFFF;

fn table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ POLY
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    })
}

/// Incremental CRC-32 accumulator, for computing a CRC across several
/// non-contiguous slices (e.g. header then payload) without concatenating
/// them first.
#[derive(Debug, Clone, Copy)]
pub struct Crc32(u32);

impl Crc32 {
    pub fn new() -> Crc32 {
        Crc32(INIT_FCS)
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        let table = table();
        let mut crc = self.0;
        for &b in bytes {
            crc = table[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8);
        }
        self.0 = crc;
        self
    }

    pub fn finish(&self) -> u32 {
        self.0
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Crc32::new()
    }
}

/// One-shot CRC-32 over a single contiguous slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    Crc32::new().update(bytes).finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_ieee_802_3_vector_without_final_xor() {
        // The canonical CRC-32/ISO-HDLC check value for "123456789" is
        // 0xCBF43926, but that value is produced with a final XOR of
        // 0xFFFFFFFF applied. TRDP's header CRC skips the final XOR, so
        // the expected value here is the bitwise complement.
        assert_eq!(crc32(b"123456789"), !0xCBF4_3926_u32);
    }

    #[test]
    fn empty_input_is_the_init_value_complemented_by_nothing() {
        assert_eq!(crc32(b""), INIT_FCS);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let whole = crc32(b"hello world");
        let mut acc = Crc32::new();
        acc.update(b"hello ").update(b"world");
        assert_eq!(acc.finish(), whole);
    }
}
