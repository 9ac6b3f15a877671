//! Frame check sequences.
//!
//! TRDP protects frame headers and message data bodies with a CRC-32 over
//! the reflected IEEE 802.3 polynomial, seeded with `0xFFFF_FFFF` and with
//! no output inversion (the `JAMCRC` parameterization). The register value
//! is stored little-endian directly behind the protected span, which gives
//! the receiver a cheap check: running the same CRC over the span
//! *including* the stored value yields zero exactly when the frame is
//! intact.

use crc::{CRC_32_JAMCRC, Crc};

static FCS: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Compute the frame check sequence over a byte span.
pub fn fcs32(data: &[u8]) -> u32 {
    FCS.checksum(data)
}

/// Incremental FCS over several spans; equal to [`fcs32`] over their
/// concatenation.
pub struct Fcs32 {
    digest: crc::Digest<'static, u32>,
}

impl Fcs32 {
    /// Start a new computation.
    pub fn new() -> Self {
        Fcs32 {
            digest: FCS.digest(),
        }
    }

    /// Feed a span.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// The register value so far.
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for Fcs32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Check a span whose last four bytes are the stored (little-endian) FCS.
///
/// Returns `true` when the span verifies. The zero-residue property makes
/// this a single pass over the whole span.
pub fn fcs_check(span_with_fcs: &[u8]) -> bool {
    span_with_fcs.len() >= 4 && fcs32(span_with_fcs) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore, SeedableRng};

    /// Bitwise reference implementation, independent of the table-driven
    /// one in the `crc` crate.
    fn fcs32_ref(data: &[u8]) -> u32 {
        let mut crc: u32 = 0xFFFF_FFFF;
        for &byte in data {
            crc ^= byte as u32;
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

    #[test]
    fn test_known_value() {
        // CRC-32/JAMCRC("123456789") from the catalogue of parametrized
        // CRC algorithms.
        assert_eq!(fcs32(b"123456789"), 0x340B_C6D9);
    }

    #[test]
    fn test_empty_span() {
        assert_eq!(fcs32(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_matches_reference_on_corpus() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x7264_7021);
        for _ in 0..1000 {
            let len = rng.gen_range(0..256);
            let mut buf = vec![0u8; len];
            rng.fill_bytes(&mut buf);
            assert_eq!(fcs32(&buf), fcs32_ref(&buf), "corpus mismatch, len {len}");
        }
    }

    #[test]
    fn test_incremental_equals_one_shot() {
        let data = b"periodic process data telegram";
        for split in 0..data.len() {
            let mut inc = Fcs32::new();
            inc.update(&data[..split]);
            inc.update(&data[split..]);
            assert_eq!(inc.finalize(), fcs32(data));
        }
    }

    #[test]
    fn test_zero_residue() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x4643_5332);
        for _ in 0..100 {
            let len = rng.gen_range(1..128);
            let mut buf = vec![0u8; len];
            rng.fill_bytes(&mut buf);
            let fcs = fcs32(&buf);
            buf.extend_from_slice(&fcs.to_le_bytes());
            assert!(fcs_check(&buf));
            // Any single-bit flip must break the check.
            let bit = rng.gen_range(0..buf.len() * 8);
            buf[bit / 8] ^= 1 << (bit % 8);
            assert!(!fcs_check(&buf));
        }
    }
}
