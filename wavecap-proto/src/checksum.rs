//! Frame checksum.
//!
//! An additive checksum in the Adler-32 family, with two deliberate quirks
//! that both ends of the wire rely on:
//!
//! - buffers shorter than 4 bytes checksum to `0`
//! - the bulk of the buffer is summed with a 4-byte unrolled loop whose last
//!   (up to 8) bytes always fall through to the byte-at-a-time tail
//!
//! This must stay bit-exact with the peer implementation; every frame is
//! validated against it and a mismatch tears the connection down. Do not
//! replace it with a textbook Adler-32.

/// Computes the 32-bit frame checksum of `data`.
///
/// The low 16 bits are the byte sum, the high 16 bits the running sum of
/// sums. Buffers shorter than 4 bytes return `0`.
pub fn checksum(data: &[u8]) -> u32 {
    if data.len() < 4 {
        return 0;
    }

    let mut s1: u64 = 0;
    let mut s2: u64 = 0;

    let mut i = 0;
    while i + 4 < data.len() {
        s2 = s2.wrapping_add(
            4 * (s1 + u64::from(data[i]))
                + 3 * u64::from(data[i + 1])
                + 2 * u64::from(data[i + 2])
                + u64::from(data[i + 3]),
        );
        s1 = s1.wrapping_add(
            u64::from(data[i])
                + u64::from(data[i + 1])
                + u64::from(data[i + 2])
                + u64::from(data[i + 3]),
        );
        i += 4;
    }

    while i < data.len() {
        s1 = s1.wrapping_add(u64::from(data[i]));
        s2 = s2.wrapping_add(s1);
        i += 1;
    }

    (((s1 & 0xffff) + (s2 << 16)) & 0xffff_ffff) as u32
}

#[cfg(test)]
mod tests {
    use super::checksum;

    #[test]
    fn short_buffers_checksum_to_zero() {
        assert_eq!(checksum(b""), 0);
        assert_eq!(checksum(b"a"), 0);
        assert_eq!(checksum(b"ab"), 0);
        assert_eq!(checksum(b"abc"), 0);
        assert_ne!(checksum(b"abcd"), 0);
    }

    #[test]
    fn deterministic() {
        let data = b"the quick brown fox jumps over the lazy dog";
        assert_eq!(checksum(data), checksum(data));
    }

    #[test]
    fn sensitive_to_any_byte() {
        let data: Vec<u8> = (0u8..64).collect();
        let reference = checksum(&data);

        for i in 0..data.len() {
            let mut corrupted = data.clone();
            corrupted[i] ^= 0x01;
            assert_ne!(checksum(&corrupted), reference, "flip at {i} not detected");
        }
    }

    #[test]
    fn matches_reference_values() {
        // values computed with the peer implementation
        assert_eq!(checksum(b"abcd"), 0x03d4_018a);
        assert_eq!(checksum(b"\x00\x00\x00\x00"), 0);
        assert_eq!(checksum(b"\x01\x00\x00\x00\x00"), 0x0005_0001);
    }
}
