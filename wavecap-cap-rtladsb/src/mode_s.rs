//! Mode-S frame validation and the ADS-B fields we surface.
//!
//! Frames are 56 or 112 bits with a 24-bit CRC in the last three bytes.
//! For downlink formats 11 and 17 the parity field is the plain CRC, so
//! corrupted frames can be recovered by brute-forcing single bit flips.

use crc::Crc;

/// CRC algorithm for Mode-S
///
/// <https://www.ll.mit.edu/sites/default/files/publication/doc/2018-12/Gertz_1984_ATC-117_WW-15318.pdf>
pub const CRC_24_MODES: crc::Algorithm<u32> = crc::Algorithm {
    width: 24,
    poly: 0xfff409,
    init: 0,
    refin: false,
    refout: false,
    xorout: 0x000000,
    check: 0x54268,
    residue: 0x000000,
};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_24_MODES);

/// 6-bit character set for callsigns; `#` marks invalid codes.
const CALLSIGN_CHARSET: &[u8] =
    b"#ABCDEFGHIJKLMNOPQRSTUVWXYZ##### ###############0123456789######";

pub const SHORT_FRAME_LENGTH: usize = 7;
pub const LONG_FRAME_LENGTH: usize = 14;

pub fn downlink_format(frame: &[u8]) -> u8 {
    frame[0] >> 3
}

fn parity(frame: &[u8]) -> u32 {
    let tail = &frame[frame.len() - 3..];
    (u32::from(tail[0]) << 16) | (u32::from(tail[1]) << 8) | u32::from(tail[2])
}

/// Whether the frame's CRC matches its parity field.
///
/// Only meaningful for downlink formats 11, 17 and 18; other formats
/// overlay the parity with the transponder address.
pub fn verify(frame: &[u8]) -> bool {
    CRC.checksum(&frame[..frame.len() - 3]) == parity(frame)
}

/// Tries to recover a corrupted frame by flipping one bit at a time.
///
/// Returns `true` if the frame now verifies. Restricted to downlink
/// formats with a plain CRC parity field; anything else is left untouched.
pub fn repair(frame: &mut [u8]) -> bool {
    if !matches!(downlink_format(frame), 11 | 17 | 18) {
        return false;
    }

    for bit in 0..frame.len() * 8 {
        frame[bit / 8] ^= 0x80 >> (bit % 8);
        if verify(frame) {
            return true;
        }
        frame[bit / 8] ^= 0x80 >> (bit % 8);
    }

    false
}

/// Transponder address, for the formats that carry it in the clear.
pub fn icao(frame: &[u8]) -> Option<[u8; 3]> {
    match downlink_format(frame) {
        11 | 17 | 18 => Some([frame[1], frame[2], frame[3]]),
        _ => None,
    }
}

/// Aircraft identification from an extended squitter, type codes 1 to 4.
pub fn callsign(frame: &[u8]) -> Option<String> {
    if downlink_format(frame) != 17 || frame.len() != LONG_FRAME_LENGTH {
        return None;
    }
    if !(1..=4).contains(&(frame[4] >> 3)) {
        return None;
    }

    let mut bits: u64 = 0;
    for byte in &frame[5..11] {
        bits = (bits << 8) | u64::from(*byte);
    }

    let mut callsign = String::with_capacity(8);
    for i in 0..8 {
        let code = ((bits >> (42 - 6 * i)) & 0x3f) as usize;
        callsign.push(char::from(CALLSIGN_CHARSET[code]));
    }

    let callsign = callsign.trim_end().to_owned();
    if callsign.is_empty() || callsign.contains('#') {
        None
    }
    else {
        Some(callsign)
    }
}

/// Barometric altitude in feet from an airborne position squitter, type
/// codes 9 to 18. Only the 25 ft encoding is decoded.
pub fn altitude_ft(frame: &[u8]) -> Option<i32> {
    if downlink_format(frame) != 17 || frame.len() != LONG_FRAME_LENGTH {
        return None;
    }
    if !(9..=18).contains(&(frame[4] >> 3)) {
        return None;
    }

    let ac12 = ((u32::from(frame[5]) << 4) | (u32::from(frame[6]) >> 4)) & 0xfff;
    if ac12 & 0x10 == 0 {
        // gillham-coded altitude, not decoded
        return None;
    }

    let n = ((ac12 & 0x0fe0) >> 1) | (ac12 & 0x000f);
    Some(n as i32 * 25 - 1000)
}

#[cfg(test)]
mod tests {
    use super::{
        CRC,
        altitude_ft,
        callsign,
        downlink_format,
        icao,
        repair,
        verify,
    };

    // identification squitter, KLM1023
    const IDENT_FRAME: [u8; 14] = [
        0x8d, 0x48, 0x40, 0xd6, 0x20, 0x2c, 0xc3, 0x71, 0xc3, 0x2c, 0xe0, 0x57, 0x60, 0x98,
    ];

    // airborne position squitter at 38000 ft
    const POSITION_FRAME: [u8; 14] = [
        0x8d, 0x40, 0x62, 0x1d, 0x58, 0xc3, 0x82, 0xd6, 0x90, 0xc8, 0xac, 0x28, 0x63, 0xa7,
    ];

    #[test]
    fn crc_check_value() {
        assert_eq!(CRC.checksum(b"123456789"), 0x54268);
    }

    #[test]
    fn known_frames_verify() {
        assert!(verify(&IDENT_FRAME));
        assert!(verify(&POSITION_FRAME));
    }

    #[test]
    fn corruption_fails_verification() {
        let mut frame = IDENT_FRAME;
        frame[6] ^= 0x40;
        assert!(!verify(&frame));
    }

    #[test]
    fn single_bit_errors_are_repaired() {
        let mut frame = IDENT_FRAME;
        frame[9] ^= 0x02;
        assert!(!verify(&frame));

        assert!(repair(&mut frame));
        assert_eq!(frame, IDENT_FRAME);
    }

    #[test]
    fn identification_decodes() {
        assert_eq!(downlink_format(&IDENT_FRAME), 17);
        assert_eq!(icao(&IDENT_FRAME), Some([0x48, 0x40, 0xd6]));
        assert_eq!(callsign(&IDENT_FRAME).as_deref(), Some("KLM1023"));
        assert_eq!(altitude_ft(&IDENT_FRAME), None);
    }

    #[test]
    fn position_decodes_altitude() {
        assert_eq!(icao(&POSITION_FRAME), Some([0x40, 0x62, 0x1d]));
        assert_eq!(callsign(&POSITION_FRAME), None);
        assert_eq!(altitude_ft(&POSITION_FRAME), Some(38000));
    }
}
