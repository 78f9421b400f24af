//! Frame codec.
//!
//! One frame on the wire is a 12-byte big-endian header followed by the
//! payload:
//!
//! ```plain
//! u32 signature (0xDECAFBAD) | u32 checksum(payload) | u32 length | payload
//! ```
//!
//! Decoding works incrementally from a growing receive buffer: the caller
//! appends whatever it read from the transport and calls [`try_decode`]
//! until it reports that more data is needed, trimming the buffer by the
//! number of bytes consumed after each decoded frame. A wrong signature or
//! checksum means the stream is desynchronized; there is no resynchronization
//! strategy, the connection must be torn down.

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

use crate::checksum::checksum;

/// Magic constant identifying the start of a frame.
pub const SIGNATURE: u32 = 0xDECAFBAD;

/// Length of the frame header in bytes.
pub const HEADER_LENGTH: usize = 12;

/// Fatal framing errors.
///
/// Either of these indicates a desynchronized stream and must terminate the
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid frame signature: 0x{signature:08x}")]
    InvalidSignature { signature: u32 },

    #[error("frame checksum mismatch: header 0x{header:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { header: u32, computed: u32 },
}

/// A successfully decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    /// The frame payload, i.e. an encoded command envelope.
    pub payload: Bytes,

    /// Total number of bytes consumed from the receive buffer, header
    /// included.
    pub consumed: usize,
}

/// Encodes `payload` into a single frame.
pub fn encode(payload: &[u8]) -> Bytes {
    let mut buffer = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    encode_into(payload, &mut buffer);
    buffer.freeze()
}

/// Encodes `payload` as a frame into `buffer`.
pub fn encode_into<B: BufMut>(payload: &[u8], buffer: &mut B) {
    buffer.put_u32(SIGNATURE);
    buffer.put_u32(checksum(payload));
    buffer.put_u32(payload.len() as u32);
    buffer.put_slice(payload);
}

/// Tries to decode one frame from the start of `buffer`.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete frame yet. On
/// success the caller must advance its buffer by
/// [`consumed`][DecodedFrame::consumed] bytes.
pub fn try_decode(buffer: &[u8]) -> Result<Option<DecodedFrame>, FrameError> {
    if buffer.len() < HEADER_LENGTH {
        return Ok(None);
    }

    let mut header = &buffer[..HEADER_LENGTH];
    let signature = header.get_u32();
    let header_checksum = header.get_u32();
    let length = header.get_u32() as usize;

    if signature != SIGNATURE {
        return Err(FrameError::InvalidSignature { signature });
    }

    if buffer.len() < HEADER_LENGTH + length {
        return Ok(None);
    }

    let payload = &buffer[HEADER_LENGTH..HEADER_LENGTH + length];

    let computed = checksum(payload);
    if computed != header_checksum {
        return Err(FrameError::ChecksumMismatch {
            header: header_checksum,
            computed,
        });
    }

    Ok(Some(DecodedFrame {
        payload: Bytes::copy_from_slice(payload),
        consumed: HEADER_LENGTH + length,
    }))
}

#[cfg(test)]
mod tests {
    use super::{
        DecodedFrame,
        FrameError,
        HEADER_LENGTH,
        encode,
        try_decode,
    };

    fn assert_round_trip(payload: &[u8]) {
        let encoded = encode(payload);
        assert_eq!(encoded.len(), HEADER_LENGTH + payload.len());

        let decoded = try_decode(&encoded).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], payload);
        assert_eq!(decoded.consumed, encoded.len());
    }

    #[test]
    fn round_trip() {
        assert_round_trip(b"");
        assert_round_trip(b"xyz");
        assert_round_trip(b"a slightly longer payload, but nothing fancy");

        let big: Vec<u8> = (0..0x10000).map(|i| (i % 251) as u8).collect();
        assert_round_trip(&big);
    }

    #[test]
    fn needs_more_data_until_complete() {
        let encoded = encode(b"partial delivery");

        for take in 0..encoded.len() {
            assert_eq!(try_decode(&encoded[..take]).unwrap(), None, "take={take}");
        }

        assert!(try_decode(&encoded).unwrap().is_some());
    }

    #[test]
    fn decodes_only_the_first_frame() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode(b"first"));
        stream.extend_from_slice(&encode(b"second"));

        let DecodedFrame { payload, consumed } = try_decode(&stream).unwrap().unwrap();
        assert_eq!(&payload[..], b"first");

        let DecodedFrame { payload, .. } = try_decode(&stream[consumed..]).unwrap().unwrap();
        assert_eq!(&payload[..], b"second");
    }

    #[test]
    fn corrupted_payload_is_fatal() {
        let payload = b"do not tamper with this payload";

        for i in 0..payload.len() {
            let mut encoded = encode(payload).to_vec();
            encoded[HEADER_LENGTH + i] ^= 0x80;

            match try_decode(&encoded) {
                Err(FrameError::ChecksumMismatch { .. }) => {}
                other => panic!("expected checksum mismatch at byte {i}, got {other:?}"),
            }
        }
    }

    #[test]
    fn bad_signature_is_fatal() {
        let mut encoded = encode(b"payload").to_vec();
        encoded[0] = 0x00;

        assert!(matches!(
            try_decode(&encoded),
            Err(FrameError::InvalidSignature { .. })
        ));
    }
}
