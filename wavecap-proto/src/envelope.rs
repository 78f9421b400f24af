//! Command envelope codec.
//!
//! The payload of every frame is one envelope: a command name, the sender's
//! sequence number and an opaque content blob. The layout is fixed and
//! big-endian:
//!
//! ```plain
//! u16 command length | command (UTF-8) | u32 seqno | content (rest)
//! ```
//!
//! Sequence numbers are issued by the sending engine and increment by one
//! per envelope; `0` marks unsolicited reports that don't answer a request.

use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

/// Maximum length of a command name in bytes.
pub const MAX_COMMAND_LENGTH: usize = u16::MAX as usize;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope truncated: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("command name is not valid UTF-8")]
    CommandNotUtf8,

    #[error("command name too long: {length} bytes")]
    CommandTooLong { length: usize },
}

/// One request, response or report unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Case-sensitive command name, e.g. `PING` or `KDSOPENSOURCE`.
    pub command: String,

    /// Sequence number issued by the sender; echoed by correlated replies.
    pub seqno: u32,

    /// Command-specific serialized payload.
    pub content: Bytes,
}

impl Envelope {
    pub fn new(command: impl Into<String>, seqno: u32, content: impl Into<Bytes>) -> Self {
        Self {
            command: command.into(),
            seqno,
            content: content.into(),
        }
    }

    /// Encodes the envelope into frame-payload bytes.
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        if self.command.len() > MAX_COMMAND_LENGTH {
            return Err(EnvelopeError::CommandTooLong {
                length: self.command.len(),
            });
        }

        let mut buffer =
            BytesMut::with_capacity(2 + self.command.len() + 4 + self.content.len());
        buffer.put_u16(self.command.len() as u16);
        buffer.put_slice(self.command.as_bytes());
        buffer.put_u32(self.seqno);
        buffer.put_slice(&self.content);
        Ok(buffer.freeze())
    }

    /// Decodes an envelope from frame-payload bytes.
    pub fn decode(mut buffer: Bytes) -> Result<Self, EnvelopeError> {
        if buffer.remaining() < 2 {
            return Err(EnvelopeError::Truncated {
                needed: 2 - buffer.remaining(),
            });
        }
        let command_length = buffer.get_u16() as usize;

        if buffer.remaining() < command_length + 4 {
            return Err(EnvelopeError::Truncated {
                needed: command_length + 4 - buffer.remaining(),
            });
        }

        let command = buffer.split_to(command_length);
        let command = std::str::from_utf8(&command)
            .map_err(|_| EnvelopeError::CommandNotUtf8)?
            .to_owned();

        let seqno = buffer.get_u32();

        Ok(Self {
            command,
            seqno,
            content: buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{
        Envelope,
        EnvelopeError,
    };

    #[test]
    fn round_trip() {
        let envelope = Envelope::new("KDSDATAREPORT", 42, Bytes::from_static(b"{\"cps\": 3}"));
        let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trip_empty_content() {
        let envelope = Envelope::new("PING", 0, Bytes::new());
        let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_envelope_is_an_error() {
        let encoded = Envelope::new("SHUTDOWN", 7, Bytes::new())
            .encode()
            .unwrap();

        for take in 0..encoded.len() {
            assert!(matches!(
                Envelope::decode(encoded.slice(..take)),
                Err(EnvelopeError::Truncated { .. }),
            ));
        }
    }
}
