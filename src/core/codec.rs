//! Packet codec boundary.
//!
//! The engine never touches bytes directly: it hands a [`Packet`] to a
//! [`PacketCodec`] and gets bytes back (and the reverse on receipt).
//! Encryption is layered on top of the encoded bytes by
//! [`Envelope`](crate::service::secure::Envelope), never inside the codec.

use std::fmt;

use crate::core::packet::Packet;
use crate::core::serialization::{MultiFormat, SerializationFormat};
use crate::error::Result;

/// Encode/decode contract between packets and transport bytes.
///
/// Implementations must be mutual inverses over the whole value domain.
pub trait PacketCodec: Send + Sync + fmt::Debug {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Packet>;
}

/// Codec backed by one of the [`SerializationFormat`]s
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FormatCodec {
    format: SerializationFormat,
}

impl FormatCodec {
    pub fn new(format: SerializationFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> SerializationFormat {
        self.format
    }
}

impl PacketCodec for FormatCodec {
    fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        packet.serialize_format(self.format)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Packet> {
        Packet::deserialize_format(bytes, self.format)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_decode_garbage_fails_cleanly() {
        let codec = FormatCodec::default();
        let result = codec.decode(&[0xFF, 0x00, 0x13]);
        assert!(matches!(result, Err(ProtocolError::DeserializeError(_))));
    }

    #[test]
    fn test_encode_decode_preserves_packet() {
        let codec = FormatCodec::new(SerializationFormat::MessagePack);
        let mut packet = Packet::request("users::get", vec!["bob".into()]);
        packet.add_meta("clientId", "conn-1");
        let bytes = codec.encode(&packet).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), packet);
    }
}
