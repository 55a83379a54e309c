//! # Serialization Formats
//!
//! Abstraction over the byte formats a packet can be encoded with.
//! Supports bincode (default), JSON (debugging/interop), and MessagePack (compact encoding).
//!
//! ## Features
//! - **Multiple formats**: Bincode, JSON, MessagePack, chosen per codec
//! - **Human-readable option**: JSON for debugging a live connection
//!
//! Both ends of a connection must be configured with the same format; frames
//! carry no format marker.
//!
//! ## Usage
//! ```rust
//! use uni_rpc::core::packet::Packet;
//! use uni_rpc::core::serialization::{MultiFormat, SerializationFormat};
//!
//! let packet = Packet::request("ping", vec![]);
//! let bytes = packet.serialize_format(SerializationFormat::MessagePack).unwrap();
//! let back = Packet::deserialize_format(&bytes, SerializationFormat::MessagePack).unwrap();
//! assert_eq!(packet, back);
//! ```

use serde::{Deserialize, Serialize};

use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
    /// Compact binary format (MessagePack, efficient)
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

/// Trait for types that support multiple serialization formats
pub trait MultiFormat: Serialize + for<'de> Deserialize<'de> + Sized {
    /// Serialize to bytes using the specified format
    fn serialize_format(&self, format: SerializationFormat) -> Result<Vec<u8>> {
        match format {
            SerializationFormat::Bincode => bincode::serialize(self)
                .map_err(|e| ProtocolError::SerializeError(e.to_string())),
            SerializationFormat::Json => {
                serde_json::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(self).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    /// Deserialize from bytes using the specified format
    fn deserialize_format(data: &[u8], format: SerializationFormat) -> Result<Self> {
        match format {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}

impl MultiFormat for Packet {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    const ALL_FORMATS: [SerializationFormat; 3] = [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ];

    #[test]
    fn test_format_names() {
        assert_eq!(SerializationFormat::Bincode.name(), "Bincode");
        assert_eq!(SerializationFormat::Json.name(), "JSON");
        assert_eq!(SerializationFormat::MessagePack.name(), "MessagePack");
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Bincode);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_non_finite_floats_survive_every_format() {
        let packet = Packet::request(
            "stats",
            vec![
                Value::Float(f64::INFINITY),
                Value::Float(f64::NEG_INFINITY),
                Value::Float(-0.25),
            ],
        );
        let nan = Packet::request("stats", vec![Value::Float(f64::NAN)]);

        for format in ALL_FORMATS {
            let bytes = packet.serialize_format(format).expect("serialize");
            let back = Packet::deserialize_format(&bytes, format).expect("deserialize");
            assert_eq!(back, packet, "{}", format.name());

            let bytes = nan.serialize_format(format).expect("serialize NaN");
            let back = Packet::deserialize_format(&bytes, format).expect("deserialize NaN");
            assert!(
                back.data[0].as_f64().is_some_and(f64::is_nan),
                "{} lost NaN",
                format.name()
            );
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_format_sizes() {
        let packet = Packet::request("math::add", vec![2.into(), 3.into()]);

        let bincode_size = packet
            .serialize_format(SerializationFormat::Bincode)
            .expect("bincode")
            .len();
        let json_size = packet
            .serialize_format(SerializationFormat::Json)
            .expect("json")
            .len();
        let msgpack_size = packet
            .serialize_format(SerializationFormat::MessagePack)
            .expect("msgpack")
            .len();

        println!("Bincode: {bincode_size} bytes");
        println!("JSON: {json_size} bytes");
        println!("MessagePack: {msgpack_size} bytes");

        // MessagePack should be more compact than JSON
        assert!(msgpack_size < json_size);
    }
}
