//! # Core Protocol Components
//!
//! The packet model, the value domain, and the codec boundary.
//!
//! ## Components
//! - **Value**: dynamically typed arguments and results
//! - **Packet**: id, type, direction, meta and positional data
//! - **Serialization**: bincode / JSON / MessagePack encodings
//! - **Codec**: the `PacketCodec` contract the engine encodes through
//!
//! ## Pipeline
//! ```text
//! send:    Packet -> codec.encode -> [cipher] -> transport
//! receive: transport -> [decipher] -> codec.decode -> Packet
//! ```

pub mod codec;
pub mod packet;
pub mod serialization;
pub mod value;
