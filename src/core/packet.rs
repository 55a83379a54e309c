//! The wire packet.
//!
//! A packet is the unit that crosses the transport: an id, a direction, a
//! type, a metadata map and a positional data list. A RESPOND packet always
//! carries the id of the REQUEST it answers.

use serde::{Deserialize, Serialize};

use crate::core::value::{Map, Value};
use crate::error::ErrorCode;
use crate::protocol::{META_CLIENT_ID, META_ERROR, META_ERROR_CODE, META_EVENT_NAME};
use crate::utils::id;

/// Packet metadata, keyed by name
pub type Meta = Map;

/// Whether a packet asks or answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    Request,
    Respond,
}

/// Which side produced a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Client,
    Server,
}

/// Protocol packet (`PacketRaw` on the codec boundary)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PacketType,
    pub from: Side,
    pub meta: Meta,
    pub data: Vec<Value>,
}

impl Packet {
    /// New packet with a freshly generated id
    pub fn new(kind: PacketType, from: Side) -> Self {
        Self::with_id(id::packet_id(), kind, from)
    }

    pub fn with_id(id: impl Into<String>, kind: PacketType, from: Side) -> Self {
        Self {
            id: id.into(),
            kind,
            from,
            meta: Meta::new(),
            data: Vec::new(),
        }
    }

    /// Client request for `event_name` with positional `args`
    pub fn request(event_name: &str, args: Vec<Value>) -> Self {
        let mut packet = Self::new(PacketType::Request, Side::Client);
        packet.add_meta(META_EVENT_NAME, event_name);
        packet.data = args;
        packet
    }

    /// Empty server response answering `request_id`
    pub fn respond_to(request_id: &str) -> Self {
        Self::with_id(request_id, PacketType::Respond, Side::Server)
    }

    pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<Value> {
        self.meta.remove(key)
    }

    pub fn set_data(&mut self, data: Vec<Value>) {
        self.data = data;
    }

    pub fn event_name(&self) -> Option<&str> {
        self.meta.get(META_EVENT_NAME).and_then(Value::as_str)
    }

    pub fn client_id(&self) -> Option<&str> {
        self.meta.get(META_CLIENT_ID).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.meta.get(META_ERROR).is_some_and(Value::is_truthy)
    }

    /// Raw error code carried by an error response
    pub fn error_code(&self) -> Option<i64> {
        self.meta.get(META_ERROR_CODE).and_then(Value::as_i64)
    }

    /// Mark this packet as an error response with a single message payload
    pub fn set_error(&mut self, code: ErrorCode, message: impl Into<String>) {
        self.add_meta(META_ERROR, true);
        self.add_meta(META_ERROR_CODE, code.as_i64());
        self.data = vec![Value::Str(message.into())];
    }

    /// Set the single return value of a response
    pub fn set_result(&mut self, value: Value) {
        self.data = vec![value];
    }

    /// The single return value slot (`data[0]`), `Null` if absent
    pub fn result(&self) -> Value {
        self.data.first().cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_carries_event_name() {
        let packet = Packet::request("math::add", vec![2.into(), 3.into()]);
        assert_eq!(packet.kind, PacketType::Request);
        assert_eq!(packet.from, Side::Client);
        assert_eq!(packet.event_name(), Some("math::add"));
        assert_eq!(packet.data.len(), 2);
    }

    #[test]
    fn test_response_reuses_request_id() {
        let request = Packet::request("ping", vec![]);
        let response = Packet::respond_to(&request.id);
        assert_eq!(request.id, response.id);
        assert_eq!(response.kind, PacketType::Respond);
        assert_eq!(response.from, Side::Server);
    }

    #[test]
    fn test_error_marking() {
        let mut response = Packet::respond_to("abc");
        assert!(!response.is_error());
        response.set_error(ErrorCode::UnknownError, "boom");
        assert!(response.is_error());
        assert_eq!(response.error_code(), Some(4));
        assert_eq!(response.result(), Value::Str("boom".into()));
    }

    #[test]
    fn test_fresh_ids_differ() {
        let a = Packet::new(PacketType::Request, Side::Client);
        let b = Packet::new(PacketType::Request, Side::Client);
        assert_ne!(a.id, b.id);
    }
}
