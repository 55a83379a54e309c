//! Integration tests for the packet serialization formats
//!
//! Bincode (default), JSON (human-readable, interop) and MessagePack
//! (compact) must all carry the same packet, including error responses.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::uninlined_format_args,
    clippy::expect_fun_call
)]

use std::time::Duration;

use uni_rpc::config::{ClientConfig, ServerConfig};
use uni_rpc::core::codec::{FormatCodec, PacketCodec};
use uni_rpc::core::packet::{Packet, PacketType, Side};
use uni_rpc::core::serialization::{MultiFormat, SerializationFormat};
use uni_rpc::core::value::{Map, Value};
use uni_rpc::error::ErrorCode;
use uni_rpc::service::{RpcClient, RpcServer};
use uni_rpc::transport::memory;

fn sample_request() -> Packet {
    let mut profile = Map::new();
    profile.insert("name".into(), Value::from("ada"));
    profile.insert("score".into(), Value::Float(99.5));
    profile.insert("tags".into(), Value::List(vec!["a".into(), "b".into()]));

    let mut packet = Packet::request(
        "users::update",
        vec![Value::Int(7), Value::Map(profile), Value::Bytes(vec![0, 1, 255])],
    );
    packet.add_meta("clientId", "mem-1");
    packet
}

#[test]
fn test_every_format_round_trips_a_request() {
    let packet = sample_request();
    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        let bytes = packet
            .serialize_format(format)
            .expect(&format!("Failed to serialize with {}", format.name()));
        let recovered = Packet::deserialize_format(&bytes, format).expect("Failed to deserialize");
        assert_eq!(recovered, packet, "{} changed the packet", format.name());
    }
}

#[test]
fn test_json_is_readable() {
    let bytes = sample_request()
        .serialize_format(SerializationFormat::Json)
        .unwrap();
    let json = std::str::from_utf8(&bytes).expect("Invalid UTF-8");
    assert!(json.contains("users::update"));
    assert!(json.contains("\"type\""));
}

#[test]
fn test_error_response_survives_encoding() {
    let mut response = Packet::respond_to("abc");
    response.set_error(ErrorCode::RespondNoEventHandler, "no handler");

    let codec = FormatCodec::new(SerializationFormat::MessagePack);
    let decoded = codec.decode(&codec.encode(&response).unwrap()).unwrap();

    assert_eq!(decoded.id, "abc");
    assert_eq!(decoded.kind, PacketType::Respond);
    assert_eq!(decoded.from, Side::Server);
    assert!(decoded.is_error());
    assert_eq!(decoded.error_code(), Some(3));
    assert_eq!(decoded.result(), Value::from("no handler"));
}

#[test]
fn test_formats_are_not_interchangeable() {
    let bytes = FormatCodec::new(SerializationFormat::Json)
        .encode(&sample_request())
        .unwrap();
    assert!(FormatCodec::new(SerializationFormat::Bincode)
        .decode(&bytes)
        .is_err());
}

#[tokio::test]
async fn test_engines_agree_on_messagepack() {
    let server = RpcServer::new(ServerConfig {
        use_crypto: true,
        serialization: SerializationFormat::MessagePack,
        ..ServerConfig::default()
    })
    .unwrap();
    server
        .register("echo", None, |_, args| Ok(Value::List(args)))
        .await
        .unwrap();

    let (client_end, server_end) = memory::pair("msgpack");
    let serving = server.clone();
    tokio::spawn(async move { serving.handle_connection(server_end).await });

    let client = RpcClient::connect(
        client_end,
        ClientConfig {
            serialization: SerializationFormat::MessagePack,
            default_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        },
    )
    .unwrap();
    client.ready().await.unwrap();

    let args = vec![Value::Float(1.25), Value::from("x"), Value::Null];
    assert_eq!(
        client.fire("echo", args.clone()).await.unwrap(),
        Value::List(args)
    );
}
