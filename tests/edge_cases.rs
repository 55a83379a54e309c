#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge cases: registration conflicts, failing and panicking handlers,
//! argument schemas, middleware short-circuits and malformed frames.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use uni_rpc::config::{ClientConfig, ServerConfig};
use uni_rpc::core::codec::{FormatCodec, PacketCodec};
use uni_rpc::core::packet::Packet;
use uni_rpc::core::value::{Value, ValueKind};
use uni_rpc::error::{ErrorCode, HandlerError, ProtocolError};
use uni_rpc::protocol::formatter::{ArgSchema, ArgSpec};
use uni_rpc::protocol::middleware::Step;
use uni_rpc::protocol::HANDSHAKE_INIT;
use uni_rpc::service::{RpcClient, RpcServer};
use uni_rpc::transport::{memory, Channel, Socket, SocketEvent};

fn plaintext_server() -> RpcServer {
    RpcServer::new(ServerConfig {
        use_crypto: false,
        ..ServerConfig::default()
    })
    .unwrap()
}

fn attach(server: &RpcServer) -> RpcClient {
    let (client_end, server_end) = memory::pair(format!("edge-{}", uni_rpc::utils::id::packet_id()));
    let serving = server.clone();
    tokio::spawn(async move { serving.handle_connection(server_end).await });
    let config = ClientConfig {
        use_crypto: false,
        default_timeout: Duration::from_secs(2),
        ..ClientConfig::default()
    };
    RpcClient::connect(client_end, config).unwrap()
}

fn remote_code(result: uni_rpc::error::Result<Value>) -> ErrorCode {
    match result {
        Err(ProtocolError::Remote { code, .. }) => code,
        other => panic!("Expected a remote error, got {other:?}"),
    }
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[tokio::test]
async fn test_duplicate_registration_keeps_first() {
    let server = plaintext_server();
    server
        .register("ping", None, |_, _| Ok(Value::from("first")))
        .await
        .unwrap();
    let err = server
        .register("ping", None, |_, _| Ok(Value::from("second")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::DuplicateRegistration(ref name) if name == "ping"));

    let client = attach(&server);
    client.ready().await.unwrap();
    assert_eq!(
        client.fire("ping", vec![]).await.unwrap(),
        Value::from("first")
    );
}

#[tokio::test]
async fn test_handshake_events_are_reserved() {
    let server = plaintext_server();
    let err = server
        .register(HANDSHAKE_INIT, None, |_, _| Ok(Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::DuplicateRegistration(_)));
    assert_eq!(server.registered_events().len(), 4);
}

#[tokio::test]
async fn test_namespace_registered_twice() {
    let server = plaintext_server();
    let users = server.register_namespace("users").unwrap();
    users
        .register("get", None, |_, _| Ok(Value::Null))
        .await
        .unwrap();

    let err = server.register_namespace("users").unwrap_err();
    assert!(matches!(err, ProtocolError::NamespaceAlreadyRegistered(ref ns) if ns == "users"));
    assert_eq!(err.code(), Some(ErrorCode::NamespaceAlreadyRegistered));

    // A failed method registration is not advertised
    assert!(users
        .register("get", None, |_, _| Ok(Value::Null))
        .await
        .is_err());
    assert_eq!(
        server.info().namespaces.get("users"),
        Some(&vec!["get".to_string()])
    );
}

#[tokio::test]
async fn test_on_register_can_skip_and_rename() {
    let server = plaintext_server();
    server.pipeline().on_register.add_sync(|mut registration| {
        if registration.event_name.starts_with("internal.") {
            return Step::Break(None);
        }
        registration.event_name = format!("v1.{}", registration.event_name);
        Step::Continue(registration)
    });

    server
        .register("internal.debug", None, |_, _| Ok(Value::Null))
        .await
        .unwrap();
    server
        .register("status", None, |_, _| Ok(Value::from("ok")))
        .await
        .unwrap();

    let events = server.registered_events();
    assert!(events.contains(&"v1.status".to_string()));
    assert!(!events.iter().any(|e| e.contains("internal")));
}

#[tokio::test]
async fn test_namespace_advertises_renamed_methods() {
    let server = plaintext_server();
    server.pipeline().on_register.add_sync(|mut registration| {
        match registration.event_name.as_str() {
            "users::get" => registration.event_name = "users::get_v2".into(),
            "users::legacy" => registration.event_name = "legacy".into(),
            _ => {}
        }
        Step::Continue(registration)
    });

    let users = server.register_namespace("users").unwrap();
    users
        .register("get", None, |_, _| Ok(Value::from("v2")))
        .await
        .unwrap();
    users
        .register("legacy", None, |_, _| Ok(Value::Null))
        .await
        .unwrap();

    assert_eq!(
        server.info().namespaces.get("users"),
        Some(&vec!["get_v2".to_string()])
    );
    assert!(server.registered_events().contains(&"legacy".to_string()));

    let client = attach(&server);
    client.ready().await.unwrap();
    let proxy = client.namespace("users").unwrap();
    assert_eq!(proxy.methods(), vec!["get_v2".to_string()]);
    assert_eq!(proxy.call("get_v2", vec![]).await.unwrap(), Value::from("v2"));
}

// ============================================================================
// HANDLER FAILURES
// ============================================================================

#[tokio::test]
async fn test_panicking_handler_becomes_error_response() {
    let server = plaintext_server();
    server
        .register("explode", None, |_, _| panic!("kaboom"))
        .await
        .unwrap();
    server
        .register("ping", None, |_, _| Ok(Value::from("pong")))
        .await
        .unwrap();

    let client = attach(&server);
    client.ready().await.unwrap();

    match client.fire("explode", vec![]).await {
        Err(ProtocolError::Remote { code, message }) => {
            assert_eq!(code, ErrorCode::UnknownError);
            assert!(message.contains("kaboom"));
        }
        other => panic!("Expected a remote error, got {other:?}"),
    }

    // The connection survives the panic
    assert_eq!(
        client.fire("ping", vec![]).await.unwrap(),
        Value::from("pong")
    );
    assert_eq!(server.metrics().snapshot().handler_errors, 1);
}

#[tokio::test]
async fn test_async_handler_error() {
    let server = plaintext_server();
    server
        .register_async("lookup", None, |_, _| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err::<Value, HandlerError>("record not found".into())
        })
        .await
        .unwrap();

    let client = attach(&server);
    client.ready().await.unwrap();
    assert_eq!(
        remote_code(client.fire("lookup", vec![]).await),
        ErrorCode::UnknownError
    );
}

// ============================================================================
// ARGUMENT SCHEMAS
// ============================================================================

#[tokio::test]
async fn test_schema_defaults_formats_and_rejects() {
    let schema = ArgSchema::new()
        .arg(ArgSpec::new("name").kind(ValueKind::Str).required().format(
            |v| async move {
                match v {
                    Value::Str(s) => Ok(Value::Str(s.trim().to_uppercase())),
                    other => Err(format!("cannot format {other}")),
                }
            },
        ))
        .arg(
            ArgSpec::new("times")
                .default_value(1)
                .kind(ValueKind::Int)
                .validate(|v| async move { v.as_i64().is_some_and(|n| n > 0) }),
        );

    let server = plaintext_server();
    server
        .register("shout", Some(schema), |_, args| {
            let name = args[0].as_str().unwrap_or_default().to_string();
            let times = args[1].as_i64().unwrap_or(0) as usize;
            Ok(Value::Str(name.repeat(times)))
        })
        .await
        .unwrap();

    let client = attach(&server);
    client.ready().await.unwrap();

    assert_eq!(
        client.fire("shout", vec![Value::from(" hey ")]).await.unwrap(),
        Value::from("HEY")
    );
    assert_eq!(
        client
            .fire("shout", vec![Value::from("a"), Value::Int(3)])
            .await
            .unwrap(),
        Value::from("AAA")
    );

    // Missing required argument
    match client.fire("shout", vec![]).await {
        Err(ProtocolError::Remote { code, message }) => {
            assert_eq!(code, ErrorCode::InvalidArgument);
            assert!(message.contains("name"));
        }
        other => panic!("Expected InvalidArgument, got {other:?}"),
    }

    // Wrong type and failed validation
    assert_eq!(
        remote_code(client.fire("shout", vec![Value::Int(1)]).await),
        ErrorCode::InvalidArgument
    );
    assert_eq!(
        remote_code(
            client
                .fire("shout", vec![Value::from("a"), Value::Int(-1)])
                .await
        ),
        ErrorCode::InvalidArgument
    );
}

// ============================================================================
// MIDDLEWARE SHORT-CIRCUITS
// ============================================================================

#[tokio::test]
async fn test_empty_event_name_is_rejected_locally() {
    let server = plaintext_server();
    let client = attach(&server);
    client.ready().await.unwrap();

    let before = client.metrics().snapshot().requests_fired;
    let err = client.fire("", vec![]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::RequestNoEvent));
    assert_eq!(err.code(), Some(ErrorCode::RequestNoEvent));
    assert_eq!(client.metrics().snapshot().requests_fired, before);
}

#[tokio::test]
async fn test_on_receive_break_without_response() {
    let server = plaintext_server();
    server.pipeline().on_receive.add_sync(|ctx| {
        if ctx.request.event_name() == Some("blackhole") {
            Step::Break(None)
        } else {
            Step::Continue(ctx)
        }
    });
    let client = attach(&server);
    client.ready().await.unwrap();

    // A bare response: no handler ran, the result slot is empty
    assert_eq!(client.fire("blackhole", vec![]).await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_after_fire_transforms_results() {
    let server = plaintext_server();
    server
        .register("answer", None, |_, _| Ok(Value::Int(41)))
        .await
        .unwrap();
    let client = attach(&server);
    client.ready().await.unwrap();

    client.pipeline().after_fire.add_sync(|value| match value {
        Value::Int(n) => Step::Continue(Value::Int(n + 1)),
        other => Step::Continue(other),
    });
    assert_eq!(client.fire("answer", vec![]).await.unwrap(), Value::Int(42));
}

#[tokio::test]
async fn test_on_connection_break_rejects_client() {
    let server = plaintext_server();
    server
        .pipeline()
        .on_connection
        .add_sync(|_| Step::Break(None));
    let client = attach(&server);

    assert!(client.ready().await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.client_ids().is_empty());
}

#[tokio::test]
async fn test_middleware_installer_shapes() {
    struct Stamp;
    impl uni_rpc::protocol::middleware::Middleware<RpcClient> for Stamp {
        fn install(self: Box<Self>, client: &RpcClient) -> uni_rpc::error::Result<()> {
            client.pipeline().before_fire.add_sync(|mut packet| {
                packet.add_meta("stamped", true);
                Step::Continue(packet)
            });
            Ok(())
        }
    }

    let server = plaintext_server();
    server
        .register("stamped", None, |ctx, _| {
            Ok(ctx.meta.get("stamped").cloned().unwrap_or_default())
        })
        .await
        .unwrap();

    let client = attach(&server);
    // Installed after the handshake so its replies are not rewritten
    client.ready().await.unwrap();
    client.use_middleware(Stamp).unwrap();
    client
        .use_fn(|c: &RpcClient| {
            c.pipeline()
                .after_fire
                .add_sync(|v| Step::Continue(Value::List(vec![v])));
            Ok(())
        })
        .unwrap();

    assert_eq!(
        client.fire("stamped", vec![]).await.unwrap(),
        Value::List(vec![Value::Bool(true)])
    );
}

// ============================================================================
// MALFORMED FRAMES
// ============================================================================

/// Send a plaintext INIT and expect the server to answer it
async fn assert_still_serving(
    socket: &Arc<dyn Socket>,
    events: &mut UnboundedReceiver<SocketEvent>,
) {
    let codec = FormatCodec::default();
    let init = Packet::request(HANDSHAKE_INIT, vec![Value::Bytes(Vec::new())]);
    socket
        .emit(Channel::Request, Bytes::from(codec.encode(&init).unwrap()))
        .unwrap();

    let reply = loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
        {
            Some(SocketEvent::Frame {
                channel: Channel::Reply(id),
                payload,
            }) => {
                assert_eq!(id, init.id);
                break codec.decode(&payload).unwrap();
            }
            Some(SocketEvent::Connected) => continue,
            other => panic!("Unexpected event {other:?}"),
        }
    };
    assert!(!reply.is_error());
    assert!(!socket.is_closed());
}

#[tokio::test]
async fn test_undecodable_frame_is_dropped() {
    let server = plaintext_server();
    let (client_end, server_end) = memory::pair("raw");
    let serving = server.clone();
    tokio::spawn(async move { serving.handle_connection(server_end).await });

    let socket = Arc::clone(&client_end.socket);
    let mut events = client_end.events;
    socket
        .emit(Channel::Request, Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
        .unwrap();

    assert_still_serving(&socket, &mut events).await;
}

#[tokio::test]
async fn test_deeply_nested_frame_is_dropped() {
    const MARKER: i64 = 0x0123_4567_89AB_CDEF;

    let server = plaintext_server();
    let (client_end, server_end) = memory::pair("deep");
    let serving = server.clone();
    tokio::spawn(async move { serving.handle_connection(server_end).await });

    // A valid request whose only argument is swapped for 100k nested lists
    let template = FormatCodec::default()
        .encode(&Packet::request("deep", vec![Value::Int(MARKER)]))
        .unwrap();
    let marker = bincode::serialize(&Value::Int(MARKER)).unwrap();
    let null = bincode::serialize(&Value::Null).unwrap();
    let wrapped = bincode::serialize(&Value::List(vec![Value::Null])).unwrap();
    let level = &wrapped[..wrapped.len() - null.len()];

    let at = template
        .windows(marker.len())
        .position(|w| w == marker.as_slice())
        .expect("argument bytes present");
    let mut frame = template[..at].to_vec();
    frame.extend_from_slice(&level.repeat(100_000));
    frame.extend_from_slice(&null);
    frame.extend_from_slice(&template[at + marker.len()..]);

    let socket = Arc::clone(&client_end.socket);
    let mut events = client_end.events;
    socket.emit(Channel::Request, Bytes::from(frame)).unwrap();

    assert_still_serving(&socket, &mut events).await;
    assert_eq!(server.metrics().snapshot().requests_dispatched, 1);
}
