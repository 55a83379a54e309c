//! Response correlation under concurrency, driven by a scripted server that
//! controls exactly when and in which order replies go out.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use uni_rpc::config::{ClientConfig, ServerConfig};
use uni_rpc::core::codec::{FormatCodec, PacketCodec};
use uni_rpc::core::packet::Packet;
use uni_rpc::core::value::Value;
use uni_rpc::error::{HandlerError, ProtocolError};
use uni_rpc::protocol::handshake::ServerHello;
use uni_rpc::protocol::{HANDSHAKE_FINISH, HANDSHAKE_INIT};
use uni_rpc::service::{FireOptions, RpcClient, RpcServer};
use uni_rpc::transport::{memory, Channel, Connection, Socket, SocketEvent};

/// Plaintext server end that answers only what the test tells it to
struct Scripted {
    socket: Arc<dyn Socket>,
    events: mpsc::UnboundedReceiver<SocketEvent>,
    codec: FormatCodec,
}

impl Scripted {
    fn new(connection: Connection) -> Self {
        Self {
            socket: connection.socket,
            events: connection.events,
            codec: FormatCodec::default(),
        }
    }

    async fn next_request(&mut self) -> Packet {
        loop {
            match self.events.recv().await {
                Some(SocketEvent::Frame {
                    channel: Channel::Request,
                    payload,
                }) => return self.codec.decode(&payload).unwrap(),
                Some(SocketEvent::Disconnected) | None => panic!("client went away"),
                Some(_) => continue,
            }
        }
    }

    fn reply(&self, request: &Packet, value: Value) {
        let mut response = Packet::respond_to(&request.id);
        response.set_result(value);
        let bytes = Bytes::from(self.codec.encode(&response).unwrap());
        self.socket
            .emit(Channel::Reply(response.id.clone()), bytes)
            .unwrap();
    }

    async fn handshake(&mut self) {
        let init = self.next_request().await;
        assert_eq!(init.event_name(), Some(HANDSHAKE_INIT));
        let hello = ServerHello {
            name: "scripted".into(),
            address: "memory".into(),
            namespaces: BTreeMap::new(),
            use_crypto: false,
            public_key: None,
        };
        self.reply(&init, hello.to_value());

        let finish = self.next_request().await;
        assert_eq!(finish.event_name(), Some(HANDSHAKE_FINISH));
        self.reply(&finish, Value::Bool(true));
    }
}

fn plaintext_client(connection: Connection) -> RpcClient {
    let config = ClientConfig {
        use_crypto: false,
        ..ClientConfig::default()
    };
    RpcClient::connect(connection, config).unwrap()
}

async fn scripted_pair() -> (RpcClient, Scripted) {
    let (client_end, server_end) = memory::pair("scripted");
    let mut server = Scripted::new(server_end);
    let client = plaintext_client(client_end);
    server.handshake().await;
    client.ready().await.unwrap();
    (client, server)
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (client, mut server) = scripted_pair().await;

    let calls: Vec<_> = (0..3)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.fire("echo", vec![Value::Int(i)]).await })
        })
        .collect();

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(server.next_request().await);
    }
    for request in requests.iter().rev() {
        server.reply(request, request.data[0].clone());
    }

    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap().unwrap());
    }
    assert_eq!(results, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
}

#[tokio::test]
async fn test_late_response_after_timeout_is_dropped() {
    let (client, mut server) = scripted_pair().await;

    let caller = client.clone();
    let slow = tokio::spawn(async move {
        let options = FireOptions::default().timeout(Duration::from_millis(50));
        caller.fire_with("slow", vec![], options).await
    });

    let request = server.next_request().await;
    let err = slow.await.unwrap().unwrap_err();
    match err {
        ProtocolError::RequestTimeout { event, timeout } => {
            assert_eq!(event, "slow");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("Expected RequestTimeout, got {other:?}"),
    }

    // Nobody is waiting for this one any more
    server.reply(&request, Value::from("too late"));

    let caller = client.clone();
    let next = tokio::spawn(async move { caller.fire("echo", vec![Value::Int(7)]).await });
    let request = server.next_request().await;
    server.reply(&request, Value::Int(7));
    assert_eq!(next.await.unwrap().unwrap(), Value::Int(7));

    let snapshot = client.metrics().snapshot();
    assert_eq!(snapshot.requests_timed_out, 1);
}

#[tokio::test]
async fn test_meta_cannot_override_event_name() {
    let (client, mut server) = scripted_pair().await;

    let caller = client.clone();
    let call = tokio::spawn(async move {
        let options = FireOptions::default()
            .meta("eventName", "hijacked")
            .meta("tenant", "acme");
        caller.fire_with("real", vec![], options).await
    });

    let request = server.next_request().await;
    assert_eq!(request.event_name(), Some("real"));
    assert_eq!(request.meta.get("tenant"), Some(&Value::from("acme")));
    server.reply(&request, Value::Null);
    assert_eq!(call.await.unwrap().unwrap(), Value::Null);
}

#[tokio::test]
async fn test_many_concurrent_calls_on_one_connection() {
    let server = RpcServer::new(ServerConfig {
        use_crypto: false,
        ..ServerConfig::default()
    })
    .unwrap();
    server
        .register_async("double", None, |_, args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, HandlerError>(Value::Int(n * 2))
        })
        .await
        .unwrap();

    let (client_end, server_end) = memory::pair("busy");
    let serving = server.clone();
    tokio::spawn(async move { serving.handle_connection(server_end).await });
    let client = plaintext_client(client_end);
    client.ready().await.unwrap();

    let calls: Vec<_> = (0..100)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { (i, client.fire("double", vec![Value::Int(i)]).await) })
        })
        .collect();

    for call in calls {
        let (i, result) = call.await.unwrap();
        assert_eq!(result.unwrap(), Value::Int(i * 2));
    }
    assert_eq!(server.metrics().snapshot().requests_dispatched, 102);
}
