//! Integration tests for the Chorus signaling server
//!
//! Each test starts the full axum app on an ephemeral port with the in-process
//! media engine and in-memory session records, then drives it over WebSocket.
//!
//! Run with: cargo test -p chorus-server --test integration_tests

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chorus_protocol::{RoomId, ServerMessage};
use chorus_server::engine::{LocalEngine, TransportListenConfig};
use chorus_server::services::MemorySessionRecords;
use chorus_server::state::{AppState, Config};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        num_workers: 2,
        listen: TransportListenConfig {
            listen_ip: "127.0.0.1".parse().unwrap(),
            ..TransportListenConfig::default()
        },
        database_url: None,
    }
}

/// Test helper to start a test server
async fn start_test_server() -> TestServer {
    TestServer::start().await.expect("Failed to start test server")
}

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    state: AppState,
    records: Arc<MemorySessionRecords>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let records = Arc::new(MemorySessionRecords::new());
        let (router, state) = chorus_server::create_app_with(
            test_config(),
            Arc::new(LocalEngine::new()),
            records.clone(),
        )
        .await?;

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            state,
            records,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> TestClient {
        TestClient::connect(&self.ws_url())
            .await
            .expect("Failed to connect WebSocket")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A signaling client that correlates responses and buffers events
struct TestClient {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    events: VecDeque<Value>,
    next_request_id: u64,
}

impl TestClient {
    async fn connect(url: &str) -> anyhow::Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            write,
            read,
            events: VecDeque::new(),
            next_request_id: 1,
        })
    }

    async fn send_raw(&mut self, text: &str) {
        self.write
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    async fn next_frame(&mut self) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), self.read.next())
                .await
                .expect("Timeout waiting for frame")
                .expect("Connection closed")
                .expect("WebSocket error");

            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("Server sent invalid JSON");
            }
        }
    }

    /// Send a request and wait for the reply carrying its request id.
    /// Events arriving in between are kept for `next_event`.
    async fn request(&mut self, mut body: Value) -> Value {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        body["requestId"] = json!(request_id);
        self.send_raw(&body.to_string()).await;

        loop {
            let frame = self.next_frame().await;
            if frame["requestId"] == json!(request_id) {
                return frame;
            }
            self.events.push_back(frame);
        }
    }

    async fn ok(&mut self, body: Value) -> Value {
        let reply = self.request(body).await;
        assert_eq!(reply["type"], "response", "Request failed: {}", reply);
        reply["data"].clone()
    }

    /// Next event of the given type, skipping others
    async fn next_event(&mut self, event_type: &str) -> Value {
        while let Some(event) = self.events.pop_front() {
            if event["type"] == event_type {
                return event;
            }
        }
        loop {
            let frame = self.next_frame().await;
            if frame["type"] == event_type {
                return frame;
            }
        }
    }

    async fn join(&mut self, room: &str, peer: &str) -> Value {
        self.ok(json!({
            "type": "joinRoom",
            "roomId": room,
            "peerId": peer,
            "rtpCapabilities": opus_capabilities(),
        }))
        .await
    }
}

fn opus_capabilities() -> Value {
    json!({
        "codecs": [{
            "kind": "audio",
            "mimeType": "audio/opus",
            "preferredPayloadType": 111,
            "clockRate": 48000,
            "channels": 2
        }]
    })
}

fn opus_parameters() -> Value {
    json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2,
            "parameters": { "minptime": 10, "useinbandfec": 1 }
        }],
        "encodings": [{ "ssrc": 1111 }]
    })
}

fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB:CC" }]
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_health_check() {
    let (router, _state) = chorus_server::create_app_with(
        test_config(),
        Arc::new(LocalEngine::new()),
        Arc::new(MemorySessionRecords::new()),
    )
    .await
    .unwrap();

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"OK");
}

#[tokio::test]
async fn test_full_room_lifecycle() {
    let server = start_test_server().await;
    let room = RoomId::from("r1");
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    // Alice joins an empty room
    let joined = alice.join("r1", "A").await;
    assert_eq!(joined["peers"], json!([]));
    assert!(joined["sendTransport"]["id"].is_string());
    assert!(joined["receiveTransport"]["iceParameters"]["usernameFragment"].is_string());
    assert_eq!(
        joined["routerRtpCapabilities"]["codecs"][0]["mimeType"],
        "audio/opus"
    );
    let alice_send = joined["sendTransport"]["id"].clone();

    // Bob joins and Alice is told
    let joined = bob.join("r1", "B").await;
    assert_eq!(joined["peers"], json!(["A"]));
    let bob_receive = joined["receiveTransport"]["id"].clone();

    let event = alice.next_event("newPeer").await;
    assert_eq!(event["peerId"], "B");

    // Alice connects and publishes
    let data = alice
        .ok(json!({
            "type": "connectTransport",
            "transportId": alice_send,
            "dtlsParameters": dtls_parameters(),
        }))
        .await;
    assert_eq!(data, json!({ "connected": true }));

    let data = alice
        .ok(json!({
            "type": "produce",
            "transportId": alice_send,
            "kind": "audio",
            "rtpParameters": opus_parameters(),
        }))
        .await;
    let producer_id = data["id"].clone();

    let event = bob.next_event("newProducer").await;
    assert_eq!(event["producerId"], producer_id);
    assert_eq!(event["peerId"], "A");
    assert_eq!(event["kind"], "audio");

    // Bob subscribes; the consumer starts paused
    let consumer = bob
        .ok(json!({
            "type": "consume",
            "roomId": "r1",
            "transportId": bob_receive,
            "producerId": producer_id,
            "rtpCapabilities": opus_capabilities(),
        }))
        .await;
    assert_eq!(consumer["paused"], true);
    assert_eq!(consumer["producerId"], producer_id);
    assert_eq!(consumer["kind"], "audio");

    let data = bob
        .ok(json!({ "type": "resumeConsumer", "consumerId": consumer["id"] }))
        .await;
    assert_eq!(data, json!({ "resumed": true }));

    // Alice drops her connection
    drop(alice);

    let event = bob.next_event("consumerClosed").await;
    assert_eq!(event["consumerId"], consumer["id"]);
    let event = bob.next_event("peerLeft").await;
    assert_eq!(event["peerId"], "A");

    assert!(server.state.rooms.has_router(&room).await);
    assert!(server.state.rooms.producers().is_empty().await);
    assert!(server.state.rooms.consumers().is_empty().await);
    assert_eq!(server.state.rooms.transports().len().await, 2);

    // Bob leaves and the room goes away
    let data = bob.ok(json!({ "type": "leaveRoom", "roomId": "r1" })).await;
    assert_eq!(data, json!({ "left": true }));

    assert!(!server.state.rooms.has_router(&room).await);
    assert_eq!(server.state.rooms.room_count().await, 0);
    assert!(server.state.rooms.transports().is_empty().await);
}

#[tokio::test]
async fn test_errors_keep_connection_open() {
    let server = start_test_server().await;
    let mut client = server.connect().await;

    // Malformed frame
    client.send_raw("{ not json").await;
    let frame = client.next_frame().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "invalid_request");
    assert_eq!(frame["requestId"], Value::Null);

    // Unknown method
    client.send_raw(r#"{"requestId": 9, "type": "teleport"}"#).await;
    let frame = client.next_frame().await;
    assert_eq!(frame["code"], "invalid_request");
    assert_eq!(frame["requestId"], 9);

    // Known method, bad payload
    client
        .send_raw(r#"{"requestId": 10, "type": "produce", "transportId": "nope"}"#)
        .await;
    let frame = client.next_frame().await;
    assert_eq!(frame["code"], "invalid_request");
    assert_eq!(frame["requestId"], 10);

    // Acting before joining
    let reply = client
        .request(json!({
            "type": "resumeConsumer",
            "consumerId": uuid::Uuid::new_v4(),
        }))
        .await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "not_found");

    // Still usable
    let joined = client.join("r1", "A").await;
    assert!(joined["sendTransport"]["id"].is_string());

    // Join already opened the send transport
    let reply = client
        .request(json!({ "type": "createTransport", "roomId": "r1", "direction": "send" }))
        .await;
    assert_eq!(reply["code"], "invalid_state");

    let reply = client
        .request(json!({
            "type": "joinRoom",
            "roomId": "r2",
            "peerId": "A",
            "rtpCapabilities": opus_capabilities(),
        }))
        .await;
    assert_eq!(reply["code"], "invalid_state");
}

#[tokio::test]
async fn test_duplicate_peer_id() {
    let server = start_test_server().await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    first.join("r1", "A").await;
    let reply = second
        .request(json!({
            "type": "joinRoom",
            "roomId": "r1",
            "peerId": "A",
            "rtpCapabilities": opus_capabilities(),
        }))
        .await;

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "peer_id_taken");
    assert_eq!(server.state.rooms.peers(&RoomId::from("r1")).await.len(), 1);
}

#[tokio::test]
async fn test_incompatible_capabilities_error() {
    let server = start_test_server().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    let joined = alice.join("r1", "A").await;
    let alice_send = joined["sendTransport"]["id"].clone();
    let joined = bob.join("r1", "B").await;
    let bob_receive = joined["receiveTransport"]["id"].clone();

    let data = alice
        .ok(json!({
            "type": "produce",
            "transportId": alice_send,
            "kind": "audio",
            "rtpParameters": opus_parameters(),
        }))
        .await;

    let reply = bob
        .request(json!({
            "type": "consume",
            "roomId": "r1",
            "transportId": bob_receive,
            "producerId": data["id"],
            "rtpCapabilities": {
                "codecs": [{ "kind": "audio", "mimeType": "audio/PCMU", "clockRate": 8000 }]
            },
        }))
        .await;

    assert_eq!(reply["type"], "error");
    assert_eq!(reply["code"], "incompatible_capabilities");
    assert!(server.state.rooms.consumers().is_empty().await);
}

#[tokio::test]
async fn test_router_capabilities_before_join() {
    let server = start_test_server().await;
    let mut client = server.connect().await;

    let data = client
        .ok(json!({ "type": "getRouterRtpCapabilities", "roomId": "lobby" }))
        .await;

    let codec = &data["rtpCapabilities"]["codecs"][0];
    assert_eq!(codec["mimeType"], "audio/opus");
    assert_eq!(codec["clockRate"], 48000);
    assert_eq!(codec["channels"], 2);
    assert_eq!(codec["preferredPayloadType"], 111);
    assert_eq!(server.state.rooms.room_count().await, 0);
}

#[tokio::test]
async fn test_close_producer_notifies_room() {
    let server = start_test_server().await;
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    let joined = alice.join("r1", "A").await;
    let alice_send = joined["sendTransport"]["id"].clone();
    bob.join("r1", "B").await;

    let data = alice
        .ok(json!({
            "type": "produce",
            "transportId": alice_send,
            "kind": "audio",
            "rtpParameters": opus_parameters(),
        }))
        .await;
    let producer_id = data["id"].clone();
    bob.next_event("newProducer").await;

    let data = alice
        .ok(json!({ "type": "closeProducer", "producerId": producer_id }))
        .await;
    assert_eq!(data, json!({ "closed": true }));

    let event = bob.next_event("producerClosed").await;
    assert_eq!(event["producerId"], producer_id);

    // Closing again is still a success
    let data = alice
        .ok(json!({ "type": "closeProducer", "producerId": producer_id }))
        .await;
    assert_eq!(data, json!({ "closed": true }));
}

#[tokio::test]
async fn test_participant_counter() {
    let server = start_test_server().await;
    let room = RoomId::from("tour-1");
    let mut alice = server.connect().await;
    let mut bob = server.connect().await;

    alice.join("tour-1", "A").await;
    bob.join("tour-1", "B").await;
    alice.ok(json!({ "type": "leaveRoom", "roomId": "tour-1" })).await;

    // Counter updates are applied asynchronously
    timeout(Duration::from_secs(2), async {
        while server.records.count(&room) != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for participant count");

    let event = bob.next_event("peerLeft").await;
    assert_eq!(event["peerId"], "A");
}

#[tokio::test]
async fn test_router_reset_after_worker_crash() {
    let records = Arc::new(MemorySessionRecords::new());
    let engine = Arc::new(LocalEngine::new());
    let (router, state) = chorus_server::create_app_with(test_config(), engine.clone(), records)
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    let mut alice = TestClient::connect(&format!("ws://{}/ws", addr))
        .await
        .unwrap();
    alice.join("r1", "A").await;

    let hosting = state
        .rooms
        .routers()
        .get(&RoomId::from("r1"))
        .await
        .unwrap()
        .worker_id;
    assert!(engine.kill_worker(hosting));

    let event = alice.next_event("routerReset").await;
    let parsed: ServerMessage = serde_json::from_value(event).unwrap();
    assert!(matches!(parsed, ServerMessage::RouterReset { room_id } if room_id.as_str() == "r1"));

    // Renegotiate on the fresh router
    let data = alice
        .ok(json!({ "type": "createTransport", "roomId": "r1", "direction": "send" }))
        .await;
    let transport_id = data["transport"]["id"].clone();

    alice
        .ok(json!({
            "type": "produce",
            "transportId": transport_id,
            "kind": "audio",
            "rtpParameters": opus_parameters(),
        }))
        .await;

    assert_eq!(state.workers.len(), 2);
}
