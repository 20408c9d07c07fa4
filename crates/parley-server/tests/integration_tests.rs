//! Integration tests for the Parley signaling server.
//!
//! Each test runs the real server on an ephemeral port against a scripted
//! in-process media engine speaking the newline-delimited JSON-RPC
//! contract, then drives it over WebSocket and REST like a browser client
//! would.
//!
//! Run with: cargo test -p parley-server --test integration_tests

use futures_util::{SinkExt, StreamExt};
use parley_protocol::{ClientMessage, MediaKind, ServerMessage};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ============================================================================
// Fake media engine
// ============================================================================

mod fake_engine {
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    struct ProducerEntry {
        room_id: String,
        peer_id: String,
        kind: String,
    }

    #[derive(Default)]
    struct EngineState {
        producers: HashMap<String, ProducerEntry>,
    }

    /// Minimal stateful engine: tracks producers so that consume/leave/
    /// getProducers behave like the real relay, everything else is canned.
    pub struct FakeEngine {
        pub addr: SocketAddr,
    }

    impl FakeEngine {
        pub async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let state = Arc::new(Mutex::new(EngineState::default()));
            let counter = Arc::new(AtomicU64::new(0));

            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let state = state.clone();
                    let counter = counter.clone();
                    tokio::spawn(async move {
                        let (read_half, mut write_half) = stream.into_split();
                        let mut lines = BufReader::new(read_half).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            if line.trim().is_empty() {
                                continue;
                            }
                            let request: Value = match serde_json::from_str(&line) {
                                Ok(v) => v,
                                Err(_) => continue,
                            };
                            let response = respond(&state, &counter, &request).await;
                            let payload = format!("{response}\n");
                            if write_half.write_all(payload.as_bytes()).await.is_err() {
                                break;
                            }
                        }
                    });
                }
            });

            Self { addr }
        }
    }

    async fn respond(
        state: &Arc<Mutex<EngineState>>,
        counter: &Arc<AtomicU64>,
        request: &Value,
    ) -> Value {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default();
        let params = &request["params"];

        let result: Result<Value, Value> = match method {
            "ping" => Ok(json!("pong")),
            "createRouter" | "closeRouter" | "connectTransport" | "closeTransport"
            | "resumeConsumer" | "pauseProducer" | "resumeProducer" => Ok(json!({})),
            "getStats" => Ok(json!({"transports": 0})),
            "getRouterRtpCapabilities" => Ok(json!({"codecs": [{"mimeType": "audio/opus"}]})),
            "join" => Ok(json!({"peers": []})),
            "createWebRtcTransport" => {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                Ok(json!({
                    "id": format!("tr-{n}"),
                    "iceParameters": {"usernameFragment": "uf", "password": "pw"},
                    "iceCandidates": [],
                    "dtlsParameters": {"role": "auto"},
                }))
            }
            "produce" => {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                let producer_id = format!("prod-{n}");
                state.lock().await.producers.insert(
                    producer_id.clone(),
                    ProducerEntry {
                        room_id: params["roomId"].as_str().unwrap_or_default().to_string(),
                        peer_id: params["peerId"].as_str().unwrap_or_default().to_string(),
                        kind: params["kind"].as_str().unwrap_or("audio").to_string(),
                    },
                );
                Ok(json!({"id": producer_id}))
            }
            "closeProducer" => {
                let producer_id = params["producerId"].as_str().unwrap_or_default();
                state.lock().await.producers.remove(producer_id);
                Ok(json!({}))
            }
            "consume" => {
                let producer_id = params["producerId"].as_str().unwrap_or_default();
                match state.lock().await.producers.get(producer_id) {
                    Some(entry) => {
                        let n = counter.fetch_add(1, Ordering::Relaxed);
                        Ok(json!({
                            "id": format!("cons-{n}"),
                            "producerId": producer_id,
                            "kind": entry.kind,
                            "rtpParameters": {"codecs": []},
                        }))
                    }
                    None => Err(json!({
                        "code": "producerNotFound",
                        "message": format!("no producer {producer_id}"),
                    })),
                }
            }
            "leave" => {
                let room_id = params["roomId"].as_str().unwrap_or_default();
                let peer_id = params["peerId"].as_str().unwrap_or_default();
                let mut engine = state.lock().await;
                let closed: Vec<String> = engine
                    .producers
                    .iter()
                    .filter(|(_, e)| e.room_id == room_id && e.peer_id == peer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &closed {
                    engine.producers.remove(id);
                }
                Ok(json!({"closedProducers": closed}))
            }
            "getProducers" => {
                let room_id = params["roomId"].as_str().unwrap_or_default();
                let excluding = params["peerId"].as_str();
                let engine = state.lock().await;
                let producers: Vec<Value> = engine
                    .producers
                    .iter()
                    .filter(|(_, e)| e.room_id == room_id && Some(e.peer_id.as_str()) != excluding)
                    .map(|(id, e)| {
                        json!({"producerId": id, "peerId": e.peer_id, "kind": e.kind})
                    })
                    .collect();
                Ok(json!(producers))
            }
            other => Err(json!({"code": "unknownMethod", "message": other})),
        };

        match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
        }
    }
}

// ============================================================================
// Test server harness
// ============================================================================

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start_with_engine(engine_addr: String) -> Self {
        let config = parley_server::state::Config {
            bind_address: "127.0.0.1:0".to_string(),
            engine_addr,
            engine_workers: 2,
            engine_timeout_secs: 2,
            default_max_peers: None,
            stun_urls: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_urls: vec![],
            turn_secret: None,
            turn_ttl_secs: 86400,
            reconcile_interval_secs: 3600,
        };

        let (router, state) = parley_server::create_app(config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        // Let the engine adapter come up; tests with a dead engine address
        // proceed after the grace period.
        state.engine.wait_connected(Duration::from_secs(2)).await;

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    async fn start() -> (fake_engine::FakeEngine, Self) {
        let engine = fake_engine::FakeEngine::spawn().await;
        let server = Self::start_with_engine(engine.addr.to_string()).await;
        (engine, server)
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Client helpers
// ============================================================================

async fn connect_ws(server: &TestServer) -> WsStream {
    let (ws, _) = connect_async(server.ws_url()).await.expect("ws connect");
    ws
}

async fn send(ws: &mut WsStream, msg: &ClientMessage) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap().into()))
        .await
        .expect("ws send");
}

async fn recv(ws: &mut WsStream) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("parse server message");
        }
    }
}

/// Asserts that no further text message arrives within a short window.
async fn expect_silence(ws: &mut WsStream) {
    let outcome = timeout(Duration::from_millis(300), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = outcome {
        panic!("expected silence, got: {text}");
    }
}

async fn join(ws: &mut WsStream, room_id: &str, peer_id: &str, name: &str) -> ServerMessage {
    send(
        ws,
        &ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
            peer_id: peer_id.to_string(),
            display_name: name.to_string(),
            invite_token: None,
        },
    )
    .await;
    recv(ws).await
}

/// Runs the full transport handshake and returns the transport id.
async fn setup_transport(ws: &mut WsStream, consuming: bool) -> String {
    send(ws, &ClientMessage::CreateTransport { consuming }).await;
    let transport_id = match recv(ws).await {
        ServerMessage::TransportCreated { transport_id, consuming: c, .. } => {
            assert_eq!(c, consuming);
            transport_id
        }
        other => panic!("expected transportCreated, got {other:?}"),
    };

    send(
        ws,
        &ClientMessage::ConnectTransport {
            transport_id: transport_id.clone(),
            dtls_parameters: json!({"role": "client"}),
        },
    )
    .await;
    match recv(ws).await {
        ServerMessage::TransportConnected { transport_id: t } => assert_eq!(t, transport_id),
        other => panic!("expected transportConnected, got {other:?}"),
    }
    transport_id
}

async fn produce(ws: &mut WsStream, transport_id: &str, kind: MediaKind) -> String {
    send(
        ws,
        &ClientMessage::Produce {
            transport_id: transport_id.to_string(),
            kind,
            rtp_parameters: json!({"codecs": []}),
        },
    )
    .await;
    match recv(ws).await {
        ServerMessage::Produced { producer_id, kind: k } => {
            assert_eq!(k, kind);
            producer_id
        }
        other => panic!("expected produced, got {other:?}"),
    }
}

fn unique_room() -> String {
    format!("room-{}", uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_health_and_server_status() {
    let (_engine, server) = TestServer::start().await;
    let client = reqwest::Client::new();

    let health = client
        .get(format!("{}/health", server.http_url()))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    let status: Value = client
        .get(format!("{}/api/status", server.http_url()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["engineConnected"], true);
    assert_eq!(status["rooms"], 0);
}

#[tokio::test]
async fn test_join_makes_peers_visible_to_each_other() {
    let (_engine, server) = TestServer::start().await;
    let room = unique_room();

    let mut alice = connect_ws(&server).await;
    match join(&mut alice, &room, "pa", "Alice").await {
        ServerMessage::RoomJoined { peers, room_id, peer_id, ice_servers, .. } => {
            assert_eq!(room_id, room);
            assert_eq!(peer_id, "pa");
            assert!(peers.is_empty());
            assert!(!ice_servers.is_empty());
        }
        other => panic!("expected roomJoined, got {other:?}"),
    }

    let mut bob = connect_ws(&server).await;
    match join(&mut bob, &room, "pb", "Bob").await {
        ServerMessage::RoomJoined { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, "pa");
            assert_eq!(peers[0].display_name, "Alice");
        }
        other => panic!("expected roomJoined, got {other:?}"),
    }

    match recv(&mut alice).await {
        ServerMessage::PeerJoined { peer_id, display_name } => {
            assert_eq!(peer_id, "pb");
            assert_eq!(display_name, "Bob");
        }
        other => panic!("expected peerJoined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_join_is_tolerated_without_duplicate_broadcast() {
    let (_engine, server) = TestServer::start().await;
    let room = unique_room();

    let mut alice = connect_ws(&server).await;
    join(&mut alice, &room, "pa", "Alice").await;

    let mut bob = connect_ws(&server).await;
    join(&mut bob, &room, "pb", "Bob").await;
    match recv(&mut alice).await {
        ServerMessage::PeerJoined { peer_id, .. } => assert_eq!(peer_id, "pb"),
        other => panic!("expected peerJoined, got {other:?}"),
    }

    // Bob retries its join; it gets current room state back and Alice sees
    // no second peerJoined.
    match join(&mut bob, &room, "pb", "Bob").await {
        ServerMessage::RoomJoined { peers, .. } => {
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, "pa");
        }
        other => panic!("expected roomJoined, got {other:?}"),
    }
    expect_silence(&mut alice).await;
}

#[tokio::test]
async fn test_produce_fans_out_and_replaces_per_kind() {
    let (_engine, server) = TestServer::start().await;
    let room = unique_room();

    let mut alice = connect_ws(&server).await;
    join(&mut alice, &room, "pa", "Alice").await;
    let mut bob = connect_ws(&server).await;
    join(&mut bob, &room, "pb", "Bob").await;
    recv(&mut alice).await; // peerJoined pb

    let transport = setup_transport(&mut alice, false).await;
    let first = produce(&mut alice, &transport, MediaKind::Audio).await;

    match recv(&mut bob).await {
        ServerMessage::NewProducer { producer_id, peer_id, kind } => {
            assert_eq!(producer_id, first);
            assert_eq!(peer_id, "pa");
            assert_eq!(kind, MediaKind::Audio);
        }
        other => panic!("expected newProducer, got {other:?}"),
    }

    // Browser retry: a second audio produce replaces the first.
    let second = produce(&mut alice, &transport, MediaKind::Audio).await;
    assert_ne!(first, second);

    match recv(&mut bob).await {
        ServerMessage::ProducerClosed { producer_id, peer_id } => {
            assert_eq!(producer_id, first);
            assert_eq!(peer_id, "pa");
        }
        other => panic!("expected producerClosed, got {other:?}"),
    }
    match recv(&mut bob).await {
        ServerMessage::NewProducer { producer_id, .. } => assert_eq!(producer_id, second),
        other => panic!("expected newProducer, got {other:?}"),
    }

    // Exactly one live audio producer remains.
    send(&mut bob, &ClientMessage::GetProducers).await;
    match recv(&mut bob).await {
        ServerMessage::Producers { producers } => {
            assert_eq!(producers.len(), 1);
            assert_eq!(producers[0].producer_id, second);
        }
        other => panic!("expected producers, got {other:?}"),
    }
}

#[tokio::test]
async fn test_consume_flow_and_closed_producer_race() {
    let (_engine, server) = TestServer::start().await;
    let room = unique_room();

    let mut alice = connect_ws(&server).await;
    join(&mut alice, &room, "pa", "Alice").await;
    let mut bob = connect_ws(&server).await;
    join(&mut bob, &room, "pb", "Bob").await;
    recv(&mut alice).await; // peerJoined pb

    let send_transport = setup_transport(&mut alice, false).await;
    let producer_id = produce(&mut alice, &send_transport, MediaKind::Video).await;
    recv(&mut bob).await; // newProducer

    let _recv_transport = setup_transport(&mut bob, true).await;

    // Happy path: consumer comes back paused-by-convention, then resumes.
    send(
        &mut bob,
        &ClientMessage::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: json!({"codecs": []}),
        },
    )
    .await;
    let consumer_id = match recv(&mut bob).await {
        ServerMessage::Consumed { consumer_id, producer_id: p, kind, .. } => {
            assert_eq!(p, producer_id);
            assert_eq!(kind, MediaKind::Video);
            consumer_id
        }
        other => panic!("expected consumed, got {other:?}"),
    };

    send(&mut bob, &ClientMessage::ResumeConsumer { consumer_id: consumer_id.clone() }).await;
    match recv(&mut bob).await {
        ServerMessage::ConsumerResumed { consumer_id: c } => assert_eq!(c, consumer_id),
        other => panic!("expected consumerResumed, got {other:?}"),
    }

    // Race path: the producer closes, then a consume for it arrives.
    send(&mut alice, &ClientMessage::CloseProducer { producer_id: producer_id.clone() }).await;
    match recv(&mut bob).await {
        ServerMessage::ProducerClosed { producer_id: p, .. } => assert_eq!(p, producer_id),
        other => panic!("expected producerClosed, got {other:?}"),
    }

    send(
        &mut bob,
        &ClientMessage::Consume {
            producer_id: producer_id.clone(),
            rtp_capabilities: json!({"codecs": []}),
        },
    )
    .await;
    match recv(&mut bob).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "producerNotFound"),
        other => panic!("expected producerNotFound error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pause_resume_broadcasts() {
    let (_engine, server) = TestServer::start().await;
    let room = unique_room();

    let mut alice = connect_ws(&server).await;
    join(&mut alice, &room, "pa", "Alice").await;
    let mut bob = connect_ws(&server).await;
    join(&mut bob, &room, "pb", "Bob").await;
    recv(&mut alice).await;

    let transport = setup_transport(&mut alice, false).await;
    let producer_id = produce(&mut alice, &transport, MediaKind::Audio).await;
    recv(&mut bob).await; // newProducer

    send(&mut alice, &ClientMessage::PauseProducer { producer_id: producer_id.clone() }).await;
    match recv(&mut bob).await {
        ServerMessage::ProducerPaused { producer_id: p, peer_id } => {
            assert_eq!(p, producer_id);
            assert_eq!(peer_id, "pa");
        }
        other => panic!("expected producerPaused, got {other:?}"),
    }

    send(&mut alice, &ClientMessage::ResumeProducer { producer_id: producer_id.clone() }).await;
    match recv(&mut bob).await {
        ServerMessage::ProducerResumed { producer_id: p, .. } => assert_eq!(p, producer_id),
        other => panic!("expected producerResumed, got {other:?}"),
    }

    // Only the owner may pause.
    send(&mut bob, &ClientMessage::PauseProducer { producer_id: producer_id.clone() }).await;
    match recv(&mut bob).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "unauthorized"),
        other => panic!("expected unauthorized error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_equals_leave() {
    let (_engine, server) = TestServer::start().await;
    let room = unique_room();
    let client = reqwest::Client::new();

    let mut alice = connect_ws(&server).await;
    join(&mut alice, &room, "pa", "Alice").await;
    let mut bob = connect_ws(&server).await;
    join(&mut bob, &room, "pb", "Bob").await;
    recv(&mut alice).await;

    let transport = setup_transport(&mut alice, false).await;
    let producer_id = produce(&mut alice, &transport, MediaKind::Audio).await;
    recv(&mut bob).await; // newProducer

    // Alice's tab dies. Bob must see her producer close and her departure.
    drop(alice);

    match recv(&mut bob).await {
        ServerMessage::ProducerClosed { producer_id: p, peer_id } => {
            assert_eq!(p, producer_id);
            assert_eq!(peer_id, "pa");
        }
        other => panic!("expected producerClosed, got {other:?}"),
    }
    match recv(&mut bob).await {
        ServerMessage::PeerLeft { peer_id, display_name } => {
            assert_eq!(peer_id, "pa");
            assert_eq!(display_name, "Alice");
        }
        other => panic!("expected peerLeft, got {other:?}"),
    }

    // Last peer leaves over the wire; the room must be destroyed.
    send(&mut bob, &ClientMessage::LeaveRoom).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = client
            .get(format!("{}/api/rooms/{}/status", server.http_url(), room))
            .send()
            .await
            .unwrap()
            .status();
        if status == reqwest::StatusCode::NOT_FOUND {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "room was not destroyed after last leave"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_host_approval_flow() {
    let (_engine, server) = TestServer::start().await;
    let client = reqwest::Client::new();

    // Pre-create a gated room.
    let created: Value = client
        .post(format!("{}/api/rooms", server.http_url()))
        .json(&json!({"accessMode": "hostApproval"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room = created["roomId"].as_str().unwrap().to_string();

    // First joiner becomes host and is admitted directly.
    let mut host = connect_ws(&server).await;
    match join(&mut host, &room, "h", "Hana").await {
        ServerMessage::RoomJoined { peers, .. } => assert!(peers.is_empty()),
        other => panic!("expected roomJoined for first joiner, got {other:?}"),
    }

    // Second joiner waits for approval; the host is asked.
    let mut guest = connect_ws(&server).await;
    send(
        &mut guest,
        &ClientMessage::JoinRoom {
            room_id: room.clone(),
            peer_id: "p2".to_string(),
            display_name: "Quinn".to_string(),
            invite_token: None,
        },
    )
    .await;
    assert!(matches!(recv(&mut guest).await, ServerMessage::WaitingApproval));

    match recv(&mut host).await {
        ServerMessage::ApprovalRequest { peer_id, display_name } => {
            assert_eq!(peer_id, "p2");
            assert_eq!(display_name, "Quinn");
        }
        other => panic!("expected approvalRequest, got {other:?}"),
    }

    // A non-host cannot approve: the guest is not even admitted yet, so its
    // approve attempt bounces off the binding check.
    send(&mut guest, &ClientMessage::ApproveJoin { peer_id: "p2".to_string() }).await;
    match recv(&mut guest).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "notInRoom"),
        other => panic!("expected notInRoom error, got {other:?}"),
    }

    // Host approves: guest gets its session, host gets exactly one
    // peerJoined, guest gets none about itself.
    send(&mut host, &ClientMessage::ApproveJoin { peer_id: "p2".to_string() }).await;
    match recv(&mut guest).await {
        ServerMessage::RoomJoined { peers, peer_id, .. } => {
            assert_eq!(peer_id, "p2");
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].peer_id, "h");
        }
        other => panic!("expected roomJoined after approval, got {other:?}"),
    }
    match recv(&mut host).await {
        ServerMessage::PeerJoined { peer_id, .. } => assert_eq!(peer_id, "p2"),
        other => panic!("expected peerJoined, got {other:?}"),
    }
    expect_silence(&mut host).await;
    expect_silence(&mut guest).await;
}

#[tokio::test]
async fn test_deny_notifies_the_denied_peer() {
    let (_engine, server) = TestServer::start().await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/api/rooms", server.http_url()))
        .json(&json!({"accessMode": "hostApproval"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room = created["roomId"].as_str().unwrap().to_string();

    let mut host = connect_ws(&server).await;
    join(&mut host, &room, "h", "Hana").await;

    let mut guest = connect_ws(&server).await;
    send(
        &mut guest,
        &ClientMessage::JoinRoom {
            room_id: room.clone(),
            peer_id: "p2".to_string(),
            display_name: "Quinn".to_string(),
            invite_token: None,
        },
    )
    .await;
    recv(&mut guest).await; // waitingApproval
    recv(&mut host).await; // approvalRequest

    send(&mut host, &ClientMessage::DenyJoin { peer_id: "p2".to_string() }).await;
    assert!(matches!(recv(&mut guest).await, ServerMessage::JoinDenied));
}

#[tokio::test]
async fn test_room_cap_rejects_overflow() {
    let (_engine, server) = TestServer::start().await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/api/rooms", server.http_url()))
        .json(&json!({"maxPeers": 1}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room = created["roomId"].as_str().unwrap().to_string();

    let mut alice = connect_ws(&server).await;
    join(&mut alice, &room, "pa", "Alice").await;

    let mut bob = connect_ws(&server).await;
    match join(&mut bob, &room, "pb", "Bob").await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "roomFull"),
        other => panic!("expected roomFull error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_use_invite_over_rest_and_ws() {
    let (_engine, server) = TestServer::start().await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/api/rooms", server.http_url()))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let room = created["roomId"].as_str().unwrap().to_string();

    let invite: Value = client
        .post(format!("{}/api/rooms/{}/invites", server.http_url(), room))
        .json(&json!({"reusable": false}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = invite["token"].as_str().unwrap().to_string();

    // First resolution wins...
    let resolved = client
        .post(format!("{}/api/invites/{}", server.http_url(), token))
        .send()
        .await
        .unwrap();
    assert!(resolved.status().is_success());
    let resolved: Value = resolved.json().await.unwrap();
    assert_eq!(resolved["roomId"], room.as_str());

    // ...the second finds nothing.
    let second = client
        .post(format!("{}/api/invites/{}", server.http_url(), token))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::NOT_FOUND);

    // A reusable token admits over the WebSocket join path.
    let invite: Value = client
        .post(format!("{}/api/rooms/{}/invites", server.http_url(), room))
        .json(&json!({"reusable": true, "ttlSecs": 600}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let token = invite["token"].as_str().unwrap().to_string();

    let mut guest = connect_ws(&server).await;
    send(
        &mut guest,
        &ClientMessage::JoinRoom {
            room_id: room.clone(),
            peer_id: "pg".to_string(),
            display_name: "Gil".to_string(),
            invite_token: Some(token),
        },
    )
    .await;
    assert!(matches!(recv(&mut guest).await, ServerMessage::RoomJoined { .. }));
}

#[tokio::test]
async fn test_messages_before_join_are_rejected() {
    let (_engine, server) = TestServer::start().await;

    let mut ws = connect_ws(&server).await;
    send(&mut ws, &ClientMessage::GetProducers).await;
    match recv(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "notInRoom"),
        other => panic!("expected notInRoom error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_engine_down_join_fails_but_room_stays_creatable() {
    // Nothing listens at this address.
    let server = TestServer::start_with_engine("127.0.0.1:1".to_string()).await;
    let room = unique_room();

    let mut ws = connect_ws(&server).await;
    match join(&mut ws, &room, "pa", "Alice").await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "engineUnavailable"),
        other => panic!("expected engineUnavailable error, got {other:?}"),
    }

    // The failed creation must not have registered the room.
    let client = reqwest::Client::new();
    let status = client
        .get(format!("{}/api/rooms/{}/status", server.http_url(), room))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
}
