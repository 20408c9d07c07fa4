//! JSON-RPC client for the external selective-forwarding media engine.
//!
//! Requests are newline-delimited JSON-RPC 2.0 over a TCP or Unix socket.
//! Every request carries a fresh correlation id and is matched to its
//! response through a pending-call map, so any number of calls — including
//! calls of the same method — can be outstanding at once. Messages without
//! an id are engine push notifications (new producer, producer closed).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parley_protocol::MediaKind;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::types::{
    ConsumerCreated, EngineError, EngineNotification, RemoteProducer, TransportCreated,
};

/// Where the engine process listens.
#[derive(Debug, Clone)]
pub enum EngineAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl EngineAddr {
    /// Parses `unix:/path/to.sock` or `host:port`.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("unix:") {
            Some(path) => EngineAddr::Unix(PathBuf::from(path)),
            None => EngineAddr::Tcp(s.to_string()),
        }
    }
}

impl std::fmt::Display for EngineAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineAddr::Tcp(addr) => write!(f, "{addr}"),
            EngineAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Result<Value, EngineError>>>>;

struct ClientInner {
    addr: EngineAddr,
    call_timeout: Duration,
    next_id: AtomicU64,
    pending: PendingMap,
    /// Present while a connection is up; cleared on loss so calls fail fast.
    writer: std::sync::RwLock<Option<mpsc::UnboundedSender<String>>>,
}

#[derive(Clone)]
pub struct EngineClient {
    inner: Arc<ClientInner>,
}

impl EngineClient {
    /// Connects to the engine and returns the client plus the stream of
    /// engine push notifications. The connection is supervised: on loss,
    /// in-flight calls fail with `ConnectionClosed` and the client
    /// reconnects with capped backoff.
    pub fn connect(
        addr: EngineAddr,
        call_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<EngineNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            addr,
            call_timeout,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: std::sync::RwLock::new(None),
        });
        tokio::spawn(supervise(inner.clone(), notify_tx));
        (Self { inner }, notify_rx)
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .writer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Waits up to `dur` for the first connection to come up.
    pub async fn wait_connected(&self, dur: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + dur;
        while tokio::time::Instant::now() < deadline {
            if self.is_connected() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.is_connected()
    }

    /// Issues one request and awaits its correlated response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let tx = self
            .inner
            .writer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(EngineError::NotConnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, resp_tx);

        let line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();

        if tx.send(line).is_err() {
            self.inner.pending.lock().await.remove(&id);
            return Err(EngineError::NotConnected);
        }

        match tokio::time::timeout(self.inner.call_timeout, resp_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped: the connection died with our call in flight.
            Ok(Err(_)) => Err(EngineError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(EngineError::Timeout)
            }
        }
    }

    // --- Typed wrappers for the engine RPC contract ---

    pub async fn ping(&self) -> bool {
        self.call("ping", json!({})).await.is_ok()
    }

    pub async fn create_router(&self, room_id: &str, worker: usize) -> Result<Value, EngineError> {
        self.call("createRouter", json!({"roomId": room_id, "worker": worker}))
            .await
    }

    pub async fn close_router(&self, room_id: &str) -> Result<(), EngineError> {
        self.call("closeRouter", json!({"roomId": room_id})).await?;
        Ok(())
    }

    pub async fn router_capabilities(&self, room_id: &str) -> Result<Value, EngineError> {
        self.call("getRouterRtpCapabilities", json!({"roomId": room_id}))
            .await
    }

    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        display_name: &str,
    ) -> Result<Value, EngineError> {
        self.call(
            "join",
            json!({"roomId": room_id, "peerId": peer_id, "displayName": display_name}),
        )
        .await
    }

    pub async fn leave(&self, room_id: &str, peer_id: &str) -> Result<Vec<String>, EngineError> {
        let result = self
            .call("leave", json!({"roomId": room_id, "peerId": peer_id}))
            .await?;
        let closed = result
            .get("closedProducers")
            .cloned()
            .unwrap_or_else(|| json!([]));
        parse(closed)
    }

    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        consuming: bool,
    ) -> Result<TransportCreated, EngineError> {
        let result = self
            .call(
                "createWebRtcTransport",
                json!({"roomId": room_id, "peerId": peer_id, "consuming": consuming}),
            )
            .await?;
        parse(result)
    }

    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), EngineError> {
        self.call(
            "connectTransport",
            json!({
                "roomId": room_id,
                "peerId": peer_id,
                "transportId": transport_id,
                "dtlsParameters": dtls_parameters,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn close_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
    ) -> Result<(), EngineError> {
        self.call(
            "closeTransport",
            json!({"roomId": room_id, "peerId": peer_id, "transportId": transport_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<String, EngineError> {
        let result = self
            .call(
                "produce",
                json!({
                    "roomId": room_id,
                    "peerId": peer_id,
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                }),
            )
            .await?;
        result
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Protocol("produce reply missing id".into()))
    }

    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerCreated, EngineError> {
        let result = self
            .call(
                "consume",
                json!({
                    "roomId": room_id,
                    "peerId": peer_id,
                    "producerId": producer_id,
                    "rtpCapabilities": rtp_capabilities,
                }),
            )
            .await?;
        parse(result)
    }

    pub async fn resume_consumer(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &str,
    ) -> Result<(), EngineError> {
        self.call(
            "resumeConsumer",
            json!({"roomId": room_id, "peerId": peer_id, "consumerId": consumer_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn pause_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), EngineError> {
        self.call(
            "pauseProducer",
            json!({"roomId": room_id, "peerId": peer_id, "producerId": producer_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn resume_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), EngineError> {
        self.call(
            "resumeProducer",
            json!({"roomId": room_id, "peerId": peer_id, "producerId": producer_id}),
        )
        .await?;
        Ok(())
    }

    pub async fn close_producer(
        &self,
        room_id: &str,
        peer_id: &str,
        producer_id: &str,
    ) -> Result<(), EngineError> {
        self.call(
            "closeProducer",
            json!({"roomId": room_id, "peerId": peer_id, "producerId": producer_id}),
        )
        .await?;
        Ok(())
    }

    /// Lists the engine's live producers in a room, optionally excluding
    /// one peer's own.
    pub async fn get_producers(
        &self,
        room_id: &str,
        excluding_peer: Option<&str>,
    ) -> Result<Vec<RemoteProducer>, EngineError> {
        let mut params = json!({"roomId": room_id});
        if let Some(peer_id) = excluding_peer {
            params["peerId"] = json!(peer_id);
        }
        let result = self.call("getProducers", params).await?;
        parse(result)
    }

    pub async fn get_stats(&self, room_id: &str) -> Result<Value, EngineError> {
        self.call("getStats", json!({"roomId": room_id})).await
    }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(|e| EngineError::Protocol(e.to_string()))
}

async fn supervise(inner: Arc<ClientInner>, notify_tx: mpsc::UnboundedSender<EngineNotification>) {
    let mut backoff = Duration::from_millis(500);
    loop {
        match open_stream(&inner.addr).await {
            Ok(stream) => {
                tracing::info!("connected to media engine at {}", inner.addr);
                backoff = Duration::from_millis(500);
                run_connection(&inner, stream, &notify_tx).await;
                tracing::warn!("media engine connection lost");
                fail_pending(&inner).await;
            }
            Err(e) => {
                tracing::warn!("media engine connect to {} failed: {}", inner.addr, e);
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(10));
    }
}

async fn open_stream(addr: &EngineAddr) -> std::io::Result<Box<dyn RawStream>> {
    match addr {
        EngineAddr::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        EngineAddr::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        EngineAddr::Unix(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )),
    }
}

async fn run_connection(
    inner: &Arc<ClientInner>,
    stream: Box<dyn RawStream>,
    notify_tx: &mpsc::UnboundedSender<EngineNotification>,
) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    *inner.writer.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);

    let write_task = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                dispatch(inner, &line, notify_tx).await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("engine socket read error: {}", e);
                break;
            }
        }
    }

    *inner.writer.write().unwrap_or_else(|e| e.into_inner()) = None;
    write_task.abort();
}

async fn dispatch(
    inner: &Arc<ClientInner>,
    line: &str,
    notify_tx: &mpsc::UnboundedSender<EngineNotification>,
) {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("unparseable engine message: {}", e);
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let outcome = match value.get("error").filter(|e| !e.is_null()) {
            Some(err) => Err(EngineError::Remote {
                code: err
                    .get("code")
                    .map(|c| match c {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };

        match inner.pending.lock().await.remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!("engine response for unknown request id {}", id),
        }
    } else if let Some(method) = value.get("method").and_then(Value::as_str) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        match parse_notification(method, params) {
            Some(notification) => {
                let _ = notify_tx.send(notification);
            }
            None => tracing::debug!("ignoring engine notification: {}", method),
        }
    }
}

fn parse_notification(method: &str, params: Value) -> Option<EngineNotification> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct NewProducerParams {
        room_id: String,
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
    }

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct ProducerClosedParams {
        room_id: String,
        producer_id: String,
    }

    match method {
        "newProducer" => {
            let p: NewProducerParams = serde_json::from_value(params).ok()?;
            Some(EngineNotification::NewProducer {
                room_id: p.room_id,
                peer_id: p.peer_id,
                producer_id: p.producer_id,
                kind: p.kind,
            })
        }
        "producerClosed" => {
            let p: ProducerClosedParams = serde_json::from_value(params).ok()?;
            Some(EngineNotification::ProducerClosed {
                room_id: p.room_id,
                producer_id: p.producer_id,
            })
        }
        _ => None,
    }
}

async fn fail_pending(inner: &Arc<ClientInner>) {
    let mut pending = inner.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(EngineError::ConnectionClosed));
    }
}
