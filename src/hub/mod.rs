//! Relay hub for multi-device state sync
//!
//! Star topology: every device keeps one websocket open to `/sync`, and the
//! hub rebroadcasts each envelope verbatim to every other connection. The
//! hub also keeps a merged view of all relayed `stateUpdate`s and sends it
//! as `initialSync` the moment a device connects.
//! Default port: 8787

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HubServerConfig;
use crate::state::Category;
use crate::sync::{EnvelopeKind, IdentityClaim, SyncEnvelope};

/// One connected device
struct Peer {
    device_id: String,
    tx: mpsc::UnboundedSender<Message>,
}

/// Shared state for hub handlers
#[derive(Default)]
pub struct HubState {
    peers: DashMap<u64, Peer>,
    next_conn: AtomicU64,
    /// category -> device -> last relayed value
    snapshot: parking_lot::RwLock<BTreeMap<Category, Map<String, Value>>>,
}

/// Health response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    peers: usize,
    devices: Vec<String>,
}

impl HubState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of open connections
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Ids of connected devices (temporary ids until claimed)
    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|p| p.device_id.clone()).collect();
        ids.sort();
        ids
    }

    /// Merged view of every relayed `stateUpdate`: category -> device -> value
    pub fn snapshot(&self) -> Value {
        let snapshot = self.snapshot.read();
        let out: Map<String, Value> = snapshot
            .iter()
            .map(|(category, devices)| (category.as_str().to_string(), Value::Object(devices.clone())))
            .collect();
        Value::Object(out)
    }

    /// Add a connection under a temporary id and greet it with the snapshot
    fn register(&self, tx: mpsc::UnboundedSender<Message>) -> u64 {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        self.peers.insert(
            conn,
            Peer {
                device_id: format!("conn-{}", conn),
                tx,
            },
        );
        self.send_to(conn, &SyncEnvelope::initial_sync(self.snapshot()));
        conn
    }

    fn device_id_of(&self, conn: u64) -> String {
        self.peers
            .get(&conn)
            .map(|p| p.device_id.clone())
            .unwrap_or_default()
    }

    fn send_to(&self, conn: u64, envelope: &SyncEnvelope) {
        let Some(peer) = self.peers.get(&conn) else {
            return;
        };
        match envelope.to_json() {
            Ok(json) => {
                let _ = peer.tx.send(Message::Text(json));
            }
            Err(e) => warn!(error = %e, "Failed to encode hub envelope"),
        }
    }

    /// Forward text to every connection except the sender
    fn broadcast_from(&self, conn: u64, text: &str) -> usize {
        let mut delivered = 0;
        for peer in self.peers.iter() {
            if *peer.key() == conn {
                continue;
            }
            if peer.tx.send(Message::Text(text.to_string())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Last write wins per (category, device)
    fn record_update(&self, envelope: &SyncEnvelope) {
        let (Some(category), Some(Value::Object(devices))) = (envelope.category, &envelope.payload) else {
            return;
        };
        let mut snapshot = self.snapshot.write();
        let entries = snapshot.entry(category).or_default();
        for (id, value) in devices {
            entries.insert(id.clone(), value.clone());
        }
    }

    /// Apply one text frame from connection `conn`
    fn handle_text(&self, conn: u64, text: &str) {
        if let Ok(envelope) = SyncEnvelope::from_json(text) {
            if envelope.kind == EnvelopeKind::StateUpdate {
                self.record_update(&envelope);
            }
            let delivered = self.broadcast_from(conn, text);
            debug!(conn, kind = ?envelope.kind, delivered, "Relayed envelope");
            return;
        }

        if let Ok(claim) = serde_json::from_str::<IdentityClaim>(text) {
            if claim.device_id.trim().is_empty() {
                self.send_to(conn, &SyncEnvelope::error("deviceId must not be empty"));
                return;
            }
            if let Some(mut peer) = self.peers.get_mut(&conn) {
                info!(conn, device_id = %claim.device_id, previous = %peer.device_id, "Device identified");
                peer.device_id = claim.device_id.clone();
            }
            self.send_to(conn, &SyncEnvelope::subscription_ack(&claim.device_id));
            return;
        }

        warn!(conn, "Malformed message from device");
        self.send_to(conn, &SyncEnvelope::error("malformed message"));
    }
}

/// Build the hub router
pub fn build_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/sync", get(sync_ws))
        .route("/health", get(health_check))
        .with_state(state)
}

/// GET /sync - device websocket
async fn sync_ws(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle one device connection until it closes
async fn handle_websocket(socket: WebSocket, state: Arc<HubState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = state.register(tx.clone());
    info!(conn, peers = state.peer_count(), "Device connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => state.handle_text(conn, &text),
            Ok(Message::Ping(data)) => {
                let _ = tx.send(Message::Pong(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(conn, "WebSocket error: {}", e);
                break;
            }
        }
    }

    let device_id = state.device_id_of(conn);
    state.peers.remove(&conn);
    drop(tx);
    writer.abort();
    info!(conn, device_id = %device_id, peers = state.peer_count(), "Device disconnected");
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<Arc<HubState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        peers: state.peer_count(),
        devices: state.device_ids(),
    })
}

/// Serve the hub on an already bound listener until cancelled
pub async fn serve(listener: TcpListener, state: Arc<HubState>, cancel: CancellationToken) -> Result<()> {
    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Hub server error")?;
    Ok(())
}

/// Bind the configured address and serve the hub
pub async fn start_server(config: &HubServerConfig, cancel: CancellationToken) -> Result<()> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("Invalid hub listen address: {}", config.listen))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind hub on {}", addr))?;
    info!("Starting sync hub on ws://{}/sync", addr);

    serve(listener, HubState::new(), cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Register a connection and consume its greeting
    fn connect(state: &HubState) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = state.register(tx);
        assert_eq!(next_envelope(&mut rx).kind, EnvelopeKind::InitialSync);
        (conn, rx)
    }

    fn next_envelope(rx: &mut mpsc::UnboundedReceiver<Message>) -> SyncEnvelope {
        match rx.try_recv().unwrap() {
            Message::Text(text) => SyncEnvelope::from_json(&text).unwrap(),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_temporary_ids() {
        let state = HubState::default();
        let (a, _rx_a) = connect(&state);
        let (b, _rx_b) = connect(&state);
        assert_eq!(state.device_id_of(a), "conn-1");
        assert_eq!(state.device_id_of(b), "conn-2");
    }

    #[test]
    fn test_initial_sync_sent_on_connect() {
        let state = HubState::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(tx);

        let sync = next_envelope(&mut rx);
        assert_eq!(sync.kind, EnvelopeKind::InitialSync);
        assert_eq!(sync.payload, Some(json!({})));
    }

    #[test]
    fn test_identity_claim_acked() {
        let state = HubState::default();
        let (conn, mut rx) = connect(&state);

        state.handle_text(conn, r#"{"deviceId":"panel"}"#);

        assert_eq!(state.device_id_of(conn), "panel");
        let ack = next_envelope(&mut rx);
        assert_eq!(ack.kind, EnvelopeKind::SubscriptionAck);
        assert_eq!(ack.payload, Some(json!({"deviceId": "panel"})));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_empty_device_id_rejected() {
        let state = HubState::default();
        let (conn, mut rx) = connect(&state);

        state.handle_text(conn, r#"{"deviceId":"  "}"#);

        assert_eq!(next_envelope(&mut rx).kind, EnvelopeKind::Error);
        assert_eq!(state.device_id_of(conn), format!("conn-{}", conn));
    }

    #[test]
    fn test_rebroadcast_skips_sender() {
        let state = HubState::default();
        let (a, mut rx_a) = connect(&state);
        let (_b, mut rx_b) = connect(&state);

        let text = r#"{"kind":"stateUpdate","sourceDeviceId":"gateway","category":"tanks","payload":{"lpg":{"level":60}},"sentAt":1}"#;
        state.handle_text(a, text);

        assert!(rx_a.try_recv().is_err());
        match rx_b.try_recv().unwrap() {
            Message::Text(relayed) => assert_eq!(relayed, text),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_last_write_wins() {
        let state = HubState::default();
        let (a, _rx_a) = connect(&state);
        state.handle_text(
            a,
            r#"{"kind":"stateUpdate","sourceDeviceId":"gateway","category":"tanks","payload":{"lpg":{"level":60}}}"#,
        );
        state.handle_text(
            a,
            r#"{"kind":"stateUpdate","sourceDeviceId":"gateway","category":"tanks","payload":{"lpg":{"level":65}}}"#,
        );

        assert_eq!(state.snapshot(), json!({"tanks": {"lpg": {"level": 65}}}));

        // a late joiner is greeted with the merged view
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.register(tx);
        assert_eq!(
            next_envelope(&mut rx).payload,
            Some(json!({"tanks": {"lpg": {"level": 65}}}))
        );
    }

    #[test]
    fn test_malformed_text_gets_error() {
        let state = HubState::default();
        let (a, mut rx_a) = connect(&state);
        let (_b, mut rx_b) = connect(&state);

        state.handle_text(a, "not json");

        let reply = next_envelope(&mut rx_a);
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.error_message(), Some("malformed message"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, HubState::new(), cancel.clone()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains(r#""status":"ok""#));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
