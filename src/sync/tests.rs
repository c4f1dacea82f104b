//! Tests for the sync client against a real hub

use super::*;
use crate::bus::{Frame, RawFrameData};
use crate::config::{HubConfig, ReconnectSettings, WatchdogSettings};
use crate::hub::{self, HubState};
use crate::state::{Category, DeviceValue, Origin, StateActorHandle, StateEntry};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type RawClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Device {
    store: StateActorHandle,
    handle: SyncHandle,
    frames_rx: mpsc::UnboundedReceiver<Frame>,
}

async fn start_hub_on(listener: TcpListener) -> (Arc<HubState>, CancellationToken) {
    let state = HubState::new();
    let cancel = CancellationToken::new();
    tokio::spawn(hub::serve(listener, state.clone(), cancel.clone()));
    (state, cancel)
}

async fn start_hub() -> (SocketAddr, Arc<HubState>, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (state, cancel) = start_hub_on(listener).await;
    (addr, state, cancel)
}

fn hub_config(addr: SocketAddr) -> HubConfig {
    HubConfig {
        url: format!("ws://{}/sync", addr),
        reconnect: ReconnectSettings {
            initial_delay_ms: 20,
            multiplier: 1.5,
            max_delay_ms: 200,
            max_attempts: 50,
        },
        watchdog: WatchdogSettings {
            ping_interval_ms: 200,
            idle_timeout_ms: 5_000,
        },
        ..HubConfig::default()
    }
}

fn start_device(id: &str, config: &HubConfig, queue: OfflineQueue) -> Device {
    start_device_with_relay(id, config, queue, None)
}

fn start_device_with_relay(
    id: &str,
    config: &HubConfig,
    queue: OfflineQueue,
    relay_rx: Option<mpsc::UnboundedReceiver<RawFrameData>>,
) -> Device {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let store = StateActorHandle::spawn(id, None, Some(outbound_tx));
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let mut client = SyncClient::new(id, config, store.clone(), outbound_rx, queue)
        .unwrap()
        .with_frame_sink(frames_tx);
    if let Some(relay_rx) = relay_rx {
        client = client.with_relay(relay_rx);
    }
    let handle = client.spawn(CancellationToken::new());
    Device {
        store,
        handle,
        frames_rx,
    }
}

async fn wait_for_status(handle: &SyncHandle, wanted: ConnectionStatus) {
    let mut rx = handle.subscribe_status();
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
        .await
        .expect("status not reached in time")
        .unwrap();
}

async fn wait_for_entry(store: &StateActorHandle, category: Category, device_id: &str) -> StateEntry {
    for _ in 0..150 {
        if let Some(entry) = store.get_category(category).await.get(device_id) {
            return entry.clone();
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("{}/{} never appeared", category, device_id);
}

async fn raw_client(addr: SocketAddr, device_id: &str) -> RawClient {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/sync", addr))
        .await
        .unwrap();
    let claim = serde_json::to_string(&IdentityClaim {
        device_id: device_id.to_string(),
    })
    .unwrap();
    ws.send(Message::Text(claim)).await.unwrap();
    assert_eq!(next_envelope(&mut ws).await.kind, EnvelopeKind::InitialSync);
    assert_eq!(next_envelope(&mut ws).await.kind, EnvelopeKind::SubscriptionAck);
    ws
}

async fn next_envelope(ws: &mut RawClient) -> SyncEnvelope {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no message from hub")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return SyncEnvelope::from_json(&text).unwrap();
        }
    }
}

fn light(is_on: bool, brightness: u8) -> DeviceValue {
    DeviceValue::Light { is_on, brightness }
}

#[tokio::test]
async fn test_bus_update_reaches_other_device_as_remote() {
    let (addr, _hub, _cancel) = start_hub().await;
    let config = hub_config(addr);
    let a = start_device("panel", &config, OfflineQueue::in_memory(16));
    let b = start_device("tablet", &config, OfflineQueue::in_memory(16));
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;
    wait_for_status(&b.handle, ConnectionStatus::Connected).await;

    a.store
        .update_device(Category::Lights, "porch", light(true, 40), Origin::Bus);

    let entry = wait_for_entry(&b.store, Category::Lights, "porch").await;
    assert_eq!(entry.value, light(true, 40));
    assert_eq!(entry.origin, Origin::Remote);

    // tablet must not echo the value back
    sleep(Duration::from_millis(300)).await;
    let a_entry = wait_for_entry(&a.store, Category::Lights, "porch").await;
    assert_eq!(a_entry.origin, Origin::Bus);
    assert!(a.store.get_all().await.online);
}

#[tokio::test]
async fn test_remote_updates_are_not_relayed_again() {
    let (addr, _hub, _cancel) = start_hub().await;
    let config = hub_config(addr);
    let a = start_device("panel", &config, OfflineQueue::in_memory(16));
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;
    let mut observer = raw_client(addr, "observer").await;
    let mut gateway = raw_client(addr, "gateway").await;

    let update = SyncEnvelope::state_update(
        "gateway",
        Category::Tanks,
        &[("lpg".to_string(), DeviceValue::Tank { level: 60 })].into(),
    )
    .unwrap();
    gateway
        .send(Message::Text(update.to_json().unwrap()))
        .await
        .unwrap();

    // observer sees the gateway's update exactly once, never a copy from panel
    let seen = next_envelope(&mut observer).await;
    assert_eq!(seen.source_device_id, "gateway");
    wait_for_entry(&a.store, Category::Tanks, "lpg").await;
    let echo = timeout(Duration::from_millis(300), observer.next()).await;
    assert!(echo.is_err(), "unexpected relay: {:?}", echo);
}

#[tokio::test]
async fn test_own_device_id_is_never_merged() {
    let (addr, _hub, _cancel) = start_hub().await;
    let config = hub_config(addr);
    let a = start_device("panel", &config, OfflineQueue::in_memory(16));
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;
    let mut spoof = raw_client(addr, "spoof").await;

    let own = SyncEnvelope::state_update(
        "panel",
        Category::Lights,
        &[("porch".to_string(), light(true, 90))].into(),
    )
    .unwrap();
    let other = SyncEnvelope::state_update(
        "gateway",
        Category::Lights,
        &[("awning".to_string(), light(true, 10))].into(),
    )
    .unwrap();
    spoof.send(Message::Text(own.to_json().unwrap())).await.unwrap();
    spoof.send(Message::Text(other.to_json().unwrap())).await.unwrap();

    wait_for_entry(&a.store, Category::Lights, "awning").await;
    assert!(!a.store.get_category(Category::Lights).await.contains_key("porch"));
}

#[tokio::test]
async fn test_offline_queue_drained_in_order_after_reconnect() {
    // reserve a port with nothing listening on it yet
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let temp = tempfile::tempdir().unwrap();
    let db = sled::open(temp.path().join("device.sled")).unwrap();
    let queue = OfflineQueue::persistent(&db, 16).unwrap();

    let mut config = hub_config(addr);
    config.reconnect.max_attempts = 1;
    let a = start_device("panel", &config, queue);
    wait_for_status(&a.handle, ConnectionStatus::Degraded).await;
    assert!(!a.store.get_all().await.online);

    for level in 1..=5u8 {
        a.store
            .update_device(Category::Tanks, "lpg", DeviceValue::Tank { level }, Origin::Bus);
    }
    a.store.get_all().await;

    let listener = TcpListener::bind(addr).await.unwrap();
    let (_hub, _cancel) = start_hub_on(listener).await;
    let mut observer = raw_client(addr, "observer").await;

    a.handle.reconnect();
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;

    for expected in 1..=5u8 {
        let envelope = next_envelope(&mut observer).await;
        assert_eq!(envelope.kind, EnvelopeKind::StateUpdate);
        assert_eq!(envelope.source_device_id, "panel");
        assert_eq!(
            envelope.partial().unwrap()["lpg"],
            DeviceValue::Tank { level: expected }
        );
    }

    let tree = db.open_tree(OFFLINE_QUEUE_TREE).unwrap();
    for _ in 0..50 {
        if tree.is_empty() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(tree.is_empty());
    assert!(a.store.get_all().await.online);
}

#[tokio::test]
async fn test_late_joiner_receives_initial_sync() {
    let (addr, hub, _cancel) = start_hub().await;
    let config = hub_config(addr);
    let a = start_device("panel", &config, OfflineQueue::in_memory(16));
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;

    a.store
        .update_device(Category::Tanks, "fresh_water", DeviceValue::Tank { level: 75 }, Origin::Bus);
    for _ in 0..150 {
        if hub.snapshot()["tanks"]["fresh_water"]["level"] == 75 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    let b = start_device("tablet", &config, OfflineQueue::in_memory(16));
    let entry = wait_for_entry(&b.store, Category::Tanks, "fresh_water").await;
    assert_eq!(entry.value, DeviceValue::Tank { level: 75 });
    assert_eq!(entry.origin, Origin::Remote);
}

#[tokio::test]
async fn test_reconnect_keeps_own_bus_values() {
    let (addr, hub, _cancel) = start_hub().await;
    let a = start_device("panel", &hub_config(addr), OfflineQueue::in_memory(16));
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;

    a.store
        .update_device(Category::Lights, "porch", light(true, 40), Origin::Bus);
    for _ in 0..150 {
        if hub.snapshot()["lights"]["porch"]["brightness"] == 40 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    // newer local reading while the hub still holds 40
    a.store.update_device(Category::Lights, "porch", light(true, 90), Origin::Bus);
    a.handle.reconnect();
    sleep(Duration::from_millis(300)).await;
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;
    sleep(Duration::from_millis(200)).await;

    let entry = wait_for_entry(&a.store, Category::Lights, "porch").await;
    assert_eq!(entry.value, light(true, 90));
    assert_eq!(entry.origin, Origin::Bus);
}

#[tokio::test]
async fn test_raw_frames_relayed_to_other_devices() {
    let (addr, _hub, _cancel) = start_hub().await;
    let config = hub_config(addr);
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let gateway = start_device_with_relay("gateway", &config, OfflineQueue::in_memory(16), Some(relay_rx));
    let mut panel = start_device("panel", &config, OfflineQueue::in_memory(16));
    wait_for_status(&gateway.handle, ConnectionStatus::Connected).await;
    wait_for_status(&panel.handle, ConnectionStatus::Connected).await;

    let frame = Frame::new("can0", 0x19FEDA9F, vec![0x1A, 0xFF, 0xC8, 0xFC], 5);
    relay_tx.send(RawFrameData::from(&frame)).unwrap();

    let received = timeout(Duration::from_secs(5), panel.frames_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, frame);
}

#[tokio::test]
async fn test_shutdown_reports_disconnected() {
    let (addr, _hub, _cancel) = start_hub().await;
    let a = start_device("panel", &hub_config(addr), OfflineQueue::in_memory(4));
    wait_for_status(&a.handle, ConnectionStatus::Connected).await;

    let status = a.handle.subscribe_status();
    a.handle.join().await;
    assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
}

/// Accepts TCP connections and never answers the websocket upgrade
async fn start_silent_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

#[tokio::test]
async fn test_join_during_stalled_handshake() {
    let addr = start_silent_listener().await;
    let a = start_device("panel", &hub_config(addr), OfflineQueue::in_memory(4));
    sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(3), a.handle.join())
        .await
        .expect("client stuck in handshake");
}

#[tokio::test]
async fn test_stalled_handshake_counts_as_failed_attempt() {
    let addr = start_silent_listener().await;
    let mut config = hub_config(addr);
    config.reconnect.max_attempts = 2;
    config.watchdog = WatchdogSettings {
        ping_interval_ms: 50,
        idle_timeout_ms: 150,
    };
    let a = start_device("panel", &config, OfflineQueue::in_memory(4));

    wait_for_status(&a.handle, ConnectionStatus::Degraded).await;
    a.handle.join().await;
}
