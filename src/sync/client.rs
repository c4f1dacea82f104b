//! Hub client - duplex websocket with offline queue and auto-reconnect
//!
//! One background task owns the connection. It relays bus-origin deltas
//! from the state store to the hub, merges deltas from other devices back
//! into the store as origin `remote`, and feeds relayed raw frames to the
//! router. While the hub is unreachable, deltas go to the offline queue and
//! are drained oldest-first as soon as a connection is back.

use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::backoff::ReconnectPolicy;
use super::envelope::{EnvelopeKind, IdentityClaim, SyncEnvelope};
use super::error::SyncError;
use super::queue::{OfflineQueue, QueuedEnvelope};
use super::status::ConnectionStatus;
use crate::bus::{Frame, RawFrameData};
use crate::config::HubConfig;
use crate::state::{Origin, StateActorHandle, StateChange};

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Requests from the handle to the client task
#[derive(Debug)]
enum Control {
    Reconnect,
}

/// How a connected session ended without an error
enum SessionEnd {
    Shutdown,
    Reconnect,
}

/// What interrupted a backoff wait
enum Wake {
    Elapsed,
    Reconnect,
    Shutdown,
}

/// Configured hub client, ready to spawn
pub struct SyncClient {
    device_id: String,
    url: String,
    policy: ReconnectPolicy,
    ping_interval: Duration,
    idle_timeout: Duration,
    store: StateActorHandle,
    outbound_rx: mpsc::UnboundedReceiver<StateChange>,
    relay_rx: Option<mpsc::UnboundedReceiver<RawFrameData>>,
    frames_tx: Option<mpsc::UnboundedSender<Frame>>,
    queue: OfflineQueue,
}

impl SyncClient {
    /// Build a client for `device_id`
    ///
    /// `outbound_rx` is the receiving side of the store's outbound channel.
    pub fn new(
        device_id: impl Into<String>,
        config: &HubConfig,
        store: StateActorHandle,
        outbound_rx: mpsc::UnboundedReceiver<StateChange>,
        queue: OfflineQueue,
    ) -> Result<Self, SyncError> {
        validate_url(&config.url)?;
        Ok(Self {
            device_id: device_id.into(),
            url: config.url.clone(),
            policy: ReconnectPolicy::from_settings(&config.reconnect),
            ping_interval: Duration::from_millis(config.watchdog.ping_interval_ms.max(1)),
            idle_timeout: Duration::from_millis(config.watchdog.idle_timeout_ms),
            store,
            outbound_rx,
            relay_rx: None,
            frames_tx: None,
            queue,
        })
    }

    /// Relay local raw frames to the hub
    pub fn with_relay(mut self, relay_rx: mpsc::UnboundedReceiver<RawFrameData>) -> Self {
        self.relay_rx = Some(relay_rx);
        self
    }

    /// Deliver frames relayed by other devices
    pub fn with_frame_sink(mut self, frames_tx: mpsc::UnboundedSender<Frame>) -> Self {
        self.frames_tx = Some(frames_tx);
        self
    }

    /// Start the connection task
    pub fn spawn(self, cancel: CancellationToken) -> SyncHandle {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let task = ClientTask {
            client: self,
            status_tx,
            control_rx,
            cancel: cancel.clone(),
            outbound_open: true,
        };
        let join = tokio::spawn(task.run());

        SyncHandle {
            status_rx,
            control_tx,
            cancel,
            join: Some(join),
        }
    }
}

/// Handle to the running hub client
pub struct SyncHandle {
    status_rx: watch::Receiver<ConnectionStatus>,
    control_tx: mpsc::UnboundedSender<Control>,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Drop the current connection (if any) and start a fresh attempt cycle
    pub fn reconnect(&self) {
        let _ = self.control_tx.send(Control::Reconnect);
    }

    /// Stop the client task
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Stop the client task and wait for it to finish
    pub async fn join(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!("Sync client task ended abnormally: {}", e);
            }
        }
    }
}

struct ClientTask {
    client: SyncClient,
    status_tx: watch::Sender<ConnectionStatus>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
    /// Cleared once the store side of the outbound channel is gone
    outbound_open: bool,
}

impl ClientTask {
    /// Main loop: connect -> session -> on error, backoff -> reconnect
    async fn run(mut self) {
        let mut attempt: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            info!(url = %self.client.url, "Connecting to hub");
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connect() => result,
            };
            match connected {
                Ok(ws) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    let result = self.session(ws).await;
                    self.set_status(ConnectionStatus::Disconnected);
                    match result {
                        Ok(SessionEnd::Shutdown) => break,
                        Ok(SessionEnd::Reconnect) => {
                            info!("Manual reconnect requested");
                            continue;
                        }
                        Err(e) => warn!(error = %e, "Hub connection lost"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Hub connection failed");
                }
            }

            match self.client.policy.next_delay(attempt) {
                Some(delay) => {
                    attempt += 1;
                    self.set_status(ConnectionStatus::Reconnecting { attempt });
                    info!(
                        delay_ms = delay.as_millis() as u64,
                        attempt, "Waiting before reconnect"
                    );
                    match self.wait(Some(delay)).await {
                        Wake::Elapsed => {}
                        Wake::Reconnect => attempt = 0,
                        Wake::Shutdown => break,
                    }
                }
                None => {
                    self.set_status(ConnectionStatus::Degraded);
                    warn!(
                        max_attempts = self.client.policy.max_attempts,
                        "Hub unreachable, running degraded until a manual reconnect"
                    );
                    match self.wait(None).await {
                        Wake::Shutdown => break,
                        Wake::Elapsed | Wake::Reconnect => attempt = 0,
                    }
                }
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        self.client.queue.flush();
        debug!(pending = self.client.queue.len(), "Sync client stopped");
    }

    /// Open the websocket; a hub that never finishes the handshake counts
    /// as a failed attempt after `idle_timeout`
    async fn connect(&self) -> Result<HubStream, SyncError> {
        let limit = self.client.idle_timeout;
        let handshake = tokio_tungstenite::connect_async(self.client.url.as_str());
        match tokio::time::timeout(limit, handshake).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(SyncError::ConnectTimeout(limit)),
        }
    }

    /// One connected session; returns when the connection ends
    async fn session(&mut self, ws: HubStream) -> Result<SessionEnd, SyncError> {
        let (mut sink, mut stream) = ws.split();

        let claim = serde_json::to_string(&IdentityClaim {
            device_id: self.client.device_id.clone(),
        })?;
        sink.send(Message::Text(claim)).await?;

        // Queued deltas go out before anything new
        let mut drained = 0usize;
        while let Some(entry) = self.client.queue.front() {
            let json = entry.to_envelope(&self.client.device_id)?.to_json()?;
            sink.send(Message::Text(json)).await?;
            self.client.queue.pop_front();
            drained += 1;
        }
        if drained > 0 {
            info!(drained, "Offline queue delivered");
        }

        let mut ping = tokio::time::interval(self.client.ping_interval);
        ping.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                control = self.control_rx.recv(), if !self.control_rx.is_closed() => {
                    if let Some(Control::Reconnect) = control {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Reconnect);
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            self.handle_inbound(&text);
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "Hub sent close frame");
                            return Err(SyncError::Closed);
                        }
                        Some(Ok(_)) => {
                            // Ping, pong, binary
                            last_seen = Instant::now();
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Err(SyncError::Closed),
                    }
                }
                change = self.client.outbound_rx.recv(), if self.outbound_open => {
                    let Some(change) = change else {
                        debug!("Store outbound channel closed");
                        self.outbound_open = false;
                        continue;
                    };
                    let entry = queued_from_change(change);
                    let json = entry.to_envelope(&self.client.device_id)?.to_json()?;
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        self.client.queue.push(entry);
                        return Err(e.into());
                    }
                }
                frame = recv_relay(&mut self.client.relay_rx) => {
                    if let Some(data) = frame {
                        let json = SyncEnvelope::raw_frame(&self.client.device_id, data).to_json()?;
                        sink.send(Message::Text(json)).await?;
                    } else {
                        self.client.relay_rx = None;
                    }
                }
                _ = ping.tick() => {
                    let idle = last_seen.elapsed();
                    if idle >= self.client.idle_timeout {
                        return Err(SyncError::IdleTimeout(idle));
                    }
                    sink.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    /// Wait out a backoff delay (or indefinitely when `None`)
    ///
    /// Deltas keep arriving while disconnected; they are queued here.
    async fn wait(&mut self, delay: Option<Duration>) -> Wake {
        let sleep = async {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Wake::Shutdown,
                control = self.control_rx.recv(), if !self.control_rx.is_closed() => {
                    if let Some(Control::Reconnect) = control {
                        return Wake::Reconnect;
                    }
                }
                change = self.client.outbound_rx.recv(), if self.outbound_open => {
                    match change {
                        Some(change) => {
                            self.client.queue.push(queued_from_change(change));
                        }
                        None => self.outbound_open = false,
                    }
                }
                frame = recv_relay(&mut self.client.relay_rx) => {
                    if frame.is_none() {
                        self.client.relay_rx = None;
                    } else {
                        trace!("Hub offline, raw frame not relayed");
                    }
                }
                _ = &mut sleep => return Wake::Elapsed,
            }
        }
    }

    /// Apply one text frame from the hub
    fn handle_inbound(&self, text: &str) {
        let envelope = match SyncEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed hub message");
                return;
            }
        };

        if envelope.source_device_id == self.client.device_id {
            trace!(kind = ?envelope.kind, "Dropping own envelope");
            return;
        }

        match envelope.kind {
            EnvelopeKind::StateUpdate => {
                let Some(category) = envelope.category else {
                    warn!(source = %envelope.source_device_id, "State update without category");
                    return;
                };
                match envelope.partial() {
                    Ok(partial) if !partial.is_empty() => {
                        debug!(source = %envelope.source_device_id, %category, devices = partial.len(), "Merging remote update");
                        self.client.store.update_category(category, partial, Origin::Remote);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(source = %envelope.source_device_id, error = %e, "Unreadable state update"),
                }
            }
            EnvelopeKind::InitialSync => {
                let categories = envelope.initial_sync_categories();
                info!(categories = categories.len(), "Applying initial sync from hub");
                for (category, partial) in categories {
                    self.client.store.merge_initial_sync(category, partial);
                }
            }
            EnvelopeKind::RawFrameRelay => {
                let Some(frame) = envelope.data.as_ref().and_then(RawFrameData::to_frame) else {
                    warn!(source = %envelope.source_device_id, "Invalid relayed frame");
                    return;
                };
                if let Some(frames_tx) = &self.client.frames_tx {
                    let _ = frames_tx.send(frame);
                }
            }
            EnvelopeKind::CommandExecuted => {
                info!(source = %envelope.source_device_id, payload = ?envelope.payload, "Command executed");
            }
            EnvelopeKind::SubscriptionAck => {
                debug!("Hub acknowledged identity");
            }
            EnvelopeKind::Error => {
                warn!(message = envelope.error_message().unwrap_or("unknown"), "Hub reported an error");
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            debug!(%status, "Hub connection status");
            self.client.store.set_online(status.is_connected());
        }
    }
}

fn queued_from_change(change: StateChange) -> QueuedEnvelope {
    QueuedEnvelope {
        category: change.category,
        payload: change.partial,
        enqueued_at: change.at,
    }
}

async fn recv_relay(rx: &mut Option<mpsc::UnboundedReceiver<RawFrameData>>) -> Option<RawFrameData> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn validate_url(url: &str) -> Result<(), SyncError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(SyncError::InvalidUrl {
            url: url.to_string(),
            reason: "scheme must be ws or wss".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("ws://127.0.0.1:8787/sync").is_ok());
        assert!(validate_url("wss://hub.local/sync").is_ok());
        assert!(matches!(
            validate_url("http://hub.local"),
            Err(SyncError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_bad_url() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let store = StateActorHandle::spawn("panel", None, None);
        let config = HubConfig {
            url: "tcp://nowhere".to_string(),
            ..HubConfig::default()
        };
        assert!(SyncClient::new("panel", &config, store, rx, OfflineQueue::in_memory(4)).is_err());
    }

    #[tokio::test]
    async fn test_recv_relay_none_is_pending() {
        let mut rx = None;
        let result = tokio::time::timeout(Duration::from_millis(20), recv_relay(&mut rx)).await;
        assert!(result.is_err());
    }
}
