//! Shared gateway runtime state.
//!
//! Immutable configuration and atomics live directly on [`GatewayState`];
//! all mutable runtime state (connections, presence, dedupe) is
//! consolidated in [`GatewayInner`] behind a single `RwLock`. State is
//! constructed on server start and passed around as `Arc` — tests build
//! fresh instances instead of relying on ambient globals.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};

use tokio::sync::{RwLock, mpsc};

use clawdis_protocol::{
    ClientInfo, MAX_BUFFERED_BYTES, Snapshot, StateVersion,
};

use crate::{dedupe::DedupeCache, presence::PresenceRegistry, services::GatewayServices};

/// Wall-clock milliseconds since the epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Configuration ────────────────────────────────────────────────────────────

/// Startup configuration. The environment is the only configuration
/// surface at this layer.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Shared secret every hello must present when set.
    pub token: Option<String>,
    /// Reported server version; falls back to the crate version.
    pub version: Option<String>,
    /// Reported commit hash.
    pub commit: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            token: env_nonempty("CLAWDIS_GATEWAY_TOKEN"),
            version: env_nonempty("CLAWDIS_VERSION"),
            commit: env_nonempty("GIT_COMMIT"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// ── Outbound frames ──────────────────────────────────────────────────────────

/// One item on a connection's outbound queue, drained by its write loop.
#[derive(Debug)]
pub enum Outbound {
    Frame { json: String, droppable: bool },
    Close { code: u16, reason: String },
}

/// Result of enqueueing a frame for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Droppable frame skipped because the connection is saturated.
    Dropped,
    /// Non-droppable frame hit the high-water mark; a close was enqueued.
    SlowConsumer,
    /// The write loop is gone.
    Gone,
}

/// Cloneable sending side of one connection, used by broadcasts so the
/// client map lock is not held across sends.
#[derive(Clone)]
pub struct ClientHandle {
    pub conn_id: String,
    sender: mpsc::UnboundedSender<Outbound>,
    buffered_bytes: Arc<AtomicUsize>,
    max_buffered: usize,
}

impl ClientHandle {
    /// Enqueue a serialized frame, honoring the buffered-bytes high-water
    /// mark: droppable frames are skipped for a saturated connection,
    /// non-droppable ones close it (1008 "slow consumer").
    pub fn send_frame(&self, json: &str, droppable: bool) -> SendOutcome {
        let len = json.len();
        if self.buffered_bytes.load(Ordering::Relaxed) > self.max_buffered {
            if droppable {
                return SendOutcome::Dropped;
            }
            let _ = self.sender.send(Outbound::Close {
                code: 1008,
                reason: "slow consumer".into(),
            });
            return SendOutcome::SlowConsumer;
        }
        self.buffered_bytes.fetch_add(len, Ordering::Relaxed);
        match self.sender.send(Outbound::Frame {
            json: json.to_string(),
            droppable,
        }) {
            Ok(()) => SendOutcome::Sent,
            Err(_) => {
                self.buffered_bytes.fetch_sub(len, Ordering::Relaxed);
                SendOutcome::Gone
            },
        }
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.sender.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

// ── Connected client ─────────────────────────────────────────────────────────

/// A WebSocket client that has completed the handshake.
pub struct ConnectedClient {
    pub conn_id: String,
    /// Descriptor from the hello frame.
    pub client: ClientInfo,
    pub connected_at: Instant,
    /// Reserved acknowledgement surface for `set-heartbeats`.
    pub heartbeats_enabled: bool,
    sender: mpsc::UnboundedSender<Outbound>,
    buffered_bytes: Arc<AtomicUsize>,
    max_buffered: usize,
}

impl ConnectedClient {
    pub fn new(
        conn_id: String,
        client: ClientInfo,
        sender: mpsc::UnboundedSender<Outbound>,
        buffered_bytes: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            conn_id,
            client,
            connected_at: Instant::now(),
            heartbeats_enabled: true,
            sender,
            buffered_bytes,
            max_buffered: MAX_BUFFERED_BYTES,
        }
    }

    #[cfg(test)]
    pub fn with_max_buffered(mut self, max_buffered: usize) -> Self {
        self.max_buffered = max_buffered;
        self
    }

    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            conn_id: self.conn_id.clone(),
            sender: self.sender.clone(),
            buffered_bytes: Arc::clone(&self.buffered_bytes),
            max_buffered: self.max_buffered,
        }
    }

    pub fn send_frame(&self, json: &str, droppable: bool) -> SendOutcome {
        self.handle().send_frame(json, droppable)
    }
}

// ── Mutable runtime state ────────────────────────────────────────────────────

/// All mutable runtime state, protected by the single `RwLock` on
/// [`GatewayState`].
pub struct GatewayInner {
    /// All connected clients, keyed by conn id.
    pub clients: HashMap<String, ConnectedClient>,
    /// Presence registry (TTL map + version counter).
    pub presence: PresenceRegistry,
    /// Idempotency cache for mutating methods.
    pub dedupe: DedupeCache,
}

impl GatewayInner {
    fn new(hostname: &str, app_version: &str) -> Self {
        Self {
            clients: HashMap::new(),
            presence: PresenceRegistry::new(hostname, app_version),
            dedupe: DedupeCache::new(),
        }
    }

    pub fn register_client(&mut self, client: ConnectedClient) -> usize {
        let conn_id = client.conn_id.clone();
        self.clients.insert(conn_id, client);
        self.clients.len()
    }

    pub fn remove_client(&mut self, conn_id: &str) -> Option<ConnectedClient> {
        self.clients.remove(conn_id)
    }

    /// Stable snapshot of every connection's sending side.
    pub fn client_handles(&self) -> Vec<ClientHandle> {
        self.clients.values().map(ConnectedClient::handle).collect()
    }
}

// ── Gateway state ────────────────────────────────────────────────────────────

/// Shared gateway runtime state, wrapped in `Arc` for use across tasks.
pub struct GatewayState {
    /// Reported server version (`CLAWDIS_VERSION` or the crate version).
    pub version: String,
    /// Reported commit (`GIT_COMMIT`).
    pub commit: Option<String>,
    /// Hostname for the hello-ok server info and the self presence entry.
    pub hostname: String,
    /// Shared-secret token; `None` disables authentication.
    pub auth_token: Option<String>,
    /// Domain services.
    pub services: GatewayServices,
    /// Agent event bus; the server takes the single subscriber at startup.
    pub bus: crate::bus::AgentEventBus,
    /// Monotonic process start for uptime calculations.
    pub started_at: Instant,

    /// Monotonically increasing sequence counter for broadcast events.
    seq: AtomicU64,
    /// Health snapshot version, bumped whenever the health port is read.
    health_version: AtomicU64,

    /// All mutable runtime state, behind a single lock.
    pub inner: RwLock<GatewayInner>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, services: GatewayServices) -> Arc<Self> {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".into());
        let version = config
            .version
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        Arc::new(Self {
            inner: RwLock::new(GatewayInner::new(&hostname, &version)),
            version,
            commit: config.commit,
            hostname,
            auth_token: config.token,
            services,
            bus: crate::bus::AgentEventBus::new(),
            started_at: Instant::now(),
            seq: AtomicU64::new(0),
            health_version: AtomicU64::new(0),
        })
    }

    /// Next broadcast sequence number, assigned before serialization.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn uptime_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn state_version(&self) -> StateVersion {
        StateVersion {
            presence: self.inner.read().await.presence.version(),
            health: self.health_version.load(Ordering::Relaxed),
        }
    }

    /// Build the handshake snapshot: current presence list, a fresh health
    /// read, state versions, uptime.
    pub async fn snapshot(&self) -> Snapshot {
        let health = match self.services.health.health().await {
            Ok(value) => {
                self.health_version.fetch_add(1, Ordering::Relaxed);
                value
            },
            Err(err) => {
                tracing::warn!(error = %err.message, "health snapshot unavailable");
                serde_json::Value::Null
            },
        };
        let (presence, presence_version) = {
            let mut inner = self.inner.write().await;
            let list = inner.presence.list(now_ms());
            (list, inner.presence.version())
        };
        Snapshot {
            presence,
            health,
            state_version: StateVersion {
                presence: presence_version,
                health: self.health_version.load(Ordering::Relaxed),
            },
            uptime_ms: self.uptime_ms(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) fn test_state() -> Arc<GatewayState> {
        GatewayState::new(GatewayConfig::default(), GatewayServices::noop())
    }

    pub(crate) fn test_client_info() -> ClientInfo {
        ClientInfo {
            name: "test".into(),
            version: "0.0.0".into(),
            platform: "test".into(),
            mode: "test".into(),
            instance_id: None,
        }
    }

    pub(crate) fn mock_client(conn_id: &str) -> (ConnectedClient, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = ConnectedClient::new(
            conn_id.to_string(),
            test_client_info(),
            tx,
            Arc::new(AtomicUsize::new(0)),
        );
        (client, rx)
    }

    #[test]
    fn seq_starts_at_one_and_increments() {
        let state = test_state();
        assert_eq!(state.next_seq(), 1);
        assert_eq!(state.next_seq(), 2);
        assert_eq!(state.next_seq(), 3);
    }

    #[tokio::test]
    async fn register_and_remove_clients() {
        let state = test_state();
        let (c1, _rx1) = mock_client("conn-1");
        let (c2, _rx2) = mock_client("conn-2");
        {
            let mut inner = state.inner.write().await;
            inner.register_client(c1);
            inner.register_client(c2);
        }
        assert_eq!(state.client_count().await, 2);
        assert!(
            state
                .inner
                .write()
                .await
                .remove_client("conn-1")
                .is_some()
        );
        assert_eq!(state.client_count().await, 1);
    }

    #[test]
    fn send_frame_tracks_buffered_bytes() {
        let (client, mut rx) = mock_client("c1");
        assert_eq!(client.send_frame("{\"a\":1}", false), SendOutcome::Sent);
        match rx.try_recv().unwrap() {
            Outbound::Frame { json, droppable } => {
                assert_eq!(json, "{\"a\":1}");
                assert!(!droppable);
            },
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn saturated_connection_drops_droppable_frames() {
        let (client, mut rx) = mock_client("c1");
        let client = client.with_max_buffered(8);
        // Fill past the high-water mark without draining.
        assert_eq!(client.send_frame("0123456789", false), SendOutcome::Sent);
        assert_eq!(client.send_frame("tick", true), SendOutcome::Dropped);
        // The queued frame is still the only item.
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn saturated_connection_closes_on_non_droppable() {
        let (client, mut rx) = mock_client("c1");
        let client = client.with_max_buffered(8);
        assert_eq!(client.send_frame("0123456789", false), SendOutcome::Sent);
        assert_eq!(
            client.send_frame("{\"event\":\"presence\"}", false),
            SendOutcome::SlowConsumer
        );
        // First the buffered frame, then the close.
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame { .. }));
        match rx.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "slow consumer");
            },
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[test]
    fn send_frame_reports_gone_after_receiver_drop() {
        let (client, rx) = mock_client("c1");
        drop(rx);
        assert_eq!(client.send_frame("{}", false), SendOutcome::Gone);
    }

    #[tokio::test]
    async fn snapshot_carries_presence_and_versions() {
        let state = test_state();
        {
            let mut inner = state.inner.write().await;
            inner
                .presence
                .record_connect(&test_client_info(), "conn-1", now_ms());
        }
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.state_version.presence, 1);
        assert_eq!(snapshot.state_version.health, 1);
        // Self entry plus the connect entry.
        assert_eq!(snapshot.presence.len(), 2);
    }
}
