//! Gateway WebSocket protocol definitions.
//!
//! Protocol version 1. All communication uses newline-free JSON frames over
//! WebSocket text (or UTF-8 binary) messages.
//!
//! Frame types:
//! - `hello`        — client → gateway, first frame of every connection
//! - `hello-ok`     — gateway → client, handshake accepted (carries snapshot)
//! - `hello-error`  — gateway → client, handshake rejected
//! - `req`          — client → gateway RPC call
//! - `res`          — gateway → client RPC result
//! - `event`        — gateway → client server-push, sequence-numbered

use serde::{Deserialize, Serialize};

pub mod validate;

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_PAYLOAD_BYTES: usize = 524_288; // 512 KiB
pub const MAX_BUFFERED_BYTES: usize = 1_572_864; // 1.5 MiB
pub const HANDSHAKE_TIMEOUT_MS: u64 = 3_000; // 3s
pub const TICK_INTERVAL_MS: u64 = 30_000; // 30s
pub const DEDUPE_TTL_MS: u64 = 300_000; // 5 min
pub const DEDUPE_MAX_ENTRIES: usize = 1_000;
pub const DEDUPE_SWEEP_INTERVAL_MS: u64 = 60_000; // 60s
pub const PRESENCE_TTL_MS: u64 = 300_000; // 5 min
pub const PRESENCE_MAX_ENTRIES: usize = 200;
pub const DEFAULT_PORT: u16 = 18789;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const AGENT_TIMEOUT: &str = "AGENT_TIMEOUT";
    pub const NOT_LINKED: &str = "NOT_LINKED";
}

// ── Methods and events ───────────────────────────────────────────────────────

pub mod methods {
    pub const HEALTH: &str = "health";
    pub const STATUS: &str = "status";
    pub const SYSTEM_PRESENCE: &str = "system-presence";
    pub const SYSTEM_EVENT: &str = "system-event";
    pub const SET_HEARTBEATS: &str = "set-heartbeats";
    pub const SEND: &str = "send";
    pub const AGENT: &str = "agent";

    /// Closed method set, advertised in `hello-ok.features.methods`.
    pub const ALL: &[&str] = &[
        HEALTH,
        STATUS,
        SYSTEM_PRESENCE,
        SYSTEM_EVENT,
        SET_HEARTBEATS,
        SEND,
        AGENT,
    ];
}

pub mod events {
    pub const TICK: &str = "tick";
    pub const PRESENCE: &str = "presence";
    pub const AGENT: &str = "agent";
    pub const SHUTDOWN: &str = "shutdown";

    /// Closed event set, advertised in `hello-ok.features.events`.
    pub const ALL: &[&str] = &[TICK, PRESENCE, AGENT, SHUTDOWN];
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_REQUEST, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        let mut shape = Self::new(error_codes::UNAVAILABLE, message);
        shape.retryable = Some(true);
        shape
    }

    pub fn with_retry_after_ms(mut self, ms: u64) -> Self {
        self.retryable = Some(true);
        self.retry_after_ms = Some(ms);
        self
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Discriminated union of all frame types, tagged by `type`.
///
/// Dispatch sites match exhaustively so adding a variant is a compile error
/// at every handler until addressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "hello")]
    Hello(HelloParams),
    #[serde(rename = "hello-ok")]
    HelloOk(HelloOk),
    #[serde(rename = "hello-error")]
    HelloError(HelloError),
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Client → gateway RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventFrame {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(rename = "stateVersion", skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value, seq: u64) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: None,
        }
    }
}

/// Pair of monotone counters broadcast with relevant events so clients can
/// detect missed updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateVersion {
    pub presence: u64,
    pub health: u64,
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// First frame of every connection, client → gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
    pub platform: String,
    /// Free-form, conventionally one of `app`, `cli`, `webchat`, `backend`.
    pub mode: String,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectAuth {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// Sent by the gateway after a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloOk {
    pub protocol: u32,
    pub server: ServerInfo,
    pub features: Features,
    pub snapshot: Snapshot,
    pub policy: Policy,
}

/// Sent by the gateway when the handshake is rejected, then the socket closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelloError {
    pub reason: String,
    #[serde(rename = "expectedProtocol", skip_serializing_if = "Option::is_none")]
    pub expected_protocol: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerInfo {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "connId")]
    pub conn_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Features {
    pub methods: Vec<String>,
    pub events: Vec<String>,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            methods: methods::ALL.iter().map(|m| (*m).to_string()).collect(),
            events: events::ALL.iter().map(|e| (*e).to_string()).collect(),
        }
    }
}

/// Complete view of presence + health + state versions at handshake time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub presence: Vec<PresenceEntry>,
    /// Opaque health object from the health port.
    pub health: serde_json::Value,
    #[serde(rename = "stateVersion")]
    pub state_version: StateVersion,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(rename = "maxPayload")]
    pub max_payload: usize,
    #[serde(rename = "maxBufferedBytes")]
    pub max_buffered_bytes: usize,
    #[serde(rename = "tickIntervalMs")]
    pub tick_interval_ms: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_BYTES,
            max_buffered_bytes: MAX_BUFFERED_BYTES,
            tick_interval_ms: TICK_INTERVAL_MS,
        }
    }
}

// ── Presence ─────────────────────────────────────────────────────────────────

/// One known client or self node, with metadata and a last-seen timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PresenceEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "lastInputSeconds", skip_serializing_if = "Option::is_none")]
    pub last_input_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Last-seen wall-clock timestamp, milliseconds since the epoch.
    pub ts: u64,
    #[serde(rename = "instanceId", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

// ── Method params ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendParams {
    pub to: String,
    pub message: String,
    #[serde(rename = "mediaUrl", skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentParams {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deliver: Option<bool>,
    /// Caller-supplied deadline in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemEventParams {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetHeartbeatsParams {
    pub enabled: bool,
}

// ── Agent event bus payload ──────────────────────────────────────────────────

/// One streamed agent event, published by the agent runtime and re-broadcast
/// to every ready connection as `event{event:"agent"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "runId")]
    pub run_id: String,
    pub stream: String,
    pub seq: u64,
    pub ts: u64,
    pub data: serde_json::Value,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ── Frame round-trips ──────────────────────────────────────────────

    #[test]
    fn hello_round_trip() {
        let json = serde_json::json!({
            "type": "hello",
            "minProtocol": 1,
            "maxProtocol": 1,
            "client": { "name": "t", "version": "1", "platform": "test", "mode": "test" },
        });
        let frame: Frame = serde_json::from_value(json).unwrap();
        match &frame {
            Frame::Hello(hello) => {
                assert_eq!(hello.min_protocol, 1);
                assert_eq!(hello.client.name, "t");
                assert!(hello.auth.is_none());
                assert!(hello.caps.is_empty());
            },
            other => panic!("expected hello frame, got {other:?}"),
        }
        let encoded = serde_json::to_string(&frame).unwrap();
        let decoded: Frame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn request_frame_round_trip() {
        let json = r#"{"type":"req","id":"a1","method":"send","params":{"to":"+1","message":"hi","idempotencyKey":"K"}}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match &frame {
            Frame::Request(req) => {
                assert_eq!(req.id, "a1");
                assert_eq!(req.method, "send");
                assert!(req.params.is_some());
            },
            other => panic!("expected req frame, got {other:?}"),
        }
        let encoded = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&encoded).unwrap(),
            serde_json::from_str::<serde_json::Value>(json).unwrap(),
        );
    }

    #[test]
    fn response_omits_absent_members() {
        let res = ResponseFrame::ok("a1", serde_json::json!({"ok": true}));
        let json = serde_json::to_value(Frame::Response(res)).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("error"));
        assert_eq!(json["type"], "res");
        assert_eq!(json["ok"], true);
    }

    #[test]
    fn event_frame_round_trip_with_state_version() {
        let mut event = EventFrame::new("presence", serde_json::json!({"presence": []}), 7);
        event.state_version = Some(StateVersion {
            presence: 3,
            health: 1,
        });
        let encoded = serde_json::to_string(&Frame::Event(event.clone())).unwrap();
        let decoded: Frame = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, Frame::Event(event));
    }

    #[test]
    fn unknown_members_are_rejected() {
        let json = r#"{"type":"req","id":"a1","method":"health","extra":true}"#;
        assert!(serde_json::from_str::<Frame>(json).is_err());
    }

    #[test]
    fn hello_error_carries_expected_protocol() {
        let frame = Frame::HelloError(HelloError {
            reason: "protocol mismatch".into(),
            expected_protocol: Some(PROTOCOL_VERSION),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "hello-error");
        assert_eq!(json["expectedProtocol"], 1);
    }

    // ── Error shape ────────────────────────────────────────────────────

    #[test]
    fn unavailable_is_retryable() {
        let shape = ErrorShape::unavailable("delivery port down").with_retry_after_ms(5_000);
        assert_eq!(shape.code, error_codes::UNAVAILABLE);
        assert_eq!(shape.retryable, Some(true));
        assert_eq!(shape.retry_after_ms, Some(5_000));
    }

    // ── Defaults ───────────────────────────────────────────────────────

    #[test]
    fn policy_default_matches_constants() {
        let policy = Policy::default();
        assert_eq!(policy.max_payload, MAX_PAYLOAD_BYTES);
        assert_eq!(policy.max_buffered_bytes, MAX_BUFFERED_BYTES);
        assert_eq!(policy.tick_interval_ms, TICK_INTERVAL_MS);
    }

    #[test]
    fn features_default_lists_closed_sets() {
        let features = Features::default();
        assert!(features.methods.iter().any(|m| m == "agent"));
        assert!(features.events.iter().any(|e| e == "shutdown"));
        assert_eq!(features.methods.len(), methods::ALL.len());
    }

    // ── Method params ──────────────────────────────────────────────────

    #[test]
    fn agent_params_defaults_optional_fields() {
        let raw = r#"{"message":"hi","idempotencyKey":"I"}"#;
        let params: AgentParams = serde_json::from_str(raw).unwrap();
        assert_eq!(params.message, "hi");
        assert_eq!(params.idempotency_key, "I");
        assert!(params.to.is_none());
        assert!(params.session_id.is_none());
        assert!(params.timeout.is_none());
    }

    #[test]
    fn send_params_reject_unknown_members() {
        let raw = r#"{"to":"+1","message":"hi","idempotencyKey":"K","channel":"x"}"#;
        assert!(serde_json::from_str::<SendParams>(raw).is_err());
    }
}
