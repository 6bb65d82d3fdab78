//! Server-initiated event fan-out.
//!
//! One process-wide sequence counter is assigned before the frame is
//! serialized; the serialized frame is then delivered to a stable
//! snapshot of the connection set. Per connection, delivery honors the
//! backpressure policy in [`crate::state::ClientHandle::send_frame`].

use std::sync::Arc;

use serde_json::{Value, json};

use clawdis_protocol::{EventFrame, Frame, StateVersion, events};

use crate::state::{GatewayState, SendOutcome, now_ms};

#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastOpts {
    /// Skip saturated connections instead of closing them. Only `tick`
    /// sets this.
    pub droppable: bool,
    pub state_version: Option<StateVersion>,
}

/// Broadcast one event to every connected client. Returns the assigned
/// sequence number.
///
/// Sequence assignment and per-connection enqueue happen inside one
/// critical section, so events reach every connection in counter order
/// even when broadcasts race. Enqueueing never blocks, so holding the
/// lock across the loop is safe.
pub async fn broadcast(
    state: &Arc<GatewayState>,
    event: &str,
    payload: Value,
    opts: BroadcastOpts,
) -> u64 {
    let inner = state.inner.write().await;
    let seq = state.next_seq();
    let mut frame = EventFrame::new(event, payload, seq);
    frame.state_version = opts.state_version;

    let json = match serde_json::to_string(&Frame::Event(frame)) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(event, error = %err, "failed to serialize event frame");
            return seq;
        },
    };

    for (conn_id, client) in &inner.clients {
        match client.send_frame(&json, opts.droppable) {
            SendOutcome::Sent => {},
            SendOutcome::Dropped => {
                tracing::debug!(conn_id = %conn_id, event, "dropped event for slow consumer");
            },
            SendOutcome::SlowConsumer => {
                tracing::warn!(conn_id = %conn_id, event, "closing slow consumer");
            },
            SendOutcome::Gone => {},
        }
    }
    seq
}

/// Periodic keepalive. Droppable: a saturated connection misses it.
pub async fn broadcast_tick(state: &Arc<GatewayState>) -> u64 {
    broadcast(
        state,
        events::TICK,
        json!({ "ts": now_ms() }),
        BroadcastOpts {
            droppable: true,
            state_version: None,
        },
    )
    .await
}

/// Presence list broadcast, sent after every registry mutation with the
/// updated state versions.
pub async fn broadcast_presence(state: &Arc<GatewayState>) -> u64 {
    let presence = {
        let mut inner = state.inner.write().await;
        inner.presence.list(now_ms())
    };
    let state_version = state.state_version().await;
    broadcast(
        state,
        events::PRESENCE,
        json!({ "presence": presence }),
        BroadcastOpts {
            droppable: false,
            state_version: Some(state_version),
        },
    )
    .await
}

/// One-shot shutdown notice. `restart_expected_ms` is omitted from the
/// wire when unknown.
pub async fn broadcast_shutdown(
    state: &Arc<GatewayState>,
    reason: &str,
    restart_expected_ms: Option<u64>,
) -> u64 {
    let mut payload = json!({ "reason": reason });
    if let Some(ms) = restart_expected_ms {
        payload["restartExpectedMs"] = json!(ms);
    }
    broadcast(state, events::SHUTDOWN, payload, BroadcastOpts::default()).await
}
