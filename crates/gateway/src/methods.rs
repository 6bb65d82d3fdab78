//! Request routing: one handler per method in the closed set.
//!
//! The dispatcher guarantees exactly one response per accepted request.
//! Mutating methods (`send`, `agent`) consult the dedupe cache first and
//! store their completed outcome afterwards, so retries with the same
//! idempotency key replay the original result without touching the
//! collaborator port again.

use std::{sync::Arc, time::{Duration, Instant}};

use serde_json::json;

use clawdis_protocol::{
    AgentParams, ErrorShape, RequestFrame, ResponseFrame, SendParams, SetHeartbeatsParams,
    SystemEventParams, error_codes, methods,
    validate::{self, format_issues},
};

use crate::{
    broadcast::{BroadcastOpts, broadcast},
    dedupe::{CachedOutcome, DedupeCache},
    services::{AgentInvocation, DeliveryRequest},
    state::{GatewayState, now_ms},
};

/// Work the connection must perform after the response frame has been
/// enqueued, preserving write-then-read ordering on the originating
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    PresenceChanged,
}

pub struct DispatchOutcome {
    pub response: ResponseFrame,
    pub follow_up: Option<FollowUp>,
}

impl DispatchOutcome {
    fn reply(response: ResponseFrame) -> Self {
        Self {
            response,
            follow_up: None,
        }
    }
}

#[derive(Default)]
pub struct MethodRegistry;

impl MethodRegistry {
    pub fn new() -> Self {
        Self
    }

    /// Route a validated request to its handler.
    pub async fn dispatch(
        &self,
        state: &Arc<GatewayState>,
        conn_id: &str,
        req: RequestFrame,
    ) -> DispatchOutcome {
        if let Err(issues) = validate::method_params(&req.method, req.params.as_ref()) {
            return DispatchOutcome::reply(ResponseFrame::err(
                req.id,
                ErrorShape::invalid_request(format_issues(&issues)),
            ));
        }

        match req.method.as_str() {
            methods::HEALTH => health(state, req).await,
            methods::STATUS => status(state, req).await,
            methods::SYSTEM_PRESENCE => system_presence(state, req).await,
            methods::SYSTEM_EVENT => system_event(state, req).await,
            methods::SET_HEARTBEATS => set_heartbeats(state, conn_id, req).await,
            methods::SEND => send(state, req).await,
            methods::AGENT => agent(state, req).await,
            other => DispatchOutcome::reply(ResponseFrame::err(
                req.id.clone(),
                ErrorShape::invalid_request(format!("unknown method: {other}")),
            )),
        }
    }
}

// ── Read-only methods ────────────────────────────────────────────────────────

async fn health(state: &Arc<GatewayState>, req: RequestFrame) -> DispatchOutcome {
    DispatchOutcome::reply(match state.services.health.health().await {
        Ok(payload) => ResponseFrame::ok(req.id, payload),
        Err(shape) => ResponseFrame::err(req.id, shape),
    })
}

async fn status(state: &Arc<GatewayState>, req: RequestFrame) -> DispatchOutcome {
    DispatchOutcome::reply(match state.services.status.status().await {
        Ok(payload) => ResponseFrame::ok(req.id, payload),
        Err(shape) => ResponseFrame::err(req.id, shape),
    })
}

async fn system_presence(state: &Arc<GatewayState>, req: RequestFrame) -> DispatchOutcome {
    let presence = {
        let mut inner = state.inner.write().await;
        inner.presence.list(now_ms())
    };
    let payload = match serde_json::to_value(presence) {
        Ok(value) => value,
        Err(err) => {
            return DispatchOutcome::reply(ResponseFrame::err(
                req.id,
                ErrorShape::unavailable(err.to_string()),
            ));
        },
    };
    DispatchOutcome::reply(ResponseFrame::ok(req.id, payload))
}

// ── Mutating methods ─────────────────────────────────────────────────────────

async fn system_event(state: &Arc<GatewayState>, req: RequestFrame) -> DispatchOutcome {
    let params: SystemEventParams = match parse_params(&req) {
        Ok(params) => params,
        Err(response) => return DispatchOutcome::reply(response),
    };

    if let Err(shape) = state.services.system_events.push(&params.text).await {
        return DispatchOutcome::reply(ResponseFrame::err(req.id, shape));
    }

    {
        let mut inner = state.inner.write().await;
        inner.presence.record_text(&params.text, now_ms());
    }

    DispatchOutcome {
        response: ResponseFrame::ok(req.id, json!({ "ok": true })),
        follow_up: Some(FollowUp::PresenceChanged),
    }
}

async fn set_heartbeats(
    state: &Arc<GatewayState>,
    conn_id: &str,
    req: RequestFrame,
) -> DispatchOutcome {
    let params: SetHeartbeatsParams = match parse_params(&req) {
        Ok(params) => params,
        Err(response) => return DispatchOutcome::reply(response),
    };

    // Acknowledge only: the flag is recorded but does not gate the tick
    // emitter.
    if let Some(client) = state.inner.write().await.clients.get_mut(conn_id) {
        client.heartbeats_enabled = params.enabled;
    }
    DispatchOutcome::reply(ResponseFrame::ok(req.id, json!({ "ok": true })))
}

async fn send(state: &Arc<GatewayState>, req: RequestFrame) -> DispatchOutcome {
    let params: SendParams = match parse_params(&req) {
        Ok(params) => params,
        Err(response) => return DispatchOutcome::reply(response),
    };

    let key = DedupeCache::key(methods::SEND, &params.idempotency_key);
    if let Some(outcome) = state.inner.write().await.dedupe.lookup(&key, Instant::now()) {
        return DispatchOutcome::reply(outcome.into_response(req.id));
    }

    let request = DeliveryRequest {
        to: params.to,
        message: params.message,
        media_url: params.media_url,
        provider: params.provider,
    };
    let response = match state.services.delivery.deliver(request).await {
        Ok(receipt) => ResponseFrame::ok(
            req.id,
            json!({
                "runId": params.idempotency_key,
                "messageId": receipt.message_id,
                "toJid": receipt.to_jid,
            }),
        ),
        // NOT_LINKED and UNAVAILABLE pass through from the port verbatim.
        Err(shape) => ResponseFrame::err(req.id, shape),
    };

    state
        .inner
        .write()
        .await
        .dedupe
        .store(&key, CachedOutcome::from_response(&response), Instant::now());
    DispatchOutcome::reply(response)
}

async fn agent(state: &Arc<GatewayState>, req: RequestFrame) -> DispatchOutcome {
    let params: AgentParams = match parse_params(&req) {
        Ok(params) => params,
        Err(response) => return DispatchOutcome::reply(response),
    };

    let key = DedupeCache::key(methods::AGENT, &params.idempotency_key);
    if let Some(outcome) = state.inner.write().await.dedupe.lookup(&key, Instant::now()) {
        // Replays skip the accepted event: the run is not re-executed.
        return DispatchOutcome::reply(outcome.into_response(req.id));
    }

    let run_id = params
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Ack-then-final: acceptance goes out as an event immediately, the
    // response only once the run finishes.
    broadcast(
        state,
        clawdis_protocol::events::AGENT,
        json!({ "runId": run_id, "status": "accepted" }),
        BroadcastOpts::default(),
    )
    .await;

    let invocation = AgentInvocation {
        run_id: run_id.clone(),
        message: params.message,
        to: params.to,
        session_id: params.session_id,
        thinking: params.thinking,
        deliver: params.deliver.unwrap_or(false),
    };
    let events = state.bus.publisher();

    let result = match params.timeout {
        Some(secs) if secs > 0 => {
            match tokio::time::timeout(
                Duration::from_secs(secs),
                state.services.agent.run(invocation, events),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ErrorShape::new(
                    error_codes::AGENT_TIMEOUT,
                    format!("agent run exceeded {secs}s deadline"),
                )),
            }
        },
        _ => state.services.agent.run(invocation, events).await,
    };

    let response = match result {
        Ok(outcome) => ResponseFrame::ok(
            req.id,
            json!({
                "runId": run_id,
                "status": outcome.status,
                "summary": outcome.summary,
            }),
        ),
        Err(shape) => {
            let mut response = ResponseFrame::err(req.id, shape);
            let summary = response
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            response.payload = Some(json!({
                "runId": run_id,
                "status": "error",
                "summary": summary,
            }));
            response
        },
    };

    state
        .inner
        .write()
        .await
        .dedupe
        .store(&key, CachedOutcome::from_response(&response), Instant::now());
    DispatchOutcome::reply(response)
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Typed view of already-validated params. A mismatch here still maps to
/// `INVALID_REQUEST` rather than a panic.
fn parse_params<T: serde::de::DeserializeOwned>(req: &RequestFrame) -> Result<T, ResponseFrame> {
    let params = req.params.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(params).map_err(|err| {
        ResponseFrame::err(
            req.id.clone(),
            ErrorShape::invalid_request(format!("params: {err}")),
        )
    })
}
