//! Per-connection WebSocket handling: handshake, request dispatch, and
//! the serialized write loop.
//!
//! The state machine per socket:
//! - first frame must be a valid `hello` within 3 seconds, or the socket
//!   closes (protocol mismatch 1002, invalid hello / bad token 1008,
//!   timeout silent);
//! - while ready, only `req` frames are legal inbound; everything else is
//!   answered with `INVALID_REQUEST`;
//! - outbound frames are serialized through one write loop per
//!   connection, with the buffered-bytes policy applied at enqueue time.

use std::sync::{Arc, atomic::AtomicUsize};

use {
    axum::extract::ws::{CloseFrame, Message, WebSocket, close_code},
    futures_util::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    tokio::sync::mpsc,
};

use clawdis_protocol::{
    Frame, HANDSHAKE_TIMEOUT_MS, HelloError, HelloOk, HelloParams, PROTOCOL_VERSION, Policy,
    ResponseFrame, ServerInfo, ErrorShape,
    validate::{self, format_issues},
};

use crate::{
    broadcast::broadcast_presence,
    methods::{FollowUp, MethodRegistry},
    state::{ConnectedClient, GatewayState, Outbound, now_ms},
};

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Drive one accepted socket from handshake to close.
pub async fn handle_connection(
    state: Arc<GatewayState>,
    methods: Arc<MethodRegistry>,
    socket: WebSocket,
) {
    eprintln!("DEBUG: handle_connection entered");
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(hello) = await_hello(&state, &mut ws_tx, &mut ws_rx).await else {
        eprintln!("DEBUG: await_hello returned None");
        return;
    };
    eprintln!("DEBUG: await_hello returned Some");

    let conn_id = uuid::Uuid::new_v4().to_string();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    let client = ConnectedClient::new(
        conn_id.clone(),
        hello.client.clone(),
        out_tx,
        Arc::clone(&buffered),
    );

    {
        let mut inner = state.inner.write().await;
        inner
            .presence
            .record_connect(&hello.client, &conn_id, now_ms());
        inner.register_client(client);
    }

    let hello_ok = Frame::HelloOk(HelloOk {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: state.version.clone(),
            commit: state.commit.clone(),
            host: Some(state.hostname.clone()),
            conn_id: conn_id.clone(),
        },
        features: Default::default(),
        snapshot: state.snapshot().await,
        policy: Policy::default(),
    });
    if send_json(&mut ws_tx, &hello_ok).await.is_err() {
        finish_connection(&state, &conn_id).await;
        return;
    }

    tracing::info!(
        conn_id = %conn_id,
        client = %hello.client.name,
        mode = %hello.client.mode,
        "client connected"
    );

    let writer = tokio::spawn(write_loop(ws_tx, out_rx, Arc::clone(&buffered)));

    // The new connect entry is a presence mutation.
    broadcast_presence(&state).await;

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(conn_id = %conn_id, error = %err, "socket error");
                break;
            },
        };
        match message {
            Message::Text(text) => {
                handle_frame(&state, &methods, &conn_id, text.as_str()).await;
            },
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_frame(&state, &methods, &conn_id, text).await,
                Err(_) => {
                    respond_error(&state, &conn_id, "invalid", "binary frames must be UTF-8 JSON")
                        .await;
                },
            },
            Message::Close(_) => break,
            // Pings are answered by the transport layer.
            Message::Ping(_) | Message::Pong(_) => {},
        }
    }

    finish_connection(&state, &conn_id).await;
    writer.abort();
}

// ── Handshake ────────────────────────────────────────────────────────────────

/// Wait for the first frame and validate it as a hello. On failure a
/// `hello-error` is sent (except for timeouts and parse failures, which
/// close silently) and `None` is returned.
async fn await_hello(
    state: &Arc<GatewayState>,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
) -> Option<HelloParams> {
    let deadline = std::time::Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
    let message = match tokio::time::timeout(deadline, ws_rx.next()).await {
        Ok(Some(Ok(message))) => message,
        // Timeout, transport error, or the client went away: no frame is
        // sent back.
        _ => return None,
    };

    let text = match &message {
        Message::Text(text) => text.as_str().to_string(),
        Message::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok()?,
        _ => return None,
    };
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;

    if value.get("type").and_then(serde_json::Value::as_str) != Some("hello") {
        reject(ws_tx, "expected hello frame", None, close_code::POLICY).await;
        return None;
    }
    if let Err(issues) = validate::hello(&value) {
        reject(ws_tx, &format_issues(&issues), None, close_code::POLICY).await;
        return None;
    }
    let params: HelloParams = serde_json::from_value(value).ok()?;

    if params.min_protocol > PROTOCOL_VERSION || params.max_protocol < PROTOCOL_VERSION {
        reject(
            ws_tx,
            "protocol mismatch",
            Some(PROTOCOL_VERSION),
            close_code::PROTOCOL,
        )
        .await;
        return None;
    }

    if let Some(expected) = state.auth_token.as_deref() {
        let supplied = params.auth.as_ref().and_then(|auth| auth.token.as_deref());
        if supplied != Some(expected) {
            reject(ws_tx, "unauthorized", None, close_code::POLICY).await;
            return None;
        }
    }

    Some(params)
}

async fn reject(ws_tx: &mut WsSink, reason: &str, expected_protocol: Option<u32>, code: u16) {
    let frame = Frame::HelloError(HelloError {
        reason: reason.to_string(),
        expected_protocol,
    });
    let _ = send_json(ws_tx, &frame).await;
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn send_json(ws_tx: &mut WsSink, frame: &Frame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(json.into())).await
}

// ── Ready state ──────────────────────────────────────────────────────────────

/// Handle one inbound frame while ready. Valid requests are dispatched on
/// their own task so a suspended handler never blocks the read loop.
async fn handle_frame(
    state: &Arc<GatewayState>,
    methods: &Arc<MethodRegistry>,
    conn_id: &str,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            respond_error(state, conn_id, "invalid", &format!("invalid JSON: {err}")).await;
            return;
        },
    };

    // The offending id is echoed when extractable, else the literal
    // "invalid".
    let id = value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .filter(|id| !id.is_empty())
        .unwrap_or("invalid")
        .to_string();

    if value.get("type").and_then(serde_json::Value::as_str) != Some("req") {
        respond_error(state, conn_id, &id, "only req frames are accepted").await;
        return;
    }
    if let Err(issues) = validate::request(&value) {
        respond_error(state, conn_id, &id, &format_issues(&issues)).await;
        return;
    }
    let req = match serde_json::from_value::<Frame>(value) {
        Ok(Frame::Request(req)) => req,
        Ok(_) => {
            respond_error(state, conn_id, &id, "only req frames are accepted").await;
            return;
        },
        Err(err) => {
            respond_error(state, conn_id, &id, &err.to_string()).await;
            return;
        },
    };

    let state = Arc::clone(state);
    let methods = Arc::clone(methods);
    let conn_id = conn_id.to_string();
    tokio::spawn(async move {
        let outcome = methods.dispatch(&state, &conn_id, req).await;
        send_response(&state, &conn_id, outcome.response).await;
        // Follow-up broadcasts are enqueued after the response so the
        // originating connection observes its own write first.
        if let Some(FollowUp::PresenceChanged) = outcome.follow_up {
            broadcast_presence(&state).await;
        }
    });
}

async fn respond_error(state: &Arc<GatewayState>, conn_id: &str, id: &str, message: &str) {
    let response = ResponseFrame::err(id, ErrorShape::invalid_request(message));
    send_response(state, conn_id, response).await;
}

async fn send_response(state: &Arc<GatewayState>, conn_id: &str, response: ResponseFrame) {
    let json = match serde_json::to_string(&Frame::Response(response)) {
        Ok(json) => json,
        Err(err) => {
            tracing::error!(conn_id = %conn_id, error = %err, "failed to serialize response");
            return;
        },
    };
    let inner = state.inner.read().await;
    if let Some(client) = inner.clients.get(conn_id) {
        let _ = client.send_frame(&json, false);
    }
}

// ── Write loop ───────────────────────────────────────────────────────────────

/// Drain the outbound queue into the socket. The buffered-bytes counter is
/// decremented only after the frame reaches the sink, so enqueue-side
/// checks see true in-flight bytes.
async fn write_loop(
    mut ws_tx: WsSink,
    mut out_rx: mpsc::UnboundedReceiver<Outbound>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(item) = out_rx.recv().await {
        match item {
            Outbound::Frame { json, .. } => {
                let len = json.len();
                let result = ws_tx.send(Message::Text(json.into())).await;
                buffered.fetch_sub(len, std::sync::atomic::Ordering::Relaxed);
                if result.is_err() {
                    break;
                }
            },
            Outbound::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            },
        }
    }
}

// ── Teardown ─────────────────────────────────────────────────────────────────

/// Remove the connection, flip its presence entry to `disconnect`, and
/// broadcast the mutation. The entry itself survives until TTL.
async fn finish_connection(state: &Arc<GatewayState>, conn_id: &str) {
    let removed = {
        let mut inner = state.inner.write().await;
        let removed = inner.remove_client(conn_id);
        if let Some(client) = &removed {
            inner
                .presence
                .record_disconnect(&client.client, conn_id, now_ms());
        }
        removed
    };
    if removed.is_some() {
        tracing::info!(conn_id = %conn_id, "client disconnected");
        broadcast_presence(state).await;
    }
}
