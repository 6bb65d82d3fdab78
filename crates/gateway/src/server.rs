//! Gateway HTTP + WebSocket server assembly.
//!
//! Builds the axum router (`/ws` upgrade plus a JSON `/health` probe),
//! owns the background timers (tick broadcast, dedupe sweep, agent bus
//! pump), and enforces the loopback-only bind at startup.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{State, WebSocketUpgrade},
        response::{IntoResponse, Json},
        routing::get,
    },
    tokio::time::MissedTickBehavior,
    tower_http::cors::{Any, CorsLayer},
    tracing::info,
};

use clawdis_protocol::{
    DEDUPE_SWEEP_INTERVAL_MS, MAX_PAYLOAD_BYTES, TICK_INTERVAL_MS, events,
};

use crate::{
    broadcast::{BroadcastOpts, broadcast, broadcast_shutdown, broadcast_tick},
    methods::MethodRegistry,
    services::GatewayServices,
    state::{GatewayConfig, GatewayState},
    ws::handle_connection,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub methods: Arc<MethodRegistry>,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(gateway: Arc<GatewayState>, methods: Arc<MethodRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(cors)
        .with_state(AppState { gateway, methods })
}

async fn ws_upgrade_handler(State(app): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| handle_connection(app.gateway, app.methods, socket))
}

async fn health_handler(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": app.gateway.version,
        "uptimeMs": app.gateway.uptime_ms(),
        "clients": app.gateway.client_count().await,
    }))
}

// ── Background tasks ─────────────────────────────────────────────────────────

/// Spawn the periodic tick, the dedupe sweep, and the agent event pump.
/// Tasks end on their own when the state is dropped by everything else.
pub fn spawn_background_tasks(state: &Arc<GatewayState>) {
    let tick_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick resolves immediately; consume it so ticks start
        // one full interval after boot.
        interval.tick().await;
        loop {
            interval.tick().await;
            broadcast_tick(&tick_state).await;
        }
    });

    let sweep_state = Arc::clone(state);
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(DEDUPE_SWEEP_INTERVAL_MS));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;
        loop {
            interval.tick().await;
            let mut inner = sweep_state.inner.write().await;
            inner.dedupe.sweep(std::time::Instant::now());
        }
    });

    // Agent bus pump: the single subscriber re-broadcasts every produced
    // event to all ready connections.
    if let Some(mut rx) = state.bus.take_subscriber() {
        let pump_state = Arc::clone(state);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let payload = match serde_json::to_value(&event) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::warn!(error = %err, "unserializable agent event");
                        continue;
                    },
                };
                broadcast(&pump_state, events::AGENT, payload, BroadcastOpts::default()).await;
            }
        });
    }
}

// ── Startup / shutdown ───────────────────────────────────────────────────────

/// Start the gateway on a loopback address. Runs until ctrl-c, then emits
/// the shutdown notice and closes every connection (1012).
pub async fn start_gateway(bind: &str, port: u16, services: GatewayServices) -> anyhow::Result<()> {
    let ip: std::net::IpAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;
    // Binding non-loopback is a bug: the gateway speaks an unencrypted,
    // single-token protocol.
    anyhow::ensure!(
        ip.is_loopback(),
        "gateway must bind a loopback address, got {ip}"
    );
    let addr = SocketAddr::new(ip, port);

    let state = GatewayState::new(GatewayConfig::from_env(), services);
    spawn_background_tasks(&state);

    let app = build_gateway_app(Arc::clone(&state), Arc::new(MethodRegistry::new()));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway to {addr}"))?;

    info!(%addr, version = %state.version, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await
        .context("gateway server error")?;

    Ok(())
}

async fn shutdown_signal(state: Arc<GatewayState>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown requested");
    shutdown_gateway(&state).await;
}

/// Emit the shutdown event once, then close every socket with 1012
/// "service restart".
pub async fn shutdown_gateway(state: &Arc<GatewayState>) {
    broadcast_shutdown(state, "service restart", None).await;
    let handles = state.inner.read().await.client_handles();
    for handle in handles {
        handle.close(1012, "service restart");
    }
    // Give write loops a moment to flush the notice and the close frame.
    tokio::time::sleep(Duration::from_millis(100)).await;
}
