//! WebSocket client counterpart for the Clawdis gateway.
//!
//! Connects, performs the hello handshake, correlates requests to
//! responses by id, watches the event feed for sequence gaps, and
//! reconnects with exponential backoff (1 s doubling, capped at 30 s)
//! until [`GatewayClient::stop`] is called.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    futures_util::{SinkExt, StreamExt},
    thiserror::Error,
    tokio::sync::{Mutex, mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
};

use clawdis_protocol::{
    ClientInfo, ConnectAuth, ErrorShape, EventFrame, Frame, HelloOk, HelloParams,
    PROTOCOL_VERSION, RequestFrame, ResponseFrame,
};

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ClientError {
    /// The connection dropped before the request resolved.
    #[error("gateway closed")]
    Closed,
    /// The socket is not in the open state.
    #[error("not connected to gateway")]
    NotConnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(String),
    /// The gateway answered `ok:false`.
    #[error("request failed ({}): {}", .0.code, .0.message)]
    Rpc(ErrorShape),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── Options ──────────────────────────────────────────────────────────────────

pub type ConnectCallback = Arc<dyn Fn(&HelloOk) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(&EventFrame) + Send + Sync>;
pub type GapCallback = Arc<dyn Fn(SeqGap) + Send + Sync>;

/// A hole in the event feed: `received` arrived where `expected` should
/// have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqGap {
    pub expected: u64,
    pub received: u64,
}

#[derive(Clone)]
pub struct GatewayClientOptions {
    pub url: String,
    pub token: Option<String>,
    pub client: ClientInfo,
    pub on_connect: Option<ConnectCallback>,
    pub on_event: Option<EventCallback>,
    pub on_gap: Option<GapCallback>,
}

impl GatewayClientOptions {
    pub fn new(url: impl Into<String>, client: ClientInfo) -> Self {
        Self {
            url: url.into(),
            token: None,
            client,
            on_connect: None,
            on_event: None,
            on_gap: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Invoked with the hello-ok after every successful handshake.
    pub fn on_connect(mut self, callback: impl Fn(&HelloOk) + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    pub fn on_event(mut self, callback: impl Fn(&EventFrame) + Send + Sync + 'static) -> Self {
        self.on_event = Some(Arc::new(callback));
        self
    }

    /// Invoked when an event's `seq` skips past `lastSeq + 1`.
    pub fn on_gap(mut self, callback: impl Fn(SeqGap) + Send + Sync + 'static) -> Self {
        self.on_gap = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOpts {
    /// Ack-then-final semantics: ignore intermediate resolves whose
    /// payload carries `status: "accepted"`.
    pub expect_final: bool,
}

// ── Client ───────────────────────────────────────────────────────────────────

enum Command {
    Send(String),
    Stop,
}

struct Pending {
    tx: oneshot::Sender<Result<serde_json::Value, ClientError>>,
    expect_final: bool,
}

struct Shared {
    options: GatewayClientOptions,
    pending: Mutex<HashMap<String, Pending>>,
    conn: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    hello: Mutex<Option<HelloOk>>,
    last_seq: AtomicU64,
    stopped: AtomicBool,
}

pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl GatewayClient {
    pub fn new(options: GatewayClientOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                pending: Mutex::new(HashMap::new()),
                conn: Mutex::new(None),
                hello: Mutex::new(None),
                last_seq: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Dial and handshake, then hand the connection to the background
    /// driver which pumps frames and reconnects on drops. The socket is
    /// open for [`GatewayClient::request`] as soon as this returns.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (stream, hello_ok) = dial(&self.shared).await?;
        let cmd_rx = install(&self.shared, &hello_ok).await;
        let shared = Arc::clone(&self.shared);
        tokio::spawn(run(shared, stream, cmd_rx));
        Ok(())
    }

    /// Send a request and await the correlated response. Fails
    /// synchronously with [`ClientError::NotConnected`] when the socket is
    /// not open.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        opts: RequestOpts,
    ) -> Result<serde_json::Value, ClientError> {
        let sender = self
            .shared
            .conn
            .lock()
            .await
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let id = uuid::Uuid::new_v4().to_string();
        let frame = Frame::Request(RequestFrame {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        let json = serde_json::to_string(&frame)?;

        // Register before sending so a fast response cannot race the
        // pending entry.
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id.clone(),
            Pending {
                tx,
                expect_final: opts.expect_final,
            },
        );

        if sender.send(Command::Send(json)).is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(ClientError::NotConnected);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Closed),
        }
    }

    /// Stop for good: no further reconnects, all pending rejected.
    pub async fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(sender) = self.shared.conn.lock().await.take() {
            let _ = sender.send(Command::Stop);
        }
        self.shared.fail_pending().await;
    }

    /// The hello-ok from the most recent handshake (snapshot + policy).
    pub async fn hello(&self) -> Option<HelloOk> {
        self.shared.hello.lock().await.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.conn.lock().await.is_some()
    }

    /// Highest event sequence number observed.
    pub fn last_seq(&self) -> u64 {
        self.shared.last_seq.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn clear_conn(&self) {
        self.conn.lock().await.take();
    }

    /// Reject every in-flight request with [`ClientError::Closed`].
    async fn fail_pending(&self) {
        let drained: Vec<Pending> = self.pending.lock().await.drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.tx.send(Err(ClientError::Closed));
        }
    }

    /// Track `lastSeq`; a skip past `lastSeq + 1` is reported as a gap
    /// before the counter advances.
    fn observe_seq(&self, seq: u64) -> Option<SeqGap> {
        let last = self.last_seq.load(Ordering::SeqCst);
        let gap = (seq > last + 1).then_some(SeqGap {
            expected: last + 1,
            received: seq,
        });
        self.last_seq.store(seq, Ordering::SeqCst);
        gap
    }

    async fn handle_frame(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(error = %err, "dropped malformed gateway frame");
                return;
            },
        };
        match frame {
            Frame::Response(res) => self.resolve_pending(res).await,
            Frame::Event(event) => {
                if let Some(seq) = event.seq {
                    if let Some(gap) = self.observe_seq(seq) {
                        if let Some(on_gap) = &self.options.on_gap {
                            on_gap(gap);
                        }
                    }
                }
                if let Some(on_event) = &self.options.on_event {
                    on_event(&event);
                }
            },
            // Handshake frames after the handshake, or client-bound frame
            // types the gateway never sends.
            Frame::Hello(_) | Frame::HelloOk(_) | Frame::HelloError(_) | Frame::Request(_) => {
                tracing::debug!("ignoring unexpected frame");
            },
        }
    }

    async fn resolve_pending(&self, res: ResponseFrame) {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get(&res.id) else {
            return;
        };
        if entry.expect_final && res.ok {
            let accepted = res
                .payload
                .as_ref()
                .and_then(|payload| payload.get("status"))
                .and_then(serde_json::Value::as_str)
                == Some("accepted");
            if accepted {
                // Not the final outcome; keep waiting.
                return;
            }
        }
        let Some(entry) = pending.remove(&res.id) else {
            return;
        };
        let result = if res.ok {
            Ok(res.payload.unwrap_or(serde_json::Value::Null))
        } else {
            let shape = res
                .error
                .unwrap_or_else(|| ErrorShape::new("UNAVAILABLE", "request failed"));
            Err(ClientError::Rpc(shape))
        };
        let _ = entry.tx.send(result);
    }
}

// ── Driver ───────────────────────────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Dial the gateway and complete the hello handshake.
async fn dial(shared: &Arc<Shared>) -> Result<(WsStream, HelloOk), ClientError> {
    let (mut ws, _) = connect_async(shared.options.url.as_str())
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))?;

    let hello = Frame::Hello(HelloParams {
        min_protocol: PROTOCOL_VERSION,
        max_protocol: PROTOCOL_VERSION,
        client: shared.options.client.clone(),
        caps: Vec::new(),
        auth: shared.options.token.clone().map(|token| ConnectAuth {
            token: Some(token),
        }),
    });
    ws.send(Message::Text(serde_json::to_string(&hello)?.into()))
        .await
        .map_err(|err| ClientError::Transport(err.to_string()))?;

    while let Some(message) = ws.next().await {
        let message = message.map_err(|err| ClientError::Transport(err.to_string()))?;
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<Frame>(text.as_str()) {
            Ok(Frame::HelloOk(hello_ok)) => return Ok((ws, hello_ok)),
            Ok(Frame::HelloError(err)) => return Err(ClientError::Handshake(err.reason)),
            Ok(_) | Err(_) => continue,
        }
    }
    Err(ClientError::Handshake(
        "connection closed before hello-ok".into(),
    ))
}

/// Install a fresh command channel for an open connection and fire the
/// connect callback. Ordered so `request` works the moment the caller
/// observes the connection.
async fn install(shared: &Arc<Shared>, hello_ok: &HelloOk) -> mpsc::UnboundedReceiver<Command> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    *shared.conn.lock().await = Some(cmd_tx);
    *shared.hello.lock().await = Some(hello_ok.clone());
    if let Some(on_connect) = &shared.options.on_connect {
        on_connect(hello_ok);
    }
    cmd_rx
}

/// Connection driver: pump one socket until it drops, then reconnect with
/// backoff until stopped.
async fn run(shared: Arc<Shared>, first: WsStream, first_rx: mpsc::UnboundedReceiver<Command>) {
    let mut current = Some((first, first_rx));
    let mut attempt: u32 = 0;

    loop {
        if shared.stopped() {
            break;
        }

        let (stream, cmd_rx) = match current.take() {
            Some(conn) => conn,
            None => match dial(&shared).await {
                Ok((stream, hello_ok)) => {
                    let cmd_rx = install(&shared, &hello_ok).await;
                    (stream, cmd_rx)
                },
                Err(err) => {
                    tracing::warn!(error = %err, "gateway reconnect failed");
                    attempt += 1;
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                },
            },
        };
        attempt = 0;

        let clean_stop = pump(&shared, stream, cmd_rx).await;

        shared.clear_conn().await;
        shared.fail_pending().await;

        if clean_stop || shared.stopped() {
            break;
        }
        attempt += 1;
        tokio::time::sleep(backoff_delay(attempt)).await;
    }
}

/// Pump one open connection. Returns `true` on a deliberate stop, `false`
/// when the connection dropped and a reconnect is due.
async fn pump(
    shared: &Arc<Shared>,
    ws: WsStream,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) -> bool {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Send(json)) => {
                    if write.send(Message::Text(json.into())).await.is_err() {
                        return false;
                    }
                },
                Some(Command::Stop) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return true;
                },
            },
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => shared.handle_frame(text.as_str()).await,
                Some(Ok(Message::Binary(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        shared.handle_frame(text).await;
                    }
                },
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Ok(_)) => {},
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "gateway socket error");
                    return false;
                },
            },
        }
    }
}

/// Exponential backoff: 1 s doubling per attempt, capped at 30 s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1);
    let ms = INITIAL_BACKOFF_MS.saturating_mul(2u64.saturating_pow(exp));
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}
