//! Collaborator ports consumed by the method handlers.
//!
//! The gateway never talks to the agent runtime, delivery provider, or
//! health prober directly; handlers go through these trait objects so tests
//! and embedders can swap implementations. Failures are protocol error
//! shapes, not panics.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value};

use clawdis_protocol::ErrorShape;

use crate::bus::AgentEventPublisher;

pub type PortResult<T> = Result<T, ErrorShape>;

// ── Port traits ──────────────────────────────────────────────────────────────

/// Health prober: opaque snapshot of channel/process health.
#[async_trait]
pub trait HealthService: Send + Sync {
    async fn health(&self) -> PortResult<Value>;
}

/// Status summarizer: opaque human-oriented summary.
#[async_trait]
pub trait StatusService: Send + Sync {
    async fn status(&self) -> PortResult<Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryRequest {
    pub to: String,
    pub message: String,
    pub media_url: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub to_jid: String,
}

/// Outbound message delivery provider.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> PortResult<DeliveryReceipt>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentInvocation {
    pub run_id: String,
    pub message: String,
    pub to: Option<String>,
    pub session_id: Option<String>,
    pub thinking: Option<String>,
    pub deliver: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    /// `"ok"` or `"error"`.
    pub status: String,
    pub summary: String,
}

/// Long-running agent runtime. Streamed output goes through the publisher;
/// the return value is the terminal outcome.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn run(
        &self,
        invocation: AgentInvocation,
        events: AgentEventPublisher,
    ) -> PortResult<AgentOutcome>;
}

/// Queue for operator-visible system events.
#[async_trait]
pub trait SystemEventSink: Send + Sync {
    async fn push(&self, text: &str) -> PortResult<()>;
}

// ── Service bundle ───────────────────────────────────────────────────────────

/// Domain services injected into the gateway at startup.
#[derive(Clone)]
pub struct GatewayServices {
    pub health: Arc<dyn HealthService>,
    pub status: Arc<dyn StatusService>,
    pub delivery: Arc<dyn DeliveryService>,
    pub agent: Arc<dyn AgentService>,
    pub system_events: Arc<dyn SystemEventSink>,
}

impl GatewayServices {
    /// Bundle of no-op services: reads succeed with empty objects, mutating
    /// ports report `UNAVAILABLE` until an embedder wires real ones in.
    pub fn noop() -> Self {
        let noop = Arc::new(NoopService);
        Self {
            health: noop.clone(),
            status: noop.clone(),
            delivery: noop.clone(),
            agent: noop.clone(),
            system_events: noop,
        }
    }
}

struct NoopService;

#[async_trait]
impl HealthService for NoopService {
    async fn health(&self) -> PortResult<Value> {
        Ok(serde_json::json!({}))
    }
}

#[async_trait]
impl StatusService for NoopService {
    async fn status(&self) -> PortResult<Value> {
        Ok(serde_json::json!({}))
    }
}

#[async_trait]
impl DeliveryService for NoopService {
    async fn deliver(&self, _request: DeliveryRequest) -> PortResult<DeliveryReceipt> {
        Err(ErrorShape::unavailable("no delivery provider configured"))
    }
}

#[async_trait]
impl AgentService for NoopService {
    async fn run(
        &self,
        _invocation: AgentInvocation,
        _events: AgentEventPublisher,
    ) -> PortResult<AgentOutcome> {
        Err(ErrorShape::unavailable("no agent runtime configured"))
    }
}

#[async_trait]
impl SystemEventSink for NoopService {
    async fn push(&self, _text: &str) -> PortResult<()> {
        Ok(())
    }
}
