//! Local WebSocket gateway between Clawdis clients and backend services.
//!
//! One persistent connection per client, one versioned frame protocol:
//! cluster snapshots at handshake, request/response RPC, and a live
//! sequence-numbered event feed. Backend collaborators (agent runtime,
//! delivery provider, health prober) are injected as [`services`] ports.

pub mod broadcast;
pub mod bus;
pub mod dedupe;
pub mod methods;
pub mod presence;
pub mod server;
pub mod services;
pub mod state;
pub mod ws;
