//! Client-facing streaming layer: sessions, frames, fan-out, flow control.

pub mod broadcast;
pub mod frames;
pub mod rate_limit;
pub mod session;
pub mod ws;

// Re-exports
pub use broadcast::BroadcastFabric;
pub use frames::{
    parse_client, ClientMessage, PhaseName, PublicState, ServerMessage, HEARTBEAT_MISSES,
    HEARTBEAT_SECS, MAX_INBOUND_FRAME,
};
pub use rate_limit::{
    InboundDecision, RateKey, RequestBudget, RouteClass, RouteLimiter, SessionInboundLimiter,
};
pub use session::{AttachOutcome, SessionFrame, SessionRegistry, SessionView, SESSION_BUFFER};
