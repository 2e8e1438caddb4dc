//! HTTP front end: router, gate middleware and upstream forwarding.

mod middleware;
mod server;
mod upstream;

use crate::config::Rewrite;
use crate::gate::RequestGate;

pub use middleware::{gate_requests, resolve_rewrite};
pub use server::{router, GateServer};
pub use upstream::Upstream;

/// State shared by every request handler.
pub struct AppState {
    pub gate: RequestGate,
    pub upstream: Upstream,
    pub rewrites: Vec<Rewrite>,
    pub max_body_bytes: usize,
}
