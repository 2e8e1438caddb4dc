//! Request gating for the chat API.
//!
//! A request entering a gated path is checked for the internal token,
//! its body is inspected for the model alias, and requests for limited
//! models are counted against the client's fixed window.

mod outcome;
mod request;
mod service;

pub use outcome::{GateOutcome, Rejection};
pub use request::{client_ip, model_alias};
pub use service::RequestGate;
