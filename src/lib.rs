//! Modelgate - rate limiting gate for a chat-completions API
//!
//! This crate implements the gate that sits in front of an internal chat API.
//! Callers must present a shared internal token, and requests for selected
//! models are limited per client IP with a fixed window whose counters live
//! either in libSQL or in process memory.

pub mod config;
pub mod error;
pub mod gate;
pub mod http;
pub mod ratelimit;
pub mod store;
