//! # Stepwire Server
//!
//! Coordinating server for long-running workflows.
//!
//! - **Task queue**: resolves durable delays when their wait elapses
//! - **Server RPC**: records the steps and run transitions reported by
//!   workflow hosts
//! - **Trigger endpoints**: HTTP entry points for connecting external
//!   sources and resolving delays by hand

pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;
