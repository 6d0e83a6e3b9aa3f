//! Multi-protocol proxy node agent.
//!
//! Architecture:
//! - `api/`: panel data model and HTTP client
//! - `common/`: rate buckets, audit rules, inbound limiter, certificates
//! - `core/`: the embedded protocol server contract (hooks + factory seam)
//! - `dispatch/`: data-path interception for the classic protocols
//! - `service/`: the per-node service engine and protocol backends

pub mod api;
pub mod common;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod logger;
pub mod service;
