//! Navigator - a multi-tenant HTTP front-end
//!
//! One process that:
//! - Routes HTTP traffic through rewrites, auth, and static serving
//! - Starts tenant backend processes on demand and stops them when idle
//! - Replays requests to other regions/apps/machines, with an internal
//!   reverse-proxy fallback for large bodies
//! - Co-supervises sidecar processes and runs lifecycle hooks
//! - Suspends or stops its machine when no requests are in flight

pub mod auth;
pub mod config;
pub mod error;
pub mod hooks;
pub mod idle;
pub mod managed;
pub mod pool;
pub mod proxy;
pub mod replay;
pub mod router;
pub mod static_files;
