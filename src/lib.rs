//! Bullpen - a multi-tenant front door for per-user editor processes
//!
//! This library provides the pieces of a reverse proxy that:
//! - Routes `/@{tenant}/...` traffic to a private editor process per tenant
//! - Spawns that process on the first request and waits until it listens
//! - Keeps an always-on shared-assets instance for static files
//! - Evicts instances that have been idle longer than a configurable timeout
//! - Refuses cross-tenant access based on an OAuth-backed session cookie

pub mod admin;
pub mod auth;
pub mod config;
pub mod error;
pub mod identity;
pub mod instance;
pub mod pool;
pub mod ports;
pub mod proxy;
pub mod reaper;
pub mod registry;
pub mod status;
