//! ThrottleX - Multi-Tenant Rate Limiting Service
//!
//! This crate decides, per inbound request, whether a tenant may proceed
//! under its configured quota. Quota state lives in a shared key/value store
//! (Redis in production) and every decision is one atomic server-side step,
//! so any number of stateless instances can serve the same tenants.

pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod store;
