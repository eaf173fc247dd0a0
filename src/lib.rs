//! Hostgate - a reverse-proxy gateway in front of virtual-host backends
//!
//! This library provides a gateway that:
//! - Routes HTTP traffic based on Host header to configured backends
//! - Enforces signed bearer-token authentication with a revocation set
//! - Applies per-service token-bucket rate limiting
//! - Forwards requests transparently, injecting backend basic-auth credentials
//! - Hot-reloads its routing/auth configuration as one atomic snapshot
//! - Drains in-flight requests on shutdown, bounded by a deadline

pub mod config;
pub mod error;
pub mod limit;
pub mod proxy;
pub mod service;
pub mod token;
