//! SARK Gateway Library
//!
//! Governance gateway for Model Context Protocol (MCP) servers: every tool
//! invocation or administrative action is authenticated, authorized against
//! declarative policy, audited, and optionally streamed to external SIEMs.
//!
//! # Subsystems
//!
//! - **Policy Decision Engine**: fingerprinted decision caching with
//!   single-flight coalescing, strict engine timeouts, fail-closed edges
//! - **Authentication Core**: directory / OIDC / SAML providers, dual-token
//!   sessions with refresh rotation and reuse detection
//! - **API Keys**: hashed storage, scope- and environment-bound validation,
//!   zero-downtime rotation
//! - **SIEM Forwarder**: batched, compressed, circuit-broken delivery with a
//!   durable fallback queue

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod apikey;
pub mod audit;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod failsafe;
pub mod http;
pub mod policy;
pub mod ratelimit;
pub mod siem;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
