//! AuthBridge Library
//!
//! Transparent, bidirectional authentication sidecar. Colocates with an
//! application inside a shared network namespace and enforces two invariants
//! on its traffic:
//!
//! - **Inbound**: every request reaching the application carries a signed
//!   bearer token whose issuer (and optionally audience) match policy, or
//!   the request is rejected with 401 before the application sees it.
//! - **Outbound**: every outgoing request carrying a bearer token has that
//!   token re-minted via OAuth 2.0 Token Exchange (RFC 8693) for an audience
//!   appropriate to the destination host.
//!
//! # Components
//!
//! - [`interceptor`]: one-shot iptables program steering pod traffic into
//!   the proxy listeners, coexistence-aware with an ambient mesh
//! - [`resolver`]: ordered host-glob routing table for per-destination
//!   exchange parameters
//! - [`jwks`]: self-refreshing JWKS cache backing inbound validation
//! - [`filter`]: Envoy external-processing gRPC server enforcing both
//!   directions
//! - [`credentials`]: file-based credential bootstrap shared with the
//!   client registrar

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod filter;
pub mod interceptor;
pub mod jwks;
pub mod resolver;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Name of the direction marker header injected by the proxy's inbound
/// listener. Removed before the request reaches the application.
pub const DIRECTION_HEADER: &str = "x-authbridge-direction";

/// Direction marker value identifying inbound traffic; absence means
/// outbound.
pub const DIRECTION_INBOUND: &str = "inbound";

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
