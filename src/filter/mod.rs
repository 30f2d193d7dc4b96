//! The external-processing filter
//!
//! Long-lived gRPC server called by the proxy for every request in both
//! directions. Assembles the credential bootstrap, JWKS cache, and route
//! resolver, then serves the Envoy ext-proc contract.
//!
//! Failure policy is asymmetric on purpose: inbound fails closed (security
//! on ingress), outbound fails open (availability on egress).

mod exchange;
mod inbound;
mod outbound;
mod processor;

pub use exchange::TokenExchanger;
pub use inbound::{Audience, InboundClaims, InboundPolicy, InboundValidator};
pub use outbound::{strip_bearer, OutboundDecision, OutboundExchanger};
pub use processor::AuthBridgeProcessor;

use std::net::SocketAddr;
use std::sync::Arc;

use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::ExternalProcessorServer;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::config::FilterConfig;
use crate::credentials::{self, CredentialStore, CredentialWatcher};
use crate::jwks::JwksCache;
use crate::resolver::StaticResolver;
use crate::{Error, Result};

/// Build the filter from its configuration and serve until shutdown
///
/// Startup sequence: wait for the registrar's credential files (bounded),
/// populate the exchange snapshot with file-over-environment precedence,
/// derive the inbound policy, register the JWKS cache, load the route
/// table, then bind the gRPC listener.
///
/// # Errors
///
/// Returns an error when the route file is unreadable or the listener
/// cannot be bound; both are fatal at startup.
pub async fn run(config: FilterConfig) -> Result<()> {
    credentials::wait_for_files(
        &config.client_id_file,
        &config.client_secret_file,
        config.credential_wait(),
    )
    .await;

    let store = Arc::new(CredentialStore::new(credentials::bootstrap(&config)));
    config.log_effective();

    let snapshot = store.snapshot();
    info!(
        client_id = %snapshot.client_id,
        client_secret_len = snapshot.client_secret.len(),
        "Exchange credentials initialized"
    );

    // Live credential reload is best-effort; the snapshot from bootstrap
    // keeps working without it.
    let _watcher = match CredentialWatcher::start(
        config.client_id_file.clone(),
        config.client_secret_file.clone(),
        Arc::clone(&store),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Credential watcher unavailable, continuing without live reload");
            None
        }
    };

    let inbound = if config.inbound_enabled() {
        let jwks = Arc::new(JwksCache::with_refresh_interval(
            config.jwks_refresh_interval(),
        ));
        let jwks_url = config.jwks_url();
        jwks.register(&jwks_url);

        info!(issuer = %config.issuer, jwks_url = %jwks_url, "Inbound JWT validation enabled");
        if config.expected_audience.is_empty() {
            info!("Audience validation disabled (EXPECTED_AUDIENCE not set)");
        } else {
            info!(expected_audience = %config.expected_audience, "Audience validation enabled");
        }

        Some(Arc::new(InboundValidator::new(
            InboundPolicy {
                issuer: config.issuer.clone(),
                expected_audience: config.expected_audience.clone(),
                jwks_url,
            },
            jwks,
        )))
    } else {
        info!("Inbound JWT validation disabled (TOKEN_URL or ISSUER not set)");
        None
    };

    let resolver = Arc::new(StaticResolver::load(&config.routes_file)?);
    let outbound = Arc::new(OutboundExchanger::new(
        Arc::clone(&store),
        Arc::clone(&resolver),
    ));
    let processor = AuthBridgeProcessor::new(inbound, outbound);

    let addr: SocketAddr = ([0, 0, 0, 0], config.grpc_port).into();
    info!(%addr, "Starting external processor");

    Server::builder()
        .add_service(ExternalProcessorServer::new(processor))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await
        .map_err(|e| Error::Transport(format!("gRPC server failed: {e}")))?;

    info!("Filter shutdown complete");
    Ok(())
}
