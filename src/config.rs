//! Configuration management
//!
//! Both processes read their configuration from environment variables: the
//! filter server via [`FilterConfig`], the one-shot interceptor via
//! [`InterceptConfig`]. Defaults live in the `Default` impls; figment merges
//! the documented variables on top.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Error, Result};

/// Default path the registrar publishes the client id to
pub const DEFAULT_CLIENT_ID_FILE: &str = "/shared/client-id.txt";
/// Default path the registrar publishes the client secret to
pub const DEFAULT_CLIENT_SECRET_FILE: &str = "/shared/client-secret.txt";
/// Default route configuration file
pub const DEFAULT_ROUTES_FILE: &str = "/etc/authbridge/routes.yaml";

/// Filter server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Identity-provider token endpoint; the JWKS URL is derived from it
    pub token_url: String,
    /// Expected `iss` claim on inbound JWTs; empty disables inbound
    /// validation
    pub issuer: String,
    /// Optional `aud` check on inbound tokens; empty disables the check
    pub expected_audience: String,
    /// Fallback client id when the credential file is absent
    pub client_id: String,
    /// Fallback client secret when the credential file is absent
    pub client_secret: String,
    /// Default audience requested in outbound token exchange
    pub target_audience: String,
    /// Default scopes requested in outbound token exchange
    pub target_scopes: String,
    /// Path of the client-id file published by the registrar
    pub client_id_file: PathBuf,
    /// Path of the client-secret file published by the registrar
    pub client_secret_file: PathBuf,
    /// Path of the YAML route table (missing file means no routes)
    pub routes_file: PathBuf,
    /// Port the external-processing gRPC server listens on
    pub grpc_port: u16,
    /// Maximum time to wait for credential files at startup, in seconds
    pub credential_wait_secs: u64,
    /// Background JWKS refresh window, in seconds
    pub jwks_refresh_secs: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            token_url: String::new(),
            issuer: String::new(),
            expected_audience: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            target_audience: String::new(),
            target_scopes: String::new(),
            client_id_file: PathBuf::from(DEFAULT_CLIENT_ID_FILE),
            client_secret_file: PathBuf::from(DEFAULT_CLIENT_SECRET_FILE),
            routes_file: PathBuf::from(DEFAULT_ROUTES_FILE),
            grpc_port: 9090,
            credential_wait_secs: 60,
            jwks_refresh_secs: 900,
        }
    }
}

impl FilterConfig {
    /// Load the filter configuration from the environment
    pub fn from_env() -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::raw().only(&[
                "token_url",
                "issuer",
                "expected_audience",
                "client_id",
                "client_secret",
                "target_audience",
                "target_scopes",
                "client_id_file",
                "client_secret_file",
                "routes_file",
                "grpc_port",
                "credential_wait_secs",
                "jwks_refresh_secs",
            ]))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// JWKS endpoint derived from the token endpoint
    #[must_use]
    pub fn jwks_url(&self) -> String {
        derive_jwks_url(&self.token_url)
    }

    /// Whether inbound JWT validation is configured
    ///
    /// Both the token endpoint (for the JWKS URL) and the expected issuer
    /// are required; with either missing, all inbound traffic passes
    /// through.
    #[must_use]
    pub fn inbound_enabled(&self) -> bool {
        !self.token_url.is_empty() && !self.issuer.is_empty()
    }

    /// Background JWKS refresh window
    #[must_use]
    pub fn jwks_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.jwks_refresh_secs)
    }

    /// Startup deadline for the credential bootstrap
    #[must_use]
    pub fn credential_wait(&self) -> Duration {
        Duration::from_secs(self.credential_wait_secs)
    }

    /// Log the effective configuration
    pub fn log_effective(&self) {
        info!(
            token_url = %self.token_url,
            issuer = %self.issuer,
            expected_audience = %self.expected_audience,
            target_audience = %self.target_audience,
            target_scopes = %self.target_scopes,
            routes_file = %self.routes_file.display(),
            grpc_port = self.grpc_port,
            "Filter configuration loaded"
        );
    }
}

/// Interceptor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Loopback port the proxy's outbound listener binds
    pub proxy_port: u16,
    /// Loopback port the proxy's inbound listener binds
    pub inbound_proxy_port: u16,
    /// User id the proxy runs as; its own traffic is exempt from
    /// redirection
    pub proxy_uid: u32,
    /// Comma-separated destination ports exempt from outbound redirection
    pub outbound_ports_exclude: String,
    /// Comma-separated destination ports exempt from inbound redirection
    pub inbound_ports_exclude: String,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            proxy_port: 15123,
            inbound_proxy_port: 15124,
            proxy_uid: 1337,
            outbound_ports_exclude: String::new(),
            inbound_ports_exclude: String::new(),
        }
    }
}

impl InterceptConfig {
    /// Load the interceptor configuration from the environment
    pub fn from_env() -> Result<Self> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::raw().only(&[
                "proxy_port",
                "inbound_proxy_port",
                "proxy_uid",
                "outbound_ports_exclude",
                "inbound_ports_exclude",
            ]))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Parsed outbound port exclusions
    pub fn outbound_excludes(&self) -> Result<Vec<u16>> {
        parse_port_list(&self.outbound_ports_exclude)
    }

    /// Parsed inbound port exclusions
    pub fn inbound_excludes(&self) -> Result<Vec<u16>> {
        parse_port_list(&self.inbound_ports_exclude)
    }
}

/// Derive the JWKS endpoint from a token endpoint: strip a trailing
/// `/token` path element and append `/certs`.
///
/// `…/protocol/openid-connect/token` becomes
/// `…/protocol/openid-connect/certs`.
#[must_use]
pub fn derive_jwks_url(token_url: &str) -> String {
    let base = token_url.strip_suffix("/token").unwrap_or(token_url);
    format!("{base}/certs")
}

/// Parse a comma-separated port list, trimming whitespace and skipping
/// empty entries
fn parse_port_list(csv: &str) -> Result<Vec<u16>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in exclusion list: {s:?}")))
        })
        .collect()
}
