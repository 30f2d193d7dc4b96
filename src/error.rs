//! Error types for AuthBridge

use std::io;

use thiserror::Error;

/// Result type alias for AuthBridge
pub type Result<T> = std::result::Result<T, Error>;

/// AuthBridge errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Firewall rule installation failure (fatal; the sidecar cannot run
    /// with a partial rule set)
    #[error("Rule installation failed: {0}")]
    Rules(String),

    /// JWT validation failure (inbound policy denial detail)
    #[error("{0}")]
    Jwt(String),

    /// JWKS endpoint fetch failure
    #[error("failed to fetch JWKS from {url}: {reason}")]
    JwksFetch {
        /// JWKS endpoint URL
        url: String,
        /// Failure detail
        reason: String,
    },

    /// Token exchange failure (outbound; callers fall open)
    #[error("token exchange failed: {0}")]
    Exchange(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a JWKS fetch error
    pub fn jwks_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JwksFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}
