//! OAuth 2.0 Token Exchange (RFC 8693)
//!
//! Trades the application's bearer token for a new token minted for the
//! destination's audience. The exchanging client must be in the subject
//! token's audience; with registrar-published credentials this holds
//! because the token's audience matches the auto-registered client id.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Timeout on each exchange request
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

const GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
    #[serde(default)]
    #[allow(dead_code)]
    token_type: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// HTTP client for the token-exchange grant
#[derive(Debug)]
pub struct TokenExchanger {
    http: reqwest::Client,
}

impl Default for TokenExchanger {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenExchanger {
    /// Create an exchanger with the default request timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(EXCHANGE_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Exchange `subject_token` for a token scoped to `audience`
    ///
    /// Succeeds iff the endpoint answers HTTP 200 with a JSON body carrying
    /// a non-empty `access_token`. No retries at this layer; retrying is
    /// the caller's (or the application's) concern.
    ///
    /// # Errors
    ///
    /// Returns `Error::Exchange` on network failure, a non-200 status, or
    /// an unusable response body.
    pub async fn exchange(
        &self,
        client_id: &str,
        client_secret: &str,
        token_url: &str,
        subject_token: &str,
        audience: &str,
        scopes: &str,
    ) -> Result<String> {
        debug!(
            token_url = %token_url,
            client_id = %client_id,
            audience = %audience,
            scopes = %scopes,
            "Starting token exchange"
        );

        let form = [
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", GRANT_TYPE),
            ("requested_token_type", ACCESS_TOKEN_TYPE),
            ("subject_token", subject_token),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            ("audience", audience),
            ("scope", scopes),
        ];

        let response = self
            .http
            .post(token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| Error::Exchange(format!("request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Exchange(format!("failed to read response: {e}")))?;

        if status != reqwest::StatusCode::OK {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }

        let parsed: TokenExchangeResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Exchange(format!("invalid response body: {e}")))?;

        if parsed.access_token.is_empty() {
            return Err(Error::Exchange("response carried an empty access_token".to_string()));
        }

        debug!("Token exchange succeeded");
        Ok(parsed.access_token)
    }
}
