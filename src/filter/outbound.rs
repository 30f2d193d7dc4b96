//! Outbound token exchange handling
//!
//! Decides, for each outbound request, whether to re-mint the bearer token
//! or forward the request unchanged. Every failure path falls open: the
//! upstream's own policy is the final authority, and denying outbound
//! traffic would trade availability for nothing.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::credentials::CredentialStore;
use crate::resolver::StaticResolver;

use super::exchange::TokenExchanger;

/// Decision for one outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundDecision {
    /// Forward unchanged: incomplete configuration, passthrough route,
    /// missing or non-bearer Authorization, or a failed exchange
    Passthrough,
    /// Replace the Authorization header with `Bearer <token>`
    Rewrite(String),
}

/// Outbound side of the filter
#[derive(Debug)]
pub struct OutboundExchanger {
    credentials: Arc<CredentialStore>,
    resolver: Arc<StaticResolver>,
    exchanger: TokenExchanger,
}

impl OutboundExchanger {
    /// Create the outbound handler over the shared credential snapshot and
    /// route table
    #[must_use]
    pub fn new(credentials: Arc<CredentialStore>, resolver: Arc<StaticResolver>) -> Self {
        Self {
            credentials,
            resolver,
            exchanger: TokenExchanger::new(),
        }
    }

    /// Decide what to do with an outbound request
    ///
    /// `authority` is the destination host (`:authority` or `Host` header),
    /// `auth_header` the raw Authorization value if present.
    pub async fn handle(
        &self,
        authority: Option<&str>,
        auth_header: Option<&str>,
    ) -> OutboundDecision {
        let mut config = self.credentials.snapshot();

        // A route match overrides the default exchange parameters for this
        // request only; the snapshot itself is untouched.
        if let Some(host) = authority {
            if let Some(route) = self.resolver.resolve(host) {
                if route.passthrough {
                    debug!(host = %host, "Destination is passthrough, skipping exchange");
                    return OutboundDecision::Passthrough;
                }
                if !route.audience.is_empty() {
                    config.target_audience = route.audience;
                }
                if !route.scopes.is_empty() {
                    config.target_scopes = route.scopes;
                }
                if !route.token_endpoint.is_empty() {
                    config.token_url = route.token_endpoint;
                }
            }
        }

        if !config.is_complete() {
            debug!("Exchange configuration incomplete, forwarding original Authorization");
            return OutboundDecision::Passthrough;
        }

        let Some(auth) = auth_header else {
            debug!("No Authorization header, nothing to exchange");
            return OutboundDecision::Passthrough;
        };
        let Some(subject_token) = strip_bearer(auth) else {
            debug!("Authorization header is not a bearer token, forwarding unchanged");
            return OutboundDecision::Passthrough;
        };

        match self
            .exchanger
            .exchange(
                &config.client_id,
                &config.client_secret,
                &config.token_url,
                subject_token,
                &config.target_audience,
                &config.target_scopes,
            )
            .await
        {
            Ok(token) => {
                debug!(audience = %config.target_audience, "Replacing Authorization with exchanged token");
                OutboundDecision::Rewrite(token)
            }
            Err(e) => {
                warn!(error = %e, "Token exchange failed, forwarding original token");
                OutboundDecision::Passthrough
            }
        }
    }
}

/// Strip a `Bearer ` prefix, tolerating the lowercase form
#[must_use]
pub fn strip_bearer(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialStore, ExchangeConfig};

    fn handler_with(config: ExchangeConfig) -> OutboundExchanger {
        OutboundExchanger::new(
            Arc::new(CredentialStore::new(config)),
            Arc::new(StaticResolver::default()),
        )
    }

    #[test]
    fn strip_bearer_accepts_both_cases() {
        assert_eq!(strip_bearer("Bearer abc"), Some("abc"));
        assert_eq!(strip_bearer("bearer abc"), Some("abc"));
        assert_eq!(strip_bearer("Basic abc"), None);
        assert_eq!(strip_bearer("Bearerabc"), None);
    }

    #[tokio::test]
    async fn incomplete_config_passes_through() {
        let handler = handler_with(ExchangeConfig::default());
        let decision = handler.handle(None, Some("Bearer T1")).await;
        assert_eq!(decision, OutboundDecision::Passthrough);
    }

    #[tokio::test]
    async fn missing_authorization_passes_through() {
        let handler = handler_with(ExchangeConfig {
            client_id: "svc-A".into(),
            client_secret: "S".into(),
            token_url: "http://127.0.0.1:1/token".into(),
            target_audience: "svc-B".into(),
            target_scopes: "openid".into(),
        });
        assert_eq!(handler.handle(None, None).await, OutboundDecision::Passthrough);
    }

    #[tokio::test]
    async fn non_bearer_authorization_passes_through() {
        let handler = handler_with(ExchangeConfig {
            client_id: "svc-A".into(),
            client_secret: "S".into(),
            token_url: "http://127.0.0.1:1/token".into(),
            target_audience: "svc-B".into(),
            target_scopes: "openid".into(),
        });
        let decision = handler.handle(None, Some("Basic dXNlcjpwdw==")).await;
        assert_eq!(decision, OutboundDecision::Passthrough);
    }

    #[tokio::test]
    async fn unreachable_endpoint_falls_open() {
        // Port 1 refuses connections; the exchange error must not surface
        let handler = handler_with(ExchangeConfig {
            client_id: "svc-A".into(),
            client_secret: "S".into(),
            token_url: "http://127.0.0.1:1/token".into(),
            target_audience: "svc-B".into(),
            target_scopes: "openid".into(),
        });
        let decision = handler.handle(None, Some("Bearer T1")).await;
        assert_eq!(decision, OutboundDecision::Passthrough);
    }
}
