//! Inbound JWT validation
//!
//! # Validation flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Select the matching key from the cached JWKS; an unknown `kid`
//!    triggers a single cache refresh before failing, which covers key
//!    rotation inside the refresh window.
//! 3. Verify the signature and time claims (`exp`, `nbf`, 60 s leeway).
//! 4. Require exact equality of the `iss` claim with the configured issuer.
//! 5. When an expected audience is configured, require the `aud` claim to
//!    contain it; an empty expected audience disables the check.
//!
//! Failures are policy denials: the caller answers 401 and the request
//! never reaches the application.

use std::sync::Arc;

use jsonwebtoken::jwk::{AlgorithmParameters, Jwk, JwkSet};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Header, TokenData, Validation};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::jwks::JwksCache;
use crate::{Error, Result};

/// Clock skew tolerance for `exp` / `nbf` checks
const CLOCK_SKEW_LEEWAY: u64 = 60;

/// `aud` claim, either a single string or a list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    /// Single audience
    Single(String),
    /// Multiple audiences
    Multiple(Vec<String>),
}

impl Audience {
    /// Whether the audience contains a specific value
    #[must_use]
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::Single(s) => s == audience,
            Audience::Multiple(v) => v.iter().any(|a| a == audience),
        }
    }
}

/// The claims inspected on inbound tokens
#[derive(Debug, Clone, Deserialize)]
pub struct InboundClaims {
    /// Issuer
    #[serde(default)]
    pub iss: Option<String>,
    /// Audience(s)
    #[serde(default)]
    pub aud: Option<Audience>,
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
}

/// Inbound validation policy, immutable after startup
#[derive(Debug, Clone)]
pub struct InboundPolicy {
    /// Expected `iss` claim, compared for exact equality
    pub issuer: String,
    /// Expected member of the `aud` claim; empty disables the check
    pub expected_audience: String,
    /// JWKS endpoint backing signature verification
    pub jwks_url: String,
}

/// JWT validator for inbound requests
#[derive(Debug)]
pub struct InboundValidator {
    policy: InboundPolicy,
    jwks: Arc<JwksCache>,
}

impl InboundValidator {
    /// Create a validator over a policy and a key cache
    #[must_use]
    pub fn new(policy: InboundPolicy, jwks: Arc<JwksCache>) -> Self {
        Self { policy, jwks }
    }

    /// The configured policy
    #[must_use]
    pub fn policy(&self) -> &InboundPolicy {
        &self.policy
    }

    /// Validate a bearer token against the policy
    ///
    /// # Errors
    ///
    /// `Error::JwksFetch` when no verification keys are available (the
    /// caller denies with a diagnostic), `Error::Jwt` for every policy
    /// violation: bad signature, expired token, issuer or audience
    /// mismatch.
    pub async fn validate(&self, token: &str) -> Result<InboundClaims> {
        let header = decode_header(token)
            .map_err(|e| Error::Jwt(format!("failed to parse token header: {e}")))?;

        let keys = self.jwks.get(&self.policy.jwks_url).await?;
        let jwk = match find_key(&keys, header.kid.as_deref()) {
            Some(jwk) => jwk.clone(),
            None => {
                // Unknown kid: refresh once and retry before failing
                debug!(kid = ?header.kid, "Key not found in cached JWKS, refreshing");
                let keys = self.jwks.get_refreshed(&self.policy.jwks_url).await?;
                find_key(&keys, header.kid.as_deref())
                    .cloned()
                    .ok_or_else(|| {
                        Error::Jwt(format!(
                            "no verification key for kid {:?}",
                            header.kid.as_deref().unwrap_or("<none>")
                        ))
                    })?
            }
        };

        let decoding_key = decoding_key(&jwk)?;
        let validation = build_validation(&header);

        let token_data: TokenData<InboundClaims> = decode(token, &decoding_key, &validation)
            .map_err(|e| Error::Jwt(format!("failed to parse/validate token: {e}")))?;
        let claims = token_data.claims;

        match &claims.iss {
            Some(iss) if *iss == self.policy.issuer => {}
            Some(iss) => {
                return Err(Error::Jwt(format!(
                    "invalid issuer: expected {}, got {}",
                    self.policy.issuer, iss
                )));
            }
            None => return Err(Error::Jwt("missing issuer claim".to_string())),
        }

        if !self.policy.expected_audience.is_empty() {
            let audience_valid = claims
                .aud
                .as_ref()
                .is_some_and(|aud| aud.contains(&self.policy.expected_audience));
            if !audience_valid {
                return Err(Error::Jwt(format!(
                    "invalid audience: expected {}",
                    self.policy.expected_audience
                )));
            }
        }

        debug!(issuer = %self.policy.issuer, sub = ?claims.sub, "Inbound token validated");
        Ok(claims)
    }
}

/// Select a key from the set by `kid`, or the first key when the token
/// header carries none
fn find_key<'a>(keys: &'a JwkSet, kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys
            .keys
            .iter()
            .find(|k| k.common.key_id.as_deref() == Some(kid)),
        None => keys.keys.first(),
    }
}

/// Convert a JWK into a `DecodingKey`
fn decoding_key(jwk: &Jwk) -> Result<DecodingKey> {
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
            .map_err(|e| Error::Jwt(format!("unusable RSA key: {e}"))),
        AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
            .map_err(|e| Error::Jwt(format!("unusable EC key: {e}"))),
        _ => Err(Error::Jwt("unsupported key type in JWKS".to_string())),
    }
}

/// Build a [`Validation`] from the JWT header algorithm
///
/// Audience validation is disabled here; the policy check above handles
/// both single-string and list forms with a clearer error.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::ES256
        | Algorithm::ES384 => header.alg,
        other => {
            warn!(alg = ?other, "Unsupported JWT algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut validation = Validation::new(alg);
    validation.leeway = CLOCK_SKEW_LEEWAY;
    validation.validate_aud = false;
    validation
}
