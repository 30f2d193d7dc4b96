//! End-to-end filter tests
//!
//! Drives the external processor against a mock identity provider: a
//! wiremock JWKS endpoint backing inbound validation and a wiremock token
//! endpoint answering RFC 8693 exchanges. Tokens are signed with a real
//! RSA key whose public half is served as the JWKS.

use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue};
use envoy_types::pb::envoy::r#type::v3::StatusCode;
use envoy_types::pb::envoy::service::ext_proc::v3::{
    processing_request, processing_response, HeaderMutation, HttpHeaders, ImmediateResponse,
    ProcessingRequest, ProcessingResponse,
};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::EncodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authbridge::credentials::{CredentialStore, ExchangeConfig};
use authbridge::filter::{AuthBridgeProcessor, InboundPolicy, InboundValidator, OutboundExchanger};
use authbridge::jwks::JwksCache;
use authbridge::resolver::StaticResolver;
use authbridge::{DIRECTION_HEADER, DIRECTION_INBOUND};

const ISSUER: &str = "https://kc.example/realms/demo";

/// Shared RSA key material: PKCS#8 PEM plus base64url public components.
/// Generated once; 2048-bit key generation is too slow to repeat per test.
fn test_key() -> &'static (String, String, String) {
    static KEY: OnceLock<(String, String, String)> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let public_key = private_key.to_public_key();

        let pem = private_key
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .expect("encode pem")
            .to_string();
        let n = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());

        (pem, n, e)
    })
}

fn jwks_body(kid: &str) -> serde_json::Value {
    let (_, n, e) = test_key();
    serde_json::json!({
        "keys": [{
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": kid,
            "n": n,
            "e": e,
        }]
    })
}

fn sign_token(kid: &str, claims: &serde_json::Value) -> String {
    let (pem, _, _) = test_key();
    let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes()).expect("encoding key");

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());

    encode(&header, claims, &encoding_key).expect("sign token")
}

fn claims(iss: &str, aud: &[&str]) -> serde_json::Value {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    serde_json::json!({
        "iss": iss,
        "aud": aud,
        "sub": "user-1",
        "iat": now,
        "exp": now + 300,
    })
}

async fn jwks_server(kid: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body(kid)))
        .mount(&server)
        .await;
    server
}

/// Processor with inbound validation configured and no outbound config
fn inbound_processor(jwks_uri: &str, expected_audience: &str) -> AuthBridgeProcessor {
    let validator = InboundValidator::new(
        InboundPolicy {
            issuer: ISSUER.to_string(),
            expected_audience: expected_audience.to_string(),
            jwks_url: format!("{jwks_uri}/certs"),
        },
        Arc::new(JwksCache::new()),
    );

    AuthBridgeProcessor::new(
        Some(Arc::new(validator)),
        Arc::new(OutboundExchanger::new(
            Arc::new(CredentialStore::default()),
            Arc::new(StaticResolver::default()),
        )),
    )
}

/// Processor with outbound exchange configured and no inbound policy
fn outbound_processor(config: ExchangeConfig, resolver: StaticResolver) -> AuthBridgeProcessor {
    AuthBridgeProcessor::new(
        None,
        Arc::new(OutboundExchanger::new(
            Arc::new(CredentialStore::new(config)),
            Arc::new(resolver),
        )),
    )
}

fn exchange_config(token_url: &str) -> ExchangeConfig {
    ExchangeConfig {
        client_id: "svc-A".to_string(),
        client_secret: "S".to_string(),
        token_url: token_url.to_string(),
        target_audience: "svc-B".to_string(),
        target_scopes: "openid svc-B-aud".to_string(),
    }
}

fn headers_request(pairs: &[(&str, &str)]) -> ProcessingRequest {
    let headers = pairs
        .iter()
        .map(|(k, v)| HeaderValue {
            key: (*k).to_string(),
            raw_value: v.as_bytes().to_vec().into(),
            ..Default::default()
        })
        .collect();

    ProcessingRequest {
        request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
            headers: Some(HeaderMap {
                headers,
                ..Default::default()
            }),
            ..Default::default()
        })),
        ..Default::default()
    }
}

fn inbound_request(extra: &[(&str, &str)]) -> ProcessingRequest {
    let mut pairs = vec![(DIRECTION_HEADER, DIRECTION_INBOUND)];
    pairs.extend_from_slice(extra);
    headers_request(&pairs)
}

/// The request-headers mutation of an admit/rewrite response
fn headers_mutation(response: &ProcessingResponse) -> Option<&HeaderMutation> {
    match response.response.as_ref()? {
        processing_response::Response::RequestHeaders(headers) => {
            headers.response.as_ref()?.header_mutation.as_ref()
        }
        _ => None,
    }
}

/// The immediate (denial) response, or a panic when the request was not
/// denied
fn expect_denial(response: &ProcessingResponse) -> &ImmediateResponse {
    match response.response.as_ref() {
        Some(processing_response::Response::ImmediateResponse(immediate)) => immediate,
        other => panic!("expected immediate denial, got {other:?}"),
    }
}

fn denial_message(immediate: &ImmediateResponse) -> String {
    let body: serde_json::Value = serde_json::from_slice(&immediate.body).expect("JSON body");
    assert_eq!(body["error"], "unauthorized");
    body["message"].as_str().expect("message").to_string()
}

// ---------------------------------------------------------------------------
// Inbound validation
// ---------------------------------------------------------------------------

/// Scenario: inbound request without Authorization is denied with 401 and
/// never forwarded
#[tokio::test]
async fn test_inbound_missing_auth_denied() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "");

    let response = processor.handle(inbound_request(&[])).await.unwrap();

    let denial = expect_denial(&response);
    assert_eq!(
        denial.status.as_ref().unwrap().code,
        i32::from(StatusCode::Unauthorized)
    );
    assert_eq!(denial_message(denial), "missing Authorization header");
}

/// Scenario: a non-bearer Authorization header is denied
#[tokio::test]
async fn test_inbound_bad_auth_format_denied() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "");

    let response = processor
        .handle(inbound_request(&[("authorization", "Basic dXNlcjpwdw==")]))
        .await
        .unwrap();

    assert_eq!(
        denial_message(expect_denial(&response)),
        "invalid Authorization header format"
    );
}

/// Scenario: valid signature but wrong issuer is denied, mentioning the
/// issuer mismatch
#[tokio::test]
async fn test_inbound_wrong_issuer_denied() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "");

    let token = sign_token(
        "key-1",
        &claims("https://other.example/realms/foo", &["svc-A"]),
    );
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {token}"),
        )]))
        .await
        .unwrap();

    let message = denial_message(expect_denial(&response));
    assert!(message.contains("invalid issuer"), "message: {message}");
}

/// Scenario: a valid token is admitted and the direction marker is
/// stripped so the application never observes it
#[tokio::test]
async fn test_inbound_valid_token_admitted_without_marker() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "svc-A");

    let token = sign_token("key-1", &claims(ISSUER, &["svc-A"]));
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {token}"),
        )]))
        .await
        .unwrap();

    let mutation = headers_mutation(&response).expect("admit with mutation");
    assert_eq!(mutation.remove_headers, vec![DIRECTION_HEADER.to_string()]);
    assert!(mutation.set_headers.is_empty());
}

/// Audience enforcement rejects tokens whose aud list misses the expected
/// value
#[tokio::test]
async fn test_inbound_wrong_audience_denied() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "svc-A");

    let token = sign_token("key-1", &claims(ISSUER, &["svc-B", "svc-C"]));
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {token}"),
        )]))
        .await
        .unwrap();

    let message = denial_message(expect_denial(&response));
    assert!(message.contains("invalid audience"), "message: {message}");
}

/// An empty expected audience disables the audience check entirely
#[tokio::test]
async fn test_inbound_empty_expected_audience_admits_any_aud() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "");

    let token = sign_token("key-1", &claims(ISSUER, &["unrelated-audience"]));
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {token}"),
        )]))
        .await
        .unwrap();

    assert!(headers_mutation(&response).is_some(), "expected admit");
}

/// Expired tokens are denied by the time-claim validation
#[tokio::test]
async fn test_inbound_expired_token_denied() {
    let jwks = jwks_server("key-1").await;
    let processor = inbound_processor(&jwks.uri(), "");

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let expired = serde_json::json!({
        "iss": ISSUER,
        "aud": ["svc-A"],
        "sub": "user-1",
        "iat": now - 600,
        "exp": now - 300,
    });

    let token = sign_token("key-1", &expired);
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {token}"),
        )]))
        .await
        .unwrap();

    let message = denial_message(expect_denial(&response));
    assert!(
        message.contains("token validation failed"),
        "message: {message}"
    );
}

/// An unreachable JWKS endpoint fails closed: the request is denied with a
/// diagnostic, not forwarded
#[tokio::test]
async fn test_inbound_jwks_failure_denies() {
    let jwks = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&jwks)
        .await;

    let processor = inbound_processor(&jwks.uri(), "");
    let token = sign_token("key-1", &claims(ISSUER, &["svc-A"]));

    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {token}"),
        )]))
        .await
        .unwrap();

    let message = denial_message(expect_denial(&response));
    assert!(message.contains("failed to fetch JWKS"), "message: {message}");
}

/// Key rotation: a token signed with a kid the cache has not seen triggers
/// one refresh and then validates, without a restart
#[tokio::test]
async fn test_key_rotation_validates_without_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body("old-key")))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(jwks_body("new-key")))
        .mount(&server)
        .await;

    let processor = inbound_processor(&server.uri(), "");

    // Warm the cache with the pre-rotation key set
    let old_token = sign_token("old-key", &claims(ISSUER, &["svc-A"]));
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {old_token}"),
        )]))
        .await
        .unwrap();
    assert!(headers_mutation(&response).is_some(), "old key admits");

    // Post-rotation token: unknown kid forces a refresh, then validates
    let new_token = sign_token("new-key", &claims(ISSUER, &["svc-A"]));
    let response = processor
        .handle(inbound_request(&[(
            "authorization",
            &format!("Bearer {new_token}"),
        )]))
        .await
        .unwrap();
    assert!(headers_mutation(&response).is_some(), "rotated key admits");
}

// ---------------------------------------------------------------------------
// Outbound exchange
// ---------------------------------------------------------------------------

/// Scenario: complete config and a 200 from the token endpoint rewrite the
/// Authorization header to the exchanged token
#[tokio::test]
async fn test_outbound_exchange_happy_path() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("subject_token=T1"))
        .and(body_string_contains("audience=svc-B"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T2",
            "token_type": "Bearer",
            "expires_in": 300
        })))
        .mount(&idp)
        .await;

    let processor = outbound_processor(
        exchange_config(&format!("{}/token", idp.uri())),
        StaticResolver::default(),
    );

    let response = processor
        .handle(headers_request(&[("authorization", "Bearer T1")]))
        .await
        .unwrap();

    let mutation = headers_mutation(&response).expect("rewrite mutation");
    assert!(mutation.remove_headers.is_empty());
    let header = mutation.set_headers[0].header.as_ref().unwrap();
    assert_eq!(header.key, "authorization");
    assert_eq!(&header.raw_value[..], b"Bearer T2".as_slice());
}

/// Scenario: the token endpoint answers 400; the original token is
/// forwarded unchanged and nothing is denied
#[tokio::test]
async fn test_outbound_exchange_failure_passes_original() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant"
        })))
        .mount(&idp)
        .await;

    let processor = outbound_processor(
        exchange_config(&format!("{}/token", idp.uri())),
        StaticResolver::default(),
    );

    let response = processor
        .handle(headers_request(&[("authorization", "Bearer T1")]))
        .await
        .unwrap();

    // Empty headers response: no mutation, upstream sees Bearer T1
    assert!(headers_mutation(&response).is_none());
    assert!(matches!(
        response.response,
        Some(processing_response::Response::RequestHeaders(_))
    ));
}

/// Incomplete configuration forwards the Authorization byte-identically
#[tokio::test]
async fn test_outbound_incomplete_config_untouched() {
    let mut config = exchange_config("http://127.0.0.1:1/token");
    config.target_scopes.clear();

    let processor = outbound_processor(config, StaticResolver::default());
    let response = processor
        .handle(headers_request(&[("authorization", "Bearer T1")]))
        .await
        .unwrap();

    assert!(headers_mutation(&response).is_none());
}

/// Scenario: a route on the bare host matches the ported authority and its
/// audience override drives the exchange
#[tokio::test]
async fn test_route_match_with_port_overrides_audience() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("audience=svc-C"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T3",
            "token_type": "Bearer",
            "expires_in": 300
        })))
        .mount(&idp)
        .await;

    let routes = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        routes.path(),
        r#"
- host: "api.internal"
  target_audience: "svc-C"
"#,
    )
    .unwrap();
    let resolver = StaticResolver::load(routes.path()).unwrap();

    let processor =
        outbound_processor(exchange_config(&format!("{}/token", idp.uri())), resolver);

    let response = processor
        .handle(headers_request(&[
            (":authority", "api.internal:8443"),
            ("authorization", "Bearer T1"),
        ]))
        .await
        .unwrap();

    let mutation = headers_mutation(&response).expect("rewrite mutation");
    let header = mutation.set_headers[0].header.as_ref().unwrap();
    assert_eq!(&header.raw_value[..], b"Bearer T3".as_slice());
}

/// A passthrough route skips the exchange entirely; the endpoint is never
/// called
#[tokio::test]
async fn test_route_passthrough_skips_exchange() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "T2"
        })))
        .expect(0)
        .mount(&idp)
        .await;

    let routes = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        routes.path(),
        r#"
- host: "trusted.internal"
  passthrough: true
"#,
    )
    .unwrap();
    let resolver = StaticResolver::load(routes.path()).unwrap();

    let processor =
        outbound_processor(exchange_config(&format!("{}/token", idp.uri())), resolver);

    let response = processor
        .handle(headers_request(&[
            (":authority", "trusted.internal"),
            ("authorization", "Bearer T1"),
        ]))
        .await
        .unwrap();

    assert!(headers_mutation(&response).is_none());
}
