//! Envoy external-processing server
//!
//! Implements the bidirectional gRPC stream contract: the proxy sends a
//! sequence of `ProcessingRequest` messages per HTTP request, the server
//! answers each in order. Only the request-headers event carries policy:
//! the direction marker header selects inbound validation or outbound
//! exchange. Everything else is echoed with the matching empty response.

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{HeaderMap, HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::r#type::v3::{HttpStatus, StatusCode};
use envoy_types::pb::envoy::service::ext_proc::v3::{
    external_processor_server::ExternalProcessor, processing_request, processing_response,
    BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, ImmediateResponse,
    ProcessingRequest, ProcessingResponse, TrailersResponse,
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use crate::{DIRECTION_HEADER, DIRECTION_INBOUND};

use super::inbound::InboundValidator;
use super::outbound::{strip_bearer, OutboundDecision, OutboundExchanger};

/// The external processor
///
/// Cheap to clone; per-stream tasks hold a clone for the stream's
/// lifetime.
#[derive(Clone)]
pub struct AuthBridgeProcessor {
    inbound: Option<Arc<InboundValidator>>,
    outbound: Arc<OutboundExchanger>,
}

impl AuthBridgeProcessor {
    /// Create a processor
    ///
    /// `inbound` is `None` when inbound validation is unconfigured; all
    /// inbound traffic then passes through (with the direction marker
    /// still stripped).
    #[must_use]
    pub fn new(inbound: Option<Arc<InboundValidator>>, outbound: Arc<OutboundExchanger>) -> Self {
        Self { inbound, outbound }
    }

    /// Handle one message of a processing stream
    ///
    /// # Errors
    ///
    /// Returns `Status::invalid_argument` for a message without a payload;
    /// the stream is terminated in that case.
    pub async fn handle(
        &self,
        request: ProcessingRequest,
    ) -> std::result::Result<ProcessingResponse, Status> {
        match request.request {
            Some(processing_request::Request::RequestHeaders(headers)) => {
                let header_map = headers.headers.unwrap_or_default();
                let direction = header_value(&header_map, DIRECTION_HEADER);

                if direction.as_deref() == Some(DIRECTION_INBOUND) {
                    Ok(self.handle_inbound(&header_map).await)
                } else {
                    Ok(self.handle_outbound(&header_map).await)
                }
            }
            Some(processing_request::Request::ResponseHeaders(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::ResponseHeaders(
                    HeadersResponse::default(),
                )),
                ..Default::default()
            }),
            Some(processing_request::Request::RequestBody(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::RequestBody(
                    BodyResponse::default(),
                )),
                ..Default::default()
            }),
            Some(processing_request::Request::ResponseBody(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::ResponseBody(
                    BodyResponse::default(),
                )),
                ..Default::default()
            }),
            Some(processing_request::Request::RequestTrailers(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::RequestTrailers(
                    TrailersResponse::default(),
                )),
                ..Default::default()
            }),
            Some(processing_request::Request::ResponseTrailers(_)) => Ok(ProcessingResponse {
                response: Some(processing_response::Response::ResponseTrailers(
                    TrailersResponse::default(),
                )),
                ..Default::default()
            }),
            None => Err(Status::invalid_argument("processing request without payload")),
        }
    }

    /// Inbound: validate the bearer token, admit or deny
    ///
    /// Fails closed: anything that is not a verified token from the
    /// expected issuer is a 401. Admitted requests have the direction
    /// marker removed so the application never observes it.
    async fn handle_inbound(&self, headers: &HeaderMap) -> ProcessingResponse {
        let Some(validator) = &self.inbound else {
            debug!("Inbound validation not configured, passing through");
            return strip_direction_response();
        };

        let Some(auth) = header_value(headers, "authorization") else {
            debug!("Inbound request without Authorization header");
            return deny("missing Authorization header");
        };

        let Some(token) = strip_bearer(&auth) else {
            debug!("Inbound Authorization header is not a bearer token");
            return deny("invalid Authorization header format");
        };

        match validator.validate(token).await {
            Ok(_) => {
                debug!("Inbound token validated, forwarding request");
                strip_direction_response()
            }
            Err(e) => {
                warn!(error = %e, "Inbound JWT validation failed");
                deny(&format!("token validation failed: {e}"))
            }
        }
    }

    /// Outbound: re-mint the bearer token for the destination, or pass
    /// through (fail-open)
    async fn handle_outbound(&self, headers: &HeaderMap) -> ProcessingResponse {
        let authority =
            header_value(headers, ":authority").or_else(|| header_value(headers, "host"));
        let auth = header_value(headers, "authorization");

        match self
            .outbound
            .handle(authority.as_deref(), auth.as_deref())
            .await
        {
            OutboundDecision::Rewrite(token) => set_authorization_response(&token),
            OutboundDecision::Passthrough => empty_request_headers_response(),
        }
    }
}

#[tonic::async_trait]
impl ExternalProcessor for AuthBridgeProcessor {
    type ProcessStream =
        Pin<Box<dyn Stream<Item = std::result::Result<ProcessingResponse, Status>> + Send + 'static>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> std::result::Result<Response<Self::ProcessStream>, Status> {
        let mut inbound_stream = request.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let processor = self.clone();

        // One task per stream; messages within it are handled sequentially
        // so responses leave in arrival order.
        tokio::spawn(async move {
            while let Some(message) = inbound_stream.next().await {
                let result = match message {
                    Ok(request) => processor.handle(request).await,
                    Err(status) => {
                        warn!(error = %status, "Error receiving processing request");
                        let _ = tx.send(Err(status)).await;
                        break;
                    }
                };

                let terminal = result.is_err();
                if tx.send(result).await.is_err() {
                    // Proxy closed the stream; abandon in-flight work
                    debug!("Processing stream closed by proxy");
                    break;
                }
                if terminal {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Case-insensitive header lookup, tolerating both wire encodings
fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .headers
        .iter()
        .find(|h| h.key.eq_ignore_ascii_case(name))
        .map(|h| {
            if h.raw_value.is_empty() {
                h.value.clone()
            } else {
                String::from_utf8_lossy(&h.raw_value).into_owned()
            }
        })
}

/// Empty request-headers response: forward unchanged
fn empty_request_headers_response() -> ProcessingResponse {
    ProcessingResponse {
        response: Some(processing_response::Response::RequestHeaders(
            HeadersResponse::default(),
        )),
        ..Default::default()
    }
}

/// Forward the request with the direction marker removed
fn strip_direction_response() -> ProcessingResponse {
    mutation_response(HeaderMutation {
        remove_headers: vec![DIRECTION_HEADER.to_string()],
        ..Default::default()
    })
}

/// Replace the Authorization header with the exchanged token
fn set_authorization_response(token: &str) -> ProcessingResponse {
    mutation_response(HeaderMutation {
        set_headers: vec![HeaderValueOption {
            header: Some(HeaderValue {
                key: "authorization".to_string(),
                raw_value: format!("Bearer {token}").into_bytes().into(),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    })
}

fn mutation_response(mutation: HeaderMutation) -> ProcessingResponse {
    ProcessingResponse {
        response: Some(processing_response::Response::RequestHeaders(
            HeadersResponse {
                response: Some(CommonResponse {
                    header_mutation: Some(mutation),
                    ..Default::default()
                }),
            },
        )),
        ..Default::default()
    }
}

/// Immediate 401 response; the request is not forwarded
fn deny(message: &str) -> ProcessingResponse {
    let body = serde_json::json!({
        "error": "unauthorized",
        "message": message,
    });

    ProcessingResponse {
        response: Some(processing_response::Response::ImmediateResponse(
            ImmediateResponse {
                status: Some(HttpStatus {
                    code: StatusCode::Unauthorized.into(),
                }),
                body: serde_json::to_vec(&body).unwrap_or_default().into(),
                details: "jwt_validation_failed".to_string(),
                ..Default::default()
            },
        )),
        ..Default::default()
    }
}
