//! HTTP handlers for the MDM endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Request},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
};
use http_body_util::LengthLimitError;
use thiserror::Error;

use crate::pipeline::{InboundRequest, PeerCertificates, Rejection};
use crate::service::{checkin_request, command_and_report_results_request, DispatchError};
use crate::{AppState, MAX_REQUEST_BODY_BYTES};

/// Content type devices send on check-in requests to the combined endpoint.
pub const CHECKIN_CONTENT_TYPE: &str = "application/x-apple-aspen-mdm-checkin";

/// API error type mapping to HTTP status codes.
///
/// Response bodies only ever carry the status reason phrase; details go to
/// the log.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request rejected with {}", .0.status())]
    Rejected(Rejection),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Rejected(rejection) => return (*rejection).into_response(),
            ApiError::Dispatch(err) => {
                tracing::info!(error = %err, "handling MDM request");
                err.status()
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "handling MDM request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, status.canonical_reason().unwrap_or_default()).into_response()
    }
}

impl From<Rejection> for ApiError {
    fn from(rejection: Rejection) -> Self {
        Self::Rejected(rejection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Checkin,
    CommandReport,
}

/// Buffers the body and collects what the pipeline needs from `request`.
///
/// An oversized body is the client's fault; any other read failure is ours.
async fn inbound_request(request: Request) -> Result<InboundRequest, ApiError> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| {
            let e = e.into_inner();
            if e.is::<LengthLimitError>() {
                tracing::info!(error = %e, "request body over limit");
                ApiError::Rejected(Rejection::bad_request())
            } else {
                ApiError::Internal(format!("reading request body: {e}"))
            }
        })?;
    let peer_certificates = parts
        .extensions
        .get::<PeerCertificates>()
        .map(|peer| peer.0.clone())
        .unwrap_or_default();
    Ok(InboundRequest {
        headers: parts.headers,
        body,
        peer_certificates,
    })
}

async fn serve(
    state: Arc<AppState>,
    request: Request,
    endpoint: Endpoint,
) -> Result<Response, ApiError> {
    let inbound = inbound_request(request).await?;

    let body = tokio::task::spawn_blocking(move || {
        let scope = state.pipeline.run(&inbound)?;
        let body = match endpoint {
            Endpoint::Checkin => checkin_request(state.service.as_ref(), &scope, &inbound.body)?,
            Endpoint::CommandReport => {
                command_and_report_results_request(state.service.as_ref(), &scope, &inbound.body)?
            }
        };
        Ok::<_, ApiError>(body)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("task join error: {e}")))??;

    Ok(match body {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::OK.into_response(),
    })
}

/// Handler for `PUT|POST /checkin`.
pub async fn checkin_handler(
    Extension(state): Extension<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    serve(state, request, Endpoint::Checkin).await
}

/// Handler for `PUT|POST /mdm`.
///
/// Check-ins and command reports share this endpoint; check-ins are told
/// apart by their content type.
pub async fn mdm_handler(
    Extension(state): Extension<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    let is_checkin = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(CHECKIN_CONTENT_TYPE));
    let endpoint = if is_checkin {
        Endpoint::Checkin
    } else {
        Endpoint::CommandReport
    };
    serve(state, request, endpoint).await
}
