//! Ordered request pipeline with early-return short-circuiting.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::scope::RequestScope;

/// Peer certificate chain (DER, leaf first) presented during the TLS
/// handshake. Inserted as a request extension by the TLS transport.
#[derive(Debug, Clone, Default)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

/// The parts of an HTTP request the pipeline may look at.
///
/// The body is buffered once up front so every stage and the dispatcher see
/// the same bytes.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer_certificates: Vec<Vec<u8>>,
}

/// A terminal pipeline response.
///
/// Only client errors and server errors can be constructed. Devices treat a
/// 401 as an instruction to unenroll, so no stage can ever produce one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    status: StatusCode,
}

impl Rejection {
    pub fn bad_request() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
        }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let reason = self.status.canonical_reason().unwrap_or_default();
        (self.status, reason).into_response()
    }
}

/// Outcome of a single stage.
#[derive(Debug)]
pub enum Flow {
    /// Continue with the (possibly extended) scope.
    Next(RequestScope),
    /// Stop the request with this response.
    Stop(Rejection),
}

/// One step of the pipeline.
pub trait Stage: Send + Sync {
    fn handle(&self, req: &InboundRequest, scope: RequestScope) -> Flow;
}

/// Errors raised while assembling a pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("enrollment binder requires a certificate hash function")]
    MissingHasher,

    #[error("enrollment binder requires a certificate association store")]
    MissingStore,

    #[error("invalid certificate header name {0:?}")]
    InvalidHeaderName(String),

    #[error("pool verification requires mdm.verify.ca_path")]
    MissingCaPath,

    #[error("loading CA certificates from {path}: {reason}")]
    CaBundle { path: String, reason: String },
}

/// Stages executed in insertion order.
///
/// Extractors all write to the same certificate slot, so when more than one
/// extractor finds a certificate the one added last wins. Deployments that
/// enable several extractors choose precedence through their order.
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs every stage against `req`, stopping at the first rejection.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] of the stage that stopped the request.
    pub fn run(&self, req: &InboundRequest) -> Result<RequestScope, Rejection> {
        let mut scope = RequestScope::new();
        for stage in &self.stages {
            scope = match stage.handle(req, scope) {
                Flow::Next(next) => next,
                Flow::Stop(rejection) => return Err(rejection),
            };
        }
        Ok(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tag(&'static str);

    impl Stage for Tag {
        fn handle(&self, _req: &InboundRequest, scope: RequestScope) -> Flow {
            Flow::Next(scope.with_enrollment_id(self.0))
        }
    }

    struct Reject;

    impl Stage for Reject {
        fn handle(&self, _req: &InboundRequest, _scope: RequestScope) -> Flow {
            Flow::Stop(Rejection::bad_request())
        }
    }

    struct Count(Arc<AtomicUsize>);

    impl Stage for Count {
        fn handle(&self, _req: &InboundRequest, scope: RequestScope) -> Flow {
            self.0.fetch_add(1, Ordering::SeqCst);
            Flow::Next(scope)
        }
    }

    #[test]
    fn empty_pipeline_yields_empty_scope() {
        let scope = Pipeline::new().run(&InboundRequest::default()).unwrap();
        assert_eq!(scope, RequestScope::new());
    }

    #[test]
    fn stages_run_in_order_and_last_write_wins() {
        let pipeline = Pipeline::new().with_stage(Tag("first")).with_stage(Tag("second"));
        assert_eq!(pipeline.len(), 2);
        let scope = pipeline.run(&InboundRequest::default()).unwrap();
        assert_eq!(scope.enrollment_id(), Some("second"));
    }

    #[test]
    fn rejection_stops_later_stages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pipeline = Pipeline::new()
            .with_stage(Count(calls.clone()))
            .with_stage(Reject)
            .with_stage(Count(calls.clone()));

        let rejection = pipeline.run(&InboundRequest::default()).unwrap_err();
        assert_eq!(rejection.status(), StatusCode::BAD_REQUEST);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejection_body_is_the_reason_phrase() {
        let response = Rejection::internal().into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Internal Server Error");
    }
}
