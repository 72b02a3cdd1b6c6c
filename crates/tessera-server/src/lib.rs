//! Tessera MDM server library logic.
//!
//! Every device request runs through an identity [`pipeline::Pipeline`]
//! (certificate extraction, trust policy, enrollment binding) before its
//! body is dispatched to the check-in or command service.

pub mod api;
pub mod certverify;
pub mod config;
pub mod middleware;
pub mod pipeline;
pub mod scope;
pub mod service;
pub mod tls;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, put},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tessera_db::CertAuthRetriever;
use tessera_identity::hash_cert;
use tower_http::trace::TraceLayer;

use certverify::{AllowAll, CertVerifier, PoolVerifier};
use config::{ExtractorKind, MdmConfig, VerifyMode};
use middleware::{
    CertVerifyStage, EnrollmentBinder, MdmSignatureExtractor, PemHeaderExtractor,
    TlsPeerExtractor,
};
use pipeline::{Pipeline, PipelineError};
use service::CheckinAndCommandService;

/// Maximum request body size (2 MiB).
pub const MAX_REQUEST_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub service: Arc<dyn CheckinAndCommandService>,
}

/// Builds the trust policy named by `config`.
///
/// # Errors
///
/// Returns [`PipelineError::MissingCaPath`] or [`PipelineError::CaBundle`]
/// when pool mode has no usable CA bundle.
pub fn verifier_from_config(config: &MdmConfig) -> Result<Arc<dyn CertVerifier>, PipelineError> {
    match config.verify.mode {
        VerifyMode::AllowAll => Ok(Arc::new(AllowAll)),
        VerifyMode::Pool => {
            let path = config
                .verify
                .ca_path
                .as_deref()
                .ok_or(PipelineError::MissingCaPath)?;
            let ca_error = |reason: String| PipelineError::CaBundle {
                path: path.to_string(),
                reason,
            };
            let bundle = std::fs::read(path).map_err(|e| ca_error(e.to_string()))?;
            let verifier = PoolVerifier::from_pem(&bundle).map_err(|e| ca_error(e.to_string()))?;
            if verifier.roots().is_empty() {
                return Err(ca_error("no certificates in bundle".to_string()));
            }
            tracing::info!(path, roots = verifier.roots().len(), "loaded trusted CA certificates");
            Ok(Arc::new(
                verifier.with_validity_check(config.verify.check_validity),
            ))
        }
    }
}

/// Assembles the identity pipeline: the configured extractors in order,
/// then the trust gate, then the enrollment binder.
///
/// # Errors
///
/// Returns a [`PipelineError`] when a stage cannot be constructed.
pub fn build_pipeline(
    config: &MdmConfig,
    verifier: Arc<dyn CertVerifier>,
    store: Arc<dyn CertAuthRetriever>,
) -> Result<Pipeline, PipelineError> {
    let mut pipeline = Pipeline::new();
    for extractor in &config.extractors {
        pipeline = match extractor {
            ExtractorKind::PemHeader => {
                pipeline.with_stage(PemHeaderExtractor::from_name(&config.cert_header)?)
            }
            ExtractorKind::TlsPeer => pipeline.with_stage(TlsPeerExtractor),
            ExtractorKind::MdmSignature => {
                pipeline.with_stage(MdmSignatureExtractor::new(config.signature_log()))
            }
        };
    }

    let binder = EnrollmentBinder::builder()
        .hasher(Arc::new(hash_cert))
        .store(store)
        .enforce(config.enforce_enrollment)
        .build()?;

    Ok(pipeline
        .with_stage(CertVerifyStage::new(verifier))
        .with_stage(binder))
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/checkin",
            put(api::checkin_handler).post(api::checkin_handler),
        )
        .route("/mdm", put(api::mdm_handler).post(api::mdm_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
