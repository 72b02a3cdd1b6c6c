//! Business-logic seams and the protocol dispatcher.
//!
//! The dispatcher decodes a request body into a protocol message, calls the
//! matching service operation and turns its result into response bytes.

use std::sync::Arc;

use axum::http::StatusCode;
use tessera_db::CertAuthStore;
use tessera_identity::hash_cert;
use tessera_protocol::{
    decode_checkin, decode_command_results, Authenticate, BootstrapToken, CheckOut,
    CheckinMessage, Command, CommandResults, DecodeError, EncodeError, GetBootstrapToken,
    SetBootstrapToken, TokenUpdate, UserAuthenticate,
};
use thiserror::Error;

use crate::scope::RequestScope;

/// Error returned by service implementations.
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Handlers for check-in messages.
pub trait Checkin: Send + Sync {
    fn authenticate(&self, scope: &RequestScope, msg: &Authenticate) -> Result<(), ServiceError>;

    fn token_update(&self, scope: &RequestScope, msg: &TokenUpdate) -> Result<(), ServiceError>;

    fn check_out(&self, scope: &RequestScope, msg: &CheckOut) -> Result<(), ServiceError>;

    /// Returns the response body for the device verbatim, if any.
    fn user_authenticate(
        &self,
        scope: &RequestScope,
        msg: &UserAuthenticate,
    ) -> Result<Option<Vec<u8>>, ServiceError>;

    fn set_bootstrap_token(
        &self,
        scope: &RequestScope,
        msg: &SetBootstrapToken,
    ) -> Result<(), ServiceError>;

    fn get_bootstrap_token(
        &self,
        scope: &RequestScope,
        msg: &GetBootstrapToken,
    ) -> Result<BootstrapToken, ServiceError>;
}

/// Handler for command reports.
pub trait CommandAndReportResults: Send + Sync {
    /// Records `report` and returns the next command for the device, if any.
    fn command_and_report_results(
        &self,
        scope: &RequestScope,
        report: &CommandResults,
    ) -> Result<Option<Command>, ServiceError>;
}

/// A service handling both endpoints.
pub trait CheckinAndCommandService: Checkin + CommandAndReportResults {}

impl<T: Checkin + CommandAndReportResults> CheckinAndCommandService for T {}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("decoding check-in: {0}")]
    DecodeCheckin(#[source] DecodeError),

    #[error("decoding command results: {0}")]
    DecodeCommandResults(#[source] DecodeError),

    #[error("unrecognized message type {0:?}")]
    UnrecognizedMessageType(String),

    #[error("{operation} service: {source}")]
    Service {
        operation: &'static str,
        source: ServiceError,
    },

    #[error("marshal bootstrap token: {0}")]
    Encode(#[from] EncodeError),
}

impl DispatchError {
    /// HTTP status for this error: malformed input is the client's fault,
    /// everything else is ours.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::DecodeCheckin(_)
            | Self::DecodeCommandResults(_)
            | Self::UnrecognizedMessageType(_) => StatusCode::BAD_REQUEST,
            Self::Service { .. } | Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn service_error(operation: &'static str) -> impl FnOnce(ServiceError) -> DispatchError {
    move |source| DispatchError::Service { operation, source }
}

/// Decodes a check-in body and dispatches it to `svc`.
///
/// Returns the response body, which is only present for `UserAuthenticate`
/// (when the service supplies one) and `GetBootstrapToken`.
///
/// # Errors
///
/// Returns a [`DispatchError`]; see [`DispatchError::status`] for how each
/// variant maps onto HTTP.
pub fn checkin_request<S>(
    svc: &S,
    scope: &RequestScope,
    body: &[u8],
) -> Result<Option<Vec<u8>>, DispatchError>
where
    S: Checkin + ?Sized,
{
    let message = decode_checkin(body).map_err(|err| match err {
        DecodeError::UnrecognizedMessageType(t) => DispatchError::UnrecognizedMessageType(t),
        err => DispatchError::DecodeCheckin(err),
    })?;

    match &message {
        CheckinMessage::Authenticate(msg) => svc
            .authenticate(scope, msg)
            .map_err(service_error("authenticate"))?,
        CheckinMessage::TokenUpdate(msg) => svc
            .token_update(scope, msg)
            .map_err(service_error("tokenupdate"))?,
        CheckinMessage::CheckOut(msg) => svc
            .check_out(scope, msg)
            .map_err(service_error("checkout"))?,
        CheckinMessage::SetBootstrapToken(msg) => svc
            .set_bootstrap_token(scope, msg)
            .map_err(service_error("setbootstraptoken"))?,
        CheckinMessage::UserAuthenticate(msg) => {
            return svc
                .user_authenticate(scope, msg)
                .map_err(service_error("userauthenticate"));
        }
        CheckinMessage::GetBootstrapToken(msg) => {
            let token = svc
                .get_bootstrap_token(scope, msg)
                .map_err(service_error("getbootstraptoken"))?;
            return Ok(Some(token.encode()?));
        }
    }
    Ok(None)
}

/// Decodes a command report, hands it to `svc` and returns the raw bytes of
/// the next command, if there is one.
///
/// # Errors
///
/// Returns [`DispatchError::DecodeCommandResults`] for an undecodable body
/// and [`DispatchError::Service`] when the service fails.
pub fn command_and_report_results_request<S>(
    svc: &S,
    scope: &RequestScope,
    body: &[u8],
) -> Result<Option<Vec<u8>>, DispatchError>
where
    S: CommandAndReportResults + ?Sized,
{
    let report = decode_command_results(body).map_err(DispatchError::DecodeCommandResults)?;
    let command = svc
        .command_and_report_results(scope, &report)
        .map_err(service_error("command and report results"))?;
    Ok(command.map(|cmd| cmd.raw))
}

#[derive(Debug, Error)]
#[error("{0} is not supported by the logging service")]
struct Unsupported(&'static str);

/// Logs every message it receives.
///
/// With a certificate store attached, `Authenticate` and `TokenUpdate`
/// associate the request certificate with the device, so later requests
/// bind to its enrollment. Bootstrap token escrow is not available, so
/// `GetBootstrapToken` fails.
#[derive(Clone, Default)]
pub struct LoggingService {
    cert_auth: Option<Arc<dyn CertAuthStore>>,
}

impl LoggingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cert_auth(mut self, store: Arc<dyn CertAuthStore>) -> Self {
        self.cert_auth = Some(store);
        self
    }

    fn associate(
        &self,
        scope: &RequestScope,
        device_id: Option<&str>,
    ) -> Result<(), ServiceError> {
        let Some(store) = &self.cert_auth else {
            return Ok(());
        };
        let device_id = device_id.filter(|id| !id.is_empty());
        let (Some(cert), Some(device_id)) = (scope.certificate(), device_id) else {
            tracing::debug!("nothing to associate without certificate and device id");
            return Ok(());
        };
        if scope.enrollment_id() == Some(device_id) {
            return Ok(());
        }
        store.associate_cert_hash(device_id, &hash_cert(&cert))?;
        tracing::info!(enrollment_id = device_id, "associated identity certificate");
        Ok(())
    }
}

impl Checkin for LoggingService {
    fn authenticate(&self, scope: &RequestScope, msg: &Authenticate) -> Result<(), ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            udid = msg.udid.as_deref(),
            serial_number = msg.serial_number.as_deref(),
            topic = %msg.topic,
            "Authenticate"
        );
        let device_id = msg.udid.as_deref().or(msg.enrollment_id.as_deref());
        self.associate(scope, device_id)
    }

    fn token_update(&self, scope: &RequestScope, msg: &TokenUpdate) -> Result<(), ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            udid = msg.udid.as_deref(),
            user_id = msg.user_id.as_deref(),
            awaiting_configuration = msg.awaiting_configuration,
            "TokenUpdate"
        );
        let device_id = msg.udid.as_deref().or(msg.enrollment_id.as_deref());
        self.associate(scope, device_id)
    }

    fn check_out(&self, scope: &RequestScope, msg: &CheckOut) -> Result<(), ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            udid = msg.udid.as_deref(),
            "CheckOut"
        );
        Ok(())
    }

    fn user_authenticate(
        &self,
        scope: &RequestScope,
        msg: &UserAuthenticate,
    ) -> Result<Option<Vec<u8>>, ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            user_id = %msg.user_id,
            digest_response = msg.digest_response.is_some(),
            "UserAuthenticate"
        );
        Ok(None)
    }

    fn set_bootstrap_token(
        &self,
        scope: &RequestScope,
        msg: &SetBootstrapToken,
    ) -> Result<(), ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            udid = msg.udid.as_deref(),
            cleared = msg.bootstrap_token.is_none(),
            "SetBootstrapToken"
        );
        Ok(())
    }

    fn get_bootstrap_token(
        &self,
        scope: &RequestScope,
        msg: &GetBootstrapToken,
    ) -> Result<BootstrapToken, ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            udid = msg.udid.as_deref(),
            "GetBootstrapToken"
        );
        Err(Unsupported("bootstrap token escrow").into())
    }
}

impl CommandAndReportResults for LoggingService {
    fn command_and_report_results(
        &self,
        scope: &RequestScope,
        report: &CommandResults,
    ) -> Result<Option<Command>, ServiceError> {
        tracing::info!(
            enrollment_id = scope.enrollment_id(),
            udid = report.udid.as_deref(),
            status = %report.status,
            command_uuid = report.command_uuid.as_deref(),
            "command report"
        );
        Ok(None)
    }
}
