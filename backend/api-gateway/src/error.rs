/// Error types for the api-gateway
///
/// Domain errors are raised once by the engine and registry, then mapped to
/// HTTP and gRPC codes through [`AppError::codes`] so both surfaces agree.
use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use grpc_clients::IdentityError;
use serde_json::json;
use thiserror::Error;
use tonic::{Code, Status};

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Unknown stream or client
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed request or missing required field
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Identity resolution failed on an explicit operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// The one place a domain error becomes a transport status.
    pub fn codes(&self) -> (StatusCode, Code) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, Code::NotFound),
            AppError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, Code::InvalidArgument),
            AppError::Unauthorized(_) | AppError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Code::Internal)
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidArgument(_) => "invalid_argument",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn to_status(&self) -> Status {
        let (_, code) = self.codes();
        Status::new(code, self.to_string())
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.codes().0
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }))
    }
}

impl From<AppError> for Status {
    fn from(err: AppError) -> Self {
        err.to_status()
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        AppError::Unauthorized(format!("user not found or unauthorized: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_and_grpc_codes_agree() {
        let cases = [
            (AppError::NotFound("s".into()), 404, Code::NotFound),
            (AppError::InvalidArgument("s".into()), 400, Code::InvalidArgument),
            (AppError::Unauthorized("s".into()), 500, Code::Internal),
            (AppError::Internal("s".into()), 500, Code::Internal),
        ];

        for (err, http, grpc) in cases {
            assert_eq!(err.status_code().as_u16(), http, "{:?}", err);
            assert_eq!(Status::from(err.clone()).code(), grpc, "{:?}", err);
        }
    }

    #[test]
    fn identity_failures_become_unauthorized() {
        let err: AppError = IdentityError::NotFound("c1".into()).into();
        assert!(matches!(err, AppError::Unauthorized(ref msg) if msg.contains("c1")));
    }

    #[test]
    fn status_carries_message() {
        let status = AppError::NotFound("stream stream_x".into()).to_status();
        assert_eq!(status.message(), "Not found: stream stream_x");
    }
}
