//! Service error taxonomy and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SvcError>;

/// Every failure the hub can surface, each with a distinct HTTP status
/// where it reaches the HTTP layer. Authentication failures deliberately
/// reveal nothing beyond the status code.
#[derive(Debug, Error)]
pub enum SvcError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("tss process failed")]
    TssProcessFailed,

    #[error("ceremony deadline exceeded")]
    Timeout,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("transport closed before terminal state")]
    TransportClosed,

    #[error("inconsistent wallet state")]
    InconsistentState,

    #[error("invalid shares")]
    InvalidShares,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SvcError {
    pub fn status(&self) -> StatusCode {
        match self {
            SvcError::Unauthorized => StatusCode::UNAUTHORIZED,
            SvcError::BadRequest(_) | SvcError::InvalidShares => StatusCode::BAD_REQUEST,
            SvcError::NotFound => StatusCode::NOT_FOUND,
            SvcError::Conflict => StatusCode::CONFLICT,
            SvcError::TssProcessFailed
            | SvcError::Timeout
            | SvcError::ProtocolViolation(_)
            | SvcError::TransportClosed
            | SvcError::InconsistentState
            | SvcError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SvcError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match status {
            StatusCode::UNAUTHORIZED => "Unauthorized".to_string(),
            StatusCode::BAD_REQUEST => "Bad Request".to_string(),
            StatusCode::NOT_FOUND => "Not Found".to_string(),
            StatusCode::CONFLICT => "Conflict".to_string(),
            _ => "Internal Server Error".to_string(),
        };
        tracing::warn!(error = %self, status = %status, "request failed");
        (status, body).into_response()
    }
}

impl From<sigil_core::Error> for SvcError {
    fn from(err: sigil_core::Error) -> Self {
        match err {
            sigil_core::Error::TssProcessFailed | sigil_core::Error::InvalidSignature => {
                SvcError::TssProcessFailed
            }
            sigil_core::Error::InvalidShares => SvcError::InvalidShares,
            sigil_core::Error::Conversion(detail)
            | sigil_core::Error::Deserialization(detail)
            | sigil_core::Error::InvalidConfig(detail) => SvcError::BadRequest(detail),
            other => SvcError::Internal(other.to_string()),
        }
    }
}

impl From<sigil_session::SessionError> for SvcError {
    fn from(err: sigil_session::SessionError) -> Self {
        match err {
            sigil_session::SessionError::Malformed(detail) => SvcError::BadRequest(detail),
            sigil_session::SessionError::UnsupportedKind(kind) => {
                SvcError::ProtocolViolation(format!("unsupported envelope kind {kind}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_the_taxonomy() {
        assert_eq!(SvcError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            SvcError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(SvcError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(SvcError::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(
            SvcError::Timeout.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
