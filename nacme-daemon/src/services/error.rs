//! HTTP error responses.
//!
//! Every failure is rendered as `{"detail": "..."}`. Storage errors are
//! logged in full and summarised to the client.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::admission::IssueError;
use crate::coordinator::{FailureClass, OnboardError};

pub const INTERNAL_ERROR: &str = "internal error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }

    pub fn too_many_requests() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded. Please try again later.",
        )
    }

    pub fn internal() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
    }
}

impl From<OnboardError> for ApiError {
    fn from(err: OnboardError) -> Self {
        match err.class() {
            FailureClass::Unauthorized => Self::forbidden(err.to_string()),
            FailureClass::Validation => Self::unprocessable(err.to_string()),
            FailureClass::Capacity => Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            FailureClass::Signer | FailureClass::Internal => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            FailureClass::Storage => {
                tracing::error!(error = %err, "Storage failure during onboarding");
                Self::internal()
            }
        }
    }
}

impl From<IssueError> for ApiError {
    fn from(err: IssueError) -> Self {
        match err {
            IssueError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure creating API key");
                Self::internal()
            }
            other => Self::unprocessable(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let status = match rejection.status() {
            StatusCode::UNSUPPORTED_MEDIA_TYPE => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AllocationError;
    use crate::ledger::LedgerError;
    use crate::signer::SignerError;
    use nacme_core::{AddressPool, AdmissionError, PrefixError};

    #[test]
    fn test_onboard_error_statuses() {
        let pool = AddressPool::parse("10.0.0.0/30").unwrap();
        let cases = [
            (OnboardError::Admission(AdmissionError::InvalidKey), StatusCode::FORBIDDEN),
            (OnboardError::Admission(AdmissionError::Expired), StatusCode::FORBIDDEN),
            (OnboardError::Admission(AdmissionError::Exhausted), StatusCode::FORBIDDEN),
            (
                OnboardError::Admission(AdmissionError::NoGroups),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (OnboardError::Prefix(PrefixError::TooLong), StatusCode::UNPROCESSABLE_ENTITY),
            (OnboardError::PublicKeyRequired, StatusCode::UNPROCESSABLE_ENTITY),
            (
                OnboardError::Allocation(AllocationError::PoolExhausted(pool)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                OnboardError::Allocation(AllocationError::HostnameExhausted(20)),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                OnboardError::Signer(SignerError::InvalidCaMaterial),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (OnboardError::RetriesExhausted(10), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            let label = err.to_string();
            assert_eq!(ApiError::from(err).status, status, "{label}");
        }
    }

    #[test]
    fn test_storage_errors_are_summarised() {
        let err = OnboardError::Storage(LedgerError::Database(sqlx::Error::PoolTimedOut));
        let api = ApiError::from(err);
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.detail, INTERNAL_ERROR);
    }

    #[test]
    fn test_signer_io_detail_hides_os_error() {
        let io = std::io::Error::new(
            std::io::ErrorKind::Other,
            "No space left on device: /tmp/.tmpAbC123/host.crt",
        );
        let api = ApiError::from(OnboardError::Signer(SignerError::Io(io)));
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.detail, "Certificate generation failed");
        assert!(!api.detail.contains("/tmp"));
    }

    #[test]
    fn test_admission_detail_is_user_facing() {
        let api = ApiError::from(OnboardError::Admission(AdmissionError::Exhausted));
        assert_eq!(api.detail, "No uses remaining on API key");
    }
}
