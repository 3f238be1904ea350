use core::error::Error;

use poem::http::StatusCode;

use crate::domain::orchestrator::HookError;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

/// HTTP status reported for a failed hook
pub fn hook_error_status(error: &HookError) -> StatusCode {
    match error {
        HookError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        HookError::ExternalCall { .. } => StatusCode::BAD_GATEWAY,
        HookError::Persistence { .. }
        | HookError::Kernel { .. }
        | HookError::PartialProvisioning { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
