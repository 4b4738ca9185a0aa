use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Errors surfaced on the synchronous request path.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ControlError::Unauthorized(_) => StatusCode::FORBIDDEN,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ControlError::InvalidState(_) => StatusCode::CONFLICT,
            ControlError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Failure body: `{code, message}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

/// Success envelope wrapping every handler payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse<T> {
    pub code: u16,
    pub message: String,
    pub response: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn ok(message: impl Into<String>, response: T) -> Json<Self> {
        Json(Self {
            code: StatusCode::OK.as_u16(),
            message: message.into(),
            response,
        })
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ControlError::Internal(e) => {
                error!("Internal error: {:#}", e);
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                code: status.as_u16(),
                message,
            }),
        )
            .into_response()
    }
}
