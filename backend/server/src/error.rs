use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::{patients::StoreError, tokens::TokenError};

#[derive(Error, Debug)]
pub enum AppError {
    /// Unknown and expired tokens share one response.
    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("invalid_or_expired")]
    InvalidOrExpired,

    #[error("missing_required_field")]
    MissingRequiredField(&'static str),

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Patient not found")]
    PatientNotFound,

    #[error("Patient {0} already exists")]
    DuplicatePatient(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[source] StoreError),

    #[error("Entropy source failure: {0}")]
    Entropy(#[source] rand::Error),

    #[error("Internal error: {0}")]
    InternalError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl From<TokenError> for AppError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::NotFound | TokenError::Expired | TokenError::Claimed => {
                AppError::InvalidToken
            }
            TokenError::Entropy(e) => AppError::Entropy(e),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Duplicate(id) => AppError::DuplicatePatient(id),
            other => AppError::Persistence(other),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidToken | AppError::InvalidOrExpired | AppError::PatientNotFound => {
                StatusCode::NOT_FOUND
            }
            AppError::MissingRequiredField(_) | AppError::MalformedPayload => {
                StatusCode::BAD_REQUEST
            }
            AppError::DuplicatePatient(_) => StatusCode::CONFLICT,
            AppError::Persistence(_) | AppError::Entropy(_) | AppError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = match &self {
            AppError::InvalidToken => json!({ "valid": false, "message": self.to_string() }),
            AppError::InvalidOrExpired => json!({ "success": false, "message": self.to_string() }),
            AppError::MissingRequiredField(field) => {
                json!({ "success": false, "message": self.to_string(), "field": field })
            }
            AppError::Persistence(_) | AppError::Entropy(_) | AppError::InternalError(_) => {
                // Details stay in the logs.
                error!(error = %self, "Request failed");
                json!({ "success": false, "message": "Internal server error" })
            }
            _ => json!({ "success": false, "message": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}
