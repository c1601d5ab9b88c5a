use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::services::packager::PackageError;
use crate::services::renderer::RenderError;
use crate::services::signer::SigningError;
use crate::services::PassServiceError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Insufficient reward credits: {available} available, {requested} requested")]
    InsufficientBalance { available: i32, requested: i32 },

    #[error("Card not active: {0}")]
    CardNotActive(String),

    #[error("Card state is inconsistent: {0}")]
    InvalidState(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Asset missing: {0}")]
    AssetMissing(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let error_debug = format!("{:?}", self);

        let (status, error_message) = match self {
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::InsufficientBalance {
                available,
                requested,
            } => (
                StatusCode::CONFLICT,
                format!(
                    "Insufficient reward credits: {} available, {} requested",
                    available, requested
                ),
            ),
            AppError::CardNotActive(msg) => (StatusCode::CONFLICT, msg),
            AppError::InvalidState(msg) => {
                tracing::error!(error = %msg, "Card data integrity violation");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Signing(msg) => {
                tracing::error!(error = %msg, "Pass signing failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Pass signing unavailable".to_string(),
                )
            }
            AppError::AssetMissing(name) => {
                tracing::error!(asset = %name, "Required pass asset missing");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Pass assets unavailable".to_string(),
                )
            }
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(json!({
            "error": error_debug,
            "message": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::InsufficientBalance {
                available,
                requested,
            } => AppError::InsufficientBalance {
                available,
                requested,
            },
            err @ StoreError::CardNotActive { .. } => AppError::CardNotActive(err.to_string()),
            err @ (StoreError::InvalidAmount(_) | StoreError::ProgramInactive(_)) => {
                AppError::Validation(err.to_string())
            }
            StoreError::Database(e) => AppError::Database(e),
        }
    }
}

impl From<RenderError> for AppError {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::InvalidState(msg) => AppError::InvalidState(msg),
            RenderError::Serialization(e) => AppError::Internal(e.into()),
        }
    }
}

impl From<SigningError> for AppError {
    fn from(err: SigningError) -> Self {
        AppError::Signing(err.to_string())
    }
}

impl From<PackageError> for AppError {
    fn from(err: PackageError) -> Self {
        match err {
            PackageError::AssetMissing(name) => AppError::AssetMissing(name),
            PackageError::Render(e) => e.into(),
            PackageError::Signing(e) => e.into(),
            other => AppError::Internal(other.into()),
        }
    }
}

impl From<PassServiceError> for AppError {
    fn from(err: PassServiceError) -> Self {
        match err {
            PassServiceError::NotFound(msg) => AppError::NotFound(msg),
            PassServiceError::Unauthorized => AppError::Unauthorized,
            PassServiceError::Validation(msg) => AppError::Validation(msg),
            PassServiceError::Store(e) => e.into(),
            PassServiceError::Render(e) => e.into(),
            PassServiceError::Package(e) => e.into(),
            other => AppError::Internal(other.into()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn status_of(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(StoreError::NotFound("card".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(StoreError::InsufficientBalance {
                available: 0,
                requested: 1
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::CardNotActive {
                card_id: uuid::Uuid::nil(),
                status: "expired".to_string()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(StoreError::InvalidAmount("0".to_string())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(PassServiceError::Unauthorized),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(RenderError::InvalidState("bad".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(PackageError::AssetMissing("icon.png".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
