// Services module - Pass lifecycle and device protocol logic

pub mod artifact_cache;
pub mod assets;
pub mod ledger;
pub mod loyalty;
pub mod notifier;
pub mod packager;
pub mod pass_builder;
pub mod renderer;
pub mod signer;
pub mod strip;
pub mod tokens;
pub mod update_query;

use crate::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum PassServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] renderer::RenderError),

    #[error(transparent)]
    Package(#[from] packager::PackageError),

    #[error("Asset error: {0}")]
    Asset(#[from] assets::AssetError),

    #[error("Strip generation failed: {0}")]
    Strip(#[from] strip::StripError),

    #[error(transparent)]
    Token(#[from] tokens::TokenGenerationError),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Parses a pass serial number; anything that is not a card ID resolves to no card
pub(crate) fn parse_serial(serial: &str) -> Result<uuid::Uuid, PassServiceError> {
    uuid::Uuid::parse_str(serial)
        .map_err(|_| PassServiceError::NotFound(format!("pass {}", serial)))
}
