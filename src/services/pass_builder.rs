use std::sync::Arc;

use crate::models::PassContext;
use crate::services::artifact_cache::ArtifactCache;
use crate::services::assets::AssetStore;
use crate::services::packager::{self, SignedArtifact};
use crate::services::renderer::{self, parse_hex_color, RenderContext, RenderError};
use crate::services::signer::SigningCredentialStore;
use crate::services::strip;
use crate::services::PassServiceError;

/// Turns a card snapshot into a signed `.pkpass`: render, collect artwork, draw the
/// punch strip, package and sign. Results are cached per card and tag.
#[derive(Debug)]
pub struct PassBuilder {
    context: RenderContext,
    assets: AssetStore,
    credentials: Arc<SigningCredentialStore>,
    cache: ArtifactCache,
}

impl PassBuilder {
    pub fn new(
        context: RenderContext,
        assets: AssetStore,
        credentials: Arc<SigningCredentialStore>,
    ) -> Self {
        Self {
            context,
            assets,
            credentials,
            cache: ArtifactCache::new(),
        }
    }

    pub fn credentials(&self) -> &SigningCredentialStore {
        &self.credentials
    }

    #[tracing::instrument(
        skip_all,
        fields(card_id = %snapshot.card.id, update_tag = snapshot.card.update_tag)
    )]
    pub async fn build(&self, snapshot: &PassContext) -> Result<Arc<SignedArtifact>, PassServiceError> {
        let card = &snapshot.card;
        if let Some(cached) = self.cache.get(card.id, card.update_tag) {
            tracing::debug!("Serving cached pass");
            return Ok(cached);
        }

        let description = renderer::render(snapshot, &self.context)?;

        let mut bundle = self.assets.bundle_for(&snapshot.merchant).await?;
        let merchant = &snapshot.merchant;
        let background = parse_hex_color(&merchant.strip_color).ok_or_else(|| {
            RenderError::InvalidState(format!("invalid strip color {:?}", merchant.strip_color))
        })?;
        let foreground = parse_hex_color(&merchant.foreground_color).ok_or_else(|| {
            RenderError::InvalidState(format!(
                "invalid foreground color {:?}",
                merchant.foreground_color
            ))
        })?;
        let strip_png = strip::render_strip(
            card.current_punches,
            snapshot.program.punches_required,
            background,
            foreground,
        )?;
        bundle.insert("strip@2x.png", strip_png.clone());
        bundle.insert("strip.png", strip_png);

        // Signing is CPU-bound
        let credentials = self.credentials.clone();
        let artifact = tokio::task::spawn_blocking(move || {
            packager::package(&description, &bundle, &credentials)
        })
        .await??;

        let artifact = Arc::new(artifact);
        self.cache.insert(card.id, artifact.clone());
        tracing::info!(size = artifact.bytes.len(), "Built pass");

        Ok(artifact)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::services::renderer::fixtures as render_fixtures;
    use crate::services::signer::fixtures as signer_fixtures;

    /// Builder over a temporary asset directory holding `icon.png` and `logo.png`
    pub fn builder() -> (PassBuilder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("icon.png"), b"icon").unwrap();
        std::fs::write(dir.path().join("logo.png"), b"logo").unwrap();

        let builder = PassBuilder::new(
            render_fixtures::context(),
            AssetStore::new(dir.path()),
            Arc::new(signer_fixtures::store()),
        );
        (builder, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::renderer::fixtures as render_fixtures;

    #[tokio::test]
    async fn test_build_packages_strip_and_caches() {
        let (builder, _dir) = fixtures::builder();
        let snapshot = render_fixtures::snapshot(5);

        let first = builder.build(&snapshot).await.unwrap();
        assert_eq!(first.update_tag, snapshot.card.update_tag);
        assert!(first.manifest.contains_key("strip.png"));
        assert!(first.manifest.contains_key("strip@2x.png"));
        assert!(first.manifest.contains_key("logo.png"));

        let second = builder.build(&snapshot).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let mut bumped = snapshot.clone();
        bumped.card.update_tag += 1;
        let third = builder.build(&bumped).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.update_tag, bumped.card.update_tag);
    }

    #[tokio::test]
    async fn test_missing_icon_surfaces_package_error() {
        let dir = tempfile::tempdir().unwrap();
        let builder = PassBuilder::new(
            render_fixtures::context(),
            AssetStore::new(dir.path()),
            Arc::new(crate::services::signer::fixtures::store()),
        );

        let err = builder
            .build(&render_fixtures::snapshot(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PassServiceError::Package(packager::PackageError::AssetMissing(_))
        ));
    }
}
