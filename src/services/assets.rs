use dashmap::DashMap;
use reqwest::Client;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use url::Url;

use crate::models::Merchant;

#[derive(thiserror::Error, Debug)]
pub enum AssetError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Remote asset request failed: {0}")]
    RemoteError(String),

    #[error("Unsupported logo URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to read asset {name}: {source}")]
    Io {
        name: String,
        source: std::io::Error,
    },
}

/// Files packaged next to `pass.json`, keyed by archive name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetBundle {
    files: BTreeMap<String, Vec<u8>>,
}

impl AssetBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.files.insert(name.into(), bytes);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// How long a downloaded merchant logo is reused before refetching
pub const LOGO_CACHE_TTL: Duration = Duration::from_secs(86_400);

/// Static pass artwork from the asset directory plus remote merchant logos
#[derive(Debug)]
pub struct AssetStore {
    assets_dir: PathBuf,
    client: Client,
    logo_ttl: Duration,
    logo_cache: DashMap<String, (Instant, Vec<u8>)>,
}

impl AssetStore {
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            assets_dir: assets_dir.into(),
            client,
            logo_ttl: LOGO_CACHE_TTL,
            logo_cache: DashMap::new(),
        }
    }

    pub fn with_logo_ttl(mut self, ttl: Duration) -> Self {
        self.logo_ttl = ttl;
        self
    }

    fn cached_logo(&self, url: &str) -> Option<Vec<u8>> {
        let fresh = {
            let entry = self.logo_cache.get(url)?;
            let (fetched_at, bytes) = entry.value();
            (fetched_at.elapsed() < self.logo_ttl).then(|| bytes.clone())
        };
        if fresh.is_none() {
            self.logo_cache
                .remove_if(url, |_, (fetched_at, _)| fetched_at.elapsed() >= self.logo_ttl);
        }
        fresh
    }

    /// Reads a file from the asset directory; `None` when absent
    pub async fn local(&self, name: &str) -> Result<Option<Vec<u8>>, AssetError> {
        match tokio::fs::read(self.assets_dir.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(asset = %name, "Asset not found");
                Ok(None)
            }
            Err(source) => Err(AssetError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn fetch_remote(&self, url: &str) -> Result<Vec<u8>, AssetError> {
        let parsed = Url::parse(url).map_err(|_| AssetError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AssetError::InvalidUrl(url.to_string()));
        }

        let response = self.client.get(parsed).send().await?;

        if !response.status().is_success() {
            return Err(AssetError::RemoteError(format!(
                "Status {} for {}",
                response.status(),
                url
            )));
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Merchant logo: remote URL first (cached per URL until the TTL lapses), local `logo.png` otherwise
    #[tracing::instrument(skip(self))]
    pub async fn merchant_logo(&self, logo_url: Option<&str>) -> Result<Option<Vec<u8>>, AssetError> {
        if let Some(url) = logo_url {
            if let Some(cached) = self.cached_logo(url) {
                return Ok(Some(cached));
            }

            match self.fetch_remote(url).await {
                Ok(bytes) => {
                    self.logo_cache
                        .insert(url.to_string(), (Instant::now(), bytes.clone()));
                    return Ok(Some(bytes));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Merchant logo download failed, using default");
                }
            }
        }

        self.local("logo.png").await
    }

    /// Collects the static artwork for a merchant's passes
    pub async fn bundle_for(&self, merchant: &Merchant) -> Result<AssetBundle, AssetError> {
        let mut bundle = AssetBundle::new();

        for name in ["icon.png", "icon@2x.png"] {
            if let Some(bytes) = self.local(name).await? {
                bundle.insert(name, bytes);
            }
        }

        if let Some(logo) = self.merchant_logo(merchant.logo_url.as_deref()).await? {
            bundle.insert("logo@2x.png", logo.clone());
            bundle.insert("logo.png", logo);
        }

        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::merchant::fixtures;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn asset_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("icon.png"), b"icon").unwrap();
        std::fs::write(dir.path().join("logo.png"), b"default-logo").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_bundle_uses_local_assets() {
        let dir = asset_dir();
        let store = AssetStore::new(dir.path());

        let bundle = store.bundle_for(&fixtures::merchant()).await.unwrap();
        let files: Vec<(&str, &[u8])> = bundle.iter().collect();
        assert_eq!(
            files,
            vec![
                ("icon.png", b"icon".as_slice()),
                ("logo.png", b"default-logo".as_slice()),
                ("logo@2x.png", b"default-logo".as_slice()),
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_logo_fetched_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"remote-logo".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = asset_dir();
        let store = AssetStore::new(dir.path());
        let url = format!("{}/logo.png", server.uri());

        for _ in 0..2 {
            let logo = store.merchant_logo(Some(&url)).await.unwrap();
            assert_eq!(logo.as_deref(), Some(b"remote-logo".as_slice()));
        }
    }

    #[tokio::test]
    async fn test_expired_logo_is_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logo.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"remote-logo".to_vec()))
            .expect(2)
            .mount(&server)
            .await;

        let dir = asset_dir();
        let store = AssetStore::new(dir.path()).with_logo_ttl(Duration::ZERO);
        let url = format!("{}/logo.png", server.uri());

        for _ in 0..2 {
            let logo = store.merchant_logo(Some(&url)).await.unwrap();
            assert_eq!(logo.as_deref(), Some(b"remote-logo".as_slice()));
        }
    }

    #[tokio::test]
    async fn test_remote_logo_failure_falls_back() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = asset_dir();
        let store = AssetStore::new(dir.path());
        let url = format!("{}/missing.png", server.uri());

        let logo = store.merchant_logo(Some(&url)).await.unwrap();
        assert_eq!(logo.as_deref(), Some(b"default-logo".as_slice()));
    }

    #[tokio::test]
    async fn test_non_http_logo_url_falls_back() {
        let dir = asset_dir();
        let store = AssetStore::new(dir.path());

        let err = store.fetch_remote("file:///etc/passwd").await.unwrap_err();
        assert!(matches!(err, AssetError::InvalidUrl(_)));

        let logo = store.merchant_logo(Some("not a url")).await.unwrap();
        assert_eq!(logo.as_deref(), Some(b"default-logo".as_slice()));
    }

    #[tokio::test]
    async fn test_missing_local_asset_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssetStore::new(dir.path());
        assert!(store.local("icon.png").await.unwrap().is_none());
    }
}
