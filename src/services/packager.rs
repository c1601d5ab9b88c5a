//! `.pkpass` packaging
//!
//! Archive layout: `pass.json`, the static assets, `manifest.json` (file name to
//! SHA-1 hex digest of every other file) and `signature` (detached PKCS#7 over the
//! manifest bytes).

use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use std::collections::BTreeMap;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::services::assets::AssetBundle;
use crate::services::renderer::{PassDescription, RenderError};
use crate::services::signer::{SigningCredentialStore, SigningError};

pub const REQUIRED_ASSETS: &[&str] = &["icon.png"];

const PASS_JSON: &str = "pass.json";
const MANIFEST_JSON: &str = "manifest.json";
const SIGNATURE: &str = "signature";

#[derive(thiserror::Error, Debug)]
pub enum PackageError {
    #[error("Required asset missing: {0}")]
    AssetMissing(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Signing(#[from] SigningError),

    #[error("JSON serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A signed pass ready to hand to a device
#[derive(Debug, Clone)]
pub struct SignedArtifact {
    pub bytes: Vec<u8>,
    pub serial: String,
    pub update_tag: i64,
    pub manifest: BTreeMap<String, String>,
}

fn sha1_hex(bytes: &[u8]) -> String {
    hex::encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, bytes))
}

/// Builds and signs the pass archive
#[tracing::instrument(
    skip_all,
    fields(serial = %description.serial_number, update_tag = description.pass_version())
)]
pub fn package(
    description: &PassDescription,
    assets: &AssetBundle,
    credentials: &SigningCredentialStore,
) -> Result<SignedArtifact, PackageError> {
    for required in REQUIRED_ASSETS {
        if !assets.contains(required) {
            return Err(PackageError::AssetMissing(required.to_string()));
        }
    }

    let mut files: BTreeMap<&str, Vec<u8>> = assets
        .iter()
        .filter(|(name, _)| ![PASS_JSON, MANIFEST_JSON, SIGNATURE].contains(name))
        .map(|(name, bytes)| (name, bytes.to_vec()))
        .collect();
    files.insert(PASS_JSON, description.to_canonical_bytes()?);

    let manifest: BTreeMap<String, String> = files
        .iter()
        .map(|(name, bytes)| (name.to_string(), sha1_hex(bytes)))
        .collect();
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let signature = credentials.sign_manifest(&manifest_bytes)?;

    files.insert(MANIFEST_JSON, manifest_bytes);
    files.insert(SIGNATURE, signature);

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());
    for (name, bytes) in &files {
        writer.start_file(*name, options)?;
        writer.write_all(bytes)?;
    }
    let bytes = writer.finish()?.into_inner();

    tracing::debug!(size = bytes.len(), files = files.len(), "Packaged pass");

    Ok(SignedArtifact {
        bytes,
        serial: description.serial_number.clone(),
        update_tag: description.pass_version(),
        manifest,
    })
}
