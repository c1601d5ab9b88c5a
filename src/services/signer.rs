//! Pass signing credentials
//!
//! The PKCS#12 bundle is read and unlocked for each signing operation and the key is
//! dropped as soon as the signature is produced. Nothing unlocked is kept between
//! calls.

use openssl::asn1::Asn1Time;
use openssl::pkcs12::Pkcs12;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::X509;
use secrecy::{ExposeSecret, Secret};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum SigningError {
    #[error("Signing credential missing: {0}")]
    CredentialMissing(String),

    #[error("Signing credential unreadable: {0}")]
    CredentialUnreadable(String),

    #[error("Signing certificate expired (not after {0})")]
    CertificateExpired(String),

    #[error("Signing key could not be loaded: {0}")]
    KeyUnavailable(String),

    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),
}

/// Where the credential material lives
pub enum CredentialSource {
    Files {
        certificate_path: PathBuf,
        password: Secret<String>,
        wwdr_path: PathBuf,
    },
    Inline {
        pkcs12_der: Secret<Vec<u8>>,
        password: Secret<String>,
        wwdr: Vec<u8>,
    },
}

/// Summary of a credential that loaded successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStatus {
    pub not_after: String,
}

pub struct SigningCredentialStore {
    source: CredentialSource,
}

impl std::fmt::Debug for SigningCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            CredentialSource::Files {
                certificate_path, ..
            } => format!("files({})", certificate_path.display()),
            CredentialSource::Inline { .. } => "inline".to_string(),
        };
        f.debug_struct("SigningCredentialStore")
            .field("source", &source)
            .finish()
    }
}

/// Unlocked credential, alive only for the duration of one signature
struct SigningCredential {
    key: PKey<Private>,
    certificate: X509,
    chain: Stack<X509>,
}

impl SigningCredentialStore {
    pub fn from_files(
        certificate_path: impl Into<PathBuf>,
        password: Secret<String>,
        wwdr_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source: CredentialSource::Files {
                certificate_path: certificate_path.into(),
                password,
                wwdr_path: wwdr_path.into(),
            },
        }
    }

    pub fn from_bytes(pkcs12_der: Vec<u8>, password: Secret<String>, wwdr: Vec<u8>) -> Self {
        Self {
            source: CredentialSource::Inline {
                pkcs12_der: Secret::new(pkcs12_der),
                password,
                wwdr,
            },
        }
    }

    /// Produces a detached DER PKCS#7 signature over the manifest bytes
    #[tracing::instrument(skip_all, fields(manifest_len = manifest.len()))]
    pub fn sign_manifest(&self, manifest: &[u8]) -> Result<Vec<u8>, SigningError> {
        let credential = self.acquire()?;

        let signature = Pkcs7::sign(
            &credential.certificate,
            &credential.key,
            &credential.chain,
            manifest,
            Pkcs7Flags::BINARY | Pkcs7Flags::DETACHED,
        )?
        .to_der()?;

        Ok(signature)
    }

    /// Loads the credential without signing anything (health checks)
    pub fn check(&self) -> Result<CredentialStatus, SigningError> {
        let credential = self.acquire()?;
        Ok(CredentialStatus {
            not_after: credential.certificate.not_after().to_string(),
        })
    }

    fn acquire(&self) -> Result<SigningCredential, SigningError> {
        match &self.source {
            CredentialSource::Files {
                certificate_path,
                password,
                wwdr_path,
            } => {
                let pkcs12 = read_file(certificate_path)?;
                let wwdr = read_file(wwdr_path)?;
                unlock(&Secret::new(pkcs12), password, &wwdr)
            }
            CredentialSource::Inline {
                pkcs12_der,
                password,
                wwdr,
            } => unlock(pkcs12_der, password, wwdr),
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, SigningError> {
    std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SigningError::CredentialMissing(path.display().to_string()),
        _ => SigningError::CredentialUnreadable(format!("{}: {}", path.display(), e)),
    })
}

fn unlock(
    pkcs12_der: &Secret<Vec<u8>>,
    password: &Secret<String>,
    wwdr: &[u8],
) -> Result<SigningCredential, SigningError> {
    let parsed = Pkcs12::from_der(pkcs12_der.expose_secret())
        .map_err(|e| SigningError::CredentialUnreadable(e.to_string()))?
        .parse2(password.expose_secret())
        .map_err(|e| SigningError::KeyUnavailable(e.to_string()))?;

    let key = parsed
        .pkey
        .ok_or_else(|| SigningError::KeyUnavailable("bundle has no private key".to_string()))?;
    let certificate = parsed.cert.ok_or_else(|| {
        SigningError::CredentialUnreadable("bundle has no certificate".to_string())
    })?;

    let now = Asn1Time::days_from_now(0)?;
    if certificate.not_after().compare(&now)? != Ordering::Greater {
        return Err(SigningError::CertificateExpired(
            certificate.not_after().to_string(),
        ));
    }

    let intermediate = X509::from_pem(wwdr)
        .or_else(|_| X509::from_der(wwdr))
        .map_err(|e| SigningError::CredentialUnreadable(format!("WWDR certificate: {}", e)))?;
    let mut chain = Stack::new()?;
    chain.push(intermediate)?;

    Ok(SigningCredential {
        key,
        certificate,
        chain,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use openssl::bn::BigNum;
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;
    use std::sync::OnceLock;

    pub const PASSWORD: &str = "test-password";

    /// Throwaway credential material
    pub struct TestCredential {
        pub pkcs12_der: Vec<u8>,
        pub wwdr_pem: Vec<u8>,
        pub certificate: X509,
    }

    fn self_signed(
        common_name: &str,
        not_before: Asn1Time,
        not_after: Asn1Time,
    ) -> (PKey<Private>, X509) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", common_name).unwrap();
        let name = name.build();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&not_before).unwrap();
        builder.set_not_after(&not_after).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        (key, builder.build())
    }

    fn build(not_before: Asn1Time, not_after: Asn1Time) -> TestCredential {
        let (key, certificate) = self_signed("Pass Type ID: pass.test", not_before, not_after);
        let (_, wwdr) = self_signed(
            "Test WWDR",
            Asn1Time::days_from_now(0).unwrap(),
            Asn1Time::days_from_now(365).unwrap(),
        );

        let pkcs12_der = Pkcs12::builder()
            .name("pass")
            .pkey(&key)
            .cert(&certificate)
            .build2(PASSWORD)
            .unwrap()
            .to_der()
            .unwrap();

        TestCredential {
            pkcs12_der,
            wwdr_pem: wwdr.to_pem().unwrap(),
            certificate,
        }
    }

    pub fn valid() -> &'static TestCredential {
        static VALID: OnceLock<TestCredential> = OnceLock::new();
        VALID.get_or_init(|| {
            build(
                Asn1Time::days_from_now(0).unwrap(),
                Asn1Time::days_from_now(30).unwrap(),
            )
        })
    }

    pub fn expired() -> TestCredential {
        let now = chrono::Utc::now().timestamp();
        build(
            Asn1Time::from_unix(now - 10 * 86_400).unwrap(),
            Asn1Time::from_unix(now - 86_400).unwrap(),
        )
    }

    pub fn store() -> SigningCredentialStore {
        let credential = valid();
        SigningCredentialStore::from_bytes(
            credential.pkcs12_der.clone(),
            Secret::new(PASSWORD.to_string()),
            credential.wwdr_pem.clone(),
        )
    }

    /// Verifies a detached signature over `content` without chain validation
    pub fn verify_detached(signature: &[u8], content: &[u8]) -> bool {
        use openssl::x509::store::X509StoreBuilder;

        let pkcs7 = Pkcs7::from_der(signature).unwrap();
        let certs = Stack::new().unwrap();
        let store = X509StoreBuilder::new().unwrap().build();
        pkcs7
            .verify(
                &certs,
                &store,
                Some(content),
                None,
                Pkcs7Flags::BINARY | Pkcs7Flags::NOVERIFY,
            )
            .is_ok()
    }
}
