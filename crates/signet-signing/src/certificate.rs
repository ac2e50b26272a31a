//! Certificates, certificate stores and certificate resolution

use std::path::{Path, PathBuf};

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, instrument};
use x509_cert::der::{Decode, Encode};

use crate::error::{Result, SigningError};

/// Logical certificate store name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreName {
    /// Personal certificates ("My")
    Personal,
    Root,
    /// Third-party trusted roots ("AuthRoot")
    TrustedRoot,
    AddressBook,
    /// Intermediate certification authorities ("CA")
    IntermediateCa,
    TrustedPeople,
    TrustedPublisher,
}

impl StoreName {
    pub fn all() -> [StoreName; 7] {
        [
            Self::Personal,
            Self::Root,
            Self::TrustedRoot,
            Self::AddressBook,
            Self::IntermediateCa,
            Self::TrustedPeople,
            Self::TrustedPublisher,
        ]
    }

    /// Store name as understood by the signing tool's `/s` flag
    pub fn tool_name(&self) -> &'static str {
        match self {
            Self::Personal => "My",
            Self::Root => "Root",
            Self::TrustedRoot => "AuthRoot",
            Self::AddressBook => "AddressBook",
            Self::IntermediateCa => "CA",
            Self::TrustedPeople => "TrustedPeople",
            Self::TrustedPublisher => "TrustedPublisher",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tool_name())
    }
}

impl std::str::FromStr for StoreName {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "my" | "personal" => Ok(Self::Personal),
            "root" => Ok(Self::Root),
            "authroot" | "trusted_root" | "trustedroot" => Ok(Self::TrustedRoot),
            "addressbook" | "address_book" => Ok(Self::AddressBook),
            "ca" | "intermediate_ca" | "intermediateca" => Ok(Self::IntermediateCa),
            "trustedpeople" | "trusted_people" => Ok(Self::TrustedPeople),
            "trustedpublisher" | "trusted_publisher" => Ok(Self::TrustedPublisher),
            _ => Err(SigningError::Configuration(format!(
                "Unknown certificate store: {}",
                s
            ))),
        }
    }
}

/// Where a store lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreLocation {
    #[default]
    CurrentUser,
    LocalMachine,
}

/// An installed certificate store: name × location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedCertificateStore {
    name: StoreName,
    location: StoreLocation,
}

impl NamedCertificateStore {
    pub fn new(name: StoreName, location: StoreLocation) -> Self {
        Self { name, location }
    }

    /// Store in the current user's location
    pub fn current_user(name: StoreName) -> Self {
        Self::new(name, StoreLocation::CurrentUser)
    }

    /// Every store, current-user ones first
    pub fn all() -> Vec<NamedCertificateStore> {
        [StoreLocation::CurrentUser, StoreLocation::LocalMachine]
            .into_iter()
            .flat_map(|location| {
                StoreName::all()
                    .into_iter()
                    .map(move |name| Self::new(name, location))
            })
            .collect()
    }

    pub fn name(&self) -> StoreName {
        self.name
    }

    pub fn location(&self) -> StoreLocation {
        self.location
    }

    pub fn is_machine(&self) -> bool {
        self.location == StoreLocation::LocalMachine
    }
}

impl Default for NamedCertificateStore {
    fn default() -> Self {
        Self::current_user(StoreName::Personal)
    }
}

impl std::fmt::Display for NamedCertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.location {
            StoreLocation::CurrentUser => write!(f, "{}", self.name),
            StoreLocation::LocalMachine => write!(f, "{} (machine)", self.name),
        }
    }
}

/// A certificate handle.
///
/// Handles from an installed store may carry only a thumbprint; handles
/// loaded from a PKCS#12 file carry the DER certificate and private key.
#[derive(Clone)]
pub struct Certificate {
    thumbprint: String,
    subject: Option<String>,
    der: Option<Vec<u8>>,
    private_key: Option<RsaPrivateKey>,
}

impl Certificate {
    /// Handle known only by thumbprint
    pub fn from_thumbprint(thumbprint: impl Into<String>) -> Self {
        Self {
            thumbprint: normalize_thumbprint(&thumbprint.into()),
            subject: None,
            der: None,
            private_key: None,
        }
    }

    /// Handle for a DER-encoded X.509 certificate without its key
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let parsed = x509_cert::Certificate::from_der(der)
            .map_err(|e| SigningError::Certificate(format!("Invalid certificate: {}", e)))?;

        Ok(Self {
            thumbprint: thumbprint_of(der),
            subject: Some(parsed.tbs_certificate.subject.to_string()),
            der: Some(der.to_vec()),
            private_key: None,
        })
    }

    /// Attach the private key belonging to this certificate
    pub fn with_private_key(mut self, key: RsaPrivateKey) -> Self {
        self.private_key = Some(key);
        self
    }

    /// Uppercase hex SHA-1 of the DER certificate
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn der(&self) -> Option<&[u8]> {
        self.der.as_deref()
    }

    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private_key.as_ref()
    }

    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// RSA public key of the embedded certificate
    pub fn public_key(&self) -> Result<RsaPublicKey> {
        let der = self.der.as_deref().ok_or_else(|| {
            SigningError::Certificate(format!(
                "Certificate {} has no certificate data",
                self.thumbprint
            ))
        })?;
        rsa_public_key(der)
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("thumbprint", &self.thumbprint)
            .field("subject", &self.subject)
            .field("has_der", &self.der.is_some())
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

impl std::fmt::Display for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.subject {
            Some(subject) => write!(f, "{} [{}]", subject, self.thumbprint),
            None => f.write_str(&self.thumbprint),
        }
    }
}

/// Where the signing certificate comes from
#[derive(Debug, Clone)]
pub enum CertificateReference {
    /// A certificate already selected from an installed store
    Installed {
        certificate: Certificate,
        store: NamedCertificateStore,
    },
    /// A PKCS#12 (PFX) file and its password
    File {
        path: PathBuf,
        password: Option<String>,
    },
}

impl CertificateReference {
    /// Resolve to exactly one usable certificate.
    ///
    /// Failure is terminal for the request.
    #[instrument(skip(self))]
    pub fn resolve(&self) -> Result<Certificate> {
        match self {
            Self::Installed { certificate, store } => {
                if certificate.thumbprint().is_empty() {
                    return Err(SigningError::Certificate(format!(
                        "Certificate selected from store {} has no thumbprint",
                        store
                    )));
                }
                Ok(certificate.clone())
            }
            Self::File { path, password } => {
                load_pfx(path, password.as_deref().unwrap_or_default())
            }
        }
    }
}

/// Load the certificate and private key from a PKCS#12 file.
///
/// The file must hold exactly one private key; the certificate whose
/// public key matches it is returned.
pub fn load_pfx(path: &Path, password: &str) -> Result<Certificate> {
    debug!(path = %path.display(), "loading PKCS#12 certificate");

    let bytes = std::fs::read(path).map_err(|e| {
        SigningError::Certificate(format!("Cannot read {}: {}", path.display(), e))
    })?;

    let pfx = p12::PFX::parse(&bytes).map_err(|e| {
        SigningError::Certificate(format!(
            "{} is not a PKCS#12 file: {}",
            path.display(),
            e
        ))
    })?;

    if !pfx.verify_mac(password) {
        return Err(SigningError::Certificate(format!(
            "The password for {} is incorrect",
            path.display()
        )));
    }

    let keys = pfx
        .key_bags(password)
        .map_err(|e| SigningError::Certificate(format!("Cannot decrypt private key: {}", e)))?;
    let key_der = match keys.as_slice() {
        [key] => key,
        [] => {
            return Err(SigningError::Certificate(format!(
                "{} contains no private key",
                path.display()
            )))
        }
        _ => {
            return Err(SigningError::Certificate(format!(
                "{} contains {} private keys, expected one",
                path.display(),
                keys.len()
            )))
        }
    };
    let private_key = RsaPrivateKey::from_pkcs8_der(key_der).map_err(|e| {
        SigningError::Certificate(format!("Unsupported private key (RSA required): {}", e))
    })?;
    let public_key = private_key.to_public_key();

    let certificates = pfx
        .cert_x509_bags(password)
        .map_err(|e| SigningError::Certificate(format!("Cannot decrypt certificates: {}", e)))?;

    let der = certificates
        .iter()
        .find(|der| rsa_public_key(der).is_ok_and(|candidate| candidate == public_key))
        .ok_or_else(|| {
            SigningError::Certificate(format!(
                "{} has no certificate matching its private key",
                path.display()
            ))
        })?;

    let certificate = Certificate::from_der(der)?.with_private_key(private_key);
    info!(certificate = %certificate, "loaded signing certificate");
    Ok(certificate)
}

fn rsa_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    let parsed = x509_cert::Certificate::from_der(der)
        .map_err(|e| SigningError::Certificate(format!("Invalid certificate: {}", e)))?;
    let spki = parsed
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| SigningError::Certificate(format!("Invalid public key: {}", e)))?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| SigningError::Certificate(format!("Not an RSA certificate: {}", e)))
}

fn thumbprint_of(der: &[u8]) -> String {
    Sha1::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const FIXTURE_PASSWORD: &str = "signet-test";
    pub(crate) const FIXTURE_THUMBPRINT: &str = "00F7E52EC86240CC592E753E884ADAB0ADD65776";

    pub(crate) fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
    }

    pub(crate) fn fixture_certificate() -> Certificate {
        load_pfx(&fixture("test-signing.pfx"), FIXTURE_PASSWORD).unwrap()
    }

    #[test]
    fn test_store_catalogue() {
        let stores = NamedCertificateStore::all();
        assert_eq!(stores.len(), 14);
        assert_eq!(stores[0].to_string(), "My");
        assert_eq!(stores[7].to_string(), "My (machine)");
        assert!(stores[7].is_machine());
        assert_eq!(
            NamedCertificateStore::current_user(StoreName::IntermediateCa).to_string(),
            "CA"
        );
    }

    #[test]
    fn test_store_name_parsing() {
        assert_eq!("my".parse::<StoreName>().unwrap(), StoreName::Personal);
        assert_eq!("AuthRoot".parse::<StoreName>().unwrap(), StoreName::TrustedRoot);
        assert!("nowhere".parse::<StoreName>().is_err());
    }

    #[test]
    fn test_load_pfx() {
        let certificate = fixture_certificate();
        assert_eq!(certificate.thumbprint(), FIXTURE_THUMBPRINT);
        assert!(certificate.has_private_key());
        assert!(certificate.subject().unwrap().contains("Signet Test Publisher"));
        assert_eq!(
            certificate.public_key().unwrap(),
            certificate.private_key().unwrap().to_public_key()
        );
    }

    #[test]
    fn test_load_pfx_wrong_password() {
        let err = load_pfx(&fixture("test-signing.pfx"), "wrong").unwrap_err();
        assert!(matches!(err, SigningError::Certificate(ref m) if m.contains("password")));
    }

    #[test]
    fn test_load_pfx_missing_file() {
        let err = load_pfx(&fixture("does-not-exist.pfx"), "").unwrap_err();
        assert!(matches!(err, SigningError::Certificate(_)));
    }

    #[test]
    fn test_load_pfx_without_key() {
        let err = load_pfx(&fixture("cert-only.pfx"), FIXTURE_PASSWORD).unwrap_err();
        assert!(matches!(err, SigningError::Certificate(ref m) if m.contains("no private key")));
    }

    #[test]
    fn test_load_pfx_not_pkcs12() {
        let err = load_pfx(&fixture("test-signing.cer"), "").unwrap_err();
        assert!(matches!(err, SigningError::Certificate(_)));
    }

    #[test]
    fn test_from_der() {
        let der = std::fs::read(fixture("test-signing.cer")).unwrap();
        let certificate = Certificate::from_der(&der).unwrap();
        assert_eq!(certificate.thumbprint(), FIXTURE_THUMBPRINT);
        assert!(!certificate.has_private_key());
    }

    #[test]
    fn test_thumbprint_normalization() {
        let certificate = Certificate::from_thumbprint("aa:bb cc");
        assert_eq!(certificate.thumbprint(), "AABBCC");
        assert!(certificate.public_key().is_err());
    }

    #[test]
    fn test_resolve_installed_requires_thumbprint() {
        let reference = CertificateReference::Installed {
            certificate: Certificate::from_thumbprint(""),
            store: NamedCertificateStore::default(),
        };
        assert!(matches!(
            reference.resolve().unwrap_err(),
            SigningError::Certificate(_)
        ));
    }

    #[test]
    fn test_resolve_file() {
        let reference = CertificateReference::File {
            path: fixture("test-signing.pfx"),
            password: Some(FIXTURE_PASSWORD.to_string()),
        };
        assert_eq!(reference.resolve().unwrap().thumbprint(), FIXTURE_THUMBPRINT);
    }
}
