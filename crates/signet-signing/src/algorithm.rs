//! Hash algorithms offered for signing

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::error::{Result, SigningError};

/// Hash algorithm used both by the signing tool (`/fd`) and by package signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha1,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// All supported algorithms, weakest first
    pub fn all() -> [HashAlgorithm; 4] {
        [Self::Sha1, Self::Sha256, Self::Sha384, Self::Sha512]
    }

    /// Public name, also the token passed to the signing tool's `/fd` flag
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha384 => "SHA384",
            Self::Sha512 => "SHA512",
        }
    }

    /// XML-signature digest method identifier
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    /// XML-signature identifier of RSA signing with this digest
    pub fn rsa_signature_uri(&self) -> &'static str {
        match self {
            Self::Sha1 => "http://www.w3.org/2000/09/xmldsig#rsa-sha1",
            Self::Sha256 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512",
        }
    }

    /// Resolve a digest method URI back to an algorithm
    pub fn from_uri(uri: &str) -> Result<Self> {
        Self::all()
            .into_iter()
            .find(|alg| alg.uri() == uri)
            .ok_or_else(|| SigningError::UnsupportedAlgorithm(uri.to_string()))
    }

    /// Resolve an RSA signature method URI back to an algorithm
    pub fn from_rsa_signature_uri(uri: &str) -> Result<Self> {
        Self::all()
            .into_iter()
            .find(|alg| alg.rsa_signature_uri() == uri)
            .ok_or_else(|| SigningError::UnsupportedAlgorithm(uri.to_string()))
    }

    /// Hash `data`
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "");
        match normalized.as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Self::from_uri(s.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uri_mapping_is_injective() {
        let uris: HashSet<_> = HashAlgorithm::all().iter().map(|a| a.uri()).collect();
        assert_eq!(uris.len(), 4);

        for alg in HashAlgorithm::all() {
            assert_eq!(HashAlgorithm::from_uri(alg.uri()).unwrap(), alg);
            assert_eq!(
                HashAlgorithm::from_rsa_signature_uri(alg.rsa_signature_uri()).unwrap(),
                alg
            );
        }
    }

    #[test]
    fn test_fixed_uris() {
        assert_eq!(
            HashAlgorithm::Sha1.uri(),
            "http://www.w3.org/2000/09/xmldsig#sha1"
        );
        assert_eq!(
            HashAlgorithm::Sha256.uri(),
            "http://www.w3.org/2001/04/xmlenc#sha256"
        );
        assert_eq!(
            HashAlgorithm::Sha384.uri(),
            "http://www.w3.org/2001/04/xmldsig-more#sha384"
        );
        assert_eq!(
            HashAlgorithm::Sha512.uri(),
            "http://www.w3.org/2001/04/xmlenc#sha512"
        );
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("sha256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("SHA-384".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha384);
        assert_eq!("Sha1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
        assert_eq!(
            "http://www.w3.org/2001/04/xmlenc#sha512"
                .parse::<HashAlgorithm>()
                .unwrap(),
            HashAlgorithm::Sha512
        );
    }

    #[test]
    fn test_parse_unsupported() {
        let err = "md5".parse::<HashAlgorithm>().unwrap_err();
        assert!(matches!(err, SigningError::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(HashAlgorithm::Sha1.digest(b"abc").len(), 20);
        assert_eq!(HashAlgorithm::Sha256.digest(b"abc").len(), 32);
        assert_eq!(HashAlgorithm::Sha384.digest(b"abc").len(), 48);
        assert_eq!(HashAlgorithm::Sha512.digest(b"abc").len(), 64);
    }
}
