//! Configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use signet_signing::{AlreadySignedPolicy, PackageOptions};

use super::defaults;

/// Main configuration for Signet
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Signing defaults
    pub signing: SigningConfig,

    /// Signing tool location
    pub tool: ToolConfig,

    /// Container package handling
    pub package: PackageConfig,
}

/// Signing defaults applied when the command line does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Hash algorithm name (sha1, sha256, sha384, sha512)
    pub hash_algorithm: String,

    /// Timestamp server URL; empty disables timestamping
    pub timestamp_server: String,

    /// Known timestamp servers offered to callers
    pub timestamp_servers: Vec<String>,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: defaults::DEFAULT_HASH_ALGORITHM.to_string(),
            timestamp_server: signet_signing::DEFAULT_TIMESTAMP_SERVER.to_string(),
            timestamp_servers: signet_signing::default_timestamp_servers(),
        }
    }
}

impl SigningConfig {
    /// Timestamp server, `None` when disabled
    pub fn timestamp_server(&self) -> Option<&str> {
        let server = self.timestamp_server.trim();
        (!server.is_empty()).then_some(server)
    }
}

/// Where to find the signing tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Explicit path; skips the SDK search
    pub path: Option<PathBuf>,

    /// Extra directories searched before the SDK locations
    pub sdk_roots: Vec<PathBuf>,
}

/// Container package handling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Extensions treated as container packages
    pub extensions: Vec<String>,

    /// Extensions of nested binaries to sign
    pub nested_extensions: Vec<String>,

    /// What to do with nested binaries that already verify (skip or resign)
    pub already_signed: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        let options = PackageOptions::default();
        Self {
            extensions: options.container_extensions,
            nested_extensions: options.nested_extensions,
            already_signed: defaults::DEFAULT_ALREADY_SIGNED.to_string(),
        }
    }
}

impl PackageConfig {
    /// Policy for already-signed nested files; unknown values fall back to skip
    pub fn already_signed_policy(&self) -> AlreadySignedPolicy {
        match self.already_signed.to_ascii_lowercase().as_str() {
            "resign" => AlreadySignedPolicy::Resign,
            _ => AlreadySignedPolicy::Skip,
        }
    }

    pub fn to_options(&self) -> PackageOptions {
        PackageOptions {
            container_extensions: normalize_extensions(&self.extensions),
            nested_extensions: normalize_extensions(&self.nested_extensions),
            already_signed: self.already_signed_policy(),
        }
    }
}

fn normalize_extensions(extensions: &[String]) -> Vec<String> {
    extensions
        .iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_package_options() {
        let options = PackageConfig::default().to_options();
        assert_eq!(options, PackageOptions::default());
    }

    #[test]
    fn test_extensions_are_normalized() {
        let config = PackageConfig {
            extensions: vec![".VSIX".to_string(), " nupkg".to_string()],
            nested_extensions: vec!["DLL".to_string()],
            already_signed: "Resign".to_string(),
        };
        let options = config.to_options();
        assert_eq!(options.container_extensions, vec!["vsix", "nupkg"]);
        assert_eq!(options.nested_extensions, vec!["dll"]);
        assert_eq!(options.already_signed, AlreadySignedPolicy::Resign);
    }

    #[test]
    fn test_empty_timestamp_server_disables_timestamping() {
        let mut signing = SigningConfig::default();
        assert_eq!(signing.timestamp_server(), Some("http://time.certum.pl"));
        signing.timestamp_server = "  ".to_string();
        assert_eq!(signing.timestamp_server(), None);
    }
}
