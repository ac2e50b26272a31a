//! Configuration validation

use tracing::debug;

use signet_signing::HashAlgorithm;

use crate::error::{ConfigError, Result};

use super::types::Config;

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_signing(config)?;
    validate_tool(config)?;
    validate_package(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_signing(config: &Config) -> Result<()> {
    if config
        .signing
        .hash_algorithm
        .parse::<HashAlgorithm>()
        .is_err()
    {
        let names: Vec<_> = HashAlgorithm::all()
            .iter()
            .map(|a| a.name().to_lowercase())
            .collect();
        return Err(ConfigError::invalid(
            "signing.hash_algorithm",
            format!("must be one of: {}", names.join(", ")),
        ));
    }

    Ok(())
}

fn validate_tool(config: &Config) -> Result<()> {
    if config
        .tool
        .path
        .as_ref()
        .is_some_and(|p| p.as_os_str().is_empty())
    {
        return Err(ConfigError::invalid("tool.path", "path cannot be empty"));
    }

    Ok(())
}

fn validate_package(config: &Config) -> Result<()> {
    if config.package.extensions.is_empty() {
        return Err(ConfigError::invalid(
            "package.extensions",
            "at least one container extension is required",
        ));
    }

    if config.package.nested_extensions.is_empty() {
        return Err(ConfigError::invalid(
            "package.nested_extensions",
            "at least one nested extension is required",
        ));
    }

    for (field, list) in [
        ("package.extensions", &config.package.extensions),
        ("package.nested_extensions", &config.package.nested_extensions),
    ] {
        if let Some(i) = list.iter().position(|e| e.trim().trim_start_matches('.').is_empty()) {
            return Err(ConfigError::invalid(
                format!("{}[{}]", field, i),
                "extension cannot be empty",
            ));
        }
    }

    let valid_policies = ["skip", "resign"];
    if !valid_policies.contains(&config.package.already_signed.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::invalid(
            "package.already_signed",
            format!("must be one of: {}", valid_policies.join(", ")),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_unknown_hash_algorithm() {
        let mut config = Config::default();
        config.signing.hash_algorithm = "md5".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("signing.hash_algorithm"));
    }

    #[test]
    fn test_hash_algorithm_accepts_dashed_names() {
        let mut config = Config::default();
        config.signing.hash_algorithm = "SHA-512".to_string();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_empty_tool_path() {
        let mut config = Config::default();
        config.tool.path = Some(PathBuf::new());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_empty_extension_lists() {
        let mut config = Config::default();
        config.package.extensions.clear();
        assert!(validate_config(&config).is_err());

        let mut config = Config::default();
        config.package.nested_extensions = vec![".".to_string()];
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("package.nested_extensions[0]"));
    }

    #[test]
    fn test_unknown_policy() {
        let mut config = Config::default();
        config.package.already_signed = "sometimes".to_string();
        assert!(validate_config(&config).is_err());
    }
}
