//! Default configuration values

use super::types::Config;

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "signet.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "signet.yaml";

/// Default hash algorithm name
pub const DEFAULT_HASH_ALGORITHM: &str = "sha256";

/// Default handling of nested files that already verify
pub const DEFAULT_ALREADY_SIGNED: &str = "skip";

/// Get list of config file names to search for, in priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".signet.toml",
        ".signet.yaml",
    ]
}

/// Generate default configuration TOML
pub fn default_config_toml() -> String {
    toml::to_string_pretty(&Config::default())
        .unwrap_or_else(|_| DEFAULT_CONFIG_TEMPLATE.to_string())
}

/// Default configuration template
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Signet Configuration

[signing]
hash_algorithm = "sha256"
timestamp_server = "http://time.certum.pl"

[tool]
# path = 'C:\Program Files (x86)\Windows Kits\10\bin\10.0.22621.0\x64\signtool.exe'
sdk_roots = []

[package]
extensions = ["vsix"]
nested_extensions = ["dll", "exe"]
already_signed = "skip"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_to_defaults() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        let defaults = Config::default();
        assert_eq!(config.signing.hash_algorithm, defaults.signing.hash_algorithm);
        assert_eq!(config.signing.timestamp_server, defaults.signing.timestamp_server);
        assert_eq!(config.package.extensions, defaults.package.extensions);
        assert_eq!(config.package.already_signed, defaults.package.already_signed);
    }

    #[test]
    fn test_generated_default_round_trips() {
        let config: Config = toml::from_str(&default_config_toml()).unwrap();
        assert_eq!(
            config.signing.timestamp_servers,
            Config::default().signing.timestamp_servers
        );
    }
}
