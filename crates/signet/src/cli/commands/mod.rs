//! CLI commands

mod list;
mod sign;
mod timestamp;
mod verify;

pub use list::ListCommand;
pub use sign::SignCommand;
pub use timestamp::TimestampCommand;
pub use verify::VerifyCommand;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use signet_core::{config::load_config_or_default, Config};
use signet_signing::{FixedToolLocator, SdkToolLocator, ToolLocator};

/// Configuration for the current directory plus where it came from
pub(crate) struct Workspace {
    pub config: Config,
    pub config_path: Option<PathBuf>,
}

impl Workspace {
    pub fn load() -> anyhow::Result<Self> {
        let cwd = std::env::current_dir()?;
        let (config, config_path) = load_config_or_default(&cwd)?;
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Relative paths in the config file are relative to the file itself
    fn resolve(&self, path: &Path) -> PathBuf {
        match self.config_path.as_deref().and_then(Path::parent) {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Locator for the signing tool: the configured path, else the SDK search
    pub fn locator(&self) -> Arc<dyn ToolLocator> {
        match &self.config.tool.path {
            Some(path) => {
                let path = self.resolve(path);
                debug!(path = %path.display(), "using configured signing tool");
                Arc::new(FixedToolLocator::new(path))
            }
            None => {
                let roots = self
                    .config
                    .tool
                    .sdk_roots
                    .iter()
                    .map(|root| self.resolve(root))
                    .collect();
                Arc::new(SdkToolLocator::new().with_extra_roots(roots))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_tool_path_follows_config_file() {
        let mut config = Config::default();
        config.tool.path = Some(PathBuf::from("tools/signtool.exe"));
        let workspace = Workspace {
            config,
            config_path: Some(PathBuf::from("/work/project/signet.toml")),
        };
        assert_eq!(
            workspace.resolve(Path::new("tools/signtool.exe")),
            PathBuf::from("/work/project/tools/signtool.exe")
        );
        assert_eq!(
            workspace.resolve(Path::new("/opt/signtool")),
            PathBuf::from("/opt/signtool")
        );
    }

    #[test]
    fn test_without_config_file_paths_are_unchanged() {
        let workspace = Workspace {
            config: Config::default(),
            config_path: None,
        };
        assert_eq!(
            workspace.resolve(Path::new("bin/signtool.exe")),
            PathBuf::from("bin/signtool.exe")
        );
    }
}
