//! Timestamp command

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use signet_signing::{SignReport, SigningError, SigningToolAdapter};

use super::Workspace;
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Add a timestamp to an already signed binary
#[derive(Debug, Args)]
pub struct TimestampCommand {
    /// Signed file to timestamp
    pub target: PathBuf,

    /// Timestamp server URL (defaults to the configured server)
    #[arg(long)]
    pub timestamp: Option<String>,
}

impl TimestampCommand {
    /// Execute the timestamp command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(path = %self.target.display(), "executing timestamp command");
        let workspace = Workspace::load()?;

        let server = self
            .timestamp
            .as_deref()
            .or_else(|| workspace.config.signing.timestamp_server())
            .ok_or_else(|| {
                SigningError::Configuration(
                    "No timestamp server configured; pass --timestamp".to_string(),
                )
            })?;

        if cli.chatty() {
            output::info(&format!(
                "Timestamping {} with {}",
                output::path_style().apply_to(self.target.display()),
                server
            ));
        }

        let adapter = SigningToolAdapter::new(workspace.locator());
        let outcome = adapter.execute_timestamp(&self.target, server)?;
        let mut report = SignReport::new();
        outcome.record(&mut report);
        let result = report.finish(outcome.success());

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Text => {
                output::completion(&result, cli.quiet);
                if result.success && !cli.quiet {
                    output::success(&format!("Timestamped {}", self.target.display()));
                }
            }
        }

        Ok(exit_codes::for_success(result.success))
    }
}
