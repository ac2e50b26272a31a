//! Verify command

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use tracing::info;

use signet_signing::{
    PackageResigner, SignCompletionResult, SignReport, SigningToolAdapter, VerifyResult,
};

use super::Workspace;
use crate::cli::{output, Cli, OutputFormat};
use crate::exit_codes;

/// Verify the signature of a binary or container package
#[derive(Debug, Args)]
pub struct VerifyCommand {
    /// File to verify
    pub target: PathBuf,
}

impl VerifyCommand {
    /// Execute the verify command
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        info!(path = %self.target.display(), "executing verify command");
        let workspace = Workspace::load()?;
        let options = workspace.config.package.to_options();

        if !self.target.is_file() {
            anyhow::bail!("{} does not exist", self.target.display());
        }

        let adapter = Arc::new(SigningToolAdapter::new(workspace.locator()));
        let result = if options.is_container(&self.target) {
            // Envelope verification never needs the signing tool.
            let resigner = PackageResigner::new(adapter, options);
            verify_package(&resigner, &self.target)?
        } else {
            let outcome = adapter.execute_verify(&self.target)?;
            let mut report = SignReport::new();
            outcome.record(&mut report);
            report.finish(outcome.success())
        };

        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            OutputFormat::Text => {
                output::completion(&result, cli.quiet);
                if !cli.quiet {
                    if result.success {
                        output::success(&format!(
                            "{} is signed",
                            output::path_style().apply_to(self.target.display())
                        ));
                    } else {
                        output::warning(&format!("{} is not validly signed", self.target.display()));
                    }
                }
            }
        }

        Ok(exit_codes::for_success(result.success))
    }
}

/// Check a container's signature envelope and describe what was found
fn verify_package(
    resigner: &PackageResigner,
    target: &Path,
) -> anyhow::Result<SignCompletionResult> {
    let (verified, signatures) = resigner.verify_package(target)?;

    let mut report = SignReport::new();
    for signature in &signatures {
        report.output(format!(
            "{} signed by {} [{}] at {}",
            signature.part_name,
            signature.signer.as_deref().unwrap_or("unknown signer"),
            signature.thumbprint.as_deref().unwrap_or("-"),
            signature.signing_time.as_deref().unwrap_or("unknown time"),
        ));
    }
    if verified != VerifyResult::Success {
        report.error(format!("{}: {}", target.display(), verified));
    }
    Ok(report.finish(verified == VerifyResult::Success))
}

#[cfg(test)]
mod tests {
    use super::*;
    use signet_signing::{FixedToolLocator, PackageOptions};
    use std::io::Write;

    fn write_unsigned_vsix(dir: &Path) -> PathBuf {
        let path = dir.join("ext.vsix");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("[Content_Types].xml", options).unwrap();
        zip.write_all(
            br#"<?xml version="1.0" encoding="utf-8"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="text/xml" /></Types>"#,
        )
        .unwrap();
        zip.start_file("extension.vsixmanifest", options).unwrap();
        zip.write_all(b"<PackageManifest />").unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn test_unsigned_package_reports_not_signed() {
        let temp = tempfile::TempDir::new().unwrap();
        let package = write_unsigned_vsix(temp.path());
        let resigner = PackageResigner::new(
            Arc::new(SigningToolAdapter::new(Arc::new(FixedToolLocator::new(
                "/nonexistent/signtool",
            )))),
            PackageOptions::default(),
        );

        let result = verify_package(&resigner, &package).unwrap();
        assert!(!result.success);
        assert!(result.error.contains("no signature present"));
        assert!(result.output.is_empty());
    }
}
