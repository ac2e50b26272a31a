//! Adapter for the external signing tool (signtool)
//!
//! Builds the tool's command-line grammar from a [`SignRequest`], runs it
//! through a fresh [`ProcessRunner`] per call and classifies the outcome.
//! Exit code zero is success; on failure the tool's standard error is the
//! diagnostic and is passed through unmodified.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::certificate::CertificateReference;
use crate::error::{Result, SigningError};
use crate::locator::ToolLocator;
use crate::request::{SignReport, SignRequest};
use crate::runner::{LineSink, ProcessInvocation, ProcessResult, ProcessRunner, TracingSink};

const MASKED_PASSWORD: &str = "********";

/// Build the `sign` argument string for `request.target`.
///
/// Thumbprint form:
/// `sign /fd <alg> /sha1 "<thumbprint>" /s <store>[ /sm] /a /t "<ts>" "<target>"`
///
/// File form:
/// `sign /fd <alg> /f "<pfx>" /p "<password>" /t "<ts>" "<target>"`
///
/// `/t` is left out when the request has no timestamp server. Values are
/// wrapped in double quotes and otherwise passed verbatim.
pub fn build_sign_arguments(request: &SignRequest) -> String {
    sign_arguments(request, false)
}

/// Build the `verify` argument string for one file
pub fn build_verify_arguments(path: &Path) -> String {
    format!("verify /pa \"{}\"", path.display())
}

/// Build the `timestamp` argument string for an already-signed file
pub fn build_timestamp_arguments(path: &Path, timestamp_server: &str) -> String {
    format!("timestamp /t \"{}\" \"{}\"", timestamp_server, path.display())
}

fn sign_arguments(request: &SignRequest, mask_password: bool) -> String {
    let mut args = format!("sign /fd {}", request.hash_algorithm.name());

    match &request.certificate {
        CertificateReference::Installed { certificate, store } => {
            args.push_str(&format!(
                " /sha1 \"{}\" /s {}",
                certificate.thumbprint(),
                store.name().tool_name()
            ));
            if store.is_machine() {
                args.push_str(" /sm");
            }
            args.push_str(" /a");
        }
        CertificateReference::File { path, password } => {
            let password = match (password.as_deref(), mask_password) {
                (Some(p), true) if !p.is_empty() => MASKED_PASSWORD,
                (Some(p), _) => p,
                (None, _) => "",
            };
            args.push_str(&format!(
                " /f \"{}\" /p \"{}\"",
                path.display(),
                password
            ));
        }
    }

    if let Some(server) = &request.timestamp_server {
        args.push_str(&format!(" /t \"{}\"", server));
    }

    args.push_str(&format!(" \"{}\"", request.target.display()));
    args
}

/// One finished tool invocation
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    command_line: String,
    result: ProcessResult,
}

impl ToolOutcome {
    /// Executed command line, password masked
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn result(&self) -> &ProcessResult {
        &self.result
    }

    pub fn success(&self) -> bool {
        self.result.success()
    }

    /// Turn a non-zero exit into [`SigningError::ToolExecution`]
    pub fn check(&self) -> Result<()> {
        if self.success() {
            Ok(())
        } else {
            Err(SigningError::ToolExecution {
                exit_code: self.result.exit_code(),
                stderr: self.result.error().trim_end().to_string(),
            })
        }
    }

    /// Echo the command and its output into `report`; failures also add
    /// the tool's standard error to the error narrative.
    pub fn record(&self, report: &mut SignReport) {
        report.output(&self.command_line);
        report.output(self.result.output());
        if !self.success() {
            if self.result.error().trim().is_empty() {
                report.error(format!(
                    "Signing tool exited with code {}",
                    self.result.exit_code()
                ));
            } else {
                report.error(self.result.error());
            }
        }
    }
}

/// Runs the signing tool
pub struct SigningToolAdapter {
    locator: Arc<dyn ToolLocator>,
    sink: Arc<dyn LineSink>,
}

impl SigningToolAdapter {
    pub fn new(locator: Arc<dyn ToolLocator>) -> Self {
        Self::with_sink(locator, Arc::new(TracingSink))
    }

    pub fn with_sink(locator: Arc<dyn ToolLocator>, sink: Arc<dyn LineSink>) -> Self {
        Self { locator, sink }
    }

    /// Resolve the tool executable
    pub fn locate_executable(&self) -> Result<PathBuf> {
        self.locator.locate()
    }

    /// Sign `request.target` with the requested certificate
    #[instrument(skip(self, request), fields(target = %request.target.display()))]
    pub fn execute_sign(&self, request: &SignRequest) -> Result<ToolOutcome> {
        require_target(&request.target)?;
        if let CertificateReference::Installed { certificate, .. } = &request.certificate {
            if certificate.thumbprint().is_empty() {
                return Err(SigningError::Configuration(
                    "Certificate thumbprint is empty".to_string(),
                ));
            }
        }

        let outcome = self.run(build_sign_arguments(request), sign_arguments(request, true))?;
        if outcome.success() {
            info!("signed {}", request.target.display());
        } else {
            warn!(exit_code = outcome.result.exit_code(), "signing tool reported failure");
        }
        Ok(outcome)
    }

    /// Check the Authenticode signature of one file
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn execute_verify(&self, path: &Path) -> Result<ToolOutcome> {
        require_target(path)?;
        let arguments = build_verify_arguments(path);
        let outcome = self.run(arguments.clone(), arguments)?;
        debug!(verified = outcome.success(), "verification finished");
        Ok(outcome)
    }

    /// Add a timestamp to an already-signed file
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn execute_timestamp(&self, path: &Path, timestamp_server: &str) -> Result<ToolOutcome> {
        require_target(path)?;
        if timestamp_server.trim().is_empty() {
            return Err(SigningError::Configuration(
                "A timestamp server is required".to_string(),
            ));
        }
        let arguments = build_timestamp_arguments(path, timestamp_server);
        let outcome = self.run(arguments.clone(), arguments)?;
        if outcome.success() {
            info!("timestamped {}", path.display());
        }
        Ok(outcome)
    }

    fn run(&self, arguments: String, display_arguments: String) -> Result<ToolOutcome> {
        let program = self.locator.locate()?;
        let command_line = format!("\"{}\" {}", program.display(), display_arguments);
        debug!(command = %command_line, "running signing tool");

        let runner = ProcessRunner::with_sink(
            ProcessInvocation::new(program).with_arguments(arguments),
            Arc::clone(&self.sink),
        );
        let result = runner.execute_blocking()?;

        Ok(ToolOutcome {
            command_line,
            result,
        })
    }
}

fn require_target(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(SigningError::Configuration(
            "No target file given".to_string(),
        ));
    }
    Ok(())
}
