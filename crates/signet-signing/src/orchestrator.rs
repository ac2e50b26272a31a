//! Single entry point for signing one target
//!
//! Decides between direct binary signing and container re-signing, runs the
//! steps in order and folds everything into one [`SignCompletionResult`].

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, instrument, warn};

use crate::certificate::Certificate;
use crate::error::{Result, SigningError};
use crate::locator::ToolLocator;
use crate::package::{PackageOptions, PackageResigner, ResignStage};
use crate::request::{SignCompletionResult, SignReport, SignRequest};
use crate::signtool::SigningToolAdapter;

/// Coordinates certificate resolution, the signing tool and package re-signing
pub struct SignOrchestrator {
    adapter: Arc<SigningToolAdapter>,
    resigner: PackageResigner,
}

impl SignOrchestrator {
    pub fn new(locator: Arc<dyn ToolLocator>, options: PackageOptions) -> Self {
        Self::with_adapter(Arc::new(SigningToolAdapter::new(locator)), options)
    }

    pub fn with_adapter(adapter: Arc<SigningToolAdapter>, options: PackageOptions) -> Self {
        Self {
            resigner: PackageResigner::new(Arc::clone(&adapter), options),
            adapter,
        }
    }

    pub fn adapter(&self) -> &SigningToolAdapter {
        &self.adapter
    }

    pub fn resigner(&self) -> &PackageResigner {
        &self.resigner
    }

    /// Sign on a worker thread; `on_complete` runs exactly once on that thread
    pub fn sign<F>(self: &Arc<Self>, request: SignRequest, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(SignCompletionResult) + Send + 'static,
    {
        let orchestrator = Arc::clone(self);
        std::thread::spawn(move || {
            let result = orchestrator.sign_blocking(&request);
            on_complete(result);
        })
    }

    /// Sign and block until the single report is ready
    #[instrument(skip_all, fields(target = %request.target.display()))]
    pub fn sign_blocking(&self, request: &SignRequest) -> SignCompletionResult {
        let mut report = SignReport::new();
        match self.run(request, &mut report) {
            Ok(success) => {
                if success {
                    info!("signing finished");
                }
                report.finish(success)
            }
            // Raised before anything was recorded.
            Err(e) if e.is_preflight() => {
                warn!(error = %e, "request rejected before signing");
                SignCompletionResult::failure(e.to_string())
            }
            Err(e) => {
                error!(error = %e, "signing failed");
                report.error(e.to_string());
                report.finish(false)
            }
        }
    }

    fn run(&self, request: &SignRequest, report: &mut SignReport) -> Result<bool> {
        if request.target.as_os_str().is_empty() {
            return Err(SigningError::Configuration("No target file given".to_string()));
        }
        if !request.target.is_file() {
            return Err(SigningError::Configuration(format!(
                "Invalid target: {} does not exist",
                request.target.display()
            )));
        }

        let certificate = request.certificate.resolve()?;

        if self.resigner.options().is_container(&request.target) {
            self.sign_container(request, &certificate, report)
        } else {
            self.sign_binary(request, report)
        }
    }

    fn sign_binary(&self, request: &SignRequest, report: &mut SignReport) -> Result<bool> {
        let outcome = self.adapter.execute_sign(request)?;
        outcome.record(report);
        if outcome.success() {
            report.output(format!("Signed {}", request.target.display()));
        }
        Ok(outcome.success())
    }

    fn sign_container(
        &self,
        request: &SignRequest,
        certificate: &Certificate,
        report: &mut SignReport,
    ) -> Result<bool> {
        // Envelope signing needs the key; find out before any nested file
        // is touched.
        if !certificate.has_private_key() {
            return Err(SigningError::Certificate(format!(
                "Certificate {} has no private key available to sign the package",
                certificate.thumbprint()
            )));
        }
        if request.sign_nested_content {
            self.adapter.locate_executable()?;
        }

        let stage = self.resigner.resign(request, certificate, report);
        Ok(stage == ResignStage::Signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::{fixture, FIXTURE_PASSWORD};
    use crate::certificate::{CertificateReference, NamedCertificateStore};
    use crate::locator::FixedToolLocator;
    use std::path::Path;

    fn pfx_request(target: &Path) -> SignRequest {
        SignRequest::new(
            target,
            CertificateReference::File {
                path: fixture("test-signing.pfx"),
                password: Some(FIXTURE_PASSWORD.to_string()),
            },
        )
    }

    #[test]
    fn test_missing_target() {
        let orchestrator =
            SignOrchestrator::new(Arc::new(FixedToolLocator::new("/nonexistent")), Default::default());
        let result = orchestrator.sign_blocking(&pfx_request(Path::new("/nonexistent/app.exe")));
        assert!(!result.success);
        assert!(result.error.contains("Invalid target"));
        assert_eq!(
            result,
            SignCompletionResult::failure(
                "Configuration error: Invalid target: /nonexistent/app.exe does not exist"
            )
        );
    }

    #[test]
    fn test_async_sign_reports_once() {
        let orchestrator = Arc::new(SignOrchestrator::new(
            Arc::new(FixedToolLocator::new("/nonexistent")),
            Default::default(),
        ));
        let (tx, rx) = std::sync::mpsc::channel();
        let caller = std::thread::current().id();

        orchestrator
            .sign(pfx_request(Path::new("")), move |result| {
                tx.send((std::thread::current().id(), result)).unwrap();
            })
            .join()
            .unwrap();

        let (thread, result) = rx.recv().unwrap();
        assert_ne!(thread, caller);
        assert!(!result.success);
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    mod with_mock_tool {
        use super::*;
        use crate::mock_tool::MockTool;
        use crate::package::opc::tests::write_sample_package;
        use crate::package::VerifyResult;

        fn orchestrator(tool: &MockTool) -> SignOrchestrator {
            SignOrchestrator::new(tool.locator(), PackageOptions::default())
        }

        #[test]
        fn test_binary_with_thumbprint() {
            let tool = MockTool::new();
            let target = tool.file("app.exe", b"MZ");
            let request = SignRequest::new(
                &target,
                CertificateReference::Installed {
                    certificate: Certificate::from_thumbprint("AABBCC"),
                    store: NamedCertificateStore::default(),
                },
            )
            .with_timestamp_server("http://ts.example");

            let result = orchestrator(&tool).sign_blocking(&request);

            assert!(result.success, "{}", result.error);
            assert_eq!(
                tool.calls(),
                vec![format!(
                    "sign /fd SHA256 /sha1 AABBCC /s My /a /t http://ts.example {}",
                    target.display()
                )]
            );
            assert!(result.output.starts_with('"'));
            assert!(result.output.contains("Successfully signed"));
        }

        #[test]
        fn test_binary_failure_reports_stderr() {
            let tool = MockTool::new();
            tool.fail_signing();
            let target = tool.file("app.exe", b"MZ");

            let result = orchestrator(&tool).sign_blocking(&pfx_request(&target));

            assert!(!result.success);
            assert!(result.error.contains("SignTool Error"));
            assert!(!result.output.contains("SignTool Error"));
            assert!(!result.output.contains(FIXTURE_PASSWORD));
        }

        #[test]
        fn test_missing_pfx_launches_nothing() {
            let tool = MockTool::new();
            let target = tool.file("app.exe", b"MZ");
            let request = SignRequest::new(
                &target,
                CertificateReference::File {
                    path: tool.work_dir().join("missing.pfx"),
                    password: None,
                },
            );

            let result = orchestrator(&tool).sign_blocking(&request);

            assert!(!result.success);
            assert!(result.error.contains("Certificate error"));
            assert!(tool.calls().is_empty());
        }

        #[test]
        fn test_wrong_password_launches_nothing() {
            let tool = MockTool::new();
            let target = tool.file("app.exe", b"MZ");
            let request = SignRequest::new(
                &target,
                CertificateReference::File {
                    path: fixture("test-signing.pfx"),
                    password: Some("nope".to_string()),
                },
            );

            let result = orchestrator(&tool).sign_blocking(&request);
            assert!(!result.success);
            assert!(tool.calls().is_empty());
        }

        #[test]
        fn test_vsix_with_nested_content() {
            let tool = MockTool::new();
            let package =
                write_sample_package(tool.work_dir(), "ext.vsix", &[("lib/helper.dll", b"MZ")]);
            let orchestrator = orchestrator(&tool);

            let result =
                orchestrator.sign_blocking(&pfx_request(&package).with_nested_content(true));

            assert!(result.success, "{}", result.error);
            assert_eq!(tool.sign_calls().len(), 1);
            assert!(tool.sign_calls()[0].ends_with("helper.dll"));
            let (verified, _) = orchestrator.resigner().verify_package(&package).unwrap();
            assert_eq!(verified, VerifyResult::Success);

            // Nothing nested is left to sign on a second run.
            let result =
                orchestrator.sign_blocking(&pfx_request(&package).with_nested_content(true));
            assert!(result.success, "{}", result.error);
            assert_eq!(tool.sign_calls().len(), 1);
        }

        #[test]
        fn test_vsix_nested_failure_skips_envelope() {
            let tool = MockTool::new();
            tool.fail_signing();
            let package =
                write_sample_package(tool.work_dir(), "ext.vsix", &[("lib/helper.dll", b"MZ")]);
            let orchestrator = orchestrator(&tool);

            let result =
                orchestrator.sign_blocking(&pfx_request(&package).with_nested_content(true));

            assert!(!result.success);
            let (verified, _) = orchestrator.resigner().verify_package(&package).unwrap();
            assert_eq!(verified, VerifyResult::NotSigned);
        }

        #[test]
        fn test_vsix_with_thumbprint_only_certificate_fails_early() {
            let tool = MockTool::new();
            let package =
                write_sample_package(tool.work_dir(), "ext.vsix", &[("lib/helper.dll", b"MZ")]);
            let request = SignRequest::new(
                &package,
                CertificateReference::Installed {
                    certificate: Certificate::from_thumbprint("AABBCC"),
                    store: NamedCertificateStore::default(),
                },
            )
            .with_nested_content(true);

            let result = orchestrator(&tool).sign_blocking(&request);

            assert!(!result.success);
            assert!(result.error.contains("private key"));
            assert!(tool.calls().is_empty());
        }
    }
}
