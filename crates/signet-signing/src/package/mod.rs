//! Re-signing of zip-based container packages (VSIX)
//!
//! A pass optionally signs the binaries nested in the container through the
//! signing tool, then signs the package envelope itself:
//!
//! `Idle → ContentExtraction → ContentSigning → ContentRepack →
//! PackageVerification → Signed`, with `Failed` reachable from content
//! signing and from package verification.

pub mod archive;
pub mod opc;
pub mod signature;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;
use zip::CompressionMethod;

use crate::certificate::Certificate;
use crate::error::{Result, SigningError};
use crate::request::{SignReport, SignRequest};
use crate::signtool::SigningToolAdapter;

pub use opc::OpcPackage;
pub use signature::{
    parts_to_sign, CertificateEmbedding, PackageDigitalSignatureManager, PackageSignature,
    VerifyResult,
};

/// Extension the container is renamed to while its content is rewritten
const WORKING_ARCHIVE_EXTENSION: &str = "zip";

/// Stage of a re-signing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResignStage {
    Idle,
    ContentExtraction,
    ContentSigning,
    ContentRepack,
    PackageVerification,
    Signed,
    Failed,
}

impl ResignStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Signed | Self::Failed)
    }
}

/// What to do with nested files whose signature already verifies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlreadySignedPolicy {
    /// Leave them untouched
    #[default]
    Skip,
    /// Sign every nested file regardless
    Resign,
}

/// Which files count as containers and as nested binaries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOptions {
    pub container_extensions: Vec<String>,
    pub nested_extensions: Vec<String>,
    pub already_signed: AlreadySignedPolicy,
}

impl Default for PackageOptions {
    fn default() -> Self {
        Self {
            container_extensions: vec!["vsix".to_string()],
            nested_extensions: vec!["dll".to_string(), "exe".to_string()],
            already_signed: AlreadySignedPolicy::Skip,
        }
    }
}

impl PackageOptions {
    /// Whether `path` is a container package, by extension
    pub fn is_container(&self, path: &Path) -> bool {
        has_extension(path, &self.container_extensions)
    }

    fn is_nested_binary(&self, path: &Path) -> bool {
        has_extension(path, &self.nested_extensions)
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// Files touched by a nested-content pass, relative to the container root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestedContentSummary {
    pub signed: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Tracks and logs the stage of one pass
struct StageTracker<'a> {
    package: &'a Path,
    stage: ResignStage,
}

impl<'a> StageTracker<'a> {
    fn new(package: &'a Path) -> Self {
        Self {
            package,
            stage: ResignStage::Idle,
        }
    }

    fn enter(&mut self, stage: ResignStage) {
        debug!(package = %self.package.display(), from = ?self.stage, to = ?stage, "resign stage");
        self.stage = stage;
    }
}

/// Re-signs container packages
pub struct PackageResigner {
    adapter: Arc<SigningToolAdapter>,
    options: PackageOptions,
}

impl PackageResigner {
    pub fn new(adapter: Arc<SigningToolAdapter>, options: PackageOptions) -> Self {
        Self { adapter, options }
    }

    pub fn options(&self) -> &PackageOptions {
        &self.options
    }

    /// Run a full pass over `request.target` and return the terminal stage.
    ///
    /// Nested content is signed first when requested; a failure there skips
    /// the envelope signature.
    #[instrument(skip_all, fields(package = %request.target.display()))]
    pub fn resign(
        &self,
        request: &SignRequest,
        certificate: &Certificate,
        report: &mut SignReport,
    ) -> ResignStage {
        let package = request.target.as_path();
        let mut tracker = StageTracker::new(package);

        if request.sign_nested_content {
            if let Err(e) = self.resign_nested(package, request, report, &mut tracker) {
                warn!(error = %e, "nested content signing failed");
                // Tool failures already carry the tool's own diagnostic.
                if !matches!(e, SigningError::ToolExecution { .. }) {
                    report.error(e.to_string());
                }
                tracker.enter(ResignStage::Failed);
                return tracker.stage;
            }
        }

        tracker.enter(ResignStage::PackageVerification);
        match self.sign_package_envelope(package, request, certificate, report) {
            Ok(()) => tracker.enter(ResignStage::Signed),
            Err(e) => {
                warn!(error = %e, "package envelope signing failed");
                report.error(e.to_string());
                tracker.enter(ResignStage::Failed);
            }
        }
        tracker.stage
    }

    /// Sign every nested binary of `package` that needs it.
    ///
    /// The container is renamed to `.zip`, extracted beside itself, its
    /// binaries are signed one after another and it is re-archived and
    /// renamed back. The first signing failure stops the loop; the archive
    /// is rebuilt and renamed back either way.
    pub fn resign_nested_content(
        &self,
        package: &Path,
        request: &SignRequest,
        report: &mut SignReport,
    ) -> Result<NestedContentSummary> {
        let mut tracker = StageTracker::new(package);
        self.resign_nested(package, request, report, &mut tracker)
    }

    fn resign_nested(
        &self,
        package: &Path,
        request: &SignRequest,
        report: &mut SignReport,
        tracker: &mut StageTracker<'_>,
    ) -> Result<NestedContentSummary> {
        let working_archive = package.with_extension(WORKING_ARCHIVE_EXTENSION);
        if working_archive.exists() && working_archive != package {
            return Err(SigningError::Package {
                path: package.to_path_buf(),
                reason: format!("{} already exists", working_archive.display()),
            });
        }
        let parent = package
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        report.output(format!("Signing nested content of {}", package.display()));
        tracker.enter(ResignStage::ContentExtraction);
        std::fs::rename(package, &working_archive)?;

        let outcome = self.sign_extracted(&working_archive, parent, request, report, tracker);

        if let Err(e) = std::fs::rename(&working_archive, package) {
            warn!(error = %e, "could not restore container name");
            return Err(e.into());
        }

        let summary = outcome?;
        report.output(format!(
            "Signed {} nested file(s), {} already signed",
            summary.signed.len(),
            summary.skipped.len()
        ));
        Ok(summary)
    }

    fn sign_extracted(
        &self,
        archive_path: &Path,
        parent: &Path,
        request: &SignRequest,
        report: &mut SignReport,
        tracker: &mut StageTracker<'_>,
    ) -> Result<NestedContentSummary> {
        let work_dir = tempfile::Builder::new()
            .prefix(".signet-")
            .tempdir_in(parent)?;
        archive::extract(archive_path, work_dir.path())?;

        tracker.enter(ResignStage::ContentSigning);
        let signed = self.sign_files(work_dir.path(), request, report);

        // The container is rebuilt even after a failure so it is never left
        // half-renamed; files signed before the failure keep their signature.
        tracker.enter(ResignStage::ContentRepack);
        archive::pack(work_dir.path(), archive_path, CompressionMethod::Stored)?;

        signed
    }

    fn sign_files(
        &self,
        root: &Path,
        request: &SignRequest,
        report: &mut SignReport,
    ) -> Result<NestedContentSummary> {
        let mut summary = NestedContentSummary::default();

        let candidates: Vec<PathBuf> = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && self.options.is_nested_binary(e.path()))
            .map(|e| e.into_path())
            .collect();

        for file in candidates {
            let relative = file.strip_prefix(root).unwrap_or(&file).to_path_buf();

            if self.options.already_signed == AlreadySignedPolicy::Skip {
                let verified = self.adapter.execute_verify(&file)?;
                if verified.success() {
                    debug!(file = %relative.display(), "already signed");
                    report.output(format!("{} is already signed", relative.display()));
                    summary.skipped.push(relative);
                    continue;
                }
            }

            let outcome = self.adapter.execute_sign(&request.retarget(&file))?;
            outcome.record(report);
            if let Err(e) = outcome.check() {
                report.error(format!("Failed to sign {}", relative.display()));
                return Err(e);
            }
            info!(file = %relative.display(), "signed nested file");
            summary.signed.push(relative);
        }

        Ok(summary)
    }

    /// Sign the package envelope and verify the result from disk
    pub fn sign_package_envelope(
        &self,
        package_path: &Path,
        request: &SignRequest,
        certificate: &Certificate,
        report: &mut SignReport,
    ) -> Result<()> {
        report.output(format!("Signing package {}", package_path.display()));

        let mut package = OpcPackage::open(package_path)?;
        let parts = parts_to_sign(&package);

        let mut manager = PackageDigitalSignatureManager::new(&mut package);
        manager.set_embedding(CertificateEmbedding::InSignaturePart);
        manager.set_hash_algorithm(request.hash_algorithm);
        let signed = manager.sign(&parts, certificate);
        manager.reset_hash_algorithm();
        let signature = signed.map_err(|e| match e {
            SigningError::Certificate(_) | SigningError::CryptographicSigning(_) => e,
            other => SigningError::CryptographicSigning(other.to_string()),
        })?;

        package.save(CompressionMethod::Deflated)?;
        report.output(format!(
            "Signed {} part(s) with {} ({})",
            parts.len(),
            certificate,
            request.hash_algorithm
        ));

        let mut reopened = OpcPackage::open(package_path)?;
        let manager = PackageDigitalSignatureManager::new(&mut reopened);
        if !manager.is_signed() {
            return Err(SigningError::VerificationMismatch {
                path: package_path.to_path_buf(),
                reason: "no signature present".to_string(),
            });
        }
        match manager.verify_signatures() {
            VerifyResult::Success => {
                info!(signature = %signature.part_name, "package signature verified");
                report.output(format!("Package signature verified: {}", package_path.display()));
                Ok(())
            }
            result => Err(SigningError::VerificationMismatch {
                path: package_path.to_path_buf(),
                reason: format!("signature invalid: {}", result),
            }),
        }
    }

    /// Verify the envelope signature of a package on disk
    pub fn verify_package(&self, package_path: &Path) -> Result<(VerifyResult, Vec<PackageSignature>)> {
        let mut package = OpcPackage::open(package_path)?;
        let manager = PackageDigitalSignatureManager::new(&mut package);
        Ok((manager.verify_signatures(), manager.signatures()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::tests::fixture_certificate;
    use crate::certificate::CertificateReference;
    use crate::package::opc::tests::write_sample_package;

    #[test]
    fn test_container_classification() {
        let options = PackageOptions::default();
        assert!(options.is_container(Path::new("ext.vsix")));
        assert!(options.is_container(Path::new("EXT.VSIX")));
        assert!(!options.is_container(Path::new("app.exe")));
        assert!(!options.is_container(Path::new("vsix")));
        assert!(options.is_nested_binary(Path::new("lib/a.DLL")));
    }

    #[test]
    fn test_stage_terminality() {
        assert!(ResignStage::Signed.is_terminal());
        assert!(ResignStage::Failed.is_terminal());
        assert!(!ResignStage::ContentRepack.is_terminal());
    }

    #[cfg(unix)]
    mod with_mock_tool {
        use super::*;
        use crate::mock_tool::MockTool;

        fn request(target: &Path, nested: bool) -> SignRequest {
            SignRequest::new(
                target,
                CertificateReference::File {
                    path: crate::certificate::tests::fixture("test-signing.pfx"),
                    password: Some(crate::certificate::tests::FIXTURE_PASSWORD.to_string()),
                },
            )
            .with_nested_content(nested)
        }

        fn resigner(tool: &MockTool, options: PackageOptions) -> PackageResigner {
            PackageResigner::new(Arc::new(tool.adapter()), options)
        }

        fn read_entry(package: &Path, name: &str) -> Vec<u8> {
            let mut zip = zip::ZipArchive::new(std::fs::File::open(package).unwrap()).unwrap();
            let mut entry = zip.by_name(name).unwrap();
            let mut data = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut data).unwrap();
            data
        }

        #[test]
        fn test_nested_signing_signs_only_unsigned_files() {
            let tool = MockTool::new();
            let package = write_sample_package(
                tool.work_dir(),
                "ext.vsix",
                &[
                    ("lib/helper.dll", b"MZ"),
                    ("lib/signed.dll", b"MZSIGNED"),
                    ("readme.txt", b"hi"),
                ],
            );
            let resigner = resigner(&tool, PackageOptions::default());
            let mut report = SignReport::new();

            let summary = resigner
                .resign_nested_content(&package, &request(&package, true), &mut report)
                .unwrap();

            assert_eq!(summary.signed, vec![PathBuf::from("lib/helper.dll")]);
            assert_eq!(summary.skipped, vec![PathBuf::from("lib/signed.dll")]);
            assert_eq!(tool.sign_calls().len(), 1);
            assert!(package.exists());
            assert!(!package.with_extension("zip").exists());
            assert_eq!(read_entry(&package, "lib/helper.dll"), b"MZSIGNED");
            assert_eq!(read_entry(&package, "readme.txt"), b"hi");

            // A second pass finds nothing left to sign.
            let mut report = SignReport::new();
            let summary = resigner
                .resign_nested_content(&package, &request(&package, true), &mut report)
                .unwrap();
            assert!(summary.signed.is_empty());
            assert_eq!(tool.sign_calls().len(), 1);
        }

        #[test]
        fn test_resign_policy_signs_everything() {
            let tool = MockTool::new();
            let package = write_sample_package(
                tool.work_dir(),
                "ext.vsix",
                &[("lib/a.dll", b"MZ"), ("lib/b.exe", b"MZSIGNED")],
            );
            let options = PackageOptions {
                already_signed: AlreadySignedPolicy::Resign,
                ..Default::default()
            };
            let mut report = SignReport::new();

            let summary = resigner(&tool, options)
                .resign_nested_content(&package, &request(&package, true), &mut report)
                .unwrap();

            assert_eq!(summary.signed.len(), 2);
            assert!(tool.calls().iter().all(|c| !c.starts_with("verify")));
        }

        #[test]
        fn test_first_failure_aborts_and_container_is_restored() {
            let tool = MockTool::new();
            tool.fail_signing();
            let package = write_sample_package(
                tool.work_dir(),
                "ext.vsix",
                &[("lib/a.dll", b"MZ"), ("lib/b.dll", b"MZ")],
            );
            let mut report = SignReport::new();

            let err = resigner(&tool, PackageOptions::default())
                .resign_nested_content(&package, &request(&package, true), &mut report)
                .unwrap_err();

            assert!(matches!(err, SigningError::ToolExecution { .. }));
            assert_eq!(tool.sign_calls().len(), 1);
            assert!(package.exists());
            assert!(!package.with_extension("zip").exists());
            assert!(report.error_text().contains("lib/a.dll"));
            assert!(report.error_text().contains("SignTool Error"));
        }

        #[test]
        fn test_full_pass_with_nested_content() {
            let tool = MockTool::new();
            let package =
                write_sample_package(tool.work_dir(), "ext.vsix", &[("lib/helper.dll", b"MZ")]);
            let mut report = SignReport::new();

            let stage = resigner(&tool, PackageOptions::default()).resign(
                &request(&package, true),
                &fixture_certificate(),
                &mut report,
            );

            assert_eq!(stage, ResignStage::Signed, "{}", report.error_text());
            assert_eq!(tool.sign_calls().len(), 1);
            let (result, signatures) = resigner(&tool, PackageOptions::default())
                .verify_package(&package)
                .unwrap();
            assert_eq!(result, VerifyResult::Success);
            assert_eq!(signatures.len(), 1);
            assert!(report.error_text().is_empty());
        }

        #[test]
        fn test_envelope_only_touches_no_nested_file() {
            let tool = MockTool::new();
            let package =
                write_sample_package(tool.work_dir(), "ext.vsix", &[("lib/helper.dll", b"MZ")]);
            let mut report = SignReport::new();

            let stage = resigner(&tool, PackageOptions::default()).resign(
                &request(&package, false),
                &fixture_certificate(),
                &mut report,
            );

            assert_eq!(stage, ResignStage::Signed);
            assert!(tool.calls().is_empty());
            assert_eq!(read_entry(&package, "lib/helper.dll"), b"MZ");
        }

        #[test]
        fn test_envelope_failure_resets_hash_algorithm_and_fails() {
            let tool = MockTool::new();
            let package = write_sample_package(tool.work_dir(), "ext.vsix", &[]);
            let mut report = SignReport::new();

            let stage = resigner(&tool, PackageOptions::default()).resign(
                &request(&package, false),
                &Certificate::from_thumbprint("AABB"),
                &mut report,
            );

            assert_eq!(stage, ResignStage::Failed);
            assert!(report.error_text().contains("private key"));
            let (result, _) = resigner(&tool, PackageOptions::default())
                .verify_package(&package)
                .unwrap();
            assert_eq!(result, VerifyResult::NotSigned);
        }
    }

    #[test]
    fn test_manager_hash_algorithm_resets() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = write_sample_package(dir.path(), "ext.vsix", &[]);
        let mut package = OpcPackage::open(&path).unwrap();
        let mut manager = PackageDigitalSignatureManager::new(&mut package);

        manager.set_hash_algorithm(crate::algorithm::HashAlgorithm::Sha512);
        assert!(manager
            .sign(&[], &Certificate::from_thumbprint("AA"))
            .is_err());
        manager.reset_hash_algorithm();
        assert_eq!(
            manager.hash_algorithm(),
            PackageDigitalSignatureManager::DEFAULT_HASH_ALGORITHM
        );
    }
}
