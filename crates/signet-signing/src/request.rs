//! Sign requests and the completion report handed back to callers

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::algorithm::HashAlgorithm;
use crate::certificate::CertificateReference;

/// Timestamp server used when nothing else is configured
pub const DEFAULT_TIMESTAMP_SERVER: &str = "http://time.certum.pl";

/// Well-known public timestamp servers, default first
pub fn default_timestamp_servers() -> Vec<String> {
    vec![
        DEFAULT_TIMESTAMP_SERVER.to_string(),
        "http://timestamp.verisign.com/scripts/timstamp.dll".to_string(),
        "http://timestamp.comodoca.com/authenticode".to_string(),
    ]
}

/// Everything needed to sign one target
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub target: PathBuf,
    pub certificate: CertificateReference,
    pub hash_algorithm: HashAlgorithm,
    /// No timestamp is requested when `None`
    pub timestamp_server: Option<String>,
    /// Sign binaries inside a container package before its envelope
    pub sign_nested_content: bool,
}

impl SignRequest {
    pub fn new(target: impl Into<PathBuf>, certificate: CertificateReference) -> Self {
        Self {
            target: target.into(),
            certificate,
            hash_algorithm: HashAlgorithm::default(),
            timestamp_server: None,
            sign_nested_content: false,
        }
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    pub fn with_timestamp_server(mut self, server: impl Into<String>) -> Self {
        self.timestamp_server = Some(server.into());
        self
    }

    pub fn with_nested_content(mut self, enabled: bool) -> Self {
        self.sign_nested_content = enabled;
        self
    }

    /// Same request aimed at another file
    pub fn retarget(&self, target: &Path) -> Self {
        Self {
            target: target.to_path_buf(),
            ..self.clone()
        }
    }
}

/// The single report delivered for each sign request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignCompletionResult {
    pub success: bool,
    /// What happened
    pub output: String,
    /// Why it failed
    pub error: String,
}

impl SignCompletionResult {
    /// Report for a request rejected before anything ran
    pub fn failure(error: impl AsRef<str>) -> Self {
        let mut report = SignReport::new();
        report.error(error);
        report.finish(false)
    }
}

/// Request-scoped accumulator for the output and error narratives.
///
/// The two buffers are never mixed: tool stderr and failure reasons go to
/// the error side only.
#[derive(Debug, Default)]
pub struct SignReport {
    output: String,
    error: String,
}

impl SignReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one line (or block) to the output narrative
    pub fn output(&mut self, text: impl AsRef<str>) {
        push_block(&mut self.output, text.as_ref());
    }

    /// Append one line (or block) to the error narrative
    pub fn error(&mut self, text: impl AsRef<str>) {
        push_block(&mut self.error, text.as_ref());
    }

    pub fn output_text(&self) -> &str {
        &self.output
    }

    pub fn error_text(&self) -> &str {
        &self.error
    }

    pub fn finish(self, success: bool) -> SignCompletionResult {
        SignCompletionResult {
            success,
            output: self.output,
            error: self.error,
        }
    }
}

fn push_block(buffer: &mut String, text: &str) {
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return;
    }
    buffer.push_str(text);
    buffer.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_keeps_narratives_apart() {
        let mut report = SignReport::new();
        report.output("signed a.dll");
        report.error("SignTool Error: boom\n");
        report.output("");
        report.output("signed b.dll\n");

        let result = report.finish(false);
        assert!(!result.success);
        assert_eq!(result.output, "signed a.dll\nsigned b.dll\n");
        assert_eq!(result.error, "SignTool Error: boom\n");
    }

    #[test]
    fn test_default_timestamp_servers() {
        let servers = default_timestamp_servers();
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[0], DEFAULT_TIMESTAMP_SERVER);
    }

    #[test]
    fn test_completion_result_serializes() {
        let json = serde_json::to_value(SignCompletionResult::failure("no")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "no\n");
        assert_eq!(json["output"], "");
    }
}
