//! Error types for signing operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for signing operations
pub type Result<T> = std::result::Result<T, SigningError>;

/// Signing-related errors
#[derive(Debug, Error)]
pub enum SigningError {
    /// Invocation parameters are missing or unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The signing tool could not be found in any known location
    #[error("Signing tool not found: {tool}. {hint}")]
    ToolNotFound { tool: String, hint: String },

    /// The operating system refused to start the process
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An invocation is already in flight on this runner
    #[error("The process is already running")]
    AlreadyRunning,

    /// Certificate could not be loaded or is unusable
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// The package signature could not be produced
    #[error("Cryptographic signing failed: {0}")]
    CryptographicSigning(String),

    /// The signing tool ran and reported failure
    #[error("Signing tool failed with exit code {exit_code}: {stderr}")]
    ToolExecution { exit_code: i32, stderr: String },

    /// The package was signed but does not verify afterwards
    #[error("Signature verification failed for {path}: {reason}")]
    VerificationMismatch { path: PathBuf, reason: String },

    /// Hash algorithm name or URI is not one of the supported set
    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Malformed container package
    #[error("Invalid package {path}: {reason}")]
    Package { path: PathBuf, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Zip archive error
    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// XML read error
    #[error("XML error: {0}")]
    Xml(#[from] xml::reader::Error),

    /// XML write error
    #[error("XML write error: {0}")]
    XmlWrite(#[from] xml::writer::Error),
}

impl SigningError {
    /// Whether this error was raised before anything was executed or written.
    ///
    /// Such errors never leave partial state behind.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_)
                | Self::ToolNotFound { .. }
                | Self::Certificate(_)
                | Self::UnsupportedAlgorithm(_)
        )
    }
}
