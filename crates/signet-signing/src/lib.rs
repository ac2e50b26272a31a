//! Signet Signing - code signing through an external signing tool
//!
//! This crate provides:
//! - A process runner that captures tool output without pipe deadlocks
//! - An adapter for the signtool command-line grammar
//! - Certificate resolution from PKCS#12 files or installed-store thumbprints
//! - Re-signing of VSIX container packages, nested binaries included
//! - A single orchestrating entry point that reports one completion result

pub mod algorithm;
pub mod certificate;
pub mod error;
pub mod locator;
pub mod orchestrator;
pub mod package;
pub mod request;
pub mod runner;
pub mod signtool;

#[cfg(all(test, unix))]
mod mock_tool;

pub use algorithm::HashAlgorithm;
pub use certificate::{
    load_pfx, Certificate, CertificateReference, NamedCertificateStore, StoreLocation, StoreName,
};
pub use error::{Result, SigningError};
pub use locator::{FixedToolLocator, SdkToolLocator, ToolLocator};
pub use orchestrator::SignOrchestrator;
pub use package::{
    AlreadySignedPolicy, NestedContentSummary, PackageOptions, PackageResigner, ResignStage,
    VerifyResult,
};
pub use request::{
    default_timestamp_servers, SignCompletionResult, SignReport, SignRequest,
    DEFAULT_TIMESTAMP_SERVER,
};
pub use runner::{LineSink, ProcessInvocation, ProcessResult, ProcessRunner, Stream, TracingSink};
pub use signtool::{SigningToolAdapter, ToolOutcome};
