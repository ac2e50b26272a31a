//! Exit codes for the CLI

use signet_core::ConfigError;
use signet_signing::SigningError;

/// Success
pub const SUCCESS: i32 = 0;

/// Signing or verification failed
pub const ERROR: i32 = 1;

/// Configuration error
pub const CONFIG_ERROR: i32 = 2;

/// Exit code for an error that escaped a command
pub fn for_error(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<ConfigError>().is_some() {
        return CONFIG_ERROR;
    }
    match error.downcast_ref::<SigningError>() {
        Some(
            SigningError::Configuration(_)
            | SigningError::UnsupportedAlgorithm(_)
            | SigningError::ToolNotFound { .. },
        ) => CONFIG_ERROR,
        _ => ERROR,
    }
}

/// Exit code for a finished operation
pub fn for_success(success: bool) -> i32 {
    if success {
        SUCCESS
    } else {
        ERROR
    }
}
