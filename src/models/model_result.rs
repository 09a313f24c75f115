use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};

/// Progress value that marks a finished run
pub const PROGRESS_COMPLETE: u8 = 100;

/// Outcome reported by the inference service.
///
/// `error` is empty on success. `result` is only ever present together with
/// an empty error and complete progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelResult {
    progress: u8,
    error: String,
    result: Option<PathBuf>,
}

impl ModelResult {
    pub fn new(progress: u8, error: impl Into<String>, result: Option<PathBuf>) -> Result<Self> {
        let error = error.into();
        if progress > PROGRESS_COMPLETE {
            return Err(GatewayError::invalid_argument(format!(
                "Progress must be 0-100, got {}",
                progress
            )));
        }
        if result.is_some() && (!error.is_empty() || progress != PROGRESS_COMPLETE) {
            return Err(GatewayError::invalid_argument(
                "A result file requires complete progress and no error",
            ));
        }
        Ok(Self { progress, error, result })
    }

    /// Still running
    pub fn in_progress(progress: u8) -> Self {
        Self {
            progress: progress.min(PROGRESS_COMPLETE - 1),
            error: String::new(),
            result: None,
        }
    }

    /// Finished with a result file
    pub fn completed(result: impl Into<PathBuf>) -> Self {
        Self {
            progress: PROGRESS_COMPLETE,
            error: String::new(),
            result: Some(result.into()),
        }
    }

    /// Reported an error
    pub fn failed(progress: u8, error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.is_empty() {
            "unspecified inference error".to_string()
        } else {
            error
        };
        Self {
            progress: progress.min(PROGRESS_COMPLETE),
            error,
            result: None,
        }
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn result(&self) -> Option<&Path> {
        self.result.as_deref()
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Unambiguous success: no error, complete, result present
    pub fn is_complete(&self) -> bool {
        !self.is_error() && self.progress == PROGRESS_COMPLETE && self.result.is_some()
    }
}
