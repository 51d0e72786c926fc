//! Central error types for ktuner.
//!
//! Only [`TunerError`] aborts a tuning run. [`CompileError`] and
//! [`LaunchError`] come back from a [`crate::backend::Backend`] for a single
//! configuration and are turned into skip records by the executor.

use crate::expr::ExprError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunerError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Restriction references undefined parameter `{name}` in `{restriction}`")]
    UndefinedParameter { name: String, restriction: String },

    #[error("Expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("Cache file {path}: {reason}")]
    Cache { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TunerError {
    pub fn config(msg: impl Into<String>) -> Self {
        TunerError::Configuration(msg.into())
    }

    /// True for errors raised while validating the tuning problem, before any
    /// configuration is benchmarked.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            TunerError::Configuration(_)
                | TunerError::UndefinedParameter { .. }
                | TunerError::Expression(_)
        )
    }
}

/// The kernel failed to build for one configuration.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("compilation of `{kernel}` failed: {message}")]
pub struct CompileError {
    pub kernel: String,
    pub message: String,
}

impl CompileError {
    pub fn new(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            message: message.into(),
        }
    }
}

/// The kernel compiled but failed at launch or during execution.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("launch of `{kernel}` failed: {message}")]
pub struct LaunchError {
    pub kernel: String,
    pub message: String,
}

impl LaunchError {
    pub fn new(kernel: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kernel: kernel.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TunerError>;
