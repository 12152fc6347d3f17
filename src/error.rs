//! Custom error types for the initial-access pipeline.
//!
//! This module defines the primary error type, `IaError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! classify what can go wrong, from configuration problems found at startup to
//! malformed messages dropped at runtime.
//!
//! ## Error Hierarchy
//!
//! - **Configuration** (`Config`, `InvalidConfig`, `ConfigNotFound`,
//!   `ConfigParse`, `MissingKey`): fatal at construction, never recovered.
//! - **`Validation`**: a single command or message was rejected (beam index
//!   out of range, negative threshold, missing payload key). The offending
//!   message is dropped; the component keeps running.
//! - **Resources** (`Resource`, `Io`, `Csv`): a log file could not be opened
//!   (fatal at construction) or written (fatal for the owning task).
//! - **Lifecycle** (`TaskJoin`, `ShutdownFailed`): reported by `stop()`.
//!
//! A sweep that collects no qualifying samples is *not* an error; it is the
//! `Failed` variant of [`crate::core::SelectionOutcome`].

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type IaResult<T> = std::result::Result<T, IaError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum IaError {
    /// Settings could not be extracted from the file or environment.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings or a layout document are well-formed but unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A configuration document does not exist or cannot be read.
    #[error("Configuration file not found: {}", path.display())]
    ConfigNotFound {
        /// Document that was requested.
        path: PathBuf,
        /// Underlying read error.
        #[source]
        source: std::io::Error,
    },

    /// A configuration document is not valid JSON or TOML.
    #[error("Configuration file {} could not be parsed: {reason}", path.display())]
    ConfigParse {
        /// Document that failed to parse.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A required key is absent from a layout document.
    #[error("Configuration is missing required key '{0}'")]
    MissingKey(String),

    /// A single command or message was rejected.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A log file could not be created.
    #[error("Cannot open log file {}: {source}", path.display())]
    Resource {
        /// File or directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// I/O failure outside log creation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A CSV log row could not be written or flushed.
    #[error("CSV log error: {0}")]
    Csv(#[from] csv::Error),

    /// A component task panicked or was cancelled.
    #[error("Component task failed: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    /// One or more components failed while stopping.
    #[error("Shutdown failed with errors: {0:?}")]
    ShutdownFailed(Vec<IaError>),
}

impl From<figment::Error> for IaError {
    fn from(err: figment::Error) -> Self {
        IaError::Config(Box::new(err))
    }
}

impl IaError {
    /// True for errors that only invalidate a single message or command.
    pub fn is_validation(&self) -> bool {
        matches!(self, IaError::Validation(_))
    }
}
