//! Custom error types for the sweep library.
//!
//! `SweepError` covers everything that can go wrong outside of a running
//! sweep: loading configuration, validating a sweep definition, binding
//! variables to resources, and preparing or writing the export file.
//!
//! ## Error Hierarchy
//!
//! - **Pre-flight**: `InvalidBindings`, `NoOutputVariables`, `GroupLengthMismatch`,
//!   `EmptyValues`, `NoExportDirectory`, `InvalidExportDirectory`, `ExportFileExists`.
//!   These are raised before a run launches; the run never starts.
//! - **Storage**: `Io` and `Csv` wrap failures while writing the export file.
//! - **Configuration**: `Config`, `Definition` and `Configuration` cover parsing
//!   and semantic validation of the TOML inputs.
//!
//! Device failures during a run are *not* `SweepError`s. They are caught at the
//! controller boundary and reported as an
//! [`AbortReason`](crate::sweep::control::AbortReason) on the run outcome.

use crate::sweep::binding::BindingReport;
use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type SweepResult<T> = std::result::Result<T, SweepError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Sweep definition error: {0}")]
    Definition(#[from] toml::de::Error),

    #[error("No output variables defined")]
    NoOutputVariables,

    #[error("Variable '{0}' has no values to sweep")]
    EmptyValues(String),

    #[error("Output group with order {order} mixes lengths: {details}")]
    GroupLengthMismatch { order: i32, details: String },

    #[error("Resource binding failed: {0}")]
    InvalidBindings(BindingReport),

    #[error("No export directory selected")]
    NoExportDirectory,

    #[error("Invalid export directory: {}", .0.display())]
    InvalidExportDirectory(PathBuf),

    #[error("Export file exists: {}", .0.display())]
    ExportFileExists(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV export error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<figment::Error> for SweepError {
    fn from(value: figment::Error) -> Self {
        SweepError::Config(Box::new(value))
    }
}

impl SweepError {
    /// Whether this error is raised before a run launches.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            SweepError::NoOutputVariables
                | SweepError::EmptyValues(_)
                | SweepError::GroupLengthMismatch { .. }
                | SweepError::InvalidBindings(_)
                | SweepError::NoExportDirectory
                | SweepError::InvalidExportDirectory(_)
                | SweepError::ExportFileExists(_)
        )
    }
}
