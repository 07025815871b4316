//! # Sweep DAQ Core Library
//!
//! This crate drives automated measurement sweeps on laboratory instruments.
//! It iterates over nested output-variable value sequences, writes each
//! combination to instrument channels, waits for the devices to settle, reads
//! back the measured channels and streams the resulting rows to live
//! observers and to a CSV export, while staying pausable and abortable from
//! any other task.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered configuration (`SweepConfig`) loaded with figment from
//!   TOML and the environment.
//! - **`error`**: The `SweepError` enum for pre-flight, storage and configuration errors.
//! - **`tracing_setup`**: `tracing-subscriber` initialization.
//! - **`resource`**: The `Resource` trait for instrument channels, the
//!   `ResourceRegistry`, and simulated resources for tests and demos.
//! - **`variables`**: Output and input variables, grouping and sorting, and the
//!   odometer-style `SweepIterator`.
//! - **`definition`**: TOML sweep definition documents.
//! - **`sweep`**: Resource binding, the `SweepController` state machine, the
//!   control surface and status snapshots.
//! - **`capture`**: The buffered `CapturePipeline`, CSV export and sampling
//!   notifications.

pub mod capture;
pub mod config;
pub mod definition;
pub mod error;
pub mod resource;
pub mod sweep;
pub mod tracing_setup;
pub mod variables;

pub use error::{SweepError, SweepResult};
