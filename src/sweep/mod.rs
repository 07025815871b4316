//! Sweep execution.
//!
//! - [`binding`]: resolve variables to resources before launch
//! - [`controller`]: the phase state machine running on its own task
//! - [`control`]: pause/resume/abort and event subscription
//! - [`status`]: snapshots for progress displays
//!
//! # Example
//!
//! ```rust,ignore
//! let space = definition.space()?;
//! let bindings = bind_resources(&space, &registry)?;
//! let handle = SweepController::new(space, bindings, sink, config.controller).spawn();
//!
//! handle.control().pause()?;
//! handle.control().resume()?;
//! let outcome = handle.join().await?;
//! ```

pub mod binding;
pub mod control;
pub mod controller;
pub mod status;

pub use binding::{bind_resources, BindingReport, ResourceBindings};
pub use control::{AbortReason, SweepControl, SweepEvent, SweepOutcome};
pub use controller::{SweepController, SweepHandle};
pub use status::{Phase, SweepStatus};
