//! Control surface shared between the run task and its observers.
//!
//! Three channels connect a running sweep to the outside world:
//!
//! - a `watch` of [`ControlState`]: the pause/abort gate. Control requests
//!   write it; the run task reads it at every phase boundary and blocks on
//!   it while paused.
//! - a `watch` of [`SweepStatus`]: snapshots for pollers.
//! - a `broadcast` of [`SweepEvent`]: written/read values and lifecycle
//!   events for whatever owns presentation.
//!
//! [`SweepControl`] is cheap to clone and safe to use from any task or thread.

use super::status::{Phase, SweepStatus};
use crate::resource::Value;
use anyhow::{bail, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::info;
use uuid::Uuid;

/// The pause/abort gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlState {
    /// Block before the next phase until cleared
    pub paused: bool,
    /// Stop at the next phase boundary
    pub abort_requested: bool,
}

/// Why a run ended early
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    /// Cancelled from the control surface
    UserRequested,
    /// The run could not be prepared
    InitFailed(String),
    /// A resource rejected a write; device state may be inconsistent
    WriteFailed {
        /// Resource name
        resource: String,
        /// Driver error
        message: String,
    },
    /// A resource failed to read; no retry is attempted
    ReadFailed {
        /// Resource name
        resource: String,
        /// Driver error
        message: String,
    },
    /// The capture pipeline could not store a row
    CaptureFailed(String),
}

impl AbortReason {
    /// Fatal aborts skip every remaining device operation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AbortReason::InitFailed(_) | AbortReason::WriteFailed { .. }
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::UserRequested => write!(f, "aborted by user"),
            AbortReason::InitFailed(msg) => write!(f, "initialization failed: {msg}"),
            AbortReason::WriteFailed { resource, message } => {
                write!(f, "error writing to resource {resource}: {message}")
            }
            AbortReason::ReadFailed { resource, message } => {
                write!(f, "error reading from resource {resource}: {message}")
            }
            AbortReason::CaptureFailed(msg) => write!(f, "capture failed: {msg}"),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SweepOutcome {
    /// Every item was captured
    Completed {
        /// Rows captured
        rows: u64,
    },
    /// The run stopped early; captured rows were still flushed
    Aborted {
        /// Rows captured before the abort
        rows: u64,
        /// Cause
        reason: AbortReason,
    },
}

impl SweepOutcome {
    /// Rows captured during the run
    pub fn rows(&self) -> u64 {
        match self {
            SweepOutcome::Completed { rows } | SweepOutcome::Aborted { rows, .. } => *rows,
        }
    }

    /// Whether the run finished without an abort
    pub fn is_completed(&self) -> bool {
        matches!(self, SweepOutcome::Completed { .. })
    }

    /// Abort cause, if any
    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            SweepOutcome::Completed { .. } => None,
            SweepOutcome::Aborted { reason, .. } => Some(reason),
        }
    }
}

/// Events published by the run task
#[derive(Debug, Clone, PartialEq)]
pub enum SweepEvent {
    /// The run task entered `init`
    Started {
        /// Run identifier
        run_id: Uuid,
        /// Items per lap
        num_items: usize,
    },
    /// Phase transition
    PhaseChanged(Phase),
    /// An output value reached its resource
    OutputWritten {
        /// Group position
        group: usize,
        /// Member index within the group
        index: usize,
        /// Value written
        value: Value,
    },
    /// An input value was measured
    InputRead {
        /// Input column index
        index: usize,
        /// Value read
        value: Value,
    },
    /// A row was handed to the capture pipeline
    RowCaptured {
        /// Items completed in this lap, including this one
        item: i64,
        /// Lap number
        lap: u64,
    },
    /// The run task is blocked on the pause gate
    Paused,
    /// The run task passed the pause gate again
    Resumed,
    /// Completion announced
    Finished(SweepOutcome),
}

/// Channels shared by a controller and its control handles
pub(crate) struct Shared {
    pub(crate) control: watch::Sender<ControlState>,
    pub(crate) status: watch::Sender<SweepStatus>,
    pub(crate) events: broadcast::Sender<SweepEvent>,
}

impl Shared {
    pub(crate) fn new(status: SweepStatus, event_capacity: usize) -> Arc<Self> {
        let (control, _) = watch::channel(ControlState::default());
        let (status, _) = watch::channel(status);
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Arc::new(Self {
            control,
            status,
            events,
        })
    }

    pub(crate) fn emit(&self, event: SweepEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Control handle for a sweep: pause, resume, abort, poll.
#[derive(Clone)]
pub struct SweepControl {
    shared: Arc<Shared>,
}

impl SweepControl {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Request a pause at the next phase boundary
    pub fn pause(&self) -> Result<()> {
        let status = self.shared.status.borrow().clone();
        if status.finished {
            bail!("Cannot pause: sweep is finished");
        }
        if status.cancelling {
            bail!("Cannot pause: sweep is aborting");
        }

        // Gate first, so the run task cannot slip past a boundary unseen
        self.shared.control.send_modify(|c| c.paused = true);
        let now = Instant::now();
        self.shared.status.send_modify(|s| {
            s.paused = true;
            s.clock.stop(now);
        });
        info!(run_id = %status.run_id, "Pause requested");
        Ok(())
    }

    /// Clear a pause and wake the run task
    pub fn resume(&self) -> Result<()> {
        if !self.shared.control.borrow().paused {
            bail!("Cannot resume: sweep is not paused");
        }

        self.shared.control.send_modify(|c| c.paused = false);
        let now = Instant::now();
        self.shared.status.send_modify(|s| {
            s.paused = false;
            if s.started_at.is_some() && !s.finished {
                s.clock.start(now);
            }
        });
        info!("Resuming sweep");
        Ok(())
    }

    /// Request a cooperative abort; also releases a pause
    pub fn abort(&self) -> Result<()> {
        if self.shared.status.borrow().finished {
            bail!("Cannot abort: sweep is finished");
        }

        self.shared.control.send_modify(|c| {
            c.abort_requested = true;
            c.paused = false;
        });
        let now = Instant::now();
        self.shared.status.send_modify(|s| {
            s.cancelling = true;
            s.paused = false;
            if s.started_at.is_some() && !s.finished {
                s.clock.start(now);
            }
        });
        info!("Abort requested");
        Ok(())
    }

    /// Point-in-time copy of the run status
    pub fn snapshot(&self) -> SweepStatus {
        self.shared.status.borrow().clone()
    }

    /// Receiver notified on every status change
    pub fn watch_status(&self) -> watch::Receiver<SweepStatus> {
        self.shared.status.subscribe()
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<SweepEvent> {
        self.shared.events.subscribe()
    }

    /// Whether a pause is in effect
    pub fn is_paused(&self) -> bool {
        self.shared.control.borrow().paused
    }

    /// Whether completion has been announced
    pub fn is_finished(&self) -> bool {
        self.shared.status.borrow().finished
    }

    /// Poll snapshots every `period` until the run finishes.
    ///
    /// `on_tick` sees each snapshot, including the final one, which is
    /// also returned.
    pub async fn poll<F>(&self, period: Duration, mut on_tick: F) -> SweepStatus
    where
        F: FnMut(&SweepStatus),
    {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let status = self.snapshot();
            on_tick(&status);
            if status.finished {
                return status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> SweepControl {
        SweepControl::new(Shared::new(SweepStatus::new(Uuid::new_v4(), 3, false), 16))
    }

    #[test]
    fn test_pause_resume_gate() {
        let control = control();
        let gate = control.shared.control.subscribe();

        assert!(control.resume().is_err());
        control.pause().unwrap();
        assert!(gate.borrow().paused);
        assert!(control.snapshot().paused);

        control.resume().unwrap();
        assert!(!gate.borrow().paused);
        assert!(!control.is_paused());
    }

    #[test]
    fn test_abort_releases_pause() {
        let control = control();
        control.pause().unwrap();
        control.abort().unwrap();

        let state = *control.shared.control.borrow();
        assert!(state.abort_requested);
        assert!(!state.paused);
        assert!(control.snapshot().cancelling);
        assert!(control.pause().is_err());
    }

    #[test]
    fn test_requests_rejected_after_finish() {
        let control = control();
        control.shared.status.send_modify(|s| s.finished = true);
        assert!(control.pause().is_err());
        assert!(control.abort().is_err());
    }

    #[test]
    fn test_abort_reason_fatality() {
        assert!(AbortReason::WriteFailed {
            resource: "dac0".into(),
            message: "timeout".into()
        }
        .is_fatal());
        assert!(!AbortReason::ReadFailed {
            resource: "adc0".into(),
            message: "timeout".into()
        }
        .is_fatal());
        assert!(!AbortReason::UserRequested.is_fatal());
        assert_eq!(
            AbortReason::ReadFailed {
                resource: "adc0".into(),
                message: "overload".into()
            }
            .to_string(),
            "error reading from resource adc0: overload"
        );
    }

    #[test]
    fn test_outcome_accessors() {
        let done = SweepOutcome::Completed { rows: 4 };
        assert!(done.is_completed());
        assert_eq!(done.rows(), 4);
        assert!(done.abort_reason().is_none());

        let aborted = SweepOutcome::Aborted {
            rows: 1,
            reason: AbortReason::UserRequested,
        };
        assert_eq!(aborted.abort_reason(), Some(&AbortReason::UserRequested));
    }
}
