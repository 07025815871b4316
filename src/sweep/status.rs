//! Point-in-time status of a sweep run.
//!
//! The run task is the only writer of [`SweepStatus`]; it publishes updates
//! through a `tokio::sync::watch` channel so that any number of pollers can
//! take consistent snapshots without ever touching controller internals.

use super::control::SweepOutcome;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// Controller phase
///
/// ```text
/// init ─▶ next ─▶ transition ─▶ write ─▶ dwell ─▶ read ─┐
///          ▲                                            │
///          └────────────────────────────────────────────┘
///          │ exhausted
///          ▼
///      ramp_down ─▶ end
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Binding check, iterator and pipeline start
    Init,
    /// Fetch the next value tuple
    Next,
    /// Smooth ramp towards the new values
    Transition,
    /// Write the new values
    Write,
    /// Wait for devices to settle
    Dwell,
    /// Take measurements and capture a row
    Read,
    /// Smooth ramp back to resting values
    RampDown,
    /// Close the pipeline and announce completion
    End,
}

impl Phase {
    /// Operator-facing description
    pub fn message(&self) -> &'static str {
        match self {
            Phase::Init => "Initializing",
            Phase::Next => "Getting next values",
            Phase::Transition => "Smooth setting",
            Phase::Write => "Writing to devices",
            Phase::Dwell => "Waiting for devices to settle",
            Phase::Read => "Taking measurements",
            Phase::RampDown => "Smooth setting",
            Phase::End => "Finishing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Next => "next",
            Phase::Transition => "transition",
            Phase::Write => "write",
            Phase::Dwell => "dwell",
            Phase::Read => "read",
            Phase::RampDown => "ramp_down",
            Phase::End => "end",
        };
        f.write_str(name)
    }
}

/// Wall-clock accumulator that stops while the run is paused.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl RunClock {
    /// Start (or restart) accumulating from `now`
    pub fn start(&mut self, now: Instant) {
        if self.running_since.is_none() {
            self.running_since = Some(now);
        }
    }

    /// Stop accumulating at `now`
    pub fn stop(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += now.saturating_duration_since(since);
        }
    }

    /// Total running time up to `now`
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.accumulated
            + self
                .running_since
                .map(|since| now.saturating_duration_since(since))
                .unwrap_or_default()
    }

    /// Whether the clock is accumulating
    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }
}

/// Snapshot of a sweep run
#[derive(Debug, Clone)]
pub struct SweepStatus {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Current phase; `None` before the run task starts
    pub phase: Option<Phase>,
    /// Items completed in the current lap; -1 before the run begins
    pub item: i64,
    /// Items per lap
    pub num_items: usize,
    /// Completed laps (continuous mode)
    pub lap: u64,
    /// Rows handed to the capture pipeline
    pub rows_captured: u64,
    /// Pause requested
    pub paused: bool,
    /// Abort requested or in progress
    pub cancelling: bool,
    /// Continuous mode
    pub continuous: bool,
    /// Wall-clock start
    pub started_at: Option<DateTime<Utc>>,
    /// Completion has been announced
    pub finished: bool,
    /// Final outcome once finished
    pub outcome: Option<SweepOutcome>,
    /// Running-time accumulator
    pub clock: RunClock,
}

impl SweepStatus {
    /// Status of a run that has not started
    pub fn new(run_id: Uuid, num_items: usize, continuous: bool) -> Self {
        Self {
            run_id,
            phase: None,
            item: -1,
            num_items,
            lap: 0,
            rows_captured: 0,
            paused: false,
            cancelling: false,
            continuous,
            started_at: None,
            finished: false,
            outcome: None,
            clock: RunClock::default(),
        }
    }

    /// Operator-facing phase description
    pub fn message(&self) -> &'static str {
        match self.phase {
            None => "Starting up",
            Some(phase) => phase.message(),
        }
    }

    /// Fraction of the current lap completed, once the run has begun
    pub fn fraction_done(&self) -> Option<f64> {
        if self.num_items > 0 && self.item >= 0 {
            Some(self.item as f64 / self.num_items as f64)
        } else {
            None
        }
    }

    /// Running time, excluding pauses
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed(Instant::now())
    }

    /// Running time in microseconds
    pub fn elapsed_micros(&self) -> u128 {
        self.elapsed().as_micros()
    }

    /// Estimated time left; `None` in continuous mode or before the first item
    pub fn remaining(&self) -> Option<Duration> {
        if self.continuous {
            return None;
        }
        let done = self.fraction_done().filter(|f| *f > 0.0)?;
        let elapsed = self.elapsed().as_micros() as f64;
        let total = elapsed / done;
        Some(Duration::from_micros((total - elapsed).max(0.0) as u64))
    }

    /// Serializable view for status surfaces
    pub fn report(&self) -> StatusReport {
        StatusReport {
            run_id: self.run_id,
            phase: self.phase,
            message: self.message(),
            item: self.item,
            num_items: self.num_items,
            lap: self.lap,
            percent: self.fraction_done().map(|f| (f * 100.0) as u32),
            elapsed_us: self.elapsed_micros(),
            remaining_us: self.remaining().map(|d| d.as_micros()),
            rows_captured: self.rows_captured,
            paused: self.paused,
            cancelling: self.cancelling,
            finished: self.finished,
        }
    }
}

/// Serializable status line
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Run identifier
    pub run_id: Uuid,
    /// Current phase
    pub phase: Option<Phase>,
    /// Phase description
    pub message: &'static str,
    /// Items completed in this lap
    pub item: i64,
    /// Items per lap
    pub num_items: usize,
    /// Completed laps
    pub lap: u64,
    /// Whole percent of the lap completed
    pub percent: Option<u32>,
    /// Running time in microseconds
    pub elapsed_us: u128,
    /// Estimated remaining time in microseconds
    pub remaining_us: Option<u128>,
    /// Rows captured so far
    pub rows_captured: u64,
    /// Pause requested
    pub paused: bool,
    /// Abort requested
    pub cancelling: bool,
    /// Completion announced
    pub finished: bool,
}

/// Render a duration as `H:MM:SS`
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let mut status = SweepStatus::new(Uuid::new_v4(), 10, false);
        assert_eq!(status.message(), "Starting up");
        status.phase = Some(Phase::Dwell);
        assert_eq!(status.message(), "Waiting for devices to settle");
        assert_eq!(Phase::RampDown.to_string(), "ramp_down");
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_hms(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_hms(Duration::from_millis(59_999)), "0:00:59");
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_excludes_paused_spans() {
        let mut clock = RunClock::default();
        clock.start(Instant::now());
        tokio::time::advance(Duration::from_secs(3)).await;
        clock.stop(Instant::now());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(clock.elapsed(Instant::now()), Duration::from_secs(3));

        clock.start(Instant::now());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(clock.elapsed(Instant::now()), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_estimate() {
        let mut status = SweepStatus::new(Uuid::new_v4(), 4, false);
        assert!(status.remaining().is_none());

        status.clock.start(Instant::now());
        status.item = 0;
        tokio::time::advance(Duration::from_secs(10)).await;
        // No completed items yet: undefined
        assert!(status.remaining().is_none());

        status.item = 1;
        assert_eq!(status.remaining(), Some(Duration::from_secs(30)));
        assert_eq!(status.report().percent, Some(25));

        status.continuous = true;
        assert!(status.remaining().is_none());
    }
}
