//! Sweep controller: the phase state machine.
//!
//! A controller owns one run. It is driven on a dedicated tokio task and
//! steps through the phases below, checking the pause/abort gate at every
//! phase boundary:
//!
//! ```text
//! init ─▶ next ─▶ transition ─▶ write ─▶ dwell ─▶ read ─┐
//!          ▲                                            │
//!          └────────────────────────────────────────────┘
//!          │ exhausted                (continuous: reset, next lap)
//!          ▼
//!      ramp_down ─▶ end
//! ```
//!
//! Failures never escape the run task:
//! - a failed write is a fatal abort; the run goes straight to `end` with no
//!   further device operations
//! - a failed read is a non-fatal abort; same path, no retry
//! - a failed smooth ramp is only a warning; the plain write still happens
//! - an abort request is honored at the next phase boundary and also skips
//!   `ramp_down`; one that arrives after the last item of a finite run only
//!   skips `ramp_down` and the run still completes
//!
//! `end` runs exactly once. It closes the capture sink, then waits until
//! `min_display` has passed since the run began before announcing completion.

use super::binding::{OutputBinding, ResourceBindings};
use super::control::{AbortReason, ControlState, Shared, SweepControl, SweepEvent, SweepOutcome};
use super::status::{Phase, SweepStatus};
use crate::capture::{DataRow, RowSink};
use crate::config::ControllerConfig;
use crate::resource::Value;
use crate::variables::{smooth_path, SweepIterator, VariableSpace};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Iteration state carried through the phases of one run
#[derive(Debug)]
struct IterationState {
    iterator: SweepIterator,
    /// Groups changed by the last `next`, ascending
    changed: Vec<usize>,
    /// Target values per group for the current item
    current: Vec<Vec<Value>>,
    /// Values last written per group; `None` until the first write
    written: Option<Vec<Vec<Value>>>,
    /// Items completed in this lap
    item: i64,
    lap: u64,
}

impl IterationState {
    fn new(space: &VariableSpace) -> Self {
        Self {
            iterator: space.iter(),
            changed: Vec::new(),
            current: (0..space.groups().len())
                .map(|pos| space.group_values(pos, 0))
                .collect(),
            written: None,
            item: -1,
            lap: 0,
        }
    }

    fn load(&mut self, space: &VariableSpace, changed: Vec<usize>) {
        let positions = self.iterator.positions();
        for &pos in &changed {
            self.current[pos] = space.group_values(pos, positions[pos]);
        }
        self.changed = changed;
    }
}

/// Drives one sweep run.
pub struct SweepController {
    space: VariableSpace,
    bindings: ResourceBindings,
    sink: Arc<dyn RowSink>,
    settings: ControllerConfig,
    shared: Arc<Shared>,
    control_rx: watch::Receiver<ControlState>,
    run_id: Uuid,
    started_at: Option<Instant>,
    ended: bool,
    abort: Option<AbortReason>,
    rows: u64,
}

impl SweepController {
    /// Controller for one run over `space`.
    ///
    /// `bindings` must come from [`bind_resources`](super::bind_resources)
    /// for the same space; a mismatch aborts the run during `init`.
    pub fn new(
        space: VariableSpace,
        bindings: ResourceBindings,
        sink: Arc<dyn RowSink>,
        settings: ControllerConfig,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let status = SweepStatus::new(run_id, space.num_items(), settings.continuous);
        let shared = Shared::new(status, settings.event_capacity);
        let control_rx = shared.control.subscribe();
        Self {
            space,
            bindings,
            sink,
            settings,
            shared,
            control_rx,
            run_id,
            started_at: None,
            ended: false,
            abort: None,
            rows: 0,
        }
    }

    /// Handle for pausing, resuming, aborting and polling this run
    pub fn control(&self) -> SweepControl {
        SweepControl::new(self.shared.clone())
    }

    /// Run identifier
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Launch the run on its own task
    pub fn spawn(self) -> SweepHandle {
        let control = self.control();
        let task = tokio::spawn(self.run());
        SweepHandle { control, task }
    }

    /// Execute the run to completion on the current task
    #[instrument(skip_all, fields(run_id = %self.run_id))]
    pub async fn run(mut self) -> SweepOutcome {
        info!(
            num_items = self.space.num_items(),
            continuous = self.settings.continuous,
            "Sweep starting"
        );

        let mut iteration = IterationState::new(&self.space);
        let mut phase = Phase::Init;
        loop {
            if phase == Phase::End {
                break;
            }
            // An abort requested before `init` still starts (and ends) the run
            if self.gate().await && phase != Phase::Init {
                // Every item was captured; only the ramp down is skipped
                let lap_done = phase == Phase::RampDown
                    || (phase == Phase::Next
                        && !self.settings.continuous
                        && iteration.item >= self.space.num_items() as i64);
                if lap_done && self.abort.is_none() {
                    info!("Abort after final item, skipping ramp down");
                    break;
                }
                if self.abort.is_none() {
                    info!(%phase, "Abort observed at phase boundary");
                    self.abort = Some(AbortReason::UserRequested);
                }
                break;
            }

            self.enter(phase);
            phase = match phase {
                Phase::Init => self.init(&mut iteration).await,
                Phase::Next => self.next(&mut iteration),
                Phase::Transition => self.transition(&iteration).await,
                Phase::Write => self.write(&mut iteration).await,
                Phase::Dwell => self.dwell(&iteration).await,
                Phase::Read => self.read(&mut iteration).await,
                Phase::RampDown => self.ramp_down(&iteration).await,
                Phase::End => Phase::End,
            };
        }

        let rows = self.rows;
        self.end().await.unwrap_or_else(|| SweepOutcome::Aborted {
            rows,
            reason: AbortReason::InitFailed("sweep never started".to_string()),
        })
    }

    /// Finish the run: close the sink and announce completion.
    ///
    /// Runs once. Later calls, and calls on a controller that never started,
    /// return `None` and do nothing.
    pub async fn end(&mut self) -> Option<SweepOutcome> {
        let Some(started_at) = self.started_at else {
            debug!("end() ignored: sweep never started");
            return None;
        };
        if self.ended {
            debug!("end() ignored: sweep already ended");
            return None;
        }
        self.ended = true;
        self.enter(Phase::End);

        if let Err(e) = self.sink.on_close().await {
            error!("Failed to close capture: {e}");
            if self.abort.is_none() {
                self.abort = Some(AbortReason::CaptureFailed(e.to_string()));
            }
        }

        let outcome = match self.abort.take() {
            None => SweepOutcome::Completed { rows: self.rows },
            Some(reason) => SweepOutcome::Aborted {
                rows: self.rows,
                reason,
            },
        };

        let shown = started_at.elapsed();
        if shown < self.settings.min_display {
            sleep(self.settings.min_display - shown).await;
        }

        let now = Instant::now();
        self.shared.status.send_modify(|s| {
            s.finished = true;
            s.paused = false;
            s.outcome = Some(outcome.clone());
            s.clock.stop(now);
        });
        self.shared.emit(SweepEvent::Finished(outcome.clone()));
        match &outcome {
            SweepOutcome::Completed { rows } => info!(rows, "Sweep completed"),
            SweepOutcome::Aborted { rows, reason } if reason.is_fatal() => {
                error!(rows, %reason, "Sweep aborted")
            }
            SweepOutcome::Aborted { rows, reason } => warn!(rows, %reason, "Sweep aborted"),
        }
        Some(outcome)
    }

    /// Block while paused. Returns whether an abort is pending.
    async fn gate(&mut self) -> bool {
        let state = *self.control_rx.borrow_and_update();
        if state.abort_requested {
            return true;
        }
        if !state.paused {
            return false;
        }

        info!("Sweep paused");
        self.shared.emit(SweepEvent::Paused);
        let state = match self
            .control_rx
            .wait_for(|c| !c.paused || c.abort_requested)
            .await
        {
            Ok(state) => *state,
            // Sender lives in `shared`; treat a closed gate as an abort
            Err(_) => ControlState {
                paused: false,
                abort_requested: true,
            },
        };
        info!("Sweep resumed");
        self.shared.emit(SweepEvent::Resumed);
        state.abort_requested
    }

    fn enter(&self, phase: Phase) {
        debug!(%phase, "{}", phase.message());
        self.shared.status.send_modify(|s| s.phase = Some(phase));
        self.shared.emit(SweepEvent::PhaseChanged(phase));
    }

    fn fail(&mut self, reason: AbortReason) -> Phase {
        if reason.is_fatal() {
            error!(%reason, "Fatal abort: no further device operations");
        } else {
            warn!(%reason, "Aborting sweep");
        }
        self.abort.get_or_insert(reason);
        Phase::End
    }

    async fn init(&mut self, iteration: &mut IterationState) -> Phase {
        let now = Instant::now();
        self.started_at = Some(now);
        iteration.item = 0;
        self.shared.status.send_modify(|s| {
            s.item = 0;
            s.started_at = Some(Utc::now());
            if !s.paused {
                s.clock.start(now);
            }
        });
        self.shared.emit(SweepEvent::Started {
            run_id: self.run_id,
            num_items: self.space.num_items(),
        });

        if !self.bindings.matches(&self.space) {
            return self.fail(AbortReason::InitFailed(
                "resource bindings do not match the variable space".to_string(),
            ));
        }
        if let Err(e) = self.sink.on_start().await {
            return self.fail(AbortReason::InitFailed(e.to_string()));
        }
        Phase::Next
    }

    fn next(&mut self, iteration: &mut IterationState) -> Phase {
        match iteration.iterator.advance() {
            Some(changed) => {
                iteration.load(&self.space, changed);
                debug!(positions = ?iteration.iterator.positions(), "Next item");
                Phase::Transition
            }
            None if self.settings.continuous => {
                iteration.iterator.reset();
                iteration.item = 0;
                iteration.lap += 1;
                let lap = iteration.lap;
                self.shared.status.send_modify(|s| {
                    s.item = 0;
                    s.lap = lap;
                });
                info!(lap, "Lap complete, restarting");
                Phase::Next
            }
            None => Phase::RampDown,
        }
    }

    async fn transition(&self, iteration: &IterationState) -> Phase {
        for &pos in &iteration.changed {
            let group = &self.space.groups()[pos];
            for (index, var) in group.iter().enumerate() {
                let from = match &iteration.written {
                    Some(written) if var.variable.smooth_transition => written[pos][index].as_f64(),
                    None if var.variable.smooth_from => Some(var.variable.const_value),
                    _ => None,
                };
                let (Some(from), Some(to)) = (from, iteration.current[pos][index].as_f64()) else {
                    continue;
                };

                let binding = &self.bindings.outputs[pos][index];
                if let Err(e) = ramp(binding, from, to, var.variable.smooth_steps).await {
                    warn!(resource = binding.name(), "Smooth transition failed: {e:#}");
                    return Phase::Write;
                }
            }
        }
        Phase::Write
    }

    async fn write(&mut self, iteration: &mut IterationState) -> Phase {
        let changed = iteration.changed.clone();
        for pos in changed {
            for (index, value) in iteration.current[pos].clone().into_iter().enumerate() {
                let binding = &self.bindings.outputs[pos][index];
                if let Err(e) = binding.write(value.clone()).await {
                    let resource = binding.name().to_string();
                    return self.fail(AbortReason::WriteFailed {
                        resource,
                        message: format!("{e:#}"),
                    });
                }
                self.shared.emit(SweepEvent::OutputWritten {
                    group: pos,
                    index,
                    value,
                });
            }
        }
        iteration.written = Some(iteration.current.clone());
        Phase::Dwell
    }

    async fn dwell(&self, iteration: &IterationState) -> Phase {
        let wait = iteration
            .changed
            .iter()
            .flat_map(|&pos| self.space.groups()[pos].iter().map(|v| v.variable.wait))
            .max()
            .unwrap_or_default();
        let wait = if wait.is_zero() {
            self.settings.default_dwell
        } else {
            wait
        };
        if !wait.is_zero() {
            sleep(wait).await;
        }
        Phase::Read
    }

    async fn read(&mut self, iteration: &mut IterationState) -> Phase {
        let mut inputs = Vec::with_capacity(self.bindings.inputs.len());
        for (index, binding) in self.bindings.inputs.iter().enumerate() {
            match binding.resource.read().await {
                Ok(value) => {
                    self.shared.emit(SweepEvent::InputRead {
                        index,
                        value: value.clone(),
                    });
                    inputs.push(value);
                }
                Err(e) => {
                    let resource = binding.name.clone();
                    return self.fail(AbortReason::ReadFailed {
                        resource,
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        let outputs = iteration.current.iter().flatten().cloned().collect();
        if let Err(e) = self.sink.on_row(DataRow::now(outputs, inputs)).await {
            return self.fail(AbortReason::CaptureFailed(e.to_string()));
        }

        iteration.item += 1;
        self.rows += 1;
        let (item, lap, rows) = (iteration.item, iteration.lap, self.rows);
        self.shared.status.send_modify(|s| {
            s.item = item;
            s.rows_captured = rows;
        });
        self.shared.emit(SweepEvent::RowCaptured { item, lap });
        Phase::Next
    }

    async fn ramp_down(&self, iteration: &IterationState) -> Phase {
        let Some(written) = &iteration.written else {
            return Phase::End;
        };
        for (pos, group) in self.space.groups().iter().enumerate() {
            for (index, var) in group.iter().enumerate() {
                if !var.variable.smooth_from {
                    continue;
                }
                let Some(from) = written[pos][index].as_f64() else {
                    continue;
                };

                let binding = &self.bindings.outputs[pos][index];
                let to = var.variable.const_value;
                let result = match ramp(binding, from, to, var.variable.smooth_steps).await {
                    Ok(()) => binding.write(Value::Float(to)).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(resource = binding.name(), "Ramp down failed: {e:#}");
                    return Phase::End;
                }
            }
        }
        Phase::End
    }
}

/// Write the interior points of a smooth path
async fn ramp(binding: &OutputBinding, from: f64, to: f64, steps: usize) -> Result<()> {
    for point in smooth_path(from, to, steps) {
        binding
            .write(Value::Float(point))
            .await
            .with_context(|| format!("ramp point {point}"))?;
    }
    Ok(())
}

/// A sweep running on its own task
pub struct SweepHandle {
    control: SweepControl,
    task: JoinHandle<SweepOutcome>,
}

impl SweepHandle {
    /// Control surface for the running sweep
    pub fn control(&self) -> &SweepControl {
        &self.control
    }

    /// Whether the run task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run task and return its outcome
    pub async fn join(self) -> Result<SweepOutcome> {
        self.task.await.context("Sweep task failed")
    }
}

/// Zero-wait controller settings, handy for tests and dry runs
pub fn immediate_settings() -> ControllerConfig {
    ControllerConfig {
        min_display: Duration::ZERO,
        default_dwell: Duration::ZERO,
        ..ControllerConfig::default()
    }
}
