//! Data capture: buffering, export and sampling notifications.
//!
//! The sweep controller hands every captured row to a [`RowSink`]. The
//! standard sink is [`CapturePipeline`]:
//!
//! ```text
//! on_row ──▶ Sample events ──▶ buffer ──(len >= max_buf_size)──▶ ExportSink
//!                                  │
//! on_close ────────────────────────┴─▶ final flush ─▶ close ─▶ Stopped
//! ```
//!
//! A batch is handed to the export once. If that write fails the export is
//! marked failed and later flushes drop their rows instead of retrying.
//!
//! Buffer, export handle and lifecycle flags live behind one async mutex, so
//! rows are exported in capture order and a flush never interleaves with an
//! append.

pub mod export;
pub mod notify;

use crate::error::SweepResult;
use crate::resource::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use notify::{SamplingBus, SamplingEvent};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One captured measurement row
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Output values in effect, in group order
    pub outputs: Vec<Value>,
    /// Input values, in input order
    pub inputs: Vec<Value>,
}

impl DataRow {
    /// Row captured now
    pub fn now(outputs: Vec<Value>, inputs: Vec<Value>) -> Self {
        Self {
            timestamp: Utc::now(),
            outputs,
            inputs,
        }
    }
}

/// Receiver of captured rows, driven by the sweep controller.
///
/// `on_start` is called once when the run begins, `on_row` once per
/// captured item, and `on_close` once when the run ends, whatever the
/// outcome.
#[async_trait]
pub trait RowSink: Send + Sync {
    /// The run began
    async fn on_start(&self) -> SweepResult<()>;

    /// A row was captured
    async fn on_row(&self, row: DataRow) -> SweepResult<()>;

    /// The run ended; flush and release everything
    async fn on_close(&self) -> SweepResult<()>;
}

/// Persistent destination for flushed rows
pub trait ExportSink: Send {
    /// Append rows in order
    fn write_rows(&mut self, rows: &[DataRow]) -> SweepResult<()>;

    /// Push buffered bytes to storage
    fn flush(&mut self) -> SweepResult<()>;

    /// Flush and release the destination
    fn close(&mut self) -> SweepResult<()>;
}

struct PipelineState {
    buffer: Vec<DataRow>,
    export: Option<Box<dyn ExportSink>>,
    started: bool,
    closed: bool,
    export_failed: bool,
    rows_received: u64,
    flushes: u64,
}

impl PipelineState {
    /// Hands the buffered rows to the export exactly once. A batch that fails
    /// to write is dropped and the export is not written again.
    fn flush(&mut self) -> SweepResult<()> {
        let rows = std::mem::take(&mut self.buffer);
        if !rows.is_empty() {
            self.flushes += 1;
        }

        let Some(export) = self.export.as_mut() else {
            return Ok(());
        };
        if self.export_failed {
            if !rows.is_empty() {
                warn!(rows = rows.len(), "Rows dropped: export failed earlier");
            }
            return Ok(());
        }
        if !rows.is_empty() {
            if let Err(e) = export.write_rows(&rows) {
                self.export_failed = true;
                return Err(e);
            }
        }
        let flushed = export.flush();
        self.export_failed = flushed.is_err();
        flushed
    }
}

/// Buffering capture pipeline.
pub struct CapturePipeline {
    state: Mutex<PipelineState>,
    max_buf_size: usize,
    input_names: Vec<String>,
    bus: SamplingBus,
}

impl CapturePipeline {
    /// Pipeline flushing every `max_buf_size` rows.
    ///
    /// `input_names` label the `Sample` events, one per input column.
    pub fn new(max_buf_size: usize, input_names: Vec<String>, bus: SamplingBus) -> Self {
        Self {
            state: Mutex::new(PipelineState {
                buffer: Vec::with_capacity(max_buf_size.max(1)),
                export: None,
                started: false,
                closed: false,
                export_failed: false,
                rows_received: 0,
                flushes: 0,
            }),
            max_buf_size: max_buf_size.max(1),
            input_names,
            bus,
        }
    }

    /// Attach an export destination
    pub fn with_export(mut self, export: Box<dyn ExportSink>) -> Self {
        self.state.get_mut().export = Some(export);
        self
    }

    /// Bus carrying this pipeline's sampling events
    pub fn bus(&self) -> &SamplingBus {
        &self.bus
    }

    /// Write any buffered rows to the export and flush it
    pub async fn flush(&self) -> SweepResult<()> {
        self.state.lock().await.flush()
    }

    /// Rows accepted so far
    pub async fn rows_received(&self) -> u64 {
        self.state.lock().await.rows_received
    }

    /// Rows waiting for the next flush
    pub async fn buffered(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    /// Flushes that moved rows out of the buffer
    pub async fn flush_count(&self) -> u64 {
        self.state.lock().await.flushes
    }

    /// Whether `on_close` has run
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl RowSink for CapturePipeline {
    async fn on_start(&self) -> SweepResult<()> {
        let mut state = self.state.lock().await;
        if state.started || state.closed {
            return Ok(());
        }
        state.started = true;
        for name in &self.input_names {
            self.bus.publish(SamplingEvent::Started { name: name.clone() });
        }
        info!(max_buf_size = self.max_buf_size, "Capture started");
        Ok(())
    }

    async fn on_row(&self, row: DataRow) -> SweepResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            warn!("Row dropped: capture already closed");
            return Ok(());
        }

        for (name, value) in self.input_names.iter().zip(&row.inputs) {
            self.bus.publish(SamplingEvent::Sample {
                name: name.clone(),
                value: value.clone(),
            });
        }

        state.buffer.push(row);
        state.rows_received += 1;
        if state.buffer.len() >= self.max_buf_size {
            debug!(rows = state.buffer.len(), "Buffer full, flushing");
            state.flush()?;
        }
        Ok(())
    }

    async fn on_close(&self) -> SweepResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let flushed = state.flush();
        let closed = match state.export.as_mut() {
            Some(export) => export.close(),
            None => Ok(()),
        };
        if state.started {
            for name in &self.input_names {
                self.bus.publish(SamplingEvent::Stopped { name: name.clone() });
            }
        }
        info!(rows = state.rows_received, "Capture closed");

        flushed.and(closed)
    }
}

/// Rows and flush calls seen by a [`MemoryExport`]
#[derive(Debug, Clone, Default)]
pub struct MemoryRecord {
    /// Rows in write order
    pub rows: Vec<DataRow>,
    /// Number of `write_rows` calls
    pub writes: usize,
    /// Number of `flush` calls
    pub flushes: usize,
    /// Whether `close` was called
    pub closed: bool,
}

/// Export destination that keeps rows in memory.
///
/// Clones share the same record, so a handle kept outside the pipeline can
/// inspect what was exported.
#[derive(Debug, Clone, Default)]
pub struct MemoryExport {
    record: Arc<StdMutex<MemoryRecord>>,
}

impl MemoryExport {
    /// Empty in-memory export
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn record(&self) -> MemoryRecord {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRecord> {
        // A poisoned record is still readable
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ExportSink for MemoryExport {
    fn write_rows(&mut self, rows: &[DataRow]) -> SweepResult<()> {
        let mut record = self.lock();
        record.rows.extend_from_slice(rows);
        record.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> SweepResult<()> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> SweepResult<()> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SweepError;

    fn row(i: i64) -> DataRow {
        DataRow::now(vec![Value::Integer(i)], vec![Value::Float(i as f64 / 10.0)])
    }

    fn started(name: &str) -> SamplingEvent {
        SamplingEvent::Started { name: name.into() }
    }

    fn stopped(name: &str) -> SamplingEvent {
        SamplingEvent::Stopped { name: name.into() }
    }

    fn sample(name: &str, value: i64) -> SamplingEvent {
        SamplingEvent::Sample {
            name: name.into(),
            value: Value::Integer(value),
        }
    }

    fn event_name(event: &SamplingEvent) -> &str {
        match event {
            SamplingEvent::Started { name }
            | SamplingEvent::Sample { name, .. }
            | SamplingEvent::Stopped { name } => name,
        }
    }

    fn pipeline(max_buf_size: usize) -> (CapturePipeline, MemoryExport) {
        let export = MemoryExport::new();
        let pipeline = CapturePipeline::new(max_buf_size, vec!["adc0".into()], SamplingBus::default())
            .with_export(Box::new(export.clone()));
        (pipeline, export)
    }

    #[tokio::test]
    async fn test_auto_flush_at_buffer_size() {
        let (pipeline, export) = pipeline(3);
        pipeline.on_start().await.unwrap();
        for i in 0..7 {
            pipeline.on_row(row(i)).await.unwrap();
        }

        assert_eq!(pipeline.flush_count().await, 2);
        assert_eq!(pipeline.buffered().await, 1);
        assert_eq!(export.record().rows.len(), 6);

        pipeline.on_close().await.unwrap();
        let record = export.record();
        assert_eq!(record.rows.len(), 7);
        assert!(record.closed);
        let order: Vec<Value> = record.rows.iter().map(|r| r.outputs[0].clone()).collect();
        assert_eq!(order, (0..7).map(Value::Integer).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_flush_with_empty_buffer_still_flushes_export() {
        let (pipeline, export) = pipeline(10);
        pipeline.flush().await.unwrap();

        let record = export.record();
        assert_eq!(record.writes, 0);
        assert_eq!(record.flushes, 1);
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let (pipeline, export) = pipeline(10);
        let mut rx = pipeline.bus().subscribe();

        pipeline.on_start().await.unwrap();
        pipeline.on_row(row(1)).await.unwrap();
        pipeline.on_close().await.unwrap();
        pipeline.on_close().await.unwrap();
        // Rows after close are dropped
        pipeline.on_row(row(2)).await.unwrap();

        assert_eq!(export.record().rows.len(), 1);
        assert_eq!(export.record().writes, 1);

        assert_eq!(rx.recv().await.unwrap(), started("adc0"));
        assert!(matches!(rx.recv().await.unwrap(), SamplingEvent::Sample { .. }));
        assert_eq!(rx.recv().await.unwrap(), stopped("adc0"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sampling_events_per_input() {
        let pipeline = CapturePipeline::new(
            10,
            vec!["adc0".into(), "adc1".into()],
            SamplingBus::default(),
        );
        let mut rx = pipeline.bus().subscribe();

        pipeline.on_start().await.unwrap();
        for i in 0..2 {
            let inputs = vec![Value::Integer(i), Value::Integer(10 + i)];
            pipeline.on_row(DataRow::now(vec![], inputs)).await.unwrap();
        }
        pipeline.on_close().await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events,
            [
                started("adc0"),
                started("adc1"),
                sample("adc0", 0),
                sample("adc1", 10),
                sample("adc0", 1),
                sample("adc1", 11),
                stopped("adc0"),
                stopped("adc1"),
            ]
        );

        for name in ["adc0", "adc1"] {
            let own: Vec<_> = events.iter().filter(|e| event_name(e) == name).collect();
            assert_eq!(own.first(), Some(&&started(name)));
            assert_eq!(own.last(), Some(&&stopped(name)));
            assert_eq!(own.len(), 4);
        }
    }

    #[tokio::test]
    async fn test_no_inputs_publish_nothing() {
        let pipeline = CapturePipeline::new(10, Vec::new(), SamplingBus::default());
        let mut rx = pipeline.bus().subscribe();

        pipeline.on_start().await.unwrap();
        pipeline.on_row(DataRow::now(vec![Value::Integer(1)], vec![])).await.unwrap();
        pipeline.on_close().await.unwrap();

        assert_eq!(pipeline.rows_received().await, 1);
        assert!(rx.try_recv().is_err());
    }

    /// Keeps the first row of the first batch, then fails the write.
    #[derive(Clone, Default)]
    struct FailingExport {
        rows: Arc<StdMutex<Vec<DataRow>>>,
        writes: Arc<StdMutex<usize>>,
    }

    impl ExportSink for FailingExport {
        fn write_rows(&mut self, rows: &[DataRow]) -> SweepResult<()> {
            *self.writes.lock().unwrap() += 1;
            let mut stored = self.rows.lock().unwrap();
            if stored.is_empty() {
                stored.extend(rows.iter().take(1).cloned());
                return Err(SweepError::Io(std::io::Error::other("disk full")));
            }
            stored.extend_from_slice(rows);
            Ok(())
        }

        fn flush(&mut self) -> SweepResult<()> {
            Ok(())
        }

        fn close(&mut self) -> SweepResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_written_again_on_close() {
        let export = FailingExport::default();
        let pipeline = CapturePipeline::new(2, vec!["adc0".into()], SamplingBus::default())
            .with_export(Box::new(export.clone()));

        pipeline.on_start().await.unwrap();
        pipeline.on_row(row(0)).await.unwrap();
        assert!(pipeline.on_row(row(1)).await.is_err());
        assert_eq!(pipeline.buffered().await, 0);

        pipeline.on_close().await.unwrap();
        pipeline.flush().await.unwrap();

        let stored: Vec<Value> = export
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.outputs[0].clone())
            .collect();
        assert_eq!(stored, [Value::Integer(0)]);
        assert_eq!(*export.writes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_close_without_start_stays_silent() {
        let (pipeline, export) = pipeline(10);
        let mut rx = pipeline.bus().subscribe();

        pipeline.on_close().await.unwrap();
        assert!(pipeline.is_closed().await);
        assert!(export.record().closed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pipeline_without_export_discards_rows() {
        let pipeline = CapturePipeline::new(2, vec!["adc0".into()], SamplingBus::default());
        for i in 0..5 {
            pipeline.on_row(row(i)).await.unwrap();
        }
        assert_eq!(pipeline.rows_received().await, 5);
        assert_eq!(pipeline.flush_count().await, 2);
        pipeline.on_close().await.unwrap();
        assert_eq!(pipeline.buffered().await, 0);
    }
}
