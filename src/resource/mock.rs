//! Mock Resource Implementations
//!
//! Memory-backed channels for tests and for running sweeps without hardware.
//! All delays use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Behaviors
//!
//! - `Echo` - reads return the last written value (a DAC looped back to an ADC)
//! - `Constant` - reads always return the same value
//! - `Noise` - reads return a uniform random float in `[min, max)`
//!
//! Failures can be injected on the n-th write or read call to exercise the
//! sweep's abort paths.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use super::{Resource, Value};

/// How a mock answers reads
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Reads return the last written value
    Echo,
    /// Reads return a fixed value
    Constant(Value),
    /// Reads return uniform noise in `[min, max)`
    Noise {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
}

/// Simulated instrument channel
///
/// # Example
///
/// ```rust,ignore
/// let dac = MockResource::echo().fail_write_on(3);
/// dac.write(Value::Float(1.0)).await?;
/// assert_eq!(dac.read().await?, Value::Float(1.0));
/// ```
pub struct MockResource {
    behavior: MockBehavior,
    readable: bool,
    writable: bool,
    latency: Duration,
    last_written: Mutex<Value>,
    history: Mutex<Vec<Value>>,
    writes: AtomicU64,
    reads: AtomicU64,
    fail_write_on: Option<u64>,
    fail_read_on: Option<u64>,
}

impl MockResource {
    /// Create a mock with the given behavior, readable and writable
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            readable: true,
            writable: true,
            latency: Duration::ZERO,
            last_written: Mutex::new(Value::Float(0.0)),
            history: Mutex::new(Vec::new()),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            fail_write_on: None,
            fail_read_on: None,
        }
    }

    /// Loopback channel
    pub fn echo() -> Self {
        Self::new(MockBehavior::Echo)
    }

    /// Read-only channel returning `value`
    pub fn constant(value: Value) -> Self {
        Self::new(MockBehavior::Constant(value)).writable_as(false)
    }

    /// Read-only channel returning uniform noise
    pub fn noise(min: f64, max: f64) -> Self {
        Self::new(MockBehavior::Noise { min, max }).writable_as(false)
    }

    /// Set whether the channel is readable
    pub fn readable_as(mut self, readable: bool) -> Self {
        self.readable = readable;
        self
    }

    /// Set whether the channel is writable
    pub fn writable_as(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Simulated I/O latency applied to every write and read
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the n-th write call (1-based)
    pub fn fail_write_on(mut self, call: u64) -> Self {
        self.fail_write_on = Some(call);
        self
    }

    /// Fail the n-th read call (1-based)
    pub fn fail_read_on(mut self, call: u64) -> Self {
        self.fail_read_on = Some(call);
        self
    }

    /// Every value accepted by `write`, in order
    pub async fn history(&self) -> Vec<Value> {
        self.history.lock().await.clone()
    }

    /// Number of write calls, including failed ones
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of read calls, including failed ones
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resource for MockResource {
    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn write(&self, value: Value) -> Result<()> {
        let call = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if !self.writable {
            return Err(anyhow!("Resource is not writable"));
        }
        if self.fail_write_on == Some(call) {
            return Err(anyhow!("Simulated write failure on call {}", call));
        }

        *self.last_written.lock().await = value.clone();
        self.history.lock().await.push(value);
        Ok(())
    }

    async fn read(&self) -> Result<Value> {
        let call = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if !self.readable {
            return Err(anyhow!("Resource is not readable"));
        }
        if self.fail_read_on == Some(call) {
            return Err(anyhow!("Simulated read failure on call {}", call));
        }

        match &self.behavior {
            MockBehavior::Echo => Ok(self.last_written.lock().await.clone()),
            MockBehavior::Constant(value) => Ok(value.clone()),
            MockBehavior::Noise { min, max } => {
                let value = if max > min {
                    rand::thread_rng().gen_range(*min..*max)
                } else {
                    *min
                };
                Ok(Value::Float(value))
            }
        }
    }
}
