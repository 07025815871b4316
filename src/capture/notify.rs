//! Sampling notifications.
//!
//! Subscribers (live plots, loggers) learn when sampling of an input resource
//! starts, every value it produces, and when its sampling stops. Per resource
//! and run the order is always `Started`, any number of `Sample`, then
//! `Stopped`.

use crate::resource::Value;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default capacity of the sampling channel
pub const DEFAULT_CAPACITY: usize = 1024;

/// A sampling notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SamplingEvent {
    /// Sampling of an input resource began
    Started {
        /// Input resource name
        name: String,
    },
    /// An input resource produced a value
    Sample {
        /// Input resource name
        name: String,
        /// Measured value
        value: Value,
    },
    /// Sampling of an input resource ended
    Stopped {
        /// Input resource name
        name: String,
    },
}

/// Broadcast bus for [`SamplingEvent`]s.
#[derive(Debug, Clone)]
pub struct SamplingBus {
    tx: broadcast::Sender<SamplingEvent>,
}

impl SamplingBus {
    /// Bus with room for `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<SamplingEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns the number of subscribers reached
    pub fn publish(&self, event: SamplingEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SamplingBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = SamplingBus::default();
        assert_eq!(
            bus.publish(SamplingEvent::Started {
                name: "adc0".into()
            }),
            0
        );

        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.publish(SamplingEvent::Sample {
            name: "adc0".into(),
            value: Value::Float(0.5),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            SamplingEvent::Sample {
                name: "adc0".into(),
                value: Value::Float(0.5)
            }
        );
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_string(&SamplingEvent::Sample {
            name: "adc0".into(),
            value: Value::Integer(3),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"sample","name":"adc0","value":3}"#);

        let json = serde_json::to_string(&SamplingEvent::Stopped {
            name: "adc0".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"stopped","name":"adc0"}"#);
    }
}
