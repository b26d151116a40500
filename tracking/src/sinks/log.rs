use async_trait::async_trait;

use super::{EventSink, SinkError};
use crate::event::TrackedEvent;

/// Target the tracking log lines are written under, so they can be routed to their own
/// file by the subscriber.
pub const TRACKING_TARGET: &str = "tracking";

/// Writes each event as one JSON line through `tracing`.
pub struct LogSink {
    max_event_bytes: usize,
}

impl LogSink {
    pub fn new(max_event_bytes: usize) -> Self {
        Self { max_event_bytes }
    }
}

#[async_trait]
impl EventSink for LogSink {
    async fn send(&self, event: TrackedEvent) -> Result<(), SinkError> {
        let line = serde_json::to_string(&event)?;
        if line.len() > self.max_event_bytes {
            tracing::warn!(
                name = event.name(),
                size = line.len(),
                "event exceeds the tracking log size limit, dropping"
            );
            return Err(SinkError::EventTooBig(line.len()));
        }

        tracing::info!(target: TRACKING_TARGET, "{}", line);
        Ok(())
    }
}
