use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::event::TrackedEvent;
use crate::processors::{run_chain, SharedProcessor};
use crate::sinks::{EventSink, SinkError};
use crate::time::TimeSource;
use crate::tracker;

/// One destination: its own processors, then a sink.
pub struct Backend {
    name: String,
    processors: Vec<SharedProcessor>,
    sink: Arc<dyn EventSink + Send + Sync>,
}

impl Backend {
    pub fn new(
        name: &str,
        processors: Vec<SharedProcessor>,
        sink: Arc<dyn EventSink + Send + Sync>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            processors,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: TrackedEvent, timeout: Duration) {
        let Some(event) = run_chain(&self.processors, event).await else {
            return;
        };

        let result = match tokio::time::timeout(timeout, self.sink.send(event)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(timeout.as_millis() as u64)),
        };

        match result {
            Ok(()) => {
                metrics::counter!("tracking_events_emitted_total", "backend" => self.name.clone())
                    .increment(1);
            }
            Err(err) => {
                let cause = match err {
                    SinkError::Timeout(_) => "sink_timeout",
                    SinkError::EventTooBig(_) => "event_too_big",
                    _ => "sink_error",
                };
                error!(backend = %self.name, %err, "failed to deliver event");
                metrics::counter!("tracking_events_dropped_total", "cause" => cause).increment(1);
            }
        }
    }
}

/// Entry point of the pipeline: global processors, then every backend in turn.
/// Never fails, delivery problems are logged and counted.
pub struct EventRouter {
    processors: Vec<SharedProcessor>,
    backends: Vec<Backend>,
    sink_timeout: Duration,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl EventRouter {
    pub fn new(
        processors: Vec<SharedProcessor>,
        sink_timeout: Duration,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            processors,
            backends: Vec::new(),
            sink_timeout,
            timesource,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn backends(&self) -> impl Iterator<Item = &str> {
        self.backends.iter().map(Backend::name)
    }

    pub async fn send(&self, event: TrackedEvent) {
        metrics::counter!("tracking_events_received_total").increment(1);

        let Some(event) = run_chain(&self.processors, event).await else {
            return;
        };
        if self.backends.is_empty() {
            warn!(name = event.name(), "no backend configured, event discarded");
            return;
        }

        for backend in &self.backends {
            backend.deliver(event.clone(), self.sink_timeout).await;
        }
    }

    /// Emit an event under the context of the current request.
    pub async fn emit(&self, name: &str, data: Map<String, Value>) {
        let mut event = TrackedEvent::new();
        event.insert("name", name);
        event.insert("timestamp", self.timesource.current_time());
        event.insert("context", tracker::resolve_context());
        event.insert("data", data);

        debug!(name, "emitting event");
        self.send(event).await;
    }
}
