use async_trait::async_trait;
use thiserror::Error;

use crate::event::TrackedEvent;

pub mod log;
pub mod segment;

pub use log::LogSink;
pub use segment::{
    AnalyticsClient, AnalyticsMessage, AnalyticsMethod, FanoutClient, HttpAnalyticsClient,
    SegmentSink,
};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event of {0} bytes exceeds the maximum event size")]
    EventTooBig(usize),
    #[error("failed to serialize event: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("analytics request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("analytics api answered with status {0}")]
    UnexpectedStatus(u16),
    #[error("sink did not answer within {0}ms")]
    Timeout(u64),
}

#[async_trait]
pub trait EventSink {
    async fn send(&self, event: TrackedEvent) -> Result<(), SinkError>;
}
