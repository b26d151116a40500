use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// `%Y-%m-%dT%H:%M:%S.%fZ`, the only form the webhook accepts.
const SEGMENT_TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]Z");

/// Microsecond precision with an explicit UTC offset, as the tracking logs expect.
const EVENT_TIME: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]+00:00"
);

pub trait TimeSource {
    // Return an ISO timestamp
    fn current_time(&self) -> String;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> String {
        format_event_time(OffsetDateTime::now_utc())
    }
}

pub fn parse_segment_timestamp(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(value, SEGMENT_TIMESTAMP).map(PrimitiveDateTime::assume_utc)
}

pub fn format_event_time(value: OffsetDateTime) -> String {
    value
        .to_offset(time::UtcOffset::UTC)
        .format(EVENT_TIME)
        .expect("failed to format event time")
}
