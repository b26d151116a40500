//! Video player events, renamed to the `event_type` values the player used to emit.
use async_trait::async_trait;
use serde_json::Value;

use super::{TransformError, Transformation, Transformer};
use crate::event::TrackedEvent;
use crate::keys::UsageKey;

const SEEKED: &str = "edx.video.seeked";
const POSITION_CHANGED: &str = "edx.video.position.changed";

const SLIDE_SEEK: &str = "onSlideSeek";
const SKIP_SEEK: &str = "onSkipSeek";
const DEFAULT_SKIP_INTERVAL: f64 = 30.0;

const IOS_APP_NAME: &str = "edx.mobileapp.iOS";
const IOS_BROKEN_SKIP_VERSION: &str = "1.0.02";

fn legacy_name(name: &str) -> Option<&'static str> {
    let legacy = match name {
        "edx.video.played" => "play_video",
        "edx.video.paused" => "pause_video",
        "edx.video.stopped" => "stop_video",
        "edx.video.loaded" => "load_video",
        POSITION_CHANGED | SEEKED => "seek_video",
        "edx.video.transcript.shown" => "show_transcript",
        "edx.video.transcript.hidden" => "hide_transcript",
        "edx.video.language_menu.shown" => "video_show_cc_menu",
        "edx.video.language_menu.hidden" => "video_hide_cc_menu",
        _ => return None,
    };
    Some(legacy)
}

pub struct VideoTransformer;

impl VideoTransformer {
    fn set_id_from_module(event: &mut Transformation) {
        let Some(module_id) = event.payload_mut().remove("module_id") else {
            return;
        };

        match module_id.as_str().map(str::parse::<UsageKey>) {
            Some(Ok(usage_key)) => {
                event
                    .payload_mut()
                    .insert("id".to_owned(), usage_key.html_id().into());
            }
            Some(Err(error)) => {
                tracing::warn!(%error, "video event carries an invalid module_id");
            }
            None => {
                tracing::warn!(module_id = %module_id, "video event module_id is not a string");
            }
        }
    }

    fn convert_seek_type(event: &mut Transformation) {
        let payload = event.payload_mut();
        if let Some(seek_type) = payload.remove("seek_type") {
            let converted = match seek_type.as_str() {
                Some("slide") => Some(SLIDE_SEEK),
                Some("skip") => Some(SKIP_SEEK),
                _ => None,
            };
            if let Some(converted) = converted {
                payload.insert("type".to_owned(), converted.into());
            }
        }

        // Only the skip buttons jump by exactly the default interval
        let interval = payload
            .get("requested_skip_interval")
            .and_then(Value::as_f64);
        if let Some(interval) = interval {
            if interval.abs() != DEFAULT_SKIP_INTERVAL {
                payload.insert("type".to_owned(), SLIDE_SEEK.into());
            }
        }
    }

    fn set_page_from_browser_url(event: &mut Transformation) {
        let Some(url) = event
            .context_mut()
            .and_then(|context| context.remove("open_in_browser_url"))
        else {
            return;
        };

        let page = url
            .as_str()
            .map(|url| url.rsplit_once('/').map_or("", |(dir, _)| dir).to_owned());
        event.set_field("page", page);
    }

    /// Backward skips in this iOS release were reported as forward ones.
    fn fix_ios_skip_direction(event: &mut Transformation) {
        let application = event
            .context()
            .and_then(|context| context.get("application"));
        let is_affected_app = application
            .and_then(|app| app.get("name"))
            .and_then(Value::as_str)
            == Some(IOS_APP_NAME)
            && application
                .and_then(|app| app.get("version"))
                .and_then(Value::as_str)
                == Some(IOS_BROKEN_SKIP_VERSION);
        if !is_affected_app {
            return;
        }

        let payload = event.payload_mut();
        let forward_skip = payload
            .get("requested_skip_interval")
            .and_then(Value::as_f64)
            == Some(DEFAULT_SKIP_INTERVAL)
            && payload.get("type").and_then(Value::as_str) == Some(SKIP_SEEK);
        if forward_skip {
            payload.insert("requested_skip_interval".to_owned(), (-30).into());
        }
    }
}

#[async_trait]
impl Transformer for VideoTransformer {
    fn match_key(&self) -> &str {
        "edx.video."
    }

    fn is_legacy_event(&self, event: &Transformation) -> bool {
        event.name().and_then(legacy_name).is_some()
    }

    fn legacy_event_type(&self, event: &Transformation) -> Option<String> {
        event.name().and_then(legacy_name).map(str::to_owned)
    }

    async fn process_event(&self, event: &mut Transformation) -> Result<(), TransformError> {
        if event.name() == Some(SEEKED) {
            event.set_name(POSITION_CHANGED);
        }

        Self::set_id_from_module(event);
        event.rename_payload_key("current_time", "currentTime");
        Self::convert_seek_type(event);
        Self::set_page_from_browser_url(event);
        Self::fix_ios_skip_direction(event);

        Ok(())
    }

    async fn transform(&self, event: TrackedEvent) -> Result<TrackedEvent, TransformError> {
        // Video events the player never had a name for are left alone
        if event.name().and_then(legacy_name).is_none() {
            return Ok(event);
        }

        let mut event = Transformation::new(event)?;
        if let Some(event_type) = self.legacy_event_type(&event) {
            event.set_event_type(&event_type);
        }
        self.process_legacy_fields(&mut event);
        self.process_event(&mut event).await?;

        Ok(event.finish())
    }
}
