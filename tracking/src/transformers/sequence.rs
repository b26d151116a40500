//! Navigation inside a courseware sequence.
use async_trait::async_trait;
use serde_json::Value;

use super::{TransformError, Transformation, Transformer};

fn copy_payload_field(event: &mut Transformation, from: &str, to: &str) {
    if let Some(value) = event.payload().get(from).cloned() {
        event.payload_mut().insert(to.to_owned(), value);
    }
}

fn payload_number(event: &Transformation, field: &str) -> Option<f64> {
    event.payload().get(field).and_then(Value::as_f64)
}

pub struct TabSelectedTransformer;

#[async_trait]
impl Transformer for TabSelectedTransformer {
    fn match_key(&self) -> &str {
        "edx.ui.lms.sequence.tab_selected"
    }

    fn is_legacy_event(&self, _event: &Transformation) -> bool {
        true
    }

    fn legacy_event_type(&self, _event: &Transformation) -> Option<String> {
        Some("seq_goto".to_owned())
    }

    fn process_legacy_fields(&self, event: &mut Transformation) {
        copy_payload_field(event, "current_tab", "old");
        copy_payload_field(event, "target_tab", "new");
    }
}

/// Navigating off either end of a sequence leaves it, and the legacy `old`/`new` unit
/// fields make no sense there.
fn add_linear_legacy_fields(event: &mut Transformation, offset: i64) {
    let Some(current) = event.payload().get("current_tab").and_then(Value::as_i64) else {
        return;
    };
    let payload = event.payload_mut();
    payload.insert("old".to_owned(), current.into());
    payload.insert("new".to_owned(), (current + offset).into());
}

pub struct NextSelectedTransformer;

impl NextSelectedTransformer {
    const LEGACY_EVENT_TYPE: &'static str = "seq_next";

    fn crosses_boundary(event: &Transformation) -> bool {
        match (
            payload_number(event, "current_tab"),
            payload_number(event, "tab_count"),
        ) {
            (Some(current), Some(count)) => current == count,
            _ => false,
        }
    }
}

#[async_trait]
impl Transformer for NextSelectedTransformer {
    fn match_key(&self) -> &str {
        "edx.ui.lms.sequence.next_selected"
    }

    fn is_legacy_event(&self, event: &Transformation) -> bool {
        !Self::crosses_boundary(event)
    }

    fn legacy_event_type(&self, _event: &Transformation) -> Option<String> {
        Some(Self::LEGACY_EVENT_TYPE.to_owned())
    }

    fn process_legacy_fields(&self, event: &mut Transformation) {
        add_linear_legacy_fields(event, 1);
    }

    async fn process_event(&self, event: &mut Transformation) -> Result<(), TransformError> {
        // Boundary crossings are still reported under the legacy navigation type
        event.set_event_type(Self::LEGACY_EVENT_TYPE);
        Ok(())
    }
}

pub struct PreviousSelectedTransformer;

impl PreviousSelectedTransformer {
    const LEGACY_EVENT_TYPE: &'static str = "seq_prev";

    fn crosses_boundary(event: &Transformation) -> bool {
        payload_number(event, "current_tab") == Some(1.0)
    }
}

#[async_trait]
impl Transformer for PreviousSelectedTransformer {
    fn match_key(&self) -> &str {
        "edx.ui.lms.sequence.previous_selected"
    }

    fn is_legacy_event(&self, event: &Transformation) -> bool {
        !Self::crosses_boundary(event)
    }

    fn legacy_event_type(&self, _event: &Transformation) -> Option<String> {
        Some(Self::LEGACY_EVENT_TYPE.to_owned())
    }

    fn process_legacy_fields(&self, event: &mut Transformation) {
        add_linear_legacy_fields(event, -1);
    }

    async fn process_event(&self, event: &mut Transformation) -> Result<(), TransformError> {
        event.set_event_type(Self::LEGACY_EVENT_TYPE);
        Ok(())
    }
}
