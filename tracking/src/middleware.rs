//! Request tracking: every request runs with an `edx.request` context describing it, and
//! requests to paths that are not ignored are logged as a `server` event.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, request::Parts, HeaderMap, Method};
use axum::middleware::Next;
use axum::response::Response;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::UrlPatterns;
use crate::event::{remove_shim_context, TrackedEvent, LEGACY_CONTEXT_FIELDS};
use crate::keys::course_key_from_path;
use crate::routing::EventRouter;
use crate::time::TimeSource;
use crate::tracker::{self, ContextGuard};

pub const REQUEST_CONTEXT: &str = "edx.request";
pub const REDACTED: &str = "********";

/// Larger form bodies, or ones of unknown size, are passed on without their parameters.
const MAX_FORM_BYTES: usize = 1024 * 1024;

/// The authenticated caller, inserted as a request extension by the authentication layer.
#[derive(Debug, Clone, Default)]
pub struct RequestUser {
    pub user_id: i64,
    pub username: String,
    pub session: Option<String>,
}

#[derive(Clone)]
pub struct RequestTracking {
    pub events: Arc<EventRouter>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub ignore_patterns: UrlPatterns,
    pub censored_keys: HashSet<String>,
    pub max_body_chars: usize,
}

pub async fn track_request(
    State(tracking): State<Arc<RequestTracking>>,
    req: Request,
    next: Next,
) -> Response {
    tracker::scope(async move {
        let _guard = ContextGuard::enter(REQUEST_CONTEXT, request_context(&req));

        let req = if tracking.ignore_patterns.is_match(req.uri().path()) {
            req
        } else {
            tracking.track(req).await
        };
        next.run(req).await
    })
    .await
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned()
}

fn client_ip(req: &Request) -> String {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_owned();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

/// Client id of the analytics cookie, `GA1.2.<client id>`.
fn analytics_client_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().strip_prefix("_ga="))
        .find_map(|value| {
            let parts: Vec<&str> = value.splitn(3, '.').collect();
            match parts.as_slice() {
                [_, _, client_id] if !client_id.is_empty() => Some((*client_id).to_owned()),
                _ => None,
            }
        })
}

fn request_context(req: &Request) -> Map<String, Value> {
    let headers = req.headers();
    let path = req.uri().path();
    let user = req.extensions().get::<RequestUser>();

    let mut context = Map::new();
    let (course_id, org_id) = match course_key_from_path(path) {
        Some(course) => (course.to_string(), course.org),
        None => (String::new(), String::new()),
    };
    context.insert("course_id".to_owned(), course_id.into());
    context.insert("org_id".to_owned(), org_id.into());

    context.insert(
        "user_id".to_owned(),
        user.map_or_else(|| Value::from(""), |user| Value::from(user.user_id)),
    );
    context.insert(
        "username".to_owned(),
        user.map(|user| user.username.clone()).unwrap_or_default().into(),
    );
    context.insert(
        "session".to_owned(),
        user.and_then(|user| user.session.clone())
            .unwrap_or_default()
            .into(),
    );

    context.insert("ip".to_owned(), client_ip(req).into());
    context.insert("host".to_owned(), header_str(headers, header::HOST).into());
    context.insert("agent".to_owned(), header_str(headers, header::USER_AGENT).into());
    context.insert("path".to_owned(), path.into());
    context.insert("referer".to_owned(), header_str(headers, header::REFERER).into());
    context.insert(
        "accept_language".to_owned(),
        header_str(headers, header::ACCEPT_LANGUAGE).into(),
    );
    if let Some(client_id) = analytics_client_id(headers) {
        context.insert("client_id".to_owned(), client_id.into());
    }

    context
}

/// Form posts whose declared size can be buffered.
fn is_trackable_form(parts: &Parts) -> bool {
    let is_form = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| content_type.starts_with("application/x-www-form-urlencoded"));
    let length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());

    parts.method == Method::POST && is_form && length.is_some_and(|length| length <= MAX_FORM_BYTES)
}

impl RequestTracking {
    /// Parameters grouped by key, each key holding every value it was given.
    fn parameters(&self, encoded: &[u8]) -> Map<String, Value> {
        let pairs: Vec<(String, String)> = match serde_urlencoded::from_bytes(encoded) {
            Ok(pairs) => pairs,
            Err(error) => {
                debug!(%error, "unable to decode request parameters");
                Vec::new()
            }
        };

        let mut parameters = Map::new();
        for (key, value) in pairs {
            let value = if self.censored_keys.contains(&key) {
                REDACTED.to_owned()
            } else {
                value
            };
            if let Value::Array(values) = parameters
                .entry(key)
                .or_insert_with(|| Value::Array(Vec::new()))
            {
                values.push(value.into());
            }
        }
        parameters
    }

    async fn track(&self, req: Request) -> Request {
        let (parts, body) = req.into_parts();
        let get = self.parameters(parts.uri.query().unwrap_or_default().as_bytes());

        let (post, body) = if is_trackable_form(&parts) {
            match to_bytes(body, MAX_FORM_BYTES).await {
                Ok(bytes) => (self.parameters(&bytes), Body::from(bytes)),
                Err(error) => {
                    warn!(%error, "unable to read form body for request tracking");
                    (Map::new(), Body::empty())
                }
            }
        } else {
            (Map::new(), body)
        };

        self.emit(parts.uri.path(), get, post).await;
        Request::from_parts(parts, body)
    }

    async fn emit(&self, path: &str, get: Map<String, Value>, post: Map<String, Value>) {
        let mut parameters = Map::new();
        parameters.insert("GET".to_owned(), get.into());
        parameters.insert("POST".to_owned(), post.into());
        let payload: String = Value::Object(parameters)
            .to_string()
            .chars()
            .take(self.max_body_chars)
            .collect();

        let context = tracker::resolve_context();
        let mut event = TrackedEvent::new();
        for field in LEGACY_CONTEXT_FIELDS {
            let value = context.get(field).cloned().unwrap_or_else(|| "".into());
            event.insert(field, value);
        }
        event.insert("name", path);
        event.insert("event_type", path);
        event.insert("event_source", "server");
        event.insert("event", payload);
        event.insert("time", self.timesource.current_time());
        event.insert("page", Value::Null);
        event.insert("context", context);
        remove_shim_context(&mut event);

        self.events.send(event).await;
    }
}
