use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::DirectoryError;

#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct WebhookResponse {
    pub committed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookResponse {
    pub fn committed() -> Self {
        Self {
            committed: true,
            message: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid JSON body")]
    InvalidJson(#[source] serde_json::Error),

    #[error("Channel ignored")]
    ChannelIgnored,
    #[error("Action ignored")]
    ActionIgnored,
    #[error("Event name ignored")]
    EventNameIgnored,

    #[error("Required user_id missing from context")]
    MissingUserId,
    #[error("Unable to parse userId as an integer")]
    InvalidUserId,
    #[error("Specified user does not exist")]
    UnknownUser,
    #[error("Required timestamp field not found")]
    MissingTimestamp,
    #[error("Required receivedAt field not found")]
    MissingReceivedAt,
    #[error("Unable to parse timestamp")]
    InvalidTimestamp(#[source] time::error::Parse),
    #[error("The event_type field must be specified in the properties dictionary")]
    MissingEventType,

    #[error("Unable to look up user")]
    DirectoryError(#[from] DirectoryError),
}

impl WebhookError {
    /// Label for the rejection counter.
    pub fn cause(&self) -> &'static str {
        match self {
            WebhookError::Unauthorized => "unauthorized",
            WebhookError::InvalidJson(_) => "invalid_json",
            WebhookError::ChannelIgnored => "channel_ignored",
            WebhookError::ActionIgnored => "action_ignored",
            WebhookError::EventNameIgnored => "event_name_ignored",
            WebhookError::MissingUserId => "missing_user_id",
            WebhookError::InvalidUserId => "invalid_user_id",
            WebhookError::UnknownUser => "unknown_user",
            WebhookError::MissingTimestamp | WebhookError::MissingReceivedAt => {
                "missing_timestamp"
            }
            WebhookError::InvalidTimestamp(_) => "invalid_timestamp",
            WebhookError::MissingEventType => "missing_event_type",
            WebhookError::DirectoryError(_) => "directory_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            WebhookError::Unauthorized => StatusCode::UNAUTHORIZED,

            WebhookError::ChannelIgnored
            | WebhookError::ActionIgnored
            | WebhookError::EventNameIgnored => StatusCode::OK,

            WebhookError::InvalidJson(_)
            | WebhookError::MissingUserId
            | WebhookError::InvalidUserId
            | WebhookError::UnknownUser
            | WebhookError::MissingTimestamp
            | WebhookError::MissingReceivedAt
            | WebhookError::InvalidTimestamp(_)
            | WebhookError::MissingEventType => StatusCode::BAD_REQUEST,

            WebhookError::DirectoryError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let body = WebhookResponse {
            committed: false,
            message: Some(self.to_string()),
        };
        (self.status(), Json(body)).into_response()
    }
}
