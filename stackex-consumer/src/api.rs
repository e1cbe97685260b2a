use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;

use crate::pipeline::ConsumerError;

/// Push subscription request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEnvelope {
    pub message: Option<PushMessage>,
    pub subscription: Option<String>,
    /// Only set when the subscription has a dead-letter policy
    pub delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub data: Option<String>,
    pub message_id: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("failed to parse request body: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
    #[error("envelope carries no message")]
    MissingMessage,
    #[error("message has no messageId")]
    MissingMessageId,
    #[error("message data is not valid base64: {0}")]
    InvalidData(#[from] base64::DecodeError),
    #[error(transparent)]
    Processing(#[from] ConsumerError),
    #[error("message was not acknowledged")]
    NotAcknowledged,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Any non-2xx status makes the subscription redeliver
        match self {
            ApiError::InvalidEnvelope(_)
            | ApiError::MissingMessage
            | ApiError::MissingMessageId
            | ApiError::InvalidData(_)
            | ApiError::Processing(_)
            | ApiError::NotAcknowledged => (StatusCode::BAD_REQUEST, self.to_string()),
        }
        .into_response()
    }
}
