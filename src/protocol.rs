//! Newline-delimited JSON protocol spoken on the bus access port.

use crate::bus::{BusEntry, BusValue};
use crate::service::PublishedState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_REQUEST_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BusRequest {
    Ping,
    Get { path: String },
    Set { path: String, value: BusValue },
    Dump,
    /// Stream every published snapshot until the client disconnects.
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    /// External write refused by the write handler.
    Rejected,
    Error,
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusResponse {
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<BusValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<BusEntry>,
}

/// Line pushed to watchers after each publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub service: String,
    pub timestamp_ms: u64,
    pub state: PublishedState,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request exceeds {} bytes", MAX_REQUEST_SIZE)]
    MessageTooLarge,
    #[error("invalid request JSON")]
    InvalidJson,
    #[error("serialization failed")]
    SerializationError,
}

impl BusResponse {
    fn with_status(status: ResponseStatus) -> Self {
        Self {
            status,
            path: None,
            value: None,
            text: None,
            message: None,
            items: Vec::new(),
        }
    }

    pub fn success() -> Self {
        Self::with_status(ResponseStatus::Success)
    }

    pub fn value(path: &str, value: BusValue, text: String) -> Self {
        Self {
            path: Some(path.to_string()),
            value: Some(value),
            text: Some(text),
            ..Self::success()
        }
    }

    pub fn listing(items: Vec<BusEntry>) -> Self {
        Self {
            items,
            ..Self::success()
        }
    }

    pub fn rejected(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            message: Some("write rejected".to_string()),
            ..Self::with_status(ResponseStatus::Rejected)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(ResponseStatus::Error)
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::with_status(ResponseStatus::InvalidRequest)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

pub fn parse_request(line: &str) -> Result<BusRequest, ProtocolError> {
    if line.len() > MAX_REQUEST_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    serde_json::from_str(line).map_err(|_| ProtocolError::InvalidJson)
}

pub fn encode_line<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(|_| ProtocolError::SerializationError)?;
    line.push('\n');
    Ok(line)
}
