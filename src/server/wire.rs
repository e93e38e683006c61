//! Wire framing between host and plugin
//!
//! One JSON document per line. The host sends [`Frame`]s, the plugin answers
//! every call with a [`Reply`] carrying the same id. Replies may arrive in
//! any order.

use serde::{Deserialize, Serialize};

use crate::error::{HealthError, PluginError, TransportError};
use crate::plugin::schema::{
    Capabilities, HttpRequest, HttpResponse, Metadata, PluginConfig, Verdict,
};

/// Longest accepted line
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A contract call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum Call {
    GetMetadata,
    GetCapabilities,
    Configure(PluginConfig),
    CheckHealth,
    CheckReady,
    HandleRequest(HttpRequest),
    HandleResponse(HttpResponse),
    Stop,
}

impl Call {
    pub fn method(&self) -> &'static str {
        match self {
            Call::GetMetadata => "getMetadata",
            Call::GetCapabilities => "getCapabilities",
            Call::Configure(_) => "configure",
            Call::CheckHealth => "checkHealth",
            Call::CheckReady => "checkReady",
            Call::HandleRequest(_) => "handleRequest",
            Call::HandleResponse(_) => "handleResponse",
            Call::Stop => "stop",
        }
    }
}

/// Host → plugin message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Call { id: u64, call: Call },
    /// Abandon an outstanding call
    Cancel { id: u64 },
}

/// Successful call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum Payload {
    Empty,
    Metadata(Metadata),
    Capabilities(Capabilities),
    Verdict(Verdict),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Mediation,
    Health,
    NotReady,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Plugin → host message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    pub fn from_result(id: u64, result: Result<Payload, PluginError>) -> Self {
        match result {
            Ok(payload) => Self {
                id,
                ok: Some(payload),
                error: None,
            },
            Err(e) => Self {
                id,
                ok: None,
                error: Some(WireError::from(&e)),
            },
        }
    }

    pub fn into_result(self) -> Result<Payload, PluginError> {
        match (self.ok, self.error) {
            (_, Some(error)) => Err(error.into_plugin_error()),
            (Some(payload), None) => Ok(payload),
            (None, None) => Err(TransportError::InvalidFormat(format!(
                "reply {} has neither result nor error",
                self.id
            ))
            .into()),
        }
    }
}

impl From<&PluginError> for WireError {
    fn from(err: &PluginError) -> Self {
        let (kind, message) = match err {
            PluginError::Configuration(msg) => (ErrorKind::Configuration, msg.clone()),
            PluginError::Mediation(msg) => (ErrorKind::Mediation, msg.clone()),
            PluginError::Health(HealthError::NotReady(msg)) => (ErrorKind::NotReady, msg.clone()),
            PluginError::Health(e) => (ErrorKind::Health, e.to_string()),
            PluginError::Cancelled => (ErrorKind::Cancelled, err.to_string()),
            other => (ErrorKind::Internal, other.to_string()),
        };
        Self { kind, message }
    }
}

impl WireError {
    pub fn into_plugin_error(self) -> PluginError {
        match self.kind {
            ErrorKind::Configuration => PluginError::Configuration(self.message),
            ErrorKind::Mediation | ErrorKind::Internal => PluginError::Mediation(self.message),
            ErrorKind::Health => HealthError::Unhealthy(self.message).into(),
            ErrorKind::NotReady => HealthError::NotReady(self.message).into(),
            ErrorKind::Cancelled => PluginError::Cancelled,
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<String, PluginError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T, PluginError> {
    serde_json::from_str(line.trim())
        .map_err(|e| TransportError::InvalidFormat(e.to_string()).into())
}
