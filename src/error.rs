use std::io;
use thiserror::Error;

use crate::plugin::schema::{Flow, HttpResponse};
use crate::plugin::PluginState;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Startup error: {0}")]
    Startup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Mediation error: {0}")]
    Mediation(String),

    #[error("Health error: {0}")]
    Health(#[from] HealthError),

    #[error("Invalid state transition for plugin '{plugin}': {from} -> {to}")]
    InvalidStateTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("Plugin '{plugin}' is not accepting traffic (state: {state})")]
    NotRoutable { plugin: String, state: PluginState },

    #[error("Plugin '{plugin}' did not declare the {flow} flow")]
    FlowNotDeclared { plugin: String, flow: Flow },

    #[error("Plugin call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Plugin call cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Unexpected reply for {method}")]
    UnexpectedReply { method: &'static str },
}

#[derive(Error, Debug)]
pub enum HealthError {
    #[error("Unhealthy: {0}")]
    Unhealthy(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Health check timeout")]
    Timeout,
}

/// Failure of a single mediation transaction. Carries the stage that failed
/// so the host can report it; the transaction itself is aborted.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{flow} stage '{plugin}' failed: {source}")]
    Stage {
        plugin: String,
        flow: Flow,
        #[source]
        source: PluginError,
    },

    #[error("Upstream call failed: {0}")]
    Upstream(#[source] PluginError),

    #[error("Transaction cancelled")]
    Cancelled,
}

impl From<ConfigError> for PluginError {
    fn from(err: ConfigError) -> Self {
        PluginError::Startup(err.to_string())
    }
}

impl PluginError {
    /// Transport-level failures mean the plugin is unreachable rather than
    /// that it rejected the call.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PluginError::Transport(_) | PluginError::Io(_))
    }
}

impl PipelineError {
    /// HTTP status the host answers the client with when the transaction is
    /// aborted.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::Stage {
                source: PluginError::Timeout { .. },
                ..
            } => 504,
            PipelineError::Stage {
                source: PluginError::NotRoutable { .. },
                ..
            } => 503,
            PipelineError::Stage { .. } => 500,
            PipelineError::Upstream(PluginError::Timeout { .. }) => 504,
            PipelineError::Upstream(_) => 502,
            // nginx's "client closed request"
            PipelineError::Cancelled => 499,
        }
    }

    /// Final response for an aborted transaction. The original payload is
    /// never passed through.
    pub fn to_response(&self) -> HttpResponse {
        HttpResponse::new(self.status_code())
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_status_codes() {
        let stage = PipelineError::Stage {
            plugin: "auth".to_string(),
            flow: Flow::Request,
            source: PluginError::Mediation("boom".to_string()),
        };
        assert_eq!(stage.status_code(), 500);

        let timeout = PipelineError::Stage {
            plugin: "slow".to_string(),
            flow: Flow::Response,
            source: PluginError::Timeout { timeout_ms: 10 },
        };
        assert_eq!(timeout.status_code(), 504);

        let upstream = PipelineError::Upstream(TransportError::Closed.into());
        assert_eq!(upstream.status_code(), 502);

        let response = stage.to_response();
        assert_eq!(response.status_code, 500);
        assert!(String::from_utf8_lossy(&response.body).contains("auth"));
    }

    #[test]
    fn test_config_error_is_startup_error() {
        let err: PluginError = ConfigError::MissingField("server.address".to_string()).into();
        assert!(matches!(err, PluginError::Startup(_)));
        assert!(err.to_string().contains("server.address"));
    }

    #[test]
    fn test_unavailable_classification() {
        assert!(PluginError::Transport(TransportError::Closed).is_unavailable());
        assert!(!PluginError::Mediation("denied".to_string()).is_unavailable());
    }
}
