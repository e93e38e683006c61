//! Stamps a fixed header onto every request and response
//!
//! Options:
//! - `header`: header name (default `X-Mediated-By`)
//! - `value`: header value (default `http-mediator`)
//! - `flows`: `request`, `response` or `both` (default `both`); controls
//!   which payloads get the header, not the declared capabilities

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PluginError, Result};
use crate::plugin::{
    Capabilities, Flow, HttpRequest, HttpResponse, Metadata, Plugin, PluginConfig, Verdict,
};

const DEFAULT_HEADER: &str = "X-Mediated-By";
const DEFAULT_VALUE: &str = "http-mediator";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    header: String,
    value: String,
    stamp_requests: bool,
    stamp_responses: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header: DEFAULT_HEADER.to_string(),
            value: DEFAULT_VALUE.to_string(),
            stamp_requests: true,
            stamp_responses: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct HeaderStampPlugin {
    settings: RwLock<Settings>,
}

impl HeaderStampPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn parse_settings(config: &PluginConfig) -> Result<Settings> {
    let header = config.get_or("header", DEFAULT_HEADER);
    if !is_token(header) {
        return Err(PluginError::Configuration(format!(
            "'{header}' is not a valid header name"
        )));
    }

    let value = config.get_or("value", DEFAULT_VALUE);
    if value.contains(['\r', '\n']) {
        return Err(PluginError::Configuration(
            "header value must not contain line breaks".to_string(),
        ));
    }

    let (stamp_requests, stamp_responses) = match config.get_or("flows", "both") {
        "both" => (true, true),
        "request" => (true, false),
        "response" => (false, true),
        other => {
            return Err(PluginError::Configuration(format!(
                "unknown flows '{other}' (expected request, response or both)"
            )))
        }
    };

    Ok(Settings {
        header: header.to_string(),
        value: value.to_string(),
        stamp_requests,
        stamp_responses,
    })
}

#[async_trait]
impl Plugin for HeaderStampPlugin {
    async fn get_metadata(&self) -> Result<Metadata> {
        Ok(Metadata::new("header-stamp", env!("CARGO_PKG_VERSION"))
            .with_description("Adds a fixed header to mediated traffic"))
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(Capabilities::new([Flow::Request, Flow::Response]))
    }

    async fn configure(&self, config: PluginConfig) -> Result<()> {
        let settings = parse_settings(&config)?;
        debug!(header = %settings.header, "header-stamp configured");
        *self.settings.write().await = settings;
        Ok(())
    }

    async fn handle_request(&self, mut request: HttpRequest) -> Result<Verdict> {
        let settings = self.settings.read().await;
        if settings.stamp_requests {
            request.headers.insert(&settings.header, &settings.value);
        }
        Ok(Verdict::pass_request(request))
    }

    async fn handle_response(&self, mut response: HttpResponse) -> Result<Verdict> {
        let settings = self.settings.read().await;
        if settings.stamp_responses {
            response.headers.insert(&settings.header, &settings.value);
        }
        Ok(Verdict::pass_response(response))
    }
}
