//! Zero-behavior plugin
//!
//! Every `Plugin` method that a concrete plugin leaves alone delegates here.

use async_trait::async_trait;

use crate::error::Result;
use crate::plugin::contract::Plugin;
use crate::plugin::schema::{
    Capabilities, HttpRequest, HttpResponse, Metadata, PluginConfig, Verdict,
};

/// Pass-through, no-op implementation of the plugin contract.
///
/// Metadata and capabilities are empty, so a plugin that overrides neither
/// declares no flows and is never placed in a pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPlugin;

impl DefaultPlugin {
    pub fn metadata(&self) -> Metadata {
        Metadata::default()
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    pub fn configure(&self, _config: PluginConfig) -> Result<()> {
        Ok(())
    }

    pub fn check_health(&self) -> Result<()> {
        Ok(())
    }

    pub fn check_ready(&self) -> Result<()> {
        Ok(())
    }

    pub fn handle_request(&self, request: HttpRequest) -> Verdict {
        Verdict::pass_request(request)
    }

    pub fn handle_response(&self, response: HttpResponse) -> Verdict {
        Verdict::pass_response(response)
    }

    pub fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Plugin for DefaultPlugin {}
