//! The plugin contract
//!
//! Every plugin, in-process or remote, implements [`Plugin`]. Each method has
//! a default body that delegates to [`DefaultPlugin`], so a concrete plugin
//! only overrides the calls relevant to the flows it declares.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use http_mediator::plugin::{Capabilities, Flow, HttpRequest, Metadata, Plugin, Verdict};
//!
//! struct Stamp;
//!
//! #[async_trait]
//! impl Plugin for Stamp {
//!     async fn get_metadata(&self) -> http_mediator::error::Result<Metadata> {
//!         Ok(Metadata::new("stamp", "1.0.0"))
//!     }
//!
//!     async fn get_capabilities(&self) -> http_mediator::error::Result<Capabilities> {
//!         Ok(Capabilities::new([Flow::Request]))
//!     }
//!
//!     async fn handle_request(&self, mut req: HttpRequest) -> http_mediator::error::Result<Verdict> {
//!         req.headers.insert("X-Stamp", "1");
//!         Ok(Verdict::pass_request(req))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::Result;
use crate::plugin::default::DefaultPlugin;
use crate::plugin::schema::{
    Capabilities, HttpRequest, HttpResponse, Metadata, PluginConfig, Verdict,
};

/// Capability set every plugin variant implements.
///
/// Mediation calls may run concurrently with each other, so implementations
/// must guard any state shared across calls. Lifecycle calls (`configure`,
/// `stop`) happen outside the window of mediation traffic.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// Identify the plugin. Idempotent and cheap; may be polled.
    async fn get_metadata(&self) -> Result<Metadata> {
        Ok(DefaultPlugin.metadata())
    }

    /// Declare the flows this plugin participates in. Read once by the host;
    /// the answer must not change afterwards.
    async fn get_capabilities(&self) -> Result<Capabilities> {
        Ok(DefaultPlugin.capabilities())
    }

    /// Receive plugin options. Called exactly once, before any mediation or
    /// health call. Reject absent or invalid options with
    /// [`PluginError::Configuration`](crate::error::PluginError::Configuration).
    async fn configure(&self, config: PluginConfig) -> Result<()> {
        DefaultPlugin.configure(config)
    }

    /// Liveness probe. Must return quickly.
    async fn check_health(&self) -> Result<()> {
        DefaultPlugin.check_health()
    }

    /// Readiness probe. Signal "not ready yet" with an error, never by
    /// blocking.
    async fn check_ready(&self) -> Result<()> {
        DefaultPlugin.check_ready()
    }

    /// Mediate a request. Only invoked when [`Flow::Request`] is declared.
    ///
    /// [`Flow::Request`]: crate::plugin::Flow::Request
    async fn handle_request(&self, request: HttpRequest) -> Result<Verdict> {
        Ok(DefaultPlugin.handle_request(request))
    }

    /// Mediate a response. Only invoked when [`Flow::Response`] is declared
    /// and the request phase did not short-circuit.
    ///
    /// [`Flow::Response`]: crate::plugin::Flow::Response
    async fn handle_response(&self, response: HttpResponse) -> Result<Verdict> {
        Ok(DefaultPlugin.handle_response(response))
    }

    /// Release resources. Called at most once; no mediation follows.
    async fn stop(&self) -> Result<()> {
        DefaultPlugin.stop()
    }
}

#[async_trait]
impl<P: Plugin + ?Sized> Plugin for std::sync::Arc<P> {
    async fn get_metadata(&self) -> Result<Metadata> {
        (**self).get_metadata().await
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        (**self).get_capabilities().await
    }

    async fn configure(&self, config: PluginConfig) -> Result<()> {
        (**self).configure(config).await
    }

    async fn check_health(&self) -> Result<()> {
        (**self).check_health().await
    }

    async fn check_ready(&self) -> Result<()> {
        (**self).check_ready().await
    }

    async fn handle_request(&self, request: HttpRequest) -> Result<Verdict> {
        (**self).handle_request(request).await
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Verdict> {
        (**self).handle_response(response).await
    }

    async fn stop(&self) -> Result<()> {
        (**self).stop().await
    }
}
