//! Plugin contract and mediation
//!
//! External plugins intercept HTTP requests and responses flowing through a
//! gateway and may rewrite them or answer on the upstream's behalf.
//!
//! # Architecture
//!
//! - **Contract**: every plugin implements [`Plugin`]; unoverridden calls
//!   delegate to [`DefaultPlugin`] (pass-through, no-op)
//! - **Capabilities**: a plugin declares the flows it mediates once, at
//!   registration; the host never calls it for other flows
//! - **Short-circuit**: a verdict with `continue = false` is the final
//!   response and skips every remaining stage, including the upstream call
//! - **Fail-closed**: a failing mediation call aborts the transaction with a
//!   server error instead of passing the original payload through
//!
//! # Modules
//!
//! - `schema`: data exchanged between host and plugin
//! - `contract`: the `Plugin` trait
//! - `default`: the zero-behavior implementation
//! - `lifecycle`: configure → serve → stop state machine and health status
//! - `chain`: request/response pipeline execution
//! - `manager`: host-side registry

pub mod chain;
pub mod contract;
pub mod default;
pub mod lifecycle;
pub mod manager;
pub mod schema;

pub use chain::{
    Pipeline, PipelineOptions, RequestOutcome, ResponseFailurePolicy, UnroutableStagePolicy,
    Upstream,
};
pub use contract::Plugin;
pub use default::DefaultPlugin;
pub use lifecycle::{HealthStatus, ManagedPlugin, PluginState};
pub use manager::{ConfigureReport, PluginManager};
pub use schema::{
    Capabilities, Flow, Headers, HttpRequest, HttpResponse, Metadata, PluginConfig, Verdict,
};
