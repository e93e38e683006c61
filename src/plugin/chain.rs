//! Mediation pipeline
//!
//! Sequences request-flow plugins, the upstream call and response-flow
//! plugins for one transaction. Stage N's output is stage N+1's input; a
//! verdict with `continue = false` ends the transaction with that verdict as
//! the final response.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::error::{PipelineError, PluginError, Result};
use crate::plugin::lifecycle::ManagedPlugin;
use crate::plugin::schema::{Flow, HttpRequest, HttpResponse, Verdict};

/// What to do when a response-flow stage fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseFailurePolicy {
    /// Abort the transaction with a server error
    #[default]
    FailClosed,
    /// Return the response as mediated up to the failing stage
    ReturnUpstream,
}

/// What to do with a stage whose plugin is rejected, stopping or stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnroutableStagePolicy {
    /// Leave the stage out of this transaction
    #[default]
    Skip,
    /// Abort the transaction
    FailClosed,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub stage_timeout: Duration,
    pub response_failure_policy: ResponseFailurePolicy,
    pub unroutable_stage_policy: UnroutableStagePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(30),
            response_failure_policy: ResponseFailurePolicy::FailClosed,
            unroutable_stage_policy: UnroutableStagePolicy::Skip,
        }
    }
}

/// The call the host makes between the request and response phases
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn forward(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Result of the request phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Send this request upstream
    Forward(HttpRequest),
    /// A plugin answered; skip upstream and the response phase
    ShortCircuit(HttpResponse),
}

/// Ordered plugin stages for both flows
#[derive(Debug, Clone)]
pub struct Pipeline {
    request_stages: Vec<Arc<ManagedPlugin>>,
    response_stages: Vec<Arc<ManagedPlugin>>,
    options: PipelineOptions,
}

impl Pipeline {
    /// Build the pipeline from plugins in registration order. A plugin only
    /// becomes a stage of the flows it declared.
    pub fn new(plugins: impl IntoIterator<Item = Arc<ManagedPlugin>>, options: PipelineOptions) -> Self {
        let mut request_stages = Vec::new();
        let mut response_stages = Vec::new();

        for plugin in plugins {
            if plugin.supports(Flow::Request) {
                request_stages.push(plugin.clone());
            }
            if plugin.supports(Flow::Response) {
                response_stages.push(plugin);
            }
        }

        Self {
            request_stages,
            response_stages,
            options,
        }
    }

    pub fn stage_names(&self, flow: Flow) -> Vec<&str> {
        self.stages(flow).iter().map(|p| p.name()).collect()
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    fn stages(&self, flow: Flow) -> &[Arc<ManagedPlugin>] {
        match flow {
            Flow::Request => &self.request_stages,
            Flow::Response => &self.response_stages,
        }
    }

    /// Run one stage with the stage timeout, abandoning it on cancellation.
    /// `Ok(None)` means the plugin is not routable and the stage is skipped.
    /// Under `UnroutableStagePolicy::FailClosed` that is a stage failure
    /// instead.
    async fn run_stage<F>(
        &self,
        plugin: &ManagedPlugin,
        flow: Flow,
        call: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<Verdict>, PipelineError>
    where
        F: Future<Output = Result<Verdict>>,
    {
        let timeout_ms = self.options.stage_timeout.as_millis() as u64;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            outcome = timeout(self.options.stage_timeout, call) => outcome,
        };

        match outcome {
            Ok(Ok(verdict)) => {
                debug!(
                    plugin = %plugin.name(),
                    %flow,
                    continue_processing = verdict.continue_,
                    "Stage completed"
                );
                Ok(Some(verdict))
            }
            Ok(Err(PluginError::NotRoutable { state, .. }))
                if self.options.unroutable_stage_policy == UnroutableStagePolicy::Skip =>
            {
                debug!(plugin = %plugin.name(), %flow, %state, "Skipping stage");
                Ok(None)
            }
            Ok(Err(e)) => {
                error!(plugin = %plugin.name(), %flow, error = %e, "Stage failed");
                Err(PipelineError::Stage {
                    plugin: plugin.name().to_string(),
                    flow,
                    source: e,
                })
            }
            Err(_) => {
                warn!(plugin = %plugin.name(), %flow, timeout_ms, "Stage timed out");
                Err(PipelineError::Stage {
                    plugin: plugin.name().to_string(),
                    flow,
                    source: PluginError::Timeout { timeout_ms },
                })
            }
        }
    }

    /// Run the request-flow stages
    pub async fn run_request(
        &self,
        mut request: HttpRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<RequestOutcome, PipelineError> {
        for plugin in &self.request_stages {
            let call = plugin.handle_request(request.clone());
            let Some(verdict) = self.run_stage(plugin, Flow::Request, call, cancel).await? else {
                continue;
            };

            if verdict.is_short_circuit() {
                info!(plugin = %plugin.name(), status = ?verdict.status_code, "Request short-circuited");
                return Ok(RequestOutcome::ShortCircuit(verdict.into_response()));
            }
            request.apply(verdict);
        }

        Ok(RequestOutcome::Forward(request))
    }

    /// Run the response-flow stages
    pub async fn run_response(
        &self,
        mut response: HttpResponse,
        cancel: &CancellationToken,
    ) -> std::result::Result<HttpResponse, PipelineError> {
        for plugin in &self.response_stages {
            let call = plugin.handle_response(response.clone());
            let verdict = match self.run_stage(plugin, Flow::Response, call, cancel).await {
                Ok(Some(verdict)) => verdict,
                Ok(None) => continue,
                Err(PipelineError::Stage { plugin, source, .. })
                    if self.options.response_failure_policy
                        == ResponseFailurePolicy::ReturnUpstream =>
                {
                    warn!(
                        plugin = %plugin,
                        error = %source,
                        "Response stage failed, returning response mediated so far"
                    );
                    return Ok(response);
                }
                Err(e) => return Err(e),
            };

            if verdict.is_short_circuit() {
                info!(plugin = %plugin.name(), status = ?verdict.status_code, "Response short-circuited");
                return Ok(verdict.into_response_or(response.status_code));
            }
            response.apply(verdict);
        }

        Ok(response)
    }

    /// Mediate a whole transaction: request stages, upstream, response stages.
    pub async fn execute(
        &self,
        request: HttpRequest,
        upstream: &dyn Upstream,
        cancel: &CancellationToken,
    ) -> std::result::Result<HttpResponse, PipelineError> {
        let span = tracing::info_span!(
            "transaction",
            id = %Uuid::new_v4(),
            method = %request.method,
            path = %request.path,
        );

        async move {
            let request = match self.run_request(request, cancel).await? {
                RequestOutcome::Forward(request) => request,
                RequestOutcome::ShortCircuit(response) => return Ok(response),
            };

            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                response = upstream.forward(request) => response.map_err(|e| {
                    error!(error = %e, "Upstream call failed");
                    PipelineError::Upstream(e)
                })?,
            };

            let response = self.run_response(response, cancel).await?;
            debug!(status = response.status_code, "Transaction complete");
            Ok(response)
        }
        .instrument(span)
        .await
    }
}
