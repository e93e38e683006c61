//! Plugin-side serve loop
//!
//! Accepts host connections, decodes calls and dispatches each one on its
//! own task so that independent transactions never wait on each other.

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{PluginError, Result};
use crate::plugin::contract::Plugin;
use crate::server::listener::{BoxedStream, Endpoint, Listener};
use crate::server::wire::{self, Call, Frame, Payload, Reply, MAX_FRAME_BYTES};

/// First pause after a failed accept; doubles per consecutive failure
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Serves one plugin on one endpoint
pub struct PluginServer {
    plugin: Arc<dyn Plugin>,
    endpoint: Endpoint,
    grace_period: Duration,
}

impl PluginServer {
    pub fn new(plugin: Arc<dyn Plugin>, endpoint: Endpoint) -> Self {
        Self {
            plugin,
            endpoint,
            grace_period: Duration::from_secs(10),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Bind the listening endpoint
    pub async fn bind(self) -> Result<BoundServer> {
        let listener = Listener::bind(&self.endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        info!("Plugin server listening on {}", endpoint);

        Ok(BoundServer {
            plugin: self.plugin,
            listener,
            endpoint,
            grace_period: self.grace_period,
        })
    }
}

pub struct BoundServer {
    plugin: Arc<dyn Plugin>,
    listener: Listener,
    endpoint: Endpoint,
    grace_period: Duration,
}

impl BoundServer {
    /// Where hosts can connect; tcp port 0 is resolved
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Serve until `shutdown` fires, then stop accepting, let in-flight calls
    /// finish within the grace period and release the endpoint.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        // Fired only when the grace period runs out
        let abort = CancellationToken::new();
        let mut connection_id: u64 = 0;
        let mut accept_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_failures = 0;
                        connection_id += 1;
                        let span = tracing::debug_span!("connection", id = connection_id, peer = %peer);
                        tracker.spawn(
                            handle_connection(
                                stream,
                                self.plugin.clone(),
                                shutdown.clone(),
                                abort.clone(),
                                tracker.clone(),
                            )
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let backoff = accept_backoff(accept_failures);
                        error!(
                            backoff_ms = backoff.as_millis() as u64,
                            "Failed to accept connection: {}", e
                        );
                        // Errors like EMFILE repeat until something is released
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        info!("Shutting down gracefully...");
        tracker.close();

        if timeout(self.grace_period, tracker.wait()).await.is_err() {
            warn!(
                remaining = tracker.len(),
                grace_ms = self.grace_period.as_millis() as u64,
                "Grace period elapsed, abandoning in-flight calls"
            );
            abort.cancel();
            tracker.wait().await;
        }

        // Dropping the listener releases the endpoint and the socket file
        drop(self.listener);
        info!("Plugin server stopped");
        Ok(())
    }
}

fn accept_backoff(failures: u32) -> Duration {
    if failures <= 1 {
        return ACCEPT_BACKOFF_INITIAL;
    }
    let factor = 1u32 << (failures - 1).min(16);
    ACCEPT_BACKOFF_INITIAL
        .saturating_mul(factor)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn handle_connection(
    stream: BoxedStream,
    plugin: Arc<dyn Plugin>,
    shutdown: CancellationToken,
    abort: CancellationToken,
    tracker: TaskTracker,
) {
    debug!("Host connected");

    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
    let (mut sink, mut frames) = framed.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Reply>();

    // Single writer per connection; ends once every dispatch task has dropped
    // its sender.
    tracker.spawn(
        async move {
            while let Some(reply) = reply_rx.recv().await {
                let line = match wire::encode(&reply) {
                    Ok(line) => line,
                    Err(e) => {
                        error!(id = reply.id, "Failed to encode reply: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    debug!("Failed to write reply: {}", e);
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let pending: Arc<DashMap<u64, CancellationToken>> = Arc::new(DashMap::new());
    let calls = abort.child_token();

    loop {
        let frame = tokio::select! {
            // Stop reading new calls; in-flight ones keep running
            _ = shutdown.cancelled() => break,
            frame = frames.next() => frame,
        };

        let line = match frame {
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                warn!("Dropping connection after framing error: {}", e);
                calls.cancel();
                break;
            }
            None => {
                debug!("Host disconnected");
                // Nobody is left to read the replies
                calls.cancel();
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match wire::decode::<Frame>(&line) {
            Ok(Frame::Call { id, call }) => {
                let token = calls.child_token();
                pending.insert(id, token.clone());
                tracker.spawn(
                    dispatch(
                        id,
                        call,
                        plugin.clone(),
                        token,
                        reply_tx.clone(),
                        pending.clone(),
                    )
                    .in_current_span(),
                );
            }
            Ok(Frame::Cancel { id }) => {
                if let Some((_, token)) = pending.remove(&id) {
                    debug!(id, "Host cancelled call");
                    token.cancel();
                }
            }
            Err(e) => {
                warn!("Ignoring undecodable frame: {}", e);
            }
        }
    }
}

async fn dispatch(
    id: u64,
    call: Call,
    plugin: Arc<dyn Plugin>,
    cancel: CancellationToken,
    reply_tx: mpsc::UnboundedSender<Reply>,
    pending: Arc<DashMap<u64, CancellationToken>>,
) {
    let method = call.method();

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PluginError::Cancelled),
        result = execute(plugin.as_ref(), call) => result,
    };
    pending.remove(&id);

    match &result {
        Ok(_) => debug!(id, method, "Call completed"),
        Err(PluginError::Cancelled) => debug!(id, method, "Call abandoned"),
        Err(e) => debug!(id, method, error = %e, "Call failed"),
    }

    // The connection may already be gone
    let _ = reply_tx.send(Reply::from_result(id, result));
}

async fn execute(plugin: &dyn Plugin, call: Call) -> Result<Payload> {
    match call {
        Call::GetMetadata => plugin.get_metadata().await.map(Payload::Metadata),
        Call::GetCapabilities => plugin.get_capabilities().await.map(Payload::Capabilities),
        Call::Configure(config) => plugin.configure(config).await.map(|_| Payload::Empty),
        Call::CheckHealth => plugin.check_health().await.map(|_| Payload::Empty),
        Call::CheckReady => plugin.check_ready().await.map(|_| Payload::Empty),
        Call::HandleRequest(request) => plugin.handle_request(request).await.map(Payload::Verdict),
        Call::HandleResponse(response) => {
            plugin.handle_response(response).await.map(Payload::Verdict)
        }
        Call::Stop => plugin.stop().await.map(|_| Payload::Empty),
    }
}
