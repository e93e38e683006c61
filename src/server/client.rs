//! Host-side handle to a plugin served in another process
//!
//! [`RemotePlugin`] implements [`Plugin`] by sending each call over the
//! connection and waiting for the matching reply. Calls are multiplexed, so
//! concurrent transactions share one connection. Dropping an outstanding
//! call's future sends a cancel frame for it.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PluginError, Result, TransportError};
use crate::plugin::contract::Plugin;
use crate::plugin::schema::{
    Capabilities, HttpRequest, HttpResponse, Metadata, PluginConfig, Verdict,
};
use crate::server::listener::{self, Endpoint};
use crate::server::wire::{self, Call, Frame, Payload, Reply, MAX_FRAME_BYTES};

type PendingCalls = DashMap<u64, oneshot::Sender<Reply>>;

pub struct RemotePlugin {
    endpoint: Endpoint,
    next_id: AtomicU64,
    pending: Arc<PendingCalls>,
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl RemotePlugin {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = listener::connect(endpoint).await?;
        debug!(endpoint = %endpoint, "Connected to plugin");

        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
        let (mut sink, mut frames) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let pending: Arc<PendingCalls> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        // Writer
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let line = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        line = outbound_rx.recv() => match line {
                            Some(line) => line,
                            None => break,
                        },
                    };
                    if let Err(e) = sink.send(line).await {
                        debug!("Failed to write frame: {}", e);
                        break;
                    }
                }
                let _ = sink.close().await;
            });
        }

        // Reader
        {
            let pending = pending.clone();
            let closed = closed.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let frame = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        frame = frames.next() => frame,
                    };

                    let line = match frame {
                        Some(Ok(line)) => line,
                        Some(Err(e)) => {
                            warn!("Plugin connection failed: {}", e);
                            break;
                        }
                        None => {
                            debug!("Plugin closed the connection");
                            break;
                        }
                    };

                    if line.trim().is_empty() {
                        continue;
                    }

                    match wire::decode::<Reply>(&line) {
                        Ok(reply) => match pending.remove(&reply.id) {
                            Some((_, waiter)) => {
                                let _ = waiter.send(reply);
                            }
                            // Reply to a call we already gave up on
                            None => debug!(id = reply.id, "Discarding unmatched reply"),
                        },
                        Err(e) => warn!("Ignoring undecodable reply: {}", e),
                    }
                }

                // Outstanding callers observe a closed transport
                closed.store(true, Ordering::SeqCst);
                pending.clear();
                shutdown.cancel();
            });
        }

        Ok(Self {
            endpoint: endpoint.clone(),
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            closed,
            shutdown,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop the connection. Outstanding calls fail with a transport error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        self.pending.clear();
    }

    async fn call(&self, call: Call) -> Result<Payload> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = call.method();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        // The reader may have shut down between the check above and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(TransportError::Closed.into());
        }

        let line = wire::encode(&Frame::Call { id, call })?;
        if self.outbound.send(line).is_err() {
            self.pending.remove(&id);
            return Err(TransportError::SendFailed(format!("{method}: connection closed")).into());
        }

        let guard = CancelOnDrop {
            id,
            client: self,
            armed: true,
        };
        let reply = rx.await.map_err(|_| TransportError::Closed)?;
        guard.disarm();

        reply.into_result()
    }
}

impl Drop for RemotePlugin {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Sends a cancel frame if the waiting future is dropped before its reply
struct CancelOnDrop<'a> {
    id: u64,
    client: &'a RemotePlugin,
    armed: bool,
}

impl CancelOnDrop<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.client.pending.remove(&self.id);
        if let Ok(line) = wire::encode(&Frame::Cancel { id: self.id }) {
            let _ = self.client.outbound.send(line);
        }
    }
}

fn unexpected(method: &'static str) -> PluginError {
    TransportError::UnexpectedReply { method }.into()
}

fn expect_empty(payload: Payload, method: &'static str) -> Result<()> {
    match payload {
        Payload::Empty => Ok(()),
        _ => Err(unexpected(method)),
    }
}

fn expect_verdict(payload: Payload, method: &'static str) -> Result<Verdict> {
    match payload {
        Payload::Verdict(verdict) => Ok(verdict),
        _ => Err(unexpected(method)),
    }
}

#[async_trait]
impl Plugin for RemotePlugin {
    async fn get_metadata(&self) -> Result<Metadata> {
        match self.call(Call::GetMetadata).await? {
            Payload::Metadata(metadata) => Ok(metadata),
            _ => Err(unexpected("getMetadata")),
        }
    }

    async fn get_capabilities(&self) -> Result<Capabilities> {
        match self.call(Call::GetCapabilities).await? {
            Payload::Capabilities(capabilities) => Ok(capabilities),
            _ => Err(unexpected("getCapabilities")),
        }
    }

    async fn configure(&self, config: PluginConfig) -> Result<()> {
        expect_empty(self.call(Call::Configure(config)).await?, "configure")
    }

    async fn check_health(&self) -> Result<()> {
        expect_empty(self.call(Call::CheckHealth).await?, "checkHealth")
    }

    async fn check_ready(&self) -> Result<()> {
        expect_empty(self.call(Call::CheckReady).await?, "checkReady")
    }

    async fn handle_request(&self, request: HttpRequest) -> Result<Verdict> {
        expect_verdict(
            self.call(Call::HandleRequest(request)).await?,
            "handleRequest",
        )
    }

    async fn handle_response(&self, response: HttpResponse) -> Result<Verdict> {
        expect_verdict(
            self.call(Call::HandleResponse(response)).await?,
            "handleResponse",
        )
    }

    async fn stop(&self) -> Result<()> {
        expect_empty(self.call(Call::Stop).await?, "stop")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::DefaultPlugin;
    use crate::server::serve::PluginServer;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = RemotePlugin::connect(&Endpoint::tcp(format!("127.0.0.1:{port}"))).await;
        assert!(matches!(
            result,
            Err(PluginError::Transport(TransportError::ConnectionFailed(_)))
        ));
    }

    #[tokio::test]
    async fn test_default_plugin_over_tcp() {
        let server = PluginServer::new(Arc::new(DefaultPlugin), Endpoint::tcp("127.0.0.1:0"))
            .bind()
            .await
            .unwrap();
        let endpoint = server.endpoint().clone();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));

        let remote = RemotePlugin::connect(&endpoint).await.unwrap();
        assert!(remote.get_metadata().await.unwrap().name.is_empty());
        assert!(remote.get_capabilities().await.unwrap().is_empty());
        remote.configure(PluginConfig::new()).await.unwrap();
        remote.check_ready().await.unwrap();

        remote.close();
        assert!(matches!(
            remote.check_health().await,
            Err(PluginError::Transport(TransportError::Closed))
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
