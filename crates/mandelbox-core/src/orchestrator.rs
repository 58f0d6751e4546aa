//! Host event loop.
//!
//! The [`Orchestrator`] is the single task that ties the host together. It
//! waits on four sources at once:
//!
//! - the root cancellation token (host shutdown),
//! - a keepalive channel, whose closure tells the loop to exit,
//! - the container runtime's event and error feeds,
//! - the inbound [`HostRequest`] channel.
//!
//! Spin-up requests run on their own tracked tasks so a slow container
//! never blocks the loop; everything else is handled inline.
//!
//! # Example
//!
//! ```rust,ignore
//! let host = Host::new(HostConfig::default(), collaborators)?;
//! let (orchestrator, requests, keepalive) = Orchestrator::new(host.clone());
//! let handle = tokio::spawn(orchestrator.run());
//!
//! let result = requests.spin_up(request).await?;
//!
//! drop(keepalive);
//! handle.await??;
//! host.shutdown().await?;
//! ```

use crate::error::{CoreError, Result};
use crate::host::Host;
use crate::runtime::{ContainerEvent, ContainerEventKind, RuntimeEvents, RuntimeStreamError};
use crate::spinup::{self, SpinUpRequest, SpinUpResult};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Request handled by the event loop.
#[derive(Debug)]
pub enum HostRequest {
    /// Start a mandelbox.
    SpinUp {
        request: SpinUpRequest,
        respond_to: oneshot::Sender<Result<SpinUpResult>>,
    },
    /// Stop accepting work and shut the host down.
    DrainAndShutdown { respond_to: oneshot::Sender<Result<()>> },
}

/// Cloneable handle for sending requests to the event loop.
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: mpsc::Sender<HostRequest>,
}

impl RequestSender {
    /// Submit a spin-up request and wait for its result.
    pub async fn spin_up(&self, request: SpinUpRequest) -> Result<SpinUpResult> {
        let (respond_to, rx) = oneshot::channel();
        self.send(HostRequest::SpinUp { request, respond_to }).await?;
        rx.await.map_err(|_| CoreError::Cancelled)?
    }

    /// Ask the host to drain and shut down.
    pub async fn drain_and_shutdown(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.send(HostRequest::DrainAndShutdown { respond_to }).await?;
        rx.await.map_err(|_| CoreError::Cancelled)?
    }

    /// Submit a raw request.
    pub async fn send(&self, request: HostRequest) -> Result<()> {
        self.tx.send(request).await.map_err(|_| CoreError::Cancelled)
    }
}

/// Keeps the event loop alive. Dropping every clone stops it.
#[derive(Debug, Clone)]
pub struct KeepAlive(#[allow(dead_code)] mpsc::Sender<()>);

/// What to do about an entry on the runtime's error feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorAction {
    /// Spurious wakeup
    Ignore,
    /// Runtime unreachable: restart it and resubscribe
    RestartRuntime,
    /// Subscription cancelled on purpose: leave the loop cleanly
    Exit,
    /// Anything else: leave the loop with an error
    Fatal,
}

/// Classify an entry from the runtime's error feed.
pub fn classify_stream_error(error: Option<&RuntimeStreamError>) -> StreamErrorAction {
    match error {
        None => StreamErrorAction::Ignore,
        Some(RuntimeStreamError::CannotConnect(_)) => StreamErrorAction::RestartRuntime,
        Some(RuntimeStreamError::Cancelled) => StreamErrorAction::Exit,
        Some(RuntimeStreamError::Other(_)) => StreamErrorAction::Fatal,
    }
}

/// Single dispatch loop of the host.
pub struct Orchestrator {
    host: Arc<Host>,
    requests: mpsc::Receiver<HostRequest>,
    keepalive: mpsc::Receiver<()>,
}

impl Orchestrator {
    /// Create the loop and the handles that feed it.
    pub fn new(host: Arc<Host>) -> (Self, RequestSender, KeepAlive) {
        let (request_tx, requests) = mpsc::channel(host.config().request_buffer);
        let (keepalive_tx, keepalive) = mpsc::channel(1);
        (
            Self {
                host,
                requests,
                keepalive,
            },
            RequestSender { tx: request_tx },
            KeepAlive(keepalive_tx),
        )
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Run until shutdown.
    ///
    /// Returns an error if the runtime's feeds fail irrecoverably; the caller
    /// is expected to shut the host down either way.
    pub async fn run(mut self) -> Result<()> {
        let root = self.host.root_token().clone();
        let mut feed = self.host.runtime().subscribe().await?;
        tracing::info!("Orchestrator started");

        loop {
            tokio::select! {
                biased;

                _ = root.cancelled() => {
                    tracing::info!("Host cancelled, leaving event loop");
                    return Ok(());
                }

                _ = self.keepalive.recv() => {
                    tracing::info!("Keepalive dropped, leaving event loop");
                    return Ok(());
                }

                error = feed.errors.recv() => {
                    let Some(error) = error else {
                        tracing::error!("Runtime error feed closed");
                        return Err(CoreError::external("runtime", "error stream closed"));
                    };
                    match classify_stream_error(error.as_ref()) {
                        StreamErrorAction::Ignore => {}
                        StreamErrorAction::RestartRuntime => {
                            tracing::warn!(error = ?error, "Lost container runtime, restarting it");
                            feed = Self::reconnect(&self.host).await?;
                        }
                        StreamErrorAction::Exit => {
                            tracing::info!("Runtime subscription cancelled, leaving event loop");
                            return Ok(());
                        }
                        StreamErrorAction::Fatal => {
                            let message = error.map(|e| e.to_string()).unwrap_or_default();
                            tracing::error!(error = %message, "Unrecoverable runtime stream error");
                            return Err(CoreError::external("runtime", message));
                        }
                    }
                }

                event = feed.events.recv() => {
                    let Some(event) = event else {
                        tracing::error!("Runtime event feed closed");
                        return Err(CoreError::external("runtime", "event stream closed"));
                    };
                    Self::handle_event(&self.host, event).await;
                }

                request = self.requests.recv() => {
                    let Some(request) = request else {
                        tracing::info!("Request channel closed, leaving event loop");
                        return Ok(());
                    };
                    if self.handle_request(request) {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn reconnect(host: &Host) -> Result<RuntimeEvents> {
        host.runtime().restart().await?;
        let feed = host.runtime().subscribe().await?;
        tracing::info!("Resubscribed to container runtime");
        Ok(feed)
    }

    async fn handle_event(host: &Host, event: ContainerEvent) {
        match event.kind {
            ContainerEventKind::Die => {
                match host.registry().get_by_runtime_id(&event.runtime_id).await {
                    Some(mandelbox) => {
                        tracing::info!(
                            mandelbox_id = %mandelbox.id(),
                            runtime_id = %event.runtime_id,
                            "Container died"
                        );
                        mandelbox.close();
                    }
                    None => {
                        tracing::debug!(runtime_id = %event.runtime_id, "Die event for unknown container")
                    }
                }
            }
            kind => {
                tracing::debug!(runtime_id = %event.runtime_id, kind = ?kind, "Container event")
            }
        }
    }

    /// Handle one request. Returns true if the loop should exit.
    fn handle_request(&self, request: HostRequest) -> bool {
        match request {
            HostRequest::SpinUp { request, respond_to } => {
                let host = Arc::clone(&self.host);
                self.host.tracker().spawn(async move {
                    let result = spinup::spin_up(&host, request).await;
                    let _ = respond_to.send(result);
                });
                false
            }
            HostRequest::DrainAndShutdown { respond_to } => {
                tracing::info!("Received drain and shutdown request");
                self.host.start_draining();
                let _ = respond_to.send(Ok(()));
                self.host.root_token().cancel();
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_stream_error() {
        assert_eq!(classify_stream_error(None), StreamErrorAction::Ignore);
        assert_eq!(
            classify_stream_error(Some(&RuntimeStreamError::CannotConnect("refused".into()))),
            StreamErrorAction::RestartRuntime
        );
        assert_eq!(
            classify_stream_error(Some(&RuntimeStreamError::Cancelled)),
            StreamErrorAction::Exit
        );
        assert_eq!(
            classify_stream_error(Some(&RuntimeStreamError::Other("boom".into()))),
            StreamErrorAction::Fatal
        );
    }
}
