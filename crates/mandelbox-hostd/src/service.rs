//! Wiring of the host service.
//!
//! [`HostService`] turns a [`HostdConfig`] into a running host: it checks
//! privileges, picks the collaborator implementations, builds the
//! [`Host`] and starts the orchestrator loop.

use crate::config::HostdConfig;
use crate::http::AppState;
use mandelbox_core::{
    Collaborators, CoreError, Host, KeepAlive, MemoryStore, MockRuntime, NoopBackup, Orchestrator,
    RequestSender,
};
use mandelbox_input::testing::FakeInputProvider;
use mandelbox_input::{InputDeviceProvider, UinputProvider};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Errors that stop the host service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service needs root for uinput and container management
    #[error("must run as root (effective uid {euid})")]
    NotRoot { euid: u32 },

    #[error(transparent)]
    Core(#[from] CoreError),

    /// The orchestrator task panicked
    #[error("orchestrator task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fail unless the process runs as root (when `require_root` is set).
pub fn check_privileges(require_root: bool) -> Result<(), ServiceError> {
    let euid = nix::unistd::geteuid();
    if require_root && !euid.is_root() {
        return Err(ServiceError::NotRoot {
            euid: euid.as_raw(),
        });
    }
    Ok(())
}

/// Pick the collaborator implementations for `config`.
pub fn collaborators(config: &HostdConfig) -> Collaborators {
    let input: Arc<dyn InputDeviceProvider> = if config.fake_input {
        tracing::warn!("Using fake input devices");
        Arc::new(FakeInputProvider::new())
    } else {
        Arc::new(UinputProvider::new())
    };

    // The container runtime, database and config storage clients live
    // outside this service; until one is plugged in, run against the
    // in-process implementations.
    tracing::warn!("No container runtime client configured, using the in-memory runtime");
    Collaborators {
        runtime: Arc::new(MockRuntime::new()),
        store: Arc::new(MemoryStore::new()),
        backup: Arc::new(NoopBackup::new()),
        input,
    }
}

/// A running host: shared state plus the orchestrator task.
pub struct HostService {
    host: Arc<Host>,
    requests: RequestSender,
    keepalive: Option<KeepAlive>,
    orchestrator: Option<JoinHandle<mandelbox_core::Result<()>>>,
}

impl HostService {
    /// Check privileges, build the host and start the orchestrator.
    pub async fn start(config: &HostdConfig) -> Result<Self, ServiceError> {
        Self::start_with(config, collaborators(config)).await
    }

    /// Like [`HostService::start`], with explicit collaborators.
    pub async fn start_with(
        config: &HostdConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ServiceError> {
        check_privileges(config.require_root)?;

        let host_config = config.host_config()?;
        tokio::fs::create_dir_all(&host_config.data_dir).await?;

        let host = Host::new(host_config, collaborators)?;
        let (orchestrator, requests, keepalive) = Orchestrator::new(host.clone());
        let orchestrator = tokio::spawn(orchestrator.run());

        Ok(Self {
            host,
            requests,
            keepalive: Some(keepalive),
            orchestrator: Some(orchestrator),
        })
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn requests(&self) -> &RequestSender {
        &self.requests
    }

    /// State for the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState {
            host: self.host.clone(),
            requests: self.requests.clone(),
        }
    }

    /// Wait for the orchestrator loop to exit (drain request, fatal runtime
    /// error or host cancellation).
    pub async fn wait(&mut self) -> Result<(), ServiceError> {
        match self.orchestrator.as_mut() {
            Some(handle) => {
                let result = handle.await;
                self.orchestrator = None;
                Ok(result??)
            }
            None => std::future::pending().await,
        }
    }

    /// Stop the loop, tear down every mandelbox and wait for it.
    pub async fn shutdown(mut self) -> Result<(), ServiceError> {
        drop(self.keepalive.take());
        self.host.root_token().cancel();

        let loop_result = match self.orchestrator.take() {
            Some(handle) => handle.await.map_err(ServiceError::from).and_then(|r| Ok(r?)),
            None => Ok(()),
        };
        if let Err(e) = &loop_result {
            tracing::error!(error = %e, "Orchestrator exited with an error");
        }

        self.host.shutdown().await?;
        loop_result
    }
}
