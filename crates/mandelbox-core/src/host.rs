//! Process-wide host state.
//!
//! [`Host`] bundles the configuration, the three allocators, the registry of
//! live mandelboxes and the external collaborators. It also owns the root
//! cancellation token every mandelbox token descends from and the task
//! tracker every spawned task is registered with, so shutdown can cancel
//! everything and then wait for it.

use crate::backup::{ConfigBackup, NoopBackup};
use crate::config::HostConfig;
use crate::error::{CoreError, Result};
use crate::gpu::GpuAllocator;
use crate::ports::PortAllocator;
use crate::registry::Registry;
use crate::runtime::{ContainerRuntime, MockRuntime};
use crate::store::{MandelboxStore, MemoryStore};
use crate::tty::TtyAllocator;
use mandelbox_input::testing::FakeInputProvider;
use mandelbox_input::InputDeviceProvider;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// External systems the host talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub store: Arc<dyn MandelboxStore>,
    pub backup: Arc<dyn ConfigBackup>,
    pub input: Arc<dyn InputDeviceProvider>,
}

impl Collaborators {
    /// In-process stand-ins for every collaborator: a [`MockRuntime`], a
    /// [`MemoryStore`], a [`NoopBackup`] and a [`FakeInputProvider`].
    pub fn in_memory() -> Self {
        Self {
            runtime: Arc::new(MockRuntime::new()),
            store: Arc::new(MemoryStore::new()),
            backup: Arc::new(NoopBackup::new()),
            input: Arc::new(FakeInputProvider::new()),
        }
    }
}

/// Shared state of the host service.
pub struct Host {
    config: HostConfig,
    ports: PortAllocator,
    ttys: TtyAllocator,
    gpus: GpuAllocator,
    registry: Registry,
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn MandelboxStore>,
    backup: Arc<dyn ConfigBackup>,
    input: Arc<dyn InputDeviceProvider>,
    root: CancellationToken,
    tracker: TaskTracker,
    draining: AtomicBool,
}

impl Host {
    /// Validate `config` and build the allocators.
    pub fn new(config: HostConfig, collaborators: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;
        let ports = PortAllocator::from_config(&config)?;
        let ttys = TtyAllocator::from_config(&config)?;
        let gpus = GpuAllocator::from_config(&config);

        tracing::info!(
            ports = %format!("[{}, {})", config.min_port, config.max_port),
            ttys = %format!("[{}, {})", config.min_tty, config.max_tty),
            gpus = config.gpu_count,
            max_per_gpu = config.max_mandelboxes_per_gpu,
            data_dir = %config.data_dir.display(),
            "Host initialized"
        );

        Ok(Arc::new(Self {
            config,
            ports,
            ttys,
            gpus,
            registry: Registry::new(),
            runtime: collaborators.runtime,
            store: collaborators.store,
            backup: collaborators.backup,
            input: collaborators.input,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            draining: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn ttys(&self) -> &TtyAllocator {
        &self.ttys
    }

    pub fn gpus(&self) -> &GpuAllocator {
        &self.gpus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn store(&self) -> &Arc<dyn MandelboxStore> {
        &self.store
    }

    pub fn backup(&self) -> &Arc<dyn ConfigBackup> {
        &self.backup
    }

    pub fn input(&self) -> &Arc<dyn InputDeviceProvider> {
        &self.input
    }

    /// Parent of every mandelbox token.
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Tracker of every creation, handoff and teardown task.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Stop accepting new mandelboxes.
    pub fn start_draining(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            tracing::info!("Host is draining");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Cancel every mandelbox and wait for all tracked tasks, bounded by
    /// the configured shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let start = Instant::now();
        let live = self.registry.len().await;
        tracing::info!(live_mandelboxes = live, "Shutting down host");

        self.root.cancel();
        self.tracker.close();

        let timeout = self.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::error!(
                pending_tasks = self.tracker.len(),
                "Timed out waiting for mandelbox teardown"
            );
            return Err(CoreError::Timeout(timeout));
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Host shut down"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("config", &self.config)
            .field("draining", &self.is_draining())
            .field("cancelled", &self.root.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandelbox::{Mandelbox, MandelboxId, MandelboxInfo};

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = HostConfig::default();
        config.allocation_attempts = 0;
        assert!(Host::new(config, Collaborators::in_memory()).is_err());
    }

    #[tokio::test]
    async fn test_draining_flag() {
        let host = Host::new(HostConfig::default(), Collaborators::in_memory()).unwrap();
        assert!(!host.is_draining());
        host.start_draining();
        host.start_draining();
        assert!(host.is_draining());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_every_mandelbox() {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::builder().data_dir(dir.path()).build().unwrap();
        let host = Host::new(config, Collaborators::in_memory()).unwrap();

        let mut boxes = Vec::new();
        for _ in 0..3 {
            let mb = Mandelbox::create(&host, MandelboxId::new(), MandelboxInfo::default())
                .await
                .unwrap();
            mb.assign_tty().await.unwrap();
            boxes.push(mb);
        }
        assert_eq!(host.registry().len().await, 3);

        host.shutdown().await.unwrap();
        assert!(host.registry().is_empty().await);
        assert!(boxes.iter().all(|mb| mb.is_removed()));
        assert_eq!(host.ttys().count_free(), 245);
    }
}
