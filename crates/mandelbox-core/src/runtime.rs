//! Container runtime collaborator.
//!
//! The host never talks to a container engine directly; it goes through
//! [`ContainerRuntime`], which covers the handful of calls the lifecycle
//! engine needs plus the runtime's event feed. [`MockRuntime`] is an
//! in-memory implementation for tests and local development.

use crate::error::{CoreError, Result};
use crate::gpu::GpuIndex;
use crate::mandelbox::MandelboxId;
use crate::params;
use crate::ports::PortBinding;
use crate::tty::Tty;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Capacity of the mock runtime's event channels.
const EVENT_BUFFER: usize = 64;

/// Identifier the container runtime assigned to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RuntimeId(String);

impl RuntimeId {
    /// Wrap a runtime-assigned container id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RuntimeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the runtime needs to create a mandelbox container.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSpec {
    pub mandelbox_id: MandelboxId,
    pub app_name: String,
    pub image: String,
    pub port_bindings: Vec<PortBinding>,
    pub tty: Tty,
    pub gpu: Option<GpuIndex>,
    /// Device nodes to expose inside the container.
    pub devices: Vec<PathBuf>,
    /// Host directory shared with the container.
    pub mandelbox_dir: PathBuf,
    pub env: Vec<String>,
}

/// Kind of a container lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEventKind {
    Create,
    Start,
    Die,
    Destroy,
    Other(String),
}

impl ContainerEventKind {
    /// Parse a runtime action name such as `"die"`.
    pub fn parse(action: &str) -> Self {
        match action {
            "create" => Self::Create,
            "start" => Self::Start,
            "die" => Self::Die,
            "destroy" => Self::Destroy,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One event from the runtime's event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub runtime_id: RuntimeId,
    pub kind: ContainerEventKind,
}

impl ContainerEvent {
    /// Shorthand for a "die" event.
    pub fn die(runtime_id: RuntimeId) -> Self {
        Self {
            runtime_id,
            kind: ContainerEventKind::Die,
        }
    }
}

/// Errors reported on the runtime's error feed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeStreamError {
    /// The runtime daemon is unreachable
    #[error("cannot connect to the container runtime: {0}")]
    CannotConnect(String),

    /// The subscription was cancelled on purpose
    #[error("event subscription cancelled")]
    Cancelled,

    /// Anything else
    #[error("runtime stream error: {0}")]
    Other(String),
}

/// Live subscription to the runtime's event and error feeds.
///
/// A `None` on the error feed is a spurious wakeup and carries no error.
/// Either channel closing means the subscription is exhausted.
#[derive(Debug)]
pub struct RuntimeEvents {
    pub events: mpsc::Receiver<ContainerEvent>,
    pub errors: mpsc::Receiver<Option<RuntimeStreamError>>,
}

/// Container runtime used to run mandelboxes.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<RuntimeId>;

    /// Start a created container.
    async fn start_container(&self, id: &RuntimeId) -> Result<()>;

    /// Stop and remove a container.
    async fn remove_container(&self, id: &RuntimeId, timeout: Duration) -> Result<()>;

    /// Subscribe to lifecycle events.
    async fn subscribe(&self) -> Result<RuntimeEvents>;

    /// Restart the runtime daemon after it became unreachable.
    async fn restart(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    running: bool,
}

type Subscriber = (
    mpsc::Sender<ContainerEvent>,
    mpsc::Sender<Option<RuntimeStreamError>>,
);

/// In-memory container runtime.
///
/// Starting a container writes its readiness marker, so spin-ups against
/// the mock complete without a real container.
#[derive(Debug, Default)]
pub struct MockRuntime {
    containers: RwLock<HashMap<RuntimeId, MockContainer>>,
    subscriber: StdMutex<Option<Subscriber>>,
    next_id: AtomicU64,
    subscriptions: AtomicU64,
    restarts: AtomicU64,
    fail_create: AtomicBool,
    fail_restart: AtomicBool,
    skip_ready_marker: AtomicBool,
}

impl MockRuntime {
    /// Create an empty mock runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_container` fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `restart` fail.
    pub fn set_fail_restart(&self, fail: bool) {
        self.fail_restart.store(fail, Ordering::SeqCst);
    }

    /// Do not write readiness markers on start (simulates a hung container).
    pub fn set_skip_ready_marker(&self, skip: bool) {
        self.skip_ready_marker.store(skip, Ordering::SeqCst);
    }

    /// Number of times `subscribe` was called.
    pub fn subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of times `restart` was called.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Number of containers currently known to the runtime.
    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }

    /// Whether `id` exists and is running.
    pub async fn is_running(&self, id: &RuntimeId) -> bool {
        self.containers
            .read()
            .await
            .get(id)
            .is_some_and(|c| c.running)
    }

    /// The `ContainerSpec` the container `id` was created with.
    pub async fn spec(&self, id: &RuntimeId) -> Option<ContainerSpec> {
        self.containers.read().await.get(id).map(|c| c.spec.clone())
    }

    fn subscriber(&self) -> Option<Subscriber> {
        self.subscriber
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Push an event to the current subscriber.
    pub async fn emit(&self, event: ContainerEvent) {
        if let Some((events, _)) = self.subscriber() {
            let _ = events.send(event).await;
        }
    }

    /// Push an entry onto the current subscriber's error feed.
    pub async fn emit_error(&self, error: Option<RuntimeStreamError>) {
        if let Some((_, errors)) = self.subscriber() {
            let _ = errors.send(error).await;
        }
    }

    /// Simulate a container exiting on its own: mark it stopped and emit a
    /// "die" event.
    pub async fn kill(&self, id: &RuntimeId) {
        if let Some(container) = self.containers.write().await.get_mut(id) {
            container.running = false;
        }
        self.emit(ContainerEvent::die(id.clone())).await;
    }

    /// Drop the current subscription, closing both feeds.
    pub fn close_streams(&self) {
        self.subscriber
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<RuntimeId> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CoreError::external("runtime", "mock create failure"));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = RuntimeId::new(format!("mock-{n:012x}"));
        self.containers.write().await.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        self.emit(ContainerEvent {
            runtime_id: id.clone(),
            kind: ContainerEventKind::Create,
        })
        .await;
        Ok(id)
    }

    async fn start_container(&self, id: &RuntimeId) -> Result<()> {
        let mandelbox_dir = {
            let mut containers = self.containers.write().await;
            let container = containers
                .get_mut(id)
                .ok_or_else(|| CoreError::external("runtime", format!("no such container {id}")))?;
            container.running = true;
            container.spec.mandelbox_dir.clone()
        };

        if !self.skip_ready_marker.load(Ordering::SeqCst) {
            let marker = params::ready_marker_path(&mandelbox_dir);
            if let Some(parent) = marker.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&marker, b"").await?;
        }
        self.emit(ContainerEvent {
            runtime_id: id.clone(),
            kind: ContainerEventKind::Start,
        })
        .await;
        Ok(())
    }

    async fn remove_container(&self, id: &RuntimeId, _timeout: Duration) -> Result<()> {
        self.containers
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CoreError::external("runtime", format!("no such container {id}")))
    }

    async fn subscribe(&self) -> Result<RuntimeEvents> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (error_tx, error_rx) = mpsc::channel(EVENT_BUFFER);
        *self
            .subscriber
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some((event_tx, error_tx));
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(RuntimeEvents {
            events: event_rx,
            errors: error_rx,
        })
    }

    async fn restart(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.fail_restart.load(Ordering::SeqCst) {
            return Err(CoreError::external("runtime", "mock restart failure"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::TransportProtocol;

    fn spec(dir: &std::path::Path) -> ContainerSpec {
        ContainerSpec {
            mandelbox_id: MandelboxId::new(),
            app_name: "browsers/chrome".into(),
            image: "browsers/chrome:current-build".into(),
            port_bindings: vec![PortBinding::fixed(32262, 40000, TransportProtocol::Tcp)],
            tty: 12,
            gpu: Some(0),
            devices: vec![],
            mandelbox_dir: dir.to_path_buf(),
            env: vec![],
        }
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(ContainerEventKind::parse("die"), ContainerEventKind::Die);
        assert_eq!(
            ContainerEventKind::parse("oom"),
            ContainerEventKind::Other("oom".into())
        );
    }

    #[tokio::test]
    async fn test_mock_runtime_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        let mut feed = runtime.subscribe().await.unwrap();

        let id = runtime.create_container(&spec(dir.path())).await.unwrap();
        assert!(!id.is_empty());
        assert_eq!(feed.events.recv().await.unwrap().kind, ContainerEventKind::Create);

        runtime.start_container(&id).await.unwrap();
        assert!(runtime.is_running(&id).await);
        assert!(params::ready_marker_path(dir.path()).exists());

        runtime.kill(&id).await;
        assert_eq!(feed.events.recv().await.unwrap().kind, ContainerEventKind::Start);
        assert_eq!(feed.events.recv().await.unwrap(), ContainerEvent::die(id.clone()));

        runtime.remove_container(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(runtime.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_runtime_close_streams() {
        let runtime = MockRuntime::new();
        let mut feed = runtime.subscribe().await.unwrap();
        runtime.close_streams();
        assert!(feed.events.recv().await.is_none());
        assert!(feed.errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_runtime_create_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = MockRuntime::new();
        runtime.set_fail_create(true);
        let result = runtime.create_container(&spec(dir.path())).await;
        assert!(matches!(result, Err(CoreError::External { .. })));
    }
}
