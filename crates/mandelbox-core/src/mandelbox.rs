//! Mandelbox lifecycle.
//!
//! A [`Mandelbox`] owns every host resource handed to one container: port
//! bindings, a TTY, a GPU slot and a set of virtual input devices. Setup
//! code fills these in one at a time through the `assign_*` methods; nothing
//! ever releases them except the mandelbox's teardown task.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──assign_*──> Registered ──mark_ready──> Ready
//!    │                      │                        │
//!    └──────────────────────┴────── close() ─────────┘
//!                                     │
//!                                   Dying ──teardown──> Removed
//! ```
//!
//! [`Mandelbox::create`] spawns exactly one teardown task, which sleeps on
//! the mandelbox's cancellation token. Cancelling the token (an explicit
//! [`Mandelbox::close`], a "die" event from the runtime, or host shutdown
//! cancelling the root token) wakes it. Teardown first flags the mandelbox
//! as closing under the same lock the `assign_*` methods take, so a setup
//! step racing with teardown either lands before it (and gets released) or
//! fails with [`CoreError::Cancelled`].

use crate::backup::BackupRequest;
use crate::error::{CoreError, Result};
use crate::gpu::GpuIndex;
use crate::host::Host;
use crate::params;
use crate::ports::PortBinding;
use crate::runtime::RuntimeId;
use crate::store::{MandelboxRecord, MandelboxStatus};
use crate::tty::Tty;
use chrono::{DateTime, Utc};
use mandelbox_input::{DevicePaths, DeviceSet, InputError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Grace period the runtime gets to stop a container before killing it.
const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier of a mandelbox, chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MandelboxId(Uuid);

impl MandelboxId {
    /// Generate a random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MandelboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MandelboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for MandelboxId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::InvalidArgument(format!("invalid mandelbox id {s:?}: {e}")))
    }
}

impl fmt::Display for MandelboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Coarse lifecycle stage, derived from which fields are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MandelboxStage {
    Created,
    Registered,
    Ready,
    Dying,
    Removed,
}

impl fmt::Display for MandelboxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Registered => "registered",
            Self::Ready => "ready",
            Self::Dying => "dying",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// Client-supplied details of a new mandelbox.
#[derive(Debug, Clone, Default)]
pub struct MandelboxInfo {
    /// Application the client asked for.
    pub app_name: String,
    pub user_id: String,
    /// Token the user's configuration is encrypted with.
    pub config_token: String,
    /// Access token the client authenticated with.
    pub access_token: String,
}

#[derive(Debug, Default)]
struct MandelboxState {
    app_name: String,
    user_id: String,
    config_token: String,
    access_token: String,
    runtime_id: Option<RuntimeId>,
    port_bindings: Vec<PortBinding>,
    tty: Option<Tty>,
    gpu: Option<GpuIndex>,
    devices: Option<Arc<DeviceSet>>,
    device_paths: Option<DevicePaths>,
    handoff: Option<JoinHandle<()>>,
    ready: bool,
    closing: bool,
}

impl MandelboxState {
    fn ensure_open(&self) -> Result<()> {
        if self.closing {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One running (or starting, or dying) mandelbox.
pub struct Mandelbox {
    id: MandelboxId,
    created_at: DateTime<Utc>,
    host: Arc<Host>,
    /// Cancelled to start teardown.
    token: CancellationToken,
    /// Cancelled once teardown has finished.
    removed: CancellationToken,
    state: RwLock<MandelboxState>,
}

impl fmt::Debug for Mandelbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mandelbox")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Mandelbox {
    /// Create a mandelbox, track it in the host's registry, persist its
    /// `Allocated` row and arm its teardown task.
    pub async fn create(host: &Arc<Host>, id: MandelboxId, info: MandelboxInfo) -> Result<Arc<Self>> {
        let mandelbox = Arc::new(Self {
            id,
            created_at: Utc::now(),
            host: Arc::clone(host),
            token: host.root_token().child_token(),
            removed: CancellationToken::new(),
            state: RwLock::new(MandelboxState {
                app_name: info.app_name,
                user_id: info.user_id,
                config_token: info.config_token,
                access_token: info.access_token,
                ..Default::default()
            }),
        });

        host.registry().insert(Arc::clone(&mandelbox)).await?;
        if let Err(e) = mandelbox.write_status(MandelboxStatus::Allocated).await {
            host.registry().remove(id).await;
            return Err(e);
        }

        let teardown = Arc::clone(&mandelbox);
        host.tracker().spawn(async move {
            teardown.token.cancelled().await;
            teardown.teardown().await;
        });

        tracing::info!(mandelbox_id = %id, "Created mandelbox");
        Ok(mandelbox)
    }

    pub fn id(&self) -> MandelboxId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Token cancelled when the mandelbox starts dying.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Scratch directory shared with the container.
    pub fn mandelbox_dir(&self) -> PathBuf {
        self.host.config().mandelbox_dir(&self.id.to_string())
    }

    pub async fn app_name(&self) -> String {
        self.state.read().await.app_name.clone()
    }

    pub async fn user_id(&self) -> String {
        self.state.read().await.user_id.clone()
    }

    /// Access token the client presented at creation.
    pub async fn access_token(&self) -> String {
        self.state.read().await.access_token.clone()
    }

    pub async fn runtime_id(&self) -> Option<RuntimeId> {
        self.state.read().await.runtime_id.clone()
    }

    pub async fn port_bindings(&self) -> Vec<PortBinding> {
        self.state.read().await.port_bindings.clone()
    }

    pub async fn tty(&self) -> Option<Tty> {
        self.state.read().await.tty
    }

    pub async fn gpu(&self) -> Option<GpuIndex> {
        self.state.read().await.gpu
    }

    pub async fn device_paths(&self) -> Option<DevicePaths> {
        self.state.read().await.device_paths.clone()
    }

    /// Current lifecycle stage.
    pub async fn stage(&self) -> MandelboxStage {
        if self.removed.is_cancelled() {
            return MandelboxStage::Removed;
        }
        let state = self.state.read().await;
        if state.closing || self.token.is_cancelled() {
            MandelboxStage::Dying
        } else if state.ready {
            MandelboxStage::Ready
        } else if state.runtime_id.is_some() {
            MandelboxStage::Registered
        } else {
            MandelboxStage::Created
        }
    }

    /// Allocate host ports for `requests`.
    pub async fn assign_port_bindings(&self, requests: &[PortBinding]) -> Result<Vec<PortBinding>> {
        let mut state = self.state.write().await;
        state.ensure_open()?;
        if !state.port_bindings.is_empty() {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {} already has port bindings",
                self.id
            )));
        }
        let bindings = self.host.ports().allocate(requests)?;
        state.port_bindings = bindings.clone();
        tracing::debug!(mandelbox_id = %self.id, count = bindings.len(), "Assigned port bindings");
        Ok(bindings)
    }

    pub async fn assign_tty(&self) -> Result<Tty> {
        let mut state = self.state.write().await;
        state.ensure_open()?;
        if let Some(tty) = state.tty {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {} already has TTY {tty}",
                self.id
            )));
        }
        let tty = self.host.ttys().allocate()?;
        state.tty = Some(tty);
        Ok(tty)
    }

    pub async fn assign_gpu(&self) -> Result<GpuIndex> {
        let mut state = self.state.write().await;
        state.ensure_open()?;
        let gpu = self.host.gpus().allocate(self.id)?;
        state.gpu = Some(gpu);
        Ok(gpu)
    }

    /// Create this mandelbox's virtual input devices.
    pub async fn assign_input_devices(&self) -> Result<DevicePaths> {
        let mut state = self.state.write().await;
        state.ensure_open()?;
        if state.devices.is_some() {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {} already has input devices",
                self.id
            )));
        }

        // Device creation polls sysfs for the event node, so keep it off the
        // async workers.
        let provider = Arc::clone(self.host.input());
        let devices = tokio::task::spawn_blocking(move || provider.allocate())
            .await
            .map_err(|e| CoreError::external("input", e.to_string()))??;

        let paths = devices.paths();
        state.devices = Some(Arc::new(devices));
        state.device_paths = Some(paths.clone());
        tracing::debug!(mandelbox_id = %self.id, ?paths, "Assigned input devices");
        Ok(paths)
    }

    /// Record the runtime's container id for this mandelbox.
    ///
    /// May be called once. The id is also indexed in the registry so that
    /// runtime events can be routed back here.
    pub async fn register_creation(&self, runtime_id: RuntimeId, app_name: &str) -> Result<()> {
        if runtime_id.is_empty() {
            return Err(CoreError::InvalidArgument("empty runtime id".into()));
        }
        if app_name.is_empty() {
            return Err(CoreError::InvalidArgument("empty app name".into()));
        }

        let mut state = self.state.write().await;
        state.ensure_open()?;
        if let Some(existing) = &state.runtime_id {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {} is already registered as {existing}",
                self.id
            )));
        }
        self.host
            .registry()
            .index_runtime_id(self.id, runtime_id.clone())
            .await?;
        tracing::info!(mandelbox_id = %self.id, runtime_id = %runtime_id, app_name, "Registered container");
        state.runtime_id = Some(runtime_id);
        state.app_name = app_name.to_string();
        Ok(())
    }

    /// Serve the input device descriptors on `socket_path` until the
    /// container picks them up or the mandelbox dies.
    pub async fn start_input_handoff(&self, socket_path: PathBuf) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_open()?;
        if state.handoff.is_some() {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {} already started its input handoff",
                self.id
            )));
        }
        let devices = state
            .devices
            .clone()
            .ok_or_else(|| CoreError::NotAllocated(format!("mandelbox {} has no input devices", self.id)))?;

        let id = self.id;
        let token = self.token.clone();
        let handle = self.host.tracker().spawn(async move {
            match mandelbox_input::send_device_fds_over_socket(&token, &devices, &socket_path).await {
                Ok(()) => tracing::info!(mandelbox_id = %id, "Handed input devices to container"),
                Err(InputError::Cancelled) => {
                    tracing::debug!(mandelbox_id = %id, "Input handoff cancelled")
                }
                Err(e) => tracing::warn!(mandelbox_id = %id, error = %e, "Input handoff failed"),
            }
        });
        state.handoff = Some(handle);
        Ok(())
    }

    /// Mark the mandelbox ready and persist its `Running` row.
    pub async fn mark_ready(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_open()?;
        state.ready = true;
        // The row is written under the lock so teardown's `Dying` always
        // lands after it.
        self.host
            .store()
            .write_status(&self.record(&state, MandelboxStatus::Running))
            .await
    }

    /// Start teardown. Calling this more than once is harmless.
    pub fn close(&self) {
        if !self.token.is_cancelled() {
            tracing::debug!(mandelbox_id = %self.id, "Closing mandelbox");
        }
        self.token.cancel();
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        self.removed.cancelled().await
    }

    /// Whether teardown has finished.
    pub fn is_removed(&self) -> bool {
        self.removed.is_cancelled()
    }

    fn record(&self, state: &MandelboxState, status: MandelboxStatus) -> MandelboxRecord {
        MandelboxRecord {
            id: self.id,
            app_name: state.app_name.clone(),
            user_id: state.user_id.clone(),
            status,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    async fn write_status(&self, status: MandelboxStatus) -> Result<()> {
        let record = {
            let state = self.state.read().await;
            self.record(&state, status)
        };
        self.host.store().write_status(&record).await
    }

    /// Release everything the mandelbox holds. Runs once, on the task armed
    /// by [`Mandelbox::create`]; every step is best-effort.
    async fn teardown(&self) {
        let id = self.id;
        let start = Instant::now();
        tracing::info!(mandelbox_id = %id, "Tearing down mandelbox");

        let (runtime_id, bindings, tty, gpu, devices, handoff, backup) = {
            let mut state = self.state.write().await;
            state.closing = true;
            let backup = BackupRequest {
                mandelbox_id: id,
                user_id: state.user_id.clone(),
                app_name: state.app_name.clone(),
                config_token: std::mem::take(&mut state.config_token),
                mandelbox_dir: self.mandelbox_dir(),
            };
            (
                state.runtime_id.clone(),
                std::mem::take(&mut state.port_bindings),
                state.tty.take(),
                state.gpu.take(),
                state.devices.take(),
                state.handoff.take(),
                backup,
            )
        };

        if let Err(e) = self.write_status(MandelboxStatus::Dying).await {
            tracing::warn!(mandelbox_id = %id, error = %e, "Failed to mark mandelbox as dying");
        }

        if let Some(runtime_id) = &runtime_id {
            if let Err(e) = self
                .host
                .runtime()
                .remove_container(runtime_id, CONTAINER_STOP_TIMEOUT)
                .await
            {
                tracing::warn!(mandelbox_id = %id, runtime_id = %runtime_id, error = %e, "Failed to remove container");
            }
        }

        if !bindings.is_empty() {
            self.host.ports().free(&bindings);
        }

        if let Some(handoff) = handoff {
            if let Err(e) = handoff.await {
                tracing::warn!(mandelbox_id = %id, error = %e, "Input handoff task failed");
            }
        }
        if let Some(devices) = devices {
            match Arc::try_unwrap(devices) {
                Ok(devices) => {
                    if let Err(e) = devices.close() {
                        tracing::warn!(mandelbox_id = %id, error = %e, "Failed to close input devices");
                    }
                }
                Err(_) => {
                    tracing::warn!(mandelbox_id = %id, "Input devices still shared, dropping without destroy")
                }
            }
        }

        if let Some(tty) = tty {
            self.host.ttys().free(tty);
        }
        if let Some(gpu) = gpu {
            if let Err(e) = self.host.gpus().free(gpu, id) {
                tracing::warn!(mandelbox_id = %id, gpu, error = %e, "Failed to free GPU slot");
            }
        }

        // Back up before the scratch directory (and the config in it) goes away.
        if backup.config_token.is_empty() {
            tracing::debug!(mandelbox_id = %id, "No config token, skipping config backup");
        } else if let Err(e) = self.host.backup().backup(&backup).await {
            tracing::warn!(mandelbox_id = %id, error = %e, "Failed to back up user config");
        }

        if let Err(e) = params::remove_mandelbox_dir(&backup.mandelbox_dir).await {
            tracing::warn!(mandelbox_id = %id, error = %e, "Failed to remove mandelbox directory");
        }

        if let Err(e) = self.host.store().remove(id).await {
            tracing::warn!(mandelbox_id = %id, error = %e, "Failed to remove mandelbox row");
        }
        self.host.registry().remove(id).await;

        tracing::info!(
            mandelbox_id = %id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Mandelbox removed"
        );
        self.removed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::host::Collaborators;
    use crate::ports::TransportProtocol;
    use crate::store::MemoryStore;
    use mandelbox_input::testing::FakeInputProvider;

    struct Fixture {
        host: Arc<Host>,
        store: Arc<MemoryStore>,
        input: FakeInputProvider,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = HostConfig::builder()
            .port_range(40000, 40100)
            .tty_range(10, 20)
            .reserved_ttys(Vec::new())
            .gpus(1, 2)
            .data_dir(dir.path())
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let input = FakeInputProvider::new();
        let collaborators = Collaborators {
            store: store.clone(),
            input: Arc::new(input.clone()),
            ..Collaborators::in_memory()
        };
        let host = Host::new(config, collaborators).unwrap();
        Fixture {
            host,
            store,
            input,
            _dir: dir,
        }
    }

    fn info() -> MandelboxInfo {
        MandelboxInfo {
            app_name: "browsers/chrome".into(),
            user_id: "user-1".into(),
            config_token: String::new(),
            access_token: "jwt".into(),
        }
    }

    #[test]
    fn test_mandelbox_id_parse() {
        let id = MandelboxId::new();
        let parsed: MandelboxId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(matches!(
            "not-a-uuid".parse::<MandelboxId>(),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_close_releases_everything() {
        let f = fixture();
        let id = MandelboxId::new();
        let mb = Mandelbox::create(&f.host, id, info()).await.unwrap();
        assert_eq!(mb.stage().await, MandelboxStage::Created);
        assert_eq!(f.host.registry().len().await, 1);

        let free_before = f.host.ports().count_free(TransportProtocol::Tcp);
        mb.assign_port_bindings(&[PortBinding::any(32262, TransportProtocol::Tcp)])
            .await
            .unwrap();
        let tty = mb.assign_tty().await.unwrap();
        let gpu = mb.assign_gpu().await.unwrap();
        mb.assign_input_devices().await.unwrap();
        assert_eq!(f.input.open_devices(), 3);

        mb.register_creation(RuntimeId::new("abc"), "browsers/chrome")
            .await
            .unwrap();
        assert_eq!(mb.stage().await, MandelboxStage::Registered);
        mb.mark_ready().await.unwrap();
        assert_eq!(mb.stage().await, MandelboxStage::Ready);

        mb.close();
        mb.closed().await;
        mb.close();

        assert_eq!(mb.stage().await, MandelboxStage::Removed);
        assert_eq!(f.host.ports().count_free(TransportProtocol::Tcp), free_before);
        assert!(!f.host.ttys().is_allocated(tty));
        assert_eq!(f.host.gpus().slot_usage(gpu), Some(0));
        assert_eq!(f.input.open_devices(), 0);
        assert!(f.host.registry().is_empty().await);
        assert!(f.store.is_empty().await);
        assert_eq!(
            f.store.history(id).await,
            vec![
                MandelboxStatus::Allocated,
                MandelboxStatus::Running,
                MandelboxStatus::Dying
            ]
        );
    }

    #[tokio::test]
    async fn test_register_creation_rules() {
        let f = fixture();
        let mb = Mandelbox::create(&f.host, MandelboxId::new(), info()).await.unwrap();

        assert!(matches!(
            mb.register_creation(RuntimeId::new(""), "app").await,
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(matches!(
            mb.register_creation(RuntimeId::new("abc"), "").await,
            Err(CoreError::InvalidArgument(_))
        ));

        mb.register_creation(RuntimeId::new("abc"), "app").await.unwrap();
        assert!(matches!(
            mb.register_creation(RuntimeId::new("def"), "app").await,
            Err(CoreError::AlreadyAllocated(_))
        ));

        let found = f
            .host
            .registry()
            .get_by_runtime_id(&RuntimeId::new("abc"))
            .await
            .unwrap();
        assert_eq!(found.id(), mb.id());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let f = fixture();
        let id = MandelboxId::new();
        let _mb = Mandelbox::create(&f.host, id, info()).await.unwrap();
        let second = Mandelbox::create(&f.host, id, info()).await;
        assert!(matches!(second, Err(CoreError::AlreadyAllocated(_))));
        assert_eq!(f.host.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_assign_after_close_fails() {
        let f = fixture();
        let mb = Mandelbox::create(&f.host, MandelboxId::new(), info()).await.unwrap();
        mb.close();
        mb.closed().await;

        assert!(matches!(mb.assign_tty().await, Err(CoreError::Cancelled)));
        assert!(matches!(
            mb.assign_input_devices().await,
            Err(CoreError::Cancelled)
        ));
        assert_eq!(f.input.created_total(), 0);
        assert_eq!(f.host.ttys().count_free(), 10);
    }

    #[tokio::test]
    async fn test_handoff_requires_devices() {
        let f = fixture();
        let mb = Mandelbox::create(&f.host, MandelboxId::new(), info()).await.unwrap();
        let result = mb.start_input_handoff(mb.mandelbox_dir().join("x.sock")).await;
        assert!(matches!(result, Err(CoreError::NotAllocated(_))));
    }

    #[tokio::test]
    async fn test_pending_handoff_is_cancelled_by_close() {
        let f = fixture();
        let mb = Mandelbox::create(&f.host, MandelboxId::new(), info()).await.unwrap();
        mb.assign_input_devices().await.unwrap();
        let socket = params::uinput_socket_path(&mb.mandelbox_dir());
        mb.start_input_handoff(socket.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !socket.exists() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        mb.close();
        tokio::time::timeout(Duration::from_secs(5), mb.closed())
            .await
            .unwrap();
        assert_eq!(f.input.open_devices(), 0);
        assert!(!mb.mandelbox_dir().exists());
    }
}
