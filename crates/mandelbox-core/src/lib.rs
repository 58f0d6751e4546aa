//! # mandelbox-core
//!
//! Resource allocation and lifecycle management for mandelboxes.
//!
//! A mandelbox is one user's application container. This crate hands out
//! the host resources it needs (ports, a TTY, a GPU slot, virtual input
//! devices), tracks every live mandelbox, and guarantees each one is torn
//! down exactly once with every resource returned.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  mandelbox-core (host)                   │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  Orchestrator   │────▶│  runtime events/errors   │   │
//! │  │   - run()       │     │  (ContainerRuntime)      │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! │           │ HostRequest                                  │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   spin_up()     │────▶│  Host                    │   │
//! │  └─────────────────┘     │  - PortAllocator         │   │
//! │           │              │  - TtyAllocator          │   │
//! │           ▼              │  - GpuAllocator          │   │
//! │  ┌─────────────────┐     │  - Registry              │   │
//! │  │   Mandelbox     │────▶│  - root token, tracker   │   │
//! │  │  - assign_*()   │     └──────────────────────────┘   │
//! │  │  - close()      │                                    │
//! │  └─────────────────┘                                    │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use mandelbox_core::{Collaborators, Host, HostConfig, MandelboxId, Orchestrator, SpinUpRequest};
//!
//! # async fn example() -> mandelbox_core::Result<()> {
//! let host = Host::new(HostConfig::default(), Collaborators::in_memory())?;
//! let (orchestrator, requests, _keepalive) = Orchestrator::new(host.clone());
//! tokio::spawn(orchestrator.run());
//!
//! let result = requests
//!     .spin_up(SpinUpRequest {
//!         app_name: "browsers/chrome".into(),
//!         mandelbox_id: MandelboxId::new(),
//!         config_encryption_token: String::new(),
//!         jwt_access_token: String::new(),
//!         user_id: "user-1".into(),
//!     })
//!     .await?;
//! println!("control port: {}", result.host_port_for_tcp32262);
//!
//! requests.drain_and_shutdown().await?;
//! host.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Atomic allocation**: a failed multi-port request leaves no ports held
//! - **Exactly-once teardown**: one cancellation token per mandelbox, one
//!   teardown task listening on it
//! - **Pluggable collaborators**: container runtime, status store and config
//!   backup are traits with in-memory implementations

mod backup;
mod config;
mod error;
mod gpu;
mod host;
mod mandelbox;
mod orchestrator;
pub mod params;
mod ports;
mod registry;
mod runtime;
mod spinup;
mod store;
mod tty;

pub use backup::{BackupRequest, ConfigBackup, NoopBackup};
pub use config::{HostConfig, HostConfigBuilder, CONTROL_PORT};
pub use error::{CoreError, Result};
pub use gpu::{GpuAllocator, GpuIndex};
pub use host::{Collaborators, Host};
pub use mandelbox::{Mandelbox, MandelboxId, MandelboxInfo, MandelboxStage};
pub use orchestrator::{
    classify_stream_error, HostRequest, KeepAlive, Orchestrator, RequestSender, StreamErrorAction,
};
pub use ports::{PortAllocator, PortBinding, TransportProtocol};
pub use registry::Registry;
pub use runtime::{
    ContainerEvent, ContainerEventKind, ContainerRuntime, ContainerSpec, MockRuntime, RuntimeEvents,
    RuntimeId, RuntimeStreamError,
};
pub use spinup::{spin_up, SpinUpRequest, SpinUpResult};
pub use store::{MandelboxRecord, MandelboxStatus, MandelboxStore, MemoryStore};
pub use tty::{Tty, TtyAllocator};
