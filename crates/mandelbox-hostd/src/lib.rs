//! # mandelbox-hostd
//!
//! Host service for mandelbox worker instances.
//!
//! The service runs as root on every worker instance. It accepts spin-up and
//! drain requests from the backend over HTTP, feeds them to the
//! [`mandelbox_core::Orchestrator`], and on exit tears down every mandelbox
//! still running.
//!
//! ## Modules
//!
//! - [`config`]: environment configuration
//! - [`http`]: JSON API
//! - [`service`]: host construction and shutdown

pub mod config;
pub mod http;
pub mod service;

pub use config::HostdConfig;
pub use service::{HostService, ServiceError};
