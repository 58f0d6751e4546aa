//! Configuration for the host service.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use mandelbox_core::{CoreError, HostConfig, CONTROL_PORT};
use mandelbox_input::UinputProvider;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the mandelbox host service.
#[derive(Debug, Clone)]
pub struct HostdConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Root of the per-mandelbox scratch directories.
    pub data_dir: PathBuf,

    /// Lowest host port handed to mandelboxes (inclusive).
    pub min_port: u16,

    /// Highest host port handed to mandelboxes (exclusive).
    pub max_port: u16,

    /// Number of GPUs on this instance (0 on GPU-less development hosts).
    pub gpu_count: usize,

    /// Mandelboxes sharing one GPU (default: 3).
    pub max_mandelboxes_per_gpu: usize,

    /// How long a container gets to report readiness.
    pub ready_timeout: Duration,

    /// How long shutdown waits for teardown to finish.
    pub shutdown_timeout: Duration,

    /// Use pipe-backed fake input devices instead of `/dev/uinput`.
    pub fake_input: bool,

    /// Refuse to start unless running as root (default: true).
    pub require_root: bool,
}

impl Default for HostdConfig {
    fn default() -> Self {
        let core = HostConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), CONTROL_PORT),
            data_dir: core.data_dir,
            min_port: core.min_port,
            max_port: core.max_port,
            gpu_count: core.gpu_count,
            max_mandelboxes_per_gpu: core.max_mandelboxes_per_gpu,
            ready_timeout: core.ready_timeout,
            shutdown_timeout: core.shutdown_timeout,
            fake_input: false,
            require_root: true,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
}

impl HostdConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `MANDELBOX_HTTP_HOST` | `0.0.0.0` |
    /// | `MANDELBOX_HTTP_PORT` | `4678` |
    /// | `MANDELBOX_DATA_DIR` | `/whist` |
    /// | `MANDELBOX_MIN_PORT` | `1025` |
    /// | `MANDELBOX_MAX_PORT` | `49151` |
    /// | `MANDELBOX_GPU_COUNT` | `1` |
    /// | `MANDELBOX_MAX_PER_GPU` | `3` |
    /// | `MANDELBOX_READY_TIMEOUT_SECS` | `60` |
    /// | `MANDELBOX_SHUTDOWN_TIMEOUT_SECS` | `30` |
    /// | `MANDELBOX_FAKE_INPUT` | `false` |
    /// | `MANDELBOX_REQUIRE_ROOT` | `true` |
    pub fn from_env() -> Self {
        let default = Self::default();

        let http_host: IpAddr =
            env_parse("MANDELBOX_HTTP_HOST").unwrap_or(default.http_addr.ip());
        let http_port: u16 = env_parse("MANDELBOX_HTTP_PORT").unwrap_or(default.http_addr.port());

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            data_dir: std::env::var("MANDELBOX_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.data_dir),
            min_port: env_parse("MANDELBOX_MIN_PORT").unwrap_or(default.min_port),
            max_port: env_parse("MANDELBOX_MAX_PORT").unwrap_or(default.max_port),
            gpu_count: env_parse("MANDELBOX_GPU_COUNT").unwrap_or(default.gpu_count),
            max_mandelboxes_per_gpu: env_parse("MANDELBOX_MAX_PER_GPU")
                .unwrap_or(default.max_mandelboxes_per_gpu),
            ready_timeout: env_parse("MANDELBOX_READY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.ready_timeout),
            shutdown_timeout: env_parse("MANDELBOX_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.shutdown_timeout),
            fake_input: env_flag("MANDELBOX_FAKE_INPUT").unwrap_or(default.fake_input),
            require_root: env_flag("MANDELBOX_REQUIRE_ROOT").unwrap_or(default.require_root),
        }
    }

    /// Build the core host configuration.
    ///
    /// The HTTP port is always reserved so no mandelbox is ever handed it.
    pub fn host_config(&self) -> Result<HostConfig, CoreError> {
        let mut builder = HostConfig::builder()
            .port_range(self.min_port, self.max_port)
            .gpus(self.gpu_count, self.max_mandelboxes_per_gpu)
            .data_dir(&self.data_dir)
            .ready_timeout(self.ready_timeout)
            .shutdown_timeout(self.shutdown_timeout);
        if self.http_addr.port() != CONTROL_PORT {
            builder = builder.reserve_port(self.http_addr.port(), mandelbox_core::TransportProtocol::Tcp);
        }
        builder.build()
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where devices may not exist.
    pub fn validate_warn(&self) {
        if !self.data_dir.exists() {
            tracing::warn!("Data directory not found, it will be created: {:?}", self.data_dir);
        }

        if !self.fake_input && !UinputProvider::new().is_available() {
            tracing::warn!("/dev/uinput is not writable; set MANDELBOX_FAKE_INPUT=1 on development hosts");
        }

        if self.gpu_count == 0 {
            tracing::warn!("No GPUs configured, mandelboxes will run without one");
        }

        if !self.require_root {
            tracing::warn!("Root check disabled");
        }
    }
}
