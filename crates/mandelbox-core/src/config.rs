//! Host configuration types.

use crate::error::CoreError;
use crate::ports::TransportProtocol;
use std::path::PathBuf;
use std::time::Duration;

/// Port the host service itself listens on; never handed to a mandelbox.
pub const CONTROL_PORT: u16 = 4678;

/// Configuration for the resource allocators and lifecycle engine.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Lowest host port handed out (inclusive).
    pub min_port: u16,
    /// Highest host port handed out (exclusive).
    pub max_port: u16,
    /// Ports that are never handed out nor freed.
    pub reserved_ports: Vec<(u16, TransportProtocol)>,
    /// Lowest TTY handed out (inclusive).
    pub min_tty: u32,
    /// Highest TTY handed out (exclusive).
    pub max_tty: u32,
    /// TTYs that are never handed out nor freed.
    pub reserved_ttys: Vec<u32>,
    /// Number of GPUs on this host.
    pub gpu_count: usize,
    /// Maximum mandelboxes sharing one GPU.
    pub max_mandelboxes_per_gpu: usize,
    /// Random draws before a port/TTY allocation gives up.
    pub allocation_attempts: u32,
    /// Root of the per-mandelbox scratch directories.
    pub data_dir: PathBuf,
    /// How long to wait for a container to report readiness.
    pub ready_timeout: Duration,
    /// Polling interval for the readiness marker.
    pub ready_poll_interval: Duration,
    /// Capacity of the inbound request channel.
    pub request_buffer: usize,
    /// How long shutdown waits for outstanding tasks.
    pub shutdown_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            min_port: 1025,
            max_port: 49151,
            reserved_ports: vec![(CONTROL_PORT, TransportProtocol::Tcp)],
            min_tty: 0,
            max_tty: 255,
            reserved_ttys: (0..10).collect(),
            gpu_count: 1,
            max_mandelboxes_per_gpu: 3,
            allocation_attempts: 100,
            data_dir: PathBuf::from("/whist"),
            ready_timeout: Duration::from_secs(60),
            ready_poll_interval: Duration::from_millis(100),
            request_buffer: 100,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl HostConfig {
    /// Create a new config builder.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.min_port == 0 || self.min_port >= self.max_port {
            return Err(CoreError::InvalidArgument(format!(
                "port range [{}, {}) is empty or includes port 0",
                self.min_port, self.max_port
            )));
        }
        if self.min_tty >= self.max_tty {
            return Err(CoreError::InvalidArgument(format!(
                "tty range [{}, {}) is empty",
                self.min_tty, self.max_tty
            )));
        }
        if self.max_mandelboxes_per_gpu == 0 {
            return Err(CoreError::InvalidArgument(
                "max_mandelboxes_per_gpu must be > 0".into(),
            ));
        }
        if self.allocation_attempts == 0 {
            return Err(CoreError::InvalidArgument(
                "allocation_attempts must be > 0".into(),
            ));
        }
        if self.request_buffer == 0 {
            return Err(CoreError::InvalidArgument("request_buffer must be > 0".into()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(CoreError::InvalidArgument("data_dir is required".into()));
        }
        Ok(())
    }

    /// Scratch directory of one mandelbox.
    pub fn mandelbox_dir(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }
}

/// Builder for HostConfig.
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Set the host port range `[min, max)`.
    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.config.min_port = min;
        self.config.max_port = max;
        self
    }

    /// Add a permanently reserved port.
    pub fn reserve_port(mut self, port: u16, protocol: TransportProtocol) -> Self {
        self.config.reserved_ports.push((port, protocol));
        self
    }

    /// Set the TTY range `[min, max)`.
    pub fn tty_range(mut self, min: u32, max: u32) -> Self {
        self.config.min_tty = min;
        self.config.max_tty = max;
        self
    }

    /// Replace the reserved TTY list.
    pub fn reserved_ttys(mut self, ttys: impl IntoIterator<Item = u32>) -> Self {
        self.config.reserved_ttys = ttys.into_iter().collect();
        self
    }

    /// Set the GPU count and per-GPU ceiling.
    pub fn gpus(mut self, count: usize, max_per_gpu: usize) -> Self {
        self.config.gpu_count = count;
        self.config.max_mandelboxes_per_gpu = max_per_gpu;
        self
    }

    /// Set the number of random draws per allocation.
    pub fn allocation_attempts(mut self, attempts: u32) -> Self {
        self.config.allocation_attempts = attempts;
        self
    }

    /// Set the scratch directory root.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the readiness wait timeout.
    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.ready_timeout = timeout;
        self
    }

    /// Set the readiness polling interval.
    pub fn ready_poll_interval(mut self, interval: Duration) -> Self {
        self.config.ready_poll_interval = interval;
        self
    }

    /// Set the inbound request channel capacity.
    pub fn request_buffer(mut self, size: usize) -> Self {
        self.config.request_buffer = size;
        self
    }

    /// Set the shutdown wait timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<HostConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.min_port, 1025);
        assert_eq!(config.max_port, 49151);
        assert_eq!(config.max_tty, 255);
        assert!(config
            .reserved_ports
            .contains(&(CONTROL_PORT, TransportProtocol::Tcp)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_empty_port_range() {
        let result = HostConfig::builder().port_range(2000, 2000).build();
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn test_builder_rejects_zero_gpu_ceiling() {
        let result = HostConfig::builder().gpus(2, 0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let config = HostConfig::builder()
            .port_range(30000, 30100)
            .tty_range(10, 20)
            .reserved_ttys(Vec::new())
            .gpus(2, 2)
            .data_dir("/tmp/mandelboxes")
            .ready_timeout(Duration::from_secs(5))
            .build()
            .expect("should build successfully");

        assert_eq!(config.min_port, 30000);
        assert_eq!(config.gpu_count, 2);
        assert!(config.reserved_ttys.is_empty());
        assert_eq!(
            config.mandelbox_dir("abc"),
            PathBuf::from("/tmp/mandelboxes/abc")
        );
    }
}
