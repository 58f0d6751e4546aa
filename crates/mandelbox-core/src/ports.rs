//! Host port allocation for mandelbox port bindings.
//!
//! Every mandelbox exposes a few internal ports on host ports. The allocator
//! keeps one state map per transport protocol; a port absent from the map
//! is free. All operations on both maps go through one mutex, and a single
//! [`PortAllocator::allocate`] call either resolves every requested binding
//! or leaves the maps exactly as it found them.

use crate::config::HostConfig;
use crate::error::{CoreError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Transport protocol of a port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(CoreError::InvalidArgument(format!(
                "unknown transport protocol: {other:?}"
            ))),
        }
    }
}

/// Mapping from a mandelbox-internal port to a host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port inside the mandelbox.
    pub mandelbox_port: u16,
    /// Port on the host; 0 in a request means "any".
    pub host_port: u16,
    /// Host address to bind on.
    pub bind_address: IpAddr,
    /// Transport protocol, shared by both sides.
    pub protocol: TransportProtocol,
}

impl PortBinding {
    /// Request any free host port for `mandelbox_port`.
    pub fn any(mandelbox_port: u16, protocol: TransportProtocol) -> Self {
        Self::fixed(mandelbox_port, 0, protocol)
    }

    /// Request a specific host port for `mandelbox_port`.
    pub fn fixed(mandelbox_port: u16, host_port: u16, protocol: TransportProtocol) -> Self {
        Self {
            mandelbox_port,
            host_port,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            protocol,
        }
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}->{}:{}",
            self.mandelbox_port, self.protocol, self.bind_address, self.host_port
        )
    }
}

/// State of a port that is not free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    /// Permanently excluded (e.g. the control port).
    Reserved,
    /// Held by a live mandelbox.
    InUse,
}

#[derive(Debug, Default)]
struct PortMaps {
    tcp: HashMap<u16, PortState>,
    udp: HashMap<u16, PortState>,
}

impl PortMaps {
    fn get_mut(&mut self, protocol: TransportProtocol) -> &mut HashMap<u16, PortState> {
        match protocol {
            TransportProtocol::Tcp => &mut self.tcp,
            TransportProtocol::Udp => &mut self.udp,
        }
    }

    fn get(&self, protocol: TransportProtocol) -> &HashMap<u16, PortState> {
        match protocol {
            TransportProtocol::Tcp => &self.tcp,
            TransportProtocol::Udp => &self.udp,
        }
    }
}

/// Allocator of host ports in `[min_port, max_port)`.
#[derive(Debug)]
pub struct PortAllocator {
    min_port: u16,
    max_port: u16,
    attempts: u32,
    maps: Mutex<PortMaps>,
}

impl PortAllocator {
    /// Create an allocator for `[min_port, max_port)` with no reservations.
    ///
    /// Fails on an empty range or a zero attempt budget.
    pub fn new(min_port: u16, max_port: u16, attempts: u32) -> Result<Self> {
        if min_port >= max_port {
            return Err(CoreError::InvalidArgument(format!(
                "empty port range [{min_port}, {max_port})"
            )));
        }
        if attempts == 0 {
            return Err(CoreError::InvalidArgument(
                "port allocation attempts must be > 0".into(),
            ));
        }
        Ok(Self {
            min_port,
            max_port,
            attempts,
            maps: Mutex::new(PortMaps::default()),
        })
    }

    /// Create an allocator from the host configuration, applying its
    /// reserved ports.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        let allocator = Self::new(config.min_port, config.max_port, config.allocation_attempts)?;
        for &(port, protocol) in &config.reserved_ports {
            allocator.reserve(port, protocol)?;
        }
        Ok(allocator)
    }

    fn maps(&self) -> MutexGuard<'_, PortMaps> {
        self.maps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Permanently exclude a port from allocation.
    ///
    /// Ports outside the allocation range may be reserved too; they simply
    /// never come up in a draw.
    pub fn reserve(&self, port: u16, protocol: TransportProtocol) -> Result<()> {
        let mut maps = self.maps();
        let map = maps.get_mut(protocol);
        if map.get(&port) == Some(&PortState::InUse) {
            return Err(CoreError::AlreadyAllocated(format!(
                "cannot reserve {port}/{protocol}: in use"
            )));
        }
        map.insert(port, PortState::Reserved);
        tracing::debug!(port, %protocol, "Reserved host port");
        Ok(())
    }

    /// Resolve `requests` atomically.
    ///
    /// On success the returned bindings have every `host_port` filled in, in
    /// request order. On failure, every port taken earlier in this call is
    /// released before the error is returned.
    pub fn allocate(&self, requests: &[PortBinding]) -> Result<Vec<PortBinding>> {
        let mut maps = self.maps();
        let mut resolved: Vec<PortBinding> = Vec::with_capacity(requests.len());

        for request in requests {
            match self.allocate_one(&mut maps, request) {
                Ok(binding) => resolved.push(binding),
                Err(e) => {
                    for binding in &resolved {
                        maps.get_mut(binding.protocol).remove(&binding.host_port);
                    }
                    tracing::warn!(
                        request = %request,
                        rolled_back = resolved.len(),
                        error = %e,
                        "Port allocation failed"
                    );
                    if resolved.is_empty() {
                        return Err(e);
                    }
                    return Err(CoreError::PartialAllocationRolledBack {
                        failed: format!("port request {request}"),
                        source: Box::new(e),
                    });
                }
            }
        }

        tracing::debug!(count = resolved.len(), "Allocated host ports");
        Ok(resolved)
    }

    fn allocate_one(&self, maps: &mut PortMaps, request: &PortBinding) -> Result<PortBinding> {
        let protocol = request.protocol;
        let map = maps.get_mut(protocol);

        if request.host_port == 0 {
            let mut rng = rand::thread_rng();
            for _ in 0..self.attempts {
                let candidate = rng.gen_range(self.min_port..self.max_port);
                if !map.contains_key(&candidate) {
                    map.insert(candidate, PortState::InUse);
                    return Ok(PortBinding {
                        host_port: candidate,
                        ..*request
                    });
                }
            }
            return Err(CoreError::CapacityExhausted(format!(
                "no free {protocol} port found after {} attempts",
                self.attempts
            )));
        }

        let port = request.host_port;
        if !(self.min_port..self.max_port).contains(&port) {
            return Err(CoreError::InvalidArgument(format!(
                "host port {port} outside allowed range [{}, {})",
                self.min_port, self.max_port
            )));
        }
        match map.get(&port) {
            Some(PortState::Reserved) => Err(CoreError::AlreadyAllocated(format!(
                "{port}/{protocol} is reserved"
            ))),
            Some(PortState::InUse) => Err(CoreError::AlreadyAllocated(format!(
                "{port}/{protocol} is in use"
            ))),
            None => {
                map.insert(port, PortState::InUse);
                Ok(*request)
            }
        }
    }

    /// Release `bindings`.
    ///
    /// Reserved ports are left untouched; ports that are not allocated are
    /// skipped. Both cases are logged.
    pub fn free(&self, bindings: &[PortBinding]) {
        let mut maps = self.maps();
        for binding in bindings {
            let map = maps.get_mut(binding.protocol);
            match map.get(&binding.host_port) {
                Some(PortState::InUse) => {
                    map.remove(&binding.host_port);
                }
                Some(PortState::Reserved) => {
                    tracing::info!(binding = %binding, "Not freeing reserved port");
                }
                None => {
                    tracing::warn!(binding = %binding, "Freeing port that is not allocated");
                }
            }
        }
        tracing::debug!(count = bindings.len(), "Freed host ports");
    }

    /// Whether `port` is currently unavailable (in use or reserved).
    pub fn is_allocated(&self, port: u16, protocol: TransportProtocol) -> bool {
        self.maps().get(protocol).contains_key(&port)
    }

    /// Number of free ports of `protocol` in the allocation range.
    pub fn count_free(&self, protocol: TransportProtocol) -> usize {
        let maps = self.maps();
        let taken = maps
            .get(protocol)
            .keys()
            .filter(|p| (self.min_port..self.max_port).contains(*p))
            .count();
        usize::from(self.max_port - self.min_port) - taken
    }
}
