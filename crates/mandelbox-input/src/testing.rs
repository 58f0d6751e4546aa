//! In-process provider for tests and development hosts without `/dev/uinput`.
//!
//! Devices are backed by pipes, so they carry real descriptors that can be
//! passed over the handoff socket.

use crate::device::{DeviceKind, DeviceSet, InputDevice, InputDeviceProvider};
use crate::error::{InputError, Result};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Provider producing pipe-backed fake devices.
///
/// Tracks how many devices are currently open so tests can assert that
/// nothing leaks.
#[derive(Debug, Clone, Default)]
pub struct FakeInputProvider {
    open: Arc<AtomicUsize>,
    created: Arc<AtomicUsize>,
    next_node: Arc<AtomicUsize>,
    fail_at: Option<DeviceKind>,
}

impl FakeInputProvider {
    /// Provider whose allocations always succeed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that fails every allocation when it reaches `kind`.
    pub fn failing_at(kind: DeviceKind) -> Self {
        Self {
            fail_at: Some(kind),
            ..Self::default()
        }
    }

    /// Number of devices currently open.
    pub fn open_devices(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of devices ever created successfully.
    pub fn created_total(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn create(&self, kind: DeviceKind) -> Result<Box<dyn InputDevice>> {
        if self.fail_at == Some(kind) {
            return Err(InputError::Create {
                kind,
                reason: "injected failure".into(),
            });
        }

        let (read, write) = nix::unistd::pipe().map_err(|e| InputError::Create {
            kind,
            reason: e.to_string(),
        })?;
        let n = self.next_node.fetch_add(1, Ordering::SeqCst);
        self.open.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeDevice {
            kind,
            fd: read,
            _peer: write,
            node: PathBuf::from(format!("/dev/input/event{}", 1000 + n)),
            open: Arc::clone(&self.open),
        }))
    }
}

impl InputDeviceProvider for FakeInputProvider {
    fn allocate(&self) -> Result<DeviceSet> {
        DeviceSet::build(|kind| self.create(kind))
    }
}

#[derive(Debug)]
struct FakeDevice {
    kind: DeviceKind,
    fd: OwnedFd,
    _peer: OwnedFd,
    node: PathBuf,
    open: Arc<AtomicUsize>,
}

impl AsFd for FakeDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl InputDevice for FakeDevice {
    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn node_path(&self) -> &Path {
        &self.node
    }

    fn close(self: Box<Self>) -> Result<()> {
        drop(self);
        Ok(())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}
