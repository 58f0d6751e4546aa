//! GPU slot allocation.
//!
//! A host has a handful of GPUs, each shared by up to a fixed number of
//! mandelboxes. Placement is greedy: the least-used slot that is not full
//! wins, ties going to the lowest index. This assumes every GPU on the host
//! is equally capable.
//!
//! Each slot's usage count, full flag and membership set change together in
//! one update under the allocator's mutex, so a racing `free` and `allocate`
//! can never observe a slot whose fields disagree.

use crate::config::HostConfig;
use crate::error::{CoreError, Result};
use crate::mandelbox::MandelboxId;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Index of a GPU slot on this host.
pub type GpuIndex = usize;

#[derive(Debug, Default)]
struct GpuSlot {
    usage: usize,
    is_full: bool,
    owners: HashSet<MandelboxId>,
}

/// Allocator of GPU slots.
#[derive(Debug)]
pub struct GpuAllocator {
    ceiling: usize,
    slots: Mutex<Vec<GpuSlot>>,
}

impl GpuAllocator {
    /// Create an allocator for `count` GPUs, each shared by at most
    /// `ceiling` mandelboxes.
    pub fn new(count: usize, ceiling: usize) -> Self {
        Self {
            ceiling,
            slots: Mutex::new((0..count).map(|_| GpuSlot::default()).collect()),
        }
    }

    /// Create an allocator from the host configuration.
    pub fn from_config(config: &HostConfig) -> Self {
        Self::new(config.gpu_count, config.max_mandelboxes_per_gpu)
    }

    fn slots(&self) -> MutexGuard<'_, Vec<GpuSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of GPUs managed.
    pub fn slot_count(&self) -> usize {
        self.slots().len()
    }

    /// Assign `owner` to the least-used non-full slot.
    pub fn allocate(&self, owner: MandelboxId) -> Result<GpuIndex> {
        let mut slots = self.slots();

        if slots.iter().any(|slot| slot.owners.contains(&owner)) {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {owner} already holds a GPU"
            )));
        }

        let chosen = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| !slot.is_full)
            .min_by_key(|(index, slot)| (slot.usage, *index))
            .map(|(index, _)| index);

        let Some(index) = chosen else {
            return Err(CoreError::CapacityExhausted(format!(
                "all {} GPUs are full",
                slots.len()
            )));
        };

        let slot = &mut slots[index];
        slot.usage += 1;
        slot.owners.insert(owner);
        slot.is_full = slot.usage >= self.ceiling;
        tracing::debug!(
            gpu = index,
            usage = slot.usage,
            full = slot.is_full,
            mandelbox_id = %owner,
            "Allocated GPU slot"
        );
        Ok(index)
    }

    /// Release `owner`'s share of slot `index`.
    pub fn free(&self, index: GpuIndex, owner: MandelboxId) -> Result<()> {
        let mut slots = self.slots();
        let count = slots.len();
        let slot = slots.get_mut(index).ok_or_else(|| {
            CoreError::InvalidArgument(format!("GPU index {index} out of range (have {count})"))
        })?;

        if slot.usage == 0 {
            return Err(CoreError::NotAllocated(format!("GPU {index} has no users")));
        }
        if !slot.owners.remove(&owner) {
            return Err(CoreError::NotAllocated(format!(
                "mandelbox {owner} does not hold GPU {index}"
            )));
        }
        slot.usage -= 1;
        slot.is_full = slot.usage >= self.ceiling;
        tracing::debug!(gpu = index, usage = slot.usage, mandelbox_id = %owner, "Freed GPU slot");
        Ok(())
    }

    /// Current number of mandelboxes on slot `index`.
    pub fn slot_usage(&self, index: GpuIndex) -> Option<usize> {
        self.slots().get(index).map(|slot| slot.usage)
    }
}
