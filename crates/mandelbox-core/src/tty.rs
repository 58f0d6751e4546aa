//! Virtual terminal allocation.
//!
//! Works like the port allocator, for one TTY per call.

use crate::config::HostConfig;
use crate::error::{CoreError, Result};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A virtual terminal number held by a mandelbox.
pub type Tty = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TtyState {
    Reserved,
    InUse,
}

/// Allocator of TTYs in `[min_tty, max_tty)`.
#[derive(Debug)]
pub struct TtyAllocator {
    min_tty: Tty,
    max_tty: Tty,
    attempts: u32,
    ttys: Mutex<HashMap<Tty, TtyState>>,
}

impl TtyAllocator {
    /// Create an allocator for `[min_tty, max_tty)`, reserving `reserved`.
    pub fn new(min_tty: Tty, max_tty: Tty, attempts: u32, reserved: &[Tty]) -> Result<Self> {
        if min_tty >= max_tty {
            return Err(CoreError::InvalidArgument(format!(
                "empty tty range [{min_tty}, {max_tty})"
            )));
        }
        if attempts == 0 {
            return Err(CoreError::InvalidArgument(
                "tty allocation attempts must be > 0".into(),
            ));
        }
        let ttys = reserved
            .iter()
            .map(|&tty| (tty, TtyState::Reserved))
            .collect();
        Ok(Self {
            min_tty,
            max_tty,
            attempts,
            ttys: Mutex::new(ttys),
        })
    }

    /// Create an allocator from the host configuration.
    pub fn from_config(config: &HostConfig) -> Result<Self> {
        Self::new(
            config.min_tty,
            config.max_tty,
            config.allocation_attempts,
            &config.reserved_ttys,
        )
    }

    fn ttys(&self) -> MutexGuard<'_, HashMap<Tty, TtyState>> {
        self.ttys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a random free TTY.
    pub fn allocate(&self) -> Result<Tty> {
        let mut ttys = self.ttys();
        let mut rng = rand::thread_rng();
        for _ in 0..self.attempts {
            let candidate = rng.gen_range(self.min_tty..self.max_tty);
            if !ttys.contains_key(&candidate) {
                ttys.insert(candidate, TtyState::InUse);
                tracing::debug!(tty = candidate, "Allocated TTY");
                return Ok(candidate);
            }
        }
        Err(CoreError::CapacityExhausted(format!(
            "no free TTY found after {} attempts",
            self.attempts
        )))
    }

    /// Release `tty`. Reserved and unallocated TTYs are left alone.
    pub fn free(&self, tty: Tty) {
        let mut ttys = self.ttys();
        match ttys.get(&tty) {
            Some(TtyState::InUse) => {
                ttys.remove(&tty);
                tracing::debug!(tty, "Freed TTY");
            }
            Some(TtyState::Reserved) => {
                tracing::info!(tty, "Not freeing reserved TTY");
            }
            None => {
                tracing::warn!(tty, "Freeing TTY that is not allocated");
            }
        }
    }

    /// Whether `tty` is currently unavailable.
    pub fn is_allocated(&self, tty: Tty) -> bool {
        self.ttys().contains_key(&tty)
    }

    /// Number of free TTYs in the allocation range.
    pub fn count_free(&self) -> usize {
        let ttys = self.ttys();
        let taken = ttys
            .keys()
            .filter(|t| (self.min_tty..self.max_tty).contains(*t))
            .count();
        (self.max_tty - self.min_tty) as usize - taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_rejects_empty_range() {
        assert!(matches!(
            TtyAllocator::new(12, 12, 100, &[]),
            Err(CoreError::InvalidArgument(_))
        ));
        assert!(TtyAllocator::new(10, 20, 0, &[]).is_err());
    }

    #[test]
    fn test_allocate_within_range_and_unique() {
        let ttys = TtyAllocator::new(10, 40, 1000, &[]).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..20 {
            let tty = ttys.allocate().unwrap();
            assert!((10..40).contains(&tty));
            assert!(seen.insert(tty));
        }
        assert_eq!(ttys.count_free(), 10);
    }

    #[test]
    fn test_reserved_never_handed_out_or_freed() {
        let ttys = TtyAllocator::new(0, 4, 500, &[0, 1, 2]).unwrap();
        assert_eq!(ttys.allocate().unwrap(), 3);

        ttys.free(1);
        assert!(ttys.is_allocated(1));
        assert!(ttys.allocate().unwrap_err().is_capacity());
    }

    #[test]
    fn test_free_is_idempotent() {
        let ttys = TtyAllocator::new(10, 12, 100, &[]).unwrap();
        let tty = ttys.allocate().unwrap();
        ttys.free(tty);
        ttys.free(tty);
        assert!(!ttys.is_allocated(tty));
        assert_eq!(ttys.count_free(), 2);
    }

    #[test]
    fn test_from_config_reserves_low_ttys() {
        let ttys = TtyAllocator::from_config(&HostConfig::default()).unwrap();
        for tty in 0..10 {
            assert!(ttys.is_allocated(tty));
        }
        assert_eq!(ttys.count_free(), 245);
    }
}
