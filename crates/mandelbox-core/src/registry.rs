//! Index of live mandelboxes.

use crate::error::{CoreError, Result};
use crate::mandelbox::{Mandelbox, MandelboxId};
use crate::runtime::RuntimeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Indexes {
    by_id: HashMap<MandelboxId, Arc<Mandelbox>>,
    by_runtime_id: HashMap<RuntimeId, MandelboxId>,
}

/// Every live mandelbox, by id and by runtime container id.
///
/// An entry is inserted when the mandelbox is created and removed only at
/// the very end of its teardown.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Indexes>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new mandelbox.
    pub async fn insert(&self, mandelbox: Arc<Mandelbox>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let id = mandelbox.id();
        if inner.by_id.contains_key(&id) {
            return Err(CoreError::AlreadyAllocated(format!(
                "mandelbox {id} is already registered"
            )));
        }
        inner.by_id.insert(id, mandelbox);
        Ok(())
    }

    /// Index `id` under its runtime container id.
    pub async fn index_runtime_id(&self, id: MandelboxId, runtime_id: RuntimeId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.by_id.contains_key(&id) {
            return Err(CoreError::NotFound(id.to_string()));
        }
        if let Some(existing) = inner.by_runtime_id.get(&runtime_id) {
            if *existing != id {
                return Err(CoreError::AlreadyAllocated(format!(
                    "runtime id {runtime_id} already belongs to mandelbox {existing}"
                )));
            }
        }
        inner.by_runtime_id.insert(runtime_id, id);
        Ok(())
    }

    pub async fn get(&self, id: MandelboxId) -> Option<Arc<Mandelbox>> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    /// Look up a mandelbox by the id the container runtime knows it by.
    pub async fn get_by_runtime_id(&self, runtime_id: &RuntimeId) -> Option<Arc<Mandelbox>> {
        let inner = self.inner.read().await;
        inner
            .by_runtime_id
            .get(runtime_id)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Drop `id` from both indexes.
    pub async fn remove(&self, id: MandelboxId) -> Option<Arc<Mandelbox>> {
        let mut inner = self.inner.write().await;
        let removed = inner.by_id.remove(&id);
        inner.by_runtime_id.retain(|_, owner| *owner != id);
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.by_id.is_empty()
    }

    pub async fn ids(&self) -> Vec<MandelboxId> {
        self.inner.read().await.by_id.keys().copied().collect()
    }

    /// Snapshot of every live mandelbox.
    pub async fn all(&self) -> Vec<Arc<Mandelbox>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}
