//! Persistent mandelbox status records.
//!
//! The host reports each mandelbox's status to a shared database so that the
//! wider system can see what is running where. [`MandelboxStore`] abstracts
//! that database; [`MemoryStore`] keeps the rows in memory.

use crate::error::Result;
use crate::mandelbox::MandelboxId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Status column of a mandelbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MandelboxStatus {
    /// Accepted, resources being allocated
    Allocated,
    /// Container ready for the client
    Running,
    /// Teardown in progress
    Dying,
}

/// A mandelbox row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandelboxRecord {
    pub id: MandelboxId,
    pub app_name: String,
    pub user_id: String,
    pub status: MandelboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Storage for mandelbox rows.
#[async_trait::async_trait]
pub trait MandelboxStore: Send + Sync {
    /// Insert or update the row for `record.id`.
    async fn write_status(&self, record: &MandelboxRecord) -> Result<()>;

    /// Delete the row for `id`. Deleting a missing row is not an error.
    async fn remove(&self, id: MandelboxId) -> Result<()>;
}

/// In-memory [`MandelboxStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<MandelboxId, MandelboxRecord>>,
    history: RwLock<Vec<(MandelboxId, MandelboxStatus)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current row for `id`.
    pub async fn get(&self, id: MandelboxId) -> Option<MandelboxRecord> {
        self.rows.read().await.get(&id).cloned()
    }

    /// Number of rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Every status ever written for `id`, oldest first.
    pub async fn history(&self, id: MandelboxId) -> Vec<MandelboxStatus> {
        self.history
            .read()
            .await
            .iter()
            .filter(|(row, _)| *row == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait::async_trait]
impl MandelboxStore for MemoryStore {
    async fn write_status(&self, record: &MandelboxRecord) -> Result<()> {
        self.rows.write().await.insert(record.id, record.clone());
        self.history.write().await.push((record.id, record.status));
        Ok(())
    }

    async fn remove(&self, id: MandelboxId) -> Result<()> {
        self.rows.write().await.remove(&id);
        Ok(())
    }
}
