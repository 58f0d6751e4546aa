//! User configuration backup.
//!
//! When a mandelbox dies, the application's configuration (browser profile,
//! settings) is encrypted with the user's config token and uploaded so the
//! next session can restore it. The upload itself lives behind
//! [`ConfigBackup`].

use crate::error::Result;
use crate::mandelbox::MandelboxId;
use std::path::PathBuf;
use std::sync::Mutex;

/// What to back up.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub mandelbox_id: MandelboxId,
    pub user_id: String,
    pub app_name: String,
    /// Token the configuration is encrypted with.
    pub config_token: String,
    /// The mandelbox's scratch directory, still present when the backup runs.
    pub mandelbox_dir: PathBuf,
}

/// Uploads user configuration at teardown.
#[async_trait::async_trait]
pub trait ConfigBackup: Send + Sync {
    async fn backup(&self, request: &BackupRequest) -> Result<()>;
}

/// A [`ConfigBackup`] that records requests and uploads nothing.
#[derive(Debug, Default)]
pub struct NoopBackup {
    requests: Mutex<Vec<BackupRequest>>,
}

impl NoopBackup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<BackupRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl ConfigBackup for NoopBackup {
    async fn backup(&self, request: &BackupRequest) -> Result<()> {
        tracing::debug!(
            mandelbox_id = %request.mandelbox_id,
            app_name = %request.app_name,
            "Skipping config upload"
        );
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        Ok(())
    }
}
