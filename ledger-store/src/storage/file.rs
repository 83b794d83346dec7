//! Flat-file backend: one JSON document per identity

use super::Backend;
use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::types::{Account, AccountId};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stores each account as `<dir>/<identity>.json`
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    connected: AtomicBool,
}

impl FileBackend {
    /// Create the directory if needed
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.url);
        tokio::fs::create_dir_all(&dir).await?;

        tracing::info!(dir = ?dir, "File backend ready");

        Ok(Self {
            dir,
            connected: AtomicBool::new(true),
        })
    }

    fn path_for(&self, id: &AccountId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::BackendUnavailable("file backend disconnected".into()))
        }
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        tracing::info!(dir = ?self.dir, "File backend disconnected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn read_account(&self, id: &AccountId) -> Result<Option<Account>> {
        self.ensure_connected()?;

        let bytes = match tokio::fs::read(self.path_for(id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let account: Account = serde_json::from_slice(&bytes)?;
        if account.id != *id {
            return Err(Error::Serialization(format!(
                "file for {} holds account {}",
                id, account.id
            )));
        }

        Ok(Some(account))
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        self.ensure_connected()?;

        let path = self.path_for(&account.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(account)?;

        // Whole-file replace
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        tracing::debug!(account_id = %account.id, "Account file written");
        Ok(())
    }

    async fn query_top(
        &self,
        currency: &str,
        _page: usize,
        _page_size: usize,
    ) -> Result<Vec<Account>> {
        self.ensure_connected()?;
        tracing::debug!(currency, "Ranking is not available on the file backend");
        Ok(Vec::new())
    }
}
