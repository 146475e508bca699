use std::sync::Arc;

use alloy::primitives::{Address, ChainId};
use async_trait::async_trait;
use local_db::{DbError, DbStore, checkpoint_key};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("db error: {0}")]
    Db(#[from] DbError),
}

/// Durable "last fully processed block" for one listener.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self) -> Result<Option<u64>, CheckpointError>;

    /// Must not return before the value is durable.
    async fn save(&self, block_number: u64) -> Result<(), CheckpointError>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn load(&self) -> Result<Option<u64>, CheckpointError> {
        (**self).load().await
    }

    async fn save(&self, block_number: u64) -> Result<(), CheckpointError> {
        (**self).save(block_number).await
    }
}

pub struct DbCheckpointStore {
    db: Arc<DbStore>,
    key: String,
}

impl DbCheckpointStore {
    pub fn new(db: Arc<DbStore>, chain_id: ChainId, contract: Address) -> Self {
        Self {
            db,
            key: checkpoint_key(chain_id, &contract.to_string()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl CheckpointStore for DbCheckpointStore {
    async fn load(&self) -> Result<Option<u64>, CheckpointError> {
        let meta = self.db.get_checkpoint(&self.key)?;
        Ok(meta.map(|meta| meta.last_block))
    }

    async fn save(&self, block_number: u64) -> Result<(), CheckpointError> {
        let meta = self.db.put_checkpoint(&self.key, block_number)?;
        debug!(key = %self.key, last_block = meta.last_block, "checkpoint saved");
        Ok(())
    }
}
