use std::time::Duration;

use alloy::primitives::{Address, B256, U256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Planted { planter: Address, nonce: U256 },
    Assigned { tree_id: U256 },
    Updated { tree_id: U256 },
}

impl TreeEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Planted { .. } => "TreePlanted",
            Self::Assigned { .. } => "TreeAssigned",
            Self::Updated { .. } => "TreeUpdated",
        }
    }
}

/// A decoded registry event at a confirmed position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub transaction_hash: Option<B256>,
    pub event: TreeEvent,
}

impl ChainEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.event.name()
    }
}

/// Every confirmed event of one block, in log order. An empty batch marks a
/// scanned block with nothing to process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBatch {
    pub block_number: u64,
    pub events: Vec<ChainEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
    Erroring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Connected,
    Closed,
    Error(String),
    /// Log queries keep failing on a live connection. The stream keeps
    /// retrying.
    Degraded(String),
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub poll_interval: Duration,
    pub confirmations: u64,
    pub chunk_size: u64,
    pub concurrency: usize,
    pub backoff: Duration,
    /// Consecutive retried query failures before a `Degraded` signal. Zero
    /// disables it.
    pub failure_alert_threshold: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            confirmations: 12,
            chunk_size: 2000,
            concurrency: 4,
            backoff: Duration::from_secs(2),
            failure_alert_threshold: 5,
        }
    }
}
