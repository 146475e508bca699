use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use grove_core::contracts::tree_registry::treesCall;
use grove_core::{ChainReadError, RpcPool};
use local_db::{DbError, DbStore, RequestKind, RequestRecord, RequestStatus, StatusTransition};
use tracing::{debug, info};

use crate::types::{ChainEvent, TreeEvent};

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("request repository error: {0}")]
    Repository(#[from] DbError),
    #[error("tree state read error: {0}")]
    ChainRead(#[from] ChainReadError),
}

/// What an event did to the offchain request it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Settled { request_id: String },
    NotFound,
    AlreadySettled(RequestStatus),
}

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn find_request(
        &self,
        kind: RequestKind,
        key: &str,
    ) -> Result<Option<RequestRecord>, DbError>;

    async fn transition_request(
        &self,
        kind: RequestKind,
        key: &str,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<StatusTransition, DbError>;
}

#[async_trait]
impl RequestRepository for DbStore {
    async fn find_request(
        &self,
        kind: RequestKind,
        key: &str,
    ) -> Result<Option<RequestRecord>, DbError> {
        self.get_request(kind, key)
    }

    async fn transition_request(
        &self,
        kind: RequestKind,
        key: &str,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<StatusTransition, DbError> {
        DbStore::transition_request(self, kind, key, from, to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeOwnership {
    pub planter: Address,
    pub assign_nonce: U256,
}

#[async_trait]
pub trait TreeStateReader: Send + Sync {
    async fn tree_ownership(&self, tree_id: U256) -> Result<TreeOwnership, ChainReadError>;
}

/// Reads tree records from the registry contract through the query rpcs.
pub struct RegistryReader {
    rpcs: Arc<RpcPool>,
    contract: Address,
}

impl RegistryReader {
    pub fn new(rpcs: Arc<RpcPool>, contract: Address) -> Self {
        Self { rpcs, contract }
    }
}

#[async_trait]
impl TreeStateReader for RegistryReader {
    async fn tree_ownership(&self, tree_id: U256) -> Result<TreeOwnership, ChainReadError> {
        let tree = self
            .rpcs
            .read_contract_state(self.contract, &treesCall { treeId: tree_id })
            .await?;
        Ok(TreeOwnership {
            planter: tree.planter,
            assign_nonce: tree.assignNonce,
        })
    }
}

/// Handles one confirmed event. Errors are returned to the caller, which
/// decides whether processing of the block continues.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ChainEvent) -> Result<Settlement, ProcessError>;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for Arc<T> {
    async fn handle(&self, event: &ChainEvent) -> Result<Settlement, ProcessError> {
        (**self).handle(event).await
    }
}

/// Settles pending offchain requests against registry events. Settling is a
/// `Pending -> Verified` compare-and-set, so replayed events are no-ops.
pub struct EventProcessor<R: ?Sized, T> {
    requests: Arc<R>,
    trees: T,
}

impl<R: RequestRepository + ?Sized, T: TreeStateReader> EventProcessor<R, T> {
    pub fn new(requests: Arc<R>, trees: T) -> Self {
        Self { requests, trees }
    }

    async fn request_key(&self, event: &TreeEvent) -> Result<(RequestKind, String), ProcessError> {
        Ok(match event {
            TreeEvent::Planted { planter, nonce } => {
                (RequestKind::Planting, nonce_key(*planter, *nonce))
            }
            TreeEvent::Assigned { tree_id } => {
                let tree = self.trees.tree_ownership(*tree_id).await?;
                (
                    RequestKind::Assignment,
                    nonce_key(tree.planter, tree.assign_nonce),
                )
            }
            TreeEvent::Updated { tree_id } => (RequestKind::Update, tree_id.to_string()),
        })
    }

    async fn settle(&self, kind: RequestKind, key: &str) -> Result<Settlement, ProcessError> {
        let Some(record) = self.requests.find_request(kind, key).await? else {
            debug!(table = kind.table_name(), key, "no offchain request for event");
            return Ok(Settlement::NotFound);
        };
        if record.status != RequestStatus::Pending {
            debug!(
                table = kind.table_name(),
                key,
                status = ?record.status,
                "request already settled"
            );
            return Ok(Settlement::AlreadySettled(record.status));
        }

        match self
            .requests
            .transition_request(kind, key, RequestStatus::Pending, RequestStatus::Verified)
            .await?
        {
            StatusTransition::Applied(record) => {
                info!(
                    table = kind.table_name(),
                    key,
                    request_id = %record.request_id,
                    "request verified"
                );
                Ok(Settlement::Settled {
                    request_id: record.request_id,
                })
            }
            StatusTransition::Unchanged(status) => Ok(Settlement::AlreadySettled(status)),
            StatusTransition::Missing => Ok(Settlement::NotFound),
        }
    }
}

#[async_trait]
impl<R: RequestRepository + ?Sized, T: TreeStateReader> EventHandler for EventProcessor<R, T> {
    async fn handle(&self, event: &ChainEvent) -> Result<Settlement, ProcessError> {
        let (kind, key) = self.request_key(&event.event).await?;
        self.settle(kind, &key).await
    }
}

/// `"{planter}|{nonce}"` with the address as lowercase 0x-hex.
pub fn nonce_key(planter: Address, nonce: U256) -> String {
    format!("{}|{nonce}", planter.to_string().to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use local_db::DbConfig;
    use std::collections::HashMap;
    use std::path::PathBuf;

    const PLANTER: Address = address!("0x00000000000000000000000000000000000000aa");

    fn temp_root() -> PathBuf {
        let pid = std::process::id();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        let dir = std::env::temp_dir()
            .join("grove-processor-tests")
            .join(format!("{pid}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create temp db dir");
        dir
    }

    #[derive(Default)]
    struct StaticTrees {
        trees: HashMap<U256, TreeOwnership>,
    }

    #[async_trait]
    impl TreeStateReader for StaticTrees {
        async fn tree_ownership(&self, tree_id: U256) -> Result<TreeOwnership, ChainReadError> {
            self.trees
                .get(&tree_id)
                .copied()
                .ok_or(ChainReadError::NoHealthyRpc)
        }
    }

    fn processor(trees: StaticTrees) -> (Arc<DbStore>, EventProcessor<DbStore, StaticTrees>) {
        let db = Arc::new(DbStore::open(DbConfig { root_dir: temp_root() }).expect("open db"));
        (db.clone(), EventProcessor::new(db, trees))
    }

    fn event(event: TreeEvent) -> ChainEvent {
        ChainEvent {
            block_number: 100,
            log_index: 0,
            transaction_hash: None,
            event,
        }
    }

    #[test]
    fn nonce_key_is_lowercase() {
        assert_eq!(
            nonce_key(PLANTER, U256::from(7)),
            "0x00000000000000000000000000000000000000aa|7"
        );
    }

    #[tokio::test]
    async fn planting_settles_once() {
        let (db, processor) = processor(StaticTrees::default());
        let key = nonce_key(PLANTER, U256::from(7));
        db.put_request(
            RequestKind::Planting,
            &key,
            &RequestRecord::pending("plant-1").expect("record"),
        )
        .expect("put request");

        let planted = event(TreeEvent::Planted {
            planter: PLANTER,
            nonce: U256::from(7),
        });
        let first = processor.handle(&planted).await.expect("handle");
        assert_eq!(
            first,
            Settlement::Settled {
                request_id: "plant-1".to_string()
            }
        );
        let second = processor.handle(&planted).await.expect("replay");
        assert_eq!(second, Settlement::AlreadySettled(RequestStatus::Verified));

        let stored = db
            .get_request(RequestKind::Planting, &key)
            .expect("get")
            .expect("record");
        assert_eq!(stored.status, RequestStatus::Verified);
    }

    #[tokio::test]
    async fn unknown_request_is_not_an_error() {
        let (db, processor) = processor(StaticTrees::default());
        let settlement = processor
            .handle(&event(TreeEvent::Planted {
                planter: PLANTER,
                nonce: U256::from(99),
            }))
            .await
            .expect("handle");
        assert_eq!(settlement, Settlement::NotFound);
        assert!(
            db.get_request(RequestKind::Planting, &nonce_key(PLANTER, U256::from(99)))
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn rejected_request_is_left_alone() {
        let (db, processor) = processor(StaticTrees::default());
        let mut record = RequestRecord::pending("update-3").expect("record");
        record.status = RequestStatus::Rejected;
        db.put_request(RequestKind::Update, "3", &record)
            .expect("put request");

        let settlement = processor
            .handle(&event(TreeEvent::Updated {
                tree_id: U256::from(3),
            }))
            .await
            .expect("handle");
        assert_eq!(settlement, Settlement::AlreadySettled(RequestStatus::Rejected));
    }

    #[tokio::test]
    async fn assignment_is_keyed_by_onchain_owner() {
        let mut trees = StaticTrees::default();
        trees.trees.insert(
            U256::from(42),
            TreeOwnership {
                planter: PLANTER,
                assign_nonce: U256::from(2),
            },
        );
        let (db, processor) = processor(trees);
        db.put_request(
            RequestKind::Assignment,
            &nonce_key(PLANTER, U256::from(2)),
            &RequestRecord::pending("assign-9").expect("record"),
        )
        .expect("put request");

        let settlement = processor
            .handle(&event(TreeEvent::Assigned {
                tree_id: U256::from(42),
            }))
            .await
            .expect("handle");
        assert_eq!(
            settlement,
            Settlement::Settled {
                request_id: "assign-9".to_string()
            }
        );
    }

    #[tokio::test]
    async fn assignment_replay_is_idempotent() {
        let mut trees = StaticTrees::default();
        trees.trees.insert(
            U256::from(42),
            TreeOwnership {
                planter: PLANTER,
                assign_nonce: U256::from(2),
            },
        );
        let (db, processor) = processor(trees);
        let key = nonce_key(PLANTER, U256::from(2));
        db.put_request(
            RequestKind::Assignment,
            &key,
            &RequestRecord::pending("assign-9").expect("record"),
        )
        .expect("put request");

        let assigned = event(TreeEvent::Assigned {
            tree_id: U256::from(42),
        });
        let first = processor.handle(&assigned).await.expect("handle");
        assert_eq!(
            first,
            Settlement::Settled {
                request_id: "assign-9".to_string()
            }
        );
        let replay = processor.handle(&assigned).await.expect("replay");
        assert_eq!(replay, Settlement::AlreadySettled(RequestStatus::Verified));

        let stored = db
            .get_request(RequestKind::Assignment, &key)
            .expect("get")
            .expect("record");
        assert_eq!(stored.status, RequestStatus::Verified);
        assert_eq!(stored.request_id, "assign-9");
    }

    #[tokio::test]
    async fn failed_tree_read_surfaces_error() {
        let (_db, processor) = processor(StaticTrees::default());
        let err = processor
            .handle(&event(TreeEvent::Assigned {
                tree_id: U256::from(5),
            }))
            .await
            .expect_err("missing tree");
        assert!(matches!(err, ProcessError::ChainRead(ChainReadError::NoHealthyRpc)));
    }
}
