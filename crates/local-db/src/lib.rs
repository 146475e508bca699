use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadOnlyDatabase, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const CHECKPOINT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("checkpoint");
const PLANTING_REQUESTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("planting_requests");
const ASSIGNMENT_REQUESTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("assignment_requests");
const UPDATE_REQUESTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("update_requests");

const META_KEY: &str = "meta";
const GROVE_DIR: &str = "grove";

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub root_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("db"),
        }
    }
}

#[derive(Debug)]
pub struct DbStore {
    db: Database,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("db error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("unsupported schema version {version}")]
    UnsupportedSchemaVersion { version: u32 },
    #[error("checkpoint regression: stored {stored}, attempted {attempted}")]
    CheckpointRegressed { stored: u64, attempted: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub schema_version: u32,
    pub app_version: String,
    pub created_at: u64,
}

impl Meta {
    fn new() -> Result<Self, DbError> {
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: now_epoch_secs()?,
        })
    }
}

/// Last block whose events were all attempted by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub last_block: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Verified,
    Rejected,
}

/// Which offchain request table a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Planting,
    Assignment,
    Update,
}

impl RequestKind {
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Planting => "planting_requests",
            Self::Assignment => "assignment_requests",
            Self::Update => "update_requests",
        }
    }

    fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            Self::Planting => PLANTING_REQUESTS_TABLE,
            Self::Assignment => ASSIGNMENT_REQUESTS_TABLE,
            Self::Update => UPDATE_REQUESTS_TABLE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub status: RequestStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RequestRecord {
    pub fn pending(request_id: impl Into<String>) -> Result<Self, DbError> {
        let now = now_epoch_secs()?;
        Ok(Self {
            request_id: request_id.into(),
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Outcome of a status-gated update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTransition {
    Applied(RequestRecord),
    Unchanged(RequestStatus),
    Missing,
}

impl DbStore {
    pub fn open(config: DbConfig) -> Result<Self, DbError> {
        let root_dir = config.root_dir;
        let grove_dir = grove_dir(&root_dir);
        std::fs::create_dir_all(&grove_dir)?;
        let db_path = db_path(&root_dir);

        loop {
            let db = if db_path.exists() {
                Database::open(&db_path)?
            } else {
                Database::create(&db_path)?
            };

            let store = Self { db };
            store.initialize_schema()?;

            match store.read_meta()? {
                None => {
                    let meta = Meta::new()?;
                    store.write_meta(&meta)?;
                    return Ok(store);
                }
                Some(meta) if meta.schema_version > CURRENT_SCHEMA_VERSION => {
                    drop(store);
                    backup_db(&db_path)?;
                    continue;
                }
                Some(meta) if meta.schema_version < CURRENT_SCHEMA_VERSION => {
                    if let Err(err) =
                        store.run_migrations(meta.schema_version, CURRENT_SCHEMA_VERSION)
                    {
                        if matches!(err, DbError::UnsupportedSchemaVersion { .. }) {
                            drop(store);
                            backup_db(&db_path)?;
                            continue;
                        }
                        return Err(err);
                    }

                    let meta = Meta {
                        schema_version: CURRENT_SCHEMA_VERSION,
                        app_version: env!("CARGO_PKG_VERSION").to_string(),
                        created_at: meta.created_at,
                    };
                    store.write_meta(&meta)?;
                    return Ok(store);
                }
                Some(_) => return Ok(store),
            }
        }
    }

    pub fn get_checkpoint(&self, listener: &str) -> Result<Option<CheckpointMeta>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHECKPOINT_TABLE)?;
        match table.get(listener)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Overwrites the checkpoint in one write transaction. A value below the
    /// stored one is rejected and nothing is written.
    pub fn put_checkpoint(&self, listener: &str, last_block: u64) -> Result<CheckpointMeta, DbError> {
        let meta = CheckpointMeta {
            last_block,
            updated_at: now_epoch_secs()?,
        };
        let data = encode(&meta)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(CHECKPOINT_TABLE)?;
            let stored: Option<CheckpointMeta> = match table.get(listener)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            if let Some(stored) = stored
                && stored.last_block > last_block
            {
                return Err(DbError::CheckpointRegressed {
                    stored: stored.last_block,
                    attempted: last_block,
                });
            }
            table.insert(listener, data.as_slice())?;
        }
        txn.commit()?;
        Ok(meta)
    }

    pub fn get_request(
        &self,
        kind: RequestKind,
        key: &str,
    ) -> Result<Option<RequestRecord>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(kind.table())?;
        match table.get(key)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn put_request(
        &self,
        kind: RequestKind,
        key: &str,
        record: &RequestRecord,
    ) -> Result<(), DbError> {
        let data = encode(record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(kind.table())?;
            table.insert(key, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Moves a request from `from` to `to` only if it is currently in `from`.
    pub fn transition_request(
        &self,
        kind: RequestKind,
        key: &str,
        from: RequestStatus,
        to: RequestStatus,
    ) -> Result<StatusTransition, DbError> {
        let txn = self.db.begin_write()?;
        let transition = {
            let mut table = txn.open_table(kind.table())?;
            let current: Option<RequestRecord> = match table.get(key)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };
            match current {
                None => StatusTransition::Missing,
                Some(record) if record.status != from => StatusTransition::Unchanged(record.status),
                Some(mut record) => {
                    record.status = to;
                    record.updated_at = now_epoch_secs()?;
                    let data = encode(&record)?;
                    table.insert(key, data.as_slice())?;
                    StatusTransition::Applied(record)
                }
            }
        };
        txn.commit()?;
        Ok(transition)
    }

    fn initialize_schema(&self) -> Result<(), DbError> {
        let txn = self.db.begin_write()?;
        txn.open_table(META_TABLE)?;
        txn.open_table(CHECKPOINT_TABLE)?;
        txn.open_table(PLANTING_REQUESTS_TABLE)?;
        txn.open_table(ASSIGNMENT_REQUESTS_TABLE)?;
        txn.open_table(UPDATE_REQUESTS_TABLE)?;
        txn.commit()?;
        Ok(())
    }

    fn read_meta(&self) -> Result<Option<Meta>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        match table.get(META_KEY)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn write_meta(&self, meta: &Meta) -> Result<(), DbError> {
        let data = encode(meta)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META_TABLE)?;
            table.insert(META_KEY, data.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn run_migrations(&self, from: u32, to: u32) -> Result<(), DbError> {
        let mut version = from;
        while version < to {
            match version {
                0 => {}
                _ => {
                    return Err(DbError::UnsupportedSchemaVersion { version });
                }
            }
            version += 1;
        }
        Ok(())
    }
}

/// Read-only view of a database file, for inspection while a listener may be
/// writing to it. Nothing is created or migrated.
pub struct DbSnapshot {
    db: ReadOnlyDatabase,
}

impl DbSnapshot {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        Ok(Self {
            db: ReadOnlyDatabase::open(path)?,
        })
    }

    pub fn meta(&self) -> Result<Option<Meta>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META_TABLE)?;
        match table.get(META_KEY)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Every stored checkpoint with its listener key.
    pub fn checkpoints(&self) -> Result<Vec<(String, CheckpointMeta)>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHECKPOINT_TABLE)?;
        let mut checkpoints = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            checkpoints.push((key.value().to_string(), decode(value.value())?));
        }
        Ok(checkpoints)
    }

    pub fn request(
        &self,
        kind: RequestKind,
        key: &str,
    ) -> Result<Option<RequestRecord>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(kind.table())?;
        match table.get(key)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Requests of one kind in key order, optionally only those in `status`.
    pub fn requests(
        &self,
        kind: RequestKind,
        status: Option<RequestStatus>,
        limit: usize,
    ) -> Result<Vec<(String, RequestRecord)>, DbError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(kind.table())?;
        let mut requests = Vec::new();
        for entry in table.iter()? {
            if requests.len() >= limit {
                break;
            }
            let (key, value) = entry?;
            let record: RequestRecord = decode(value.value())?;
            if status.is_none_or(|status| record.status == status) {
                requests.push((key.value().to_string(), record));
            }
        }
        Ok(requests)
    }
}

/// Checkpoint key for one listener instance.
pub fn checkpoint_key(chain_id: u64, contract: &str) -> String {
    format!("{chain_id}|{}", contract.to_ascii_lowercase())
}

pub fn resolve_db_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        db_path(path)
    } else {
        path.to_path_buf()
    }
}

fn grove_dir(root_dir: &Path) -> PathBuf {
    root_dir.join(GROVE_DIR)
}

fn db_path(root_dir: &Path) -> PathBuf {
    grove_dir(root_dir).join("db.redb")
}

fn backup_db(db_path: &Path) -> Result<(), DbError> {
    let ts = now_epoch_secs()?;
    let file_name = format!("db.redb.bak.{ts}");
    let backup_path = db_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(file_name);
    std::fs::rename(db_path, backup_path)?;
    Ok(())
}

fn now_epoch_secs() -> Result<u64, DbError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(std::io::Error::other)?;
    Ok(now.as_secs())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, DbError> {
    Ok(rmp_serde::from_slice(data)?)
}
