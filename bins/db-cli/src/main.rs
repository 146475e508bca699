use eyre::{Result, WrapErr, bail};
use local_db::{
    CheckpointMeta, DbSnapshot, RequestKind, RequestRecord, RequestStatus, resolve_db_file,
};
use serde::Serialize;
use std::path::PathBuf;
use structopt::StructOpt;

/// Inspects a listener database without writing to it.
#[derive(Debug, StructOpt)]
#[structopt(name = "db-cli")]
struct Options {
    /// Database directory (as in `db_dir`) or the redb file itself.
    #[structopt(long)]
    path: PathBuf,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Schema version and creation time.
    Meta,
    /// Last processed block per listener.
    Checkpoints {
        #[structopt(long)]
        chain_id: Option<u64>,
        #[structopt(long)]
        contract: Option<String>,
    },
    /// Offchain requests of one kind: planting, assignment or update.
    Requests {
        #[structopt(parse(try_from_str = parse_kind))]
        kind: RequestKind,
        #[structopt(long, parse(try_from_str = parse_status))]
        status: Option<RequestStatus>,
        #[structopt(long, conflicts_with = "status")]
        key: Option<String>,
        #[structopt(long, default_value = "100")]
        limit: usize,
    },
}

#[derive(Serialize)]
struct CheckpointView<'a> {
    chain_id: &'a str,
    contract: &'a str,
    last_block: u64,
    updated_at: u64,
}

#[derive(Serialize)]
struct RequestView<'a> {
    table: &'static str,
    key: &'a str,
    #[serde(flatten)]
    record: &'a RequestRecord,
}

fn main() -> Result<()> {
    let opt = Options::from_args();

    let db_path = resolve_db_file(&opt.path);
    if !db_path.exists() {
        bail!("db not found: {}", db_path.display());
    }
    let snapshot = DbSnapshot::open(&db_path).wrap_err("open db read-only")?;

    match opt.command {
        Command::Meta => match snapshot.meta()? {
            Some(meta) => print_json(&meta),
            None => bail!("db has no meta record"),
        },
        Command::Checkpoints { chain_id, contract } => {
            let contract = contract.map(|contract| contract.to_ascii_lowercase());
            for (key, meta) in snapshot.checkpoints()? {
                let Some(view) = checkpoint_view(&key, &meta) else {
                    eprintln!("skipping malformed checkpoint key {key}");
                    continue;
                };
                if chain_id.is_some_and(|chain_id| view.chain_id != chain_id.to_string())
                    || contract.as_deref().is_some_and(|contract| view.contract != contract)
                {
                    continue;
                }
                print_json(&view)?;
            }
            Ok(())
        }
        Command::Requests {
            kind,
            key: Some(key),
            ..
        } => match snapshot.request(kind, &key)? {
            Some(record) => print_json(&RequestView {
                table: kind.table_name(),
                key: &key,
                record: &record,
            }),
            None => bail!("no {} request with key {key}", kind.table_name()),
        },
        Command::Requests {
            kind,
            status,
            key: None,
            limit,
        } => {
            for (key, record) in snapshot.requests(kind, status, limit)? {
                print_json(&RequestView {
                    table: kind.table_name(),
                    key: &key,
                    record: &record,
                })?;
            }
            Ok(())
        }
    }
}

fn parse_kind(value: &str) -> Result<RequestKind, String> {
    match value.to_ascii_lowercase().as_str() {
        "planting" => Ok(RequestKind::Planting),
        "assignment" => Ok(RequestKind::Assignment),
        "update" => Ok(RequestKind::Update),
        other => Err(format!(
            "unknown request kind {other}, expected planting, assignment or update"
        )),
    }
}

fn parse_status(value: &str) -> Result<RequestStatus, String> {
    match value.to_ascii_lowercase().as_str() {
        "pending" => Ok(RequestStatus::Pending),
        "verified" => Ok(RequestStatus::Verified),
        "rejected" => Ok(RequestStatus::Rejected),
        other => Err(format!(
            "unknown status {other}, expected pending, verified or rejected"
        )),
    }
}

/// Checkpoint keys are `"{chain_id}|{contract}"`.
fn checkpoint_view<'a>(key: &'a str, meta: &CheckpointMeta) -> Option<CheckpointView<'a>> {
    let (chain_id, contract) = key.split_once('|')?;
    Some(CheckpointView {
        chain_id,
        contract,
        last_block: meta.last_block,
        updated_at: meta.updated_at,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let data = serde_json::to_string(value).wrap_err("serialize json")?;
    println!("{data}");
    Ok(())
}
