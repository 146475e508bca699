use config::Config;
use event_sync::{
    AlertSink, DbCheckpointStore, EventProcessor, ListenerConfig, ListenerSupervisor,
    LogAlertSink, RegistryReader, RpcEventSource, StreamOptions, WebhookAlertSink,
};
use eyre::{Result, WrapErr, bail};
use grove_core::RpcPool;
use local_db::{DbConfig, DbStore};
use std::fs;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(StructOpt)]
#[structopt(name = "grove-listener")]
struct Options {
    #[structopt(short, long)]
    pub cfg: PathBuf,
    #[structopt(short, long)]
    pub debug_log: Option<PathBuf>,
    #[structopt(long)]
    pub debug_level: Option<String>,
}

const DEFAULT_DEBUG_LEVEL: &str = "info,event_sync=debug,grove_core=debug";

#[tokio::main]
async fn main() -> Result<()> {
    let opt: Options = Options::from_args();

    let (console_non_blocking, _console_guard) = tracing_appender::non_blocking(std::io::stdout());
    let debug_log = opt
        .debug_log
        .map(|path| {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(path)
                .wrap_err("open debug log for writing")
        })
        .transpose()?
        .map(tracing_appender::non_blocking);
    tracing_subscriber::registry()
        .with(debug_log.as_ref().map(|(handle, _)| {
            let debug_level = opt.debug_level.as_deref().unwrap_or(DEFAULT_DEBUG_LEVEL);
            let filter = EnvFilter::builder()
                .parse(debug_level)
                .unwrap_or_else(|error| {
                    println!("failed to build debug log filter: {error:?}, using default: {DEFAULT_DEBUG_LEVEL}");
                    EnvFilter::builder()
                        .parse(DEFAULT_DEBUG_LEVEL)
                        .unwrap_or_else(|_| EnvFilter::builder().from_env_lossy())
                });
            tracing_logfmt::builder()
                .with_span_name(false)
                .with_span_path(true)
                .with_level(false)
                .with_target(false)
                .with_timestamp(true)
                .layer()
                .with_writer(handle.clone())
                .with_filter(filter)
        }))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .with_writer(console_non_blocking)
                .with_filter(
                    EnvFilter::builder()
                        .with_default_directive(LevelFilter::INFO.into())
                        .from_env_lossy(),
                ),
        )
        .init();

    let cfg = load_config(&opt.cfg)?;
    let db_dir = cfg.db_dir.clone().unwrap_or_else(|| PathBuf::from("db"));
    let db = Arc::new(DbStore::open(DbConfig { root_dir: db_dir }).wrap_err("open local db")?);

    let rpcs = Arc::new(
        RpcPool::new(cfg.query_rpcs.clone(), cfg.query_rpc_cooldown.into_inner())
            .wrap_err("build query rpc pool")?,
    );
    if rpcs.is_empty() {
        bail!("at least one query rpc is required");
    }

    let alerts: Arc<dyn AlertSink> = match cfg.alert.clone() {
        Some(alert) => Arc::new(
            WebhookAlertSink::new(alert.webhook_url, alert.username)
                .wrap_err("build alert webhook client")?,
        ),
        None => Arc::new(LogAlertSink),
    };

    let backoff = cfg.backoff.into_inner();
    let options = StreamOptions {
        poll_interval: cfg.poll_interval.into_inner(),
        confirmations: cfg.confirmations,
        chunk_size: cfg.chunk_size,
        concurrency: cfg.concurrency,
        backoff,
        failure_alert_threshold: cfg.failure_alert_threshold,
    };
    let source = RpcEventSource::new(cfg.stream_rpc.clone(), cfg.contract_address, options);
    let checkpoints = DbCheckpointStore::new(db.clone(), cfg.chain_id, cfg.contract_address);
    let processor = EventProcessor::new(
        db.clone(),
        RegistryReader::new(rpcs, cfg.contract_address),
    );
    let listener_cfg = ListenerConfig {
        name: cfg.contract_name.clone(),
        start_block: cfg.start_block,
        reconnect_delay: backoff,
        close_recheck_delay: cfg.close_recheck_delay.into_inner(),
        alert_cooldown: cfg.alert_cooldown.into_inner(),
    };
    let supervisor = ListenerSupervisor::new(listener_cfg, source, checkpoints, processor, alerts);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for shutdown signal");
                return;
            }
            info!("shutdown requested");
            cancel.cancel();
        }
    });

    info!(
        chain_id = cfg.chain_id,
        contract = %cfg.contract_address,
        name = %cfg.contract_name,
        "starting listener"
    );
    supervisor
        .run(cancel)
        .instrument(info_span!("listener", chain_id = cfg.chain_id))
        .await
        .wrap_err("listener stopped")
}

fn load_config(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path).wrap_err("read a config file")?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("json") => {
            serde_json::from_str(&data).wrap_err("parse config")
        }
        Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
            serde_yaml::from_str(&data).wrap_err("parse config")
        }
        _ => bail!("unsupported config file format"),
    }
}
