use std::sync::atomic::{AtomicU64, Ordering};

use alloy::primitives::Address;
use alloy::sol_types::SolEvent;
use alloy_provider::{DynProvider, Provider};
use alloy_rpc_types_eth::{Filter, Log};
use alloy_transport::{TransportError, TransportErrorKind};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use grove_core::contracts::tree_registry::{
    TREE_EVENT_SIGNATURES, TreeAssigned, TreePlanted, TreeUpdated,
};
use grove_core::provider::{StreamTransport, connect_stream_provider};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use crate::types::{
    BlockBatch, ChainEvent, ConnectionSignal, ConnectionState, StreamOptions, TreeEvent,
};

const BLOCK_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error("rpc error: {0}")]
    Rpc(#[from] TransportError),
    #[error("subscriber dropped")]
    SubscriberGone,
}

/// One attempt at a chain connection. State changes are published on a watch
/// channel and pushed as [`ConnectionSignal`]s to whoever holds the
/// subscription.
pub struct Connection {
    generation: u64,
    provider: Option<DynProvider>,
    state_tx: watch::Sender<ConnectionState>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
    signal_rx: mpsc::UnboundedReceiver<ConnectionSignal>,
}

impl Connection {
    /// Never fails: a connect error is reported as an `Error` signal on the
    /// subscription built from this connection.
    pub async fn connect(url: &Url, generation: u64) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let provider = match connect_stream_provider(url, StreamTransport::default()).await {
            Ok(provider) => {
                info!(generation, url = url.as_str(), "chain connection established");
                state_tx.send_replace(ConnectionState::Connected);
                let _ = signal_tx.send(ConnectionSignal::Connected);
                Some(provider)
            }
            Err(err) => {
                warn!(?err, generation, url = url.as_str(), "chain connection failed");
                state_tx.send_replace(ConnectionState::Erroring);
                let _ = signal_tx.send(ConnectionSignal::Error(err.to_string()));
                None
            }
        };
        Self {
            generation,
            provider,
            state_tx,
            signal_tx,
            signal_rx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Streams every registry event of `contract` from `from_block` onwards,
    /// once it is `confirmations` blocks deep. Blocks arrive in ascending
    /// order with events in log order.
    pub fn subscribe_confirmed_events(
        self,
        contract: Address,
        from_block: u64,
        options: StreamOptions,
    ) -> Subscription {
        let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let state_rx = self.state_tx.subscribe();
        let cancel = CancellationToken::new();
        if let Some(provider) = self.provider {
            let task = StreamTask {
                provider,
                contract,
                next_block: from_block,
                options,
                consecutive_failures: 0,
                block_tx,
                state_tx: self.state_tx,
                signal_tx: self.signal_tx,
                cancel: cancel.clone(),
            };
            let generation = self.generation;
            tokio::spawn(task.run().instrument(info_span!("chain_stream", generation)));
        }
        Subscription::new(
            self.generation,
            block_rx,
            self.signal_rx,
            state_rx,
            cancel,
        )
    }
}

/// Receiving end of a confirmed-event stream. Dropping it stops the stream.
pub struct Subscription {
    pub(crate) generation: u64,
    pub(crate) blocks: mpsc::Receiver<BlockBatch>,
    pub(crate) signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl Subscription {
    pub fn new(
        generation: u64,
        blocks: mpsc::Receiver<BlockBatch>,
        signals: mpsc::UnboundedReceiver<ConnectionSignal>,
        state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            generation,
            blocks,
            signals,
            state,
            cancel,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Opens a new connection generation streaming from `from_block`.
    async fn open(&self, from_block: u64) -> Subscription;
}

pub struct RpcEventSource {
    url: Url,
    contract: Address,
    options: StreamOptions,
    generation: AtomicU64,
}

impl RpcEventSource {
    pub fn new(url: Url, contract: Address, options: StreamOptions) -> Self {
        Self {
            url,
            contract,
            options,
            generation: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EventSource for RpcEventSource {
    async fn open(&self, from_block: u64) -> Subscription {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        Connection::connect(&self.url, generation)
            .await
            .subscribe_confirmed_events(self.contract, from_block, self.options.clone())
    }
}

struct StreamTask {
    provider: DynProvider,
    contract: Address,
    next_block: u64,
    options: StreamOptions,
    consecutive_failures: u32,
    block_tx: mpsc::Sender<BlockBatch>,
    state_tx: watch::Sender<ConnectionState>,
    signal_tx: mpsc::UnboundedSender<ConnectionSignal>,
    cancel: CancellationToken,
}

impl StreamTask {
    async fn run(mut self) {
        let mut delay = std::time::Duration::ZERO;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
            delay = self.options.poll_interval;

            match self.poll_confirmed().await {
                Ok(()) => self.consecutive_failures = 0,
                Err(StreamError::SubscriberGone) => break,
                Err(StreamError::Rpc(err)) => {
                    if let Some(signal) = transport_signal(&err) {
                        warn!(?err, next_block = self.next_block, "chain stream lost");
                        self.fail(signal);
                        break;
                    }
                    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                    warn!(
                        ?err,
                        next_block = self.next_block,
                        failures = self.consecutive_failures,
                        backoff = ?self.options.backoff,
                        "log query failed, retrying"
                    );
                    if self.consecutive_failures == self.options.failure_alert_threshold {
                        self.signal(ConnectionSignal::Degraded(format!(
                            "{} consecutive log query failures, last: {err}",
                            self.consecutive_failures
                        )));
                    }
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = tokio::time::sleep(self.options.backoff) => {}
                    }
                }
            }
        }
        debug!("chain stream stopped");
    }

    async fn poll_confirmed(&mut self) -> Result<(), StreamError> {
        let head = self.provider.get_block_number().await?;
        let safe_head = head.saturating_sub(self.options.confirmations);
        if self.next_block > safe_head {
            return Ok(());
        }
        debug!(
            head,
            safe_head,
            from_block = self.next_block,
            "fetching confirmed logs"
        );

        let provider = &self.provider;
        let contract = self.contract;
        let mut fetched = stream::iter(block_ranges(
            self.next_block,
            safe_head,
            self.options.chunk_size,
        ))
        .map(|(from_block, to_block)| async move {
            fetch_logs(provider, contract, from_block, to_block)
                .await
                .map(|logs| (to_block, logs))
        })
        .buffered(self.options.concurrency.max(1));

        while let Some(result) = fetched.next().await {
            let (to_block, mut logs) = result?;
            if self.cancel.is_cancelled() {
                return Err(StreamError::SubscriberGone);
            }
            sort_logs(&mut logs);
            let events = logs.iter().filter_map(decode_or_skip).collect();
            for batch in group_by_block(events, to_block) {
                self.block_tx
                    .send(batch)
                    .await
                    .map_err(|_| StreamError::SubscriberGone)?;
            }
            self.next_block = to_block + 1;
        }
        Ok(())
    }

    fn fail(&self, signal: ConnectionSignal) {
        let state = match signal {
            ConnectionSignal::Closed => ConnectionState::Closed,
            _ => ConnectionState::Erroring,
        };
        self.state_tx.send_replace(state);
        self.signal(signal);
    }

    fn signal(&self, signal: ConnectionSignal) {
        if self.signal_tx.send(signal).is_err() {
            debug!("subscription gone before connection signal");
        }
    }
}

async fn fetch_logs(
    provider: &DynProvider,
    contract: Address,
    from_block: u64,
    to_block: u64,
) -> Result<Vec<Log>, TransportError> {
    let filter = Filter::new()
        .select(from_block..=to_block)
        .address(contract)
        .event_signature(TREE_EVENT_SIGNATURES.to_vec());
    provider.get_logs(&filter).await
}

/// Transport failures end the stream; everything else (rpc error responses,
/// throttling, bad payloads) is retried on the same connection.
fn transport_signal(err: &TransportError) -> Option<ConnectionSignal> {
    match err {
        TransportError::Transport(TransportErrorKind::BackendGone) => {
            Some(ConnectionSignal::Closed)
        }
        TransportError::Transport(kind)
            if kind
                .as_http_error()
                .is_some_and(|err| err.status == 429 || err.body.contains("limit exceeded")) =>
        {
            None
        }
        TransportError::Transport(kind) => Some(ConnectionSignal::Error(kind.to_string())),
        _ => None,
    }
}

fn block_ranges(
    from_block: u64,
    to_block: u64,
    chunk_size: u64,
) -> impl Iterator<Item = (u64, u64)> {
    let step = chunk_size.max(1);
    let mut next = Some(from_block).filter(|block| *block <= to_block);
    std::iter::from_fn(move || {
        let start = next?;
        let end = start.saturating_add(step - 1).min(to_block);
        next = end.checked_add(1).filter(|block| *block <= to_block);
        Some((start, end))
    })
}

fn sort_logs(logs: &mut [Log]) {
    logs.sort_by_key(|log| {
        (
            log.block_number.unwrap_or_default(),
            log.log_index.unwrap_or_default(),
        )
    });
}

fn decode_or_skip(log: &Log) -> Option<ChainEvent> {
    match decode_event(log) {
        Ok(Some(event)) => Some(event),
        Ok(None) => {
            warn!(
                block_number = log.block_number,
                log_index = log.log_index,
                tx = ?log.transaction_hash,
                topic0 = ?log.inner.topics().first(),
                "dropping log outside the registry event set"
            );
            None
        }
        Err(err) => {
            warn!(
                ?err,
                block_number = log.block_number,
                log_index = log.log_index,
                tx = ?log.transaction_hash,
                "dropping undecodable log"
            );
            None
        }
    }
}

/// Decodes a registry log. Logs with an unknown topic0 or without a position
/// yield `Ok(None)`.
pub fn decode_event(log: &Log) -> Result<Option<ChainEvent>, alloy::sol_types::Error> {
    let (Some(block_number), Some(log_index)) = (log.block_number, log.log_index) else {
        return Ok(None);
    };
    let topic0 = log.inner.topics().first().copied().unwrap_or_default();
    let event = if topic0 == TreePlanted::SIGNATURE_HASH {
        let decoded = TreePlanted::decode_log(&log.inner)?.data;
        TreeEvent::Planted {
            planter: decoded.planter,
            nonce: decoded.nonce,
        }
    } else if topic0 == TreeAssigned::SIGNATURE_HASH {
        let decoded = TreeAssigned::decode_log(&log.inner)?.data;
        TreeEvent::Assigned {
            tree_id: decoded.treeId,
        }
    } else if topic0 == TreeUpdated::SIGNATURE_HASH {
        let decoded = TreeUpdated::decode_log(&log.inner)?.data;
        TreeEvent::Updated {
            tree_id: decoded.treeId,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(ChainEvent {
        block_number,
        log_index,
        transaction_hash: log.transaction_hash,
        event,
    }))
}

/// Groups sorted events into per-block batches. When the scanned range ends on
/// a block without events, an empty batch for `range_end` closes it so the
/// consumer can still advance.
fn group_by_block(events: Vec<ChainEvent>, range_end: u64) -> Vec<BlockBatch> {
    let mut batches: Vec<BlockBatch> = Vec::new();
    for event in events {
        match batches.last_mut() {
            Some(batch) if batch.block_number == event.block_number => batch.events.push(event),
            _ => batches.push(BlockBatch {
                block_number: event.block_number,
                events: vec![event],
            }),
        }
    }
    if batches.last().is_none_or(|batch| batch.block_number < range_end) {
        batches.push(BlockBatch {
            block_number: range_end,
            events: Vec::new(),
        });
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{B256, U64, U256, address};
    use alloy_provider::ProviderBuilder;
    use alloy_transport::mock::Asserter;
    use std::time::Duration;

    const REGISTRY: Address = address!("0x1111111111111111111111111111111111111111");

    fn rpc_log(inner: alloy::primitives::LogData, block_number: u64, log_index: u64) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: REGISTRY,
                data: inner,
            },
            block_number: Some(block_number),
            log_index: Some(log_index),
            transaction_hash: Some(B256::repeat_byte(0xab)),
            ..Default::default()
        }
    }

    fn updated(block_number: u64, log_index: u64) -> ChainEvent {
        ChainEvent {
            block_number,
            log_index,
            transaction_hash: None,
            event: TreeEvent::Updated {
                tree_id: U256::from(log_index),
            },
        }
    }

    #[test]
    fn decodes_registry_events() {
        let planter = address!("0x00000000000000000000000000000000000000aa");
        let log = rpc_log(
            TreePlanted {
                planter,
                nonce: U256::from(7),
            }
            .encode_log_data(),
            120,
            3,
        );
        let event = decode_event(&log).expect("decode").expect("known event");
        assert_eq!(event.block_number, 120);
        assert_eq!(event.log_index, 3);
        assert_eq!(
            event.event,
            TreeEvent::Planted {
                planter,
                nonce: U256::from(7)
            }
        );
        assert_eq!(event.name(), "TreePlanted");

        let log = rpc_log(
            TreeAssigned {
                treeId: U256::from(42),
            }
            .encode_log_data(),
            121,
            0,
        );
        let event = decode_event(&log).expect("decode").expect("known event");
        assert_eq!(
            event.event,
            TreeEvent::Assigned {
                tree_id: U256::from(42)
            }
        );
    }

    #[test]
    fn unknown_and_pending_logs_are_ignored() {
        let unknown = rpc_log(
            alloy::primitives::LogData::new_unchecked(vec![B256::repeat_byte(1)], Default::default()),
            5,
            0,
        );
        assert!(decode_event(&unknown).expect("decode").is_none());
        assert!(decode_or_skip(&unknown).is_none());

        let mut pending = rpc_log(
            TreeUpdated {
                treeId: U256::from(1),
            }
            .encode_log_data(),
            5,
            1,
        );
        pending.block_number = None;
        assert!(decode_event(&pending).expect("decode").is_none());
        assert!(decode_or_skip(&pending).is_none());
    }

    #[test]
    fn truncated_log_fails_to_decode() {
        // indexed planter topic missing
        let log = rpc_log(
            alloy::primitives::LogData::new_unchecked(
                vec![TreePlanted::SIGNATURE_HASH],
                U256::from(7).to_be_bytes::<32>().to_vec().into(),
            ),
            9,
            0,
        );
        assert!(decode_event(&log).is_err());
        assert!(decode_or_skip(&log).is_none());
    }

    #[test]
    fn sort_orders_by_block_then_index() {
        let data = || {
            TreeUpdated {
                treeId: U256::from(1),
            }
            .encode_log_data()
        };
        let mut logs = vec![
            rpc_log(data(), 11, 0),
            rpc_log(data(), 10, 4),
            rpc_log(data(), 10, 1),
        ];
        sort_logs(&mut logs);
        let order: Vec<_> = logs
            .iter()
            .map(|log| (log.block_number.unwrap(), log.log_index.unwrap()))
            .collect();
        assert_eq!(order, vec![(10, 1), (10, 4), (11, 0)]);
    }

    #[test]
    fn ranges_cover_span_in_chunks() {
        let ranges: Vec<_> = block_ranges(100, 104, 2).collect();
        assert_eq!(ranges, vec![(100, 101), (102, 103), (104, 104)]);
        assert_eq!(block_ranges(5, 4, 10).count(), 0);
        assert_eq!(block_ranges(7, 7, 0).collect::<Vec<_>>(), vec![(7, 7)]);
    }

    #[test]
    fn grouping_closes_quiet_range_end() {
        let batches = group_by_block(vec![updated(10, 0), updated(10, 1), updated(12, 0)], 15);
        let shape: Vec<_> = batches
            .iter()
            .map(|batch| (batch.block_number, batch.events.len()))
            .collect();
        assert_eq!(shape, vec![(10, 2), (12, 1), (15, 0)]);

        let batches = group_by_block(vec![updated(15, 0)], 15);
        assert_eq!(batches.len(), 1);

        let batches = group_by_block(Vec::new(), 20);
        assert_eq!(batches, vec![BlockBatch { block_number: 20, events: Vec::new() }]);
    }

    #[test]
    fn transport_failures_end_stream() {
        assert_eq!(
            transport_signal(&TransportErrorKind::backend_gone()),
            Some(ConnectionSignal::Closed)
        );
        assert!(matches!(
            transport_signal(&TransportErrorKind::custom_str("socket reset")),
            Some(ConnectionSignal::Error(_))
        ));
        assert_eq!(transport_signal(&TransportError::NullResp), None);
    }

    #[tokio::test]
    async fn dropping_subscription_cancels_stream() {
        let (_blocks_tx, blocks_rx) = mpsc::channel(1);
        let (_signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let cancel = CancellationToken::new();
        let subscription = Subscription::new(3, blocks_rx, signals_rx, state_rx, cancel.clone());
        assert_eq!(subscription.generation(), 3);
        assert_eq!(subscription.state(), ConnectionState::Connected);
        drop(subscription);
        assert!(cancel.is_cancelled());
    }

    struct MockedStream {
        task: StreamTask,
        blocks: mpsc::Receiver<BlockBatch>,
        state: watch::Receiver<ConnectionState>,
        signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    }

    fn stream_options(failure_alert_threshold: u32) -> StreamOptions {
        StreamOptions {
            poll_interval: Duration::from_secs(1),
            confirmations: 12,
            chunk_size: 5,
            concurrency: 1,
            backoff: Duration::from_secs(2),
            failure_alert_threshold,
        }
    }

    fn mocked_stream(asserter: &Asserter, options: StreamOptions, next_block: u64) -> MockedStream {
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter.clone())
            .erased();
        let (block_tx, blocks) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(ConnectionState::Connected);
        let (signal_tx, signals) = mpsc::unbounded_channel();
        MockedStream {
            task: StreamTask {
                provider,
                contract: REGISTRY,
                next_block,
                options,
                consecutive_failures: 0,
                block_tx,
                state_tx,
                signal_tx,
                cancel: CancellationToken::new(),
            },
            blocks,
            state,
            signals,
        }
    }

    fn drain_signals(
        signals: &mut mpsc::UnboundedReceiver<ConnectionSignal>,
    ) -> Vec<ConnectionSignal> {
        std::iter::from_fn(|| signals.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn poll_streams_confirmed_chunks() {
        let asserter = Asserter::new();
        asserter.push_success(&U64::from(120));
        asserter.push_success(&vec![rpc_log(
            TreeUpdated {
                treeId: U256::from(1),
            }
            .encode_log_data(),
            102,
            0,
        )]);
        asserter.push_success(&Vec::<Log>::new());
        let mut stream = mocked_stream(&asserter, stream_options(0), 100);

        stream.task.poll_confirmed().await.expect("poll");

        let mut shape = Vec::new();
        while let Ok(batch) = stream.blocks.try_recv() {
            shape.push((batch.block_number, batch.events.len()));
        }
        // safe head 108, scanned as 100..=104 and 105..=108
        assert_eq!(shape, vec![(102, 1), (104, 0), (108, 0)]);
        assert_eq!(stream.task.next_block, 109);
        assert!(asserter.read_q().is_empty());
    }

    #[tokio::test]
    async fn poll_waits_for_confirmation_depth() {
        let asserter = Asserter::new();
        asserter.push_success(&U64::from(105));
        let mut stream = mocked_stream(&asserter, stream_options(0), 100);

        stream.task.poll_confirmed().await.expect("poll");

        assert!(stream.blocks.try_recv().is_err());
        assert_eq!(stream.task.next_block, 100);
        assert!(asserter.read_q().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_query_failures_degrade_then_transport_loss_ends_stream() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("header not found");
        asserter.push_failure_msg("header not found");
        let MockedStream {
            task,
            mut signals,
            state,
            ..
        } = mocked_stream(&asserter, stream_options(2), 100);

        // an exhausted response queue fails at the transport
        task.run().await;

        let signals = drain_signals(&mut signals);
        assert_eq!(signals.len(), 2);
        assert!(matches!(signals[0], ConnectionSignal::Degraded(_)));
        assert!(matches!(signals[1], ConnectionSignal::Error(_)));
        assert_eq!(*state.borrow(), ConnectionState::Erroring);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_resets_failure_count() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("header not found");
        asserter.push_success(&U64::from(90));
        asserter.push_failure_msg("header not found");
        let MockedStream {
            task,
            mut signals,
            state,
            ..
        } = mocked_stream(&asserter, stream_options(2), 100);

        task.run().await;

        let signals = drain_signals(&mut signals);
        assert_eq!(signals.len(), 1);
        assert!(matches!(signals[0], ConnectionSignal::Error(_)));
        assert_eq!(*state.borrow(), ConnectionState::Erroring);
    }

    #[tokio::test]
    async fn dropped_subscriber_stops_stream_quietly() {
        let asserter = Asserter::new();
        asserter.push_success(&U64::from(120));
        asserter.push_success(&Vec::<Log>::new());
        asserter.push_success(&Vec::<Log>::new());
        let MockedStream {
            task,
            blocks,
            mut signals,
            state,
        } = mocked_stream(&asserter, stream_options(0), 100);
        drop(blocks);

        task.run().await;

        assert!(drain_signals(&mut signals).is_empty());
        assert_eq!(*state.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn cancelled_stream_makes_no_requests() {
        let asserter = Asserter::new();
        asserter.push_success(&U64::from(120));
        let MockedStream {
            task, mut signals, ..
        } = mocked_stream(&asserter, stream_options(0), 100);
        task.cancel.cancel();

        task.run().await;

        assert_eq!(asserter.read_q().len(), 1);
        assert!(drain_signals(&mut signals).is_empty());
    }

    #[tokio::test]
    async fn closed_backend_marks_connection_closed() {
        let asserter = Asserter::new();
        let MockedStream {
            task,
            mut signals,
            state,
            ..
        } = mocked_stream(&asserter, stream_options(0), 100);

        task.fail(ConnectionSignal::Closed);

        assert_eq!(*state.borrow(), ConnectionState::Closed);
        assert_eq!(drain_signals(&mut signals), vec![ConnectionSignal::Closed]);
    }
}
