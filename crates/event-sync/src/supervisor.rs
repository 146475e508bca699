use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{AlertGate, AlertSink};
use crate::chain::{EventSource, Subscription};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::processor::EventHandler;
use crate::types::{BlockBatch, ConnectionSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Subscribing,
    Draining,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Contract name used in logs and alerts.
    pub name: String,
    /// First block scanned when no checkpoint exists.
    pub start_block: u64,
    pub reconnect_delay: Duration,
    pub close_recheck_delay: Duration,
    pub alert_cooldown: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("load checkpoint: {0}")]
    LoadCheckpoint(#[source] CheckpointError),
    #[error("persist checkpoint for block {block_number}: {source}")]
    SaveCheckpoint {
        block_number: u64,
        #[source]
        source: CheckpointError,
    },
}

#[derive(Debug, Clone, Copy)]
struct PendingClose {
    generation: u64,
    deadline: Instant,
}

/// Owns one listener: drains confirmed blocks into the handler, persists the
/// checkpoint after every block and replaces the subscription when the
/// connection is lost.
pub struct ListenerSupervisor<S, C, H> {
    config: ListenerConfig,
    source: S,
    checkpoints: C,
    handler: H,
    alerts: Arc<dyn AlertSink>,
    alert_gate: AlertGate,
    checkpoint: Option<u64>,
    state_tx: watch::Sender<ListenerState>,
}

impl<S: EventSource, C: CheckpointStore, H: EventHandler> ListenerSupervisor<S, C, H> {
    pub fn new(
        config: ListenerConfig,
        source: S,
        checkpoints: C,
        handler: H,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let alert_gate = AlertGate::new(config.alert_cooldown);
        let (state_tx, _) = watch::channel(ListenerState::Idle);
        Self {
            config,
            source,
            checkpoints,
            handler,
            alerts,
            alert_gate,
            checkpoint: None,
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Runs until `cancel` fires or a checkpoint cannot be loaded or saved.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ListenerError> {
        let result = self.run_until_cancelled(&cancel).await;
        if let Err(err) = &result {
            error!(?err, listener = %self.config.name, "listener stopped");
        }
        self.set_state(ListenerState::Idle);
        result
    }

    async fn run_until_cancelled(&mut self, cancel: &CancellationToken) -> Result<(), ListenerError> {
        let mut subscription = self.subscribe().await?;
        let mut pending_close: Option<PendingClose> = None;
        let mut blocks_open = true;
        let mut signals_open = true;

        loop {
            let recheck_at = pending_close.map(|pending| pending.deadline);
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                batch = subscription.blocks.recv(), if blocks_open => match batch {
                    Some(batch) => self.drain(batch).await?,
                    None => {
                        blocks_open = false;
                        self.schedule_close_recheck(subscription.generation(), &mut pending_close);
                    }
                },
                signal = subscription.signals.recv(), if signals_open => match signal {
                    Some(ConnectionSignal::Connected) => {
                        debug!(generation = subscription.generation(), "chain stream connected");
                    }
                    Some(ConnectionSignal::Closed) => {
                        self.schedule_close_recheck(subscription.generation(), &mut pending_close);
                    }
                    Some(ConnectionSignal::Error(reason)) => {
                        match self.reconnect(subscription, &reason, cancel).await? {
                            Some(next) => subscription = next,
                            None => break,
                        }
                        blocks_open = true;
                        signals_open = true;
                    }
                    Some(ConnectionSignal::Degraded(reason)) => {
                        warn!(
                            listener = %self.config.name,
                            generation = subscription.generation(),
                            reason,
                            "chain stream degraded"
                        );
                        let message = format!(
                            "{} listener keeps failing to read confirmed logs: {reason}",
                            self.config.name
                        );
                        self.raise_alert(message).await;
                    }
                    None => signals_open = false,
                },
                () = close_recheck(recheck_at) => {
                    if let Some(pending) = pending_close.take()
                        && pending.generation == subscription.generation()
                    {
                        match self.reconnect(subscription, "connection closed", cancel).await? {
                            Some(next) => subscription = next,
                            None => break,
                        }
                        blocks_open = true;
                        signals_open = true;
                    } else {
                        debug!("close re-check superseded by a newer connection");
                    }
                }
            }
        }
        info!(listener = %self.config.name, "listener stopping");
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<Subscription, ListenerError> {
        let stored = match self.checkpoints.load().await {
            Ok(stored) => stored,
            Err(err) => {
                let message = format!(
                    "{} listener cannot load its checkpoint: {err}",
                    self.config.name
                );
                self.raise_alert(message).await;
                return Err(ListenerError::LoadCheckpoint(err));
            }
        };
        if let Some(stored) = stored {
            self.checkpoint = Some(self.checkpoint.map_or(stored, |known| known.max(stored)));
        }
        let from_block = self
            .checkpoint
            .map_or(self.config.start_block, |block| block.saturating_add(1));
        let subscription = self.source.open(from_block).await;
        info!(
            listener = %self.config.name,
            generation = subscription.generation(),
            from_block,
            "subscribed to confirmed events"
        );
        self.set_state(ListenerState::Subscribing);
        Ok(subscription)
    }

    /// Replaces a lost subscription after `reconnect_delay`. Returns `None`
    /// when `cancel` fires first.
    async fn reconnect(
        &mut self,
        stale: Subscription,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Subscription>, ListenerError> {
        self.set_state(ListenerState::Reconnecting);
        warn!(
            listener = %self.config.name,
            generation = stale.generation(),
            state = ?stale.state(),
            reason,
            "chain stream lost, reconnecting"
        );
        let message = format!(
            "{} listener lost its chain connection: {reason}",
            self.config.name
        );
        self.raise_alert(message).await;
        drop(stale);
        tokio::select! {
            () = cancel.cancelled() => return Ok(None),
            () = tokio::time::sleep(self.config.reconnect_delay) => {}
        }
        tokio::select! {
            () = cancel.cancelled() => Ok(None),
            subscription = self.subscribe() => subscription.map(Some),
        }
    }

    fn schedule_close_recheck(&self, generation: u64, pending: &mut Option<PendingClose>) {
        if pending.is_some_and(|pending| pending.generation == generation) {
            debug!(generation, "close re-check already scheduled");
            return;
        }
        warn!(
            listener = %self.config.name,
            generation,
            delay = ?self.config.close_recheck_delay,
            "chain stream closed, re-checking"
        );
        *pending = Some(PendingClose {
            generation,
            deadline: Instant::now() + self.config.close_recheck_delay,
        });
    }

    async fn drain(&mut self, batch: BlockBatch) -> Result<(), ListenerError> {
        if let Some(checkpoint) = self.checkpoint
            && batch.block_number <= checkpoint
        {
            debug!(
                block_number = batch.block_number,
                checkpoint, "skipping already processed block"
            );
            return Ok(());
        }

        self.set_state(ListenerState::Draining);
        let mut failed = 0usize;
        for event in &batch.events {
            match self.handler.handle(event).await {
                Ok(settlement) => debug!(
                    block_number = event.block_number,
                    log_index = event.log_index,
                    event = event.name(),
                    ?settlement,
                    "event handled"
                ),
                Err(err) => {
                    failed += 1;
                    error!(
                        ?err,
                        block_number = event.block_number,
                        log_index = event.log_index,
                        tx = ?event.transaction_hash,
                        event = event.name(),
                        "event handling failed, continuing with block"
                    );
                    let message = format!(
                        "{} listener failed to handle {} at block {} log {}: {err}",
                        self.config.name,
                        event.name(),
                        event.block_number,
                        event.log_index
                    );
                    self.raise_alert(message).await;
                }
            }
        }

        if let Err(source) = self.checkpoints.save(batch.block_number).await {
            let message = format!(
                "{} listener cannot persist checkpoint {}: {source}",
                self.config.name, batch.block_number
            );
            self.raise_alert(message).await;
            return Err(ListenerError::SaveCheckpoint {
                block_number: batch.block_number,
                source,
            });
        }
        self.checkpoint = Some(batch.block_number);
        if batch.events.is_empty() {
            debug!(block_number = batch.block_number, "checkpoint advanced");
        } else {
            info!(
                block_number = batch.block_number,
                events = batch.events.len(),
                failed,
                "block drained"
            );
        }
        self.set_state(ListenerState::Subscribing);
        Ok(())
    }

    async fn raise_alert(&mut self, message: String) {
        if self.alert_gate.should_alert(Instant::now()) {
            self.alerts.notify(&message).await;
        } else {
            debug!(alert = %message, "alert suppressed by cooldown");
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.state_tx.send_replace(state);
    }
}

async fn close_recheck(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
