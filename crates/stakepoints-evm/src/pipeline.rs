//! `StakePipeline` — drives a [`LogSource`] into the accrual engine.
//!
//! Logs are decoded in arrival order and each event is accrued on its own
//! task, bounded by a semaphore. The stream is re-subscribed with backoff
//! when it fails or ends. An accrual that fails permanently stops the
//! pipeline: in-flight work is drained and the error is returned.
//!
//! With a [`CheckpointStore`] attached, the pipeline records the highest
//! block below which every seen log has settled, so a restart can resume
//! there instead of at the chain head.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use stakepoints_core::checkpoint::CheckpointStore;
use stakepoints_core::engine::{EngineMetricsSnapshot, LedgerAccrualEngine};
use stakepoints_core::error::PointsError;
use stakepoints_core::retry::{Backoff, RetryPolicy};
use stakepoints_core::types::AccrualOutcome;

use crate::abi::StakedLogDecoder;
use crate::log::RawLog;
use crate::source::LogSource;

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum events being accrued at once.
    pub max_in_flight: usize,
    /// Delay between re-subscriptions. Unbounded by default.
    pub reconnect: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            reconnect: RetryPolicy::unbounded(Duration::from_millis(500), Duration::from_secs(60)),
        }
    }
}

/// Summary returned when the pipeline stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub metrics: EngineMetricsSnapshot,
    pub reconnections: u64,
    /// Last checkpoint written, if a checkpoint store is attached.
    pub checkpoint: Option<u64>,
}

type AccrualResult = Result<AccrualOutcome, PointsError>;

/// Which blocks still have accruals outstanding.
#[derive(Debug, Default)]
struct BlockProgress {
    in_flight: BTreeMap<u64, usize>,
    highest_seen: Option<u64>,
    saved: Option<u64>,
}

impl BlockProgress {
    fn observe(&mut self, block: u64) {
        self.highest_seen = Some(self.highest_seen.map_or(block, |h| h.max(block)));
    }

    fn start(&mut self, block: u64) {
        self.observe(block);
        *self.in_flight.entry(block).or_insert(0) += 1;
    }

    fn finish(&mut self, block: u64) {
        if let Some(count) = self.in_flight.get_mut(&block) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&block);
            }
        }
    }

    /// Highest block with nothing outstanding at or below it.
    fn settled(&self) -> Option<u64> {
        match self.in_flight.keys().next() {
            Some(&lowest) => lowest.checked_sub(1),
            None => self.highest_seen,
        }
    }

    /// A settled block newer than the last one saved.
    fn unsaved(&self) -> Option<u64> {
        self.settled()
            .filter(|block| self.saved.map_or(true, |saved| *block > saved))
    }
}

pub struct StakePipeline {
    engine: Arc<LedgerAccrualEngine>,
    source: Arc<dyn LogSource>,
    decoder: StakedLogDecoder,
    config: PipelineConfig,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl StakePipeline {
    pub fn new(
        engine: Arc<LedgerAccrualEngine>,
        source: Arc<dyn LogSource>,
        decoder: StakedLogDecoder,
        config: PipelineConfig,
    ) -> Self {
        Self {
            engine,
            source,
            decoder,
            config,
            checkpoints: None,
        }
    }

    /// Persist progress under [`Self::checkpoint_id`].
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn engine(&self) -> &Arc<LedgerAccrualEngine> {
        &self.engine
    }

    /// Checkpoints are keyed by the staking contract address.
    pub fn checkpoint_id(&self) -> String {
        self.decoder.contract().to_string()
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped), or
    /// until an event cannot be accrued.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<PipelineReport, PointsError> {
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks: JoinSet<(u64, AccrualResult)> = JoinSet::new();
        let mut progress = BlockProgress::default();
        let mut reconnections = 0u64;
        let mut backoff = self.config.reconnect.backoff();
        let mut fatal: Option<PointsError> = None;

        info!(source = self.source.describe(), contract = %self.decoder.contract(), "stake pipeline starting");

        'outer: while fatal.is_none() && !*shutdown.borrow() {
            let mut stream = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break 'outer;
                    }
                    continue 'outer;
                }
                sub = self.source.subscribe() => match sub {
                    Ok(s) => {
                        backoff.reset();
                        s
                    }
                    Err(e) => {
                        warn!(error = %e, "subscribe failed");
                        if !e.is_transient() {
                            fatal = Some(e);
                            break 'outer;
                        }
                        match self.wait_backoff(&mut shutdown, &mut backoff).await {
                            Ok(true) => break 'outer,
                            Ok(false) => {}
                            Err(e) => {
                                fatal = Some(e);
                                break 'outer;
                            }
                        }
                        reconnections += 1;
                        continue 'outer;
                    }
                },
            };

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = self.settle(joined, &mut progress).await {
                            fatal = Some(e);
                            break 'outer;
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(log)) => {
                            if let Err(e) = self.dispatch(&log, &permits, &mut tasks, &mut progress).await {
                                fatal = Some(e);
                                break 'outer;
                            }
                        }
                        Some(Err(e)) if e.is_malformed() => {
                            self.engine.record_malformed();
                            warn!(error = %e, "skipping malformed log");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "log stream failed, reconnecting");
                            break;
                        }
                        None => {
                            warn!("log stream ended, reconnecting");
                            break;
                        }
                    },
                }
            }

            drop(stream);
            match self.wait_backoff(&mut shutdown, &mut backoff).await {
                Ok(true) => break 'outer,
                Ok(false) => {}
                Err(e) => {
                    fatal = Some(e);
                    break 'outer;
                }
            }
            reconnections += 1;
        }

        // Drain what was already handed to the store.
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = self.settle(joined, &mut progress).await {
                fatal.get_or_insert(e);
            }
        }

        let report = PipelineReport {
            metrics: self.engine.metrics(),
            reconnections,
            checkpoint: progress.saved,
        };
        match fatal {
            Some(e) => {
                error!(error = %e, checkpoint = ?report.checkpoint, "stake pipeline stopped on unrecoverable error");
                Err(e)
            }
            None => {
                info!(
                    applied = report.metrics.applied,
                    duplicates = report.metrics.duplicates,
                    malformed = report.metrics.malformed,
                    reconnections,
                    checkpoint = ?report.checkpoint,
                    "stake pipeline stopped"
                );
                Ok(report)
            }
        }
    }

    /// Decode one log and spawn its accrual once a permit is available.
    async fn dispatch(
        &self,
        log: &RawLog,
        permits: &Arc<Semaphore>,
        tasks: &mut JoinSet<(u64, AccrualResult)>,
        progress: &mut BlockProgress,
    ) -> Result<(), PointsError> {
        let event = match self.decoder.decode(log) {
            Ok(Some(event)) => event,
            Ok(None) => {
                self.observe(log, progress).await;
                return Ok(());
            }
            Err(e) => {
                self.engine.record_malformed();
                warn!(error = %e, tx = ?log.tx_hash, "skipping malformed Staked log");
                self.observe(log, progress).await;
                return Ok(());
            }
        };

        // While waiting for a permit, keep settling finished tasks so a
        // failure is noticed without waiting on the whole batch.
        let permit = loop {
            tokio::select! {
                permit = Arc::clone(permits).acquire_owned() => {
                    break permit.map_err(|e| PointsError::Other(e.to_string()))?;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.settle(joined, progress).await?;
                }
            }
        };

        debug!(key = %event.dedup_key, wallet = %event.on_behalf_of, "dispatching stake event");
        let block = event.block_number;
        progress.start(block);
        let engine = Arc::clone(&self.engine);
        tasks.spawn(async move {
            let _permit = permit;
            (block, engine.accrue(&event).await)
        });
        Ok(())
    }

    /// A log that needs no accrual still counts as processed for its block.
    async fn observe(&self, log: &RawLog, progress: &mut BlockProgress) {
        if let Some(block) = log.block_number_u64() {
            progress.observe(block);
            self.save_checkpoint(progress).await;
        }
    }

    /// Interpret a finished accrual task. Malformed events were already
    /// counted and logged by the engine, so only other failures stop the
    /// pipeline. A failed block stays outstanding, which pins the checkpoint
    /// below it.
    async fn settle(
        &self,
        joined: Result<(u64, AccrualResult), JoinError>,
        progress: &mut BlockProgress,
    ) -> Result<(), PointsError> {
        match joined {
            Ok((block, Ok(_))) => {
                progress.finish(block);
                self.save_checkpoint(progress).await;
                Ok(())
            }
            Ok((block, Err(e))) if e.is_malformed() => {
                progress.finish(block);
                self.save_checkpoint(progress).await;
                Ok(())
            }
            Ok((_, Err(e))) => Err(e),
            Err(e) => Err(PointsError::Other(format!("accrual task failed: {e}"))),
        }
    }

    /// Write the settled block if it moved. A failed write is retried on the
    /// next settled event.
    async fn save_checkpoint(&self, progress: &mut BlockProgress) {
        let (Some(store), Some(block)) = (&self.checkpoints, progress.unsaved()) else {
            return;
        };
        match store.save_checkpoint(&self.checkpoint_id(), block).await {
            Ok(()) => {
                progress.saved = Some(block);
                debug!(block, "checkpoint saved");
            }
            Err(e) => warn!(block, error = %e, "failed to save checkpoint"),
        }
    }

    /// Sleep for the next reconnect delay. `Ok(true)` means shutdown was
    /// requested meanwhile; an exhausted policy is an error.
    async fn wait_backoff(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> Result<bool, PointsError> {
        let Some(delay) = backoff.next_delay() else {
            return Err(PointsError::Subscription(format!(
                "gave up on {} after {} reconnect attempts",
                self.source.describe(),
                backoff.retries()
            )));
        };
        debug!(delay_ms = delay.as_millis() as u64, attempt = backoff.retries(), "waiting to resubscribe");
        Ok(tokio::select! {
            changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            _ = tokio::time::sleep(delay) => false,
        })
    }
}
