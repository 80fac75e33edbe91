//! Ledger accrual engine: turns a `StakeEvent` into exactly one atomic store write.
//!
//! The engine holds no balances. Every call goes to the store, which owns
//! both the increment and the dedup record. Transient store failures are
//! retried with backoff; anything else (or running out of retries) is
//! returned to the caller as an error so no accrual is silently dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::PointsError;
use crate::normalizer::AmountNormalizer;
use crate::retry::RetryPolicy;
use crate::store::PointsStore;
use crate::types::{AccrualOutcome, StakeEvent};

/// Counter snapshot for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMetricsSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub zero_amount: u64,
    pub retries: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct EngineMetrics {
    applied: AtomicU64,
    duplicates: AtomicU64,
    malformed: AtomicU64,
    zero_amount: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

impl EngineMetrics {
    fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            zero_amount: self.zero_amount.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Applies stake events to the points store.
///
/// Safe to share across tasks (`Arc<LedgerAccrualEngine>`) and to call
/// concurrently for the same or different wallets.
pub struct LedgerAccrualEngine {
    store: Arc<dyn PointsStore>,
    normalizer: AmountNormalizer,
    retry: RetryPolicy,
    metrics: EngineMetrics,
}

impl LedgerAccrualEngine {
    pub fn new(store: Arc<dyn PointsStore>, normalizer: AmountNormalizer, retry: RetryPolicy) -> Self {
        Self {
            store,
            normalizer,
            retry,
            metrics: EngineMetrics::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn PointsStore> {
        &self.store
    }

    pub fn metrics(&self) -> EngineMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Count a malformed payload rejected before it reached the engine.
    pub fn record_malformed(&self) {
        self.metrics.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Accrue one event. Idempotent per `event.dedup_key`.
    pub async fn accrue(&self, event: &StakeEvent) -> Result<AccrualOutcome, PointsError> {
        let delta = match self.normalizer.points_delta(&event.amount) {
            Ok(d) => d,
            Err(e) => {
                self.record_malformed();
                warn!(key = %event.dedup_key, amount = %event.amount, error = %e, "skipping stake event");
                return Err(e);
            }
        };

        if delta == BigDecimal::from(0) {
            self.metrics.zero_amount.fetch_add(1, Ordering::Relaxed);
            debug!(key = %event.dedup_key, wallet = %event.on_behalf_of, "zero-amount stake, nothing to accrue");
            return Ok(AccrualOutcome::Skipped);
        }

        let outcome = self.accrue_with_retry(event, &delta).await?;
        match outcome {
            AccrualOutcome::Applied => {
                self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                info!(
                    wallet = %event.on_behalf_of,
                    points = %delta,
                    key = %event.dedup_key,
                    block = event.block_number,
                    "points accrued"
                );
            }
            AccrualOutcome::Duplicate => {
                self.metrics.duplicates.fetch_add(1, Ordering::Relaxed);
                info!(wallet = %event.on_behalf_of, key = %event.dedup_key, "duplicate stake event ignored");
            }
            AccrualOutcome::Skipped => {}
        }
        Ok(outcome)
    }

    async fn accrue_with_retry(
        &self,
        event: &StakeEvent,
        delta: &BigDecimal,
    ) -> Result<AccrualOutcome, PointsError> {
        let mut backoff = self.retry.backoff();
        loop {
            let attempt = backoff.retries() + 1;
            match self.store.accrue(&event.on_behalf_of, delta, &event.dedup_key).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            key = %event.dedup_key,
                            error = %e,
                            "store unavailable, retrying accrual"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(self.fail(event, attempt, e)),
                },
                Err(e) => return Err(self.fail(event, attempt, e)),
            }
        }
    }

    fn fail(&self, event: &StakeEvent, attempts: u32, cause: PointsError) -> PointsError {
        self.metrics.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            key = %event.dedup_key,
            wallet = %event.on_behalf_of,
            amount = %event.amount,
            attempts,
            error = %cause,
            "stake event left unprocessed"
        );
        PointsError::AccrualFailed {
            key: event.dedup_key.to_string(),
            attempts,
            reason: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DedupKey, PointsLedgerEntry, WalletAddress};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::str::FromStr;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Minimal store that fails the first `failures` accruals with the given error kind.
    #[derive(Default)]
    struct FlakyStore {
        failures: AtomicU32,
        transient: bool,
        calls: AtomicU32,
        state: Mutex<(HashMap<WalletAddress, BigDecimal>, HashSet<DedupKey>)>,
    }

    impl FlakyStore {
        fn failing(failures: u32, transient: bool) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                transient,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl PointsStore for FlakyStore {
        async fn accrue(
            &self,
            wallet: &WalletAddress,
            delta: &BigDecimal,
            key: &DedupKey,
        ) -> Result<AccrualOutcome, PointsError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.transient {
                    PointsError::StoreUnavailable("connection reset".into())
                } else {
                    PointsError::Storage("disk full".into())
                });
            }
            let mut state = self.state.lock().unwrap();
            if !state.1.insert(key.clone()) {
                return Ok(AccrualOutcome::Duplicate);
            }
            let entry = state.0.entry(wallet.clone()).or_insert_with(|| BigDecimal::from(0));
            *entry = &*entry + delta;
            Ok(AccrualOutcome::Applied)
        }

        async fn entry(&self, wallet: &WalletAddress) -> Result<Option<PointsLedgerEntry>, PointsError> {
            Ok(self.state.lock().unwrap().0.get(wallet).map(|p| PointsLedgerEntry {
                wallet_address: wallet.clone(),
                points: p.clone(),
                updated_at: 0,
            }))
        }

        async fn is_applied(&self, key: &DedupKey) -> Result<bool, PointsError> {
            Ok(self.state.lock().unwrap().1.contains(key))
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::bounded(max_retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    fn wallet() -> WalletAddress {
        WalletAddress::parse("0x0000000000000000000000000000000000000abc").unwrap()
    }

    fn event(amount: &str, tx: &str) -> StakeEvent {
        StakeEvent {
            staker: wallet(),
            amount: amount.into(),
            on_behalf_of: wallet(),
            dedup_key: DedupKey::new(tx, 0),
            block_number: 1,
        }
    }

    fn engine(store: Arc<FlakyStore>, retries: u32) -> LedgerAccrualEngine {
        LedgerAccrualEngine::new(store, AmountNormalizer::default(), fast_retry(retries))
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(FlakyStore::failing(2, true));
        let engine = engine(store.clone(), 3);

        let outcome = engine.accrue(&event("1000000000000000000", "0x01")).await.unwrap();
        assert_eq!(outcome, AccrualOutcome::Applied);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.metrics().retries, 2);

        let entry = store.entry(&wallet()).await.unwrap().unwrap();
        assert_eq!(entry.points, BigDecimal::from(100));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_accrual_failed() {
        let store = Arc::new(FlakyStore::failing(10, true));
        let engine = engine(store.clone(), 2);

        let err = engine.accrue(&event("1", "0x02")).await.unwrap_err();
        match err {
            PointsError::AccrualFailed { key, attempts, .. } => {
                assert_eq!(key, "0x02:0");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.metrics().failed, 1);
        assert!(store.entry(&wallet()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistent_failure_is_not_retried() {
        let store = Arc::new(FlakyStore::failing(1, false));
        let engine = engine(store.clone(), 5);

        assert!(matches!(
            engine.accrue(&event("1", "0x03")).await,
            Err(PointsError::AccrualFailed { attempts: 1, .. })
        ));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_amount_never_touches_store() {
        let store = Arc::new(FlakyStore::default());
        let engine = engine(store.clone(), 0);

        let err = engine.accrue(&event("not-a-number", "0x04")).await.unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.metrics().malformed, 1);
    }

    #[tokio::test]
    async fn zero_amount_writes_nothing() {
        let store = Arc::new(FlakyStore::default());
        let engine = engine(store.clone(), 0);

        let outcome = engine.accrue(&event("0", "0x05")).await.unwrap();
        assert_eq!(outcome, AccrualOutcome::Skipped);
        assert!(!outcome.is_applied());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
        assert!(!store.is_applied(&DedupKey::new("0x05", 0)).await.unwrap());
        assert!(store.entry(&wallet()).await.unwrap().is_none());
        let m = engine.metrics();
        assert_eq!((m.zero_amount, m.applied), (1, 0));
    }

    #[tokio::test]
    async fn duplicates_are_counted_not_applied() {
        let store = Arc::new(FlakyStore::default());
        let engine = engine(store.clone(), 0);
        let ev = event("500000000000000000", "0x06");

        assert!(engine.accrue(&ev).await.unwrap().is_applied());
        assert_eq!(engine.accrue(&ev).await.unwrap(), AccrualOutcome::Duplicate);

        let m = engine.metrics();
        assert_eq!((m.applied, m.duplicates), (1, 1));
        let entry = store.entry(&wallet()).await.unwrap().unwrap();
        assert_eq!(entry.points, BigDecimal::from_str("50").unwrap());
    }
}
