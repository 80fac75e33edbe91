//! `PollingLogSource` — pull-based log delivery via `eth_getLogs` for
//! endpoints that do not support subscriptions (plain HTTP RPC).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use stakepoints_core::error::PointsError;

use crate::rpc::EvmRpcClient;
use crate::source::{channel_stream, LogFilter, LogSource, LogStream};

const CHANNEL_CAPACITY: usize = 1024;

/// Tuning for the polling source.
#[derive(Debug, Clone)]
pub struct PollingOptions {
    /// First block to scan. `None` starts at the current confirmed head.
    pub start_block: Option<u64>,
    /// Blocks to stay behind the head.
    pub confirmations: u64,
    /// Maximum block span per `eth_getLogs` request.
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            start_block: None,
            confirmations: 0,
            batch_size: 1000,
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Polls a JSON-RPC endpoint for new logs.
///
/// The next block to scan survives across `subscribe()` calls, so a
/// reconnect resumes where the previous stream stopped. A block range is only
/// marked scanned after all of its logs were handed to the consumer.
pub struct PollingLogSource {
    client: Arc<dyn EvmRpcClient>,
    filter: LogFilter,
    options: PollingOptions,
    cursor: Arc<Mutex<Option<u64>>>,
    url: String,
}

impl PollingLogSource {
    pub fn new(client: Arc<dyn EvmRpcClient>, filter: LogFilter, options: PollingOptions) -> Self {
        Self {
            client,
            filter,
            options,
            cursor: Arc::new(Mutex::new(None)),
            url: String::from("polling"),
        }
    }

    pub fn with_description(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Next block that will be scanned, once known.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor.lock().ok().and_then(|c| *c)
    }

    async fn resolve_start(&self) -> Result<u64, PointsError> {
        if let Some(next) = self.cursor() {
            return Ok(next);
        }
        if let Some(start) = self.options.start_block {
            return Ok(start);
        }
        let head = self.client.block_number().await?;
        Ok(head.saturating_sub(self.options.confirmations).saturating_add(1))
    }
}

fn set_cursor(cursor: &Mutex<Option<u64>>, next: u64) {
    if let Ok(mut c) = cursor.lock() {
        *c = Some(next);
    }
}

#[async_trait]
impl LogSource for PollingLogSource {
    fn describe(&self) -> &str {
        &self.url
    }

    async fn subscribe(&self) -> Result<LogStream, PointsError> {
        let mut next = self.resolve_start().await?;
        set_cursor(&self.cursor, next);
        info!(url = %self.url, from_block = next, "polling for logs");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let client = Arc::clone(&self.client);
        let filter = self.filter.clone();
        let options = self.options.clone();
        let cursor = Arc::clone(&self.cursor);

        tokio::spawn(async move {
            let batch = options.batch_size.max(1);
            loop {
                let head = match client.block_number().await {
                    Ok(h) => h,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let confirmed = head.saturating_sub(options.confirmations);

                while next <= confirmed {
                    let end = confirmed.min(next.saturating_add(batch - 1));
                    let logs = match client.logs(next, end, &filter).await {
                        Ok(logs) => logs,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    debug!(from = next, to = end, count = logs.len(), "fetched logs");
                    for log in logs {
                        if tx.send(Ok(log)).await.is_err() {
                            return;
                        }
                    }
                    next = end + 1;
                    set_cursor(&cursor, next);
                }

                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(options.poll_interval) => {}
                }
            }
        });

        Ok(channel_stream(rx))
    }
}
