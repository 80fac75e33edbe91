//! `LogSource` — abstraction over the chain connection delivering raw logs.
//!
//! A source hands out a [`LogStream`]; the stream owns the underlying
//! connection. Dropping the stream releases it (the background task sees the
//! closed channel, unsubscribes and disconnects).

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use stakepoints_core::error::PointsError;

use crate::log::{to_hex_quantity, RawLog};
use crate::poll::{PollingLogSource, PollingOptions};
use crate::rpc::HttpRpcClient;
use crate::ws::WsLogSource;

/// A stream of raw logs from one subscription.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<RawLog, PointsError>> + Send>>;

/// Node-side log filter: one contract, one event signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: String,
    pub topic0: String,
}

impl LogFilter {
    pub fn to_json(&self) -> Value {
        json!({
            "address": self.address,
            "topics": [self.topic0],
        })
    }

    /// `eth_getLogs` parameter object for the inclusive range `[from, to]`.
    pub fn range_json(&self, from: u64, to: u64) -> Value {
        let mut params = self.to_json();
        params["fromBlock"] = Value::String(to_hex_quantity(from));
        params["toBlock"] = Value::String(to_hex_quantity(to));
        params
    }
}

/// Abstracts over the WebSocket and HTTP-polling chain connections.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Human-readable endpoint description for logs.
    fn describe(&self) -> &str;

    /// Connect and start streaming logs. May be called again after the
    /// previous stream ended or failed.
    async fn subscribe(&self) -> Result<LogStream, PointsError>;
}

/// Wrap the receiving half of a source's channel as a [`LogStream`].
pub(crate) fn channel_stream(rx: mpsc::Receiver<Result<RawLog, PointsError>>) -> LogStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Pick a source by URL scheme: `ws://`/`wss://` subscribe, `http://`/`https://` poll.
pub fn connect_source(
    rpc_url: &str,
    filter: LogFilter,
    polling: PollingOptions,
) -> Result<Arc<dyn LogSource>, PointsError> {
    let scheme = rpc_url
        .split_once("://")
        .map(|(s, _)| s.to_ascii_lowercase())
        .ok_or_else(|| PointsError::Config(format!("RPC URL '{rpc_url}' has no scheme")))?;

    match scheme.as_str() {
        "ws" | "wss" => Ok(Arc::new(
            WsLogSource::new(rpc_url, filter)
                .with_start_block(polling.start_block)
                .with_batch_size(polling.batch_size),
        )),
        "http" | "https" => {
            let client = HttpRpcClient::new(rpc_url, polling.request_timeout)?;
            Ok(Arc::new(
                PollingLogSource::new(Arc::new(client), filter, polling).with_description(rpc_url),
            ))
        }
        other => Err(PointsError::Config(format!(
            "unsupported RPC URL scheme '{other}' (expected ws, wss, http or https)"
        ))),
    }
}
