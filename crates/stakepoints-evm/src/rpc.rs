//! JSON-RPC 2.0 over HTTP, limited to the two calls log polling needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use stakepoints_core::error::PointsError;

use crate::log::{parse_hex_u64, RawLog};
use crate::source::LogFilter;

/// Trait for fetching EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, PointsError>;

    /// All logs in `[from, to]` matching `filter`.
    async fn logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, PointsError>;
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// HTTP JSON-RPC client backed by `reqwest`.
pub struct HttpRpcClient {
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcClient {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, PointsError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PointsError::Config(format!("http client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, PointsError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| PointsError::Rpc(format!("{method}: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PointsError::Rpc(format!("{method}: HTTP {status}: {body}")));
        }

        let body: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| PointsError::Rpc(format!("{method}: invalid response: {e}")))?;
        decode_response(method, body)
    }
}

fn decode_response<T: DeserializeOwned>(method: &str, body: JsonRpcResponse) -> Result<T, PointsError> {
    if let Some(err) = body.error {
        return Err(PointsError::Rpc(format!("{method}: error {}: {}", err.code, err.message)));
    }
    let result = body.result.unwrap_or(Value::Null);
    serde_json::from_value(result).map_err(|e| PointsError::Rpc(format!("{method}: unexpected result: {e}")))
}

#[async_trait]
impl EvmRpcClient for HttpRpcClient {
    async fn block_number(&self) -> Result<u64, PointsError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&hex).ok_or_else(|| PointsError::Rpc(format!("eth_blockNumber: bad quantity '{hex}'")))
    }

    async fn logs(&self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, PointsError> {
        self.call("eth_getLogs", json!([filter.range_json(from, to)])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_maps_to_rpc_error() {
        let body: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#,
        )
        .unwrap();
        let err = decode_response::<Vec<RawLog>>("eth_getLogs", body).unwrap_err();
        assert!(matches!(err, PointsError::Rpc(ref m) if m.contains("-32005")));
        assert!(err.is_transient());
    }

    #[test]
    fn result_is_deserialized() {
        let body: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).unwrap();
        let hex: String = decode_response("eth_blockNumber", body).unwrap();
        assert_eq!(parse_hex_u64(&hex), Some(16));
    }
}
