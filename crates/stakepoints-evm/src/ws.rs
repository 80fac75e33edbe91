//! `WsLogSource` — push-based log delivery over an `eth_subscribe("logs")`
//! WebSocket subscription.
//!
//! A subscription only sees logs mined after it is established. To close the
//! gap left by a restart or reconnect, every `subscribe()` asks for the head
//! block and, when a resume block is known, first replays `[resume, head]`
//! with `eth_getLogs` over the same socket. Live notifications that arrive
//! during the replay are held back and delivered after it, so consumers see
//! the backfill first. Overlap between the two is absorbed by dedup keys.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use stakepoints_core::error::PointsError;

use crate::log::{parse_hex_u64, RawLog};
use crate::source::{channel_stream, LogFilter, LogSource, LogStream};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CHANNEL_CAPACITY: usize = 512;
const DEFAULT_BATCH_SIZE: u64 = 1000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type LogItem = Result<RawLog, PointsError>;

/// EVM WebSocket log source.
///
/// Each `subscribe()` opens a fresh connection. The pipeline calls it again
/// after the previous stream ends, so reconnection policy lives there. The
/// resume block survives across calls.
pub struct WsLogSource {
    url: String,
    filter: LogFilter,
    batch_size: u64,
    resume: Arc<Mutex<Option<u64>>>,
}

impl WsLogSource {
    pub fn new(url: impl Into<String>, filter: LogFilter) -> Self {
        Self {
            url: url.into(),
            filter,
            batch_size: DEFAULT_BATCH_SIZE,
            resume: Arc::new(Mutex::new(None)),
        }
    }

    /// Replay history from `start` on the first subscribe. `None` starts at
    /// the head.
    pub fn with_start_block(self, start: Option<u64>) -> Self {
        Self {
            resume: Arc::new(Mutex::new(start)),
            ..self
        }
    }

    /// Maximum block span per backfill `eth_getLogs` request.
    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Block the next `subscribe()` backfills from (inclusive), once known.
    pub fn resume_block(&self) -> Option<u64> {
        self.resume.lock().ok().and_then(|r| *r)
    }
}

fn raise_resume(resume: &Mutex<Option<u64>>, block: u64) {
    if let Ok(mut r) = resume.lock() {
        if r.map_or(true, |current| block > current) {
            *r = Some(block);
        }
    }
}

#[async_trait]
impl LogSource for WsLogSource {
    fn describe(&self) -> &str {
        &self.url
    }

    async fn subscribe(&self) -> Result<LogStream, PointsError> {
        info!(url = %self.url, "connecting to WebSocket");
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| PointsError::Subscription(format!("connect {}: {e}", self.url)))?;
        let (write, read) = ws.split();
        let mut session = Session {
            write,
            read,
            next_id: 1,
            sub_id: String::new(),
            pending: VecDeque::new(),
        };

        let reply = session
            .request("eth_subscribe", json!(["logs", self.filter.to_json()]))
            .await?;
        session.sub_id = reply
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| PointsError::Subscription(format!("eth_subscribe returned {reply}")))?;
        info!(url = %self.url, subscription = %session.sub_id, "log subscription active");

        let head = session.request("eth_blockNumber", json!([])).await?;
        let head = head
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| PointsError::Subscription(format!("eth_blockNumber returned {head}")))?;

        let backfill = match self.resume_block() {
            Some(from) if from <= head => {
                info!(from_block = from, to_block = head, "backfilling logs missed while disconnected");
                Some((from, head))
            }
            Some(_) => None,
            None => {
                raise_resume(&self.resume, head);
                None
            }
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(forward(
            session,
            backfill,
            self.filter.clone(),
            self.batch_size,
            Arc::clone(&self.resume),
            tx,
        ));

        Ok(channel_stream(rx))
    }
}

/// Background half of a subscription: backfill, then held-back
/// notifications, then live notifications until either side goes away.
async fn forward(
    mut session: Session,
    backfill: Option<(u64, u64)>,
    filter: LogFilter,
    batch_size: u64,
    resume: Arc<Mutex<Option<u64>>>,
    tx: mpsc::Sender<LogItem>,
) {
    if let Some((mut from, to)) = backfill {
        loop {
            let end = to.min(from.saturating_add(batch_size - 1));
            let logs = match session.logs(from, end, &filter).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(from, to = end, error = %e, "backfill failed");
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            debug!(from, to = end, count = logs.len(), "backfilled logs");
            for log in logs {
                if !deliver(&tx, &resume, Ok(log)).await {
                    session.release().await;
                    return;
                }
            }
            raise_resume(&resume, end);
            if end >= to {
                break;
            }
            from = end + 1;
        }
    }

    while let Some(item) = session.pending.pop_front() {
        if !deliver(&tx, &resume, item).await {
            session.release().await;
            return;
        }
    }

    loop {
        tokio::select! {
            _ = tx.closed() => {
                session.release().await;
                return;
            }
            msg = session.read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(item) = parse_subscription_log(&text, &session.sub_id) {
                        if !deliver(&tx, &resume, item).await {
                            session.release().await;
                            return;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = session.write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket closed by server");
                    let _ = tx.send(Err(PointsError::Subscription("connection closed".into()))).await;
                    return;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    let _ = tx.send(Err(PointsError::Subscription(e.to_string()))).await;
                    return;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Hand one item to the consumer; `false` once the consumer is gone.
async fn deliver(tx: &mpsc::Sender<LogItem>, resume: &Mutex<Option<u64>>, item: LogItem) -> bool {
    let block = item.as_ref().ok().and_then(RawLog::block_number_u64);
    if tx.send(item).await.is_err() {
        return false;
    }
    if let Some(block) = block {
        raise_resume(resume, block);
    }
    true
}

/// One JSON-RPC conversation over a WebSocket.
struct Session {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    next_id: u64,
    /// Empty until `eth_subscribe` is confirmed.
    sub_id: String,
    /// Notifications received while waiting for a response.
    pending: VecDeque<LogItem>,
}

impl Session {
    async fn send(&mut self, method: &str, params: Value) -> Result<u64, PointsError> {
        let id = self.next_id;
        self.next_id += 1;
        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write
            .send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| PointsError::Subscription(format!("send {method}: {e}")))?;
        Ok(id)
    }

    async fn request(&mut self, method: &str, params: Value) -> Result<Value, PointsError> {
        let id = self.send(method, params).await?;
        tokio::time::timeout(REQUEST_TIMEOUT, self.response(id))
            .await
            .map_err(|_| PointsError::Subscription(format!("timed out waiting for {method} reply")))?
    }

    async fn response(&mut self, id: u64) -> Result<Value, PointsError> {
        while let Some(msg) = self.read.next().await {
            match msg.map_err(|e| PointsError::Subscription(e.to_string()))? {
                Message::Text(text) => {
                    if let Some(reply) = parse_response(&text, id) {
                        return reply;
                    }
                    if let Some(item) = parse_subscription_log(&text, &self.sub_id) {
                        self.pending.push_back(item);
                    }
                }
                Message::Ping(data) => {
                    let _ = self.write.send(Message::Pong(data)).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(PointsError::Subscription(
            "connection closed while waiting for a reply".into(),
        ))
    }

    async fn logs(&mut self, from: u64, to: u64, filter: &LogFilter) -> Result<Vec<RawLog>, PointsError> {
        let result = self
            .request("eth_getLogs", json!([filter.range_json(from, to)]))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| PointsError::Rpc(format!("eth_getLogs: unexpected result: {e}")))
    }

    async fn release(mut self) {
        let sub_id = self.sub_id.clone();
        let _ = self.send("eth_unsubscribe", json!([sub_id])).await;
        let _ = self.write.send(Message::Close(None)).await;
        debug!("log subscription released");
    }
}

/// Match the reply to request `id`. Other messages yield `None`; an error
/// reply becomes `Some(Err(_))`.
fn parse_response(text: &str, id: u64) -> Option<Result<Value, PointsError>> {
    let v: Value = serde_json::from_str(text).ok()?;
    if v.get("id")?.as_u64()? != id {
        return None;
    }
    if let Some(err) = v.get("error") {
        return Some(Err(PointsError::Subscription(format!("request {id} rejected: {err}"))));
    }
    Some(Ok(v.get("result").cloned().unwrap_or(Value::Null)))
}

/// Parse an `eth_subscription` notification into a log.
///
/// Returns `None` for anything that is not a notification for `sub_id`.
/// A notification whose payload is not a log becomes a malformed-event item.
fn parse_subscription_log(text: &str, sub_id: &str) -> Option<LogItem> {
    let v: Value = serde_json::from_str(text).ok()?;
    if v.get("method")?.as_str()? != "eth_subscription" {
        return None;
    }
    let params = v.get("params")?;
    if params.get("subscription").and_then(Value::as_str) != Some(sub_id) {
        return None;
    }
    let result = params.get("result")?.clone();
    Some(
        serde_json::from_value::<RawLog>(result)
            .map_err(|e| PointsError::malformed(format!("subscription payload is not a log: {e}"))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";

    type ServerWs = WebSocketStream<TcpStream>;

    #[test]
    fn reply_matched_by_id() {
        let reply = parse_response(r#"{"jsonrpc":"2.0","id":1,"result":"0xcd0c3e8af590364c09d0fa6a1210faf5"}"#, 1)
            .unwrap()
            .unwrap();
        assert_eq!(reply, "0xcd0c3e8af590364c09d0fa6a1210faf5");
        assert!(parse_response(r#"{"jsonrpc":"2.0","id":7,"result":"0x1"}"#, 1).is_none());
        assert!(parse_response("not json", 1).is_none());
        assert!(parse_response(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"method not found"}}"#,
            3
        )
        .unwrap()
        .is_err());
    }

    #[test]
    fn notification_parsed_for_own_subscription() {
        let text = r#"{
            "jsonrpc":"2.0",
            "method":"eth_subscription",
            "params":{
                "subscription":"0xabc",
                "result":{
                    "address":"0x5fbdb2315678afecb367f032d93f642f64180aa3",
                    "topics":["0x01"],
                    "data":"0x",
                    "blockNumber":"0x10",
                    "transactionHash":"0xfeed",
                    "logIndex":"0x2",
                    "removed":false
                }
            }
        }"#;
        let log = parse_subscription_log(text, "0xabc").unwrap().unwrap();
        assert_eq!(log.block_number_u64(), Some(16));
        assert_eq!(log.log_index_u64(), Some(2));

        assert!(parse_subscription_log(text, "0xother").is_none());
        assert!(parse_subscription_log(text, "").is_none());
    }

    #[test]
    fn non_log_payload_is_malformed() {
        let text = r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xabc","result":{"number":"0x1"}}}"#;
        let err = parse_subscription_log(text, "0xabc").unwrap().unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn unrelated_messages_ignored() {
        assert!(parse_subscription_log(r#"{"jsonrpc":"2.0","id":2,"result":true}"#, "0xabc").is_none());
        assert!(parse_subscription_log("garbage", "0xabc").is_none());
    }

    // ─── Local node ──────────────────────────────────────────────────────────

    fn filter() -> LogFilter {
        LogFilter {
            address: CONTRACT.into(),
            topic0: "0x01".into(),
        }
    }

    fn log_json(block: u64, tx: u64) -> Value {
        json!({
            "address": CONTRACT,
            "topics": ["0x01"],
            "data": "0x",
            "blockNumber": format!("0x{block:x}"),
            "transactionHash": format!("0x{tx:064x}"),
            "logIndex": "0x0",
            "removed": false,
        })
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    /// Next JSON-RPC request from the client as `(id, method, params)`.
    async fn next_request(ws: &mut ServerWs) -> (u64, String, Value) {
        loop {
            if let Message::Text(text) = ws.next().await.unwrap().unwrap() {
                let v: Value = serde_json::from_str(&text).unwrap();
                return (
                    v["id"].as_u64().unwrap(),
                    v["method"].as_str().unwrap().to_string(),
                    v["params"].clone(),
                );
            }
        }
    }

    async fn reply(ws: &mut ServerWs, id: u64, result: Value) {
        let msg = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        ws.send(Message::Text(msg.to_string())).await.unwrap();
    }

    async fn notify(ws: &mut ServerWs, log: Value) {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": { "subscription": "0xsub", "result": log },
        });
        ws.send(Message::Text(msg.to_string())).await.unwrap();
    }

    /// Answer `eth_subscribe` and `eth_blockNumber`.
    async fn handshake(ws: &mut ServerWs, head: u64) {
        let (id, method, params) = next_request(ws).await;
        assert_eq!(method, "eth_subscribe");
        assert_eq!(params[0], "logs");
        assert_eq!(params[1]["address"], CONTRACT);
        reply(ws, id, json!("0xsub")).await;

        let (id, method, _) = next_request(ws).await;
        assert_eq!(method, "eth_blockNumber");
        reply(ws, id, json!(format!("0x{head:x}"))).await;
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes_and_closes() {
        let (listener, url) = listen().await;
        let node = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            handshake(&mut ws, 20).await;
            notify(&mut ws, log_json(21, 1)).await;

            let (_, method, params) = next_request(&mut ws).await;
            assert_eq!(method, "eth_unsubscribe");
            assert_eq!(params[0], "0xsub");
            assert!(matches!(ws.next().await, Some(Ok(Message::Close(_)))));
        });

        let source = WsLogSource::new(&url, filter());
        let mut stream = source.subscribe().await.unwrap();
        let log = stream.next().await.unwrap().unwrap();
        assert_eq!(log.block_number_u64(), Some(21));
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), node).await.unwrap().unwrap();
        assert_eq!(source.resume_block(), Some(21));
    }

    #[tokio::test]
    async fn backfill_is_delivered_before_live_logs() {
        let (listener, url) = listen().await;
        let node = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            handshake(&mut ws, 9).await;

            let (id, method, params) = next_request(&mut ws).await;
            assert_eq!(method, "eth_getLogs");
            assert_eq!(params[0]["fromBlock"], "0x5");
            assert_eq!(params[0]["toBlock"], "0x9");
            // A live log overtakes the backfill reply on the wire.
            notify(&mut ws, log_json(9, 2)).await;
            reply(&mut ws, id, json!([log_json(6, 1)])).await;

            let (_, method, _) = next_request(&mut ws).await;
            assert_eq!(method, "eth_unsubscribe");
        });

        let source = WsLogSource::new(&url, filter()).with_start_block(Some(5));
        let mut stream = source.subscribe().await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.block_number_u64(), Some(6));
        assert_eq!(second.block_number_u64(), Some(9));
        drop(stream);

        tokio::time::timeout(Duration::from_secs(5), node).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn reconnect_backfills_from_last_delivered_block() {
        let (listener, url) = listen().await;
        let node = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            handshake(&mut ws, 20).await;
            notify(&mut ws, log_json(20, 1)).await;
            ws.close(None).await.unwrap();

            let mut ws = accept(&listener).await;
            handshake(&mut ws, 25).await;
            let (id, method, params) = next_request(&mut ws).await;
            assert_eq!(method, "eth_getLogs");
            assert_eq!(params[0]["fromBlock"], "0x14");
            assert_eq!(params[0]["toBlock"], "0x19");
            reply(&mut ws, id, json!([log_json(23, 2)])).await;

            let (_, method, _) = next_request(&mut ws).await;
            assert_eq!(method, "eth_unsubscribe");
        });

        let source = WsLogSource::new(&url, filter()).with_batch_size(100);
        let mut first = source.subscribe().await.unwrap();
        assert_eq!(first.next().await.unwrap().unwrap().block_number_u64(), Some(20));
        assert!(matches!(first.next().await, Some(Err(PointsError::Subscription(_)))));
        drop(first);

        let mut second = source.subscribe().await.unwrap();
        assert_eq!(second.next().await.unwrap().unwrap().block_number_u64(), Some(23));
        drop(second);

        tokio::time::timeout(Duration::from_secs(5), node).await.unwrap().unwrap();
        assert_eq!(source.resume_block(), Some(25));
    }
}
