//! stakepoints-evm — chain side of the points pipeline.
//!
//! - [`log`] — raw EVM log shape shared by `eth_getLogs` and `eth_subscribe`
//! - [`abi`] — the `Staked` event schema and its decoder
//! - [`rpc`] — minimal JSON-RPC client over HTTP
//! - [`source`] — `LogSource` trait; [`ws`] and [`poll`] implementations
//! - [`pipeline`] — subscribe → decode → concurrent accrual, with reconnects

pub mod abi;
pub mod log;
pub mod pipeline;
pub mod poll;
pub mod rpc;
pub mod source;
pub mod ws;

pub use abi::{StakedLogDecoder, STAKED_EVENT, STAKED_SIGNATURE};
pub use log::RawLog;
pub use pipeline::{PipelineConfig, PipelineReport, StakePipeline};
pub use poll::{PollingLogSource, PollingOptions};
pub use rpc::{EvmRpcClient, HttpRpcClient};
pub use source::{connect_source, LogFilter, LogSource, LogStream};
pub use ws::WsLogSource;
