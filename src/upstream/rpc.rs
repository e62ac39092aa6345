//! JSON-RPC 2.0 clients for the node daemon and the pool wallet.
//!
//! Only the request/response shapes the coordinator consumes are
//! modeled; transport is plain HTTP POST through a shared
//! `reqwest::Client` with a per-endpoint timeout.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

async fn call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    method: &str,
    params: Value,
) -> Result<T, RpcError> {
    let request = RpcRequest { jsonrpc: "2.0", id: 1, method, params };
    let response: RpcResponse = client
        .post(url)
        .timeout(timeout)
        .json(&request)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if let Some(err) = response.error {
        return Err(RpcError::Rpc { code: err.code, message: err.message });
    }
    let result = response
        .result
        .ok_or_else(|| RpcError::InvalidResponse(format!("{}: empty result", method)))?;
    serde_json::from_value(result)
        .map_err(|e| RpcError::InvalidResponse(format!("{}: {}", method, e)))
}

/// Difficulties come over the wire as decimal strings.
pub fn parse_difficulty(raw: &str) -> Result<u64, RpcError> {
    raw.parse::<u64>()
        .map_err(|_| RpcError::InvalidResponse(format!("bad difficulty: {:?}", raw)))
}

// ─── Node RPC shapes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    /// Hex-encoded native header
    pub template: String,
    pub algorithm: String,
    pub height: u64,
    pub topoheight: u64,
    /// Decimal string
    pub difficulty: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    pub height: u64,
    pub topoheight: u64,
    /// Decimal string
    pub difficulty: String,
    /// Target milliseconds between blocks
    pub block_time_target: u64,
    pub block_reward: u64,
}

impl NodeInfo {
    /// Rough network hashrate derived from difficulty over block time.
    pub fn network_hashrate(&self) -> Option<u64> {
        let difficulty = self.difficulty.parse::<u64>().ok()?;
        let secs = (self.block_time_target / 1000).max(1);
        Some(difficulty / secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct P2pStatus {
    pub peer_count: u64,
    pub max_peers: u64,
    pub our_topoheight: u64,
    pub best_topoheight: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanonicalBlock {
    pub hash: String,
    pub height: u64,
    pub tips: Vec<String>,
    /// Milliseconds
    pub timestamp: u64,
    /// Decimal string
    pub difficulty: String,
    pub miner_reward: u64,
    pub total_fees: u64,
    pub miner: String,
    pub txs_hashes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionReceipt {
    /// 1 = confirmed, 0 = failed
    pub status: u8,
}

/// Client for one node daemon endpoint.
#[derive(Debug, Clone)]
pub struct NodeClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl NodeClient {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        NodeClient { client, url, timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn get_block_template(&self, address: &str) -> Result<BlockTemplate, RpcError> {
        call(&self.client, &self.url, self.timeout, "get_block_template", json!({ "address": address })).await
    }

    pub async fn get_info(&self) -> Result<NodeInfo, RpcError> {
        call(&self.client, &self.url, self.timeout, "get_info", json!({})).await
    }

    pub async fn p2p_status(&self) -> Result<P2pStatus, RpcError> {
        call(&self.client, &self.url, self.timeout, "p2p_status", json!({})).await
    }

    pub async fn get_block_at_topoheight(&self, topoheight: u64) -> Result<CanonicalBlock, RpcError> {
        call(
            &self.client,
            &self.url,
            self.timeout,
            "get_block_at_topoheight",
            json!({ "topoheight": topoheight }),
        )
        .await
    }

    pub async fn submit_block(&self, block_template: &str, miner_work: &str) -> Result<bool, RpcError> {
        call(
            &self.client,
            &self.url,
            self.timeout,
            "submit_block",
            json!({ "block_template": block_template, "miner_work": miner_work }),
        )
        .await
    }

    pub async fn get_balance(&self, asset: &str) -> Result<u64, RpcError> {
        call(&self.client, &self.url, self.timeout, "get_balance", json!({ "asset": asset })).await
    }

    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<TransactionReceipt, RpcError> {
        call(
            &self.client,
            &self.url,
            self.timeout,
            "get_transaction_receipt",
            json!({ "tx_hash": tx_hash }),
        )
        .await
    }
}

// ─── Wallet RPC shapes ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TransferDestination {
    pub address: String,
    pub amount: u64,
}

/// Client for the pool wallet endpoint.
#[derive(Debug, Clone)]
pub struct WalletClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl WalletClient {
    pub fn new(client: reqwest::Client, url: String, timeout: Duration) -> Self {
        WalletClient { client, url, timeout }
    }

    pub async fn is_online(&self) -> Result<bool, RpcError> {
        call(&self.client, &self.url, self.timeout, "is_online", json!({})).await
    }

    /// Send one transaction paying every destination; returns the tx
    /// hash.
    pub async fn batch_transfer(&self, destinations: &[TransferDestination]) -> Result<String, RpcError> {
        call(
            &self.client,
            &self.url,
            self.timeout,
            "batch_transfer",
            json!({ "destinations": destinations }),
        )
        .await
    }
}
