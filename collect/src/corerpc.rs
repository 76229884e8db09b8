//! Data collection against the Bitcoin Core JSON-RPC API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use bitcoin::Amount;
use hyper::{Body, Client, Method, Request};
use serde::Deserialize;
use serde_json::{json, value::RawValue, Value};

use sim::FeeRate;

use crate::state::{prune_low_fee, MempoolEntry, MempoolState};
use crate::{BlockGetter, BlockInfo, MempoolStateGetter};

#[derive(Debug, Clone, serde::Serialize, Deserialize)]
#[serde(default)]
pub struct CoreRpcConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// HTTP timeout in seconds.
    pub timeout: u64,
}

impl Default for CoreRpcConfig {
    fn default() -> Self {
        CoreRpcConfig {
            host: "localhost".to_string(),
            port: 8332,
            username: String::new(),
            password: String::new(),
            timeout: 30,
        }
    }
}

#[derive(serde::Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    method: &'static str,
    params: Value,
    id: i64,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Box<RawValue>>,
    error: Option<Value>,
    id: i64,
}

/// A minimal Bitcoin Core JSON-RPC client with basic auth and batch support.
pub struct CoreRpcClient {
    http: Client<hyper::client::HttpConnector>,
    cfg: CoreRpcConfig,
    next_id: AtomicI64,
    relay_fee: FeeRate,
}

impl CoreRpcClient {
    /// Connect and fetch the node's relay fee, which every mempool snapshot
    /// is filtered against.
    pub async fn connect(cfg: CoreRpcConfig) -> Result<CoreRpcClient> {
        let mut client = CoreRpcClient {
            http: Client::new(),
            cfg,
            next_id: AtomicI64::new(0),
            relay_fee: 0,
        };
        client.relay_fee = client.get_relay_fee().await?;
        Ok(client)
    }

    pub fn relay_fee(&self) -> FeeRate {
        self.relay_fee
    }

    async fn get_relay_fee(&self) -> Result<FeeRate> {
        let info = self.call("getnetworkinfo", json!([])).await?;
        let info: Value = serde_json::from_str(info.get())?;
        let btc_per_kb = info["relayfee"]
            .as_f64()
            .ok_or_else(|| anyhow!("getnetworkinfo: missing relayfee"))?;
        Ok(Amount::from_btc(btc_per_kb)?.to_sat() as FeeRate)
    }

    /// Batched getrawmempool + getblockcount, so the snapshot and height are
    /// taken from the same node state.
    pub async fn poll_mempool(&self) -> Result<(i64, HashMap<String, RawMempoolEntry>)> {
        let results = self
            .call_batch(&[("getrawmempool", json!([true])), ("getblockcount", json!([]))])
            .await?;
        let entries: HashMap<String, RawMempoolEntry> = serde_json::from_str(results[0].get())?;
        let height: i64 = serde_json::from_str(results[1].get())?;
        Ok((height, entries))
    }

    pub async fn get_block_info(&self, height: i64) -> Result<BlockInfo> {
        let hash = self.call("getblockhash", json!([height])).await?;
        let hash: String = serde_json::from_str(hash.get())?;
        let block = self.call("getblock", json!([hash, true])).await?;
        let block: RawBlock = serde_json::from_str(block.get())?;
        Ok(BlockInfo {
            height: block.height,
            size: block.weight / 4,
            txids: block.tx,
            num_hashes: block.difficulty * 4295032833.000015,
            tag: Vec::new(),
        })
    }

    async fn call(&self, method: &'static str, params: Value) -> Result<Box<RawValue>> {
        let req = RpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let body = serde_json::to_vec(&req)?;
        let resp: RpcResponse = serde_json::from_slice(&self.send_http(body).await?)?;
        if resp.id != req.id {
            bail!("mismatched RPC id");
        }
        if let Some(e) = resp.error {
            bail!("{}: {}", method, e);
        }
        resp.result.ok_or_else(|| anyhow!("{}: null result", method))
    }

    async fn call_batch(&self, calls: &[(&'static str, Value)]) -> Result<Vec<Box<RawValue>>> {
        let reqs: Vec<RpcRequest> = calls
            .iter()
            .map(|(method, params)| RpcRequest {
                jsonrpc: "2.0",
                method,
                params: params.clone(),
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
            })
            .collect();
        let body = serde_json::to_vec(&reqs)?;
        let resps: Vec<RpcResponse> = serde_json::from_slice(&self.send_http(body).await?)?;

        // Responses may arrive in any order; match them back up by id.
        let mut results = Vec::with_capacity(reqs.len());
        for req in &reqs {
            let resp = resps
                .iter()
                .find(|r| r.id == req.id)
                .ok_or_else(|| anyhow!("unmatched RPC id"))?;
            if let Some(e) = &resp.error {
                bail!("{}: {}", req.method, e);
            }
            let result = resp
                .result
                .as_ref()
                .ok_or_else(|| anyhow!("{}: null result", req.method))?;
            results.push(RawValue::from_string(result.get().to_string())?);
        }
        Ok(results)
    }

    async fn send_http(&self, body: Vec<u8>) -> Result<Vec<u8>> {
        let uri = format!("http://{}:{}/", self.cfg.host, self.cfg.port);
        let auth = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.cfg.username, self.cfg.password));
        let req = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Basic {auth}"))
            .body(Body::from(body))?;

        let resp = tokio::time::timeout(
            Duration::from_secs(self.cfg.timeout),
            self.http.request(req),
        )
        .await
        .context("RPC timeout")??;
        let bytes = tokio::time::timeout(
            Duration::from_secs(self.cfg.timeout),
            hyper::body::to_bytes(resp.into_body()),
        )
        .await
        .context("RPC timeout")??;
        Ok(bytes.to_vec())
    }
}

/// A getrawmempool verbose entry, as served by the node.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMempoolEntry {
    pub size: i64,
    pub time: i64,
    #[serde(default)]
    pub depends: Vec<String>,
    pub fee: f64,
    #[serde(default)]
    pub currentpriority: f64,
}

impl RawMempoolEntry {
    fn into_entry(self) -> Result<MempoolEntry> {
        let fee_rate = (Amount::from_btc(self.fee)?.to_sat() as i64 * 1000) / self.size;
        Ok(MempoolEntry {
            size: self.size,
            fee_rate,
            time: self.time,
            depends: self.depends,
            // Vestigial: Bitcoin Core no longer has a concept of priority.
            high_priority: false,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    height: i64,
    weight: i64,
    tx: Vec<String>,
    difficulty: f64,
}

/// The state getter over a connected client. Entries below the relay fee are
/// pruned (with their descendants) before the snapshot is published.
pub struct CoreRpcStateGetter {
    pub client: Arc<CoreRpcClient>,
    /// Injectable clock, Unix seconds.
    pub now: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl CoreRpcStateGetter {
    pub fn new(client: Arc<CoreRpcClient>) -> Self {
        CoreRpcStateGetter {
            client,
            now: Box::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0)
            }),
        }
    }
}

#[async_trait]
impl MempoolStateGetter for CoreRpcStateGetter {
    async fn get_state(&self) -> Result<MempoolState> {
        let (height, raw_entries) = self.client.poll_mempool().await?;
        let mut entries = HashMap::with_capacity(raw_entries.len());
        for (txid, raw) in raw_entries {
            entries.insert(txid, raw.into_entry()?);
        }
        prune_low_fee(&mut entries, self.client.relay_fee());
        Ok(MempoolState {
            height,
            entries,
            time: (self.now)(),
            min_fee_rate: self.client.relay_fee(),
        })
    }
}

#[async_trait]
impl BlockGetter for CoreRpcClient {
    async fn get_block(&self, height: i64) -> Result<BlockInfo> {
        self.get_block_info(height).await
    }
}
