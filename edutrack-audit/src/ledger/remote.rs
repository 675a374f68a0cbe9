//! JSON-RPC chain node ledger.
//!
//! Works with any Ethereum-compatible node exposing an unlocked account,
//! including:
//! - Ganache
//! - Hardhat / Anvil dev nodes
//! - Geth in `--dev` mode
//!
//! The digest travels in the transaction data field as a small JSON payload;
//! the transaction is sent from the account to itself with zero value.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use reqwest::{header, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::hasher::Digest;
use crate::types::{LedgerOrigin, Receipt, SubjectRef, SubmissionMetadata};

/// Transactions per block addressable in a sequence number.
const TX_INDEX_BITS: u32 = 20;

/// Configuration for a JSON-RPC ledger node.
#[derive(Debug, Clone)]
pub struct RemoteLedgerConfig {
    /// Node RPC endpoint, e.g. `http://localhost:8545`
    pub url: String,
    /// Sending account; defaults to the node's first unlocked account
    pub account: Option<String>,
    /// Gas limit per submission
    pub gas_limit: u64,
    /// Gas price in gwei
    pub gas_price_gwei: u64,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    /// How many times to poll for the transaction receipt
    pub confirmation_attempts: u32,
    /// Delay between receipt polls
    pub confirmation_interval: Duration,
}

impl Default for RemoteLedgerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8545".to_string(),
            account: None,
            gas_limit: 100_000,
            gas_price_gwei: 20,
            request_timeout: Duration::from_secs(5),
            confirmation_attempts: 20,
            confirmation_interval: Duration::from_millis(250),
        }
    }
}

/// Ledger backed by a JSON-RPC chain node.
pub struct RemoteLedger {
    client: Client,
    config: RemoteLedgerConfig,
    account: OnceCell<String>,
    next_id: AtomicU64,
    /// Transactions the node accepted whose receipt has not been seen yet
    in_flight: DashMap<(SubjectRef, Digest), InFlight>,
}

/// A sent transaction awaiting its receipt.
#[derive(Debug, Clone)]
struct InFlight {
    tx_hash: String,
    submitted_at: DateTime<Utc>,
}

impl RemoteLedger {
    /// Create a new remote ledger client.
    pub fn new(config: RemoteLedgerConfig) -> Result<Self, LedgerError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .user_agent("edutrack-audit/0.1")
            .build()
            .map_err(|e| LedgerError::InvalidResponse(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            account: OnceCell::new(),
            next_id: AtomicU64::new(1),
            in_flight: DashMap::new(),
        })
    }

    /// Create a client pointing to a local Ganache instance.
    pub fn ganache(port: u16) -> Result<Self, LedgerError> {
        Self::new(RemoteLedgerConfig {
            url: format!("http://localhost:{}", port),
            ..Default::default()
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Issue a JSON-RPC call.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method,
            params,
        };

        let response = self
            .client
            .post(&self.config.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                LedgerError::Unreachable(format!("HTTP {}: {}", status, body))
            } else {
                LedgerError::Rejected(format!("HTTP {}: {}", status, body))
            });
        }

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        if let Some(error) = rpc.error {
            return Err(LedgerError::Rejected(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }

        serde_json::from_value(rpc.result.unwrap_or(serde_json::Value::Null))
            .map_err(|e| LedgerError::InvalidResponse(format!("{}: {}", method, e)))
    }

    /// Resolve the sending account once per process.
    async fn account(&self) -> Result<&str, LedgerError> {
        self.account
            .get_or_try_init(|| async {
                if let Some(account) = &self.config.account {
                    return Ok::<String, LedgerError>(account.clone());
                }
                let accounts: Vec<String> = self.call("eth_accounts", serde_json::json!([])).await?;
                accounts
                    .into_iter()
                    .next()
                    .ok_or_else(|| LedgerError::Rejected("Node exposes no unlocked accounts".to_string()))
            })
            .await
            .map(String::as_str)
    }

    /// Send the anchor transaction and remember its hash until it is mined.
    async fn send(
        &self,
        digest: &Digest,
        metadata: &SubmissionMetadata,
    ) -> Result<InFlight, LedgerError> {
        let account = self.account().await?.to_string();
        let submitted_at = Utc::now();

        let payload = AnchorPayload {
            subject_kind: metadata.subject.kind.clone(),
            subject_id: metadata.subject.id.clone(),
            kind: metadata.kind.to_string(),
            digest: digest.to_string(),
            timestamp: submitted_at.timestamp(),
        };
        let payload_json = serde_json::to_string(&payload)
            .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        let gas_price_wei = u128::from(self.config.gas_price_gwei) * 1_000_000_000;
        let transaction = serde_json::json!({
            "from": account,
            "to": account,
            "value": "0x0",
            "gas": format!("{:#x}", self.config.gas_limit),
            "gasPrice": format!("{:#x}", gas_price_wei),
            "data": format!("0x{}", hex::encode(payload_json.as_bytes())),
        });

        let tx_hash: String = self
            .call("eth_sendTransaction", serde_json::json!([transaction]))
            .await?;

        let sent = InFlight {
            tx_hash,
            submitted_at,
        };
        self.in_flight
            .insert((metadata.subject.clone(), digest.clone()), sent.clone());
        Ok(sent)
    }

    /// Poll until the transaction is mined or the confirmation budget runs out.
    async fn wait_for_receipt(&self, tx_hash: &str) -> Result<TxReceipt, LedgerError> {
        for attempt in 0..self.config.confirmation_attempts.max(1) {
            let receipt: Option<TxReceipt> = self
                .call("eth_getTransactionReceipt", serde_json::json!([tx_hash]))
                .await?;
            if let Some(receipt) = receipt {
                return Ok(receipt);
            }
            debug!(tx_hash = %tx_hash, attempt, "Transaction not mined yet");
            tokio::time::sleep(self.config.confirmation_interval).await;
        }

        Err(LedgerError::Rejected(format!(
            "Transaction {} not mined after {} attempts",
            tx_hash, self.config.confirmation_attempts
        )))
    }
}

/// JSON payload stored in the transaction data field.
#[derive(Debug, Serialize, Deserialize)]
struct AnchorPayload {
    subject_kind: String,
    subject_id: String,
    kind: String,
    digest: String,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<serde_json::Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    block_number: String,
    transaction_index: String,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxByHash {
    hash: String,
    input: String,
    block_number: Option<String>,
    transaction_index: Option<String>,
}

fn parse_quantity(value: &str) -> Result<u64, LedgerError> {
    let trimmed = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(trimmed, 16)
        .map_err(|e| LedgerError::InvalidResponse(format!("Bad quantity {:?}: {}", value, e)))
}

/// Ledger position of a mined transaction.
fn sequence_for(block: u64, index: u64) -> Result<u64, LedgerError> {
    block
        .checked_mul(1 << TX_INDEX_BITS)
        .and_then(|base| base.checked_add(index))
        .ok_or_else(|| LedgerError::InvalidResponse(format!("Block {} out of range", block)))
}

fn is_tx_hash(value: &str) -> bool {
    value
        .strip_prefix("0x")
        .map(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

#[async_trait]
impl LedgerClient for RemoteLedger {
    fn origin(&self) -> LedgerOrigin {
        LedgerOrigin::Remote
    }

    async fn submit(
        &self,
        digest: &Digest,
        metadata: &SubmissionMetadata,
    ) -> Result<Receipt, LedgerError> {
        let key = (metadata.subject.clone(), digest.clone());
        let sent = match self.in_flight.get(&key).map(|entry| entry.clone()) {
            Some(sent) => {
                info!(
                    subject = %metadata.subject,
                    tx_hash = %sent.tx_hash,
                    "Resuming confirmation of earlier transaction"
                );
                sent
            }
            None => self.send(digest, metadata).await?,
        };
        let InFlight {
            tx_hash,
            submitted_at,
        } = sent;

        let mined = self.wait_for_receipt(&tx_hash).await?;

        self.in_flight.remove(&key);

        if mined.status.as_deref() == Some("0x0") {
            warn!(tx_hash = %tx_hash, "Ledger transaction reverted");
            return Err(LedgerError::Rejected(format!("Transaction {} reverted", tx_hash)));
        }

        let sequence_number = sequence_for(
            parse_quantity(&mined.block_number)?,
            parse_quantity(&mined.transaction_index)?,
        )?;

        debug!(
            subject = %metadata.subject,
            tx_hash = %tx_hash,
            sequence_number,
            "Ledger node confirmed digest"
        );

        Ok(Receipt {
            receipt_id: tx_hash,
            digest: digest.clone(),
            sequence_number,
            submitted_at,
            confirmed: true,
            origin: LedgerOrigin::Remote,
        })
    }

    fn has_pending(&self, digest: &Digest, metadata: &SubmissionMetadata) -> bool {
        self.in_flight
            .contains_key(&(metadata.subject.clone(), digest.clone()))
    }

    async fn query(&self, receipt_id: &str) -> Result<Option<Receipt>, LedgerError> {
        if !is_tx_hash(receipt_id) {
            return Ok(None);
        }

        let tx: Option<TxByHash> = self
            .call("eth_getTransactionByHash", serde_json::json!([receipt_id]))
            .await?;
        let Some(tx) = tx else {
            return Ok(None);
        };

        let raw = hex::decode(tx.input.strip_prefix("0x").unwrap_or(&tx.input))
            .map_err(|e| LedgerError::InvalidResponse(format!("Bad transaction input: {}", e)))?;
        let payload: AnchorPayload = serde_json::from_slice(&raw)
            .map_err(|e| LedgerError::InvalidResponse(format!("Not an anchor payload: {}", e)))?;
        let digest = Digest::from_hex(&payload.digest)
            .ok_or_else(|| LedgerError::InvalidResponse(format!("Bad digest {:?}", payload.digest)))?;

        let (sequence_number, confirmed) = match (&tx.block_number, &tx.transaction_index) {
            (Some(block), Some(index)) => {
                (sequence_for(parse_quantity(block)?, parse_quantity(index)?)?, true)
            }
            _ => (0, false),
        };

        let submitted_at: DateTime<Utc> = Utc
            .timestamp_opt(payload.timestamp, 0)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(Some(Receipt {
            receipt_id: tx.hash,
            digest,
            sequence_number,
            submitted_at,
            confirmed,
            origin: LedgerOrigin::Remote,
        }))
    }

    async fn status(&self) -> LedgerStatus {
        let height = match self.call::<String>("eth_blockNumber", serde_json::json!([])).await {
            Ok(h) => parse_quantity(&h).ok(),
            Err(e) => {
                debug!(url = %self.config.url, error = %e, "Ledger node not reachable");
                return LedgerStatus::unreachable();
            }
        };

        let chain_id = self
            .call::<String>("eth_chainId", serde_json::json!([]))
            .await
            .ok()
            .and_then(|c| parse_quantity(&c).ok());

        let account = self.account().await.ok().map(str::to_string);

        LedgerStatus {
            reachable: true,
            height,
            chain_id,
            account,
        }
    }
}
