use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::future::join_all;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use solana_sdk::{signature::Signature, transaction::VersionedTransaction};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::TradeError;

const TRANSACTIONS_PATH: &str = "/api/v1/transactions";

/// Block-engine relays that accept `sendTransaction` and forward to the
/// current leader, bypassing the public RPC queue.
#[derive(Debug, Clone)]
pub struct JitoClient {
    client: Client,
    endpoints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<String>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl JitoClient {
    pub fn new(endpoints: Vec<String>) -> Result<Self, TradeError> {
        if endpoints.is_empty() {
            return Err(TradeError::Config("No relay endpoints configured".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| TradeError::Config(format!("Failed to create HTTP client: {}", e)))?;
        info!("Relay client targeting {} endpoint(s)", endpoints.len());
        Ok(Self { client, endpoints })
    }

    /// Fans the signed transaction out to every endpoint. Succeeds when at
    /// least one relay accepted it; the signature is the transaction's own.
    pub async fn send_transaction(&self, transaction: &VersionedTransaction) -> Result<Signature, TradeError> {
        let signature = transaction
            .signatures
            .first()
            .copied()
            .ok_or_else(|| TradeError::Relay("Transaction is not signed".to_string()))?;

        let raw = bincode::serialize(transaction)
            .map_err(|e| TradeError::Relay(format!("Failed to serialize transaction: {}", e)))?;
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "sendTransaction",
            "params": [STANDARD.encode(raw), { "encoding": "base64" }],
        });

        let results = join_all(
            self.endpoints
                .iter()
                .map(|endpoint| self.post_to(endpoint, &payload)),
        )
        .await;

        let mut accepted = 0;
        let mut last_error = None;
        for (endpoint, result) in self.endpoints.iter().zip(results) {
            match result {
                Ok(relay_signature) => {
                    accepted += 1;
                    if relay_signature != signature.to_string() {
                        warn!(
                            "Relay {} echoed signature {} for {}",
                            endpoint, relay_signature, signature
                        );
                    }
                }
                Err(e) => {
                    warn!("Relay {} rejected {}: {}", endpoint, signature, e);
                    last_error = Some(e);
                }
            }
        }

        if accepted == 0 {
            let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
            error!("All relays rejected transaction {}", signature);
            return Err(TradeError::SubmissionFailed(format!(
                "All relays rejected {}: {}",
                signature, cause
            )));
        }

        debug!("{}/{} relays accepted {}", accepted, self.endpoints.len(), signature);
        Ok(signature)
    }

    async fn post_to(&self, endpoint: &str, payload: &serde_json::Value) -> Result<String, TradeError> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), TRANSACTIONS_PATH);
        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| TradeError::SubmissionFailed(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TradeError::SubmissionFailed(format!("Status {}: {}", status, error_text)));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| TradeError::SubmissionFailed(format!("Failed to parse relay response: {}", e)))?;

        match (body.result, body.error) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(TradeError::SubmissionFailed(format!(
                "{} (code {})",
                err.message, err.code
            ))),
            (None, None) => Err(TradeError::SubmissionFailed("Empty relay response".to_string())),
        }
    }
}
