//! Relay client - delivers signed forward requests to a relayer
//!
//! The relayer pays gas and submits the request to the forwarder. Every
//! failure here is terminal: the relay path never exposes local nonce
//! collisions, so there is nothing for the executor to retry.

use crate::chain::ForwarderContract;
use crate::config::RelayConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::tx::ForwardRequest;

use ethers::types::{Address, Bytes, H256};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

/// Body POSTed to the relayer
#[derive(Debug, Clone, Serialize)]
pub struct RelayEnvelope<'a> {
    pub request: &'a ForwardRequest,
    pub signature: &'a Bytes,
    pub forwarder: ForwarderIdentity<'a>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwarderIdentity<'a> {
    pub address: Address,
    pub abi: &'a Value,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    status: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayResult {
    tx_hash: H256,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    client: Client,
    relayer_uri: String,
    forwarder: Address,
    abi: Value,
}

impl RelayClient {
    pub fn new(relayer_uri: impl Into<String>, forwarder: Address, abi: Value, timeout: Duration) -> ExecutorResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExecutorError::Config(format!("Failed to build relay client: {}", e)))?;

        Ok(Self {
            client,
            relayer_uri: relayer_uri.into(),
            forwarder,
            abi,
        })
    }

    /// Build from config, `None` when no relayer is configured
    pub fn from_config(config: &RelayConfig, forwarder: Address) -> ExecutorResult<Option<Self>> {
        let Some(uri) = config.relayer_uri.as_deref() else {
            return Ok(None);
        };

        let abi = match config.forwarder_abi_path.as_deref() {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| ExecutorError::Config(format!("Failed to read forwarder ABI {}: {}", path, e)))?;
                serde_json::from_str(&raw)
                    .map_err(|e| ExecutorError::Config(format!("Invalid forwarder ABI {}: {}", path, e)))?
            }
            None => ForwarderContract::abi(),
        };

        Self::new(uri, forwarder, abi, config.timeout()).map(Some)
    }

    pub fn relayer_uri(&self) -> &str {
        &self.relayer_uri
    }

    /// Submit a signed request and return the relayer's transaction hash
    pub async fn relay(&self, request: &ForwardRequest, signature: &Bytes) -> ExecutorResult<H256> {
        let envelope = RelayEnvelope {
            request,
            signature,
            forwarder: ForwarderIdentity {
                address: self.forwarder,
                abi: &self.abi,
            },
        };

        debug!("Relaying forward request nonce {} to {}", request.nonce, self.relayer_uri);

        let response = self
            .client
            .post(&self.relayer_uri)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| {
                crate::metrics::record_relay("unreachable");
                if e.is_timeout() {
                    ExecutorError::Timeout {
                        operation: format!("relay to {}", self.relayer_uri),
                    }
                } else {
                    ExecutorError::Network(format!("Relay {} unreachable: {}", self.relayer_uri, e))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExecutorError::Network(format!("Failed to read relay response: {}", e)))?;

        match parse_relay_response(status, &body) {
            Ok(hash) => {
                info!("Relayer accepted forward request: {:?}", hash);
                crate::metrics::record_relay("accepted");
                Ok(hash)
            }
            Err(e) => {
                error!("Relay failed: {}", e);
                crate::metrics::record_relay(e.kind());
                Err(e)
            }
        }
    }
}

/// Interpret a relayer reply
///
/// Success is a 2xx with `{status: "success", result}` where `result` is a
/// JSON-encoded `{txHash}`. A 4xx or a non-success status is the relayer
/// refusing the envelope.
pub fn parse_relay_response(status: StatusCode, body: &str) -> ExecutorResult<H256> {
    if status.is_client_error() {
        return Err(ExecutorError::Authorization(format!(
            "Relayer rejected request ({}): {}",
            status, body
        )));
    }
    if !status.is_success() {
        return Err(ExecutorError::Relay(format!("Relayer answered {}: {}", status, body)));
    }

    let response: RelayResponse = serde_json::from_str(body)
        .map_err(|e| ExecutorError::Relay(format!("Malformed relay response: {}", e)))?;

    if response.status != "success" {
        return Err(ExecutorError::Authorization(format!(
            "Relayer returned status {}: {}",
            response.status, response.result
        )));
    }

    let result: RelayResult = match response.result {
        Value::String(encoded) => serde_json::from_str(&encoded),
        other => serde_json::from_value(other),
    }
    .map_err(|e| ExecutorError::Relay(format!("Relay result carries no transaction hash: {}", e)))?;

    Ok(result.tx_hash)
}
