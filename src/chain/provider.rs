//! Chain provider backed by an ethers HTTP provider

use super::{CallOutcome, NetworkRpc};
use crate::error::{ExecutorError, ExecutorResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionReceipt, H256, U256};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// HTTP provider wrapper that bounds every request with a timeout
pub struct ChainProvider {
    chain_id: u64,
    provider: Provider<Http>,
    request_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(chain_id: u64, rpc_url: &str, request_timeout: Duration) -> ExecutorResult<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| ExecutorError::Config(format!("Invalid RPC url {}: {}", rpc_url, e)))?
            .interval(Duration::from_millis(100));

        debug!("Created HTTP provider for chain {}: {}", chain_id, rpc_url);

        Ok(Self {
            chain_id,
            provider,
            request_timeout,
        })
    }

    /// Underlying ethers provider
    pub fn http(&self) -> &Provider<Http> {
        &self.provider
    }

    /// Run an RPC future under the configured timeout
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> ExecutorResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(ExecutorError::Network(format!("{}: {}", operation, e))),
            Err(_) => {
                warn!("{} timed out on chain {}", operation, self.chain_id);
                Err(ExecutorError::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl NetworkRpc for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, address: Address) -> ExecutorResult<u64> {
        let count = self
            .bounded(
                "get_transaction_count",
                self.provider
                    .get_transaction_count(address, Some(BlockNumber::Pending.into())),
            )
            .await?;
        Ok(count.as_u64())
    }

    async fn base_fee(&self) -> ExecutorResult<Option<U256>> {
        let block = self
            .bounded("get_block", self.provider.get_block(BlockNumber::Latest))
            .await?;
        Ok(block.and_then(|b| b.base_fee_per_gas))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> ExecutorResult<U256> {
        match timeout(self.request_timeout, self.provider.estimate_gas(tx, None)).await {
            Ok(Ok(gas)) => Ok(gas),
            Ok(Err(e)) => Err(ExecutorError::GasEstimation(e.to_string())),
            Err(_) => Err(ExecutorError::Timeout {
                operation: "estimate_gas".to_string(),
            }),
        }
    }

    async fn call(&self, tx: &TypedTransaction) -> ExecutorResult<CallOutcome> {
        match timeout(self.request_timeout, self.provider.call(tx, None)).await {
            Ok(Ok(data)) => Ok(CallOutcome::Success(data)),
            Ok(Err(e)) => {
                // Reverts come back as JSON-RPC errors carrying the revert data
                let revert = RpcError::as_error_response(&e).and_then(|resp| resp.as_revert_data());
                match revert {
                    Some(data) => Ok(CallOutcome::Reverted(data)),
                    None => Err(ExecutorError::Network(format!("eth_call: {}", e))),
                }
            }
            Err(_) => Err(ExecutorError::Timeout {
                operation: "eth_call".to_string(),
            }),
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> ExecutorResult<H256> {
        match timeout(self.request_timeout, self.provider.send_raw_transaction(raw)).await {
            Ok(Ok(pending)) => Ok(pending.tx_hash()),
            Ok(Err(e)) => Err(ExecutorError::from_submission(e.to_string())),
            Err(_) => Err(ExecutorError::Timeout {
                operation: "send_raw_transaction".to_string(),
            }),
        }
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> ExecutorResult<Option<TransactionReceipt>> {
        self.bounded(
            "get_transaction_receipt",
            self.provider.get_transaction_receipt(tx_hash),
        )
        .await
    }
}
