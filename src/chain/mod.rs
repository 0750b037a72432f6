//! Chain module - the network capability the executor is built on
//!
//! This module provides:
//! - The `NetworkRpc` trait, the only way the executor touches the network
//! - An ethers-backed provider with bounded per-call timeouts
//! - Typed access to the forwarder contract

pub mod forwarder;
pub mod provider;

pub use forwarder::ForwarderContract;
pub use provider::ChainProvider;

use crate::error::ExecutorResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256};

/// Result of a read-only contract call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call returned normally with this data
    Success(Bytes),
    /// The call reverted with this revert data
    Reverted(Bytes),
}

/// Network RPC capability injected into the executor
///
/// Implementations must bound every call with a timeout; an unresponsive
/// endpoint surfaces as `ExecutorError::Timeout` rather than stalling.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkRpc: Send + Sync {
    /// Chain the provider is connected to
    fn chain_id(&self) -> u64;

    /// Count of transactions sent from `address`, including pending ones
    async fn transaction_count(&self, address: Address) -> ExecutorResult<u64>;

    /// Base fee of the latest block, `None` if the chain does not report one
    async fn base_fee(&self) -> ExecutorResult<Option<U256>>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> ExecutorResult<U256>;

    /// Read-only call; a revert is an `Ok(CallOutcome::Reverted)`, not an error
    async fn call(&self, tx: &TypedTransaction) -> ExecutorResult<CallOutcome>;

    async fn send_raw_transaction(&self, raw: Bytes) -> ExecutorResult<H256>;

    async fn transaction_receipt(&self, tx_hash: H256) -> ExecutorResult<Option<TransactionReceipt>>;
}
