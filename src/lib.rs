//! Essential Executor - native and forwarded transaction execution
//!
//! Submits contract calls either as signed native transactions or as
//! EIP-712 forward requests delivered through a relayer, resolving
//! EIP-3668 offchain ownership proofs for NFT-gated calls along the way.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod proof;
pub mod relay;
pub mod signer;
pub mod tx;

pub use error::{ExecutorError, ExecutorResult};
pub use tx::{CallRequest, ExecuteOptions, ExecutionOutcome, SigningMode, TransactionExecutor};
