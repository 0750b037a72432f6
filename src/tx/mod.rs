//! Transaction module - building, signing and submitting calls
//!
//! Fee estimation and nonce tracking sit underneath the executor, which owns
//! one instance of each per (signer, chain) pair.

mod executor;
mod forward;
mod gas;
mod nonce;
mod request;

pub use executor::{
    Confirmation, ExecutionOutcome, ExecutionStage, ExecutorPolicy, ExecutorStatus, TransactionExecutor,
};
pub use forward::{ForwardRequest, ForwarderDomain, TypedForwardRequest, FORWARD_REQUEST_TYPE};
pub use gas::{FeeConfig, FeeEstimator, BASELINE_PRIORITY_FEE};
pub use nonce::NonceTracker;
pub use request::{
    CallArg, CallOverrides, CallRequest, ExecuteOptions, NftAuthorization, PreparedCall, SigningMode,
};
