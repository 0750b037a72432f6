//! Error types for the transaction executor

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    /// Submission failures that mean another transaction already holds the nonce
    static ref NONCE_COLLISION: Regex = Regex::new(
        r"(?i)(transaction already imported|already known|nonce too low|replacement transaction underpriced)"
    )
    .expect("nonce collision pattern is valid");
}

/// Main error type for the executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Nonce collision: {message}")]
    NonceCollision { message: String },

    #[error("Signing unsupported: {operation}")]
    SigningUnsupported { operation: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Transaction {tx_hash} reverted")]
    Reverted { tx_hash: String },

    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("{function} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        function: String,
        attempts: u32,
        reason: String,
    },
}

impl ExecutorError {
    /// Classify an error message returned by a transaction submission
    pub fn from_submission(message: impl Into<String>) -> Self {
        let message = message.into();
        if NONCE_COLLISION.is_match(&message) {
            ExecutorError::NonceCollision { message }
        } else {
            ExecutorError::Network(message)
        }
    }

    pub fn signing_unsupported(operation: &str) -> Self {
        ExecutorError::SigningUnsupported {
            operation: operation.to_string(),
        }
    }

    /// The only failure class the executor retries
    pub fn is_nonce_collision(&self) -> bool {
        matches!(self, ExecutorError::NonceCollision { .. })
    }

    pub fn is_signing_unsupported(&self) -> bool {
        matches!(self, ExecutorError::SigningUnsupported { .. })
    }

    /// Everything except the two conditions the executor handles itself
    pub fn is_terminal(&self) -> bool {
        !self.is_nonce_collision() && !self.is_signing_unsupported()
    }

    /// Short label used for metrics and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutorError::Config(_) => "configuration",
            ExecutorError::Authorization(_) => "authorization",
            ExecutorError::NonceCollision { .. } => "nonce_collision",
            ExecutorError::SigningUnsupported { .. } => "signing_unsupported",
            ExecutorError::Network(_) => "network",
            ExecutorError::Timeout { .. } => "timeout",
            ExecutorError::GasEstimation(_) => "gas_estimation",
            ExecutorError::Reverted { .. } => "reverted",
            ExecutorError::Relay(_) => "relay",
            ExecutorError::InvalidRequest(_) => "invalid_request",
            ExecutorError::Wallet(_) => "wallet",
            ExecutorError::Encoding(_) => "encoding",
            ExecutorError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl From<ethers::abi::Error> for ExecutorError {
    fn from(e: ethers::abi::Error) -> Self {
        ExecutorError::Encoding(e.to_string())
    }
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;
