//! Nonce tracking for one signer on one chain
//!
//! Handles:
//! - Seeding from the network once per session
//! - Handing out strictly increasing nonces, never reusing one
//! - Fast-forwarding past explicit nonce overrides

use crate::chain::{ForwarderContract, NetworkRpc};
use crate::error::{ExecutorError, ExecutorResult};

use ethers::types::Address;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
enum NonceState {
    Ready { next: u64 },
    /// Seeding failed; every request is rejected
    Unavailable { reason: String },
}

/// Next-nonce counter owned by a single executor
///
/// A reserved nonce is spent even if the transaction using it is never
/// submitted.
#[derive(Debug, Clone)]
pub struct NonceTracker {
    address: Address,
    state: NonceState,
}

impl NonceTracker {
    pub fn new(address: Address, next: u64) -> Self {
        Self {
            address,
            state: NonceState::Ready { next },
        }
    }

    pub fn unavailable(address: Address, reason: impl Into<String>) -> Self {
        Self {
            address,
            state: NonceState::Unavailable {
                reason: reason.into(),
            },
        }
    }

    /// Seed from the account's transaction count
    pub async fn seed(rpc: &dyn NetworkRpc, address: Address) -> Self {
        match rpc.transaction_count(address).await {
            Ok(next) => {
                debug!("Seeded nonce for {:?} on chain {}: {}", address, rpc.chain_id(), next);
                Self::new(address, next)
            }
            Err(e) => {
                warn!("Failed to seed nonce for {:?}: {}", address, e);
                Self::unavailable(address, e.to_string())
            }
        }
    }

    /// Seed from the forwarder's per-sender nonce
    pub async fn seed_from_forwarder(forwarder: &ForwarderContract, address: Address) -> Self {
        match forwarder.nonce_of(address).await {
            Ok(next) => {
                debug!("Seeded forwarder nonce for {:?}: {}", address, next);
                Self::new(address, next)
            }
            Err(e) => {
                warn!("Failed to seed forwarder nonce for {:?}: {}", address, e);
                Self::unavailable(address, e.to_string())
            }
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// The nonce the next call to `next()` will return
    pub fn peek(&self) -> ExecutorResult<u64> {
        match &self.state {
            NonceState::Ready { next } => Ok(*next),
            NonceState::Unavailable { reason } => Err(ExecutorError::Config(format!(
                "Nonce for {:?} unavailable: {}",
                self.address, reason
            ))),
        }
    }

    /// Return the current nonce and advance
    pub fn next(&mut self) -> ExecutorResult<u64> {
        let nonce = self.peek()?;
        self.state = NonceState::Ready {
            next: following(nonce)?,
        };
        debug!("Allocated nonce {} for {:?}", nonce, self.address);
        Ok(nonce)
    }

    /// Use an explicit nonce, skipping any nonces below it
    pub fn reserve(&mut self, nonce: u64) -> ExecutorResult<u64> {
        let next = self.peek()?;
        let after = following(nonce)?;
        if nonce < next {
            return Err(ExecutorError::InvalidRequest(format!(
                "Nonce {} already used by {:?} (next is {})",
                nonce, self.address, next
            )));
        }
        if nonce > next {
            warn!("Skipping nonces {}..{} for {:?}", next, nonce, self.address);
        }
        self.state = NonceState::Ready { next: after };
        Ok(nonce)
    }
}

/// Nonce after `nonce`; EIP-2681 caps account nonces below 2^64 - 1, so
/// `u64::MAX` itself is never usable
fn following(nonce: u64) -> ExecutorResult<u64> {
    match nonce.checked_add(1) {
        Some(next) => Ok(next),
        None => Err(ExecutorError::InvalidRequest(format!(
            "Nonce {} is outside the valid range",
            nonce
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkRpc;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_seed_and_increment() {
        let mut rpc = MockNetworkRpc::new();
        rpc.expect_chain_id().return_const(1u64);
        rpc.expect_transaction_count().returning(|_| Ok(4));

        let mut tracker = NonceTracker::seed(&rpc, Address::repeat_byte(1)).await;
        assert_eq!(tracker.peek().unwrap(), 4);
        assert_eq!(tracker.next().unwrap(), 4);
        assert_eq!(tracker.next().unwrap(), 5);
        assert_eq!(tracker.peek().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_failed_seed_rejects_every_call() {
        let mut rpc = MockNetworkRpc::new();
        rpc.expect_chain_id().return_const(1u64);
        rpc.expect_transaction_count()
            .returning(|_| Err(ExecutorError::Network("connection refused".to_string())));

        let mut tracker = NonceTracker::seed(&rpc, Address::repeat_byte(1)).await;
        assert!(matches!(tracker.next(), Err(ExecutorError::Config(_))));
        assert!(matches!(tracker.next(), Err(ExecutorError::Config(_))));
        assert!(matches!(tracker.reserve(10), Err(ExecutorError::Config(_))));
    }

    #[test]
    fn test_reserve_rejects_used_nonce() {
        let mut tracker = NonceTracker::new(Address::zero(), 10);
        let err = assert_err!(tracker.reserve(9));
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
        // rejection leaves the tracker untouched
        assert_eq!(tracker.peek().unwrap(), 10);
    }

    #[test]
    fn test_reserve_rejects_max_nonce() {
        let mut tracker = NonceTracker::new(Address::zero(), 10);
        let err = assert_err!(tracker.reserve(u64::MAX));
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
        // rejection leaves the tracker untouched
        assert_eq!(assert_ok!(tracker.next()), 10);
    }

    #[test]
    fn test_next_stops_at_nonce_ceiling() {
        let mut tracker = NonceTracker::new(Address::zero(), 10);
        assert_eq!(assert_ok!(tracker.reserve(u64::MAX - 1)), u64::MAX - 1);
        let err = assert_err!(tracker.next());
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
        // never wraps back to a used nonce
        assert_eq!(assert_ok!(tracker.peek()), u64::MAX);
    }

    #[test]
    fn test_reserve_fast_forwards() {
        let mut tracker = NonceTracker::new(Address::zero(), 10);
        assert_eq!(assert_ok!(tracker.reserve(12)), 12);
        assert_eq!(assert_ok!(tracker.next()), 13);
    }
}
