//! Proof module - EIP-3668 offchain lookups for NFT-gated calls
//!
//! This module provides:
//! - Decoding of `OffchainLookup` reverts and the ownership challenge inside
//! - Attesters that vouch for a challenge, locally or through a gateway
//! - The resolver that turns a preflight into callback calldata

pub mod attester;
pub mod lookup;
pub mod resolver;

pub use attester::{Attester, GatewayAttester, LocalAttester};
pub use lookup::{OffchainLookup, OwnershipChallenge, Preflight};
pub use resolver::{Proof, ProofResolution, ProofResolver};
