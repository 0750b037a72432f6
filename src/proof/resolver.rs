//! Off-chain lookup resolution for NFT-gated native calls

use super::{Attester, OwnershipChallenge, Preflight};
use crate::chain::ForwarderContract;
use crate::error::{ExecutorError, ExecutorResult};
use crate::tx::ForwardRequest;

use ethers::types::{Address, Bytes};
use std::sync::Arc;
use tracing::{debug, info};

/// Attested proof ready to be submitted to the forwarder callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    /// Callback calldata: `callbackFunction ++ abi.encode(attestation, extraData)`
    pub calldata: Bytes,
    pub challenge: OwnershipChallenge,
    pub attestation: Bytes,
}

impl Proof {
    /// Address whose ownership or delegation the proof vouches for
    pub fn authorizer(&self) -> Address {
        self.challenge.authorizer
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofResolution {
    /// Caller is authorized onchain, submit the call unchanged
    NotRequired,
    Resolved(Proof),
}

pub struct ProofResolver {
    forwarder: ForwarderContract,
    attester: Option<Arc<dyn Attester>>,
}

impl ProofResolver {
    pub fn new(forwarder: ForwarderContract, attester: Option<Arc<dyn Attester>>) -> Self {
        Self { forwarder, attester }
    }

    pub fn forwarder(&self) -> &ForwarderContract {
        &self.forwarder
    }

    /// Run the preflight for `request` and, if the forwarder asks for
    /// offchain data, build the attested callback calldata
    pub async fn resolve(&self, request: &ForwardRequest) -> ExecutorResult<ProofResolution> {
        let lookup = match self.forwarder.preflight_native(request).await? {
            Preflight::Authorized => return Ok(ProofResolution::NotRequired),
            Preflight::NeedsProof(lookup) => lookup,
        };

        if lookup.sender != self.forwarder.address() {
            return Err(ExecutorError::Authorization(format!(
                "OffchainLookup sender {:?} is not the forwarder {:?}",
                lookup.sender,
                self.forwarder.address()
            )));
        }

        let attester = self.attester.as_ref().ok_or_else(|| {
            ExecutorError::Config("Forwarder requested an ownership proof but no attester is configured".to_string())
        })?;

        let challenge = OwnershipChallenge::decode(&lookup.call_data)?;
        debug!(
            "Ownership challenge for {:?} on behalf of {:?} (token {} on chain {})",
            challenge.from, challenge.authorizer, challenge.nft_token_id, challenge.nft_chain_id
        );

        let message = self.forwarder.create_message(&challenge).await?;
        let attestation = attester.attest(&lookup, &message).await?;
        let calldata = ForwarderContract::callback_calldata(&lookup, &attestation);

        info!("Resolved ownership proof for authorizer {:?}", challenge.authorizer);
        crate::metrics::record_proof_resolved();

        Ok(ProofResolution::Resolved(Proof {
            calldata,
            challenge,
            attestation,
        }))
    }
}
