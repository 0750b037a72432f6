//! Typed reads against the forwarder contract

use super::{CallOutcome, NetworkRpc};
use crate::error::{ExecutorError, ExecutorResult};
use crate::proof::{OffchainLookup, OwnershipChallenge, Preflight};
use crate::tx::ForwardRequest;

use ethers::abi::{self, ParamType, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, U256};
use ethers::utils::id;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const GET_NONCE: &str = "getNonce(address)";
pub const PREFLIGHT_NATIVE: &str = "preflightNative((address,address,address,address,uint256,uint256,uint256,uint256,uint256,uint256,bytes))";
pub const CREATE_MESSAGE: &str = "createMessage(address,address,uint256,uint256,address,uint256,uint256)";

/// Forwarder contract reached through the injected network capability
#[derive(Clone)]
pub struct ForwarderContract {
    address: Address,
    rpc: Arc<dyn NetworkRpc>,
}

impl ForwarderContract {
    pub fn new(address: Address, rpc: Arc<dyn NetworkRpc>) -> Self {
        Self { address, rpc }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn chain_id(&self) -> u64 {
        self.rpc.chain_id()
    }

    /// Next forwarder nonce for `from`
    pub async fn nonce_of(&self, from: Address) -> ExecutorResult<u64> {
        let data = encode_call(GET_NONCE, &[Token::Address(from)]);
        let returned = self.read(GET_NONCE, data).await?;

        let nonce = abi::decode(&[ParamType::Uint(256)], &returned)?
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| ExecutorError::Encoding("getNonce returned no value".to_string()))?;

        if nonce > U256::from(u64::MAX) {
            return Err(ExecutorError::Encoding(format!("Forwarder nonce {} out of range", nonce)));
        }
        Ok(nonce.as_u64())
    }

    /// Ask the forwarder whether `request` is authorized as-is
    ///
    /// An `OffchainLookup` revert is the expected "needs proof" answer. Any
    /// other revert is a hard authorization failure.
    pub async fn preflight_native(&self, request: &ForwardRequest) -> ExecutorResult<Preflight> {
        let data = encode_call(PREFLIGHT_NATIVE, &[request.to_token()]);
        let tx = self.read_tx(Some(request.from), data);

        match self.rpc.call(&tx).await? {
            CallOutcome::Success(_) => {
                debug!("Preflight passed without offchain data for {:?}", request.authorizer);
                Ok(Preflight::Authorized)
            }
            CallOutcome::Reverted(revert) => match OffchainLookup::decode_revert(&revert) {
                Some(lookup) => Ok(Preflight::NeedsProof(lookup)),
                None => Err(ExecutorError::Authorization(format!(
                    "Unexpected revert from preflightNative: 0x{}",
                    hex::encode(&revert)
                ))),
            },
        }
    }

    /// Canonical message the attester must sign for `challenge`
    pub async fn create_message(&self, challenge: &OwnershipChallenge) -> ExecutorResult<Bytes> {
        let data = encode_call(
            CREATE_MESSAGE,
            &[
                Token::Address(challenge.from),
                Token::Address(challenge.authorizer),
                Token::Uint(challenge.nonce),
                Token::Uint(challenge.nft_chain_id),
                Token::Address(challenge.nft_contract),
                Token::Uint(challenge.nft_token_id),
                Token::Uint(challenge.timestamp),
            ],
        );
        let returned = self.read(CREATE_MESSAGE, data).await?;

        // A bytes32 digest comes back raw, anything longer is an ABI `bytes`
        if returned.len() == 32 {
            return Ok(returned);
        }
        abi::decode(&[ParamType::Bytes], &returned)?
            .into_iter()
            .next()
            .and_then(Token::into_bytes)
            .map(Bytes::from)
            .ok_or_else(|| ExecutorError::Encoding("createMessage returned no value".to_string()))
    }

    /// Calldata for the forwarder callback named in `lookup`
    pub fn callback_calldata(lookup: &OffchainLookup, attestation: &Bytes) -> Bytes {
        let mut data = lookup.callback_function.to_vec();
        data.extend(abi::encode(&[
            Token::Bytes(attestation.to_vec()),
            Token::Bytes(lookup.extra_data.to_vec()),
        ]));
        Bytes::from(data)
    }

    /// ABI fragment sent to relayers alongside the forwarder address
    pub fn abi() -> serde_json::Value {
        let request = json!({
            "name": "req",
            "type": "tuple",
            "components": [
                { "name": "to", "type": "address" },
                { "name": "from", "type": "address" },
                { "name": "authorizer", "type": "address" },
                { "name": "nftContract", "type": "address" },
                { "name": "nonce", "type": "uint256" },
                { "name": "nftChainId", "type": "uint256" },
                { "name": "nftTokenId", "type": "uint256" },
                { "name": "targetChainId", "type": "uint256" },
                { "name": "value", "type": "uint256" },
                { "name": "gas", "type": "uint256" },
                { "name": "data", "type": "bytes" }
            ]
        });

        json!([
            {
                "type": "function",
                "name": "execute",
                "stateMutability": "payable",
                "inputs": [request, { "name": "signature", "type": "bytes" }],
                "outputs": [{ "name": "", "type": "bool" }, { "name": "", "type": "bytes" }]
            },
            {
                "type": "function",
                "name": "preflight",
                "stateMutability": "view",
                "inputs": [request, { "name": "signature", "type": "bytes" }],
                "outputs": []
            },
            {
                "type": "function",
                "name": "preflightNative",
                "stateMutability": "view",
                "inputs": [request],
                "outputs": []
            },
            {
                "type": "function",
                "name": "getNonce",
                "stateMutability": "view",
                "inputs": [{ "name": "from", "type": "address" }],
                "outputs": [{ "name": "", "type": "uint256" }]
            },
            {
                "type": "error",
                "name": "OffchainLookup",
                "inputs": [
                    { "name": "sender", "type": "address" },
                    { "name": "urls", "type": "string[]" },
                    { "name": "callData", "type": "bytes" },
                    { "name": "callbackFunction", "type": "bytes4" },
                    { "name": "extraData", "type": "bytes" }
                ]
            }
        ])
    }

    fn read_tx(&self, from: Option<Address>, data: Vec<u8>) -> TypedTransaction {
        let mut tx = Eip1559TransactionRequest::new()
            .to(self.address)
            .data(data)
            .chain_id(self.rpc.chain_id());
        if let Some(from) = from {
            tx = tx.from(from);
        }
        tx.into()
    }

    async fn read(&self, function: &str, data: Vec<u8>) -> ExecutorResult<Bytes> {
        let tx = self.read_tx(None, data);
        match self.rpc.call(&tx).await? {
            CallOutcome::Success(returned) => Ok(returned),
            CallOutcome::Reverted(revert) => Err(ExecutorError::Network(format!(
                "{} reverted: 0x{}",
                function,
                hex::encode(&revert)
            ))),
        }
    }
}

fn encode_call(signature: &str, args: &[Token]) -> Vec<u8> {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    data
}
