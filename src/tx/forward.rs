//! Forward requests and their EIP-712 typed-data hashing
//!
//! The type string below is what the forwarder contract verifies against.
//! Field order is part of the signature: reordering or dropping a field
//! produces a digest the forwarder will reject.

use ethers::abi::{self, Token};
use ethers::types::transaction::eip712::{EIP712Domain, Eip712, Eip712Error};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

pub const FORWARD_REQUEST_TYPE: &str = "ForwardRequest(address to,address from,address authorizer,address nftContract,uint256 nonce,uint256 nftChainId,uint256 nftTokenId,uint256 targetChainId,uint256 value,uint256 gas,bytes data)";

/// Structured payload a forwarding signer signs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRequest {
    pub to: Address,
    pub from: Address,
    /// Address whose NFT ownership or delegation is being proven
    pub authorizer: Address,
    pub nft_contract: Address,
    pub nonce: U256,
    pub nft_chain_id: U256,
    pub nft_token_id: U256,
    pub target_chain_id: U256,
    pub value: U256,
    pub gas: U256,
    pub data: Bytes,
}

impl ForwardRequest {
    /// ABI tuple in schema order
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.to),
            Token::Address(self.from),
            Token::Address(self.authorizer),
            Token::Address(self.nft_contract),
            Token::Uint(self.nonce),
            Token::Uint(self.nft_chain_id),
            Token::Uint(self.nft_token_id),
            Token::Uint(self.target_chain_id),
            Token::Uint(self.value),
            Token::Uint(self.gas),
            Token::Bytes(self.data.to_vec()),
        ])
    }
}

/// EIP-712 domain of a forwarder deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderDomain {
    pub name: String,
    pub version: String,
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl ForwarderDomain {
    pub fn new(name: impl Into<String>, version: impl Into<String>, chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            chain_id,
            verifying_contract,
        }
    }

    pub fn to_eip712(&self) -> EIP712Domain {
        EIP712Domain {
            name: Some(self.name.clone()),
            version: Some(self.version.clone()),
            chain_id: Some(U256::from(self.chain_id)),
            verifying_contract: Some(self.verifying_contract),
            salt: None,
        }
    }
}

/// A forward request bound to the domain it will be verified in
#[derive(Debug, Clone)]
pub struct TypedForwardRequest<'a> {
    pub domain: &'a ForwarderDomain,
    pub request: &'a ForwardRequest,
}

impl<'a> TypedForwardRequest<'a> {
    pub fn new(domain: &'a ForwarderDomain, request: &'a ForwardRequest) -> Self {
        Self { domain, request }
    }
}

impl Eip712 for TypedForwardRequest<'_> {
    type Error = Eip712Error;

    fn domain(&self) -> Result<EIP712Domain, Self::Error> {
        Ok(self.domain.to_eip712())
    }

    fn type_hash() -> Result<[u8; 32], Self::Error> {
        Ok(keccak256(FORWARD_REQUEST_TYPE))
    }

    fn struct_hash(&self) -> Result<[u8; 32], Self::Error> {
        let r = self.request;
        let encoded = abi::encode(&[
            Token::FixedBytes(Self::type_hash()?.to_vec()),
            Token::Address(r.to),
            Token::Address(r.from),
            Token::Address(r.authorizer),
            Token::Address(r.nft_contract),
            Token::Uint(r.nonce),
            Token::Uint(r.nft_chain_id),
            Token::Uint(r.nft_token_id),
            Token::Uint(r.target_chain_id),
            Token::Uint(r.value),
            Token::Uint(r.gas),
            Token::FixedBytes(keccak256(&r.data).to_vec()),
        ]);
        Ok(keccak256(encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (ForwarderDomain, ForwardRequest) {
        let domain = ForwarderDomain::new("Essential Forwarder", "0.0.1", 421613, Address::repeat_byte(0xfa));
        let request = ForwardRequest {
            to: Address::repeat_byte(0x01),
            from: Address::repeat_byte(0x02),
            authorizer: Address::repeat_byte(0x03),
            nft_contract: Address::repeat_byte(0x04),
            nonce: U256::from(5),
            nft_chain_id: U256::one(),
            nft_token_id: U256::from(77),
            target_chain_id: U256::from(421613),
            value: U256::zero(),
            gas: U256::from(1_000_000),
            data: Bytes::from(vec![0xab, 0xcd]),
        };
        (domain, request)
    }

    #[test]
    fn test_digest_is_reproducible() {
        let (domain, request) = sample();
        let a = TypedForwardRequest::new(&domain, &request).encode_eip712().unwrap();
        let b = TypedForwardRequest::new(&domain, &request.clone()).encode_eip712().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_binds_every_field() {
        let (domain, request) = sample();
        let base = TypedForwardRequest::new(&domain, &request).encode_eip712().unwrap();

        let mut swapped = request.clone();
        std::mem::swap(&mut swapped.from, &mut swapped.authorizer);
        let changed = TypedForwardRequest::new(&domain, &swapped).encode_eip712().unwrap();
        assert_ne!(base, changed);

        let mut other_data = request.clone();
        other_data.data = Bytes::from(vec![0xab]);
        let changed = TypedForwardRequest::new(&domain, &other_data).encode_eip712().unwrap();
        assert_ne!(base, changed);

        let other_domain = ForwarderDomain { chain_id: 1, ..domain.clone() };
        let changed = TypedForwardRequest::new(&other_domain, &request).encode_eip712().unwrap();
        assert_ne!(base, changed);
    }

    #[test]
    fn test_relay_json_uses_camel_case() {
        let (_, request) = sample();
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("nftContract").is_some());
        assert!(json.get("targetChainId").is_some());
        assert!(json.get("nft_contract").is_none());
    }
}
