//! EIP-3668 `OffchainLookup` reverts and the ownership challenge they carry

use crate::error::{ExecutorError, ExecutorResult};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

pub const OFFCHAIN_LOOKUP: &str = "OffchainLookup(address,string[],bytes,bytes4,bytes)";

/// Answer to a preflight call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preflight {
    /// Caller already satisfies onchain authorization
    Authorized,
    /// Contract asked for offchain data before it will accept the call
    NeedsProof(OffchainLookup),
}

/// Decoded `OffchainLookup` revert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffchainLookup {
    pub sender: Address,
    pub urls: Vec<String>,
    pub call_data: Bytes,
    pub callback_function: [u8; 4],
    pub extra_data: Bytes,
}

impl OffchainLookup {
    pub fn selector() -> [u8; 4] {
        id(OFFCHAIN_LOOKUP)
    }

    /// Decode revert data, `None` if it is any other revert
    pub fn decode_revert(data: &[u8]) -> Option<Self> {
        if data.len() < 4 || data[..4] != Self::selector() {
            return None;
        }

        let tokens = abi::decode(
            &[
                ParamType::Address,
                ParamType::Array(Box::new(ParamType::String)),
                ParamType::Bytes,
                ParamType::FixedBytes(4),
                ParamType::Bytes,
            ],
            &data[4..],
        )
        .ok()?;

        let mut tokens = tokens.into_iter();
        let sender = tokens.next()?.into_address()?;
        let urls = tokens
            .next()?
            .into_array()?
            .into_iter()
            .map(Token::into_string)
            .collect::<Option<Vec<_>>>()?;
        let call_data = Bytes::from(tokens.next()?.into_bytes()?);
        let callback = tokens.next()?.into_fixed_bytes()?;
        let extra_data = Bytes::from(tokens.next()?.into_bytes()?);

        Some(Self {
            sender,
            urls,
            call_data,
            callback_function: callback.try_into().ok()?,
            extra_data,
        })
    }

    /// Encode as the revert data a contract would return
    pub fn encode_revert(&self) -> Bytes {
        let mut data = Self::selector().to_vec();
        data.extend(abi::encode(&[
            Token::Address(self.sender),
            Token::Array(self.urls.iter().cloned().map(Token::String).collect()),
            Token::Bytes(self.call_data.to_vec()),
            Token::FixedBytes(self.callback_function.to_vec()),
            Token::Bytes(self.extra_data.to_vec()),
        ]));
        Bytes::from(data)
    }
}

/// Ownership claim the forwarder wants attested
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnershipChallenge {
    pub from: Address,
    pub authorizer: Address,
    pub nonce: U256,
    pub nft_chain_id: U256,
    pub nft_contract: Address,
    pub nft_token_id: U256,
    pub target_chain_id: U256,
    pub timestamp: U256,
}

impl OwnershipChallenge {
    fn param_types() -> [ParamType; 8] {
        [
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
        ]
    }

    /// Decode the `callData` of an `OffchainLookup`
    pub fn decode(call_data: &[u8]) -> ExecutorResult<Self> {
        let tokens = abi::decode(&Self::param_types(), call_data)?;
        let malformed = || ExecutorError::Encoding("Malformed ownership challenge".to_string());
        let address = |i: usize| {
            tokens
                .get(i)
                .cloned()
                .and_then(Token::into_address)
                .ok_or_else(malformed)
        };
        let uint = |i: usize| tokens.get(i).cloned().and_then(Token::into_uint).ok_or_else(malformed);

        Ok(Self {
            from: address(0)?,
            authorizer: address(1)?,
            nonce: uint(2)?,
            nft_chain_id: uint(3)?,
            nft_contract: address(4)?,
            nft_token_id: uint(5)?,
            target_chain_id: uint(6)?,
            timestamp: uint(7)?,
        })
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(abi::encode(&[
            Token::Address(self.from),
            Token::Address(self.authorizer),
            Token::Uint(self.nonce),
            Token::Uint(self.nft_chain_id),
            Token::Address(self.nft_contract),
            Token::Uint(self.nft_token_id),
            Token::Uint(self.target_chain_id),
            Token::Uint(self.timestamp),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_lookup_revert() {
        let lookup = OffchainLookup {
            sender: Address::repeat_byte(0xfa),
            urls: vec!["https://gateway.example/{sender}".to_string()],
            call_data: Bytes::from(vec![1, 2, 3]),
            callback_function: [0x11, 0x22, 0x33, 0x44],
            extra_data: Bytes::from(vec![4, 5]),
        };

        let decoded = OffchainLookup::decode_revert(&lookup.encode_revert()).unwrap();
        assert_eq!(decoded, lookup);
    }

    #[test]
    fn test_other_reverts_are_not_lookups() {
        // Error(string) selector
        let mut data = vec![0x08, 0xc3, 0x79, 0xa0];
        data.extend(abi::encode(&[Token::String("not owner".to_string())]));
        assert!(OffchainLookup::decode_revert(&data).is_none());
        assert!(OffchainLookup::decode_revert(&[]).is_none());
    }

    #[test]
    fn test_challenge_field_order() {
        let challenge = OwnershipChallenge {
            from: Address::repeat_byte(0x01),
            authorizer: Address::repeat_byte(0x02),
            nonce: U256::from(3),
            nft_chain_id: U256::from(1),
            nft_contract: Address::repeat_byte(0x05),
            nft_token_id: U256::from(6),
            target_chain_id: U256::from(421613),
            timestamp: U256::from(1_700_000_000u64),
        };

        let decoded = OwnershipChallenge::decode(&challenge.encode()).unwrap();
        assert_eq!(decoded, challenge);
    }

    #[test]
    fn test_truncated_challenge_rejected() {
        assert!(OwnershipChallenge::decode(&[0u8; 64]).is_err());
    }
}
