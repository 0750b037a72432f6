//! Call requests, overrides and their separation from positional arguments

use crate::error::{ExecutorError, ExecutorResult};

use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{Function, HumanReadableParser, Token};
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// How a call is signed and submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningMode {
    /// Signed network transaction paid for by the signer
    Native,
    /// Forward request signed here and relayed by a third party
    Meta,
}

impl SigningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningMode::Native => "native",
            SigningMode::Meta => "meta",
        }
    }
}

impl fmt::Display for SigningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// NFT the caller is "using" for authorization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NftAuthorization {
    /// Owner (or delegator) of the NFT, when different from the signer
    pub authorizer: Option<Address>,
    #[serde(default, deserialize_with = "lenient_u256")]
    pub nft_chain_id: Option<U256>,
    #[serde(alias = "nftContractAddress")]
    pub nft_contract: Option<Address>,
    #[serde(default, deserialize_with = "lenient_u256")]
    pub nft_token_id: Option<U256>,
}

impl NftAuthorization {
    /// An NFT is only named when both its contract and token id are given
    pub fn names_nft(&self) -> bool {
        self.nft_contract.is_some() && self.nft_token_id.is_some()
    }

    /// Fill unset fields from `other`
    fn merged_with(self, other: NftAuthorization) -> NftAuthorization {
        NftAuthorization {
            authorizer: self.authorizer.or(other.authorizer),
            nft_chain_id: self.nft_chain_id.or(other.nft_chain_id),
            nft_contract: self.nft_contract.or(other.nft_contract),
            nft_token_id: self.nft_token_id.or(other.nft_token_id),
        }
    }
}

/// Transaction fields that ride along with a call but are not call arguments
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOverrides {
    #[serde(default, deserialize_with = "lenient_u256")]
    pub gas_limit: Option<U256>,
    pub nonce: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u256")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, deserialize_with = "lenient_u256")]
    pub max_priority_fee_per_gas: Option<U256>,
    #[serde(default, deserialize_with = "lenient_u256")]
    pub value: Option<U256>,
    pub custom_data: Option<NftAuthorization>,
}

/// Keys that mark a trailing JSON object as overrides rather than an argument
const OVERRIDE_KEYS: &[&str] = &[
    "gasLimit",
    "gasPrice",
    "maxFeePerGas",
    "maxPriorityFeePerGas",
    "nonce",
    "type",
    "accessList",
    "customData",
    "value",
    "blockTag",
    "from",
];

impl CallOverrides {
    /// Whether a JSON value looks like an overrides object
    pub fn is_overrides(value: &Value) -> bool {
        match value {
            Value::Object(map) => OVERRIDE_KEYS.iter().any(|key| map.contains_key(*key)),
            _ => false,
        }
    }
}

/// One positional argument of a call
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Token(Token),
    Overrides(CallOverrides),
}

impl From<Token> for CallArg {
    fn from(token: Token) -> Self {
        CallArg::Token(token)
    }
}

impl From<CallOverrides> for CallArg {
    fn from(overrides: CallOverrides) -> Self {
        CallArg::Overrides(overrides)
    }
}

/// A contract call as handed to the executor
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub target: Address,
    pub function: Function,
    pub args: Vec<CallArg>,
}

impl CallRequest {
    pub fn new(target: Address, function: Function, args: Vec<CallArg>) -> Self {
        Self {
            target,
            function,
            args,
        }
    }

    /// Build a request from a human readable signature like `transferNFT(uint256)`
    pub fn from_signature(target: Address, signature: &str, args: Vec<CallArg>) -> ExecutorResult<Self> {
        Ok(Self::new(target, parse_function(signature)?, args))
    }

    /// Build a request from JSON arguments
    ///
    /// A trailing object carrying override keys becomes the overrides; every
    /// other value is tokenized against the matching function input.
    pub fn from_json(target: Address, signature: &str, args: &[Value]) -> ExecutorResult<Self> {
        let function = parse_function(signature)?;

        let (positional, trailing) = match args.split_last() {
            Some((last, rest)) if CallOverrides::is_overrides(last) => {
                let overrides: CallOverrides = serde_json::from_value(last.clone())
                    .map_err(|e| ExecutorError::InvalidRequest(format!("Invalid overrides: {}", e)))?;
                (rest, Some(overrides))
            }
            _ => (args, None),
        };

        if positional.len() != function.inputs.len() {
            return Err(ExecutorError::InvalidRequest(format!(
                "{} expects {} arguments, got {}",
                function.name,
                function.inputs.len(),
                positional.len()
            )));
        }

        let mut call_args = Vec::with_capacity(args.len());
        for (param, value) in function.inputs.iter().zip(positional) {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let token = LenientTokenizer::tokenize(&param.kind, &text).map_err(|e| {
                ExecutorError::InvalidRequest(format!("Argument {}: {}", param.name, e))
            })?;
            call_args.push(CallArg::Token(token));
        }
        if let Some(overrides) = trailing {
            call_args.push(CallArg::Overrides(overrides));
        }

        Ok(Self::new(target, function, call_args))
    }

    /// Separate the trailing overrides from the call arguments
    ///
    /// Overrides are only recognised in the last position and are never
    /// encoded into calldata.
    pub fn split_overrides(&self) -> ExecutorResult<(Vec<Token>, CallOverrides)> {
        let mut tokens = Vec::with_capacity(self.args.len());
        let mut overrides = None;

        for (i, arg) in self.args.iter().enumerate() {
            match arg {
                CallArg::Token(token) => tokens.push(token.clone()),
                CallArg::Overrides(o) if i + 1 == self.args.len() => overrides = Some(o.clone()),
                CallArg::Overrides(_) => {
                    return Err(ExecutorError::InvalidRequest(format!(
                        "Overrides must be the last argument of {}",
                        self.function.name
                    )))
                }
            }
        }

        Ok((tokens, overrides.unwrap_or_default()))
    }
}

/// Caller-supplied execution options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    pub mode: SigningMode,
    #[serde(default, deserialize_with = "lenient_u256")]
    pub gas_limit: Option<U256>,
    pub nonce: Option<u64>,
    #[serde(alias = "nftDescriptor")]
    pub nft: Option<NftAuthorization>,
}

impl ExecuteOptions {
    pub fn native() -> Self {
        Self {
            mode: SigningMode::Native,
            gas_limit: None,
            nonce: None,
            nft: None,
        }
    }

    pub fn meta() -> Self {
        Self {
            mode: SigningMode::Meta,
            ..Self::native()
        }
    }

    pub fn with_nft(mut self, nft: NftAuthorization) -> Self {
        self.nft = Some(nft);
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: U256) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }
}

/// A call with overrides separated, calldata encoded and mode checked
///
/// Built before any network I/O so invalid requests fail fast.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub target: Address,
    pub function_name: String,
    pub calldata: Bytes,
    pub value: U256,
    pub mode: SigningMode,
    pub gas_limit: Option<U256>,
    pub nonce: Option<u64>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
    pub nft: Option<NftAuthorization>,
}

impl PreparedCall {
    pub fn prepare(request: &CallRequest, options: &ExecuteOptions) -> ExecutorResult<Self> {
        let (tokens, overrides) = request.split_overrides()?;

        let calldata = request
            .function
            .encode_input(&tokens)
            .map_err(|e| ExecutorError::InvalidRequest(format!("{}: {}", request.function.name, e)))?;

        let value = overrides.value.unwrap_or_default();
        // The relayer cannot be trusted to forward attached value
        if !value.is_zero() && options.mode == SigningMode::Meta {
            return Err(ExecutorError::InvalidRequest(format!(
                "{} attaches value {} and must be sent as a native transaction",
                request.function.name, value
            )));
        }

        let nonce = overrides.nonce.or(options.nonce);
        if nonce == Some(u64::MAX) {
            return Err(ExecutorError::InvalidRequest(format!(
                "{}: nonce {} is outside the valid range",
                request.function.name,
                u64::MAX
            )));
        }
        for (field, fee) in [
            ("maxFeePerGas", overrides.max_fee_per_gas),
            ("maxPriorityFeePerGas", overrides.max_priority_fee_per_gas),
        ] {
            if let Some(fee) = fee.filter(|fee| *fee > max_fee_cap()) {
                return Err(ExecutorError::InvalidRequest(format!(
                    "{}: {} {} exceeds the largest accepted fee cap",
                    request.function.name, field, fee
                )));
            }
        }

        let nft = match (overrides.custom_data, options.nft.clone()) {
            (Some(custom), Some(option)) => Some(custom.merged_with(option)),
            (custom, option) => custom.or(option),
        };
        // A proof reroutes the call through the forwarder callback, which carries no value
        if !value.is_zero() && nft.as_ref().map_or(false, NftAuthorization::names_nft) {
            return Err(ExecutorError::InvalidRequest(format!(
                "{} attaches value {} to an NFT-gated call",
                request.function.name, value
            )));
        }

        Ok(Self {
            target: request.target,
            function_name: request.function.name.clone(),
            calldata: Bytes::from(calldata),
            value,
            mode: options.mode,
            gas_limit: overrides.gas_limit.or(options.gas_limit),
            nonce,
            max_fee_per_gas: overrides.max_fee_per_gas,
            max_priority_fee_per_gas: overrides.max_priority_fee_per_gas,
            nft,
        })
    }

    /// NFT descriptor, if the call names one
    pub fn nft_descriptor(&self) -> Option<&NftAuthorization> {
        self.nft.as_ref().filter(|nft| nft.names_nft())
    }
}

/// Explicit fee caps above 2^128 - 1 wei are rejected outright
fn max_fee_cap() -> U256 {
    U256::from(u128::MAX)
}

fn parse_function(signature: &str) -> ExecutorResult<Function> {
    let signature = signature.trim();
    let signature = if signature.starts_with("function ") {
        signature.to_string()
    } else {
        format!("function {}", signature)
    };

    HumanReadableParser::parse_function(&signature)
        .map_err(|e| ExecutorError::InvalidRequest(format!("Invalid function {}: {}", signature, e)))
}

/// Accept quantities as JSON numbers, decimal strings or 0x-hex strings
fn lenient_u256<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<Value> = Option::deserialize(deserializer)?;
    let parsed = match value {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => match n.as_u64() {
            Some(n) => Some(U256::from(n)),
            None => return Err(serde::de::Error::custom(format!("invalid quantity {}", n))),
        },
        Some(Value::String(s)) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => U256::from_str_radix(hex, 16).ok(),
                None => U256::from_dec_str(&s).ok(),
            };
            match parsed {
                Some(n) => Some(n),
                None => return Err(serde::de::Error::custom(format!("invalid quantity {}", s))),
            }
        }
        Some(other) => {
            return Err(serde::de::Error::custom(format!("invalid quantity {}", other)))
        }
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> Address {
        Address::repeat_byte(0x42)
    }

    #[test]
    fn test_trailing_overrides_are_not_encoded() {
        let request = CallRequest::from_json(
            target(),
            "transferNFT(uint256)",
            &[json!("7"), json!({ "gasLimit": 90000, "nonce": 3 })],
        )
        .unwrap();

        let (tokens, overrides) = request.split_overrides().unwrap();
        assert_eq!(tokens, vec![Token::Uint(U256::from(7))]);
        assert_eq!(overrides.gas_limit, Some(U256::from(90_000)));
        assert_eq!(overrides.nonce, Some(3));

        let prepared = PreparedCall::prepare(&request, &ExecuteOptions::native()).unwrap();
        // selector + one word
        assert_eq!(prepared.calldata.len(), 4 + 32);
    }

    #[test]
    fn test_overrides_only_allowed_last() {
        let request = CallRequest::from_signature(
            target(),
            "setPair(uint256,uint256)",
            vec![
                CallArg::Overrides(CallOverrides::default()),
                Token::Uint(U256::one()).into(),
            ],
        )
        .unwrap();

        assert!(matches!(
            request.split_overrides(),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_meta_with_value_rejected() {
        let overrides = CallOverrides {
            value: Some(U256::from(1)),
            ..Default::default()
        };
        let request = CallRequest::from_signature(
            target(),
            "deposit()",
            vec![overrides.into()],
        )
        .unwrap();

        assert!(matches!(
            PreparedCall::prepare(&request, &ExecuteOptions::meta()),
            Err(ExecutorError::InvalidRequest(_))
        ));
        assert!(PreparedCall::prepare(&request, &ExecuteOptions::native()).is_ok());
    }

    #[test]
    fn test_unusable_nonce_rejected() {
        let request = CallRequest::from_json(
            target(),
            "transferNFT(uint256)",
            &[json!("1"), json!({ "nonce": u64::MAX })],
        )
        .unwrap();

        assert!(matches!(
            PreparedCall::prepare(&request, &ExecuteOptions::native()),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_absurd_fee_cap_rejected() {
        let max = format!("{:#x}", U256::MAX);
        for overrides in [
            json!({ "maxFeePerGas": max }),
            json!({ "maxPriorityFeePerGas": max }),
        ] {
            let request =
                CallRequest::from_json(target(), "transferNFT(uint256)", &[json!("1"), overrides]).unwrap();
            assert!(matches!(
                PreparedCall::prepare(&request, &ExecuteOptions::native()),
                Err(ExecutorError::InvalidRequest(_))
            ));
        }

        let request = CallRequest::from_json(
            target(),
            "transferNFT(uint256)",
            &[json!("1"), json!({ "maxFeePerGas": format!("{:#x}", u128::MAX) })],
        )
        .unwrap();
        assert!(PreparedCall::prepare(&request, &ExecuteOptions::native()).is_ok());
    }

    #[test]
    fn test_nft_gated_call_with_value_rejected() {
        let overrides = CallOverrides {
            value: Some(U256::from(1)),
            ..Default::default()
        };
        let request = CallRequest::from_signature(target(), "deposit()", vec![overrides.into()]).unwrap();
        let options = ExecuteOptions::native().with_nft(NftAuthorization {
            nft_contract: Some(Address::repeat_byte(0x0c)),
            nft_token_id: Some(U256::from(7)),
            ..Default::default()
        });

        assert!(matches!(
            PreparedCall::prepare(&request, &options),
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_custom_data_merges_with_options() {
        let owner = Address::repeat_byte(0x0a);
        let request = CallRequest::from_json(
            target(),
            "transferNFT(uint256)",
            &[
                json!("1"),
                json!({ "customData": { "authorizer": format!("{:?}", owner) } }),
            ],
        )
        .unwrap();
        let options = ExecuteOptions::native().with_nft(NftAuthorization {
            authorizer: None,
            nft_chain_id: Some(U256::one()),
            nft_contract: Some(Address::repeat_byte(0x0c)),
            nft_token_id: Some(U256::from(99)),
        });

        let prepared = PreparedCall::prepare(&request, &options).unwrap();
        let nft = prepared.nft_descriptor().unwrap();
        assert_eq!(nft.authorizer, Some(owner));
        assert_eq!(nft.nft_token_id, Some(U256::from(99)));
    }

    #[test]
    fn test_argument_count_checked() {
        let err = CallRequest::from_json(target(), "transferNFT(uint256)", &[]).unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
    }

    #[test]
    fn test_lenient_quantities() {
        let overrides: CallOverrides = serde_json::from_value(json!({
            "gasLimit": "0x5208",
            "maxFeePerGas": "1000",
            "value": 5
        }))
        .unwrap();
        assert_eq!(overrides.gas_limit, Some(U256::from(21_000)));
        assert_eq!(overrides.max_fee_per_gas, Some(U256::from(1_000)));
        assert_eq!(overrides.value, Some(U256::from(5)));
    }
}
