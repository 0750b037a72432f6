//! Session signers
//!
//! One signer is active per session, either a connected external wallet or a
//! burner key the application holds. The forwarding signer built on top of
//! it only ever signs forward requests.

use crate::error::{ExecutorError, ExecutorResult};
use crate::tx::{ForwardRequest, ForwarderDomain, TypedForwardRequest};

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Signature, H256};
use std::sync::Arc;
use tracing::debug;

/// Handle to an externally controlled wallet
///
/// Implementations may prompt the user, and may refuse to sign a transaction
/// without also broadcasting it.
#[async_trait]
pub trait ConnectedWallet: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_forward_request(&self, payload: &TypedForwardRequest<'_>) -> ExecutorResult<Signature>;

    /// Sign without broadcasting; `SigningUnsupported` if the wallet cannot
    async fn sign_transaction(&self, tx: &TypedTransaction) -> ExecutorResult<Signature>;

    /// Sign and broadcast in one step
    async fn send_transaction(&self, tx: TypedTransaction) -> ExecutorResult<H256>;
}

/// A local key wrapped in ethers' signing middleware behaves like a wallet
/// that broadcasts its own transactions
#[async_trait]
impl ConnectedWallet for SignerMiddleware<Provider<Http>, LocalWallet> {
    fn address(&self) -> Address {
        self.signer().address()
    }

    async fn sign_forward_request(&self, payload: &TypedForwardRequest<'_>) -> ExecutorResult<Signature> {
        self.signer()
            .sign_typed_data(payload)
            .await
            .map_err(|e| ExecutorError::Wallet(e.to_string()))
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> ExecutorResult<Signature> {
        self.signer()
            .sign_transaction(tx)
            .await
            .map_err(|e| ExecutorError::Wallet(e.to_string()))
    }

    async fn send_transaction(&self, tx: TypedTransaction) -> ExecutorResult<H256> {
        let pending = Middleware::send_transaction(self, tx, None)
            .await
            .map_err(|e| ExecutorError::from_submission(e.to_string()))?;
        Ok(pending.tx_hash())
    }
}

/// The session's active signer
#[derive(Clone)]
pub enum SessionSigner {
    /// Connected external wallet
    Wallet(Arc<dyn ConnectedWallet>),
    /// Application-held key, used without prompting
    Burner(LocalWallet),
}

impl SessionSigner {
    pub fn address(&self) -> Address {
        match self {
            SessionSigner::Wallet(wallet) => wallet.address(),
            SessionSigner::Burner(wallet) => wallet.address(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionSigner::Wallet(_) => "wallet",
            SessionSigner::Burner(_) => "burner",
        }
    }

    /// Sign a native transaction and return its raw RLP encoding
    pub async fn sign_raw_transaction(&self, tx: &TypedTransaction) -> ExecutorResult<Bytes> {
        let signature = match self {
            SessionSigner::Wallet(wallet) => wallet.sign_transaction(tx).await?,
            SessionSigner::Burner(wallet) => wallet
                .sign_transaction(tx)
                .await
                .map_err(|e| ExecutorError::Wallet(e.to_string()))?,
        };
        Ok(tx.rlp_signed(&signature))
    }

    /// Hand the transaction to the signer to sign and broadcast
    pub async fn send_transaction(&self, tx: TypedTransaction) -> ExecutorResult<H256> {
        match self {
            SessionSigner::Wallet(wallet) => wallet.send_transaction(tx).await,
            // A burner has no broadcast channel of its own
            SessionSigner::Burner(_) => Err(ExecutorError::signing_unsupported("send_transaction")),
        }
    }

    async fn sign_forward_request(&self, payload: &TypedForwardRequest<'_>) -> ExecutorResult<Signature> {
        match self {
            SessionSigner::Wallet(wallet) => wallet.sign_forward_request(payload).await,
            SessionSigner::Burner(wallet) => wallet
                .sign_typed_data(payload)
                .await
                .map_err(|e| ExecutorError::Wallet(e.to_string())),
        }
    }
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("kind", &self.kind())
            .field("address", &self.address())
            .finish()
    }
}

/// Signer restricted to the forwarding protocol
///
/// Direct message or transaction signing always fails so that no caller can
/// obtain a signature over a payload the forwarder does not protect.
#[derive(Debug, Clone)]
pub struct RequestSigner {
    signer: SessionSigner,
    domain: ForwarderDomain,
}

impl RequestSigner {
    pub fn new(signer: SessionSigner, domain: ForwarderDomain) -> Self {
        Self { signer, domain }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn domain(&self) -> &ForwarderDomain {
        &self.domain
    }

    /// Sign a forward request under the forwarder's EIP-712 domain
    pub async fn sign(&self, request: &ForwardRequest) -> ExecutorResult<Bytes> {
        if request.from != self.address() {
            return Err(ExecutorError::InvalidRequest(format!(
                "Forward request from {:?} cannot be signed by {:?}",
                request.from,
                self.address()
            )));
        }

        let payload = TypedForwardRequest::new(&self.domain, request);
        let signature = self.signer.sign_forward_request(&payload).await?;
        debug!(
            "Signed forward request nonce {} with {} signer",
            request.nonce,
            self.signer.kind()
        );
        Ok(Bytes::from(signature.to_vec()))
    }

    pub async fn sign_message(&self, _message: &[u8]) -> ExecutorResult<Bytes> {
        Err(ExecutorError::signing_unsupported(
            "sign_message: forwarding signer cannot sign messages",
        ))
    }

    pub async fn sign_transaction(&self, _tx: &TypedTransaction) -> ExecutorResult<Bytes> {
        Err(ExecutorError::signing_unsupported(
            "sign_transaction: forwarding signer cannot sign transactions directly, use contract calls instead",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::transaction::eip712::Eip712;
    use ethers::types::{Eip1559TransactionRequest, U256};

    const BURNER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn burner() -> LocalWallet {
        BURNER_KEY.parse::<LocalWallet>().unwrap().with_chain_id(31337u64)
    }

    fn request_signer() -> RequestSigner {
        let domain = ForwarderDomain::new("Essential Forwarder", "0.0.1", 31337, Address::repeat_byte(0xfa));
        RequestSigner::new(SessionSigner::Burner(burner()), domain)
    }

    #[tokio::test]
    async fn test_forward_signature_recovers_to_signer() {
        let signer = request_signer();
        let request = ForwardRequest {
            from: signer.address(),
            to: Address::repeat_byte(0x01),
            nonce: U256::from(3),
            ..Default::default()
        };

        let raw = signer.sign(&request).await.unwrap();
        let signature = Signature::try_from(raw.as_ref()).unwrap();
        let digest = TypedForwardRequest::new(signer.domain(), &request)
            .encode_eip712()
            .unwrap();
        assert_eq!(signature.recover(H256::from(digest)).unwrap(), signer.address());
    }

    #[tokio::test]
    async fn test_refuses_foreign_from() {
        let signer = request_signer();
        let request = ForwardRequest {
            from: Address::repeat_byte(0x09),
            ..Default::default()
        };
        assert!(matches!(
            signer.sign(&request).await,
            Err(ExecutorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_direct_signing_always_fails() {
        let signer = request_signer();
        let tx: TypedTransaction = Eip1559TransactionRequest::new().into();

        assert!(signer.sign_message(b"hello").await.unwrap_err().is_signing_unsupported());
        assert!(signer.sign_transaction(&tx).await.unwrap_err().is_signing_unsupported());
    }

    #[tokio::test]
    async fn test_burner_cannot_broadcast() {
        let signer = SessionSigner::Burner(burner());
        let tx: TypedTransaction = Eip1559TransactionRequest::new().into();
        assert!(signer.send_transaction(tx).await.unwrap_err().is_signing_unsupported());
    }
}
