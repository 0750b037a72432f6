//! Transaction executor with mode selection, proof resolution and collision retry
//!
//! One executor owns the nonce and fee state for one (signer, chain) pair.
//! Executions are serialized behind a mutex held from fee resolution until
//! submission, so concurrent callers queue instead of interleaving nonces.

use super::forward::ForwardRequest;
use super::gas::{FeeConfig, FeeEstimator};
use super::nonce::NonceTracker;
use super::request::{CallRequest, ExecuteOptions, PreparedCall, SigningMode};
use crate::chain::{ForwarderContract, NetworkRpc};
use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::proof::{Attester, ProofResolution, ProofResolver};
use crate::relay::RelayClient;
use crate::signer::{RequestSigner, SessionSigner};

use chrono::{DateTime, Utc};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Eip1559TransactionRequest, TransactionReceipt, H256, U256};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Where an execution is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Idle,
    FeesResolved,
    RequestPopulated,
    ProofResolved,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

impl ExecutionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStage::Idle => "idle",
            ExecutionStage::FeesResolved => "fees_resolved",
            ExecutionStage::RequestPopulated => "request_populated",
            ExecutionStage::ProofResolved => "proof_resolved",
            ExecutionStage::Signed => "signed",
            ExecutionStage::Submitted => "submitted",
            ExecutionStage::Confirmed => "confirmed",
            ExecutionStage::Failed => "failed",
        }
    }

    fn advance(&mut self, next: ExecutionStage) {
        debug!("{} -> {}", self.as_str(), next.as_str());
        *self = next;
    }
}

impl fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunables for fee bumping, retries and confirmation
#[derive(Debug, Clone)]
pub struct ExecutorPolicy {
    /// Multiplier applied to the baseline tip on a first attempt
    pub priority_fee_multiplier: f64,
    /// Factor the multiplier grows by on each collision retry
    pub fee_bump: f64,
    /// Retries allowed after a nonce collision
    pub collision_retries: u32,
    /// How long computed fees are reused
    pub fee_ttl: Duration,
    /// Gas placed in preflight forward requests
    pub preflight_gas: u64,
    pub confirmation_poll: Duration,
    pub confirmation_timeout: Duration,
}

impl ExecutorPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            priority_fee_multiplier: config.priority_fee_multiplier,
            fee_bump: config.fee_bump,
            collision_retries: config.collision_retries,
            fee_ttl: config.fee_ttl(),
            preflight_gas: config.preflight_gas,
            confirmation_poll: config.confirmation_poll(),
            confirmation_timeout: config.confirmation_timeout(),
        }
    }
}

impl Default for ExecutorPolicy {
    fn default() -> Self {
        Self {
            priority_fee_multiplier: 1.0,
            fee_bump: 1.1,
            collision_retries: 1,
            fee_ttl: Duration::from_secs(12),
            preflight_gas: 1_000_000,
            confirmation_poll: Duration::from_secs(1),
            confirmation_timeout: Duration::from_secs(120),
        }
    }
}

/// Mutable state guarded by the execution lock
struct ExecutorState {
    /// Account nonce of the native signer
    native_nonce: NonceTracker,
    /// Forwarder nonce of the request signer
    forward_nonce: NonceTracker,
    /// Last computed native fees
    fees: Option<FeeConfig>,
}

/// Copy of the guarded state readable without waiting on an execution
#[derive(Debug, Clone)]
struct StateSnapshot {
    next_native_nonce: Option<u64>,
    next_forward_nonce: Option<u64>,
    fees: Option<FeeConfig>,
}

impl ExecutorState {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            next_native_nonce: self.native_nonce.peek().ok(),
            next_forward_nonce: self.forward_nonce.peek().ok(),
            fees: self.fees.clone(),
        }
    }
}

/// Deferred handle that resolves once the network includes a transaction
pub struct Confirmation {
    hash: H256,
    rpc: Arc<dyn NetworkRpc>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Confirmation {
    pub fn hash(&self) -> H256 {
        self.hash
    }

    /// Poll for the receipt until it appears or the timeout elapses
    pub async fn wait(self) -> ExecutorResult<TransactionReceipt> {
        let hash = self.hash;
        let poll = async {
            loop {
                if let Some(receipt) = self.rpc.transaction_receipt(hash).await? {
                    if receipt.status == Some(0u64.into()) {
                        return Err(ExecutorError::Reverted {
                            tx_hash: format!("{:?}", hash),
                        });
                    }
                    return Ok(receipt);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(self.timeout, poll)
            .await
            .map_err(|_| ExecutorError::Timeout {
                operation: format!("confirmation of {:?}", hash),
            })?
    }
}

impl fmt::Debug for Confirmation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Confirmation")
            .field("hash", &self.hash)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Result of a successful `execute()`
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub hash: H256,
    pub mode: SigningMode,
    /// Account nonce (native) or forwarder nonce (meta) the submission used
    pub nonce: u64,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub confirmation: Confirmation,
}

/// Point-in-time view of the executor, for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorStatus {
    pub chain_id: u64,
    pub native_signer: Address,
    pub native_signer_kind: &'static str,
    pub request_signer: Address,
    pub forwarder: Address,
    pub relayer_uri: Option<String>,
    pub next_native_nonce: Option<u64>,
    pub next_forward_nonce: Option<u64>,
    pub fees: Option<FeeConfig>,
}

struct Submission {
    hash: H256,
    nonce: u64,
}

/// Executes contract calls natively or through the relayer
pub struct TransactionExecutor {
    /// Network capability
    rpc: Arc<dyn NetworkRpc>,
    /// Signer for native transactions
    native: SessionSigner,
    /// Forwarding-only signer for meta-transactions
    request_signer: RequestSigner,
    forwarder: ForwarderContract,
    resolver: ProofResolver,
    relay: Option<RelayClient>,
    fee_estimator: FeeEstimator,
    policy: ExecutorPolicy,
    state: Mutex<ExecutorState>,
    /// Published after every attempt so status reads never queue behind `state`
    snapshot: watch::Sender<StateSnapshot>,
}

impl TransactionExecutor {
    /// Create an executor and seed both nonce trackers
    ///
    /// A failed seed does not fail construction; the affected mode rejects
    /// every call with a configuration error instead.
    pub async fn connect(
        rpc: Arc<dyn NetworkRpc>,
        native: SessionSigner,
        request_signer: RequestSigner,
        policy: ExecutorPolicy,
    ) -> Self {
        let forwarder = ForwarderContract::new(request_signer.domain().verifying_contract, rpc.clone());

        let native_nonce = NonceTracker::seed(rpc.as_ref(), native.address()).await;
        let forward_nonce = NonceTracker::seed_from_forwarder(&forwarder, request_signer.address()).await;

        let state = ExecutorState {
            native_nonce,
            forward_nonce,
            fees: None,
        };

        info!(
            "Executor ready on chain {}: native {} signer {:?}, request signer {:?}, forwarder {:?}",
            rpc.chain_id(),
            native.kind(),
            native.address(),
            request_signer.address(),
            forwarder.address()
        );

        Self {
            resolver: ProofResolver::new(forwarder.clone(), None),
            rpc,
            native,
            request_signer,
            forwarder,
            relay: None,
            fee_estimator: FeeEstimator::new(),
            policy,
            snapshot: watch::channel(state.snapshot()).0,
            state: Mutex::new(state),
        }
    }

    pub fn with_relay(mut self, relay: RelayClient) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_attester(mut self, attester: Arc<dyn Attester>) -> Self {
        self.resolver = ProofResolver::new(self.forwarder.clone(), Some(attester));
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.rpc.chain_id()
    }

    pub fn policy(&self) -> &ExecutorPolicy {
        &self.policy
    }

    /// Run `request` to submission
    pub async fn execute(&self, request: &CallRequest, options: &ExecuteOptions) -> ExecutorResult<ExecutionOutcome> {
        let execution_id = Uuid::new_v4();
        let span = info_span!(
            "execute",
            %execution_id,
            function = %request.function.name,
            mode = %options.mode
        );

        self.execute_inner(execution_id, request, options)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        execution_id: Uuid,
        request: &CallRequest,
        options: &ExecuteOptions,
    ) -> ExecutorResult<ExecutionOutcome> {
        let started = Instant::now();
        let mode = options.mode;

        // Validation happens before the lock and before any network I/O
        let call = match PreparedCall::prepare(request, options) {
            Ok(call) => call,
            Err(e) => {
                error!("Rejected {}: {}", request.function.name, e);
                crate::metrics::record_tx_failed(mode.as_str(), ExecutionStage::Idle.as_str(), e.kind());
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        if let Err(e) = check_explicit_nonce(&state, &call) {
            error!("Rejected {}: {}", call.function_name, e);
            crate::metrics::record_tx_failed(mode.as_str(), ExecutionStage::Idle.as_str(), e.kind());
            return Err(e);
        }

        let mut multiplier = self.policy.priority_fee_multiplier;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut stage = ExecutionStage::Idle;

            let result = match call.mode {
                SigningMode::Native => {
                    self.attempt_native(&mut state, &call, multiplier, attempts == 1, &mut stage)
                        .await
                }
                SigningMode::Meta => self.attempt_meta(&mut state, &call, attempts == 1, &mut stage).await,
            };
            self.snapshot.send_replace(state.snapshot());

            match result {
                Ok(submission) => {
                    let latency = started.elapsed().as_secs_f64();
                    info!(
                        "Submitted {} as {:?} (nonce {}, attempt {})",
                        call.function_name, submission.hash, submission.nonce, attempts
                    );
                    crate::metrics::record_tx_submitted(mode.as_str());
                    crate::metrics::record_tx_latency(mode.as_str(), latency);

                    return Ok(ExecutionOutcome {
                        execution_id,
                        hash: submission.hash,
                        mode,
                        nonce: submission.nonce,
                        attempts,
                        submitted_at: Utc::now(),
                        confirmation: Confirmation {
                            hash: submission.hash,
                            rpc: self.rpc.clone(),
                            poll_interval: self.policy.confirmation_poll,
                            timeout: self.policy.confirmation_timeout,
                        },
                    });
                }
                Err(e) if e.is_nonce_collision() && attempts <= self.policy.collision_retries => {
                    multiplier *= self.policy.fee_bump;
                    warn!(
                        "Nonce collision on attempt {} of {}: {}; retrying with fee multiplier {:.3}",
                        attempts, call.function_name, e, multiplier
                    );
                    crate::metrics::record_collision_retry(mode.as_str());
                }
                Err(e) => {
                    let failed_at = stage;
                    stage.advance(ExecutionStage::Failed);
                    crate::metrics::record_tx_failed(mode.as_str(), failed_at.as_str(), e.kind());

                    let e = if e.is_nonce_collision() {
                        ExecutorError::RetriesExhausted {
                            function: call.function_name.clone(),
                            attempts,
                            reason: e.to_string(),
                        }
                    } else {
                        e
                    };
                    error!("{} failed at {}: {}", call.function_name, failed_at, e);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt_native(
        &self,
        state: &mut ExecutorState,
        call: &PreparedCall,
        multiplier: f64,
        first_attempt: bool,
        stage: &mut ExecutionStage,
    ) -> ExecutorResult<Submission> {
        // Fully overridden fees need no base fee read
        let fees = match (call.max_fee_per_gas, call.max_priority_fee_per_gas) {
            (Some(_), Some(_)) => None,
            _ => Some(self.resolve_fees(state, multiplier).await?),
        };
        let bump = multiplier / self.policy.priority_fee_multiplier;
        let max_fee_per_gas = fee_field(call.max_fee_per_gas, fees.as_ref().map(|f| f.max_fee_per_gas), bump)?;
        let max_priority_fee_per_gas = fee_field(
            call.max_priority_fee_per_gas,
            fees.as_ref().map(|f| f.max_priority_fee_per_gas),
            bump,
        )?;
        stage.advance(ExecutionStage::FeesResolved);

        let chain_id = self.rpc.chain_id();
        let from = self.native.address();
        let nft = call.nft_descriptor().cloned();

        let mut tx = Eip1559TransactionRequest::new()
            .from(from)
            .to(call.target)
            .data(call.calldata.clone())
            .value(call.value)
            .chain_id(chain_id)
            .max_fee_per_gas(max_fee_per_gas)
            .max_priority_fee_per_gas(max_priority_fee_per_gas);

        // NFT-gated calls are estimated once the proof has reshaped them
        if nft.is_none() {
            let gas = self.gas_for(call, tx.clone()).await?;
            tx = tx.gas(gas);
        }

        let nonce = self.reserve_nonce(&mut state.native_nonce, call, first_attempt)?;
        crate::metrics::record_next_nonce("native", nonce + 1);
        tx = tx.nonce(nonce);
        stage.advance(ExecutionStage::RequestPopulated);

        if let Some(nft) = nft {
            let preflight = ForwardRequest {
                to: call.target,
                from,
                authorizer: nft.authorizer.unwrap_or(from),
                nft_contract: nft.nft_contract.unwrap_or_default(),
                nonce: U256::from(nonce),
                nft_chain_id: nft.nft_chain_id.unwrap_or_else(|| U256::from(chain_id)),
                nft_token_id: nft.nft_token_id.unwrap_or_default(),
                target_chain_id: U256::from(chain_id),
                value: U256::zero(),
                gas: U256::from(self.policy.preflight_gas),
                data: call.calldata.clone(),
            };

            if let ProofResolution::Resolved(proof) = self.resolver.resolve(&preflight).await? {
                debug!("Submitting through forwarder callback for {:?}", proof.authorizer());
                tx = tx
                    .to(self.forwarder.address())
                    .data(proof.calldata)
                    .value(U256::zero());
            }
            let gas = self.gas_for(call, tx.clone()).await?;
            tx = tx.gas(gas);
            stage.advance(ExecutionStage::ProofResolved);
        }

        let tx: TypedTransaction = tx.into();
        let hash = match self.native.sign_raw_transaction(&tx).await {
            Ok(raw) => {
                stage.advance(ExecutionStage::Signed);
                self.rpc.send_raw_transaction(raw).await?
            }
            Err(e) if e.is_signing_unsupported() => {
                warn!("{} signer cannot sign without sending, falling back to send_transaction", self.native.kind());
                stage.advance(ExecutionStage::Signed);
                self.native.send_transaction(tx).await?
            }
            Err(e) => return Err(e),
        };
        stage.advance(ExecutionStage::Submitted);

        Ok(Submission { hash, nonce })
    }

    async fn attempt_meta(
        &self,
        state: &mut ExecutorState,
        call: &PreparedCall,
        first_attempt: bool,
        stage: &mut ExecutionStage,
    ) -> ExecutorResult<Submission> {
        let relay = self.relay.as_ref().ok_or_else(|| {
            ExecutorError::Config("No relayer URI configured for meta-transactions".to_string())
        })?;
        // The relayer pays gas, there are no local fees to resolve
        stage.advance(ExecutionStage::FeesResolved);

        let chain_id = self.rpc.chain_id();
        let from = self.request_signer.address();
        let skeleton = Eip1559TransactionRequest::new()
            .from(from)
            .to(call.target)
            .data(call.calldata.clone())
            .chain_id(chain_id);
        let gas = self.gas_for(call, skeleton).await?;

        let nonce = self.reserve_nonce(&mut state.forward_nonce, call, first_attempt)?;
        crate::metrics::record_next_nonce("forwarder", nonce + 1);

        let nft = call.nft_descriptor().cloned().unwrap_or_default();
        let named = nft.names_nft();
        let request = ForwardRequest {
            to: call.target,
            from,
            authorizer: nft.authorizer.unwrap_or_else(|| self.native.address()),
            nft_contract: nft.nft_contract.unwrap_or_default(),
            nonce: U256::from(nonce),
            nft_chain_id: match nft.nft_chain_id {
                Some(id) => id,
                None if named => U256::from(chain_id),
                None => U256::zero(),
            },
            nft_token_id: nft.nft_token_id.unwrap_or_default(),
            target_chain_id: U256::from(chain_id),
            value: U256::zero(),
            gas,
            data: call.calldata.clone(),
        };
        stage.advance(ExecutionStage::RequestPopulated);

        let signature = self.request_signer.sign(&request).await?;
        stage.advance(ExecutionStage::Signed);

        let hash = relay.relay(&request, &signature).await?;
        stage.advance(ExecutionStage::Submitted);

        Ok(Submission { hash, nonce })
    }

    async fn resolve_fees(&self, state: &mut ExecutorState, multiplier: f64) -> ExecutorResult<FeeConfig> {
        if let Some(fees) = state
            .fees
            .as_ref()
            .filter(|fees| fees.is_fresh(multiplier, self.policy.fee_ttl))
        {
            return Ok(fees.clone());
        }

        let fees = self
            .fee_estimator
            .current_fees(self.rpc.as_ref(), multiplier)
            .await?;
        state.fees = Some(fees.clone());
        Ok(fees)
    }

    async fn gas_for(&self, call: &PreparedCall, tx: Eip1559TransactionRequest) -> ExecutorResult<U256> {
        match call.gas_limit {
            Some(gas) => Ok(gas),
            None => self.rpc.estimate_gas(&tx.into()).await,
        }
    }

    /// An explicit nonce only applies to the first attempt; retries take the next one
    fn reserve_nonce(&self, tracker: &mut NonceTracker, call: &PreparedCall, first_attempt: bool) -> ExecutorResult<u64> {
        match call.nonce {
            Some(nonce) if first_attempt => tracker.reserve(nonce),
            _ => tracker.next(),
        }
    }

    /// Status as of the last finished attempt; never waits on a running execution
    pub fn status(&self) -> ExecutorStatus {
        let state = self.snapshot.borrow().clone();
        ExecutorStatus {
            chain_id: self.rpc.chain_id(),
            native_signer: self.native.address(),
            native_signer_kind: self.native.kind(),
            request_signer: self.request_signer.address(),
            forwarder: self.forwarder.address(),
            relayer_uri: self.relay.as_ref().map(|r| r.relayer_uri().to_string()),
            next_native_nonce: state.next_native_nonce,
            next_forward_nonce: state.next_forward_nonce,
            fees: state.fees,
        }
    }
}

/// Reject an explicit nonce the tracker has already handed out, before any fee read
fn check_explicit_nonce(state: &ExecutorState, call: &PreparedCall) -> ExecutorResult<()> {
    let Some(nonce) = call.nonce else {
        return Ok(());
    };
    let tracker = match call.mode {
        SigningMode::Native => &state.native_nonce,
        SigningMode::Meta => &state.forward_nonce,
    };
    let next = tracker.peek()?;
    if nonce < next {
        return Err(ExecutorError::InvalidRequest(format!(
            "Nonce {} already used (next is {})",
            nonce, next
        )));
    }
    Ok(())
}

/// Explicit fee fields win, scaled by the retry bump so a replacement still outbids
fn fee_field(explicit: Option<U256>, computed: Option<U256>, bump: f64) -> ExecutorResult<U256> {
    match explicit {
        Some(fee) if bump > 1.0 => fee
            .checked_mul(U256::from((bump * 1000.0).round() as u64))
            .map(|scaled| scaled / 1000)
            .ok_or_else(|| ExecutorError::InvalidRequest(format!("Fee cap {} cannot be bumped", fee))),
        Some(fee) => Ok(fee),
        None => Ok(computed.unwrap_or_default()),
    }
}
