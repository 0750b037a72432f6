//! HTTP API for health checks, status, and call execution

use crate::config::ApiConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::tx::{CallRequest, ExecuteOptions, ExecutionStage, TransactionExecutor};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub executor: Arc<TransactionExecutor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(executor: Arc<TransactionExecutor>) -> Self {
        Self {
            executor,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/execute", post(execute))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, executor: Arc<TransactionExecutor>) -> ExecutorResult<()> {
    let app = router(AppState::new(executor));

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ExecutorError::Config(format!("Failed to bind API server on {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| ExecutorError::Network(format!("API server stopped: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let executor = state.executor.status();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        executor: serde_json::to_value(executor).unwrap_or(Value::Null),
    })
}

/// Execute a call and return once it is submitted
///
/// Confirmation is awaited in the background and only shows up in metrics
/// and logs.
async fn execute(State(state): State<AppState>, Json(body): Json<ExecuteBody>) -> Result<Json<ExecuteResponse>, ApiError> {
    let request = CallRequest::from_json(body.target, &body.function, &body.args)?;
    let options = body.options.unwrap_or_else(ExecuteOptions::native);

    let outcome = state.executor.execute(&request, &options).await?;
    let mode = outcome.mode;

    let response = ExecuteResponse {
        execution_id: outcome.execution_id,
        hash: outcome.hash,
        mode: mode.as_str(),
        nonce: outcome.nonce,
        attempts: outcome.attempts,
        submitted_at: outcome.submitted_at,
    };

    let confirmation = outcome.confirmation;
    tokio::spawn(async move {
        let hash = confirmation.hash();
        match confirmation.wait().await {
            Ok(receipt) => {
                info!(
                    "{:?} {} in block {:?}",
                    hash,
                    ExecutionStage::Confirmed,
                    receipt.block_number
                );
                crate::metrics::record_tx_confirmed(mode.as_str());
            }
            Err(e) => {
                warn!("{:?} not confirmed: {}", hash, e);
                crate::metrics::record_tx_failed(mode.as_str(), ExecutionStage::Submitted.as_str(), e.kind());
            }
        }
    });

    Ok(Json(response))
}

/// Executor errors rendered as JSON with a status matching their class
pub struct ApiError(ExecutorError);

impl From<ExecutorError> for ApiError {
    fn from(e: ExecutorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ExecutorError::InvalidRequest(_) | ExecutorError::Encoding(_) => StatusCode::BAD_REQUEST,
            ExecutorError::Authorization(_) => StatusCode::FORBIDDEN,
            ExecutorError::NonceCollision { .. } | ExecutorError::RetriesExhausted { .. } => StatusCode::CONFLICT,
            ExecutorError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            ExecutorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };

        let body = ErrorResponse {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    target: Address,
    function: String,
    #[serde(default)]
    args: Vec<Value>,
    options: Option<ExecuteOptions>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    executor: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    execution_id: Uuid,
    hash: H256,
    mode: &'static str,
    nonce: u64,
    attempts: u32,
    submitted_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockNetworkRpc;
    use crate::signer::{RequestSigner, SessionSigner};
    use crate::tx::{ExecutorPolicy, ForwarderDomain};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::signers::LocalWallet;
    use tower::ServiceExt;

    const BURNER_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    /// Executor whose chain is unreachable, so both nonce trackers are unavailable
    async fn offline_state() -> AppState {
        let mut rpc = MockNetworkRpc::new();
        rpc.expect_chain_id().return_const(31337u64);
        rpc.expect_transaction_count()
            .returning(|_| Err(ExecutorError::Network("connection refused".to_string())));
        rpc.expect_call()
            .returning(|_| Err(ExecutorError::Network("connection refused".to_string())));

        let burner: LocalWallet = BURNER_KEY.parse().unwrap();
        let domain = ForwarderDomain::new("Essential Forwarder", "0.0.1", 31337, Address::repeat_byte(0xfa));
        let executor = TransactionExecutor::connect(
            Arc::new(rpc),
            SessionSigner::Burner(burner.clone()),
            RequestSigner::new(SessionSigner::Burner(burner), domain),
            ExecutorPolicy::default(),
        )
        .await;
        AppState::new(Arc::new(executor))
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(offline_state().await)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_status_reports_unavailable_nonces() {
        let response = router(offline_state().await)
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["executor"]["chainId"], 31337);
        assert!(body["executor"]["nextNativeNonce"].is_null());
    }

    #[tokio::test]
    async fn test_meta_with_value_is_bad_request() {
        let body = serde_json::json!({
            "target": format!("{:?}", Address::repeat_byte(0x77)),
            "function": "deposit()",
            "args": [{ "value": "1000" }],
            "options": { "mode": "meta" }
        });
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router(offline_state().await).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_unseeded_nonce_is_unavailable() {
        let body = serde_json::json!({
            "target": format!("{:?}", Address::repeat_byte(0x77)),
            "function": "transferNFT(uint256)",
            "args": ["7", { "gasLimit": 90000, "maxFeePerGas": "100", "maxPriorityFeePerGas": "1" }]
        });
        let request = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        let response = router(offline_state().await).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "configuration");
    }
}
