//! Attesters sign the canonical ownership message for the forwarder

use super::OffchainLookup;
use crate::error::{ExecutorError, ExecutorResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Party that vouches for an ownership challenge
#[async_trait]
pub trait Attester: Send + Sync {
    /// Signature over `message`, which the forwarder rebuilt from `lookup`
    async fn attest(&self, lookup: &OffchainLookup, message: &Bytes) -> ExecutorResult<Bytes>;
}

/// Attests in-process with a held key (EIP-191 personal sign)
pub struct LocalAttester {
    wallet: LocalWallet,
}

impl LocalAttester {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }
}

#[async_trait]
impl Attester for LocalAttester {
    async fn attest(&self, _lookup: &OffchainLookup, message: &Bytes) -> ExecutorResult<Bytes> {
        let signature = self
            .wallet
            .sign_message(message.as_ref())
            .await
            .map_err(|e| ExecutorError::Wallet(e.to_string()))?;
        Ok(Bytes::from(signature.to_vec()))
    }
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    data: Bytes,
}

/// Asks the gateway URLs named in the lookup, per EIP-3668
///
/// URLs containing `{data}` are fetched with GET, others with a JSON POST of
/// `{sender, data}`. A 4xx answer stops the search; 5xx moves to the next URL.
pub struct GatewayAttester {
    client: reqwest::Client,
}

impl GatewayAttester {
    pub fn new(request_timeout: Duration) -> ExecutorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ExecutorError::Config(format!("Failed to build gateway client: {}", e)))?;
        Ok(Self { client })
    }

    async fn query(&self, url: &str, lookup: &OffchainLookup) -> ExecutorResult<reqwest::Response> {
        let sender = format!("{:?}", lookup.sender);
        let data = format!("0x{}", hex::encode(&lookup.call_data));
        let url = url.replace("{sender}", &sender);

        let request = if url.contains("{data}") {
            self.client.get(url.replace("{data}", &data))
        } else {
            self.client
                .post(url)
                .json(&serde_json::json!({ "sender": sender, "data": data }))
        };

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutorError::Timeout {
                    operation: "offchain gateway".to_string(),
                }
            } else {
                ExecutorError::Network(e.to_string())
            }
        })
    }
}

#[async_trait]
impl Attester for GatewayAttester {
    async fn attest(&self, lookup: &OffchainLookup, _message: &Bytes) -> ExecutorResult<Bytes> {
        let mut last_error = None;

        for url in &lookup.urls {
            let response = match self.query(url, lookup).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Gateway {} unreachable: {}", url, e);
                    last_error = Some(e);
                    continue;
                }
            };

            let status = response.status();
            if status.is_client_error() {
                let body = response.text().await.unwrap_or_default();
                return Err(ExecutorError::Authorization(format!(
                    "Gateway {} refused ownership proof ({}): {}",
                    url, status, body
                )));
            }
            if !status.is_success() {
                warn!("Gateway {} answered {}", url, status);
                last_error = Some(ExecutorError::Network(format!("Gateway {} answered {}", url, status)));
                continue;
            }

            let body: GatewayResponse = response
                .json()
                .await
                .map_err(|e| ExecutorError::Encoding(format!("Gateway {} response: {}", url, e)))?;
            debug!("Gateway {} returned {} bytes", url, body.data.len());
            return Ok(body.data);
        }

        Err(last_error.unwrap_or_else(|| {
            ExecutorError::Authorization("OffchainLookup named no gateway URLs".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use ethers::types::{RecoveryMessage, Signature};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    type Hits = Arc<Mutex<Vec<Value>>>;

    /// Gateway with one route per answer, logging every hit
    async fn spawn_gateway() -> (String, Hits) {
        let hits: Hits = Arc::new(Mutex::new(Vec::new()));

        async fn by_get(State(hits): State<Hits>, Path((sender, data)): Path<(String, String)>) -> Json<Value> {
            hits.lock().unwrap().push(json!({ "route": "get", "sender": sender, "data": data }));
            Json(json!({ "data": "0xabcd" }))
        }
        async fn by_post(State(hits): State<Hits>, Json(body): Json<Value>) -> Json<Value> {
            hits.lock().unwrap().push(json!({ "route": "post", "body": body }));
            Json(json!({ "data": "0x01" }))
        }
        async fn failing(State(hits): State<Hits>) -> StatusCode {
            hits.lock().unwrap().push(json!({ "route": "fail" }));
            StatusCode::INTERNAL_SERVER_ERROR
        }
        async fn denying(State(hits): State<Hits>) -> (StatusCode, &'static str) {
            hits.lock().unwrap().push(json!({ "route": "deny" }));
            (StatusCode::FORBIDDEN, "not the owner")
        }

        let app = Router::new()
            .route("/get/:sender/:data", get(by_get))
            .route("/post", post(by_post))
            .route("/fail", post(failing))
            .route("/deny", post(denying))
            .with_state(hits.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), hits)
    }

    fn lookup_with(urls: Vec<String>) -> OffchainLookup {
        OffchainLookup {
            sender: Address::repeat_byte(0xfa),
            urls,
            call_data: Bytes::from(vec![0x12, 0x34]),
            callback_function: [0; 4],
            extra_data: Bytes::default(),
        }
    }

    fn routes(hits: &Hits) -> Vec<String> {
        hits.lock()
            .unwrap()
            .iter()
            .map(|hit| hit["route"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn gateway() -> GatewayAttester {
        GatewayAttester::new(Duration::from_secs(5)).unwrap()
    }

    const ATTESTER_KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    #[tokio::test]
    async fn test_local_attestation_is_personal_sign() {
        let wallet: LocalWallet = ATTESTER_KEY.parse().unwrap();
        let attester = LocalAttester::new(wallet);
        let lookup = OffchainLookup {
            sender: Address::zero(),
            urls: vec![],
            call_data: Bytes::default(),
            callback_function: [0; 4],
            extra_data: Bytes::default(),
        };
        let message = Bytes::from(vec![0x5a; 32]);

        let raw = attester.attest(&lookup, &message).await.unwrap();
        let signature = Signature::try_from(raw.as_ref()).unwrap();
        let recovered = signature
            .recover(RecoveryMessage::Data(message.to_vec()))
            .unwrap();
        assert_eq!(recovered, attester.address());
    }

    #[tokio::test]
    async fn test_gateway_without_urls_fails() {
        let attester = GatewayAttester::new(Duration::from_secs(1)).unwrap();
        let lookup = OffchainLookup {
            sender: Address::zero(),
            urls: vec![],
            call_data: Bytes::default(),
            callback_function: [0; 4],
            extra_data: Bytes::default(),
        };
        let err = attester.attest(&lookup, &Bytes::default()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Authorization(_)));
    }

    #[tokio::test]
    async fn test_gateway_data_template_uses_get() {
        let (base, hits) = spawn_gateway().await;
        let lookup = lookup_with(vec![format!("{}/get/{{sender}}/{{data}}", base)]);

        let data = gateway().attest(&lookup, &Bytes::default()).await.unwrap();
        assert_eq!(data, Bytes::from(vec![0xab, 0xcd]));

        let hit = hits.lock().unwrap()[0].clone();
        assert_eq!(hit["route"], "get");
        assert_eq!(hit["sender"], json!(format!("{:?}", Address::repeat_byte(0xfa))));
        assert_eq!(hit["data"], "0x1234");
    }

    #[tokio::test]
    async fn test_gateway_without_data_template_posts() {
        let (base, hits) = spawn_gateway().await;
        let lookup = lookup_with(vec![format!("{}/post", base)]);

        let data = gateway().attest(&lookup, &Bytes::default()).await.unwrap();
        assert_eq!(data, Bytes::from(vec![0x01]));

        let hit = hits.lock().unwrap()[0].clone();
        assert_eq!(hit["body"]["sender"], json!(format!("{:?}", Address::repeat_byte(0xfa))));
        assert_eq!(hit["body"]["data"], "0x1234");
    }

    #[tokio::test]
    async fn test_gateway_server_error_tries_next_url() {
        let (base, hits) = spawn_gateway().await;
        let lookup = lookup_with(vec![format!("{}/fail", base), format!("{}/post", base)]);

        let data = gateway().attest(&lookup, &Bytes::default()).await.unwrap();
        assert_eq!(data, Bytes::from(vec![0x01]));
        assert_eq!(routes(&hits), vec!["fail", "post"]);
    }

    #[tokio::test]
    async fn test_gateway_client_error_stops_search() {
        let (base, hits) = spawn_gateway().await;
        let lookup = lookup_with(vec![format!("{}/deny", base), format!("{}/post", base)]);

        let err = gateway().attest(&lookup, &Bytes::default()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Authorization(_)));
        assert_eq!(routes(&hits), vec!["deny"]);
    }

    #[tokio::test]
    async fn test_gateway_all_failing_reports_last_error() {
        let (base, hits) = spawn_gateway().await;
        let lookup = lookup_with(vec![format!("{}/fail", base), format!("{}/fail", base)]);

        let err = gateway().attest(&lookup, &Bytes::default()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Network(_)));
        assert_eq!(routes(&hits), vec!["fail", "fail"]);
    }
}
