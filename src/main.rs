//! Essential Executor - serves native and meta-transaction execution over HTTP
//!
//! Connects to one chain, seeds nonces for the configured signers and exposes
//! the executor through a small API alongside Prometheus metrics.

use anyhow::{Context, Result};
use essential_executor::api;
use essential_executor::chain::ChainProvider;
use essential_executor::config::{NativeSignerKind, Settings};
use essential_executor::metrics::MetricsServer;
use essential_executor::proof::{Attester, GatewayAttester, LocalAttester};
use essential_executor::relay::RelayClient;
use essential_executor::signer::{RequestSigner, SessionSigner};
use essential_executor::tx::{ExecutorPolicy, ForwarderDomain, TransactionExecutor};

use ethers::middleware::SignerMiddleware;
use ethers::signers::{LocalWallet, Signer};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Essential Executor v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let config = &settings.executor;
    let forwarder = config.forwarder()?;
    info!(
        "Loaded configuration for chain {} (forwarder {:?})",
        config.chain_id, forwarder
    );

    let provider = Arc::new(ChainProvider::new(
        config.chain_id,
        &config.rpc_url,
        config.rpc_timeout(),
    )?);

    // Signers
    let native_key = load_wallet(&settings.signer.native_key_env, config.chain_id)?;
    let native = match settings.signer.native {
        NativeSignerKind::Burner => SessionSigner::Burner(native_key.clone()),
        NativeSignerKind::Wallet => SessionSigner::Wallet(Arc::new(SignerMiddleware::new(
            provider.http().clone(),
            native_key.clone(),
        ))),
    };
    let burner = match &settings.signer.burner_key_env {
        Some(env_var) => load_wallet(env_var, config.chain_id)?,
        None => native_key,
    };
    let domain = ForwarderDomain::new(
        config.domain_name.clone(),
        config.domain_version.clone(),
        config.chain_id,
        forwarder,
    );
    let request_signer = RequestSigner::new(SessionSigner::Burner(burner), domain);

    // Executor
    let mut executor = TransactionExecutor::connect(
        provider.clone(),
        native,
        request_signer,
        ExecutorPolicy::from_config(config),
    )
    .await;

    match RelayClient::from_config(&settings.relay, forwarder)? {
        Some(relay) => {
            info!("Relaying meta-transactions through {}", relay.relayer_uri());
            executor = executor.with_relay(relay);
        }
        None => warn!("Meta-transactions disabled: no relayer configured"),
    }

    if let Some(attester) = load_attester(&settings)? {
        executor = executor.with_attester(attester);
    }

    let executor = Arc::new(executor);

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let executor = executor.clone();
        async move {
            if let Err(e) = api::run_server(config, executor).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Essential Executor is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Essential Executor stopped");
    Ok(())
}

fn load_wallet(env_var: &str, chain_id: u64) -> Result<LocalWallet> {
    let key = std::env::var(env_var).with_context(|| format!("{} is not set", env_var))?;
    let wallet = key
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .with_context(|| format!("{} does not hold a valid private key", env_var))?;
    Ok(wallet.with_chain_id(chain_id))
}

fn load_attester(settings: &Settings) -> Result<Option<Arc<dyn Attester>>> {
    if settings.signer.use_gateway_attester {
        info!("Attesting ownership proofs through EIP-3668 gateways");
        return Ok(Some(Arc::new(GatewayAttester::new(settings.relay.timeout())?)));
    }

    match &settings.signer.attester_key_env {
        Some(env_var) => {
            let attester = LocalAttester::new(load_wallet(env_var, settings.executor.chain_id)?);
            info!("Attesting ownership proofs locally as {:?}", attester.address());
            Ok(Some(Arc::new(attester)))
        }
        None => {
            warn!("No attester configured: NFT-gated native calls needing a proof will fail");
            Ok(None)
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,essential_executor=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
