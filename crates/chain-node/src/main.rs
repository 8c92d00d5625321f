use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chain_core::constants::{DIFFICULTY, MAX_MINE_ATTEMPTS};
use chain_core::ledger::{ChainStats, Ledger, TxView};
use chain_core::pow::MineOptions;
use chain_core::{Block, LedgerError, TxRecord};
use chain_storage::SledStore;
use clap::Parser;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

#[derive(Parser, Debug)]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Data directory for sled
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// Leading zero hex characters required of every block hash
    #[arg(long, default_value_t = DIFFICULTY)]
    difficulty: usize,
}

#[derive(Clone)]
struct AppState {
    ledger: Arc<Ledger<SledStore>>,
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::InvalidTransactionPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::ChainConflict { .. }
            | LedgerError::LedgerBusy { .. }
            | LedgerError::MiningCancelled => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::MiningExhausted { .. } | LedgerError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok" })
}

/// Seal a batch of transaction records into a new block. Mining is
/// CPU-bound, so it runs on the blocking pool rather than a runtime worker.
async fn submit_transactions(
    State(state): State<AppState>,
    Json(records): Json<Vec<TxRecord>>,
) -> Result<Json<Block>, ApiError> {
    let ledger = state.ledger.clone();
    let block = tokio::task::spawn_blocking(move || ledger.append_block(records))
        .await
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("append task failed: {e}")))??;
    Ok(Json(block))
}

/// Chain summary. Runs on the blocking pool because an empty store mines
/// its genesis block here.
async fn stats(State(state): State<AppState>) -> Result<Json<ChainStats>, ApiError> {
    let ledger = state.ledger.clone();
    let stats = tokio::task::spawn_blocking(move || ledger.stats())
        .await
        .map_err(|e| LedgerError::Storage(anyhow::anyhow!("stats task failed: {e}")))??;
    Ok(Json(stats))
}

async fn list_blocks(State(state): State<AppState>) -> Result<Json<Vec<Block>>, ApiError> {
    Ok(Json(state.ledger.list_blocks()?))
}

async fn list_transactions(State(state): State<AppState>) -> Result<Json<Vec<TxView>>, ApiError> {
    Ok(Json(state.ledger.list_transactions()?))
}

async fn shutdown_signal(ledger: Arc<Ledger<SledStore>>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested, cancelling in-flight mining");
    ledger.shutdown();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = Arc::new(SledStore::open(&args.data_dir)?);
    let opts = MineOptions {
        difficulty: args.difficulty,
        max_attempts: MAX_MINE_ATTEMPTS,
    };
    let ledger = Arc::new(Ledger::with_options(store, opts));

    let genesis = ledger.ensure_genesis()?;
    info!(hash = %genesis.hash, "chain ready");

    let state = AppState {
        ledger: ledger.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/stats", get(stats))
        .route("/blocks", get(list_blocks))
        .route("/transactions", get(list_transactions).post(submit_transactions))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = args.listen.parse()?;
    info!("chain-node listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(ledger))
        .await?;
    Ok(())
}
