//! PostoraAI Credits Service - HTTP API for the credit ledger
//!
//! This is the main entry point for the postora-credits service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postora_core::CreditError;
use postora_service::{create_router, AppState, ServiceConfig, StoreBackend};
use postora_store::{LedgerStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,postora=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PostoraAI Credits Service");

    let config = ServiceConfig::from_env()?;

    tracing::info!(
        listen_addr = %config.listen_addr,
        store_backend = ?config.store_backend,
        gate_mode = ?config.gate_mode,
        default_free_credits = config.default_free_credits,
        stripe_configured = config.stripe_webhook_secret.is_some(),
        "Service configuration loaded"
    );

    let store = open_store(&config).await?;

    let state = AppState::new(store, config.clone());

    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store - balances are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::RocksDb => open_rocks(config),
        StoreBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                CreditError::Configuration("STORE_BACKEND=postgres requires DATABASE_URL".into())
            })?;
            tracing::info!("Connecting to PostgreSQL");
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(feature = "rocksdb-backend")]
fn open_rocks(config: &ServiceConfig) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>> {
    tracing::info!(path = %config.data_dir, "Opening RocksDB store");
    Ok(Arc::new(postora_store::RocksStore::open(&config.data_dir)?))
}

#[cfg(not(feature = "rocksdb-backend"))]
fn open_rocks(_config: &ServiceConfig) -> Result<Arc<dyn LedgerStore>, Box<dyn std::error::Error>> {
    Err(CreditError::Configuration(
        "STORE_BACKEND=rocksdb requires the rocksdb-backend feature".into(),
    )
    .into())
}
