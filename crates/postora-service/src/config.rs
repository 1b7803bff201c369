//! Service configuration.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use postora_core::{CreditError, PlanCatalog, DEFAULT_FREE_CREDITS};

use crate::gate::GateMode;

/// Which [`postora_store::LedgerStore`] backend the binary opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, lost on restart.
    Memory,
    /// `RocksDB` under `data_dir` (needs the `rocksdb-backend` feature).
    RocksDb,
    /// PostgreSQL at `database_url`.
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = CreditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "rocksdb" | "rocks" => Ok(Self::RocksDb),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(CreditError::Configuration(format!(
                "unknown STORE_BACKEND: {other}"
            ))),
        }
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Storage backend (default: postgres when `DATABASE_URL` is set, else memory).
    pub store_backend: StoreBackend,

    /// Path to `RocksDB` data directory (default: "/data/postora-credits").
    pub data_dir: String,

    /// PostgreSQL connection string.
    pub database_url: Option<String>,

    /// HS256 secret the identity provider signs user JWTs with.
    pub auth_jwt_secret: Option<String>,

    /// Expected JWT audience (default: "authenticated").
    pub auth_audience: String,

    /// API key for the generation pipeline.
    pub service_api_key: Option<String>,

    /// API key for operator endpoints.
    pub admin_api_key: Option<String>,

    /// Stripe webhook signing secret.
    pub stripe_webhook_secret: Option<String>,

    /// Credits seeded into a new account (default: 3).
    pub default_free_credits: i64,

    /// Plan to credits mapping.
    pub plans: PlanCatalog,

    /// Generation charging policy.
    pub gate_mode: GateMode,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

/// Stripe secrets file structure.
#[derive(Debug, Deserialize)]
struct StripeSecrets {
    #[serde(default)]
    webhook_secret: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    ///
    /// # Errors
    ///
    /// Returns `CreditError::Configuration` when `STORE_BACKEND`,
    /// `PLAN_CREDITS`, `GATE_MODE` or `DEFAULT_FREE_CREDITS` is malformed.
    pub fn from_env() -> Result<Self, CreditError> {
        let database_url = env_opt("DATABASE_URL");

        let store_backend = match env_opt("STORE_BACKEND") {
            Some(value) => value.parse()?,
            None if database_url.is_some() => StoreBackend::Postgres,
            None => StoreBackend::Memory,
        };

        let plans = match env_opt("PLAN_CREDITS") {
            Some(pairs) => PlanCatalog::parse(&pairs)?,
            None => PlanCatalog::default(),
        };

        let gate_mode = match env_opt("GATE_MODE") {
            Some(mode) => mode.parse()?,
            None => GateMode::default(),
        };

        let default_free_credits = match env_opt("DEFAULT_FREE_CREDITS") {
            Some(value) => value
                .parse::<i64>()
                .ok()
                .filter(|credits| *credits >= 0)
                .ok_or_else(|| {
                    CreditError::Configuration(format!("invalid DEFAULT_FREE_CREDITS: {value}"))
                })?,
            None => DEFAULT_FREE_CREDITS,
        };

        Ok(Self {
            listen_addr: env_opt("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into()),
            store_backend,
            data_dir: env_opt("DATA_DIR").unwrap_or_else(|| "/data/postora-credits".into()),
            database_url,
            auth_jwt_secret: env_opt("AUTH_JWT_SECRET"),
            auth_audience: env_opt("AUTH_AUDIENCE").unwrap_or_else(|| "authenticated".into()),
            service_api_key: env_opt("SERVICE_API_KEY"),
            admin_api_key: env_opt("ADMIN_API_KEY"),
            stripe_webhook_secret: load_stripe_webhook_secret(),
            default_free_credits,
            plans,
            gate_mode,
            cors_origins: parse_origins(
                &env_opt("CORS_ORIGINS").unwrap_or_else(|| "*".into()),
            ),
            max_body_bytes: env_opt("MAX_BODY_BYTES")
                .and_then(|s| s.parse().ok())
                .unwrap_or(1024 * 1024), // 1MB
            request_timeout_seconds: env_opt("REQUEST_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        })
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_origins(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Load the Stripe webhook secret from a secrets file or the environment.
fn load_stripe_webhook_secret() -> Option<String> {
    let secret_paths = [".secrets/stripe.json", "../.secrets/stripe.json"];

    for path in &secret_paths {
        if let Ok(StripeSecrets {
            webhook_secret: Some(secret),
        }) = load_secrets_file::<StripeSecrets>(Path::new(path))
        {
            tracing::info!(path = %path, "Loaded Stripe webhook secret from file");
            return Some(secret);
        }
    }

    tracing::debug!("Stripe secrets file not found, using environment variables");
    env_opt("STRIPE_WEBHOOK_SECRET")
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, std::io::Error> {
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            store_backend: StoreBackend::Memory,
            data_dir: "/data/postora-credits".into(),
            database_url: None,
            auth_jwt_secret: None,
            auth_audience: "authenticated".into(),
            service_api_key: None,
            admin_api_key: None,
            stripe_webhook_secret: None,
            default_free_credits: DEFAULT_FREE_CREDITS,
            plans: PlanCatalog::default(),
            gate_mode: GateMode::default(),
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        }
    }
}
