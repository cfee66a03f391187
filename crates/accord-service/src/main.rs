use accord_core::{EngineConfig, StoreConfig};
use accord_service::webhooks::WebhookSecrets;
use accord_service::{build_router, ServiceConfig, ServiceState};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "accordd", version, about = "Accord roommate agreement service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8093
    #[arg(long, default_value = "127.0.0.1:8093", env = "ACCORD_LISTEN")]
    listen: SocketAddr,
    /// Persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "ACCORD_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for agreements, audit chains, accounts and verifications.
    #[arg(long, env = "ACCORD_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "ACCORD_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Skip identity verification and payment gating.
    #[arg(long, default_value_t = false, env = "ACCORD_DEMO_MODE")]
    demo_mode: bool,
    /// Base URL used in invite, payment and download links.
    #[arg(long, default_value = "http://localhost:3000", env = "ACCORD_FRONTEND_URL")]
    frontend_url: String,
    /// Directory for archived agreement documents. Kept in memory when unset.
    #[arg(long, env = "ACCORD_BLOB_DIR")]
    blob_dir: Option<PathBuf>,
    /// Invite lifetime in days.
    #[arg(long, default_value_t = 7, env = "ACCORD_INVITE_TTL_DAYS")]
    invite_ttl_days: i64,
    /// Timeout for checkout, e-signature, KYC and blob calls.
    #[arg(long, default_value_t = 10, env = "ACCORD_PROVIDER_TIMEOUT_SECS")]
    provider_timeout_secs: u64,
    /// Price of the card checkout in cents.
    #[arg(long, default_value_t = 250, env = "ACCORD_CARD_PRICE_CENTS")]
    card_price_cents: u64,
    /// Price of the crypto checkout in cents.
    #[arg(long, default_value_t = 200, env = "ACCORD_CRYPTO_PRICE_CENTS")]
    crypto_price_cents: u64,
    /// Webhook signing secret as `source=secret` (stripe, coinbase, signatures, idme, ...).
    #[arg(
        long = "webhook-secret",
        env = "ACCORD_WEBHOOK_SECRETS",
        value_delimiter = ','
    )]
    webhook_secrets: Vec<String>,
    /// Accept unsigned webhooks from sources without a secret.
    #[arg(long, default_value_t = false, env = "ACCORD_ALLOW_UNSIGNED_WEBHOOKS")]
    allow_unsigned_webhooks: bool,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<StoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => StoreConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            StoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => match resolved_url {
            Some(database_url) => StoreConfig::postgres(database_url, cli.pg_max_connections),
            None => StoreConfig::Memory,
        },
    };

    Ok(storage)
}

fn webhook_secrets(cli: &Cli) -> anyhow::Result<WebhookSecrets> {
    let mut secrets = WebhookSecrets::new();
    for entry in &cli.webhook_secrets {
        let (source, secret) = WebhookSecrets::parse_entry(entry)
            .ok_or_else(|| anyhow::anyhow!("--webhook-secret expects source=secret"))?;
        secrets.insert(&source, secret);
    }
    secrets.allow_unsigned = cli.allow_unsigned_webhooks;
    Ok(secrets)
}

fn engine_config(cli: &Cli, storage: StoreConfig) -> anyhow::Result<EngineConfig> {
    if cli.invite_ttl_days < 1 {
        anyhow::bail!("--invite-ttl-days must be at least 1");
    }
    Ok(EngineConfig {
        demo_mode: cli.demo_mode,
        invite_ttl: chrono::Duration::days(cli.invite_ttl_days),
        provider_timeout: Duration::from_secs(cli.provider_timeout_secs),
        frontend_url: cli.frontend_url.clone(),
        card_price_cents: cli.card_price_cents,
        crypto_price_cents: cli.crypto_price_cents,
        storage,
        ..EngineConfig::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "accord_service=info,accord_core=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    info!(store = storage.label(), demo_mode = cli.demo_mode, "starting accord-service");

    let webhooks = webhook_secrets(&cli)?;
    info!(
        sources = ?webhooks.sources().collect::<Vec<_>>(),
        allow_unsigned = webhooks.allow_unsigned,
        "webhook signing configured"
    );

    let config = ServiceConfig {
        engine: engine_config(&cli, storage)?,
        blob_dir: cli.blob_dir.clone(),
        webhooks,
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("accord-service REST listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
