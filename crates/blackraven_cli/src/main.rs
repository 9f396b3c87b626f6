use std::{net::SocketAddr, path::Path, path::PathBuf, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use blackraven_control_plane::{
    build_router, AppState, ServiceSettings, StaticTokenIdentityProvider, StaticUser,
    SweeperSettings, TransferService,
};
use blackraven_delivery::{DeliveryMechanism, DeliveryRegistry, EmailDelivery, InMemoryDelivery, SmtpConfig};
use blackraven_storage::{BlackravenStorage, BlobStore, InMemoryBlobStore, LocalBlobStore, StorageConfig};
use blackraven_transfer::{DeactivationPolicy, HashingParams, PassphraseHasher};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "BlackRaven scheduled transfer daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP control plane.
    Serve {
        #[arg(long, default_value = "config/blackraven.toml")]
        config: PathBuf,
    },
    /// Dispatch every due transfer once and print the report.
    Sweep {
        #[arg(long, default_value = "config/blackraven.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    storage: StorageSection,
    blob: BlobSection,
    #[serde(default)]
    cron: CronSection,
    #[serde(default)]
    sweeper: SweeperSection,
    #[serde(default)]
    deactivation: DeactivationPolicy,
    #[serde(default)]
    hashing: HashingSection,
    #[serde(default)]
    upload: UploadSection,
    delivery: DeliverySection,
    #[serde(default)]
    identity: IdentitySection,
    app_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
    #[serde(default = "default_max_connections")]
    max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BlobBackend {
    Local,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
struct BlobSection {
    backend: BlobBackend,
    root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CronSection {
    secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SweeperSection {
    /// In-process sweep period; 0 leaves sweeping to the external trigger.
    interval_secs: u64,
    concurrency: usize,
    max_dispatch_attempts: i64,
    claim_lease_secs: i64,
}

impl Default for SweeperSection {
    fn default() -> Self {
        let defaults = SweeperSettings::default();
        Self {
            interval_secs: 0,
            concurrency: defaults.concurrency,
            max_dispatch_attempts: defaults.max_dispatch_attempts,
            claim_lease_secs: defaults.claim_lease.num_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct HashingSection {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Default for HashingSection {
    fn default() -> Self {
        let defaults = HashingParams::default();
        Self {
            memory_kib: defaults.memory_kib,
            iterations: defaults.iterations,
            parallelism: defaults.parallelism,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct UploadSection {
    max_payload_bytes: usize,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            max_payload_bytes: ServiceSettings::default().max_payload_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DeliveryBackend {
    Email,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
struct DeliverySection {
    mechanism: DeliveryBackend,
    #[serde(default = "default_platforms")]
    platforms: Vec<String>,
    smtp: Option<SmtpConfig>,
}

fn default_platforms() -> Vec<String> {
    vec!["email".to_string(), "gmail".to_string()]
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IdentitySection {
    #[serde(default)]
    users: Vec<StaticUser>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(&load_config(&config)?).await,
        Command::Sweep { config } => sweep_once(&load_config(&config)?).await,
    }
}

fn load_config(config_path: &Path) -> Result<RuntimeConfig> {
    let config_source = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {}", config_path.display()))?;
    toml::from_str(&config_source)
        .with_context(|| format!("invalid config TOML at {}", config_path.display()))
}

async fn build_service(config: &RuntimeConfig) -> Result<TransferService> {
    let storage = BlackravenStorage::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
        max_connections: config.storage.max_connections,
    })
    .await?;

    let blobs: Arc<dyn BlobStore> = match config.blob.backend {
        BlobBackend::Local => {
            let root = config
                .blob
                .root
                .clone()
                .ok_or_else(|| anyhow!("blob.root is required for the local backend"))?;
            tokio::fs::create_dir_all(&root)
                .await
                .with_context(|| format!("failed to create blob root {}", root.display()))?;
            Arc::new(LocalBlobStore::new(root))
        }
        BlobBackend::Memory => {
            warn!("in-memory blob store configured: payloads are lost on restart");
            Arc::new(InMemoryBlobStore::new())
        }
    };

    let delivery = build_delivery(&config.delivery)?;

    let hasher = PassphraseHasher::new(HashingParams {
        memory_kib: config.hashing.memory_kib,
        iterations: config.hashing.iterations,
        parallelism: config.hashing.parallelism,
    })
    .context("invalid hashing parameters")?;

    let settings = ServiceSettings {
        max_payload_bytes: config.upload.max_payload_bytes,
        deactivation: config.deactivation,
        sweeper: SweeperSettings {
            concurrency: config.sweeper.concurrency,
            max_dispatch_attempts: config.sweeper.max_dispatch_attempts,
            claim_lease: chrono::Duration::seconds(config.sweeper.claim_lease_secs),
        },
        app_url: config.app_url.clone(),
    };

    Ok(TransferService::new(storage, blobs, delivery, hasher, settings))
}

fn build_delivery(section: &DeliverySection) -> Result<DeliveryRegistry> {
    let mechanism: Arc<dyn DeliveryMechanism> = match section.mechanism {
        DeliveryBackend::Email => {
            let smtp = section
                .smtp
                .clone()
                .ok_or_else(|| anyhow!("delivery.smtp is required for the email mechanism"))?;
            Arc::new(EmailDelivery::new(smtp).context("invalid SMTP configuration")?)
        }
        DeliveryBackend::Memory => {
            warn!("in-memory delivery configured: transfers are recorded, not sent");
            Arc::new(InMemoryDelivery::new())
        }
    };

    if section.platforms.is_empty() {
        bail!("delivery.platforms must name at least one platform");
    }
    let mut registry = DeliveryRegistry::new();
    for platform in &section.platforms {
        registry.register(platform.as_str(), mechanism.clone());
    }
    info!(platforms = ?registry.platforms(), mechanism = mechanism.mechanism_name(), "delivery platforms registered");
    Ok(registry)
}

async fn serve(config: &RuntimeConfig) -> Result<()> {
    let service = build_service(config).await?;

    let require_cron_secret = requires_token(&config.http.bind);
    let cron_secret = config.cron.secret.clone().filter(|s| !s.is_empty());
    if require_cron_secret && cron_secret.is_none() {
        return Err(anyhow!(
            "non-loopback bind {} requires cron.secret",
            config.http.bind
        ));
    }

    if !require_cron_secret {
        info!("loopback bind detected: cron secret optional");
    } else {
        warn!("non-loopback bind detected: cron secret enforced");
    }

    if config.identity.users.is_empty() {
        warn!("no identity.users configured: every transfer request will be rejected");
    }
    let identity = Arc::new(StaticTokenIdentityProvider::new(config.identity.users.clone()));

    if config.sweeper.interval_secs > 0 {
        spawn_sweeper(service.clone(), config.sweeper.interval_secs);
    }

    let state = AppState::new(service, identity, cron_secret, require_cron_secret);
    let app = build_router(state);

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(bind = %config.http.bind, "blackravend control-plane listening");
    axum::serve(listener, app).await.context("axum server failed")
}

fn spawn_sweeper(service: TransferService, interval_secs: u64) {
    info!(interval_secs, "in-process sweeper enabled");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = service.sweep_due(Utc::now()).await {
                error!(error = %e, "scheduled sweep failed");
            }
        }
    });
}

async fn sweep_once(config: &RuntimeConfig) -> Result<()> {
    let service = build_service(config).await?;
    let report = service
        .sweep_due(Utc::now())
        .await
        .map_err(|e| anyhow!("sweep failed: {e}"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize sweep report")?
    );
    if report.errors > 0 {
        bail!("{} transfers could not be dispatched", report.errors);
    }
    Ok(())
}

fn requires_token(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => !addr.ip().is_loopback(),
        Err(_) => true,
    }
}
