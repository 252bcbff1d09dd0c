use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use courier_core::{GatewayConfig, GatewayHealth, GatewayKind};
use courier_dispatch::{
    GatewayManager, HealthMonitor, HealthSink, QueueProcessor, TrackingInjector,
};
use courier_gateway::{DynGateway, SendError};
use courier_gmail::GmailGateway;
use courier_mailgun::MailgunGateway;
use courier_mandrill::MandrillGateway;
use courier_postgres::{ConfigRepository, PgMessageQueue, PgRecipientTracker, PostgresConfig};
use courier_server::api::build_router;
use courier_server::config::CourierConfig;
use courier_server::state::AppState;
use courier_store::{MemoryMessageQueue, MemoryRecipientTracker, MessageQueue, RecipientTracker};

/// Courier mail relay server.
#[derive(Parser, Debug)]
#[command(name = "courier-server", about = "Transactional email relay and dispatcher")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "courier.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

/// Persists health observations as `provider_health` rows.
struct PgHealthSink(Arc<ConfigRepository>);

#[async_trait]
impl HealthSink for PgHealthSink {
    async fn record(&self, health: &GatewayHealth) {
        if let Err(e) = self.0.record_provider_health(health).await {
            warn!(gateway = %health.gateway_id, error = %e, "failed to persist health row");
        }
    }
}

/// Instantiate the concrete gateway for a configuration row.
fn build_gateway(config: GatewayConfig) -> Result<Arc<dyn DynGateway>, SendError> {
    Ok(match config.kind {
        GatewayKind::Mailgun => Arc::new(MailgunGateway::new(config)?),
        GatewayKind::Mandrill => Arc::new(MandrillGateway::new(config)?),
        GatewayKind::GoogleWorkspace => Arc::new(GmailGateway::new(config)?),
    })
}

/// Load gateways and pools from the store into the manager. Individual
/// bad gateway rows are skipped with a warning so one broken credential
/// does not take the relay down.
async fn load_routing_config(
    manager: &GatewayManager,
    repo: &ConfigRepository,
) -> Result<(), Box<dyn std::error::Error>> {
    for gateway_config in repo.load_gateways().await? {
        let id = gateway_config.id.clone();
        match build_gateway(gateway_config) {
            Ok(gateway) => manager.register(gateway),
            Err(e) => warn!(gateway = %id, error = %e, "skipping unbuildable gateway"),
        }
    }
    manager.set_pools(repo.load_pools().await?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to listen for SIGTERM"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config: CourierConfig = if Path::new(&cli.config).exists() {
        toml::from_str(&std::fs::read_to_string(&cli.config)?)?
    } else {
        info!(path = %cli.config, "config file not found, using defaults");
        CourierConfig::default()
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // Storage backend.
    let (queue, tracker, repo): (
        Arc<dyn MessageQueue>,
        Arc<dyn RecipientTracker>,
        Option<Arc<ConfigRepository>>,
    ) = match config.database.backend.as_str() {
        "memory" => {
            info!("using in-memory storage (development mode)");
            (
                Arc::new(MemoryMessageQueue::new()),
                Arc::new(MemoryRecipientTracker::new()),
                None,
            )
        }
        "postgres" => {
            let url = config
                .database
                .resolve_url()
                .ok_or("database url required: set COURIER_DATABASE_URL or [database].url")?;
            let pg_config = PostgresConfig {
                url,
                max_connections: config.database.max_connections,
                min_connections: config.database.min_connections,
                max_lifetime_seconds: config.database.max_lifetime_seconds,
            };
            let queue = PgMessageQueue::connect(&pg_config).await?;
            let tracker = PgRecipientTracker::from_pool(queue.pool()).await?;
            let repo = ConfigRepository::from_pool(queue.pool()).await?;
            info!("connected to postgres");
            (Arc::new(queue), Arc::new(tracker), Some(Arc::new(repo)))
        }
        other => return Err(format!("unknown database backend {other}").into()),
    };

    // Gateway manager plus routing configuration.
    let manager = Arc::new(GatewayManager::new(
        config.rate_limits.globals(),
        config.breaker.breaker_config(),
    ));
    if let Some(repo) = &repo {
        load_routing_config(&manager, repo).await?;
    }

    // Warm the rate limiter from the durable 24h aggregates.
    match queue.sent_counts_by_gateway_and_sender().await {
        Ok(counts) => manager.limiter().warm_start(&counts),
        Err(e) => warn!(error = %e, "warm start skipped"),
    }

    // Dispatch core.
    let mut processor = QueueProcessor::new(
        Arc::clone(&queue),
        Arc::clone(&tracker),
        Arc::clone(&manager),
        config.dispatch.processor_config(),
    );
    if let Some(base_url) = &config.tracking.base_url {
        processor = processor.with_transformer(Arc::new(TrackingInjector::new(base_url)));
    }
    let processor = Arc::new(processor);
    let metrics = processor.metrics();

    let state = AppState::new(
        Arc::clone(&queue),
        Arc::clone(&tracker),
        Arc::clone(&manager),
        metrics,
    );

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();

    tasks.spawn(Arc::clone(&processor).run(cancel.clone()));

    let mut monitor = HealthMonitor::new(Arc::clone(&manager))
        .with_interval(Duration::from_secs(config.health.interval_seconds))
        .with_timeout(Duration::from_secs(config.health.timeout_seconds));
    if let Some(repo) = &repo {
        monitor = monitor.with_sink(Arc::new(PgHealthSink(Arc::clone(repo))));
    }
    tasks.spawn(monitor.run(cancel.clone()));

    // Configuration reload requests from `POST /reload`.
    if let Some(repo) = repo.clone() {
        let manager = Arc::clone(&manager);
        let mut notifications = state.reload_notifications();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = notifications.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("reloading gateway and pool configuration");
                        if let Err(e) = load_routing_config(&manager, &repo).await {
                            error!(error = %e, "configuration reload failed");
                        }
                    }
                }
            }
        });
    }

    let app = build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "courier server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    cancel.cancel();
    tasks.close();
    tasks.wait().await;
    Ok(())
}
