use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dchat_realtime::{Hub, UserId};
use tracing::info;

mod auth;
mod config;
mod db;
mod messages;
mod server;
mod telemetry;

use auth::TokenVerifier;
use config::ServerConfig;
use db::{Database, MigrationRunner};
use messages::MessageRepository;
use server::AppState;

/// dChat real-time delivery server
#[derive(Debug, Parser)]
#[command(name = "dchat-server", version, about)]
struct Cli {
    /// Address to listen on (overrides DCHAT_BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// libSQL database file, or ":memory:" (overrides DCHAT_DATABASE_PATH)
    #[arg(long)]
    database: Option<String>,

    /// Print a signed token for this user id and exit
    #[arg(long, value_name = "USER_ID")]
    issue_token: Option<u64>,

    /// Lifetime of issued tokens, in seconds
    #[arg(long, default_value_t = 86_400)]
    token_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::from_env().context("Invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(database) = cli.database {
        config.database_path = (database != ":memory:").then(|| PathBuf::from(database));
    }

    if let Some(user) = cli.issue_token {
        let token = TokenVerifier::new(&config.token_secret)
            .issue(UserId(user), Duration::from_secs(cli.token_ttl_secs))?;
        println!("{token}");
        return Ok(());
    }

    telemetry::init(config.log_format)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {e}"))?;

    info!("dChat server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let db = Arc::new(
        Database::open("dchat", config.database_path.as_deref())
            .await
            .context("Failed to open database")?,
    );
    let runner = MigrationRunner::default();
    if runner.has_pending(&db).await? {
        runner.run(&db).await.context("Failed to run migrations")?;
    }
    info!(schema_version = ?runner.current_version(&db).await?, "Database ready");

    let store = Arc::new(MessageRepository::new(db.clone()));
    let hub = Hub::new(store, config.hub_config())?;
    let state = Arc::new(AppState::new(
        hub.clone(),
        db,
        TokenVerifier::new(&config.token_secret),
    ));

    // WebSockets are closed before the HTTP server drains
    let shutdown = async move {
        shutdown_signal().await;
        let closed = hub.shutdown().await;
        info!(closed, "Closed real-time connections");
    };
    server::start(state, config.bind_addr, shutdown).await?;

    info!("dChat server stopped");
    telemetry::shutdown();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
