mod api;
mod config;
mod db;
mod error;
mod extractor;
mod fetcher;
mod orchestrator;
mod scheduler;
mod types;

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::latency::RunLatency;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::db::{ResultStore, SqliteResultStore};
use crate::error::Result;
use crate::fetcher::ChromeFetcher;
use crate::orchestrator::Orchestrator;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenv::dotenv();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", cfg.db_path))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database ready at {}", cfg.db_path);

    // --- Pipeline ---
    if cfg.chrome_executable.is_none() {
        warn!("No browser path configured (CHROME_EXECUTABLE_PATH); relying on auto-detection");
    }
    let fetcher = Arc::new(ChromeFetcher::new(&cfg));
    let store: Arc<dyn ResultStore> = Arc::new(SqliteResultStore::new(pool.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        fetcher,
        Arc::clone(&store),
        cfg.target_url.clone(),
        cfg.nav_timeout,
    ));

    // --- Scheduler (runs once immediately, then on the interval) ---
    let latency = Arc::new(RunLatency::new());
    let scheduler = Scheduler::new(
        orchestrator,
        cfg.update_interval,
        cfg.retry_delay,
        Arc::clone(&latency),
    );
    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown.clone()));

    // --- HTTP API server ---
    let api_state = ApiState {
        scheduler: Arc::clone(&scheduler),
        store,
        latency,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on http://{bind_addr}");
    info!(
        "Automatic updates scheduled every {} hours",
        scheduler.update_interval().as_secs() / 3600
    );
    info!("Available endpoints: GET / (health), GET /scrape, GET /history, GET /status");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
                server_shutdown.cancelled().await;
            }
            info!("Shutdown requested");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!("Scheduler task failed: {e}");
    }
    if scheduler.status().running {
        info!("Waiting for the in-flight scrape run to finish");
        scheduler.wait_idle().await;
    }
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}
