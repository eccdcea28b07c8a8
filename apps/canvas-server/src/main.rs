use axum::Router;
use canvas_server::config::AppConfig;
use canvas_server::metrics;
use canvas_server::routes;
use canvas_server::state::AppState;
use canvas_server::telemetry::init_tracing;
use tokio::signal;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env();
    init_tracing(&cfg.log_filter);

    let state = AppState::from_config(&cfg).await;
    let seeded = state.canvas.seed_from_cache().await;
    let archives = state.archives.load_index().await;
    let scheduler = state.scheduler.spawn();

    let app: Router = routes::build_router(state.clone());

    info!(
        addr = %cfg.bind_addr,
        width = cfg.canvas_width,
        height = cfg.canvas_height,
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        database = %cfg.database_url.as_deref().unwrap_or("unset"),
        object_store = %cfg.object_store_url.as_deref().unwrap_or("unset"),
        archive_dir = ?cfg.archive_dir,
        seeded_cells = ?seeded.cells,
        seeded_history = ?seeded.history,
        archives,
        cooldown_ms = cfg.cooldown_ms,
        "starting canvas-server"
    );
    metrics::BOOT_COUNTER.inc();

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.abort();
    state.canvas.shutdown().await;
    info!("canvas-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown requested");
}
