use anyhow::{Context, Result};
use std::{fs, io::ErrorKind};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use transfer_hub::{app, config::AppConfig, db, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    logging::init(cfg.log_json);
    tracing::info!("Starting transfer-hub with config: {:?}", cfg);

    // --- Ensure blob directory exists ---
    if !cfg.blob_dir.exists() {
        fs::create_dir_all(&cfg.blob_dir)
            .with_context(|| format!("creating blob directory {:?}", cfg.blob_dir))?;
        tracing::info!("Created blob directory at {:?}", cfg.blob_dir);
    }

    // --- Initialize SQLite connection ---
    let pool = db::connect(&cfg.database_url, cfg.max_connections)
        .await
        .with_context(|| format!("connecting to {}", cfg.database_url))?;
    db::migrate(&pool).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let components = app::assemble(&cfg, pool);
    let shutdown = CancellationToken::new();

    // --- Background loops ---
    let cleanup = tokio::spawn(
        components
            .state
            .cleanup
            .clone()
            .run(cfg.cleanup.interval, shutdown.clone()),
    );
    let worker = components
        .worker
        .map(|worker| tokio::spawn(worker.run(shutdown.clone())));
    if worker.is_none() {
        tracing::info!("mail sender not configured; share notifications disabled");
    }

    let mut failures = components.failures;
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            tracing::error!(
                task = failure.task,
                subject = %failure.subject,
                error = %failure.error,
                "background task gave up"
            );
        }
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let router = app::router(components.state);
    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await?;

    // --- Drain ---
    shutdown.cancel();
    components.tasks.wait_idle().await;
    let _ = cleanup.await;
    if let Some(worker) = worker {
        let _ = worker.await;
    }
    tracing::info!("Shutdown complete.");

    Ok(())
}
