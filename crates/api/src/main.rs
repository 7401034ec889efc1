use std::sync::Arc;

use anyhow::Context;

use jobq_infra::config::Settings;

fn main() -> anyhow::Result<()> {
    jobq_observability::init();

    let settings = Settings::from_env().context("invalid configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(settings.blocking_threads)
        .build()
        .context("failed to build tokio runtime")?
        .block_on(serve(settings))
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let services = Arc::new(jobq_api::app::services::build_services(&settings).await?);
    let app = jobq_api::app::build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = ?services.backend(),
        embedded_workers = settings.embedded_workers,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    services.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
