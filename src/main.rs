use std::sync::Arc;

use clap::Parser;
use tracing::info;

use fitzpatrick_serve::config::ServiceConfig;
use fitzpatrick_serve::device::Device;
use fitzpatrick_serve::loader::load_artifacts;
use fitzpatrick_serve::server::{router, ServiceContext};
use fitzpatrick_serve::utils::{ort_init, tracing_subscriber_init};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber_init();
    let config = ServiceConfig::parse();

    let device = Device::resolve(config.device);
    info!("Using device: {device}");
    ort_init(device)?;

    let context = ServiceContext::new()
        .with_static_dir(&config.static_dir)
        .with_default_top_k(config.top_k)
        .with_max_upload_bytes(config.max_upload_bytes);

    // Loading must finish before the listener exists; a failure here aborts startup.
    let paths = config.artifact_paths();
    let classifier = tokio::task::spawn_blocking(move || load_artifacts(&paths, device)).await??;
    context.install(classifier)?;

    let app = router(Arc::new(context));
    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
