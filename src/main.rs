use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tracing::info;

use nublado_controller::config::Config;
use nublado_controller::context::ProcessContext;
use nublado_controller::http;

/// Default location of the controller configuration, mounted from a
/// ConfigMap.
const DEFAULT_CONFIG_PATH: &str = "/etc/nublado/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().json().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Arc::new(Config::from_file(&config_path).context("loading configuration")?);
    let port = config.port;

    let context = Arc::new(ProcessContext::new(config).await.context("initializing services")?);
    context
        .start_background_services()
        .await
        .context("starting background services")?;

    let app = http::build_router(context.clone());
    let listener = TcpListener::bind(("0.0.0.0", port)).await.context("binding listener")?;
    info!("Listening on port {port}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    context.stop_background_services().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }
}
