use std::net::SocketAddr;

use model_serving_core::{build_app, build_state};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,model_serving_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = build_state();
    let cache = state.cache.clone();
    let log_pipeline = state.log_pipeline.clone();
    let app = build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving core listening");

    let shutdown_cache = cache.clone();
    let shutdown_log_pipeline = log_pipeline.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; draining process singletons");
            shutdown_cache.close_all().await;
            shutdown_log_pipeline.stop().await;
        })
        .await?;

    Ok(())
}
