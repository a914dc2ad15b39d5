#![allow(dead_code)]

mod color;
mod config;
mod protocol;
mod rate_limit;
mod routes;
mod services;
mod state;
mod validate;

use std::net::SocketAddr;

use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let port: u16 = config::env_parse("PORT", 8080);
    let config = config::GlobalConfig::from_env();
    let state = state::AppState::new(config);

    // Sweepers exit at their next tick once the shutdown signal flips.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweepers = services::sweeper::spawn_sweepers(state.clone(), shutdown_rx);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "drawboard listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .expect("server failed");

    for sweeper in sweepers {
        let _ = sweeper.await;
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
