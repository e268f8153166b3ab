//! Main Entrypoint for the Voxrelay Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the upstream dialogue turn client.
//! 3. Starting the optional button-edge source.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tokio::io::BufReader;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use voxrelay_core::turn_client::{DialogueClient, TurnStream};
use voxrelay_relay::{
    button,
    config::{ButtonSource, Config},
    router::create_router,
    state::AppState,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 2. Initialize the Upstream Client ---
    let turns: Arc<dyn TurnStream> = Arc::new(DialogueClient::new(
        config.dialogue_base_url.clone(),
        config.dialogue_project_id.clone(),
        config.dialogue_api_key.clone(),
    ));
    let app_state = Arc::new(AppState::new(config.clone(), turns));

    // --- 3. Button Source ---
    if config.button_source == ButtonSource::Stdin {
        info!("Reading button levels from stdin");
        button::spawn_line_source(
            BufReader::new(tokio::io::stdin()),
            app_state.buttons.clone(),
        );
    }

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        upstream = %config.dialogue_base_url,
        project = %config.dialogue_project_id,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
