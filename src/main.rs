//! Tender backend server.
//!
//! Hosts the auction engine behind the HTTP façade. The server starts
//! without a session; `POST /system/boot` creates the exchange and arms the
//! round timers. The warehouse backend is selected from the environment
//! (`DB_DRIVER=sqlite` or in-memory).

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tender_backend::api;
use tender_backend::middleware::request_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    init_tracing();

    info!("tender backend starting");

    let state = api::AppState::default();
    let app = api::router(state.clone())
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn_with_state(state, request_logging));

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("listening on {addr}");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tender_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
