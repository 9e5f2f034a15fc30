//! REST API module
//!
//! File transfer endpoints under `/files`, the text pad under `/text`, and
//! optionally the static web client for everything else.

mod error;
mod files;
mod text;
mod types;

use crate::api::AppState;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::services::ServeDir;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

pub use files::file_routes;
pub use text::text_routes;

/// Upload bodies are streamed and never hit this limit; it only bounds JSON
/// request bodies.
const JSON_BODY_LIMIT: usize = 256 * 1024;

pub const METADATA_HEADER: &str = "x-file-metadata";

pub fn router(state: AppState) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let mut app = Router::new().merge(file_routes()).merge(text_routes());

    if let Some(dir) = &state.config.static_dir {
        tracing::info!("serving web client from {}", dir.display());
        app = app
            .route("/", get(|| async { Redirect::temporary("/pad.html") }))
            .fallback_service(ServeDir::new(dir));
    }

    app = app.layer(DefaultBodyLimit::max(JSON_BODY_LIMIT));

    if let Some(cors) = cors_layer(&state.config.cors_origins) {
        app = app.layer(cors);
    }

    app
        // Request ID: Generate UUID, set on request, propagate to response
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(trace_layer)
        .with_state(state)
}

/// `None` when no origins are configured; the API is then same-origin only.
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    if origins.is_empty() {
        return None;
    }

    tracing::info!("CORS allowed origins: {:?}", origins);

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::RANGE,
                HeaderName::from_static(METADATA_HEADER),
            ])
            .expose_headers([
                HeaderName::from_static("x-request-id"),
                header::CONTENT_RANGE,
                header::ACCEPT_RANGES,
            ]),
    )
}

pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("REST listening on {}", listener.local_addr()?);

    // Graceful shutdown: wait for SIGTERM or SIGINT
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
