//! 分類APIのHTTPサーバー

pub mod routes;
pub mod state;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, SharedState};

/// 予測アップロードの上限サイズ
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(routes::root))
        .route("/health", get(routes::health))
        .route("/predict", post(routes::predict))
        .route("/analytics", get(routes::analytics))
        .with_state(state)
        .layer(axum::extract::DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// サーバーを起動し、終了するまで待つ
pub async fn serve(state: SharedState, host: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let app = router(state);
    tracing::info!("Starting server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
