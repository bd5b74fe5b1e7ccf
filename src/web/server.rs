use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;

use crate::config::Settings;
use crate::session::registry::SessionRegistry;
use crate::status::StatusRecord;
use crate::store::Store;

/// State shared across all web request handlers
pub struct WebState {
    pub registry: Arc<SessionRegistry>,
    pub store: Arc<Store>,
    pub status_rx: watch::Receiver<Arc<Vec<StatusRecord>>>,
    pub settings: Arc<Settings>,
    pub token: String,
}

/// Create the axum router for the HTTP/WS boundary
pub fn create_router(state: Arc<WebState>) -> Router {
    Router::new()
        .merge(super::api::api_routes())
        .merge(super::terminal::ws_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the web server
pub async fn start_web_server(host: &str, port: u16, state: Arc<WebState>) -> Result<()> {
    let app = create_router(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, "Web server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

pub fn generate_token() -> String {
    use base64::Engine;
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
