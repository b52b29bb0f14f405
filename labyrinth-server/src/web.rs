//! The HTTP side: the two status endpoints plus the static web root. The
//! game itself never travels over this router, it lives on its own port.

use crate::broadcaster::Broadcaster;
use crate::config::ServerConfig;
use crate::registry::PlayerRegistry;
use axum::Router;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tower_http::services::ServeDir;

pub struct HttpState {
    pub config: ServerConfig,
    pub websocket_port: u16,
    pub registry: Arc<Mutex<PlayerRegistry>>,
    pub broadcaster: Arc<Broadcaster>,
    pub started_at: Instant,
}

/// Builds the router: `/api/config`, `/api/status` and the static fallback,
/// all behind the traversal guard.
pub fn router(state: Arc<HttpState>, web_root: PathBuf) -> Router {
    Router::new()
        .route("/api/config", get(api_config))
        .route("/api/status", get(api_status))
        .fallback_service(ServeDir::new(web_root))
        .layer(middleware::from_fn(reject_traversal))
        .with_state(state)
}

/// Any `..` segment, encoded or not, is answered with 403 before the file
/// service gets a look at the path.
async fn reject_traversal(request: Request, next: Next) -> Response {
    let path = request.uri().path();
    let decoded = percent_decode(path);
    if decoded.split(['/', '\\']).any(|segment| segment == "..") {
        return StatusCode::FORBIDDEN.into_response();
    }
    next.run(request).await
}

/// Just enough percent decoding to see dots hidden as %2e.
fn percent_decode(path: &str) -> String {
    let mut decoded = String::with_capacity(path.len());
    let bytes = path.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let Ok(value) = u8::from_str_radix(&path[index + 1..index + 3], 16) {
                decoded.push(value as char);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index] as char);
        index += 1;
    }
    decoded
}

async fn api_config(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    Json(json!({
        "websocketPort": state.websocket_port,
        "gameVersion": state.config.game_version,
        "serverName": state.config.server_name,
        "mazeSize": {
            "width": state.config.maze_width,
            "height": state.config.maze_height,
            "layers": state.config.maze_layers,
        },
        "maxPlayers": state.config.max_players,
    }))
}

async fn api_status(State(state): State<Arc<HttpState>>) -> Json<serde_json::Value> {
    let (total, online) = {
        let registry = state.registry.lock().await;
        (registry.total_players(), registry.online())
    };
    Json(json!({
        "status": "running",
        "connectedPlayers": state.broadcaster.connected_count(),
        "totalPlayers": total,
        "onlinePlayers": online,
        "uptime": state.started_at.elapsed().as_secs(),
        "serverTime": chrono::Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_segments_are_spotted() {
        assert!(percent_decode("/%2e%2e/secret").contains(".."));
        assert!(percent_decode("/plain/path").split('/').all(|s| s != ".."));
    }
}
