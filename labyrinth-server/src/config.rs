//! Server settings from `config.json`. A missing file is written out with
//! defaults so operators have something to edit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub server_name: String,
    pub game_version: String,
    pub max_players: u32,
    pub maze_width: i32,
    pub maze_height: i32,
    pub maze_layers: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_name: "Labyrinth Server".to_string(),
            game_version: "1.0.0".to_string(),
            max_players: 50,
            maze_width: 50,
            maze_height: 50,
            maze_layers: 7,
        }
    }
}

/// Reads the configuration, creating it with defaults when absent.
pub async fn load_or_create(path: &Path) -> Result<ServerConfig> {
    if path.exists() {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {path:?}"))?;
        return serde_json::from_str(&raw).with_context(|| format!("parsing {path:?}"));
    }
    let config = ServerConfig::default();
    let encoded = serde_json::to_string_pretty(&config).context("encoding default config")?;
    fs::write(path, encoded)
        .await
        .with_context(|| format!("writing default {path:?}"))?;
    tracing::info!(?path, "Wrote default configuration.");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = load_or_create(&path).await.unwrap();
        assert_eq!(config.maze_width, 50);
        assert!(path.exists());
        // Second load reads the file we just wrote.
        let reloaded = load_or_create(&path).await.unwrap();
        assert_eq!(reloaded.server_name, config.server_name);
    }

    #[tokio::test]
    async fn edited_values_win_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"serverName":"Test Box","maxPlayers":4}"#).unwrap();
        let config = load_or_create(&path).await.unwrap();
        assert_eq!(config.server_name, "Test Box");
        assert_eq!(config.max_players, 4);
        assert_eq!(config.maze_layers, 7);
    }
}
