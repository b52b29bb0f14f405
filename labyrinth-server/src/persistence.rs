//! On-disk state: player records, the maze snapshot and the chat log, all
//! under the data directory. Before a file is overwritten a timestamped
//! copy goes to `backups/`. Failures in here are reported upward and logged,
//! they never take the server down.

use crate::registry::PlayerRecord;
use anyhow::{Context, Result};
use protocol::MazeData;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const PLAYERS_FILE: &str = "players.json";
const MAZE_FILE: &str = "maze_data.json";
const CHAT_FILE: &str = "chat_log.txt";
const BACKUP_DIR: &str = "backups";

/// How many chat lines the in-memory tail keeps.
const CHAT_MEMORY_LINES: usize = 500;

pub struct Persistence {
    data_dir: PathBuf,
    /// Recent chat lines for quick inspection, the full history is on disk.
    chat_tail: Mutex<VecDeque<String>>,
}

impl Persistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Persistence {
            data_dir: data_dir.into(),
            chat_tail: Mutex::new(VecDeque::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Creates the data and backup directories.
    pub async fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating data directory {:?}", self.data_dir))?;
        fs::create_dir_all(self.data_dir.join(BACKUP_DIR))
            .await
            .context("creating backup directory")?;
        Ok(())
    }

    /// Loads the durable player records; a missing file means a fresh server.
    pub async fn load_players(&self) -> Result<Vec<PlayerRecord>> {
        let path = self.data_dir.join(PLAYERS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {path:?}"))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {path:?}"))
    }

    pub async fn save_players(&self, records: &[PlayerRecord]) -> Result<()> {
        let encoded = serde_json::to_string_pretty(records).context("encoding player records")?;
        self.backup_then_write(PLAYERS_FILE, encoded.as_bytes()).await
    }

    /// The persisted maze, or `None` when the generator has to run.
    pub async fn load_maze(&self) -> Result<Option<MazeData>> {
        let path = self.data_dir.join(MAZE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {path:?}"))?;
        let maze = serde_json::from_str(&raw).with_context(|| format!("parsing {path:?}"))?;
        Ok(Some(maze))
    }

    pub async fn save_maze(&self, maze: &MazeData) -> Result<()> {
        let encoded = serde_json::to_string(maze).context("encoding maze")?;
        self.backup_then_write(MAZE_FILE, encoded.as_bytes()).await
    }

    /// Appends one line to the chat log and the in-memory tail.
    pub async fn append_chat(&self, sender: &str, message: &str) {
        let stamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{stamp}] {sender}: {message}");
        {
            let mut tail = self.chat_tail.lock().await;
            if tail.len() == CHAT_MEMORY_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        let path = self.data_dir.join(CHAT_FILE);
        let result = async {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(err) = result {
            tracing::warn!(?err, "Could not append to the chat log.");
        }
    }

    pub async fn chat_tail(&self) -> Vec<String> {
        self.chat_tail.lock().await.iter().cloned().collect()
    }

    /// Copies the current file into `backups/` with a timestamp, then writes
    /// the new content.
    async fn backup_then_write(&self, file_name: &str, content: &[u8]) -> Result<()> {
        let path = self.data_dir.join(file_name);
        if path.exists() {
            let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
            let backup_name = format!("{file_name}.{stamp}");
            let backup_path = self.data_dir.join(BACKUP_DIR).join(backup_name);
            if let Err(err) = fs::copy(&path, &backup_path).await {
                tracing::warn!(?err, file_name, "Backup copy failed, writing anyway.");
            }
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("writing {path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PlayerRegistry;

    fn scratch() -> (tempfile::TempDir, Persistence) {
        let dir = tempfile::tempdir().unwrap();
        let persistence = Persistence::new(dir.path());
        (dir, persistence)
    }

    #[tokio::test]
    async fn missing_files_mean_a_fresh_start() {
        let (_dir, persistence) = scratch();
        persistence.ensure_layout().await.unwrap();
        assert!(persistence.load_players().await.unwrap().is_empty());
        assert!(persistence.load_maze().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn players_round_trip_through_disk() {
        let (_dir, persistence) = scratch();
        persistence.ensure_layout().await.unwrap();
        let mut registry = PlayerRegistry::new();
        let id = registry
            .register_or_resolve("aa:bb:cc:dd:ee:ff", "Alice")
            .unwrap();
        persistence.save_players(&registry.records()).await.unwrap();
        let loaded = persistence.load_players().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].player_id, id);
    }

    #[tokio::test]
    async fn overwriting_leaves_a_backup_behind() {
        let (dir, persistence) = scratch();
        persistence.ensure_layout().await.unwrap();
        persistence.save_players(&[]).await.unwrap();
        persistence.save_players(&[]).await.unwrap();
        let backups: Vec<_> = std::fs::read_dir(dir.path().join(BACKUP_DIR))
            .unwrap()
            .collect();
        assert!(!backups.is_empty());
    }

    #[tokio::test]
    async fn chat_lines_land_in_file_and_tail() {
        let (dir, persistence) = scratch();
        persistence.ensure_layout().await.unwrap();
        persistence.append_chat("SYSTEM", "server up").await;
        persistence.append_chat("PLAYER_000001", "hello").await;
        let tail = persistence.chat_tail().await;
        assert_eq!(tail.len(), 2);
        let on_disk = std::fs::read_to_string(dir.path().join(CHAT_FILE)).unwrap();
        assert!(on_disk.contains("server up"));
        assert!(on_disk.contains("PLAYER_000001: hello"));
    }
}
