//! Durable player identities. Runtime match state lives in the engine; this
//! keeps what survives across sessions: the record file, the fingerprint and
//! cookie indexes and the online set.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One durable player record as it appears in `players.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub player_id: String,
    pub fingerprint: String,
    pub cookie: String,
    #[serde(default)]
    pub total_coins: u64,
    #[serde(default)]
    pub games_played: u32,
    #[serde(default)]
    pub games_won: u32,
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub online: bool,
}

/// Outcome of a login: a second login for the same player supersedes the
/// first session, the dispatcher closes the old connection.
#[derive(Debug, PartialEq, Eq)]
pub struct LoginOutcome {
    pub superseded: bool,
}

pub struct PlayerRegistry {
    records: HashMap<String, PlayerRecord>,
    by_fingerprint: HashMap<String, String>,
    by_cookie: HashMap<String, String>,
}

/// Accepts only the canonical 17-character hex fingerprint, six two-digit
/// groups joined by `:` or `-`, the same separator throughout.
pub fn fingerprint_is_valid(fingerprint: &str) -> bool {
    let bytes = fingerprint.as_bytes();
    if bytes.len() != 17 {
        return false;
    }
    let separator = bytes[2];
    if separator != b':' && separator != b'-' {
        return false;
    }
    for (index, byte) in bytes.iter().enumerate() {
        if index % 3 == 2 {
            if *byte != separator {
                return false;
            }
        } else if !byte.is_ascii_hexdigit() {
            return false;
        }
    }
    true
}

impl PlayerRegistry {
    pub fn new() -> Self {
        PlayerRegistry {
            records: HashMap::new(),
            by_fingerprint: HashMap::new(),
            by_cookie: HashMap::new(),
        }
    }

    /// Rebuilds the registry from persisted records. Everyone starts
    /// offline, whatever the file claims.
    pub fn from_records(records: Vec<PlayerRecord>) -> Self {
        let mut registry = PlayerRegistry::new();
        for mut record in records {
            record.online = false;
            registry.index(&record);
            registry.records.insert(record.player_id.clone(), record);
        }
        registry
    }

    /// The records in a stable order, ready for `players.json`.
    pub fn records(&self) -> Vec<PlayerRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.player_id.cmp(&b.player_id));
        records
    }

    fn index(&mut self, record: &PlayerRecord) {
        if !record.fingerprint.is_empty() {
            self.by_fingerprint
                .insert(record.fingerprint.clone(), record.player_id.clone());
        }
        if !record.cookie.is_empty() {
            self.by_cookie
                .insert(record.cookie.clone(), record.player_id.clone());
        }
    }

    /// Resolves an identity by fingerprint first, cookie second; only when
    /// neither index knows the caller a fresh identity is minted. Calling
    /// twice with the same inputs therefore returns the same player.
    pub fn register_or_resolve(&mut self, fingerprint: &str, cookie: &str) -> Result<String, String> {
        if !fingerprint_is_valid(fingerprint) {
            return Err(format!("malformed fingerprint {fingerprint:?}"));
        }
        if let Some(player_id) = self.by_fingerprint.get(fingerprint) {
            return Ok(player_id.clone());
        }
        if let Some(player_id) = self.by_cookie.get(cookie) {
            return Ok(player_id.clone());
        }
        let player_id = self.mint_player_id();
        let record = PlayerRecord {
            player_id: player_id.clone(),
            fingerprint: fingerprint.to_string(),
            cookie: cookie.to_string(),
            total_coins: 0,
            games_played: 0,
            games_won: 0,
            last_login_at: None,
            online: false,
        };
        self.index(&record);
        self.records.insert(player_id.clone(), record);
        tracing::info!(player_id, "Minted new player identity.");
        Ok(player_id)
    }

    fn mint_player_id(&self) -> String {
        let mut rng = rand::thread_rng();
        loop {
            let candidate = format!("PLAYER_{:06}", rng.gen_range(0..1_000_000));
            if !self.records.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Marks the record online and stamps the login time.
    pub fn login(&mut self, player_id: &str) -> Result<LoginOutcome, String> {
        let Some(record) = self.records.get_mut(player_id) else {
            return Err(format!("unknown player {player_id}"));
        };
        let superseded = record.online;
        record.online = true;
        record.last_login_at = Some(Utc::now());
        if !superseded {
            record.games_played += 1;
        }
        Ok(LoginOutcome { superseded })
    }

    pub fn logout(&mut self, player_id: &str) {
        if let Some(record) = self.records.get_mut(player_id) {
            record.online = false;
        }
    }

    pub fn get(&self, player_id: &str) -> Option<&PlayerRecord> {
        self.records.get(player_id)
    }

    pub fn is_valid(&self, player_id: &str) -> bool {
        self.records.contains_key(player_id)
    }

    /// Replaces a record wholesale, refreshing the secondary indexes.
    pub fn update(&mut self, player_id: &str, record: PlayerRecord) -> Result<(), String> {
        if record.player_id != player_id {
            return Err("record id does not match".into());
        }
        if !self.records.contains_key(player_id) {
            return Err(format!("unknown player {player_id}"));
        }
        self.index(&record);
        self.records.insert(player_id.to_string(), record);
        Ok(())
    }

    /// Adds to the durable coin total, used by the operator paths.
    pub fn add_total_coins(&mut self, player_id: &str, amount: i64) -> Result<u64, String> {
        let Some(record) = self.records.get_mut(player_id) else {
            return Err(format!("unknown player {player_id}"));
        };
        record.total_coins = record.total_coins.saturating_add_signed(amount);
        Ok(record.total_coins)
    }

    pub fn set_total_coins(&mut self, player_id: &str, amount: u64) -> Result<(), String> {
        let Some(record) = self.records.get_mut(player_id) else {
            return Err(format!("unknown player {player_id}"));
        };
        record.total_coins = amount;
        Ok(())
    }

    pub fn record_win(&mut self, player_id: &str) {
        if let Some(record) = self.records.get_mut(player_id) {
            record.games_won += 1;
        }
    }

    pub fn online(&self) -> Vec<String> {
        let mut online: Vec<_> = self
            .records
            .values()
            .filter(|r| r.online)
            .map(|r| r.player_id.clone())
            .collect();
        online.sort();
        online
    }

    pub fn total_players(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "aa:bb:cc:dd:ee:ff";

    #[test]
    fn fingerprint_validation_is_strict() {
        assert!(fingerprint_is_valid("aa:bb:cc:dd:ee:ff"));
        assert!(fingerprint_is_valid("AA-BB-CC-DD-EE-FF"));
        assert!(fingerprint_is_valid("01:23:45:67:89:ab"));
        // Mixed separators, wrong length, bad digits.
        assert!(!fingerprint_is_valid("aa:bb-cc:dd:ee:ff"));
        assert!(!fingerprint_is_valid("aa:bb:cc:dd:ee"));
        assert!(!fingerprint_is_valid("aa:bb:cc:dd:ee:fg"));
        assert!(!fingerprint_is_valid("aa.bb.cc.dd.ee.ff"));
        assert!(!fingerprint_is_valid(""));
    }

    #[test]
    fn register_or_resolve_is_idempotent() {
        let mut registry = PlayerRegistry::new();
        let first = registry.register_or_resolve(FP, "Alice").unwrap();
        let second = registry.register_or_resolve(FP, "Alice").unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.total_players(), 1);
        assert!(first.starts_with("PLAYER_"));
        assert_eq!(first.len(), "PLAYER_".len() + 6);
    }

    #[test]
    fn cookie_resolves_when_the_fingerprint_moved() {
        let mut registry = PlayerRegistry::new();
        let original = registry.register_or_resolve(FP, "Alice").unwrap();
        // Same cookie from a different machine maps to the same identity.
        let resolved = registry
            .register_or_resolve("11:22:33:44:55:66", "Alice")
            .unwrap();
        assert_eq!(original, resolved);
    }

    #[test]
    fn malformed_fingerprints_never_mint() {
        let mut registry = PlayerRegistry::new();
        assert!(registry.register_or_resolve("nonsense", "c").is_err());
        assert_eq!(registry.total_players(), 0);
    }

    #[test]
    fn second_login_reports_superseded() {
        let mut registry = PlayerRegistry::new();
        let id = registry.register_or_resolve(FP, "Alice").unwrap();
        let outcome = registry.login(&id).unwrap();
        assert!(!outcome.superseded);
        let outcome = registry.login(&id).unwrap();
        assert!(outcome.superseded);
        assert_eq!(registry.online(), vec![id.clone()]);
        registry.logout(&id);
        assert!(registry.online().is_empty());
    }

    #[test]
    fn update_replaces_the_record_and_reindexes() {
        let mut registry = PlayerRegistry::new();
        let id = registry.register_or_resolve(FP, "Alice").unwrap();
        let mut record = registry.get(&id).unwrap().clone();
        record.fingerprint = "11:22:33:44:55:66".to_string();
        record.total_coins = 42;
        registry.update(&id, record).unwrap();
        assert_eq!(registry.get(&id).unwrap().total_coins, 42);
        // The new fingerprint resolves to the same identity now.
        let resolved = registry
            .register_or_resolve("11:22:33:44:55:66", "elsewhere")
            .unwrap();
        assert_eq!(resolved, id);
        // A record under a foreign id is rejected.
        let stray = registry.get(&id).unwrap().clone();
        assert!(registry.update("PLAYER_999999", stray).is_err());
    }

    #[test]
    fn records_round_trip_and_come_back_offline() {
        let mut registry = PlayerRegistry::new();
        let id = registry.register_or_resolve(FP, "Alice").unwrap();
        registry.login(&id).unwrap();
        let encoded = serde_json::to_string(&registry.records()).unwrap();
        let decoded: Vec<PlayerRecord> = serde_json::from_str(&encoded).unwrap();
        let restored = PlayerRegistry::from_records(decoded);
        assert!(restored.is_valid(&id));
        assert!(restored.online().is_empty());
        // The indexes survived the round trip.
        let mut again = restored;
        assert_eq!(again.register_or_resolve(FP, "other").unwrap(), id);
    }
}
