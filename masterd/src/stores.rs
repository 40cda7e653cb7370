use std::collections::HashMap;
use std::sync::Mutex;

use masterlib::error::StoreError;
use masterlib::gateway::{CredentialVerifier, GameStats, LevelInfo, PlayerProfile, StatsStore};
use rusqlite::Connection as SqliteConnection;
use rusqlite::params;

/// SQLite-backed `StatsStore`, the single-file backend selected by
/// `stats_backend = sqlite` in the config file.
pub struct SqliteStatsStore {
    conn: Mutex<SqliteConnection>,
}

impl SqliteStatsStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = SqliteConnection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS game_stats (
                server_name TEXT, server_ip TEXT, game_type TEXT, level_name TEXT,
                is_official INTEGER, player_count INTEGER, duration_secs INTEGER
            );
            CREATE TABLE IF NOT EXISTS achievements (
                achievement_id INTEGER, player_nick TEXT, server_name TEXT, server_addr TEXT
            );
            CREATE TABLE IF NOT EXISTS level_info (
                hash TEXT, level_name TEXT, creator TEXT, game_type TEXT,
                has_level_gen INTEGER, team_count INTEGER, winning_score INTEGER, duration_secs INTEGER
            );",
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(SqliteStatsStore { conn: Mutex::new(conn) })
    }
}

impl StatsStore for SqliteStatsStore {
    fn insert_stats(&self, stats: &GameStats) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO game_stats (server_name, server_ip, game_type, level_name, is_official, player_count, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                stats.server_name,
                stats.server_ip,
                stats.game_type,
                stats.level_name,
                stats.is_official,
                stats.player_count,
                stats.duration_secs,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn insert_achievement(&self, achievement_id: u8, player_nick: &str, server_name: &str, server_addr: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO achievements (achievement_id, player_nick, server_name, server_addr) VALUES (?1, ?2, ?3, ?4)",
            params![achievement_id, player_nick, server_name, server_addr],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn insert_level_info(&self, info: &LevelInfo) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO level_info (hash, level_name, creator, game_type, has_level_gen, team_count, winning_score, duration_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                info.hash,
                info.level_name,
                info.creator,
                info.game_type,
                info.has_level_gen,
                info.team_count,
                info.winning_score,
                info.duration_secs,
            ],
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    fn top_players(&self, view: &str, order_column: &str, limit: usize) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        // `view`/`order_column` come only from the fixed list in
        // `highscore::QUERIES`, never from user input, so interpolating
        // them into the query text (sqlite views can't be bound as
        // parameters) carries no injection risk.
        let sql = format!("SELECT name, {order_column} FROM {view} ORDER BY {order_column} DESC LIMIT ?1");
        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(_) => return Ok(Vec::new()),
        };
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let name: String = row.get(0)?;
                let score: i64 = row.get(1)?;
                Ok((name, score.to_string()))
            })
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::Backend(e.to_string()))?);
        }
        Ok(out)
    }
}

/// MySQL-backed `StatsStore`. The MySQL wire protocol itself is out of
/// scope; this stub exists so the config's backend selector routes to
/// something real rather than silently falling through to sqlite.
pub struct MysqlStatsStore;

impl StatsStore for MysqlStatsStore {
    fn insert_stats(&self, _stats: &GameStats) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    fn insert_achievement(&self, _achievement_id: u8, _player_nick: &str, _server_name: &str, _server_addr: &str) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    fn insert_level_info(&self, _info: &LevelInfo) -> Result<(), StoreError> {
        Err(StoreError::Unsupported)
    }

    fn top_players(&self, _view: &str, _order_column: &str, _limit: usize) -> Result<Vec<(String, String)>, StoreError> {
        Err(StoreError::Unsupported)
    }
}

/// In-memory `CredentialVerifier`, standing in for the PHPBB3 forum SQL
/// lookup (out of scope). Loaded once at startup from the forum-credential
/// config block's table of name/password-hash pairs.
pub struct TableVerifier {
    users: HashMap<String, String>,
    profiles: HashMap<String, PlayerProfile>,
}

impl TableVerifier {
    pub fn new(users: HashMap<String, String>) -> Self {
        TableVerifier { users, profiles: HashMap::new() }
    }

    pub fn with_profile(mut self, name: impl Into<String>, profile: PlayerProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }
}

impl CredentialVerifier for TableVerifier {
    fn verify(&self, handle: &str, password: &str) -> masterlib::gateway::AuthOutcome {
        use masterlib::gateway::AuthOutcome;
        if handle.trim().is_empty() {
            return AuthOutcome::InvalidUsername;
        }
        match self.users.get(handle) {
            Some(expected) if expected == password => AuthOutcome::Authenticated,
            Some(_) => AuthOutcome::WrongPassword,
            None => AuthOutcome::UnknownUser,
        }
    }

    fn fetch_profile(&self, handle: &str) -> PlayerProfile {
        self.profiles.get(handle).cloned().unwrap_or_default()
    }
}
