use crate::connection::Badges;
use crate::error::StoreError;

/// Outcome of a credential check against the external user database.
/// Named identically to the statuses the original PHPBB3 authenticator
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    CantConnect,
    UnknownUser,
    WrongPassword,
    InvalidUsername,
    UnknownStatus,
    Unsupported,
}

/// A player's authenticated profile, fetched only after a successful
/// credential check.
#[derive(Debug, Clone, Default)]
pub struct PlayerProfile {
    pub badges: Badges,
    pub games_played: u16,
    /// The user database's canonical spelling of the player's name, if it
    /// differs from what the client supplied at handshake (e.g. case).
    pub canonical_name: Option<String>,
}

/// Verifies name/password pairs against the external user database. Always
/// called from a worker task, never from the main loop.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, handle: &str, password: &str) -> AuthOutcome;
    fn fetch_profile(&self, handle: &str) -> PlayerProfile;
}

#[derive(Debug, Clone, Default)]
pub struct WeaponStats {
    pub weapon_type: u8,
    pub shots: u16,
    pub hits: u16,
}

#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    pub name: String,
    pub nonce: u64,
    pub is_authenticated: bool,
    pub is_robot: bool,
    pub game_result: String,
    pub points: i32,
    pub kills: i32,
    pub deaths: i32,
    pub suicides: i32,
    pub switched_team_count: i32,
    pub weapon_stats: Vec<WeaponStats>,
    pub is_admin: bool,
    pub is_level_changer: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TeamStats {
    pub color: String,
    pub name: String,
    pub score: i32,
    pub game_result: String,
    pub player_stats: Vec<PlayerStats>,
}

#[derive(Debug, Clone, Default)]
pub struct GameStats {
    pub server_name: String,
    pub server_ip: String,
    pub cs_protocol_version: u32,
    pub build_version: u32,
    pub game_type: String,
    pub level_name: String,
    pub is_official: bool,
    pub player_count: i32,
    pub duration_secs: i32,
    pub is_team_game: bool,
    pub is_tied: bool,
    pub team_stats: Vec<TeamStats>,
}

/// A versioned, opaque stats submission. Only `valid` and `version` are
/// interpreted by the dispatcher; the payload itself is trusted once valid.
#[derive(Debug, Clone, Default)]
pub struct VersionedGameStats {
    pub version: u8,
    pub valid: bool,
    pub stats: GameStats,
}

#[derive(Debug, Clone, Default)]
pub struct LevelInfo {
    pub hash: String,
    pub level_name: String,
    pub creator: String,
    pub game_type: String,
    pub has_level_gen: bool,
    pub team_count: u8,
    pub winning_score: i32,
    pub duration_secs: i32,
}

/// The persistent statistics store. Always called from a worker task.
pub trait StatsStore: Send + Sync {
    fn insert_stats(&self, stats: &GameStats) -> Result<(), StoreError>;
    fn insert_achievement(
        &self,
        achievement_id: u8,
        player_nick: &str,
        server_name: &str,
        server_addr: &str,
    ) -> Result<(), StoreError>;
    fn insert_level_info(&self, info: &LevelInfo) -> Result<(), StoreError>;
    /// Returns up to `limit` (name, score-as-string) pairs from the named
    /// view, ordered by `order_column` descending.
    fn top_players(
        &self,
        view: &str,
        order_column: &str,
        limit: usize,
    ) -> Result<Vec<(String, String)>, StoreError>;
}
