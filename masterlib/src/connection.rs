use std::net::SocketAddr;

/// Stable identity for a `Connection`. Never reused while any index
/// (registry, rendezvous table, worker task) could still reference it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Achievement bitset. `BADGE_COUNT` bounds the valid bit range; an
/// achievement id past it is rejected rather than silently OR'd in.
pub type Badges = u32;
pub const BADGE_COUNT: u8 = 32;
pub const NO_BADGES: Badges = 0;

#[derive(Debug, Clone, Default)]
pub struct ServerState {
    pub description: String,
    pub level_name: String,
    pub level_type: String,
    pub bot_count: u32,
    pub player_count: u32,
    pub max_players: u32,
    pub info_flags: u32,
}

#[derive(Debug, Clone)]
pub struct ClientState {
    pub player_id: u64,
    pub authenticated: bool,
    pub is_master_admin: bool,
    pub is_debug_client: bool,
    pub is_in_global_chat: bool,
    pub badges: Badges,
    pub games_played: u16,
    /// Set when a delayed `LeaveGlobalChat` is pending; `None` once fired
    /// or cancelled by a rejoin.
    pub leave_chat_at: Option<u64>,
    pub chat_too_fast: bool,
    pub pending_connect_ids: Vec<u64>,
}

impl Default for ClientState {
    fn default() -> Self {
        ClientState {
            player_id: 0,
            authenticated: false,
            is_master_admin: false,
            is_debug_client: false,
            is_in_global_chat: false,
            badges: NO_BADGES,
            games_played: 0,
            leave_chat_at: None,
            chat_too_fast: false,
            pending_connect_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RoleState {
    Server(ServerState),
    Client(ClientState),
    Anonymous,
}

/// One accepted transport session. Exactly one of `server`/`client`
/// membership in the registry holds at a time — `role` mirrors which, but
/// the registry is the source of truth for membership.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub internal_addr: Option<SocketAddr>,
    pub name: String,
    pub master_protocol_version: u32,
    pub cs_protocol_version: u32,
    pub client_build: u32,
    pub role: RoleState,
    pub strikes: u32,
    pub last_activity_ms: u64,
    pub logging_status: String,
    /// Hidden from server/player list queries and chat relay. Applies to
    /// both server and client roles (`dropserver`/`hideplayer` in chat
    /// admin commands), so it lives on the connection, not the role.
    pub is_ignored_from_list: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr) -> Self {
        Connection {
            id,
            addr,
            internal_addr: None,
            name: String::new(),
            master_protocol_version: 0,
            cs_protocol_version: 0,
            client_build: 0,
            role: RoleState::Anonymous,
            strikes: 0,
            last_activity_ms: 0,
            logging_status: "Not_Connected".to_string(),
            is_ignored_from_list: false,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.role, RoleState::Server(_))
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, RoleState::Client(_))
    }

    pub fn server_state(&self) -> Option<&ServerState> {
        match &self.role {
            RoleState::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn server_state_mut(&mut self) -> Option<&mut ServerState> {
        match &mut self.role {
            RoleState::Server(s) => Some(s),
            _ => None,
        }
    }

    pub fn client_state(&self) -> Option<&ClientState> {
        match &self.role {
            RoleState::Client(c) => Some(c),
            _ => None,
        }
    }

    pub fn client_state_mut(&mut self) -> Option<&mut ClientState> {
        match &mut self.role {
            RoleState::Client(c) => Some(c),
            _ => None,
        }
    }
}

/// Trims whitespace and substitutes the default handle when blank, matching
/// the original `cleanName`.
pub fn clean_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        "ChumpChange".to_string()
    } else {
        trimmed.to_string()
    }
}
