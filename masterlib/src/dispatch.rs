use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::connection::{Badges, ConnectionId};
use crate::context::MasterContext;
use crate::error::{rejection, DisconnectReason};
use crate::flood::check_activity_time;
use crate::gateway::{AuthOutcome, GameStats, LevelInfo, StatsStore, VersionedGameStats};
use crate::highscore::{HighScoreAction, HighScoreSnapshot, QUERIES};
use crate::rendezvous::ConnectRequest;
use crate::worker::WorkerTask;

/// Maximum number of addresses batched into one `QueryServersResponse`.
/// The retrieved source never pins a literal for this; fixed at 32 here
/// (see DESIGN.md).
pub const IP_MESSAGE_ADDRESS_COUNT: usize = 32;

pub const RENDEZVOUS_FLOOD_DELTA_MS: u64 = 2000;
pub const SERVER_STATUS_FLOOD_DELTA_MS: u64 = 4000;
pub const STATS_FLOOD_DELTA_MS: u64 = 6000;
pub const RENDEZVOUS_EXPIRY_MS: u64 = 5000;

/// What the caller should send back over the transport, and to whom. These
/// don't encode wire framing — the binary's transport layer turns each
/// variant into the matching RPC call.
pub enum QueryServersBatch {
    Response { query_id: u32, addresses: Vec<SocketAddr> },
}

/// Events produced by a worker task's `finish` that have to go back out to
/// one or more connections, collected on `MasterContext::outbound` since
/// `finish` has no direct return path to the RPC caller (see DESIGN.md).
#[derive(Debug)]
pub enum OutboundEvent {
    /// `SendHighScores` to one still-live waiter.
    HighScores { client: ConnectionId, snapshot: HighScoreSnapshot },
    /// An authenticated client's supplied name was replaced by its
    /// canonical one; anyone else currently in global chat with them needs
    /// `PlayerLeftGlobalChat(old_name)` followed by
    /// `PlayerJoinedGlobalChat(new_name)`.
    GlobalChatRenamed { recipients: Vec<ConnectionId>, old_name: String, new_name: String },
    /// `SetAuthenticated`/`SetAuthenticated_019` for a client whose auth
    /// result just came back. `games_played` is only meaningful (and only
    /// sent over the wire) for `Variant::V019`.
    SetAuthenticated {
        client: ConnectionId,
        status: AuthStatus,
        name: String,
        badges: Badges,
        games_played: u16,
        variant: SetAuthenticatedVariant,
    },
    /// The client failed the handshake's authentication check after having
    /// already been linked optimistically; tear the connection down.
    Disconnect { client: ConnectionId, reason: DisconnectReason },
}

/// The three statuses `SetAuthenticated` can carry, per spec.md §4.4/§7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated,
    Unauthenticated,
    Failed,
}

/// Which wire message to send: classic clients (master protocol ≤ 6) get
/// `SetAuthenticated`; newer ones (≥ 7) get the `_019` variant carrying
/// `gamesPlayed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAuthenticatedVariant {
    Classic,
    V019,
}

/// Master protocol at and above which `SetAuthenticated_019` (carrying
/// `gamesPlayed`) replaces the classic `SetAuthenticated` message.
pub const SET_AUTHENTICATED_019_PROTOCOL_VERSION: u32 = 7;

pub fn handle_query_servers(ctx: &MasterContext, asking_cs_version: u32, query_id: u32) -> Vec<QueryServersBatch> {
    let mut out = Vec::new();
    let mut batch = Vec::with_capacity(IP_MESSAGE_ADDRESS_COUNT);

    for server in ctx.registry.servers() {
        if server.is_ignored_from_list {
            continue;
        }
        if server.cs_protocol_version != asking_cs_version {
            continue;
        }
        batch.push(server.addr);
        if batch.len() == IP_MESSAGE_ADDRESS_COUNT {
            out.push(QueryServersBatch::Response { query_id, addresses: std::mem::take(&mut batch) });
        }
    }

    if !batch.is_empty() {
        out.push(QueryServersBatch::Response { query_id, addresses: std::mem::take(&mut batch) });
    }
    // Always terminate with an empty response: it's the only unambiguous
    // end-of-stream marker when the preceding batch was exactly full.
    out.push(QueryServersBatch::Response { query_id, addresses: Vec::new() });
    out
}

pub enum RendezvousOutcome {
    NoSuchHost,
    FloodControlled,
    Forwarded { host: ConnectionId, host_query_id: u32, candidates: Vec<SocketAddr>, params: Vec<u8> },
}

/// Up to three candidate addresses: apparent-port+1, apparent-port, and the
/// self-reported internal address if it differs from the apparent one.
fn candidate_addresses(apparent: SocketAddr, internal: Option<SocketAddr>) -> Vec<SocketAddr> {
    let mut candidates = Vec::with_capacity(3);
    let mut bumped = apparent;
    bumped.set_port(apparent.port().wrapping_add(1));
    candidates.push(bumped);
    candidates.push(apparent);
    if let Some(addr) = internal {
        if addr != apparent {
            candidates.push(addr);
        }
    }
    candidates
}

pub fn handle_request_arranged_connection(
    ctx: &mut MasterContext,
    initiator: ConnectionId,
    initiator_query_id: u32,
    remote_addr: SocketAddr,
    internal_addr: Option<SocketAddr>,
    params: Vec<u8>,
) -> RendezvousOutcome {
    let now_ms = ctx.now_ms();
    if let Some(conn) = ctx.registry.get_mut(initiator) {
        if !check_activity_time(conn, now_ms, RENDEZVOUS_FLOOD_DELTA_MS) {
            return RendezvousOutcome::FloodControlled;
        }
    }

    let host = match ctx.registry.find_server_by_addr(remote_addr) {
        Some(s) => s.id,
        None => return RendezvousOutcome::NoSuchHost,
    };

    let host_query_id = ctx.rendezvous.create(initiator, host, initiator_query_id, now_ms);
    let initiator_addr = ctx.registry.get(initiator).map(|c| c.addr);
    let candidates = match initiator_addr {
        Some(addr) => candidate_addresses(addr, internal_addr),
        None => Vec::new(),
    };

    RendezvousOutcome::Forwarded { host, host_query_id, candidates, params }
}

pub enum ArrangedConnectionReply {
    /// Initiator is gone; nothing to send.
    InitiatorGone,
    Accepted { initiator: ConnectionId, candidates: Vec<SocketAddr>, data: Vec<u8> },
    Rejected { initiator: ConnectionId, data: Vec<u8> },
}

pub fn handle_accept_arranged_connection(
    ctx: &mut MasterContext,
    host_query_id: u32,
    host_internal_addr: Option<SocketAddr>,
    data: Vec<u8>,
) -> Option<ArrangedConnectionReply> {
    let req = ctx.rendezvous.remove(host_query_id)?;
    let host_addr = ctx.registry.get(req.host).map(|c| c.addr);
    let candidates = match host_addr {
        Some(addr) => candidate_addresses(addr, host_internal_addr),
        None => Vec::new(),
    };
    if ctx.registry.get(req.initiator).is_none() {
        return Some(ArrangedConnectionReply::InitiatorGone);
    }
    Some(ArrangedConnectionReply::Accepted { initiator: req.initiator, candidates, data })
}

pub fn handle_reject_arranged_connection(
    ctx: &mut MasterContext,
    host_query_id: u32,
    data: Vec<u8>,
) -> Option<ArrangedConnectionReply> {
    let req = ctx.rendezvous.remove(host_query_id)?;
    if ctx.registry.get(req.initiator).is_none() {
        return Some(ArrangedConnectionReply::InitiatorGone);
    }
    Some(ArrangedConnectionReply::Rejected { initiator: req.initiator, data })
}

/// Sweeps expired rendezvous requests. Returns the live initiators to
/// notify with `ArrangedConnectionRejected(RequestTimedOut)`.
pub fn sweep_rendezvous_timeouts(ctx: &mut MasterContext) -> Vec<ConnectionId> {
    let now_ms = ctx.now_ms();
    let expired: Vec<ConnectRequest> = ctx.rendezvous.expire_older_than(now_ms, RENDEZVOUS_EXPIRY_MS);
    expired
        .into_iter()
        .filter(|r| ctx.registry.get(r.initiator).is_some())
        .map(|r| r.initiator)
        .collect()
}

pub fn no_such_host_message() -> &'static str {
    rejection::NO_SUCH_HOST
}

pub fn request_timed_out_message() -> &'static str {
    rejection::REQUEST_TIMED_OUT
}

#[allow(clippy::too_many_arguments)]
pub fn handle_update_server_status(
    ctx: &mut MasterContext,
    server: ConnectionId,
    level_name: String,
    level_type: String,
    bot_count: u32,
    player_count: u32,
    max_players: u32,
    info_flags: u32,
) -> Result<(), DisconnectReason> {
    let now_ms = ctx.now_ms();
    let conn = ctx.registry.get_mut(server).ok_or(DisconnectReason::BadLogin)?;
    if !conn.is_server() {
        return Err(DisconnectReason::BadLogin);
    }
    if !check_activity_time(conn, now_ms, SERVER_STATUS_FLOOD_DELTA_MS) {
        return Err(DisconnectReason::FloodControl);
    }

    let mut changed = false;
    if let Some(state) = conn.server_state_mut() {
        if state.level_name != level_name
            || state.level_type != level_type
            || state.bot_count != bot_count
            || state.player_count != player_count
            || state.max_players != max_players
            || state.info_flags != info_flags
        {
            state.level_name = level_name;
            state.level_type = level_type;
            state.bot_count = bot_count;
            state.player_count = player_count;
            state.max_players = max_players;
            state.info_flags = info_flags;
            changed = true;
        }
    }
    if changed {
        ctx.registry.mark_dirty();
    }
    Ok(())
}

pub fn handle_change_name(ctx: &mut MasterContext, server: ConnectionId, name: String) -> Result<(), DisconnectReason> {
    let conn = ctx.registry.get_mut(server).ok_or(DisconnectReason::BadLogin)?;
    if !conn.is_server() {
        return Err(DisconnectReason::BadLogin);
    }
    let cleaned = crate::connection::clean_name(&name);
    if conn.name != cleaned {
        conn.name = cleaned;
        ctx.registry.mark_dirty();
    }
    Ok(())
}

pub fn handle_server_description(ctx: &mut MasterContext, server: ConnectionId, description: String) -> Result<(), DisconnectReason> {
    let conn = ctx.registry.get_mut(server).ok_or(DisconnectReason::BadLogin)?;
    if !conn.is_server() {
        return Err(DisconnectReason::BadLogin);
    }
    if let Some(state) = conn.server_state_mut() {
        state.description = description;
    }
    Ok(())
}

/// Worker task backing `SendStatistics`. Stamps server-identity fields and
/// authenticated-nonce matches on the main thread before handing the
/// payload to the worker; `run` is the only place that touches `stats_store`
/// (per spec.md §5, the store is never reached from the main thread).
pub struct StatsTask {
    stats: GameStats,
    stats_store: Arc<dyn StatsStore>,
    result: Mutex<Option<Result<(), crate::error::StoreError>>>,
}

impl StatsTask {
    pub fn new(stats: GameStats, stats_store: Arc<dyn StatsStore>) -> Self {
        StatsTask { stats, stats_store, result: Mutex::new(None) }
    }
}

impl WorkerTask<MasterContext> for StatsTask {
    fn run(&mut self) {
        let result = self.stats_store.insert_stats(&self.stats);
        *self.result.lock().unwrap() = Some(result);
    }

    fn finish(self: Box<Self>, ctx: &mut MasterContext) {
        if let Some(Err(err)) = self.result.into_inner().unwrap() {
            flux::logging::error!(ctx.log, "stats store failed"; "error" => format!("{err}"));
        }
        ctx.high_scores.invalidate();
    }
}

/// Handles `SendStatistics`. Validates and stamps the payload, rewrites
/// `is_authenticated` on each contained player by nonce, then enqueues the
/// store write.
pub fn handle_send_statistics(
    ctx: &mut MasterContext,
    server: ConnectionId,
    server_name: String,
    server_addr: String,
    versioned: VersionedGameStats,
) -> Result<(), DisconnectReason> {
    let now_ms = ctx.now_ms();
    let conn = ctx.registry.get_mut(server).ok_or(DisconnectReason::BadLogin)?;
    if !check_activity_time(conn, now_ms, STATS_FLOOD_DELTA_MS) {
        return Err(DisconnectReason::FloodControl);
    }
    if !versioned.valid {
        return Ok(());
    }

    let mut stats = versioned.stats;
    stats.server_name = server_name;
    stats.server_ip = server_addr;
    for team in &mut stats.team_stats {
        for player in &mut team.player_stats {
            player.is_authenticated = ctx
                .registry
                .find_client_by_nonce(player.nonce)
                .map(|c| c.client_state().map(|cs| cs.authenticated).unwrap_or(false))
                .unwrap_or(false);
        }
    }

    ctx.worker.try_enqueue(Box::new(StatsTask::new(stats, ctx.stats.clone())));
    Ok(())
}

struct AchievementTask {
    achievement_id: u8,
    player_nick: String,
    server_name: String,
    server_addr: String,
    stats_store: Arc<dyn StatsStore>,
    result: Mutex<Option<Result<(), crate::error::StoreError>>>,
}

impl WorkerTask<MasterContext> for AchievementTask {
    fn run(&mut self) {
        let result = self.stats_store.insert_achievement(self.achievement_id, &self.player_nick, &self.server_name, &self.server_addr);
        *self.result.lock().unwrap() = Some(result);
    }

    fn finish(self: Box<Self>, ctx: &mut MasterContext) {
        if let Some(Err(err)) = self.result.into_inner().unwrap() {
            flux::logging::error!(ctx.log, "achievement store failed"; "error" => format!("{err}"));
        }
    }
}

pub fn handle_achievement(
    ctx: &mut MasterContext,
    server: ConnectionId,
    achievement_id: u8,
    player_nick: String,
    server_name: String,
    server_addr: String,
) -> Result<(), DisconnectReason> {
    let now_ms = ctx.now_ms();
    let conn = ctx.registry.get_mut(server).ok_or(DisconnectReason::BadLogin)?;
    if !check_activity_time(conn, now_ms, STATS_FLOOD_DELTA_MS) {
        return Err(DisconnectReason::FloodControl);
    }
    if achievement_id as u16 > crate::connection::BADGE_COUNT as u16 {
        return Ok(());
    }

    if let Some(client) = ctx.registry.clients_mut().find(|c| c.name == player_nick) {
        if let Some(cs) = client.client_state_mut() {
            cs.badges |= 1u32 << achievement_id;
        }
    }

    ctx.worker.try_enqueue(Box::new(AchievementTask {
        achievement_id,
        player_nick,
        server_name,
        server_addr,
        stats_store: ctx.stats.clone(),
        result: Mutex::new(None),
    }));
    Ok(())
}

struct LevelInfoTask {
    info: LevelInfo,
    stats_store: Arc<dyn StatsStore>,
    result: Mutex<Option<Result<(), crate::error::StoreError>>>,
}

impl WorkerTask<MasterContext> for LevelInfoTask {
    fn run(&mut self) {
        let result = self.stats_store.insert_level_info(&self.info);
        *self.result.lock().unwrap() = Some(result);
    }

    fn finish(self: Box<Self>, ctx: &mut MasterContext) {
        if let Some(Err(err)) = self.result.into_inner().unwrap() {
            flux::logging::error!(ctx.log, "level info store failed"; "error" => format!("{err}"));
        }
    }
}

pub fn handle_send_level_info(ctx: &mut MasterContext, server: ConnectionId, info: LevelInfo) -> Result<(), DisconnectReason> {
    let now_ms = ctx.now_ms();
    let conn = ctx.registry.get_mut(server).ok_or(DisconnectReason::BadLogin)?;
    if !check_activity_time(conn, now_ms, STATS_FLOOD_DELTA_MS) {
        return Err(DisconnectReason::FloodControl);
    }
    ctx.worker.try_enqueue(Box::new(LevelInfoTask { info, stats_store: ctx.stats.clone(), result: Mutex::new(None) }));
    Ok(())
}

/// Worker task that rebuilds the high-score cache from the five fixed
/// queries, then serves every waiter queued since the rebuild started.
/// `run` is the only place `stats_store` is touched, per spec.md §4.6/§5.
pub struct HighScoresTask {
    scores_per_group: usize,
    stats_store: Arc<dyn StatsStore>,
    log: flux::logging::Logger,
    snapshot: Mutex<Option<HighScoreSnapshot>>,
}

impl HighScoresTask {
    pub fn new(scores_per_group: usize, stats_store: Arc<dyn StatsStore>, log: flux::logging::Logger) -> Self {
        HighScoresTask { scores_per_group, stats_store, log, snapshot: Mutex::new(None) }
    }
}

impl WorkerTask<MasterContext> for HighScoresTask {
    fn run(&mut self) {
        let mut snapshot = HighScoreSnapshot::default();
        for (label, view, column) in QUERIES {
            snapshot.group_names.push((*label).to_string());
            match self.stats_store.top_players(view, column, self.scores_per_group) {
                Ok(rows) => {
                    for (name, score) in rows {
                        snapshot.names.push(name);
                        snapshot.scores.push(score);
                    }
                }
                Err(err) => {
                    flux::logging::error!(self.log, "high score query failed"; "view" => *view, "error" => format!("{err}"));
                }
            }
        }
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    fn finish(self: Box<Self>, ctx: &mut MasterContext) {
        let snapshot = self.snapshot.into_inner().unwrap().unwrap_or_default();
        let waiters = ctx.high_scores.finish_rebuild(snapshot.clone(), self.scores_per_group);
        for client in waiters {
            if ctx.registry.get(client).is_some() {
                ctx.outbound.push(OutboundEvent::HighScores { client, snapshot: snapshot.clone() });
            }
        }
    }
}

/// Handles `RequestHighScores`. Returns the snapshot to send immediately,
/// if the cache was already fresh; otherwise the requester was registered
/// as a waiter and will be served once the enqueued task (if any) finishes.
pub fn handle_request_high_scores(
    ctx: &mut MasterContext,
    client: ConnectionId,
    scores_per_group: usize,
) -> Option<HighScoreSnapshot> {
    let now_ms = ctx.now_ms();
    let (action, started) = ctx.high_scores.request(client, now_ms, scores_per_group);
    if started {
        ctx.worker.try_enqueue(Box::new(HighScoresTask::new(scores_per_group, ctx.stats.clone(), ctx.log.clone())));
    }
    match action {
        HighScoreAction::ReplyNow(snapshot) => Some(snapshot),
        HighScoreAction::Wait => None,
    }
}

pub fn handle_request_motd(ctx: &MasterContext, client_build: u32) -> (&str, &str) {
    (&ctx.config.master_name, ctx.motd.message_for(client_build))
}

/// Worker task backing `RequestAuthentication` (server-side nonce lookup,
/// per spec §4.4). Holds the player's id by value, not a pointer, so a
/// `finish` that fires after the client disconnected is a safe no-op.
pub struct AuthTask {
    client: ConnectionId,
    handle: String,
    password: String,
    verifier: Arc<dyn crate::gateway::CredentialVerifier>,
    outcome: Arc<Mutex<Option<AuthOutcome>>>,
    profile: Mutex<Option<crate::gateway::PlayerProfile>>,
}

impl AuthTask {
    /// Builds the task and a cloned handle to its `outcome` slot, so the
    /// caller can peek at the result without waiting for `finish` — used by
    /// the CS≤35 synchronous handshake path (§4.4/§4.11).
    pub fn new(
        client: ConnectionId,
        handle: String,
        password: String,
        verifier: Arc<dyn crate::gateway::CredentialVerifier>,
    ) -> (Self, Arc<Mutex<Option<AuthOutcome>>>) {
        let outcome = Arc::new(Mutex::new(None));
        let task = AuthTask {
            client,
            handle,
            password,
            verifier,
            outcome: outcome.clone(),
            profile: Mutex::new(None),
        };
        (task, outcome)
    }
}

impl WorkerTask<MasterContext> for AuthTask {
    fn run(&mut self) {
        let outcome = self.verifier.verify(&self.handle, &self.password);
        let profile = if outcome == AuthOutcome::Authenticated {
            Some(self.verifier.fetch_profile(&self.handle))
        } else {
            None
        };
        *self.outcome.lock().unwrap() = Some(outcome);
        *self.profile.lock().unwrap() = profile;
    }

    fn finish(self: Box<Self>, ctx: &mut MasterContext) {
        let outcome = self.outcome.lock().unwrap().unwrap_or(AuthOutcome::UnknownStatus);

        // WrongPassword/InvalidUsername: the client was linked optimistically
        // at handshake time (the non-legacy path) and must be torn down now
        // that the real verdict is in. A client rejected synchronously at
        // handshake time was never linked, so this is a harmless no-op.
        if matches!(outcome, AuthOutcome::WrongPassword | AuthOutcome::InvalidUsername) {
            let reason = if outcome == AuthOutcome::WrongPassword {
                DisconnectReason::BadLogin
            } else {
                DisconnectReason::InvalidUsername
            };
            if ctx.registry.unlink(self.client).is_some() {
                ctx.outbound.push(OutboundEvent::Disconnect { client: self.client, reason });
            }
            return;
        }

        let profile = self.profile.lock().unwrap().take();
        let mut rename: Option<(String, String, bool)> = None;

        let Some(conn) = ctx.registry.get_mut(self.client) else {
            return;
        };
        let current_name = conn.name.clone();
        let master_protocol_version = conn.master_protocol_version;

        let Some(cs) = conn.client_state_mut() else {
            return;
        };

        let status = match outcome {
            AuthOutcome::Authenticated => {
                cs.authenticated = true;
                if let Some(profile) = profile {
                    cs.badges = profile.badges;
                    cs.games_played = profile.games_played;
                    if let Some(canonical) = profile.canonical_name {
                        if canonical != current_name {
                            rename = Some((current_name.clone(), canonical, cs.is_in_global_chat));
                        }
                    }
                }
                AuthStatus::Authenticated
            }
            AuthOutcome::UnknownUser | AuthOutcome::Unsupported => AuthStatus::Unauthenticated,
            _ => AuthStatus::Failed,
        };
        let badges = cs.badges;
        let games_played = cs.games_played;
        cs.is_master_admin = ctx.config.master_admins.iter().any(|a| a.eq_ignore_ascii_case(&self.handle));

        let reported_name = rename.as_ref().map(|(_, new_name, _)| new_name.clone()).unwrap_or(current_name);
        let variant = if master_protocol_version >= SET_AUTHENTICATED_019_PROTOCOL_VERSION {
            SetAuthenticatedVariant::V019
        } else {
            SetAuthenticatedVariant::Classic
        };

        if let Some((old_name, new_name, was_in_global_chat)) = rename {
            if let Some(conn) = ctx.registry.get_mut(self.client) {
                conn.name = new_name.clone();
            }
            if was_in_global_chat {
                let recipients: Vec<ConnectionId> = ctx
                    .registry
                    .clients()
                    .filter(|c| c.id != self.client)
                    .filter(|c| c.client_state().map(|cs| cs.is_in_global_chat).unwrap_or(false))
                    .map(|c| c.id)
                    .collect();
                ctx.outbound.push(OutboundEvent::GlobalChatRenamed { recipients, old_name, new_name });
            }
        }

        ctx.outbound.push(OutboundEvent::SetAuthenticated {
            client: self.client,
            status,
            name: reported_name,
            badges,
            games_played,
            variant,
        });

        ctx.registry.mark_dirty();
    }
}

/// Minimum spacing between polls while busy-waiting on a legacy client's
/// synchronous authentication result.
const SYNC_AUTH_POLL_INTERVAL_MS: u64 = 5;
/// Maximum time to busy-wait before falling back to `UnknownStatus`.
const SYNC_AUTH_MAX_WAIT_MS: u64 = 1000;

/// Busy-waits on an in-flight `AuthTask`'s outcome, sleeping
/// `SYNC_AUTH_POLL_INTERVAL_MS` between polls, for up to
/// `SYNC_AUTH_MAX_WAIT_MS` — the CS≤35 `doNotDelay` compatibility path
/// (§4.4/§4.11). Falls back to `UnknownStatus` if the worker hasn't produced
/// a result in time, same as the async path's default.
fn poll_auth_outcome_sync(outcome: &Mutex<Option<AuthOutcome>>) -> AuthOutcome {
    let mut waited_ms = 0;
    loop {
        if let Some(outcome) = *outcome.lock().unwrap() {
            return outcome;
        }
        if waited_ms >= SYNC_AUTH_MAX_WAIT_MS {
            return AuthOutcome::UnknownStatus;
        }
        std::thread::sleep(Duration::from_millis(SYNC_AUTH_POLL_INTERVAL_MS));
        waited_ms += SYNC_AUTH_POLL_INTERVAL_MS;
    }
}

/// Handles `s2mRequestAuthentication`: the server asks the master whether a
/// connected player's nonce is authenticated, so it can trust the name.
pub fn handle_request_authentication(ctx: &MasterContext, nonce: u64) -> Option<(String, bool)> {
    ctx.registry.find_client_by_nonce(nonce).map(|c| {
        (c.name.clone(), c.client_state().map(|cs| cs.authenticated).unwrap_or(false))
    })
}

/// The oldest master protocol this build still accepts, and the newest the
/// dispatcher itself was written against.
pub const MIN_MASTER_PROTOCOL_VERSION: u32 = 4;
pub const MASTER_PROTOCOL_VERSION: u32 = 19;
/// Master protocol at which a single connection-type enum replaced the
/// single server/client flag.
pub const ROLE_ENUM_PROTOCOL_VERSION: u32 = 6;
/// CS protocol at and below which the handshake uses the synchronous,
/// busy-waiting authentication path instead of optimistic linking.
pub const LEGACY_SYNC_AUTH_CS_VERSION: u32 = 35;

/// What the transport read off the wire for a connecting peer, before the
/// dispatcher has decided whether to accept it. `internal_addr` and
/// `player_id` only apply to the client role.
pub struct ConnectRequestInfo {
    pub master_protocol_version: u32,
    pub cs_protocol_version: u32,
    pub client_build: u32,
    pub role: ConnectRole,
}

pub enum ConnectRole {
    Server {
        bot_count: u32,
        player_count: u32,
        max_players: u32,
        info_flags: u32,
        level_name: String,
        level_type: String,
        name: String,
        description: String,
    },
    Client {
        name: String,
        password: String,
        is_debug_client: bool,
        player_id: u64,
    },
    Anonymous,
}

pub enum HandshakeOutcome {
    Accepted {
        needs_upgrade: bool,
        motd: String,
    },
    Rejected(DisconnectReason),
}

/// Validates and links a newly-accepted transport connection, per
/// spec.md §4.11. `new_id`/`addr` identify the already-allocated
/// connection; `internal_addr` is the client's self-reported address for
/// rendezvous candidate computation.
pub fn handle_connect_request(
    ctx: &mut MasterContext,
    new_id: ConnectionId,
    addr: SocketAddr,
    internal_addr: Option<SocketAddr>,
    info: ConnectRequestInfo,
) -> HandshakeOutcome {
    if info.master_protocol_version < MIN_MASTER_PROTOCOL_VERSION || info.master_protocol_version > MASTER_PROTOCOL_VERSION {
        return HandshakeOutcome::Rejected(DisconnectReason::BadVersion);
    }

    let mut conn = crate::connection::Connection::new(new_id, addr);
    conn.internal_addr = internal_addr;
    conn.master_protocol_version = info.master_protocol_version;
    conn.cs_protocol_version = info.cs_protocol_version;
    conn.client_build = info.client_build;

    match info.role {
        ConnectRole::Server { bot_count, player_count, max_players, info_flags, level_name, level_type, name, description } => {
            conn.name = crate::connection::clean_name(&name);
            conn.role = crate::connection::RoleState::Server(crate::connection::ServerState {
                description,
                level_name,
                level_type,
                bot_count,
                player_count,
                max_players,
                info_flags,
            });
            conn.logging_status = "SERVER_CONNECT".to_string();
            ctx.registry.link(conn);
        }
        ConnectRole::Client { name, password, is_debug_client, player_id } => {
            if ctx.registry.find_client_by_nonce(player_id).is_some() {
                return HandshakeOutcome::Rejected(DisconnectReason::DuplicateId);
            }

            conn.name = crate::connection::clean_name(&name);
            let is_ignored = ctx.config.hidden_ips.iter().any(|ip| *ip == addr.ip()) || ctx.registry.is_ip_hidden(addr.ip());
            conn.is_ignored_from_list = is_ignored;

            let mut client_state = crate::connection::ClientState {
                player_id,
                is_debug_client,
                ..crate::connection::ClientState::default()
            };
            client_state.is_master_admin = ctx.config.master_admins.iter().any(|a| a.eq_ignore_ascii_case(&conn.name));
            conn.role = crate::connection::RoleState::Client(client_state);
            conn.logging_status = "CLIENT_CONNECT".to_string();

            let handle = conn.name.clone();
            let (task, outcome_handle) = AuthTask::new(new_id, handle, password, ctx.credentials.clone());
            ctx.worker.try_enqueue(Box::new(task));

            // CS≤35 clients ignore any disconnect reason once fully
            // connected, so for them we busy-wait on the result instead of
            // linking optimistically (§4.4/§4.11). Newer clients never wait:
            // the peeked outcome is always `UnknownStatus`, and `finish`
            // reconciles the real result once the worker thread is done.
            let peeked = if info.cs_protocol_version <= LEGACY_SYNC_AUTH_CS_VERSION {
                poll_auth_outcome_sync(&outcome_handle)
            } else {
                AuthOutcome::UnknownStatus
            };

            match peeked {
                AuthOutcome::WrongPassword => return HandshakeOutcome::Rejected(DisconnectReason::BadLogin),
                AuthOutcome::InvalidUsername => return HandshakeOutcome::Rejected(DisconnectReason::InvalidUsername),
                AuthOutcome::UnknownStatus => {
                    // Link without letting it show up as a dirty status
                    // write yet — the delayed write avoids briefly showing
                    // a client as unauthenticated before `finish` reconciles
                    // the real result.
                    let was_dirty = ctx.registry.is_dirty();
                    ctx.registry.link(conn);
                    if !was_dirty {
                        ctx.registry.take_dirty();
                    }
                    ctx.status_write_delayed_until = Some(ctx.now_ms());
                }
                _ => {
                    ctx.registry.link(conn);
                }
            }
        }
        ConnectRole::Anonymous => {
            conn.logging_status = "ANONYMOUS_CONNECT".to_string();
            ctx.registry.link(conn);
        }
    }

    let needs_upgrade = info.cs_protocol_version < ctx.config.latest_cs_protocol_version
        || info.client_build < ctx.config.latest_build_version;
    let motd = ctx.motd.message_for(info.client_build).to_string();
    HandshakeOutcome::Accepted { needs_upgrade, motd }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MasterConfig;
    use crate::connection::{ClientState, Connection, RoleState, ServerState};
    use crate::gateway::{CredentialVerifier, PlayerProfile, StatsStore};
    use crate::error::StoreError;
    use crate::worker::WorkerQueue;
    use flux::clock::TestClock;

    struct NullVerifier;
    impl CredentialVerifier for NullVerifier {
        fn verify(&self, _h: &str, _p: &str) -> AuthOutcome {
            AuthOutcome::Authenticated
        }
        fn fetch_profile(&self, _h: &str) -> PlayerProfile {
            PlayerProfile::default()
        }
    }

    struct NullStore;
    impl StatsStore for NullStore {
        fn insert_stats(&self, _s: &GameStats) -> Result<(), StoreError> {
            Ok(())
        }
        fn insert_achievement(&self, _a: u8, _p: &str, _s: &str, _addr: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn insert_level_info(&self, _i: &LevelInfo) -> Result<(), StoreError> {
            Ok(())
        }
        fn top_players(&self, _v: &str, _c: &str, _l: usize) -> Result<Vec<(String, String)>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn context() -> MasterContext {
        context_with_clock(Arc::new(TestClock::new()))
    }

    fn context_with_clock(clock: Arc<TestClock>) -> MasterContext {
        MasterContext::new(
            MasterConfig::default(),
            clock,
            flux::logging::discard(),
            Arc::new(NullVerifier),
            Arc::new(NullStore),
        )
    }

    fn server(id: u64, addr: &str) -> Connection {
        let mut c = Connection::new(ConnectionId(id), addr.parse().unwrap());
        c.role = RoleState::Server(ServerState::default());
        c.cs_protocol_version = 1;
        c
    }

    fn client(id: u64) -> Connection {
        let mut c = Connection::new(ConnectionId(id), "127.0.0.1:2000".parse().unwrap());
        c.role = RoleState::Client(ClientState::default());
        c
    }

    #[test]
    fn query_servers_filters_hidden_and_mismatched_protocol() {
        let mut ctx = context();
        ctx.registry.link(server(1, "10.0.0.1:100"));
        let mut hidden = server(2, "10.0.0.2:100");
        hidden.is_ignored_from_list = true;
        ctx.registry.link(hidden);
        let mut wrong_version = server(3, "10.0.0.3:100");
        wrong_version.cs_protocol_version = 2;
        ctx.registry.link(wrong_version);

        let batches = handle_query_servers(&ctx, 1, 42);
        let addrs: Vec<SocketAddr> = batches
            .into_iter()
            .flat_map(|QueryServersBatch::Response { addresses, .. }| addresses)
            .collect();
        assert_eq!(addrs, vec!["10.0.0.1:100".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn arranged_connection_rejects_unknown_host() {
        let mut ctx = context();
        ctx.registry.link(client(1));
        let outcome = handle_request_arranged_connection(&mut ctx, ConnectionId(1), 7, "10.0.0.9:100".parse().unwrap(), None, vec![]);
        assert!(matches!(outcome, RendezvousOutcome::NoSuchHost));
    }

    #[test]
    fn arranged_connection_happy_path_round_trips() {
        let mut ctx = context();
        ctx.registry.link(client(1));
        ctx.registry.link(server(2, "10.0.0.9:100"));

        let outcome = handle_request_arranged_connection(&mut ctx, ConnectionId(1), 7, "10.0.0.9:100".parse().unwrap(), None, vec![1, 2, 3]);
        let host_query_id = match outcome {
            RendezvousOutcome::Forwarded { host_query_id, host, .. } => {
                assert_eq!(host, ConnectionId(2));
                host_query_id
            }
            _ => panic!("expected forwarded"),
        };

        let reply = handle_accept_arranged_connection(&mut ctx, host_query_id, None, vec![9]).unwrap();
        assert!(matches!(reply, ArrangedConnectionReply::Accepted { initiator, .. } if initiator == ConnectionId(1)));
        assert_eq!(ctx.rendezvous.len(), 0);
    }

    #[test]
    fn rendezvous_sweep_expires_after_5000ms() {
        let clock = Arc::new(TestClock::new());
        let mut ctx = context_with_clock(clock.clone());
        ctx.registry.link(client(1));
        ctx.registry.link(server(2, "10.0.0.9:100"));
        handle_request_arranged_connection(&mut ctx, ConnectionId(1), 7, "10.0.0.9:100".parse().unwrap(), None, vec![]);
        assert_eq!(sweep_rendezvous_timeouts(&mut ctx).len(), 0);

        clock.advance(5001);
        let expired = sweep_rendezvous_timeouts(&mut ctx);
        assert_eq!(expired, vec![ConnectionId(1)]);
        assert_eq!(ctx.rendezvous.len(), 0);
    }

    #[test]
    fn handshake_rejects_unsupported_master_protocol() {
        let mut ctx = context();
        let info = ConnectRequestInfo {
            master_protocol_version: 3,
            cs_protocol_version: 1,
            client_build: 1,
            role: ConnectRole::Anonymous,
        };
        let outcome = handle_connect_request(&mut ctx, ConnectionId(1), "127.0.0.1:1".parse().unwrap(), None, info);
        assert!(matches!(outcome, HandshakeOutcome::Rejected(DisconnectReason::BadVersion)));
    }

    #[test]
    fn handshake_rejects_duplicate_client_nonce() {
        let mut ctx = context();
        let first = ConnectRequestInfo {
            master_protocol_version: 10,
            cs_protocol_version: 40,
            client_build: 1,
            role: ConnectRole::Client { name: "a".to_string(), password: "x".to_string(), is_debug_client: false, player_id: 99 },
        };
        assert!(matches!(
            handle_connect_request(&mut ctx, ConnectionId(1), "127.0.0.1:1".parse().unwrap(), None, first),
            HandshakeOutcome::Accepted { .. }
        ));

        let dup = ConnectRequestInfo {
            master_protocol_version: 10,
            cs_protocol_version: 40,
            client_build: 1,
            role: ConnectRole::Client { name: "b".to_string(), password: "y".to_string(), is_debug_client: false, player_id: 99 },
        };
        let outcome = handle_connect_request(&mut ctx, ConnectionId(2), "127.0.0.1:2".parse().unwrap(), None, dup);
        assert!(matches!(outcome, HandshakeOutcome::Rejected(DisconnectReason::DuplicateId)));
    }

    #[test]
    fn handshake_links_server_role_into_server_list() {
        let mut ctx = context();
        let info = ConnectRequestInfo {
            master_protocol_version: 10,
            cs_protocol_version: 40,
            client_build: 1,
            role: ConnectRole::Server {
                bot_count: 0,
                player_count: 2,
                max_players: 8,
                info_flags: 0,
                level_name: "Level".to_string(),
                level_type: "Soccer".to_string(),
                name: "My Server".to_string(),
                description: "desc".to_string(),
            },
        };
        let outcome = handle_connect_request(&mut ctx, ConnectionId(1), "127.0.0.1:1".parse().unwrap(), None, info);
        assert!(matches!(outcome, HandshakeOutcome::Accepted { .. }));
        assert_eq!(ctx.registry.server_count(), 1);
    }

    struct RejectingVerifier;
    impl CredentialVerifier for RejectingVerifier {
        fn verify(&self, _h: &str, _p: &str) -> AuthOutcome {
            AuthOutcome::WrongPassword
        }
        fn fetch_profile(&self, _h: &str) -> PlayerProfile {
            PlayerProfile::default()
        }
    }

    /// Spawns a thread that drains the worker queue until `stop` is set,
    /// mimicking the main loop's background worker thread so a legacy
    /// client's busy-wait resolves quickly instead of running out the clock.
    fn spawn_worker_drain(worker: Arc<WorkerQueue<MasterContext>>) -> (std::thread::JoinHandle<()>, Arc<std::sync::atomic::AtomicBool>) {
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            while !stop_clone.load(std::sync::atomic::Ordering::Relaxed) {
                worker.run_pending();
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        });
        (handle, stop)
    }

    #[test]
    fn legacy_cs_version_synchronously_rejects_bad_login() {
        let mut ctx = MasterContext::new(
            MasterConfig::default(),
            Arc::new(TestClock::new()),
            flux::logging::discard(),
            Arc::new(RejectingVerifier),
            Arc::new(NullStore),
        );
        let (handle, stop) = spawn_worker_drain(ctx.worker.clone());

        let info = ConnectRequestInfo {
            master_protocol_version: 10,
            cs_protocol_version: LEGACY_SYNC_AUTH_CS_VERSION,
            client_build: 1,
            role: ConnectRole::Client { name: "eve".to_string(), password: "wrong".to_string(), is_debug_client: false, player_id: 1 },
        };
        let outcome = handle_connect_request(&mut ctx, ConnectionId(1), "127.0.0.1:1".parse().unwrap(), None, info);

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.join().unwrap();

        assert!(matches!(outcome, HandshakeOutcome::Rejected(DisconnectReason::BadLogin)));
        assert!(ctx.registry.get(ConnectionId(1)).is_none());
    }

    #[test]
    fn non_legacy_cs_version_links_optimistically_despite_bad_login() {
        let mut ctx = MasterContext::new(
            MasterConfig::default(),
            Arc::new(TestClock::new()),
            flux::logging::discard(),
            Arc::new(RejectingVerifier),
            Arc::new(NullStore),
        );

        let info = ConnectRequestInfo {
            master_protocol_version: 10,
            cs_protocol_version: LEGACY_SYNC_AUTH_CS_VERSION + 1,
            client_build: 1,
            role: ConnectRole::Client { name: "eve".to_string(), password: "wrong".to_string(), is_debug_client: false, player_id: 1 },
        };
        let outcome = handle_connect_request(&mut ctx, ConnectionId(1), "127.0.0.1:1".parse().unwrap(), None, info);
        assert!(matches!(outcome, HandshakeOutcome::Accepted { .. }));
        assert!(ctx.registry.get(ConnectionId(1)).is_some());

        let worker = ctx.worker.clone();
        worker.run_pending();
        worker.finish_pending(&mut ctx);

        assert!(ctx.registry.get(ConnectionId(1)).is_none());
        assert!(matches!(
            ctx.outbound.as_slice(),
            [OutboundEvent::Disconnect { reason: DisconnectReason::BadLogin, .. }]
        ));
    }

    #[test]
    fn auth_task_finish_emits_set_authenticated_for_unknown_user() {
        struct UnknownUserVerifier;
        impl CredentialVerifier for UnknownUserVerifier {
            fn verify(&self, _h: &str, _p: &str) -> AuthOutcome {
                AuthOutcome::UnknownUser
            }
            fn fetch_profile(&self, _h: &str) -> PlayerProfile {
                PlayerProfile::default()
            }
        }

        let mut ctx = MasterContext::new(
            MasterConfig::default(),
            Arc::new(TestClock::new()),
            flux::logging::discard(),
            Arc::new(UnknownUserVerifier),
            Arc::new(NullStore),
        );
        ctx.registry.link(client(1));

        let (task, _outcome) = AuthTask::new(ConnectionId(1), "guest".to_string(), "x".to_string(), ctx.credentials.clone());
        ctx.worker.try_enqueue(Box::new(task));
        let worker = ctx.worker.clone();
        worker.run_pending();
        worker.finish_pending(&mut ctx);

        assert!(ctx.registry.get(ConnectionId(1)).is_some());
        match ctx.outbound.as_slice() {
            [OutboundEvent::SetAuthenticated { status, .. }] => assert_eq!(*status, AuthStatus::Unauthenticated),
            other => panic!("unexpected outbound events: {other:?}"),
        }
    }

    #[test]
    fn stats_task_writes_to_the_store_from_run_not_finish() {
        struct TrackingStore {
            called_during_run: std::sync::atomic::AtomicBool,
        }
        impl StatsStore for TrackingStore {
            fn insert_stats(&self, _s: &GameStats) -> Result<(), StoreError> {
                self.called_during_run.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
            fn insert_achievement(&self, _a: u8, _p: &str, _s: &str, _addr: &str) -> Result<(), StoreError> {
                Ok(())
            }
            fn insert_level_info(&self, _i: &LevelInfo) -> Result<(), StoreError> {
                Ok(())
            }
            fn top_players(&self, _v: &str, _c: &str, _l: usize) -> Result<Vec<(String, String)>, StoreError> {
                Ok(Vec::new())
            }
        }

        let store = Arc::new(TrackingStore { called_during_run: std::sync::atomic::AtomicBool::new(false) });
        let mut task = StatsTask::new(GameStats::default(), store.clone());
        task.run();
        assert!(store.called_during_run.load(std::sync::atomic::Ordering::SeqCst), "run() must perform the store write itself");

        let mut ctx = context();
        Box::new(task).finish(&mut ctx);
    }
}
