use crate::connection::ConnectionId;
use crate::registry::Registry;

/// Debounce window before a `LeaveGlobalChat` actually takes effect, so a
/// quick leave/rejoin (e.g. switching levels) doesn't flash the player's
/// name off and back on everyone else's roster.
pub const LEAVE_DEBOUNCE_MS: u64 = 1000;

pub enum JoinOutcome {
    /// Already in global chat (or the join just cancelled a pending leave);
    /// nothing further to announce.
    NoOp,
    /// Newly joined: broadcast `PlayerJoinedGlobalChat(name)` to every other
    /// member, then send the full roster to `name` alone.
    Joined { roster: Vec<String> },
}

/// Handles `JoinGlobalChat`. Cancels any pending delayed leave. A hidden
/// client (`is_ignored_from_list`) stops here: no roster reply, no presence
/// broadcast (§4.8).
pub fn join(registry: &mut Registry, who: ConnectionId) -> JoinOutcome {
    match registry.get(who) {
        Some(conn) if !conn.is_ignored_from_list => {}
        _ => return JoinOutcome::NoOp,
    }

    let roster: Vec<String> = registry
        .clients()
        .filter(|c| c.id != who)
        .filter_map(|c| c.client_state().filter(|cs| cs.is_in_global_chat).map(|_| c.name.clone()))
        .collect();

    let already_in = match registry.get_mut(who).and_then(|c| c.client_state_mut()) {
        Some(cs) => {
            cs.leave_chat_at = None;
            let was_in = cs.is_in_global_chat;
            cs.is_in_global_chat = true;
            was_in
        }
        None => return JoinOutcome::NoOp,
    };

    if already_in {
        JoinOutcome::NoOp
    } else {
        JoinOutcome::Joined { roster }
    }
}

/// Handles `LeaveGlobalChat`: arms the debounce timer rather than leaving
/// immediately. The main loop's timer sweep (`sweep_pending_leaves`)
/// performs the actual departure once the window has elapsed.
pub fn request_leave(registry: &mut Registry, who: ConnectionId, now_ms: u64) {
    if let Some(cs) = registry.get_mut(who).and_then(|c| c.client_state_mut()) {
        if cs.is_in_global_chat {
            cs.leave_chat_at = Some(now_ms);
        }
    }
}

/// Runs once per main-loop iteration. Returns the names of everyone whose
/// debounce window has elapsed, in the same order the registry iterates,
/// after having already cleared their `is_in_global_chat` flag.
pub fn sweep_pending_leaves(registry: &mut Registry, now_ms: u64) -> Vec<String> {
    let due: Vec<ConnectionId> = registry
        .clients()
        .filter(|c| {
            c.client_state()
                .and_then(|cs| cs.leave_chat_at)
                .map(|at| now_ms.saturating_sub(at) > LEAVE_DEBOUNCE_MS)
                .unwrap_or(false)
        })
        .map(|c| c.id)
        .collect();

    let mut left = Vec::with_capacity(due.len());
    for id in due {
        if let Some(conn) = registry.get_mut(id) {
            let name = conn.name.clone();
            if let Some(cs) = conn.client_state_mut() {
                cs.is_in_global_chat = false;
                cs.leave_chat_at = None;
            }
            left.push(name);
        }
    }
    left
}
