use crate::connection::ConnectionId;

/// Cache freshness window. The source comment this is ported from claims
/// "2 hours" but the literal is `2 * 60 * 1000` ms, i.e. two minutes. The
/// literal — not the comment — is preserved; see DESIGN.md.
pub const FRESHNESS_MS: u64 = 2 * 60 * 1000;

/// The five fixed leaderboard queries, in display order.
pub const QUERIES: &[(&str, &str, &str)] = &[
    ("Official Wins Last Week", "v_last_week_top_player_official_wins", "win_count"),
    ("Official Wins This Week, So Far", "v_current_week_top_player_official_wins", "win_count"),
    ("Games Played Last Week", "v_last_week_top_player_games", "game_count"),
    ("Games Played This Week, So Far", "v_current_week_top_player_games", "game_count"),
    ("Latest BBB Winners", "v_latest_bbb_winners", "rank"),
];

#[derive(Debug, Clone, Default)]
pub struct HighScoreSnapshot {
    pub group_names: Vec<String>,
    pub names: Vec<String>,
    pub scores: Vec<String>,
}

pub enum HighScoreAction {
    /// Cache was fresh and idle; reply with the snapshot right away.
    ReplyNow(HighScoreSnapshot),
    /// A rebuild is in flight (possibly the one this call just started);
    /// the caller was added to the waiting list and will be served from
    /// `finish_rebuild`.
    Wait,
}

/// Time-bounded snapshot plus a busy flag with a waiting-client list, as
/// described in spec.md's `HighScoresSnapshot`.
#[derive(Default)]
pub struct HighScoreCache {
    snapshot: HighScoreSnapshot,
    scores_per_group: usize,
    last_clock_ms: u64,
    valid: bool,
    busy: bool,
    waiting_clients: Vec<ConnectionId>,
}

impl HighScoreCache {
    pub fn new() -> Self {
        HighScoreCache::default()
    }

    /// Handles `RequestHighScores`. Returns whether a rebuild task should
    /// be enqueued by the caller (true exactly when this call is the one
    /// that transitions the cache from idle to busy).
    pub fn request(
        &mut self,
        client: ConnectionId,
        now_ms: u64,
        scores_per_group: usize,
    ) -> (HighScoreAction, bool) {
        let stale = now_ms.saturating_sub(self.last_clock_ms) > FRESHNESS_MS
            || !self.valid
            || scores_per_group != self.scores_per_group;

        let mut started_rebuild = false;
        if stale && !self.busy {
            self.busy = true;
            // Marked valid *before* the rebuild completes: a reader who
            // lands between here and `finish_rebuild` sees a stale
            // snapshot flagged valid. Preserved intentionally (see
            // DESIGN.md); do not "fix" this to set `valid` in
            // `finish_rebuild` instead.
            self.valid = true;
            self.last_clock_ms = now_ms;
            started_rebuild = true;
        }

        if self.busy {
            if !self.waiting_clients.contains(&client) {
                self.waiting_clients.push(client);
            }
            (HighScoreAction::Wait, started_rebuild)
        } else {
            (HighScoreAction::ReplyNow(self.snapshot.clone()), started_rebuild)
        }
    }

    /// Called from the rebuild task's `finish`. Clears `busy` and returns
    /// the waiting clients to serve, draining the list.
    pub fn finish_rebuild(&mut self, snapshot: HighScoreSnapshot, scores_per_group: usize) -> Vec<ConnectionId> {
        self.snapshot = snapshot;
        self.scores_per_group = scores_per_group;
        self.busy = false;
        std::mem::take(&mut self.waiting_clients)
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_cache_starts_a_rebuild_and_waits() {
        let mut cache = HighScoreCache::new();
        let (action, started) = cache.request(ConnectionId(1), 0, 3);
        assert!(started);
        assert!(matches!(action, HighScoreAction::Wait));
    }

    #[test]
    fn fresh_cache_replies_immediately() {
        let mut cache = HighScoreCache::new();
        cache.request(ConnectionId(1), 0, 3);
        let waiters = cache.finish_rebuild(HighScoreSnapshot::default(), 3);
        assert_eq!(waiters.len(), 1);

        let (action, started) = cache.request(ConnectionId(2), 1000, 3);
        assert!(!started);
        assert!(matches!(action, HighScoreAction::ReplyNow(_)));
    }

    #[test]
    fn second_request_while_busy_also_waits_without_restarting_rebuild() {
        let mut cache = HighScoreCache::new();
        cache.request(ConnectionId(1), 0, 3);
        let (action, started) = cache.request(ConnectionId(2), 10, 3);
        assert!(!started);
        assert!(matches!(action, HighScoreAction::Wait));
    }
}
