use crate::connection::Connection;

/// Guards an operation with a minimum spacing of `min_delta_ms`. Always
/// updates `last_activity_ms`. Returns `false` (caller must disconnect with
/// `FloodControl`) on the third strike; strikes decay by one per
/// well-spaced call, not by wall-clock time.
pub fn check_activity_time(conn: &mut Connection, now_ms: u64, min_delta_ms: u64) -> bool {
    if now_ms.saturating_sub(conn.last_activity_ms) < min_delta_ms {
        conn.strikes += 1;
        conn.last_activity_ms = now_ms;
        if conn.strikes == 3 {
            return false;
        }
    } else {
        if conn.strikes > 0 {
            conn.strikes -= 1;
        }
        conn.last_activity_ms = now_ms;
    }
    true
}
