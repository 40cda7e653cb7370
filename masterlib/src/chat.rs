use std::net::IpAddr;

use crate::connection::{Connection, ConnectionId};
use crate::flood::check_activity_time;
use crate::globalchat;
use crate::registry::Registry;

/// Minimum spacing between out-of-game chat messages before a client is
/// flagged as chatting too fast. The original source's `checkMessage`
/// helper isn't present in the retrieved sources; this reconstructs it on
/// top of the same strike mechanism used everywhere else.
const CHAT_MIN_DELTA_MS: u64 = 2000;

pub enum ChatOutcome {
    /// Relay `message` verbatim to every other client.
    Broadcast(String),
    /// Send `message` only to the named recipient (case-insensitive).
    PrivateMessage { recipient: String, message: String },
    /// A reply meant only for the sender (malformed command, admin command
    /// result, "chatting too fast" notice, etc).
    ReplyToSender(String),
    /// A bad slash-command from a non-admin: silently dropped, not relayed.
    Dropped,
}

/// Splits a message into words after stripping a leading `/`, the same way
/// `parseStringAndStripLeadingSlash` did.
fn parse_command(message: &str) -> Vec<String> {
    message.trim_start_matches('/').split_whitespace().map(str::to_string).collect()
}

/// Handles `SendChat`. `sender` must already be linked in `registry` as a
/// client. Mutates server/client ignore flags and the sender's flood state
/// in place; returns what the caller should relay.
pub fn handle_send_chat(
    registry: &mut Registry,
    sender: ConnectionId,
    message: &str,
    now_ms: u64,
) -> ChatOutcome {
    if let Some(words) = message.strip_prefix('/').map(|_| parse_command(message)) {
        if words.is_empty() {
            return ChatOutcome::Dropped;
        }
        let command = words[0].to_lowercase();
        let is_admin = registry.get(sender).map(|c| c.is_client() && c.client_state().map(|cs| cs.is_master_admin).unwrap_or(false)).unwrap_or(false);

        if is_admin {
            return handle_admin_command(registry, sender, &command, &words, now_ms);
        }

        if command == "pm" {
            return handle_pm(registry, &words, message);
        }

        return ChatOutcome::Dropped;
    }

    let sender_name = match registry.get(sender) {
        Some(c) => c.name.clone(),
        None => return ChatOutcome::Dropped,
    };
    let ignored = registry.get(sender).map(|c| c.is_ignored_from_list).unwrap_or(false);

    if ignored {
        return ChatOutcome::ReplyToSender(
            "< You are chatting too fast, your message didn't make it through.".to_string(),
        );
    }

    if let Some(conn) = registry.get_mut(sender) {
        if !check_activity_time(conn, now_ms, CHAT_MIN_DELTA_MS) {
            if let Some(cs) = conn.client_state_mut() {
                cs.chat_too_fast = true;
            }
            return ChatOutcome::ReplyToSender(
                "< You are chatting too fast, your message didn't make it through.".to_string(),
            );
        }
        if let Some(cs) = conn.client_state_mut() {
            cs.chat_too_fast = false;
        }
    }

    let _ = sender_name;
    ChatOutcome::Broadcast(message.to_string())
}

fn handle_pm(registry: &Registry, words: &[String], full_message: &str) -> ChatOutcome {
    if words.len() < 3 {
        return ChatOutcome::ReplyToSender("Malformed private message".to_string());
    }
    let recipient = words[1].clone();
    let prefix_words = 2 + recipient.matches(' ').count();
    let stripped = full_message
        .split_whitespace()
        .skip(prefix_words)
        .collect::<Vec<_>>()
        .join(" ");

    if registry.find_client_by_name_ci(&recipient).is_none() {
        return ChatOutcome::Dropped;
    }

    ChatOutcome::PrivateMessage { recipient, message: stripped }
}

fn handle_admin_command(
    registry: &mut Registry,
    sender: ConnectionId,
    command: &str,
    words: &[String],
    now_ms: u64,
) -> ChatOutcome {
    let sender_name = registry.get(sender).map(|c| c.name.clone()).unwrap_or_default();

    match command {
        "dropserver" => {
            let addr_str = words.get(1).cloned().unwrap_or_default();
            let mut dropped = false;
            for conn in registry.servers_mut() {
                if server_addr_matches(conn, &addr_str) {
                    conn.is_ignored_from_list = true;
                    dropped = true;
                }
            }
            if dropped {
                ChatOutcome::ReplyToSender("dropped".to_string())
            } else {
                ChatOutcome::ReplyToSender("dropserver: address not found".to_string())
            }
        }
        "restoreservers" => {
            let mut restored = false;
            for conn in registry.servers_mut() {
                if conn.is_ignored_from_list {
                    conn.is_ignored_from_list = false;
                    restored = true;
                }
            }
            if restored {
                ChatOutcome::ReplyToSender("servers restored".to_string())
            } else {
                ChatOutcome::ReplyToSender("No server was hidden".to_string())
            }
        }
        "hideplayer" => {
            let name = words.get(1).cloned().unwrap_or_default();
            let mut found = false;
            let mut now_hidden = false;
            for conn in registry.clients_mut() {
                if conn.name == name {
                    conn.is_ignored_from_list = !conn.is_ignored_from_list;
                    found = true;
                    now_hidden = conn.is_ignored_from_list;
                }
            }
            if found {
                ChatOutcome::ReplyToSender(
                    if now_hidden { "player hidden" } else { "player not hidden anymore" }.to_string(),
                )
            } else {
                ChatOutcome::ReplyToSender("player not found".to_string())
            }
        }
        "hideip" => {
            let addr_str = words.get(1).cloned().unwrap_or_default();
            let Ok(ip) = addr_str.parse::<IpAddr>() else {
                return ChatOutcome::ReplyToSender("hideip: not a valid address".to_string());
            };
            registry.hide_ip(ip);
            let affected: Vec<ConnectionId> = registry
                .clients_mut()
                .filter(|c| c.addr.ip() == ip)
                .map(|c| {
                    c.is_ignored_from_list = true;
                    c.id
                })
                .collect();
            for id in affected {
                globalchat::request_leave(registry, id, now_ms);
            }
            ChatOutcome::ReplyToSender("ip hidden".to_string())
        }
        "unhideips" => {
            registry.unhide_ips();
            ChatOutcome::ReplyToSender("cleared IP hidden list".to_string())
        }
        _ => {
            let _ = sender_name;
            ChatOutcome::Dropped
        }
    }
}

fn server_addr_matches(conn: &Connection, addr_str: &str) -> bool {
    conn.addr.to_string() == addr_str || conn.addr.ip().to_string() == addr_str
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientState, RoleState};
    use std::net::SocketAddr;

    fn client(id: u64, name: &str, admin: bool) -> Connection {
        client_at(id, name, admin, "127.0.0.1:1000")
    }

    fn client_at(id: u64, name: &str, admin: bool, addr: &str) -> Connection {
        let addr: SocketAddr = addr.parse().unwrap();
        let mut c = Connection::new(ConnectionId(id), addr);
        c.name = name.to_string();
        c.role = RoleState::Client(ClientState { is_master_admin: admin, ..ClientState::default() });
        c
    }

    #[test]
    fn plain_message_broadcasts() {
        let mut registry = Registry::new();
        registry.link(client(1, "nick", false));
        let outcome = handle_send_chat(&mut registry, ConnectionId(1), "hello there", 0);
        assert!(matches!(outcome, ChatOutcome::Broadcast(ref s) if s == "hello there"));
    }

    #[test]
    fn pm_routes_case_insensitively() {
        let mut registry = Registry::new();
        registry.link(client(1, "Sender", false));
        registry.link(client(2, "ReCiPiEnT", false));
        let outcome = handle_send_chat(&mut registry, ConnectionId(1), "/pm recipient hi there", 0);
        match outcome {
            ChatOutcome::PrivateMessage { recipient, message } => {
                assert_eq!(recipient, "recipient");
                assert_eq!(message, "hi there");
            }
            _ => panic!("expected a private message"),
        }
    }

    #[test]
    fn non_admin_slash_command_is_dropped_not_relayed() {
        let mut registry = Registry::new();
        registry.link(client(1, "nick", false));
        let outcome = handle_send_chat(&mut registry, ConnectionId(1), "/dropserver 1.2.3.4", 0);
        assert!(matches!(outcome, ChatOutcome::Dropped));
    }

    #[test]
    fn admin_hideplayer_toggles_and_replies_to_sender() {
        let mut registry = Registry::new();
        registry.link(client(1, "admin", true));
        registry.link(client(2, "target", false));
        let outcome = handle_send_chat(&mut registry, ConnectionId(1), "/hideplayer target", 0);
        assert!(matches!(outcome, ChatOutcome::ReplyToSender(ref s) if s == "player hidden"));
    }

    #[test]
    fn admin_hideip_hides_matching_clients_and_persists_on_registry() {
        let mut registry = Registry::new();
        registry.link(client(1, "admin", true));
        registry.link(client_at(2, "victim", false, "9.9.9.9:2000"));
        let outcome = handle_send_chat(&mut registry, ConnectionId(1), "/hideip 9.9.9.9", 0);
        assert!(matches!(outcome, ChatOutcome::ReplyToSender(ref s) if s == "ip hidden"));
        assert!(registry.get(ConnectionId(2)).unwrap().is_ignored_from_list);
        assert!(registry.is_ip_hidden("9.9.9.9".parse().unwrap()));

        let outcome = handle_send_chat(&mut registry, ConnectionId(1), "/unhideips", 0);
        assert!(matches!(outcome, ChatOutcome::ReplyToSender(ref s) if s == "cleared IP hidden list"));
        assert!(!registry.is_ip_hidden("9.9.9.9".parse().unwrap()));
    }
}
