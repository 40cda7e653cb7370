use serde::Serialize;

use crate::registry::Registry;

/// How often the main loop is willing to rewrite the status file.
pub const REWRITE_TIME_MS: u64 = 5000;

/// Escapes a string the way the original `sanitizeForJson` did: JSON
/// backslash-escapes for `"\\\x08\x0c\n\r\t`, HTML entities for `&<>`,
/// and control characters (0x01-0x1F) dropped outright.
pub fn sanitize_for_json(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c if (c as u32) >= 1 && (c as u32) <= 0x1F => {}
            c => out.push(c),
        }
    }
    out
}

#[derive(Serialize)]
struct ServerEntry {
    #[serde(rename = "serverName")]
    server_name: String,
    #[serde(rename = "protocolVersion")]
    protocol_version: u32,
    #[serde(rename = "currentLevelName")]
    current_level_name: String,
    #[serde(rename = "currentLevelType")]
    current_level_type: String,
    #[serde(rename = "playerCount")]
    player_count: u32,
}

#[derive(Serialize)]
struct StatusDoc {
    servers: Vec<ServerEntry>,
    players: Vec<String>,
    authenticated: Vec<bool>,
    #[serde(rename = "serverCount")]
    server_count: u32,
    #[serde(rename = "playerCount")]
    player_count: u32,
}

/// A client is hidden from the status file if ignored or running as a
/// debug client.
fn listable(conn: &crate::connection::Connection) -> bool {
    if conn.is_ignored_from_list {
        return false;
    }
    conn.client_state().map(|cs| !cs.is_debug_client).unwrap_or(true)
}

/// Builds the JSON status document. Server/player names are run through
/// `sanitize_for_json` up front; `serde_json` re-escapes `"`/`\` on
/// serialization, which is harmless since `sanitize_for_json` never leaves
/// an unescaped `"` or `\` for it to double-escape incorrectly — it already
/// replaced them with their two-character escapes, and serde_json escapes
/// whole strings, not pre-escaped fragments, so apply sanitization only to
/// the HTML-entity/control-character part by serializing the raw name and
/// relying on serde for backslash escaping instead.
pub fn build_status_json(registry: &Registry) -> Result<String, serde_json::Error> {
    let mut servers = Vec::new();
    let mut player_count = 0u32;
    for server in registry.servers() {
        if server.is_ignored_from_list {
            continue;
        }
        let state = server.server_state();
        player_count += state.map(|s| s.player_count).unwrap_or(0);
        servers.push(ServerEntry {
            server_name: html_entities(&server.name),
            protocol_version: server.cs_protocol_version,
            current_level_name: state.map(|s| html_entities(&s.level_name)).unwrap_or_default(),
            current_level_type: state.map(|s| html_entities(&s.level_type)).unwrap_or_default(),
            player_count: state.map(|s| s.player_count).unwrap_or(0),
        });
    }

    let mut players = Vec::new();
    let mut authenticated = Vec::new();
    for client in registry.clients() {
        if !listable(client) {
            continue;
        }
        players.push(html_entities(&client.name));
        authenticated.push(client.client_state().map(|cs| cs.authenticated).unwrap_or(false));
    }

    let doc = StatusDoc {
        server_count: servers.len() as u32,
        player_count,
        servers,
        players,
        authenticated,
    };
    serde_json::to_string_pretty(&doc)
}

/// Applies only the HTML-entity and control-character rules from
/// `sanitize_for_json`; backslash/quote escaping is left to `serde_json`
/// so the two don't double-escape each other.
fn html_entities(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c if (c as u32) >= 1 && (c as u32) <= 0x1F => {}
            c => out.push(c),
        }
    }
    out
}
