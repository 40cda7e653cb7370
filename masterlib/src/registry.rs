use std::net::IpAddr;

use indexmap::IndexMap;

use crate::connection::{Connection, ConnectionId, RoleState};

/// Which list a connection is (or isn't) linked into. Exactly one of these
/// holds for every `Connection` known to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Server,
    Client,
    Anonymous,
}

/// Owns the live set of connections. No locks: the registry is only ever
/// touched from the main thread.
#[derive(Default)]
pub struct Registry {
    servers: IndexMap<ConnectionId, Connection>,
    clients: IndexMap<ConnectionId, Connection>,
    anonymous: IndexMap<ConnectionId, Connection>,
    status_dirty: bool,
    /// Process-wide hidden-IP list built by the `hideip`/`unhideips` admin
    /// chat commands, on top of whatever the config file seeded at startup.
    hidden_ips: Vec<IpAddr>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Links a connection into the list matching its current `role`.
    /// Replaces any prior membership for the same id first, so calling
    /// `link` twice for one id moves it rather than duplicating it.
    pub fn link(&mut self, conn: Connection) {
        self.unlink(conn.id);
        match conn.role {
            RoleState::Server(_) => {
                self.servers.insert(conn.id, conn);
            }
            RoleState::Client(_) => {
                self.clients.insert(conn.id, conn);
            }
            RoleState::Anonymous => {
                self.anonymous.insert(conn.id, conn);
            }
        }
        self.status_dirty = true;
    }

    /// Removes a connection from whichever list holds it, if any. Safe to
    /// call mid-iteration of a different list.
    pub fn unlink(&mut self, id: ConnectionId) -> Option<Connection> {
        if let Some(conn) = self.servers.shift_remove(&id) {
            self.status_dirty = true;
            return Some(conn);
        }
        if let Some(conn) = self.clients.shift_remove(&id) {
            self.status_dirty = true;
            return Some(conn);
        }
        self.anonymous.shift_remove(&id)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.servers
            .get(&id)
            .or_else(|| self.clients.get(&id))
            .or_else(|| self.anonymous.get(&id))
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        if self.servers.contains_key(&id) {
            return self.servers.get_mut(&id);
        }
        if self.clients.contains_key(&id) {
            return self.clients.get_mut(&id);
        }
        self.anonymous.get_mut(&id)
    }

    pub fn servers(&self) -> impl Iterator<Item = &Connection> {
        self.servers.values()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Connection> {
        self.clients.values()
    }

    pub fn servers_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.servers.values_mut()
    }

    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.clients.values_mut()
    }

    pub fn find_server_by_addr(&self, addr: std::net::SocketAddr) -> Option<&Connection> {
        self.servers.values().find(|c| c.addr == addr)
    }

    /// Finds the unique client with the given player-id nonce, if any.
    pub fn find_client_by_nonce(&self, nonce: u64) -> Option<&Connection> {
        self.clients
            .values()
            .find(|c| c.client_state().map(|s| s.player_id) == Some(nonce))
    }

    pub fn find_client_by_name_ci(&self, name: &str) -> Option<&Connection> {
        self.clients.values().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn mark_dirty(&mut self) {
        self.status_dirty = true;
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.status_dirty, false)
    }

    pub fn is_dirty(&self) -> bool {
        self.status_dirty
    }

    /// Adds `ip` to the runtime hidden-IP list if it isn't already there.
    /// Returns whether it was newly added.
    pub fn hide_ip(&mut self, ip: IpAddr) -> bool {
        if self.hidden_ips.contains(&ip) {
            false
        } else {
            self.hidden_ips.push(ip);
            true
        }
    }

    pub fn unhide_ips(&mut self) {
        self.hidden_ips.clear();
    }

    pub fn is_ip_hidden(&self, ip: IpAddr) -> bool {
        self.hidden_ips.contains(&ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ClientState, RoleState};
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn client(id: u64, nonce: u64) -> Connection {
        let mut c = Connection::new(ConnectionId(id), addr(1000 + id as u16));
        c.role = RoleState::Client(ClientState { player_id: nonce, ..Default::default() });
        c
    }

    #[test]
    fn link_then_unlink_leaves_no_membership() {
        let mut reg = Registry::new();
        reg.link(client(1, 42));
        assert!(reg.find_client_by_nonce(42).is_some());
        reg.unlink(ConnectionId(1));
        assert!(reg.find_client_by_nonce(42).is_none());
        assert_eq!(reg.client_count(), 0);
    }

    #[test]
    fn relinking_moves_membership_without_duplicating() {
        let mut reg = Registry::new();
        let mut c = client(1, 42);
        reg.link(c.clone());
        c.role = RoleState::Anonymous;
        reg.link(c);
        assert_eq!(reg.client_count(), 0);
        assert!(reg.get(ConnectionId(1)).is_some());
    }

    #[test]
    fn unrelated_churn_does_not_dirty_status() {
        let mut reg = Registry::new();
        reg.link(client(1, 42));
        reg.take_dirty();
        assert!(!reg.is_dirty());
    }
}
