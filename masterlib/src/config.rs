use std::net::IpAddr;

/// Static configuration, loaded at startup from an INI file and re-read
/// every `REREAD_TIME` by the main loop.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub master_name: String,
    pub listen_port: u16,
    pub json_output_path: Option<String>,
    pub stats_backend: StatsBackend,
    pub forum_db_address: String,
    pub forum_db_username: String,
    pub forum_db_password: String,
    pub forum_table_prefix: String,
    /// Latest released client-server protocol version and build number,
    /// used to decide whether a connecting client gets an upgrade notice.
    pub latest_cs_protocol_version: u32,
    pub latest_build_version: u32,
    pub motd_default_message: String,
    pub master_admins: Vec<String>,
    pub hidden_ips: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsBackend {
    Sqlite,
    Mysql,
    None,
}

/// How often the main loop re-reads the config file from disk.
pub const REREAD_TIME_MS: u64 = 5000;

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            master_name: "Bitfighter Master Server".to_string(),
            listen_port: 25955,
            json_output_path: None,
            stats_backend: StatsBackend::None,
            forum_db_address: String::new(),
            forum_db_username: String::new(),
            forum_db_password: String::new(),
            forum_table_prefix: "phpbb_".to_string(),
            latest_cs_protocol_version: 0,
            latest_build_version: 0,
            motd_default_message: String::new(),
            master_admins: Vec::new(),
            hidden_ips: Vec::new(),
        }
    }
}
