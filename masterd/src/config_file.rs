use std::net::IpAddr;
use std::path::Path;

use configparser::ini::Ini;
use masterlib::config::{MasterConfig, StatsBackend};

/// Loads `MasterConfig` from an INI file, falling back to the built-in
/// defaults for any section/key that's absent. Mirrors `readConfigFile`'s
/// tolerance of a missing or partial config file on first run.
pub fn load(path: &Path) -> MasterConfig {
    let mut config = MasterConfig::default();
    let mut ini = Ini::new();
    let Some(path) = path.to_str() else { return config };
    if ini.load(path).is_err() {
        return config;
    }

    if let Some(name) = ini.get("host", "master_name") {
        config.master_name = name;
    }
    if let Ok(Some(port)) = ini.getuint("host", "master_port") {
        config.listen_port = port as u16;
    }
    if let Some(path) = ini.get("host", "json_status_file") {
        config.json_output_path = Some(path);
    }

    config.stats_backend = match ini.get("stats", "backend").as_deref() {
        Some("sqlite") => StatsBackend::Sqlite,
        Some("mysql") => StatsBackend::Mysql,
        _ => StatsBackend::None,
    };

    config.forum_db_address = ini.get("forum_database", "address").unwrap_or_default();
    config.forum_db_username = ini.get("forum_database", "username").unwrap_or_default();
    config.forum_db_password = ini.get("forum_database", "password").unwrap_or_default();
    if let Some(prefix) = ini.get("forum_database", "table_prefix") {
        config.forum_table_prefix = prefix;
    }

    if let Ok(Some(v)) = ini.getuint("version", "latest_cs_protocol") {
        config.latest_cs_protocol_version = v as u32;
    }
    if let Ok(Some(v)) = ini.getuint("version", "latest_build") {
        config.latest_build_version = v as u32;
    }

    if let Some(msg) = ini.get("motd", "default") {
        config.motd_default_message = msg;
    }

    if let Some(names) = ini.get_map_ref().get("admins") {
        config.master_admins = names.values().flatten().cloned().collect();
    }

    if let Some(addrs) = ini.get_map_ref().get("hidden_ips") {
        config.hidden_ips = addrs.values().flatten().filter_map(|addr| addr.parse::<IpAddr>().ok()).collect();
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load(Path::new("/nonexistent/master.ini"));
        assert_eq!(config.listen_port, 25955);
    }

    #[test]
    fn loads_master_name_and_port() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[host]\nmaster_name = Test Master\nmaster_port = 12345\n").unwrap();
        let config = load(file.path());
        assert_eq!(config.master_name, "Test Master");
        assert_eq!(config.listen_port, 12345);
    }
}
