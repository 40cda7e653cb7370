mod config_file;
mod stores;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flux::clock::SystemClock;
use flux::logging::{info, warn};
use masterlib::config::{MasterConfig, StatsBackend};
use masterlib::context::MasterContext;
use masterlib::gateway::{GameStats, LevelInfo, PlayerProfile, StatsStore, TeamStats, PlayerStats};
use masterlib::{dispatch, globalchat, status};

use stores::{MysqlStatsStore, SqliteStatsStore, TableVerifier};

/// A connection rendezvous and directory server.
#[derive(Parser, Debug)]
#[command(name = "masterd")]
struct Cli {
    /// Path to the INI config file.
    #[arg(long, default_value = "master.ini")]
    config: PathBuf,

    /// Runs a one-shot self-test against the configured stats store and
    /// exits, instead of starting the server.
    #[arg(long, value_name = "NAME")]
    testdb: Option<String>,

    /// Verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

fn build_stats_store(config: &MasterConfig, log: &flux::logging::Logger) -> Arc<dyn StatsStore> {
    match config.stats_backend {
        StatsBackend::Sqlite => match SqliteStatsStore::open(&config.forum_db_address) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(log, "falling back to in-memory sqlite store"; "error" => format!("{err}"));
                Arc::new(SqliteStatsStore::open(":memory:").expect("in-memory sqlite always opens"))
            }
        },
        StatsBackend::Mysql => Arc::new(MysqlStatsStore),
        StatsBackend::None => Arc::new(SqliteStatsStore::open(":memory:").expect("in-memory sqlite always opens")),
    }
}

fn run_testdb(name: &str, log: &flux::logging::Logger) -> i32 {
    let store = match SqliteStatsStore::open(name) {
        Ok(store) => store,
        Err(err) => {
            eprintln!("could not open {name}: {err}");
            return 1;
        }
    };

    let stats = GameStats {
        server_name: "Test Server".to_string(),
        server_ip: "127.0.0.1:28000".to_string(),
        cs_protocol_version: 40,
        build_version: 1,
        game_type: "CTF".to_string(),
        level_name: "Fixture Level".to_string(),
        is_official: true,
        player_count: 2,
        duration_secs: 300,
        is_team_game: true,
        is_tied: false,
        team_stats: vec![TeamStats {
            color: "Red".to_string(),
            name: "Red Team".to_string(),
            score: 3,
            game_result: "Win".to_string(),
            player_stats: vec![PlayerStats {
                name: "chris".to_string(),
                nonce: 1,
                is_authenticated: true,
                points: 10,
                kills: 5,
                ..PlayerStats::default()
            }],
        }],
    };

    if let Err(err) = store.insert_stats(&stats) {
        eprintln!("insert_stats failed: {err}");
        return 1;
    }
    if let Err(err) = store.insert_level_info(&LevelInfo {
        hash: "fixture".to_string(),
        level_name: "Fixture Level".to_string(),
        creator: "chris".to_string(),
        game_type: "CTF".to_string(),
        has_level_gen: false,
        team_count: 2,
        winning_score: 5,
        duration_secs: 300,
    }) {
        eprintln!("insert_level_info failed: {err}");
        return 1;
    }
    if let Err(err) = store.insert_achievement(1, "chris", "Test Server", "127.0.0.1:28000") {
        eprintln!("insert_achievement failed: {err}");
        return 1;
    }

    info!(log, "testdb fixture written successfully"; "database" => name);
    0
}

fn main() {
    let cli = Cli::parse();
    let log = flux::logging::init(cli.verbose);
    let config = config_file::load(&cli.config);

    if let Some(name) = &cli.testdb {
        std::process::exit(run_testdb(name, &log));
    }

    info!(log, "master server starting"; "name" => config.master_name.clone(), "port" => config.listen_port);

    let stats = build_stats_store(&config, &log);
    let credentials = Arc::new(TableVerifier::new(HashMap::new()).with_profile("chris", PlayerProfile::default()));
    let clock = Arc::new(SystemClock::new());

    let mut ctx = MasterContext::new(config, clock, log.clone(), credentials, stats);

    // Worker thread: drains `run` off the main thread, sleeping 50ms
    // between drains, matching the original database-access thread.
    {
        let worker = ctx.worker.clone();
        std::thread::spawn(move || loop {
            worker.run_pending();
            std::thread::sleep(Duration::from_millis(50));
        });
    }

    // The reliable-UDP transport that feeds `dispatch::*` with decoded RPCs
    // is out of scope for this server (see DESIGN.md); this loop drives
    // every time-based piece of the dispatcher that doesn't require one.
    let mut last_config_read = ctx.now_ms();
    let mut last_status_write = ctx.now_ms().wrapping_sub(status::REWRITE_TIME_MS);

    loop {
        let worker = ctx.worker.clone();
        worker.finish_pending(&mut ctx);

        for event in std::mem::take(&mut ctx.outbound) {
            match event {
                dispatch::OutboundEvent::HighScores { client, .. } => {
                    info!(ctx.log, "high scores ready"; "client" => format!("{client:?}"));
                }
                dispatch::OutboundEvent::GlobalChatRenamed { old_name, new_name, recipients } => {
                    info!(ctx.log, "player renamed in global chat"; "from" => old_name, "to" => new_name, "recipients" => recipients.len());
                }
                dispatch::OutboundEvent::SetAuthenticated { client, status, name, games_played, variant, .. } => {
                    info!(ctx.log, "authentication result";
                        "client" => format!("{client:?}"), "status" => format!("{status:?}"),
                        "name" => name, "games_played" => games_played, "variant" => format!("{variant:?}"));
                }
                dispatch::OutboundEvent::Disconnect { client, reason } => {
                    warn!(ctx.log, "disconnecting client"; "client" => format!("{client:?}"), "reason" => reason.as_str());
                }
            }
        }

        let now_ms = ctx.now_ms();

        if now_ms.saturating_sub(last_config_read) > masterlib::config::REREAD_TIME_MS {
            last_config_read = now_ms;
            ctx.config = config_file::load(&cli.config);
        }

        for initiator in dispatch::sweep_rendezvous_timeouts(&mut ctx) {
            warn!(ctx.log, "rendezvous request timed out"; "initiator" => format!("{initiator:?}"));
        }

        for left in globalchat::sweep_pending_leaves(&mut ctx.registry, now_ms) {
            info!(ctx.log, "player left global chat"; "name" => left);
        }

        if let Some(delayed_at) = ctx.status_write_delayed_until {
            if now_ms.saturating_sub(delayed_at) > status::REWRITE_TIME_MS {
                ctx.registry.mark_dirty();
            }
        }

        if ctx.registry.is_dirty() && now_ms.saturating_sub(last_status_write) > status::REWRITE_TIME_MS {
            last_status_write = now_ms;
            ctx.registry.take_dirty();
            ctx.status_write_delayed_until = None;
            if let Some(path) = ctx.config.json_output_path.clone() {
                match status::build_status_json(&ctx.registry) {
                    Ok(json) => {
                        if let Err(err) = std::fs::write(&path, json) {
                            warn!(ctx.log, "could not write status file"; "path" => path, "error" => format!("{err}"));
                        }
                    }
                    Err(err) => warn!(ctx.log, "could not serialize status"; "error" => format!("{err}")),
                }
            }
        }

        std::thread::sleep(Duration::from_millis(5));
    }
}
