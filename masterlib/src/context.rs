use std::sync::Arc;

use flux::logging::Logger;
use flux::Clock;

use crate::config::MasterConfig;
use crate::dispatch::OutboundEvent;
use crate::gateway::{CredentialVerifier, StatsStore};
use crate::highscore::HighScoreCache;
use crate::motd::MotdTable;
use crate::registry::Registry;
use crate::rendezvous::RendezvousTable;
use crate::worker::WorkerQueue;

/// Everything a dispatch handler needs, bundled and passed explicitly.
/// Nothing in `masterlib` reads ambient/global state; every operation takes
/// `&mut MasterContext` (or the narrower piece of it it needs).
pub struct MasterContext {
    pub registry: Registry,
    pub rendezvous: RendezvousTable,
    pub worker: Arc<WorkerQueue<MasterContext>>,
    pub high_scores: HighScoreCache,
    pub motd: MotdTable,
    pub config: MasterConfig,
    pub clock: Arc<dyn Clock>,
    pub log: Logger,
    pub credentials: Arc<dyn CredentialVerifier>,
    pub stats: Arc<dyn StatsStore>,
    /// Events a worker task's `finish` produced that need to go back out
    /// over the transport (out of scope here — see DESIGN.md). Pushed by
    /// `finish` implementations, drained by the caller once per main-loop
    /// iteration.
    pub outbound: Vec<OutboundEvent>,
    /// Set when a client was linked while its authentication result was
    /// still unknown (the `UnknownStatus` branch of the connect handshake).
    /// The main loop should treat the registry as dirty again once
    /// `status::REWRITE_TIME_MS` has elapsed since this timestamp, so the
    /// JSON status file doesn't briefly show the client as unauthenticated
    /// (`gNeedToWriteStatusDelayed` in the original — §4.11/§9).
    pub status_write_delayed_until: Option<u64>,
}

impl MasterContext {
    pub fn new(
        config: MasterConfig,
        clock: Arc<dyn Clock>,
        log: Logger,
        credentials: Arc<dyn CredentialVerifier>,
        stats: Arc<dyn StatsStore>,
    ) -> Self {
        let motd = MotdTable::new(config.motd_default_message.clone());
        let worker = Arc::new(WorkerQueue::new(log.clone()));
        MasterContext {
            registry: Registry::new(),
            rendezvous: RendezvousTable::new(),
            worker,
            high_scores: HighScoreCache::new(),
            motd,
            config,
            clock,
            log,
            credentials,
            stats,
            outbound: Vec::new(),
            status_write_delayed_until: None,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
