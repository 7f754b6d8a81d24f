//! trailsync-sim library.
//!
//! Deterministic simulation of several [`trailsync_core::SyncEngine`]
//! clients sharing one in-memory mission server over a fault-injecting
//! network. A seed fixes every decision, so a failing run replays exactly.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod campaign;
pub mod client;
pub mod clock;
pub mod link;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod server;

use std::rc::Rc;

use anyhow::{Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trailsync_core::config::SyncConfig;
use trailsync_core::model::{EntityKind, Op};
use trailsync_core::resync::Trigger;
use trailsync_core::router::Routed;
use trailsync_core::store::MemoryStore;
use trailsync_core::{Session, SyncEngine};

use crate::client::{ClientOutcome, SimClient};
use crate::clock::{ClockConfig, RoundCounter, SimulatedClock};
use crate::link::{Hub, SharedHub, SimChannel, SimService, SimStats};
use crate::network::{ClientId, FaultConfig, SimulatedNetwork};
use crate::rng::DeterministicRng;
use crate::server::{ServerState, SimServer};

pub const MISSION_ID: &str = "mission-sim";

/// Rounds allowed for in-flight work to settle after healing.
const SETTLE_ROUNDS: u64 = 32;

/// Cascades (snapshot request, reply, ...) resolved within one round.
const MAX_DELIVERY_PASSES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub client_count: usize,
    pub rounds: u64,
    /// Initial mission retention.
    pub retention_seconds: u64,
    /// Chance per round that the mission retention is changed.
    pub retention_change_percent: u8,
    pub fault: FaultConfig,
    pub clock: ClockConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            client_count: 4,
            rounds: 90,
            retention_seconds: 45,
            retention_change_percent: 2,
            fault: FaultConfig::default(),
            clock: ClockConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if a parameter makes the run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.client_count == 0 {
            bail!("client_count must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.retention_seconds == 0 {
            bail!("retention_seconds must be > 0");
        }
        if self.clock.tick_millis <= 0 {
            bail!("clock.tick_millis must be > 0");
        }
        Ok(())
    }

    /// Engine configuration shared by every client.
    ///
    /// The purge interval is below one round so that every tick purges.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        let tick = u64::try_from(self.clock.tick_millis).unwrap_or(1_000);
        SyncConfig {
            retention_seconds: self.retention_seconds,
            purge_interval_ms: (tick / 2).max(1),
            initial_flush_delay_ms: tick.saturating_mul(2),
            ..SyncConfig::default()
        }
    }
}

/// One entry of the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub round: u64,
    pub client: Option<ClientId>,
    pub kind: TraceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEventKind {
    Disconnected,
    Reconnected {
        queued: usize,
    },
    Moved {
        t: i64,
    },
    Created {
        kind: EntityKind,
        title: String,
        local_id: String,
    },
    Recolored {
        kind: EntityKind,
        id: String,
        title: String,
    },
    Deleted {
        kind: EntityKind,
        id: String,
        title: String,
    },
    Foreground,
    StoppedSharing,
    MutationFailed {
        op: Op,
    },
    CreateConflicted {
        kind: EntityKind,
    },
    FrameDropped {
        event: String,
    },
    RetentionChanged {
        seconds: u64,
    },
    Healed,
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    /// Rounds including the settle phase.
    pub rounds_run: u64,
    pub trace: Vec<TraceEvent>,
    pub stats: SimStats,
    pub server: ServerState,
    pub clients: Vec<ClientOutcome>,
    /// A reconnect replayed a backlog while calls failed and frames were lost.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
    rounds: RoundCounter,
    hub: SharedHub,
    clients: Vec<SimClient>,
    rng: DeterministicRng,
    finished: bool,
}

impl Simulator {
    /// Wire up the server, the network and one engine per client.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;

        let root = DeterministicRng::new(config.seed);
        let rounds = RoundCounter::default();
        let mut server = SimServer::new(MISSION_ID, config.retention_seconds);
        let users: Vec<String> = (0..config.client_count).map(|id| format!("u{id}")).collect();
        for (id, user) in users.iter().enumerate() {
            server.register(id, user.clone());
        }
        let hub = Hub::new(
            server,
            SimulatedNetwork::new(config.fault),
            root.fork(1),
            SimulatedClock::new(config.clock.reference(), rounds.clone()),
            rounds.clone(),
        )
        .shared();

        let mut clock_rng = root.fork(2);
        let sync = config.sync_config();
        let clients = users
            .into_iter()
            .enumerate()
            .zip(100_u64..)
            .map(|((id, user), salt)| {
                let clock =
                    SimulatedClock::new(config.clock.assign(&mut clock_rng), rounds.clone());
                let engine = SyncEngine::new(
                    Session::new(MISSION_ID, user),
                    sync.clone(),
                    SimChannel::new(id, Rc::clone(&hub)),
                    SimService::new(id, Rc::clone(&hub)),
                    Box::new(MemoryStore::new()),
                    Box::new(clock.clone()),
                );
                SimClient::new(id, engine, clock, root.fork(salt))
            })
            .collect();

        Ok(Self {
            config,
            rounds,
            hub,
            clients,
            rng: root.fork(3),
            finished: false,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Run the faulty phase, heal, settle and collect the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the simulator was already run.
    pub fn run(&mut self) -> Result<SimulationResult> {
        ensure!(!self.finished, "simulation for seed {} already ran", self.config.seed);
        self.finished = true;
        info!(
            seed = self.config.seed,
            clients = self.config.client_count,
            rounds = self.config.rounds,
            "simulation started"
        );

        for client in &mut self.clients {
            client.engine_mut().resync(Trigger::Connect);
        }
        self.deliver();

        for round in 1..=self.config.rounds {
            self.rounds.set(round);
            self.step_links();
            self.step_mission();
            self.step_clients();
            self.deliver();
            self.tick_all();
        }

        self.heal();
        let settled_at = self.settle();
        let result = self.collect(settled_at);
        info!(
            seed = result.seed,
            rounds = result.rounds_run,
            frames = result.stats.frames_delivered,
            dropped = result.stats.frames_dropped,
            failures = result.stats.mutation_failures,
            "simulation complete"
        );
        Ok(result)
    }

    fn step_links(&mut self) {
        for client in &mut self.clients {
            let id = client.id();
            let change = {
                let mut hub = self.hub.borrow_mut();
                let fault = hub.network.fault_config();
                let online = hub.network.is_online(id);
                if online && hub.rng().hit_rate_percent(fault.disconnect_rate_percent) {
                    hub.network.set_online(id, false);
                    hub.server.leave(id);
                    hub.stats.disconnects += 1;
                    Some(false)
                } else if !online && hub.rng().hit_rate_percent(fault.reconnect_rate_percent) {
                    hub.network.set_online(id, true);
                    hub.stats.reconnects += 1;
                    Some(true)
                } else {
                    None
                }
            };
            if let Some(online) = change {
                let backlog = online && !client.engine().queue().is_empty();
                let event = client.link_changed(online);
                let mut hub = self.hub.borrow_mut();
                if backlog {
                    hub.stats.reconnects_with_backlog += 1;
                }
                hub.record(Some(id), event);
            }
        }
    }

    fn step_mission(&mut self) {
        let mut hub = self.hub.borrow_mut();
        let now = hub.now();
        hub.server.purge(now);
        if !self.rng.hit_rate_percent(self.config.retention_change_percent) {
            return;
        }
        let base = self.config.retention_seconds;
        let choices = [(base / 2).max(1), base, base.saturating_mul(2)];
        let Some(seconds) = self.rng.pick_index(choices.len()).map(|i| choices[i]) else {
            return;
        };
        if seconds == hub.server.retention_seconds() {
            return;
        }
        hub.server.set_retention_seconds(seconds, now);
        hub.dispatch();
        hub.stats.retention_changes += 1;
        hub.record(None, TraceEventKind::RetentionChanged { seconds });
    }

    fn step_clients(&mut self) {
        for client in &mut self.clients {
            if let Some(event) = client.act() {
                self.hub.borrow_mut().record(Some(client.id()), event);
            }
        }
    }

    /// Hand every due frame to its client, including frames those
    /// deliveries provoke within the same round.
    fn deliver(&mut self) {
        let round = self.rounds.get();
        for _ in 0..MAX_DELIVERY_PASSES {
            let ready = self.hub.borrow_mut().network.deliver_ready(round);
            if ready.is_empty() {
                return;
            }
            for delivery in ready {
                let Some(client) = self.clients.get_mut(delivery.to) else {
                    continue;
                };
                let routed = client.engine_mut().handle_raw(&delivery.frame);
                let mut hub = self.hub.borrow_mut();
                hub.stats.frames_delivered += 1;
                match routed {
                    Ok(Routed::Snapshot(_)) => hub.stats.snapshots_applied += 1,
                    Ok(_) => {}
                    Err(_) => hub.stats.malformed_frames += 1,
                }
            }
        }
        debug!(round, "delivery cascade cut short");
    }

    fn tick_all(&mut self) {
        for client in &mut self.clients {
            client.engine_mut().tick();
        }
    }

    /// Stop injecting faults and bring every link back.
    fn heal(&mut self) {
        let offline = {
            let mut hub = self.hub.borrow_mut();
            hub.network.heal();
            hub.record(None, TraceEventKind::Healed);
            let offline = hub.network.offline_clients();
            for id in &offline {
                hub.network.set_online(*id, true);
                hub.stats.reconnects += 1;
            }
            offline
        };
        for client in &mut self.clients {
            if offline.contains(&client.id()) {
                let event = client.link_changed(true);
                self.hub.borrow_mut().record(Some(client.id()), event);
            } else {
                client.engine_mut().resync(Trigger::Reconnect);
            }
        }
    }

    /// Advance fault-free rounds until nothing is in flight. Returns the
    /// last round used.
    fn settle(&mut self) -> u64 {
        let mut round = self.config.rounds;
        for _ in 0..SETTLE_ROUNDS {
            round += 1;
            self.rounds.set(round);
            self.deliver();
            self.tick_all();
            let idle = self.hub.borrow().network.pending_len() == 0
                && self.clients.iter().all(|c| c.engine().queue().is_empty());
            if idle {
                break;
            }
        }
        // One more purge tick so every trace is checked right after a purge.
        round += 1;
        self.rounds.set(round);
        self.tick_all();
        round
    }

    fn collect(&mut self, rounds_run: u64) -> SimulationResult {
        let listings: Vec<_> = {
            let hub = self.hub.borrow();
            [EntityKind::Poi, EntityKind::Zone]
                .into_iter()
                .map(|kind| (kind, hub.server.list(kind)))
                .collect()
        };
        let clients = self
            .clients
            .iter_mut()
            .map(|client| {
                let settled = client.cache_listing();
                for (kind, entities) in &listings {
                    client.engine_mut().reload_entities(*kind, entities.clone());
                }
                client.outcome(settled)
            })
            .collect();

        let mut hub = self.hub.borrow_mut();
        let stats = hub.stats;
        SimulationResult {
            seed: self.config.seed,
            rounds_run,
            trace: std::mem::take(&mut hub.trace),
            stats,
            server: hub.server.state(),
            clients,
            interesting_state_reached: stats.reconnects_with_backlog > 0
                && stats.mutation_failures > 0
                && stats.frames_dropped > 0,
        }
    }
}
