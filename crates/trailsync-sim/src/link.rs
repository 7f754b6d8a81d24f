//! Client-side transports wired to the shared simulated server.
//!
//! [`SimChannel`] and [`SimService`] are what a [`trailsync_core::SyncEngine`]
//! sees as its socket and REST client. Both go through the [`Hub`], which
//! owns the server, the network and the fault RNG. Realtime frames cross the
//! hub as encoded JSON so the wire format is exercised end to end.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use tracing::warn;
use trailsync_core::clock::{Clock, TimestampMs};
use trailsync_core::model::{Entity, EntityKind, Op, Payload};
use trailsync_core::protocol::Outbound;
use trailsync_core::queue::{MutationError, MutationService};
use trailsync_core::resync::{ChannelError, RealtimeChannel};

use crate::clock::{RoundCounter, SimulatedClock};
use crate::network::{ClientId, SimulatedNetwork};
use crate::rng::DeterministicRng;
use crate::server::SimServer;
use crate::{TraceEvent, TraceEventKind};

/// Counters collected over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub disconnects: usize,
    pub reconnects: usize,
    /// Reconnects that found unsent actions in the client's queue.
    pub reconnects_with_backlog: usize,
    pub mutation_calls: usize,
    pub mutation_failures: usize,
    /// Applied creates answered with an anonymous conflict.
    pub create_conflicts: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub frames_delivered: usize,
    pub malformed_frames: usize,
    pub snapshots_applied: usize,
    pub retention_changes: usize,
}

pub type SharedHub = Rc<RefCell<Hub>>;

pub struct Hub {
    pub server: SimServer,
    pub network: SimulatedNetwork,
    pub stats: SimStats,
    pub trace: Vec<TraceEvent>,
    rng: DeterministicRng,
    clock: SimulatedClock,
    rounds: RoundCounter,
}

impl Hub {
    #[must_use]
    pub fn new(
        server: SimServer,
        network: SimulatedNetwork,
        rng: DeterministicRng,
        clock: SimulatedClock,
        rounds: RoundCounter,
    ) -> Self {
        Self {
            server,
            network,
            stats: SimStats::default(),
            trace: Vec::new(),
            rng,
            clock,
            rounds,
        }
    }

    #[must_use]
    pub fn shared(self) -> SharedHub {
        Rc::new(RefCell::new(self))
    }

    #[must_use]
    pub fn round(&self) -> u64 {
        self.rounds.get()
    }

    /// Server wall time.
    #[must_use]
    pub fn now(&self) -> TimestampMs {
        self.clock.now_ms()
    }

    pub fn rng(&mut self) -> &mut DeterministicRng {
        &mut self.rng
    }

    pub fn record(&mut self, client: Option<ClientId>, kind: TraceEventKind) {
        let round = self.round();
        self.trace.push(TraceEvent {
            round,
            client,
            kind,
        });
    }

    /// Push the server outbox through the network.
    pub fn dispatch(&mut self) {
        let round = self.round();
        for (to, message) in self.server.drain_outbox() {
            let frame = match message.encode() {
                Ok(frame) => frame,
                Err(error) => {
                    warn!(%error, event = message.event(), "server frame not encodable");
                    continue;
                }
            };
            self.stats.frames_sent += 1;
            let outcome = self.network.send(to, frame, round, &mut self.rng);
            if outcome.dropped {
                self.stats.frames_dropped += 1;
                self.record(
                    Some(to),
                    TraceEventKind::FrameDropped {
                        event: message.event().to_string(),
                    },
                );
            }
        }
    }

    /// Decide whether a mutation call reaches the server.
    ///
    /// Injected failures happen before the server applies anything, so a
    /// failed call never leaves a half-applied mutation behind.
    fn admit(&mut self, client: ClientId, op: Op) -> Result<(), MutationError> {
        self.stats.mutation_calls += 1;
        if !self.network.is_online(client) {
            return Err(MutationError::Transport("network unreachable".into()));
        }
        let rate = self.network.fault_config().mutation_failure_percent;
        if self.rng.hit_rate_percent(rate) {
            self.stats.mutation_failures += 1;
            self.record(Some(client), TraceEventKind::MutationFailed { op });
            return Err(MutationError::Transport("injected failure".into()));
        }
        Ok(())
    }

    /// Decide whether an applied create is answered as a conflict that does
    /// not name the entity, as a server does for a retried create whose
    /// first response was lost.
    fn conflict_applied_create(&mut self, client: ClientId, kind: EntityKind) -> bool {
        let rate = self.network.fault_config().create_conflict_percent;
        if !self.rng.hit_rate_percent(rate) {
            return false;
        }
        self.stats.create_conflicts += 1;
        self.record(Some(client), TraceEventKind::CreateConflicted { kind });
        true
    }
}

/// Realtime socket of one client.
pub struct SimChannel {
    client: ClientId,
    hub: SharedHub,
}

impl SimChannel {
    #[must_use]
    pub const fn new(client: ClientId, hub: SharedHub) -> Self {
        Self { client, hub }
    }
}

impl RealtimeChannel for SimChannel {
    fn is_connected(&self) -> bool {
        self.hub.borrow().network.is_online(self.client)
    }

    fn emit(&mut self, message: &Outbound) -> Result<(), ChannelError> {
        let mut hub = self.hub.borrow_mut();
        if !hub.network.is_online(self.client) {
            return Err(ChannelError::Disconnected);
        }
        let frame = message
            .encode()
            .map_err(|e| ChannelError::Send(e.to_string()))?;
        let decoded = Outbound::decode(&frame).map_err(|e| ChannelError::Send(e.to_string()))?;
        let now = hub.now();
        hub.server.receive(self.client, decoded, now);
        hub.dispatch();
        Ok(())
    }
}

/// REST client of one client.
pub struct SimService {
    client: ClientId,
    hub: SharedHub,
}

impl SimService {
    #[must_use]
    pub const fn new(client: ClientId, hub: SharedHub) -> Self {
        Self { client, hub }
    }
}

impl MutationService for SimService {
    fn create(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        payload: &Payload,
    ) -> Result<Entity, MutationError> {
        let mut hub = self.hub.borrow_mut();
        hub.admit(self.client, Op::Create)?;
        let entity = hub.server.create(kind, mission_id, payload)?;
        hub.dispatch();
        if hub.conflict_applied_create(self.client, kind) {
            return Err(MutationError::Conflict { existing: None });
        }
        Ok(entity)
    }

    fn update(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        id: &str,
        patch: &Payload,
    ) -> Result<Entity, MutationError> {
        let mut hub = self.hub.borrow_mut();
        hub.admit(self.client, Op::Update)?;
        let entity = hub.server.update(kind, mission_id, id, patch)?;
        hub.dispatch();
        Ok(entity)
    }

    fn delete(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        id: &str,
    ) -> Result<(), MutationError> {
        let mut hub = self.hub.borrow_mut();
        hub.admit(self.client, Op::Delete)?;
        hub.server.delete(kind, mission_id, id)?;
        hub.dispatch();
        Ok(())
    }
}
