//! In-memory mission server: REST-style mutations plus a realtime room.
//!
//! The server never talks to the network directly. Everything it wants to
//! send lands in an outbox of `(recipient, Inbound)` pairs that the hub
//! drains through the fault-injecting [`crate::network::SimulatedNetwork`].

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};
use trailsync_core::clock::TimestampMs;
use trailsync_core::model::{Entity, EntityKind, Payload, merge_payload};
use trailsync_core::protocol::{EntityRef, Inbound, Outbound, PeerPosition, SnapshotMessage};
use trailsync_core::queue::MutationError;
use trailsync_core::trace::TraceStore;

use crate::network::ClientId;

/// Final server contents, for the oracle and reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerState {
    pub retention_seconds: u64,
    pub entities: BTreeMap<EntityKind, Vec<Entity>>,
    pub creates_applied: usize,
}

impl ServerState {
    /// Server entities carrying `title`, across both kinds.
    #[must_use]
    pub fn count_titled(&self, title: &str) -> usize {
        self.entities
            .values()
            .flatten()
            .filter(|e| e.str_field("title") == Some(title))
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct SimServer {
    mission_id: String,
    retention_seconds: u64,
    entities: BTreeMap<EntityKind, BTreeMap<String, Entity>>,
    next_id: u64,
    creates_applied: usize,
    users: BTreeMap<ClientId, String>,
    room: BTreeSet<ClientId>,
    traces: TraceStore,
    outbox: Vec<(ClientId, Inbound)>,
}

impl SimServer {
    #[must_use]
    pub fn new(mission_id: impl Into<String>, retention_seconds: u64) -> Self {
        Self {
            mission_id: mission_id.into(),
            retention_seconds,
            entities: BTreeMap::new(),
            next_id: 0,
            creates_applied: 0,
            users: BTreeMap::new(),
            room: BTreeSet::new(),
            traces: TraceStore::new(retention_seconds.saturating_mul(1_000)),
            outbox: Vec::new(),
        }
    }

    #[must_use]
    pub fn mission_id(&self) -> &str {
        &self.mission_id
    }

    #[must_use]
    pub const fn retention_seconds(&self) -> u64 {
        self.retention_seconds
    }

    /// Associate a connection slot with a user.
    pub fn register(&mut self, client: ClientId, user_id: impl Into<String>) {
        self.users.insert(client, user_id.into());
    }

    /// Socket closed: the client leaves the room.
    pub fn leave(&mut self, client: ClientId) {
        if self.room.remove(&client) {
            trace!(client, "left room");
        }
    }

    #[must_use]
    pub fn in_room(&self, client: ClientId) -> bool {
        self.room.contains(&client)
    }

    /// Take everything queued for delivery.
    pub fn drain_outbox(&mut self) -> Vec<(ClientId, Inbound)> {
        std::mem::take(&mut self.outbox)
    }

    /// Handle one realtime frame from `client`.
    pub fn receive(&mut self, client: ClientId, message: Outbound, now: TimestampMs) {
        let Some(user) = self.users.get(&client).cloned() else {
            debug!(client, event = message.event(), "frame from unregistered client");
            return;
        };
        match message {
            Outbound::MissionJoin { mission_id } => {
                if mission_id == self.mission_id {
                    self.room.insert(client);
                }
            }
            Outbound::SnapshotRequest { mission_id } => {
                if mission_id == self.mission_id && self.room.contains(&client) {
                    let snapshot = self.snapshot(now);
                    self.outbox.push((client, Inbound::Snapshot(snapshot)));
                }
            }
            Outbound::PositionUpdate(sample) => {
                self.traces.append(&user, sample, now);
                self.broadcast(
                    Some(client),
                    &Inbound::PositionUpdate(PeerPosition {
                        user_id: user,
                        sample,
                    }),
                );
            }
            Outbound::PositionBulk { points } => {
                self.traces.extend(&user, points.iter().copied(), now);
                self.broadcast(
                    Some(client),
                    &Inbound::PositionBulk {
                        user_id: user,
                        points,
                    },
                );
            }
            Outbound::PositionClear {} => {
                self.traces.clear(&user);
                let mission_id = Some(self.mission_id.clone());
                self.broadcast(
                    Some(client),
                    &Inbound::PositionClear {
                        user_id: user,
                        mission_id,
                    },
                );
            }
        }
    }

    /// Change the mission retention and tell the room.
    pub fn set_retention_seconds(&mut self, seconds: u64, now: TimestampMs) {
        let seconds = seconds.max(1);
        self.retention_seconds = seconds;
        self.traces.set_retention(seconds.saturating_mul(1_000), now);
        let message = Inbound::MissionUpdated {
            mission_id: self.mission_id.clone(),
            retention_seconds: Some(seconds),
        };
        self.broadcast(None, &message);
    }

    pub fn purge(&mut self, now: TimestampMs) -> usize {
        self.traces.purge_tick(now)
    }

    /// Apply a create.
    ///
    /// # Errors
    ///
    /// Rejects creates addressed to another mission.
    pub fn create(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        payload: &Payload,
    ) -> Result<Entity, MutationError> {
        self.check_mission(mission_id)?;
        self.next_id += 1;
        let mut fields = payload.clone();
        fields.insert("missionId".into(), Value::String(self.mission_id.clone()));
        let entity = Entity::new(format!("srv-{:06}", self.next_id), fields);
        self.entities
            .entry(kind)
            .or_default()
            .insert(entity.id.clone(), entity.clone());
        self.creates_applied += 1;
        self.broadcast(None, &created(kind, entity.clone()));
        Ok(entity)
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; rejects other missions.
    pub fn update(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        id: &str,
        patch: &Payload,
    ) -> Result<Entity, MutationError> {
        self.check_mission(mission_id)?;
        let Some(entity) = self.entities.entry(kind).or_default().get_mut(id) else {
            return Err(MutationError::NotFound(id.to_string()));
        };
        merge_payload(&mut entity.fields, patch);
        let entity = entity.clone();
        self.broadcast(None, &updated(kind, entity.clone()));
        Ok(entity)
    }

    /// Apply a delete.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids; rejects other missions.
    pub fn delete(
        &mut self,
        kind: EntityKind,
        mission_id: &str,
        id: &str,
    ) -> Result<(), MutationError> {
        self.check_mission(mission_id)?;
        if self.entities.entry(kind).or_default().remove(id).is_none() {
            return Err(MutationError::NotFound(id.to_string()));
        }
        let target = EntityRef {
            id: id.to_string(),
            mission_id: Some(self.mission_id.clone()),
        };
        self.broadcast(None, &deleted(kind, target));
        Ok(())
    }

    /// Current listing of `kind`, as a client's reload would fetch it.
    #[must_use]
    pub fn list(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .get(&kind)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        ServerState {
            retention_seconds: self.retention_seconds,
            entities: [EntityKind::Poi, EntityKind::Zone]
                .into_iter()
                .map(|kind| (kind, self.list(kind)))
                .collect(),
            creates_applied: self.creates_applied,
        }
    }

    fn check_mission(&self, mission_id: &str) -> Result<(), MutationError> {
        if mission_id == self.mission_id {
            Ok(())
        } else {
            Err(MutationError::Rejected {
                status: 404,
                message: format!("unknown mission {mission_id}"),
            })
        }
    }

    fn snapshot(&mut self, now: TimestampMs) -> SnapshotMessage {
        self.traces.purge_tick(now);
        let positions = self
            .traces
            .subjects()
            .into_iter()
            .filter_map(|s| self.traces.last_known(&s).map(|p| (s, p)))
            .collect();
        SnapshotMessage {
            mission_id: self.mission_id.clone(),
            positions,
            traces: self.traces.export_except(""),
            retention_seconds: Some(self.retention_seconds),
        }
    }

    fn broadcast(&mut self, except: Option<ClientId>, message: &Inbound) {
        for client in &self.room {
            if Some(*client) != except {
                self.outbox.push((*client, message.clone()));
            }
        }
    }
}

fn created(kind: EntityKind, entity: Entity) -> Inbound {
    match kind {
        EntityKind::Poi => Inbound::PoiCreated(entity),
        EntityKind::Zone => Inbound::ZoneCreated(entity),
    }
}

fn updated(kind: EntityKind, entity: Entity) -> Inbound {
    match kind {
        EntityKind::Poi => Inbound::PoiUpdated(entity),
        EntityKind::Zone => Inbound::ZoneUpdated(entity),
    }
}

fn deleted(kind: EntityKind, target: EntityRef) -> Inbound {
    match kind {
        EntityKind::Poi => Inbound::PoiDeleted(target),
        EntityKind::Zone => Inbound::ZoneDeleted(target),
    }
}
