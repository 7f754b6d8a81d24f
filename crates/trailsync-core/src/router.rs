//! Fan-in of realtime events and the single outbound path for mutations.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::cache::{EntityCache, Mutation};
use crate::clock::TimestampMs;
use crate::error::ErrorCode;
use crate::model::{Entity, EntityKind};
use crate::protocol::{Inbound, SnapshotMessage};
use crate::queue::{Compaction, OfflineQueue};
use crate::trace::{AppendOutcome, RetentionChange, TraceStore};

/// Display metadata for a mission member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub name: Option<String>,
    pub color: Option<String>,
    pub sharing_location: bool,
}

/// Members seen through `member:updated`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDirectory {
    peers: BTreeMap<String, PeerInfo>,
}

impl PeerDirectory {
    /// Merge the present fields into the member's entry.
    pub fn update(
        &mut self,
        user_id: &str,
        name: Option<&str>,
        color: Option<&str>,
        sharing_location: Option<bool>,
    ) {
        let entry = self
            .peers
            .entry(user_id.to_string())
            .or_insert_with(|| PeerInfo {
                sharing_location: true,
                ..PeerInfo::default()
            });
        if let Some(name) = name {
            entry.name = Some(name.to_string());
        }
        if let Some(color) = color {
            entry.color = Some(color.to_string());
        }
        if let Some(sharing) = sharing_location {
            entry.sharing_location = sharing;
        }
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&PeerInfo> {
        self.peers.get(user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PeerInfo)> {
        self.peers.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Why an inbound event changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Our own position broadcast echoed back.
    OwnEcho,
    WrongMission,
    /// Already applied, expired, or nothing to remove.
    NoChange,
}

/// What routing an inbound event did.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Applied,
    Skipped(Skip),
    /// Snapshots are reconciled by the resync protocol, not here.
    Snapshot(SnapshotMessage),
    RetentionChanged(RetentionChange),
}

#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    mission_id: String,
    self_id: String,
    cache: EntityCache,
    peers: PeerDirectory,
}

impl BroadcastRouter {
    #[must_use]
    pub fn new(mission_id: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            mission_id: mission_id.into(),
            self_id: self_id.into(),
            cache: EntityCache::new(),
            peers: PeerDirectory::default(),
        }
    }

    #[must_use]
    pub const fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut EntityCache {
        &mut self.cache
    }

    #[must_use]
    pub const fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Optimistic local apply, then enqueue. Every UI mutation goes through
    /// here whether or not the channel is up.
    pub fn submit(
        &mut self,
        queue: &mut OfflineQueue,
        mutation: &Mutation,
        now: TimestampMs,
    ) -> Compaction {
        self.cache.apply_optimistic(mutation);
        queue.enqueue(mutation.to_action(now))
    }

    /// Dispatch one validated inbound event.
    pub fn route(&mut self, message: Inbound, traces: &mut TraceStore, now: TimestampMs) -> Routed {
        match message {
            Inbound::Snapshot(snapshot) => Routed::Snapshot(snapshot),

            Inbound::PositionUpdate(peer) => {
                if peer.user_id == self.self_id {
                    return Routed::Skipped(Skip::OwnEcho);
                }
                match traces.append(&peer.user_id, peer.sample, now) {
                    AppendOutcome::Inserted => Routed::Applied,
                    outcome => {
                        trace!(user = %peer.user_id, ?outcome, "peer position not stored");
                        Routed::Skipped(Skip::NoChange)
                    }
                }
            }

            Inbound::PositionBulk { user_id, points } => {
                if user_id == self.self_id {
                    return Routed::Skipped(Skip::OwnEcho);
                }
                if traces.extend(&user_id, points, now) > 0 {
                    Routed::Applied
                } else {
                    Routed::Skipped(Skip::NoChange)
                }
            }

            Inbound::PositionClear {
                user_id,
                mission_id,
            } => {
                if !self.is_this_mission(mission_id.as_deref()) {
                    return Routed::Skipped(Skip::WrongMission);
                }
                if user_id == self.self_id {
                    return Routed::Skipped(Skip::OwnEcho);
                }
                changed(traces.clear(&user_id))
            }

            Inbound::PoiCreated(entity) | Inbound::PoiUpdated(entity) => {
                self.upsert(EntityKind::Poi, entity)
            }
            Inbound::ZoneCreated(entity) | Inbound::ZoneUpdated(entity) => {
                self.upsert(EntityKind::Zone, entity)
            }
            Inbound::PoiDeleted(target) => {
                if !self.is_this_mission(target.mission_id.as_deref()) {
                    return Routed::Skipped(Skip::WrongMission);
                }
                changed(self.cache.remove(EntityKind::Poi, &target.id))
            }
            Inbound::ZoneDeleted(target) => {
                if !self.is_this_mission(target.mission_id.as_deref()) {
                    return Routed::Skipped(Skip::WrongMission);
                }
                changed(self.cache.remove(EntityKind::Zone, &target.id))
            }

            Inbound::MemberUpdated {
                user_id,
                mission_id,
                name,
                color,
                sharing_location,
            } => {
                if !self.is_this_mission(mission_id.as_deref()) {
                    return Routed::Skipped(Skip::WrongMission);
                }
                if user_id == self.self_id {
                    return Routed::Skipped(Skip::OwnEcho);
                }
                self.peers.update(
                    &user_id,
                    name.as_deref(),
                    color.as_deref(),
                    sharing_location,
                );
                if sharing_location == Some(false) && traces.clear(&user_id) {
                    debug!(user = %user_id, "peer stopped sharing, trace cleared");
                }
                Routed::Applied
            }

            Inbound::MissionUpdated {
                mission_id,
                retention_seconds,
            } => {
                if !self.is_this_mission(Some(&mission_id)) {
                    return Routed::Skipped(Skip::WrongMission);
                }
                match retention_seconds {
                    Some(seconds) if seconds > 0 => Routed::RetentionChanged(
                        traces.set_retention(seconds.saturating_mul(1_000), now),
                    ),
                    _ => Routed::Skipped(Skip::NoChange),
                }
            }
        }
    }

    fn upsert(&mut self, kind: EntityKind, entity: Entity) -> Routed {
        if !self.is_this_mission(entity.str_field("missionId")) {
            return Routed::Skipped(Skip::WrongMission);
        }
        self.cache.upsert(kind, entity);
        Routed::Applied
    }

    fn is_this_mission(&self, mission_id: Option<&str>) -> bool {
        let matches = mission_id.is_none_or(|id| id == self.mission_id);
        if !matches {
            debug!(
                expected = %self.mission_id,
                got = mission_id.unwrap_or_default(),
                code = %ErrorCode::WrongMission,
                "dropping event for another mission"
            );
        }
        matches
    }
}

const fn changed(did_change: bool) -> Routed {
    if did_change {
        Routed::Applied
    } else {
        Routed::Skipped(Skip::NoChange)
    }
}
