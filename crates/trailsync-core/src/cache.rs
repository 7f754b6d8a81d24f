//! Local POI and zone cache.
//!
//! Holds what the UI renders: server-confirmed entities plus optimistic
//! ones still keyed by a local id. Inbound broadcasts overwrite by id, so
//! replaying an already-applied event is a no-op.

use std::collections::BTreeMap;

use tracing::debug;

use crate::clock::TimestampMs;
use crate::model::{Entity, EntityKind, Payload, is_local_id, merge_payload};
use crate::queue::{ConfirmationSink, PendingAction};

/// A user-initiated change, before it becomes a queued action.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create {
        kind: EntityKind,
        local_id: String,
        payload: Payload,
    },
    Update {
        kind: EntityKind,
        id: String,
        patch: Payload,
    },
    Delete {
        kind: EntityKind,
        id: String,
    },
}

impl Mutation {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Create { kind, .. } | Self::Update { kind, .. } | Self::Delete { kind, .. } => {
                *kind
            }
        }
    }

    /// Id of the entity this mutation touches.
    #[must_use]
    pub fn target_id(&self) -> &str {
        match self {
            Self::Create { local_id, .. } => local_id,
            Self::Update { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    /// The queue entry for this mutation.
    #[must_use]
    pub fn to_action(&self, t: TimestampMs) -> PendingAction {
        match self {
            Self::Create {
                kind,
                local_id,
                payload,
            } => PendingAction::create(*kind, local_id.clone(), payload.clone(), t),
            Self::Update { kind, id, patch } => {
                PendingAction::update(*kind, id.clone(), patch.clone(), t)
            }
            Self::Delete { kind, id } => PendingAction::delete(*kind, id.clone(), t),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityCache {
    pois: BTreeMap<String, Entity>,
    zones: BTreeMap<String, Entity>,
}

impl EntityCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reflect a mutation locally before the server has seen it.
    pub fn apply_optimistic(&mut self, mutation: &Mutation) {
        let entries = self.entries_mut(mutation.kind());
        match mutation {
            Mutation::Create {
                local_id, payload, ..
            } => {
                entries.insert(local_id.clone(), Entity::new(local_id.clone(), payload.clone()));
            }
            Mutation::Update { id, patch, .. } => {
                if let Some(entity) = entries.get_mut(id) {
                    merge_payload(&mut entity.fields, patch);
                } else {
                    debug!(%id, "optimistic update for uncached entity");
                }
            }
            Mutation::Delete { id, .. } => {
                entries.remove(id);
            }
        }
    }

    /// Insert or overwrite by id.
    pub fn upsert(&mut self, kind: EntityKind, entity: Entity) {
        self.entries_mut(kind).insert(entity.id.clone(), entity);
    }

    pub fn remove(&mut self, kind: EntityKind, id: &str) -> bool {
        self.entries_mut(kind).remove(id).is_some()
    }

    #[must_use]
    pub fn get(&self, kind: EntityKind, id: &str) -> Option<&Entity> {
        self.entries(kind).get(id)
    }

    /// Entities of one kind ordered by id.
    pub fn iter(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entries(kind).values()
    }

    #[must_use]
    pub fn len(&self, kind: EntityKind) -> usize {
        self.entries(kind).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pois.is_empty() && self.zones.is_empty()
    }

    /// Ids still waiting for a server id.
    #[must_use]
    pub fn local_ids(&self, kind: EntityKind) -> Vec<&str> {
        self.entries(kind)
            .keys()
            .filter(|id| is_local_id(id))
            .map(String::as_str)
            .collect()
    }

    /// Replace every confirmed entity of `kind` with a fresh server listing,
    /// keeping optimistic entries that have no server id yet.
    pub fn replace_confirmed(&mut self, kind: EntityKind, confirmed: Vec<Entity>) {
        let entries = self.entries_mut(kind);
        entries.retain(|id, _| is_local_id(id));
        for entity in confirmed {
            entries.insert(entity.id.clone(), entity);
        }
    }

    fn entries(&self, kind: EntityKind) -> &BTreeMap<String, Entity> {
        match kind {
            EntityKind::Poi => &self.pois,
            EntityKind::Zone => &self.zones,
        }
    }

    fn entries_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<String, Entity> {
        match kind {
            EntityKind::Poi => &mut self.pois,
            EntityKind::Zone => &mut self.zones,
        }
    }
}

impl ConfirmationSink for EntityCache {
    fn create_confirmed(&mut self, kind: EntityKind, local_id: &str, entity: Entity) {
        let entries = self.entries_mut(kind);
        entries.remove(local_id);
        debug!(%local_id, server_id = %entity.id, %kind, "optimistic entity confirmed");
        entries.insert(entity.id.clone(), entity);
    }

    fn update_confirmed(&mut self, kind: EntityKind, entity: Entity) {
        self.upsert(kind, entity);
    }

    fn delete_confirmed(&mut self, kind: EntityKind, id: &str) {
        self.remove(kind, id);
    }
}
