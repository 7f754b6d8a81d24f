//! Shared fakes for trailsync-core integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use serde_json::Value;
use trailsync_core::model::{Entity, EntityKind, Payload};
use trailsync_core::protocol::Outbound;
use trailsync_core::queue::{MutationError, MutationService};
use trailsync_core::resync::{ChannelError, RealtimeChannel};

pub const T0: i64 = 1_700_000_000_000;

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("object literal")
}

#[derive(Debug, Default)]
pub struct FakeSocket {
    pub connected: bool,
    pub sent: Vec<Outbound>,
}

impl FakeSocket {
    pub fn events(&self) -> Vec<&'static str> {
        self.sent.iter().map(Outbound::event).collect()
    }
}

impl RealtimeChannel for FakeSocket {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn emit(&mut self, message: &Outbound) -> Result<(), ChannelError> {
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }
        self.sent.push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create(EntityKind, Payload),
    Update(EntityKind, String, Payload),
    Delete(EntityKind, String),
}

/// In-memory REST fake. `fail_calls` lists 1-based call numbers that fail
/// with a transport error. With `anonymous_conflicts`, every create answers
/// "already exists" without naming the entity.
#[derive(Debug, Default)]
pub struct FakeRest {
    pub calls: Vec<Call>,
    pub fail_calls: Vec<usize>,
    pub anonymous_conflicts: bool,
    pub entities: BTreeMap<String, Entity>,
    next_id: usize,
}

impl FakeRest {
    fn record(&mut self, call: Call) -> Result<(), MutationError> {
        self.calls.push(call);
        if self.fail_calls.contains(&self.calls.len()) {
            return Err(MutationError::Transport("connection reset by peer".into()));
        }
        Ok(())
    }

    pub fn creates(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Create(..)))
            .count()
    }
}

impl MutationService for FakeRest {
    fn create(
        &mut self,
        kind: EntityKind,
        _mission_id: &str,
        payload: &Payload,
    ) -> Result<Entity, MutationError> {
        self.record(Call::Create(kind, payload.clone()))?;
        if self.anonymous_conflicts {
            return Err(MutationError::Conflict { existing: None });
        }
        self.next_id += 1;
        let entity = Entity::new(format!("665{:05}", self.next_id), payload.clone());
        self.entities.insert(entity.id.clone(), entity.clone());
        Ok(entity)
    }

    fn update(
        &mut self,
        kind: EntityKind,
        _mission_id: &str,
        id: &str,
        patch: &Payload,
    ) -> Result<Entity, MutationError> {
        self.record(Call::Update(kind, id.to_string(), patch.clone()))?;
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| MutationError::NotFound(id.to_string()))?;
        for (key, value) in patch {
            entity.fields.insert(key.clone(), value.clone());
        }
        Ok(entity.clone())
    }

    fn delete(
        &mut self,
        kind: EntityKind,
        _mission_id: &str,
        id: &str,
    ) -> Result<(), MutationError> {
        self.record(Call::Delete(kind, id.to_string()))?;
        self.entities
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MutationError::NotFound(id.to_string()))
    }
}
