use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::{Value, json};
use trailsync_core::clock::{Clock, TimestampMs};
use trailsync_core::model::{Entity, EntityKind, LocalIdMinter, Payload, PositionSample, SubjectId};
use trailsync_core::resync::Trigger;
use trailsync_core::SyncEngine;

use crate::TraceEventKind;
use crate::clock::SimulatedClock;
use crate::link::{SimChannel, SimService};
use crate::network::ClientId;
use crate::rng::DeterministicRng;

const COLORS: [&str; 4] = ["#e6194b", "#3cb44b", "#4363d8", "#f58231"];

/// What a simulated user does in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Move,
    Create(EntityKind),
    Recolor,
    Delete,
    Foreground,
    StopSharing,
    Idle,
}

impl Action {
    pub fn draw(rng: &mut DeterministicRng) -> Self {
        match rng.next_bounded(100) {
            0..40 => Self::Move,
            40..50 => Self::Create(EntityKind::Poi),
            50..55 => Self::Create(EntityKind::Zone),
            55..70 => Self::Recolor,
            70..78 => Self::Delete,
            78..80 => Self::Foreground,
            80 => Self::StopSharing,
            _ => Self::Idle,
        }
    }
}

/// One user's device: a real engine plus the user's intent log.
pub struct SimClient {
    id: ClientId,
    user_id: String,
    engine: SyncEngine<SimChannel, SimService>,
    clock: SimulatedClock,
    rng: DeterministicRng,
    lng: f64,
    lat: f64,
    next_title: u32,
    recorded: Vec<PositionSample>,
    intended: BTreeMap<String, EntityKind>,
    deleted: BTreeSet<String>,
}

impl SimClient {
    #[must_use]
    pub fn new(
        id: ClientId,
        engine: SyncEngine<SimChannel, SimService>,
        clock: SimulatedClock,
        rng: DeterministicRng,
    ) -> Self {
        let user_id = engine.session().self_id.clone();
        let engine = engine.with_minter(LocalIdMinter::seeded(rng.fork(0x1D).next_u64()));
        Self {
            id,
            user_id,
            engine,
            clock,
            rng,
            lng: 7.44,
            lat: 46.95,
            next_title: 0,
            recorded: Vec::new(),
            intended: BTreeMap::new(),
            deleted: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub const fn engine(&self) -> &SyncEngine<SimChannel, SimService> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SyncEngine<SimChannel, SimService> {
        &mut self.engine
    }

    #[must_use]
    pub fn now(&self) -> TimestampMs {
        self.clock.now_ms()
    }

    /// Perform one randomly drawn user action.
    pub fn act(&mut self) -> Option<TraceEventKind> {
        match Action::draw(&mut self.rng) {
            Action::Move => Some(self.step()),
            Action::Create(kind) => Some(self.create(kind)),
            Action::Recolor => self.recolor(),
            Action::Delete => self.delete(),
            Action::Foreground => {
                self.engine.resync(Trigger::VisibilityRegained);
                Some(TraceEventKind::Foreground)
            }
            Action::StopSharing => {
                self.engine.stop_sharing();
                Some(TraceEventKind::StoppedSharing)
            }
            Action::Idle => None,
        }
    }

    /// The link went down or came back.
    pub fn link_changed(&mut self, online: bool) -> TraceEventKind {
        if online {
            let queued = self.engine.queue().len();
            self.engine.resync(Trigger::Reconnect);
            TraceEventKind::Reconnected { queued }
        } else {
            self.engine.on_disconnect();
            TraceEventKind::Disconnected
        }
    }

    fn step(&mut self) -> TraceEventKind {
        self.lng += self.rng.jitter(0.000_5);
        self.lat += self.rng.jitter(0.000_5);
        let speed = self.rng.jitter(1.5).abs();
        let sample = PositionSample::new(self.lng, self.lat, self.now()).with_motion(speed, 90.0);
        self.recorded.push(sample);
        self.engine.record_position(sample);
        TraceEventKind::Moved { t: sample.t }
    }

    fn create(&mut self, kind: EntityKind) -> TraceEventKind {
        self.next_title += 1;
        let title = format!("{}-{kind}-{}", self.user_id, self.next_title);
        let color = self.color();
        let mut payload = Payload::new();
        payload.insert("title".into(), Value::String(title.clone()));
        payload.insert("owner".into(), Value::String(self.user_id.clone()));
        payload.insert("color".into(), json!(color));
        let local_id = self.engine.create(kind, payload);
        self.intended.insert(title.clone(), kind);
        TraceEventKind::Created {
            kind,
            title,
            local_id,
        }
    }

    fn recolor(&mut self) -> Option<TraceEventKind> {
        let (kind, id, title) = self.pick_own()?;
        let mut patch = Payload::new();
        patch.insert("color".into(), json!(self.color()));
        self.engine.update(kind, id.clone(), patch);
        Some(TraceEventKind::Recolored { kind, id, title })
    }

    fn delete(&mut self) -> Option<TraceEventKind> {
        let (kind, id, title) = self.pick_own()?;
        self.engine.delete(kind, id.clone());
        self.deleted.insert(title.clone());
        Some(TraceEventKind::Deleted { kind, id, title })
    }

    fn color(&mut self) -> &'static str {
        self.rng
            .pick_index(COLORS.len())
            .map_or(COLORS[0], |i| COLORS[i])
    }

    /// A cached entity this user created and has not deleted.
    fn pick_own(&mut self) -> Option<(EntityKind, String, String)> {
        let cache = self.engine.cache();
        let own: Vec<(EntityKind, String, String)> = [EntityKind::Poi, EntityKind::Zone]
            .into_iter()
            .flat_map(move |kind| cache.iter(kind).map(move |e| (kind, e)))
            .filter(|(_, e)| e.str_field("owner") == Some(self.user_id.as_str()))
            .filter_map(|(kind, e)| {
                let title = e.str_field("title")?;
                (!self.deleted.contains(title)).then(|| (kind, e.id.clone(), title.to_string()))
            })
            .collect();
        let index = self.rng.pick_index(own.len())?;
        own.into_iter().nth(index)
    }

    /// Freeze what the oracle needs. `settled_cache` is the cache before
    /// the final reload.
    #[must_use]
    pub fn outcome(&self, settled_cache: BTreeMap<EntityKind, Vec<Entity>>) -> ClientOutcome {
        let traces = self.engine.traces();
        ClientOutcome {
            client: self.id,
            user_id: self.user_id.clone(),
            now: self.now(),
            state: self.engine.state().to_string(),
            queue_len: self.engine.queue().len(),
            retention_ms: traces.retention_ms(),
            max_points: traces.max_points(),
            traces: traces
                .subjects()
                .into_iter()
                .map(|s| {
                    let samples = traces.trace(&s);
                    (s, samples)
                })
                .collect(),
            settled_cache,
            cache: self.cache_listing(),
            recorded: self.recorded.clone(),
            intended: self.intended.clone(),
            deleted: self.deleted.clone(),
        }
    }

    #[must_use]
    pub fn cache_listing(&self) -> BTreeMap<EntityKind, Vec<Entity>> {
        [EntityKind::Poi, EntityKind::Zone]
            .into_iter()
            .map(|kind| (kind, self.engine.cache().iter(kind).cloned().collect()))
            .collect()
    }
}

/// A client's state at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientOutcome {
    pub client: ClientId,
    pub user_id: String,
    pub now: TimestampMs,
    pub state: String,
    pub queue_len: usize,
    pub retention_ms: u64,
    pub max_points: usize,
    pub traces: BTreeMap<SubjectId, Vec<PositionSample>>,
    pub settled_cache: BTreeMap<EntityKind, Vec<Entity>>,
    pub cache: BTreeMap<EntityKind, Vec<Entity>>,
    pub recorded: Vec<PositionSample>,
    pub intended: BTreeMap<String, EntityKind>,
    pub deleted: BTreeSet<String>,
}
