//! One mission subscription, end to end.
//!
//! [`SyncEngine`] owns every piece of mutable sync state for a single
//! `(mission, user)` pair and is the only way in: connectivity signals,
//! local fixes, UI mutations, inbound frames and timer ticks. Switching
//! missions means [`SyncEngine::teardown`] and building a new engine.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{EntityCache, Mutation};
use crate::clock::{Clock, TimestampMs};
use crate::config::SyncConfig;
use crate::model::{
    Entity, EntityKind, LocalIdMinter, Payload, PositionSample, SubjectId, Viewport, is_local_id,
};
use crate::protocol::{Inbound, Outbound, ProtocolError};
use crate::queue::{FlushReport, MutationService, OfflineQueue, PendingAction};
use crate::resync::{RealtimeChannel, ResyncPlan, ResyncProtocol, SubscriptionState, Trigger};
use crate::router::{BroadcastRouter, PeerDirectory, Routed};
use crate::store::{LocalStore, Slot, StateKey, load_json, save_json};
use crate::trace::{AppendOutcome, RetentionChange, TraceStore};

/// Who is subscribed to what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub mission_id: String,
    pub self_id: String,
}

impl Session {
    #[must_use]
    pub fn new(mission_id: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            mission_id: mission_id.into(),
            self_id: self_id.into(),
        }
    }

    fn key(&self, slot: Slot) -> StateKey {
        StateKey::new(self.mission_id.clone(), self.self_id.clone(), slot)
    }
}

/// What a timer tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Samples evicted, if the purge interval had elapsed.
    pub purged: Option<usize>,
    /// Present when the post-connect delayed flush ran.
    pub delayed_resync: Option<ResyncPlan>,
}

pub struct SyncEngine<C: RealtimeChannel, S: MutationService> {
    session: Session,
    config: SyncConfig,
    clock: Box<dyn Clock>,
    store: Box<dyn LocalStore>,
    channel: C,
    service: S,
    traces: TraceStore,
    queue: OfflineQueue,
    protocol: ResyncProtocol,
    router: BroadcastRouter,
    minter: LocalIdMinter,
    backlog: Vec<PositionSample>,
    last_purge: TimestampMs,
    delayed_flush_at: Option<TimestampMs>,
    traces_dirty: bool,
    last_flush: Option<FlushReport>,
}

impl<C: RealtimeChannel, S: MutationService> SyncEngine<C, S> {
    /// Build an engine and restore whatever `store` holds for the session.
    ///
    /// Restored traces pass through the current retention window, so state
    /// persisted long ago comes back empty rather than stale.
    pub fn new(
        session: Session,
        config: SyncConfig,
        channel: C,
        service: S,
        store: Box<dyn LocalStore>,
        clock: Box<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        let queue = OfflineQueue::restore(
            load_json::<Vec<PendingAction>>(store.as_ref(), &session.key(Slot::Queue))
                .unwrap_or_default(),
            config.queue_cap,
        );

        let mut traces = TraceStore::new(config.retention_ms());
        if let Some(samples) =
            load_json::<Vec<PositionSample>>(store.as_ref(), &session.key(Slot::SelfTrace))
        {
            traces.extend(&session.self_id, samples, now);
        }
        if let Some(peers) = load_json::<BTreeMap<SubjectId, Vec<PositionSample>>>(
            store.as_ref(),
            &session.key(Slot::PeerTraces),
        ) {
            for (subject, samples) in peers {
                if subject != session.self_id {
                    traces.extend(&subject, samples, now);
                }
            }
        }

        info!(
            mission = %session.mission_id,
            user = %session.self_id,
            queued = queue.len(),
            samples = traces.total_samples(),
            "sync engine started"
        );

        Self {
            protocol: ResyncProtocol::new(session.mission_id.clone()),
            router: BroadcastRouter::new(session.mission_id.clone(), session.self_id.clone()),
            session,
            config,
            clock,
            store,
            channel,
            service,
            traces,
            queue,
            minter: LocalIdMinter::new(),
            backlog: Vec::new(),
            last_purge: now,
            delayed_flush_at: None,
            traces_dirty: false,
            last_flush: None,
        }
    }

    /// Replace the local id minter, e.g. with a seeded one.
    #[must_use]
    pub fn with_minter(mut self, minter: LocalIdMinter) -> Self {
        self.minter = minter;
        self
    }

    // --- connectivity -------------------------------------------------------

    /// Run the resync protocol for `trigger`, then replay the position
    /// backlog and flush the queue if the channel is up.
    pub fn resync(&mut self, trigger: Trigger) -> ResyncPlan {
        let plan = self.protocol.resync(trigger, &mut self.channel);
        if trigger == Trigger::Connect && plan.flush {
            let delay = i64::try_from(self.config.initial_flush_delay_ms).unwrap_or(i64::MAX);
            self.delayed_flush_at = Some(self.now().saturating_add(delay));
        }
        if plan.flush {
            self.send_backlog();
            self.flush();
        }
        plan
    }

    pub fn on_disconnect(&mut self) {
        self.protocol.on_disconnect();
        self.delayed_flush_at = None;
    }

    // --- local positions ----------------------------------------------------

    /// Record a fix from the local location source.
    ///
    /// Connected: stored and emitted as `position:update`. Otherwise, or if
    /// the emit fails, also kept in the backlog for the next resync.
    pub fn record_position(&mut self, sample: PositionSample) -> AppendOutcome {
        let now = self.now();
        let outcome = self.traces.append(&self.session.self_id, sample, now);
        if outcome != AppendOutcome::Inserted {
            return outcome;
        }
        self.traces_dirty = true;

        let live = self.channel.is_connected()
            && self.protocol.state() != SubscriptionState::Disconnected;
        if live {
            match self.channel.emit(&Outbound::PositionUpdate(sample)) {
                Ok(()) => return outcome,
                Err(error) => debug!(%error, "position emit failed, buffering"),
            }
        }
        self.buffer(sample);
        outcome
    }

    /// Stop sharing: drop the local trace and backlog, tell peers.
    pub fn stop_sharing(&mut self) {
        self.traces.clear(&self.session.self_id);
        self.backlog.clear();
        self.traces_dirty = true;
        if self.channel.is_connected() {
            if let Err(error) = self.channel.emit(&Outbound::PositionClear {}) {
                warn!(%error, "position:clear not delivered");
            }
        }
        let key = self.session.key(Slot::SelfTrace);
        if let Err(error) = self.store.remove(&key) {
            warn!(%key, %error, "failed to remove persisted self trace");
        }
        info!(user = %self.session.self_id, "location sharing stopped");
    }

    fn buffer(&mut self, sample: PositionSample) {
        self.backlog.push(sample);
        let cap = self.config.position_backlog_cap.max(1);
        if self.backlog.len() > cap {
            let excess = self.backlog.len() - cap;
            self.backlog.drain(..excess);
        }
    }

    fn send_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let floor = crate::trace::cutoff(self.now(), self.traces.retention_ms());
        self.backlog.retain(|s| s.t >= floor);
        self.backlog.sort_by_key(|s| s.t);
        if self.backlog.is_empty() {
            return;
        }
        let message = Outbound::PositionBulk {
            points: self.backlog.clone(),
        };
        match self.channel.emit(&message) {
            Ok(()) => {
                info!(points = self.backlog.len(), "position backlog replayed");
                self.backlog.clear();
            }
            Err(error) => warn!(%error, "position backlog not delivered, keeping it"),
        }
    }

    // --- entity mutations ---------------------------------------------------

    /// Create a POI or zone. Returns the local id it is cached under until
    /// the server confirms it.
    pub fn create(&mut self, kind: EntityKind, payload: Payload) -> String {
        let local_id = self.minter.mint(self.now());
        self.submit(&Mutation::Create {
            kind,
            local_id: local_id.clone(),
            payload,
        });
        local_id
    }

    /// [`create`](Self::create) with a caller-minted local id. Ids without
    /// the local prefix are replaced by a freshly minted one.
    pub fn create_with_local_id(
        &mut self,
        kind: EntityKind,
        local_id: impl Into<String>,
        payload: Payload,
    ) -> String {
        let mut local_id = local_id.into();
        if !is_local_id(&local_id) {
            warn!(%local_id, "caller id lacks local prefix, minting a new one");
            local_id = self.minter.mint(self.now());
        }
        self.submit(&Mutation::Create {
            kind,
            local_id: local_id.clone(),
            payload,
        });
        local_id
    }

    pub fn update(&mut self, kind: EntityKind, id: impl Into<String>, patch: Payload) {
        self.submit(&Mutation::Update {
            kind,
            id: id.into(),
            patch,
        });
    }

    pub fn delete(&mut self, kind: EntityKind, id: impl Into<String>) {
        self.submit(&Mutation::Delete {
            kind,
            id: id.into(),
        });
    }

    fn submit(&mut self, mutation: &Mutation) {
        let now = self.now();
        let compaction = self.router.submit(&mut self.queue, mutation, now);
        debug!(target_id = mutation.target_id(), ?compaction, "mutation queued");
        self.persist_queue();
        if self.channel.is_connected() {
            self.flush();
        }
    }

    /// Replay the queue now. No-op when empty or disconnected.
    pub fn flush(&mut self) -> FlushReport {
        let connected = self.channel.is_connected();
        let now = self.clock.now_ms();
        let key = self.session.key(Slot::Queue);
        let store = &mut self.store;
        let report = self.queue.flush_checkpointed(
            &self.session.mission_id,
            connected,
            &mut self.service,
            self.router.cache_mut(),
            &mut |log| {
                if let Err(error) = save_json(store.as_mut(), &key, log, now) {
                    warn!(%key, %error, "queue checkpoint not persisted");
                }
            },
        );
        if !report.is_noop() {
            self.persist_queue();
        }
        self.last_flush = Some(report.clone());
        report
    }

    /// Swap in a fresh server listing of `kind`, keeping unconfirmed local
    /// entities.
    pub fn reload_entities(&mut self, kind: EntityKind, confirmed: Vec<Entity>) {
        self.router.cache_mut().replace_confirmed(kind, confirmed);
    }

    // --- inbound ------------------------------------------------------------

    /// Route a validated server event. Snapshots and retention changes are
    /// finished here.
    pub fn handle_inbound(&mut self, message: Inbound) -> Routed {
        let now = self.now();
        let routed = self.router.route(message, &mut self.traces, now);
        match &routed {
            Routed::Snapshot(snapshot) => {
                self.protocol
                    .apply_snapshot(snapshot, &self.session.self_id, &mut self.traces, now);
                self.traces_dirty = true;
            }
            Routed::RetentionChanged(change) => self.after_retention_change(*change),
            Routed::Applied => self.traces_dirty = true,
            Routed::Skipped(_) => {}
        }
        routed
    }

    /// Decode and route one raw frame. Malformed frames are logged and
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the decode error so transports can count drops.
    pub fn handle_raw(&mut self, frame: &str) -> Result<Routed, ProtocolError> {
        match Inbound::decode(frame) {
            Ok(message) => Ok(self.handle_inbound(message)),
            Err(error) => {
                warn!(%error, code = %error.code(), "dropping inbound frame");
                Err(error)
            }
        }
    }

    // --- retention & timers -------------------------------------------------

    /// Change the local retention window.
    pub fn set_retention_seconds(&mut self, seconds: u64) -> RetentionChange {
        let now = self.now();
        let change = self
            .traces
            .set_retention(seconds.max(1).saturating_mul(1_000), now);
        self.after_retention_change(change);
        change
    }

    fn after_retention_change(&mut self, change: RetentionChange) {
        match change {
            RetentionChange::Grew => {
                self.resync(Trigger::RetentionGrew);
            }
            RetentionChange::Shrunk { .. } => self.persist_traces(),
            RetentionChange::Unchanged => {}
        }
    }

    /// Drive periodic work. Call often; the engine decides what is due.
    pub fn tick(&mut self) -> TickReport {
        let now = self.now();
        let mut report = TickReport::default();

        let interval = i64::try_from(self.config.purge_interval_ms).unwrap_or(i64::MAX);
        if now.saturating_sub(self.last_purge) >= interval {
            let purged = self.traces.purge_tick(now);
            self.last_purge = now;
            if purged > 0 || self.traces_dirty {
                self.persist_traces();
            }
            report.purged = Some(purged);
        }

        if self.delayed_flush_at.is_some_and(|due| now >= due) {
            self.delayed_flush_at = None;
            report.delayed_resync = Some(self.resync(Trigger::InitialConnectDelay));
        }
        report
    }

    // --- viewport -----------------------------------------------------------

    pub fn save_viewport(&mut self, viewport: Viewport) {
        let key = self.session.key(Slot::Viewport);
        let now = self.now();
        if let Err(error) = save_json(self.store.as_mut(), &key, &viewport, now) {
            warn!(%key, %error, "viewport not persisted");
        }
    }

    #[must_use]
    pub fn viewport(&self) -> Option<Viewport> {
        load_json(self.store.as_ref(), &self.session.key(Slot::Viewport))
    }

    // --- lifecycle ----------------------------------------------------------

    /// Persist everything and hand back the transports.
    pub fn teardown(mut self) -> (C, S) {
        self.persist_queue();
        self.persist_traces();
        info!(
            mission = %self.session.mission_id,
            queued = self.queue.len(),
            "sync engine torn down"
        );
        (self.channel, self.service)
    }

    // --- accessors ----------------------------------------------------------

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub const fn traces(&self) -> &TraceStore {
        &self.traces
    }

    #[must_use]
    pub const fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    #[must_use]
    pub const fn cache(&self) -> &EntityCache {
        self.router.cache()
    }

    #[must_use]
    pub const fn peers(&self) -> &PeerDirectory {
        self.router.peers()
    }

    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.protocol.state()
    }

    #[must_use]
    pub fn backlog(&self) -> &[PositionSample] {
        &self.backlog
    }

    #[must_use]
    pub const fn last_flush(&self) -> Option<&FlushReport> {
        self.last_flush.as_ref()
    }

    #[must_use]
    pub const fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    #[must_use]
    pub const fn service(&self) -> &S {
        &self.service
    }

    pub fn service_mut(&mut self) -> &mut S {
        &mut self.service
    }

    // --- persistence --------------------------------------------------------

    fn now(&self) -> TimestampMs {
        self.clock.now_ms()
    }

    fn persist_queue(&mut self) {
        let key = self.session.key(Slot::Queue);
        let now = self.now();
        if let Err(error) = save_json(self.store.as_mut(), &key, self.queue.actions(), now) {
            warn!(%key, %error, code = %error.code(), "queue not persisted");
        }
    }

    fn persist_traces(&mut self) {
        let now = self.now();
        let own = self.traces.trace(&self.session.self_id);
        let peers = self.traces.export_except(&self.session.self_id);

        let self_key = self.session.key(Slot::SelfTrace);
        let peer_key = self.session.key(Slot::PeerTraces);
        let results = [
            save_json(self.store.as_mut(), &self_key, &own, now),
            save_json(self.store.as_mut(), &peer_key, &peers, now),
        ];
        for error in results.into_iter().filter_map(Result::err) {
            warn!(%error, code = %error.code(), "traces not persisted");
        }
        self.traces_dirty = false;
    }
}
