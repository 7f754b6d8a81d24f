//! Room membership and snapshot reconciliation.
//!
//! Every connectivity signal funnels through [`ResyncProtocol::resync`].
//! The protocol never waits for a snapshot: if none arrives the client
//! keeps its last state and the next trigger asks again.
//!
//! ```text
//! Disconnected ──join──▶ Joining ──request──▶ SnapshotRequested ──snapshot──▶ Synced
//!      ▲                                                                        │
//!      └──────────────────────────── disconnect / emit failure ─────────────────┘
//! ```

use std::fmt;

use tracing::{debug, info, warn};

use crate::clock::TimestampMs;
use crate::error::ErrorCode;
use crate::protocol::{Outbound, SnapshotMessage};
use crate::trace::{RetentionChange, TraceStore};

/// The realtime socket as seen by the engine.
pub trait RealtimeChannel {
    fn is_connected(&self) -> bool;

    /// Send one frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame could not be handed to the transport.
    fn emit(&mut self, message: &Outbound) -> Result<(), ChannelError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    Disconnected,
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Joining,
    SnapshotRequested,
    Synced,
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Joining => "joining",
            Self::SnapshotRequested => "snapshot-requested",
            Self::Synced => "synced",
        })
    }
}

/// Why a resync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Connect,
    Reconnect,
    /// The app came back to the foreground.
    VisibilityRegained,
    /// The OS reported network availability.
    Online,
    /// Fixed delay after the first connect elapsed.
    InitialConnectDelay,
    /// The retention window grew; older history must come from the server.
    RetentionGrew,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect",
            Self::Reconnect => "reconnect",
            Self::VisibilityRegained => "visibility",
            Self::Online => "online",
            Self::InitialConnectDelay => "initial-delay",
            Self::RetentionGrew => "retention-grew",
        })
    }
}

/// What a resync did and what the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResyncPlan {
    pub joined: bool,
    pub snapshot_requested: bool,
    /// The channel is up; replay the position backlog and flush the queue.
    pub flush: bool,
}

/// Result of [`ResyncProtocol::apply_snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Addressed to another mission; nothing changed.
    WrongMission,
    Applied {
        peers: usize,
        retention: RetentionChange,
    },
}

#[derive(Debug, Clone)]
pub struct ResyncProtocol {
    mission_id: String,
    state: SubscriptionState,
    snapshots_applied: u64,
}

impl ResyncProtocol {
    #[must_use]
    pub fn new(mission_id: impl Into<String>) -> Self {
        Self {
            mission_id: mission_id.into(),
            state: SubscriptionState::Disconnected,
            snapshots_applied: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SubscriptionState {
        self.state
    }

    #[must_use]
    pub const fn snapshots_applied(&self) -> u64 {
        self.snapshots_applied
    }

    /// Single entry point for every connectivity trigger.
    ///
    /// Connect and reconnect always (re)join and request a snapshot.
    /// Visibility and retention growth request a snapshot, joining first if
    /// the subscription was lost. Online and the initial delay only rejoin
    /// when disconnected; otherwise they just ask for a flush.
    pub fn resync(&mut self, trigger: Trigger, channel: &mut dyn RealtimeChannel) -> ResyncPlan {
        if !channel.is_connected() {
            debug!(%trigger, "resync skipped, channel down");
            self.state = SubscriptionState::Disconnected;
            return ResyncPlan::default();
        }

        let lost = self.state == SubscriptionState::Disconnected;
        let join = lost || matches!(trigger, Trigger::Connect | Trigger::Reconnect);
        let request = join
            || matches!(trigger, Trigger::VisibilityRegained | Trigger::RetentionGrew);

        let mut plan = ResyncPlan {
            flush: true,
            ..ResyncPlan::default()
        };

        if join {
            let message = Outbound::MissionJoin {
                mission_id: self.mission_id.clone(),
            };
            if !self.send(channel, &message) {
                return ResyncPlan::default();
            }
            self.state = SubscriptionState::Joining;
            plan.joined = true;
        }

        if request {
            let message = Outbound::SnapshotRequest {
                mission_id: self.mission_id.clone(),
            };
            if !self.send(channel, &message) {
                return ResyncPlan::default();
            }
            self.state = SubscriptionState::SnapshotRequested;
            plan.snapshot_requested = true;
        }

        info!(%trigger, state = %self.state, joined = plan.joined, "resync");
        plan
    }

    pub fn on_disconnect(&mut self) {
        if self.state != SubscriptionState::Disconnected {
            info!(mission = %self.mission_id, "subscription lost");
        }
        self.state = SubscriptionState::Disconnected;
    }

    /// Reconcile peer state against an authoritative snapshot.
    ///
    /// Snapshot content never replaces the local subject's trace. A differing
    /// `retentionSeconds` is adopted first as a retention change, so a shrink
    /// purges every trace including the local one. The snapshot already
    /// reflects the new window so no further request is made.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &SnapshotMessage,
        self_id: &str,
        traces: &mut TraceStore,
        now: TimestampMs,
    ) -> SnapshotOutcome {
        if snapshot.mission_id != self.mission_id {
            debug!(
                expected = %self.mission_id,
                got = %snapshot.mission_id,
                code = %ErrorCode::WrongMission,
                "ignoring snapshot for another mission"
            );
            return SnapshotOutcome::WrongMission;
        }

        let retention = match snapshot.retention_seconds {
            Some(0) | None => RetentionChange::Unchanged,
            Some(seconds) => traces.set_retention(seconds.saturating_mul(1_000), now),
        };
        let peers = traces.replace_peers(self_id, &snapshot.positions, &snapshot.traces, now);

        self.state = SubscriptionState::Synced;
        self.snapshots_applied += 1;
        info!(mission = %self.mission_id, peers, ?retention, "snapshot applied");
        SnapshotOutcome::Applied { peers, retention }
    }

    fn send(&mut self, channel: &mut dyn RealtimeChannel, message: &Outbound) -> bool {
        match channel.emit(message) {
            Ok(()) => true,
            Err(error) => {
                warn!(event = message.event(), %error, "emit failed, marking subscription lost");
                self.state = SubscriptionState::Disconnected;
                false
            }
        }
    }
}
