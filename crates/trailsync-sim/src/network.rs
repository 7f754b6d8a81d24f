use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::rng::DeterministicRng;

/// Index of a simulated client.
pub type ClientId = usize;

/// Fault injection knobs, all per round or per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultConfig {
    /// Maximum server-to-client delivery delay in rounds.
    pub max_delay_rounds: u8,
    /// Percentage of server frames lost in flight.
    pub drop_rate_percent: u8,
    /// Chance per round that an online client loses its link.
    pub disconnect_rate_percent: u8,
    /// Chance per round that an offline client gets its link back.
    pub reconnect_rate_percent: u8,
    /// Percentage of mutation calls that fail before the server applies them.
    pub mutation_failure_percent: u8,
    /// Percentage of creates the server applies but answers with a conflict
    /// that does not name the stored entity.
    #[serde(default)]
    pub create_conflict_percent: u8,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            max_delay_rounds: 2,
            drop_rate_percent: 5,
            disconnect_rate_percent: 6,
            reconnect_rate_percent: 30,
            mutation_failure_percent: 10,
            create_conflict_percent: 3,
        }
    }
}

impl FaultConfig {
    /// No faults at all; used while healing at the end of a run.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_delay_rounds: 0,
            drop_rate_percent: 0,
            disconnect_rate_percent: 0,
            reconnect_rate_percent: 100,
            mutation_failure_percent: 0,
            create_conflict_percent: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingFrame {
    deliver_at_round: u64,
    seq: u64,
    to: ClientId,
    frame: String,
}

/// What happened to one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    pub dropped: bool,
    pub delay_rounds: u8,
}

/// A frame ready for a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ClientId,
    pub frame: String,
}

/// Server-to-client links with loss, latency and outages.
///
/// Frames to one client never overtake each other: a delayed frame holds
/// back everything sent to the same client after it, as a socket would.
/// Frames in flight to a client whose link drops are lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedNetwork {
    pending: Vec<PendingFrame>,
    offline: BTreeSet<ClientId>,
    last_slot: BTreeMap<ClientId, u64>,
    fault: FaultConfig,
    seq: u64,
    dropped: usize,
    delivered: usize,
}

impl SimulatedNetwork {
    #[must_use]
    pub fn new(fault: FaultConfig) -> Self {
        Self {
            pending: Vec::new(),
            offline: BTreeSet::new(),
            last_slot: BTreeMap::new(),
            fault,
            seq: 0,
            dropped: 0,
            delivered: 0,
        }
    }

    #[must_use]
    pub const fn fault_config(&self) -> FaultConfig {
        self.fault
    }

    /// Take a client's link down or bring it back.
    pub fn set_online(&mut self, client: ClientId, online: bool) {
        if online {
            self.offline.remove(&client);
        } else if self.offline.insert(client) {
            let before = self.pending.len();
            self.pending.retain(|p| p.to != client);
            self.dropped += before - self.pending.len();
            self.last_slot.remove(&client);
        }
    }

    #[must_use]
    pub fn is_online(&self, client: ClientId) -> bool {
        !self.offline.contains(&client)
    }

    #[must_use]
    pub fn offline_clients(&self) -> Vec<ClientId> {
        self.offline.iter().copied().collect()
    }

    /// Stop injecting faults. Links stay as they are.
    pub const fn heal(&mut self) {
        self.fault = FaultConfig::none();
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn dropped(&self) -> usize {
        self.dropped
    }

    #[must_use]
    pub const fn delivered(&self) -> usize {
        self.delivered
    }

    /// Queue `frame` for `to`, subject to loss and delay.
    pub fn send(
        &mut self,
        to: ClientId,
        frame: String,
        round: u64,
        rng: &mut DeterministicRng,
    ) -> SendOutcome {
        if !self.is_online(to) || rng.hit_rate_percent(self.fault.drop_rate_percent) {
            self.dropped += 1;
            return SendOutcome {
                dropped: true,
                delay_rounds: 0,
            };
        }

        let delay = u8::try_from(rng.next_bounded(u64::from(self.fault.max_delay_rounds) + 1))
            .unwrap_or(0);
        let earliest = round.saturating_add(u64::from(delay));
        let slot = self
            .last_slot
            .get(&to)
            .map_or(earliest, |last| earliest.max(*last));
        self.last_slot.insert(to, slot);

        self.seq += 1;
        self.pending.push(PendingFrame {
            deliver_at_round: slot,
            seq: self.seq,
            to,
            frame,
        });
        SendOutcome {
            dropped: false,
            delay_rounds: delay,
        }
    }

    /// Remove and return every frame due by `round`, in send order per client.
    pub fn deliver_ready(&mut self, round: u64) -> Vec<Delivery> {
        let (mut ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.deliver_at_round <= round);
        self.pending = waiting;
        ready.sort_by_key(|p| (p.deliver_at_round, p.seq));
        self.delivered += ready.len();
        ready
            .into_iter()
            .map(|p| Delivery {
                to: p.to,
                frame: p.frame,
            })
            .collect()
    }
}
