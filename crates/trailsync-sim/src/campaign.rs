//! Campaign runner for deterministic simulation campaigns.
//!
//! Executes many seeds with the same parameters, collecting pass/fail
//! results and the first failing seed for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::ClockConfig;
use crate::network::FaultConfig;
use crate::oracle::{OracleResult, SyncOracle};
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Seeds to run and the simulation parameters shared by all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    pub client_count: usize,
    pub rounds: u64,
    pub retention_seconds: u64,
    pub retention_change_percent: u8,
    pub fault_max_delay: u8,
    pub fault_drop_percent: u8,
    pub fault_disconnect_percent: u8,
    pub fault_reconnect_percent: u8,
    pub fault_mutation_failure_percent: u8,
    #[serde(default)]
    pub fault_create_conflict_percent: u8,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..50,
            client_count: sim.client_count,
            rounds: sim.rounds,
            retention_seconds: sim.retention_seconds,
            retention_change_percent: sim.retention_change_percent,
            fault_max_delay: sim.fault.max_delay_rounds,
            fault_drop_percent: sim.fault.drop_rate_percent,
            fault_disconnect_percent: sim.fault.disconnect_rate_percent,
            fault_reconnect_percent: sim.fault.reconnect_rate_percent,
            fault_mutation_failure_percent: sim.fault.mutation_failure_percent,
            fault_create_conflict_percent: sim.fault.create_conflict_percent,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            client_count: self.client_count,
            rounds: self.rounds,
            retention_seconds: self.retention_seconds,
            retention_change_percent: self.retention_change_percent,
            fault: FaultConfig {
                max_delay_rounds: self.fault_max_delay,
                drop_rate_percent: self.fault_drop_percent,
                disconnect_rate_percent: self.fault_disconnect_percent,
                reconnect_rate_percent: self.fault_reconnect_percent,
                mutation_failure_percent: self.fault_mutation_failure_percent,
                create_conflict_percent: self.fault_create_conflict_percent,
            },
            clock: ClockConfig::default(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if any parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        if self.fault_reconnect_percent == 0 && self.fault_disconnect_percent > 0 {
            bail!("fault_reconnect_percent must be > 0 when clients can disconnect");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First seed that failed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds whose run reached the backlog-under-faults state.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub const fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One seed's run with its oracle verdict.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run every seed in the config.
///
/// # Errors
///
/// Returns an error if config validation fails or a simulation encounters
/// an internal error.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        let detail = run_single_seed(seed, config)?;
        report.seeds_run += 1;
        if detail.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }
        if detail.oracle.passed {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = detail.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: detail
                    .oracle
                    .violations
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            });
        }
    }

    Ok(report)
}

/// Run one seed and judge it.
///
/// # Errors
///
/// Returns an error if the simulation itself fails; invariant violations
/// are reported in the returned [`OracleResult`].
pub fn run_single_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let oracle = SyncOracle::check_all(&result.clients, &result.server);
    Ok(DetailedTrace { result, oracle })
}

/// Replay a single seed with full trace details for debugging.
///
/// # Errors
///
/// Returns an error when config validation or simulation fails.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    run_single_seed(seed, config)
}
