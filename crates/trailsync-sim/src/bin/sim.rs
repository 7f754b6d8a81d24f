#![forbid(unsafe_code)]

use anyhow::Result;
use trailsync_sim::oracle::SyncOracle;
use trailsync_sim::{SimulationConfig, Simulator};

fn main() -> Result<()> {
    let mut simulator = Simulator::new(SimulationConfig::default())?;
    let result = simulator.run()?;
    let oracle = SyncOracle::check_all(&result.clients, &result.server);

    println!(
        "simulation complete: trace_events={} passed={} interesting={}",
        result.trace.len(),
        oracle.passed,
        result.interesting_state_reached
    );
    for violation in &oracle.violations {
        println!("  {violation}");
    }

    Ok(())
}
