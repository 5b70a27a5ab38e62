//! Chaos testing for the oplog_stress engine
//!
//! Runs stress clusters against a store that fails on purpose: refused
//! calls, calls applied but reported as timed out, partitions, and wiped
//! data. A correct engine stays consistent through the first three and
//! reports the last one.

pub mod faults;
pub mod runner;

pub use faults::{FaultHandle, FaultRates, FaultyStore};
pub use runner::{run_scenario, Nemesis, ScenarioConfig, ScenarioResult};
