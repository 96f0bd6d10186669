//! Integration tests for the host-path scenario
//!
//! - `hostpath_e2e`: the full scenario against real machines
//!
//! Settings come from `KMC_*` variables and the optional file named by
//! `KMC_SCENARIO_CONFIG`. Set `KMC_LOG_FORMAT=json` for machine-readable logs.

mod helpers;
mod hostpath_e2e;
