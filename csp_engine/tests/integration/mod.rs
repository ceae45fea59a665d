//! Shared fixtures: a two-drive CSP bus on a manual clock.

mod bringup;
mod codec;
mod control_loop;
mod ordering;
mod period_stability;
mod startup;
mod transport;

use csp_common::config::EngineConfig;
use csp_engine::cycle::ManualClock;
use csp_engine::engine::{BringupResult, Engine};
use csp_engine::sim::SimMaster;

pub const PERIOD_NS: u64 = 1_000_000;

pub const TWO_DRIVES: &str = r#"
[engine]
cycle_period_ns = 1000000
bringup_timeout_cycles = 100
max_consecutive_missed = 5

[clock]
enabled = true

[simulation]
op_after_cycles = 1

[[devices]]
name = "drive0"
position = 0
vendor_id = 0x00007595
product_code = 0x00000000
setpoint_offset = 5000

[[devices]]
name = "drive1"
position = 1
vendor_id = 0x00007595
product_code = 0x00000000
setpoint_offset = -5000
"#;

pub type SimEngine = Engine<SimMaster, ManualClock>;

pub fn two_drives() -> EngineConfig {
    EngineConfig::from_toml_str(TWO_DRIVES).unwrap()
}

pub fn engine_on(bus: SimMaster, cfg: &EngineConfig) -> SimEngine {
    Engine::configure(bus, cfg, ManualClock::new(0)).unwrap()
}

pub fn engine(cfg: &EngineConfig) -> SimEngine {
    engine_on(SimMaster::request(0, cfg).unwrap(), cfg)
}

/// Engine that has completed bring-up.
pub fn engine_in_control(cfg: &EngineConfig) -> SimEngine {
    let mut e = engine(cfg);
    assert!(matches!(e.bring_up().unwrap(), BringupResult::Ready { .. }));
    e
}
