//! Distributed-clock synchronisation.
//!
//! Once per cycle, after the domain is queued and before the frame is
//! sent, the master's application time is set and the sync datagrams for
//! the reference clock and all slave clocks are queued. Which strategy runs
//! is chosen from configuration when the engine is built.
//!
//! The reference clock is a free-running 32-bit nanosecond counter. Deltas
//! between samples are computed with wrapping subtraction so a wrap between
//! two samples still yields the elapsed time.

use csp_common::bus::BusMaster;
use csp_common::config::ClockConfig;
use tracing::{debug, info};

/// Elapsed counter ticks from `prev` to `cur` across at most one wrap.
#[inline]
pub const fn wrapping_delta(prev: u32, cur: u32) -> u32 {
    cur.wrapping_sub(prev)
}

/// Tracks successive reference clock samples.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CounterDelta {
    prev: Option<u32>,
}

impl CounterDelta {
    pub const fn new() -> Self {
        Self { prev: None }
    }

    /// Feed a new sample; the first one only primes the tracker.
    pub fn update(&mut self, cur: u32) -> Option<u32> {
        let delta = self.prev.map(|prev| wrapping_delta(prev, cur));
        self.prev = Some(cur);
        delta
    }

    pub fn reset(&mut self) {
        self.prev = None;
    }
}

/// Per-cycle clock synchronisation strategy.
pub trait ClockSynchronizer {
    fn name(&self) -> &'static str;

    /// Whether slaves need DC parameters at configuration time.
    fn uses_dc(&self) -> bool;

    /// Queue the per-cycle sync datagrams. Called once per cycle between
    /// queueing the domain and sending.
    fn sync(&mut self, bus: &mut dyn BusMaster, app_time_ns: u64);

    /// Sample the reference clock after the exchange has been processed.
    /// Returns the delta since the previous sample when measuring.
    fn sample_reference(&mut self, bus: &dyn BusMaster) -> Option<u32>;
}

/// No distributed clocks: nothing is synchronised.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClockSync;

impl ClockSynchronizer for NoClockSync {
    fn name(&self) -> &'static str {
        "none"
    }

    fn uses_dc(&self) -> bool {
        false
    }

    fn sync(&mut self, _bus: &mut dyn BusMaster, _app_time_ns: u64) {}

    fn sample_reference(&mut self, _bus: &dyn BusMaster) -> Option<u32> {
        None
    }
}

/// Application time, then reference clock, then slave clocks.
#[derive(Debug, Default, Clone)]
pub struct DistributedClockSync {
    measure_timing: bool,
    delta: CounterDelta,
    syncs: u64,
    last_delta: Option<u32>,
}

impl DistributedClockSync {
    pub fn new(measure_timing: bool) -> Self {
        Self {
            measure_timing,
            ..Self::default()
        }
    }

    /// Number of cycles synchronised so far.
    pub fn syncs(&self) -> u64 {
        self.syncs
    }

    pub fn last_delta(&self) -> Option<u32> {
        self.last_delta
    }
}

impl ClockSynchronizer for DistributedClockSync {
    fn name(&self) -> &'static str {
        "distributed-clock"
    }

    fn uses_dc(&self) -> bool {
        true
    }

    fn sync(&mut self, bus: &mut dyn BusMaster, app_time_ns: u64) {
        bus.set_application_time(app_time_ns);
        bus.sync_reference_clock();
        bus.sync_slave_clocks();
        self.syncs += 1;
    }

    fn sample_reference(&mut self, bus: &dyn BusMaster) -> Option<u32> {
        if !self.measure_timing {
            return None;
        }
        match bus.reference_clock_time() {
            Ok(now) => {
                let delta = self.delta.update(now);
                if let Some(d) = delta {
                    info!(target: "csp::timing", "reference clock delta {d}ns");
                }
                self.last_delta = delta;
                delta
            }
            Err(e) => {
                // No reference clock response this cycle: restart the delta chain.
                debug!("reference clock unavailable: {e}");
                self.delta.reset();
                self.last_delta = None;
                None
            }
        }
    }
}

/// Build the synchroniser selected by `[clock]`.
pub fn from_config(config: &ClockConfig) -> Box<dyn ClockSynchronizer> {
    if config.enabled {
        Box::new(DistributedClockSync::new(config.measure_timing))
    } else {
        Box::new(NoClockSync)
    }
}
