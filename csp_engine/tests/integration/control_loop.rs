//! Integration test: the offset law end to end, reference clock
//! measurement and cooperative stop.

use csp_common::bus::BusMaster;
use csp_engine::engine::{EnginePhase, RunOutcome, StopFlag};
use csp_engine::motion::{ControlWord, Measured, MotionPolicy, Setpoint};
use csp_engine::sim::{BusCall, SimDrive, SimMaster};
use csp_engine::transaction::{ExchangeHealth, HealthVerdict};

use super::{PERIOD_NS, engine_in_control, engine_on, two_drives};

#[test]
fn setpoints_follow_measured_plus_offset() {
    let cfg = two_drives();
    let mut bus = SimMaster::new(0);
    for dev in &cfg.devices {
        let drive = SimDrive::new(dev.identity())
            .with_op_after(1)
            .with_position(100_000);
        bus.add_drive(dev.position, drive);
    }
    let mut e = engine_on(bus, &cfg);
    e.bring_up().unwrap();
    assert_eq!(e.phase(), EnginePhase::Control);

    let first = e.control_cycle().unwrap();
    assert_eq!(first.cycle, 1);
    assert_eq!(first.exchange, ExchangeHealth::Complete);
    assert_eq!(first.verdict, HealthVerdict::Healthy);
    assert!(first.all_operational);
    let targets: Vec<i32> = first.setpoints.iter().map(|s| s.target_position).collect();
    assert_eq!(targets, vec![105_000, 95_000]);
    assert!(
        first
            .setpoints
            .iter()
            .all(|s| s.control_word == ControlWord::OPERATION)
    );

    // The same values sit in the image, ready for the next frame.
    for (axis, expected) in e.axes().iter().zip([105_000i64, 95_000]) {
        assert_eq!(e.image().read(&axis.target_position).unwrap(), expected);
        assert_eq!(e.image().read(&axis.control_word).unwrap(), 0x0F);
    }

    // The next exchange delivers them; both drives enable and follow.
    let second = e.control_cycle().unwrap();
    for (pos, target) in [(0u16, 105_000), (1, 95_000)] {
        let drive = e.bus().drive(pos).unwrap();
        assert_eq!(drive.control_word(), 0x000F);
        assert_eq!(drive.target_position(), target);
        assert_eq!(drive.actual_position(), target);
        assert!(drive.is_operation_enabled());
    }
    let targets: Vec<i32> = second.setpoints.iter().map(|s| s.target_position).collect();
    assert_eq!(targets, vec![110_000, 90_000]);

    let measured = e.axes()[0].read_measured(e.image()).unwrap();
    assert!(measured.status_word.is_operation_enabled());
    assert_eq!(measured.actual_position, 105_000);
}

#[test]
fn scripted_positions_drive_the_setpoints() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut()
        .drive_mut(0)
        .unwrap()
        .script_positions([1_000, 2_000, i32::MAX - 10]);

    let targets: Vec<i32> = (0..3)
        .map(|_| e.control_cycle().unwrap().setpoints[0].target_position)
        .collect();
    assert_eq!(targets, vec![6_000, 7_000, i32::MAX]);
}

#[test]
fn reference_clock_delta_survives_wrap() {
    let mut cfg = two_drives();
    cfg.clock.measure_timing = true;
    let start = u32::MAX - 6_500_000;
    cfg.simulation.reference_clock_start = start;
    let mut e = engine_in_control(&cfg);

    let deltas: Vec<Option<u32>> = (0..10)
        .map(|_| e.control_cycle().unwrap().reference_delta)
        .collect();
    assert_eq!(deltas[0], None);
    assert!(deltas[1..].iter().all(|d| *d == Some(PERIOD_NS as u32)));

    // The counter did wrap during the run.
    assert!(e.bus().reference_clock_time().unwrap() < start);
}

#[test]
fn no_reference_delta_without_measurement() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    for _ in 0..3 {
        assert_eq!(e.control_cycle().unwrap().reference_delta, None);
    }
}

/// Holds position and asks for a stop after a fixed number of cycles.
struct StopAfter {
    remaining: u64,
    devices: usize,
    calls: usize,
    stop: StopFlag,
}

impl MotionPolicy for StopAfter {
    fn name(&self) -> &'static str {
        "stop-after"
    }

    fn next_setpoint(&mut self, _device: usize, measured: &Measured) -> Setpoint {
        self.calls += 1;
        if self.calls % self.devices == 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.stop.request_stop();
            }
        }
        Setpoint {
            control_word: ControlWord::OPERATION,
            target_position: measured.actual_position,
        }
    }
}

#[test]
fn stop_completes_the_current_cycle() {
    let cfg = two_drives();
    let e = engine_in_control(&cfg);
    let stop = e.stop_flag();
    let mut e = e.with_policy(StopAfter {
        remaining: 7,
        devices: 2,
        calls: 0,
        stop,
    });
    e.bus_mut().record_calls(true);

    assert_eq!(e.run_control().unwrap(), RunOutcome::Stopped { control_cycles: 7 });
    assert_eq!(e.phase(), EnginePhase::Stopped);

    let log = e.bus().call_log();
    assert_eq!(log.last(), Some(&BusCall::Send));
    let sends = log.iter().filter(|c| **c == BusCall::Send).count();
    assert_eq!(sends, 7);

    let summary = e.shutdown();
    assert_eq!(summary.control_cycles, 7);
    assert!(summary.bringup_cycles > 0);
    assert_eq!(summary.transactions.missed, 0);
}

#[test]
fn shutdown_releases_the_master() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.control_cycle().unwrap();
    let bus_was_active = e.bus().is_active();
    let summary = e.shutdown();
    assert!(bus_was_active);
    assert_eq!(summary.control_cycles, 1);
    assert_eq!(summary.cycles.cycle_count, summary.bringup_cycles + 1);
}
