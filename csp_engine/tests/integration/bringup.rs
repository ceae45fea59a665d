//! Integration test: bring-up gating, timeout and stop.

use csp_common::device::DeviceState;
use csp_engine::engine::{BringupResult, EnginePhase, RunOutcome};
use csp_engine::error::{EXIT_BRINGUP_TIMEOUT, EngineError};
use csp_engine::sim::{SimDrive, SimMaster};

use super::{engine, engine_on, two_drives};

#[test]
fn one_device_short_of_op_keeps_bringup() {
    let cfg = two_drives();
    let mut e = engine(&cfg);
    e.bus_mut().drive_mut(1).unwrap().stuck_at(DeviceState::SafeOp);

    for _ in 0..20 {
        assert!(!e.bringup_cycle().unwrap());
        assert_eq!(e.phase(), EnginePhase::Bringup);
    }
    assert_eq!(e.tracker().state(0), Some(DeviceState::Op));
    assert_eq!(e.tracker().state(1), Some(DeviceState::SafeOp));
    assert!(!e.tracker().all_operational());
}

#[test]
fn all_devices_in_op_transition_exactly_once() {
    let cfg = two_drives();
    let mut e = engine(&cfg);
    e.bus_mut().drive_mut(1).unwrap().stuck_at(DeviceState::SafeOp);
    for _ in 0..5 {
        e.bringup_cycle().unwrap();
    }
    e.bus_mut().drive_mut(1).unwrap().release_hold();

    let BringupResult::Ready { cycles } = e.bring_up().unwrap() else {
        panic!("expected bring-up to complete");
    };
    assert!(cycles > 5);
    assert_eq!(e.phase(), EnginePhase::Control);
    assert!(e.tracker().all_operational());

    // No second transition.
    assert!(matches!(e.bring_up(), Err(EngineError::WrongPhase { .. })));
    assert!(matches!(e.bringup_cycle(), Err(EngineError::WrongPhase { .. })));
    assert_eq!(e.phase(), EnginePhase::Control);
}

#[test]
fn transition_happens_on_first_all_op_cycle() {
    let cfg = two_drives();
    let mut e = engine(&cfg);
    e.bus_mut().drive_mut(1).unwrap().stuck_at(DeviceState::SafeOp);

    let both_op = |e: &super::SimEngine| {
        e.tracker().state(0) == Some(DeviceState::Op)
            && e.tracker().state(1) == Some(DeviceState::Op)
    };
    let mut drive0_op_since = None;
    let mut first_all_op = None;
    for cycle in 1..=40u64 {
        let ready = e.bringup_cycle().unwrap();
        assert_eq!(ready, both_op(&e), "cycle {cycle}");
        if ready {
            first_all_op = Some(cycle);
            break;
        }
        if e.tracker().state(0) == Some(DeviceState::Op) && drive0_op_since.is_none() {
            drive0_op_since = Some(cycle);
        }
        // Hold drive1 back for three cycles after drive0 is up.
        if drive0_op_since.is_some_and(|since| cycle == since + 3) {
            e.bus_mut().drive_mut(1).unwrap().release_hold();
        }
    }

    let first_all_op = first_all_op.unwrap();
    assert!(first_all_op > drive0_op_since.unwrap() + 3);
    assert_eq!(e.bringup_cycles(), first_all_op);
}

#[test]
fn bring_up_reports_the_first_all_op_cycle() {
    let cfg = two_drives();

    let mut stepped = engine(&cfg);
    let mut first_all_op = 0;
    for cycle in 1..=40u64 {
        if stepped.bringup_cycle().unwrap() {
            first_all_op = cycle;
            break;
        }
    }
    assert!(first_all_op > 0);

    let mut e = engine(&cfg);
    assert_eq!(
        e.bring_up().unwrap(),
        BringupResult::Ready {
            cycles: first_all_op
        }
    );
    assert_eq!(e.bringup_cycles(), first_all_op);
    assert_eq!(e.phase(), EnginePhase::Control);
}

#[test]
fn timeout_after_budget() {
    let mut cfg = two_drives();
    cfg.engine.bringup_timeout_cycles = 30;
    let mut e = engine(&cfg);
    e.bus_mut().drive_mut(0).unwrap().stuck_at(DeviceState::PreOp);

    assert_eq!(e.bring_up().unwrap(), BringupResult::Timeout { cycles: 30 });
    assert_eq!(e.bringup_cycles(), 30);
    assert_eq!(e.scheduler().stats().cycle_count, 30);
}

#[test]
fn run_reports_timeout_with_exit_code() {
    let mut cfg = two_drives();
    cfg.engine.bringup_timeout_cycles = 10;
    let mut e = engine(&cfg);
    e.bus_mut().drive_mut(0).unwrap().stuck_at(DeviceState::SafeOp);
    e.bus_mut().drive_mut(1).unwrap().stuck_at(DeviceState::SafeOp);

    let err = e.run().unwrap_err();
    assert!(matches!(err, EngineError::BringupTimeout { cycles: 10, pending: 2 }));
    assert_eq!(err.exit_code(), EXIT_BRINGUP_TIMEOUT);
}

#[test]
fn absent_device_stays_unknown_until_timeout() {
    let mut cfg = two_drives();
    cfg.engine.bringup_timeout_cycles = 10;
    // Only drive0 is plugged in.
    let mut bus = SimMaster::new(0);
    bus.add_drive(0, SimDrive::new(cfg.devices[0].identity()).with_op_after(1));
    let mut e = engine_on(bus, &cfg);

    assert_eq!(e.bring_up().unwrap(), BringupResult::Timeout { cycles: 10 });
    assert_eq!(e.tracker().state(0), Some(DeviceState::Op));
    assert_eq!(e.tracker().state(1), Some(DeviceState::Unknown));
    assert_eq!(e.tracker().pending(), 1);
}

#[test]
fn stop_during_bringup_is_observed_between_cycles() {
    let cfg = two_drives();
    let mut e = engine(&cfg);
    e.bus_mut().drive_mut(0).unwrap().stuck_at(DeviceState::SafeOp);
    for _ in 0..3 {
        e.bringup_cycle().unwrap();
    }
    e.stop_flag().request_stop();
    assert_eq!(e.run().unwrap(), RunOutcome::StoppedDuringBringup { cycles: 3 });
    assert_eq!(e.phase(), EnginePhase::Stopped);
}
