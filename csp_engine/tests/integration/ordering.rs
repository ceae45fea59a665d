//! Integration test: per-cycle bus call order, as seen by the backend.

use csp_common::bus::SlaveConfigHandle;
use csp_engine::sim::BusCall;

use super::{PERIOD_NS, engine, engine_in_control, two_drives};

#[test]
fn bringup_cycle_order() {
    let cfg = two_drives();
    let mut e = engine(&cfg);
    e.bus_mut().record_calls(true);
    e.bringup_cycle().unwrap();

    assert_eq!(
        e.bus().call_log(),
        vec![
            BusCall::Receive,
            BusCall::ProcessDomain,
            BusCall::SlaveState(0),
            BusCall::SlaveState(1),
            BusCall::QueueDomain,
            BusCall::SetApplicationTime(PERIOD_NS),
            BusCall::SyncReferenceClock,
            BusCall::SyncSlaveClocks,
            BusCall::Send,
        ]
    );
}

#[test]
fn control_cycle_order_with_timing() {
    let mut cfg = two_drives();
    cfg.clock.measure_timing = true;
    let mut e = engine_in_control(&cfg);
    e.bus_mut().record_calls(true);
    let report = e.control_cycle().unwrap();

    assert_eq!(
        e.bus().call_log(),
        vec![
            BusCall::Receive,
            BusCall::ProcessDomain,
            BusCall::ReferenceClockTime,
            BusCall::SlaveState(0),
            BusCall::SlaveState(1),
            BusCall::QueueDomain,
            BusCall::SetApplicationTime(report.wake_ns),
            BusCall::SyncReferenceClock,
            BusCall::SyncSlaveClocks,
            BusCall::Send,
        ]
    );
}

#[test]
fn every_step_runs_once_per_cycle() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut().record_calls(true);
    for _ in 0..25 {
        e.control_cycle().unwrap();
    }

    let log = e.bus().call_log();
    let count = |call: BusCall| log.iter().filter(|c| **c == call).count();
    assert_eq!(count(BusCall::Receive), 25);
    assert_eq!(count(BusCall::ProcessDomain), 25);
    assert_eq!(count(BusCall::QueueDomain), 25);
    assert_eq!(count(BusCall::SyncReferenceClock), 25);
    assert_eq!(count(BusCall::SyncSlaveClocks), 25);
    assert_eq!(count(BusCall::Send), 25);

    // Each cycle starts with receive and ends with send; DC sync sits
    // between queue and send.
    for cycle in log.split_inclusive(|c| *c == BusCall::Send) {
        assert_eq!(cycle.first(), Some(&BusCall::Receive));
        let queue = cycle.iter().position(|c| *c == BusCall::QueueDomain).unwrap();
        let sync = cycle
            .iter()
            .position(|c| matches!(c, BusCall::SetApplicationTime(_)))
            .unwrap();
        assert!(queue < sync);
        assert_eq!(
            &cycle[sync + 1..],
            &[BusCall::SyncReferenceClock, BusCall::SyncSlaveClocks, BusCall::Send]
        );
    }
}

#[test]
fn application_time_follows_the_wake_grid() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut().record_calls(true);
    let wakes: Vec<u64> = (0..5).map(|_| e.control_cycle().unwrap().wake_ns).collect();

    let app_times: Vec<u64> = e
        .bus()
        .call_log()
        .into_iter()
        .filter_map(|c| match c {
            BusCall::SetApplicationTime(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(app_times, wakes);
    assert!(wakes.windows(2).all(|w| w[1] - w[0] == PERIOD_NS));
}

#[test]
fn no_dc_calls_when_disabled() {
    let mut cfg = two_drives();
    cfg.clock.enabled = false;
    let mut e = engine(&cfg);
    assert_eq!(e.clock_sync().name(), "none");
    assert_eq!(e.bus().dc_settings(SlaveConfigHandle(0)), None);

    e.bus_mut().record_calls(true);
    e.bring_up().unwrap();
    for _ in 0..5 {
        e.control_cycle().unwrap();
    }
    let log = e.bus().call_log();
    assert!(!log.iter().any(|c| matches!(
        c,
        BusCall::SetApplicationTime(_)
            | BusCall::SyncReferenceClock
            | BusCall::SyncSlaveClocks
            | BusCall::ReferenceClockTime
    )));
    assert_eq!(e.bus().slave_clock_syncs(), 0);
}

#[test]
fn dc_configured_on_every_slave() {
    let cfg = two_drives();
    let e = engine(&cfg);
    for slave in 0..2 {
        let dc = e.bus().dc_settings(SlaveConfigHandle(slave)).unwrap();
        assert_eq!(dc.assign_activate, 0x0300);
        assert_eq!(dc.sync0_cycle_ns, PERIOD_NS as u32);
        assert_eq!(dc.sync0_shift_ns, (PERIOD_NS / 2) as i32);
    }
}
