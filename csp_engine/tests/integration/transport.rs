//! Integration test: lost frames, transport errors and devices dropping
//! out of OP during control.

use csp_common::device::DeviceState;
use csp_engine::engine::EnginePhase;
use csp_engine::error::{EXIT_TRANSPORT_FATAL, EngineError};
use csp_engine::transaction::{ExchangeHealth, HealthVerdict};

use super::{engine_in_control, two_drives};

#[test]
fn consecutive_misses_at_limit_are_fatal() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut().drop_exchanges(u32::MAX);

    for _ in 0..4 {
        let report = e.control_cycle().unwrap();
        assert_eq!(report.exchange, ExchangeHealth::Missed);
        assert_eq!(report.verdict, HealthVerdict::Degraded);
    }
    let err = e.control_cycle().unwrap_err();
    assert!(matches!(err, EngineError::TransportFatal { consecutive: 5 }));
    assert_eq!(err.exit_code(), EXIT_TRANSPORT_FATAL);
    assert_eq!(e.control_cycles(), 5);
}

#[test]
fn run_control_surfaces_transport_loss() {
    let mut cfg = two_drives();
    cfg.engine.max_consecutive_missed = 3;
    let mut e = engine_in_control(&cfg);
    e.bus_mut().drop_exchanges(u32::MAX);

    let err = e.run_control().unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert_eq!(e.control_cycles(), 3);
    assert_eq!(e.transaction_stats().longest_miss_streak, 3);
}

#[test]
fn short_loss_recovers() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut().drop_exchanges(4);

    let verdicts: Vec<HealthVerdict> = (0..6).map(|_| e.control_cycle().unwrap().verdict).collect();
    assert_eq!(&verdicts[..4], &[HealthVerdict::Degraded; 4]);
    assert_eq!(&verdicts[4..], &[HealthVerdict::Healthy; 2]);
    assert_eq!(e.transaction_stats().missed, 4);
    assert_eq!(e.phase(), EnginePhase::Control);
}

#[test]
fn transport_errors_count_as_misses() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut().fail_transport(2);

    let first = e.control_cycle().unwrap();
    let second = e.control_cycle().unwrap();
    let third = e.control_cycle().unwrap();
    assert_eq!(first.exchange, ExchangeHealth::Missed);
    assert_eq!(second.exchange, ExchangeHealth::Missed);
    assert_eq!(third.exchange, ExchangeHealth::Complete);
    assert_eq!(e.transaction_stats().transport_errors, 2);
}

#[test]
fn bringup_misses_do_not_count_against_control() {
    let mut cfg = two_drives();
    cfg.engine.max_consecutive_missed = 2;
    // Drives take a while, so bring-up sees many zero working counters.
    cfg.simulation.op_after_cycles = 4;
    let mut e = engine_in_control(&cfg);
    assert!(e.transaction_stats().missed >= 2);

    let report = e.control_cycle().unwrap();
    assert_eq!(report.verdict, HealthVerdict::Healthy);
}

#[test]
fn device_leaving_op_degrades_but_continues() {
    let cfg = two_drives();
    let mut e = engine_in_control(&cfg);
    e.bus_mut().drive_mut(1).unwrap().stuck_at(DeviceState::SafeOp);

    let report = e.control_cycle().unwrap();
    assert_eq!(
        report.exchange,
        ExchangeHealth::Incomplete {
            working_counter: 4,
            expected: 6
        }
    );
    assert_eq!(report.verdict, HealthVerdict::Degraded);
    assert!(!report.all_operational);
    assert_eq!(e.tracker().state(1), Some(DeviceState::SafeOp));
    assert_eq!(report.setpoints.len(), 2);

    e.bus_mut().drive_mut(1).unwrap().release_hold();
    let report = e.control_cycle().unwrap();
    assert!(report.all_operational);
    assert_eq!(report.verdict, HealthVerdict::Healthy);
}
