//! Integration test: the wake-up grid stays anchored whatever the cycle
//! body costs.

use csp_engine::cycle::ManualClock;
use csp_engine::engine::{BringupResult, Engine};
use csp_engine::sim::SimMaster;

use super::{PERIOD_NS, SimEngine, engine, two_drives};

const START_NS: u64 = 7_000;

fn run_with_work(e: &mut SimEngine, work: &[u64]) -> Vec<u64> {
    work.iter()
        .map(|w| {
            let wake = e.control_cycle().unwrap().wake_ns;
            e.scheduler_mut().time_mut().advance(*w);
            wake
        })
        .collect()
}

fn engine_from(start_ns: u64) -> SimEngine {
    let cfg = two_drives();
    let bus = SimMaster::request(0, &cfg).unwrap();
    Engine::configure(bus, &cfg, ManualClock::new(start_ns)).unwrap()
}

#[test]
fn wakes_sit_on_the_grid_across_phases() {
    let mut e = engine_from(START_NS);
    let BringupResult::Ready { cycles } = e.bring_up().unwrap() else {
        panic!("bring-up did not complete");
    };
    let work = [100_000, 900_000, 999_999, 1_000_000, 0, 250_000];
    let wakes = run_with_work(&mut e, &work);

    for (k, wake) in wakes.iter().enumerate() {
        assert_eq!(*wake, START_NS + (cycles + 1 + k as u64) * PERIOD_NS);
    }
    let all = e.scheduler().time().wakes();
    assert_eq!(all.len() as u64, cycles + work.len() as u64);
    for (k, wake) in all.iter().enumerate() {
        assert_eq!(*wake, START_NS + (k as u64 + 1) * PERIOD_NS);
    }
    // A body that takes exactly one period is not an overrun.
    assert_eq!(e.scheduler().stats().overruns, 0);
    assert_eq!(e.scheduler().stats().max_busy_ns, 1_000_000);
}

#[test]
fn overrun_is_counted_without_rebasing() {
    let mut e = engine_from(START_NS);
    e.bring_up().unwrap();
    let first = e.control_cycle().unwrap().wake_ns;
    e.scheduler_mut().time_mut().advance(PERIOD_NS + PERIOD_NS / 2);

    let wakes = run_with_work(&mut e, &[0, 0, 0]);
    assert_eq!(
        wakes,
        vec![first + PERIOD_NS, first + 2 * PERIOD_NS, first + 3 * PERIOD_NS]
    );
    let stats = e.scheduler().stats();
    assert_eq!(stats.overruns, 1);
    assert_eq!(stats.max_latency_ns, PERIOD_NS / 2);
    // The engine keeps running after an overrun.
    assert!(e.control_cycle().is_ok());
}

#[test]
fn grid_anchors_at_first_wait() {
    let cfg = two_drives();
    let mut e = engine(&cfg);
    e.scheduler_mut().time_mut().advance(123);
    e.bringup_cycle().unwrap();
    assert_eq!(e.scheduler().time().wakes(), &[123 + PERIOD_NS]);
}
