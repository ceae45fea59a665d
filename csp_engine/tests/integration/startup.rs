//! Integration test: configuration from file, startup SDOs, and
//! failures before the first cycle.

use std::fs;

use csp_common::bus::BusError;
use csp_common::config::{EngineConfig, load_config};
use csp_common::device::DeviceState;
use csp_engine::engine::{BringupResult, EnginePhase};
use csp_engine::error::{EXIT_CONFIG, EngineError};
use csp_engine::sim::SimMaster;
use tempfile::TempDir;

use super::{TWO_DRIVES, engine, engine_on, two_drives};

#[test]
fn engine_from_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("csp.toml");
    fs::write(&path, TWO_DRIVES).unwrap();

    let cfg = load_config(&path).unwrap();
    let mut e = engine(&cfg);
    assert_eq!(e.phase(), EnginePhase::StartupConfig);
    assert!(matches!(e.bring_up().unwrap(), BringupResult::Ready { .. }));
}

#[test]
fn startup_sdos_put_drives_in_csp() {
    let cfg = two_drives();
    let e = engine(&cfg);
    for pos in 0..2 {
        let drive = e.bus().drive(pos).unwrap();
        assert_eq!(drive.mode(), 8);
        assert_eq!(drive.control_word(), 0x000F);
        assert_eq!(drive.sdo_writes().len(), 3);
    }
    assert!(e.bus().sdo_log().iter().all(|r| r.accepted));
}

#[test]
fn custom_startup_sdos_replace_the_default_sequence() {
    let toml = TWO_DRIVES.replacen(
        "setpoint_offset = 5000\n",
        "setpoint_offset = 5000\n\n\
         [[devices.startup_sdo]]\nindex = 0x60C2\nsubindex = 1\nvalue = 1\nsize = 1\n",
        1,
    );
    let cfg = EngineConfig::from_toml_str(&toml).unwrap();
    let e = engine(&cfg);
    let drive0: Vec<_> = e
        .bus()
        .sdo_log()
        .iter()
        .filter(|r| r.position == 0)
        .map(|r| (r.index, r.subindex, r.data.clone()))
        .collect();
    assert_eq!(drive0, vec![(0x60C2, 1, vec![0x01])]);
    assert_eq!(e.bus().drive(0).unwrap().mode(), 0);
    assert_eq!(e.bus().drive(1).unwrap().mode(), 8);
}

#[test]
fn rejected_sdo_is_not_fatal() {
    let cfg = two_drives();
    let mut bus = SimMaster::request(0, &cfg).unwrap();
    bus.drive_mut(0).unwrap().reject_sdo(true);
    let mut e = engine_on(bus, &cfg);

    let drive0: Vec<bool> = e
        .bus()
        .sdo_log()
        .iter()
        .filter(|r| r.position == 0)
        .map(|r| r.accepted)
        .collect();
    assert_eq!(drive0, vec![false, false, false]);
    assert!(e.bus().drive(0).unwrap().sdo_writes().is_empty());
    assert!(e.bus().is_active());

    assert!(matches!(e.bring_up().unwrap(), BringupResult::Ready { .. }));
    e.control_cycle().unwrap();
}

#[test]
fn only_master_zero_exists() {
    let cfg = two_drives();
    assert_eq!(
        SimMaster::request(1, &cfg).unwrap_err(),
        BusError::MasterUnavailable(1)
    );
}

#[test]
fn wrong_identity_never_reaches_op() {
    let mut cfg = two_drives();
    let bus = SimMaster::request(0, &cfg).unwrap();
    cfg.devices[1].product_code = 0x0000_1234;
    cfg.engine.bringup_timeout_cycles = 12;
    let mut e = engine_on(bus, &cfg);

    let err = e.run().unwrap_err();
    assert!(matches!(err, EngineError::BringupTimeout { pending: 1, .. }));
    assert_eq!(e.tracker().state(1), Some(DeviceState::Unknown));
}

#[test]
fn invalid_period_is_a_config_error() {
    let toml = TWO_DRIVES.replace("cycle_period_ns = 1000000", "cycle_period_ns = 3000000");
    let err = EngineConfig::from_toml_str(&toml).unwrap_err();
    let err = EngineError::from(err);
    assert_eq!(err.exit_code(), EXIT_CONFIG);
}

#[test]
fn shipped_config_loads() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../config/csp.toml");
    let cfg = load_config(&path).unwrap();
    assert_eq!(cfg.devices.len(), 2);
    assert_eq!(cfg.devices[1].setpoint_offset, -5000);
    let e = engine(&cfg);
    assert_eq!(e.image().len(), 24);
}
