//! Per-device application-layer state tracking.
//!
//! The engine leaves bring-up only when every tracked device reports OP.
//! State changes are logged as they are observed.

use csp_common::bus::{BusMaster, SlaveConfigHandle};
use csp_common::consts::MAX_DEVICES;
use csp_common::device::{BusAddress, DeviceIdentity, DeviceState, SlaveConfigState};
use thiserror::Error;
use tracing::{info, warn};

use crate::transaction::{BusTransactionManager, TransactionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("at most {MAX_DEVICES} devices can be tracked")]
pub struct TrackerFull;

/// One configured device and what the bus last said about it.
#[derive(Debug, Clone)]
pub struct TrackedDevice {
    pub name: String,
    pub address: BusAddress,
    pub identity: DeviceIdentity,
    pub slave: SlaveConfigHandle,
    state: DeviceState,
    last_report: SlaveConfigState,
}

impl TrackedDevice {
    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn last_report(&self) -> SlaveConfigState {
        self.last_report
    }
}

#[derive(Debug, Default)]
pub struct DeviceStateTracker {
    devices: heapless::Vec<TrackedDevice, MAX_DEVICES>,
}

impl DeviceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a device; returns its index. New devices are `Unknown`.
    pub fn track(
        &mut self,
        name: impl Into<String>,
        address: BusAddress,
        identity: DeviceIdentity,
        slave: SlaveConfigHandle,
    ) -> Result<usize, TrackerFull> {
        let index = self.devices.len();
        self.devices
            .push(TrackedDevice {
                name: name.into(),
                address,
                identity,
                slave,
                state: DeviceState::Unknown,
                last_report: SlaveConfigState::default(),
            })
            .map_err(|_| TrackerFull)?;
        Ok(index)
    }

    /// Record a state report for one device and return its new state.
    ///
    /// Out-of-range indices are ignored and reported as `Unknown`.
    pub fn observe(&mut self, index: usize, report: SlaveConfigState) -> DeviceState {
        let Some(dev) = self.devices.get_mut(index) else {
            return DeviceState::Unknown;
        };
        let state = report.device_state();
        if dev.state.is_operational() && !state.is_operational() {
            warn!(
                "{} ({}) left OP: {} -> {}",
                dev.name, dev.address, dev.state, state
            );
        } else if state != dev.state || report.online != dev.last_report.online {
            info!(
                "{} ({}): {} -> {}{}",
                dev.name,
                dev.address,
                dev.state,
                state,
                if report.online { "" } else { " (offline)" }
            );
        }
        dev.state = state;
        dev.last_report = report;
        state
    }

    /// Query one device's state on the bus. Only valid between `process`
    /// and `queue` of the current exchange.
    pub fn refresh<B: BusMaster>(
        &mut self,
        index: usize,
        tx: &BusTransactionManager<B>,
    ) -> Result<DeviceState, TransactionError> {
        let Some(dev) = self.devices.get(index) else {
            return Ok(DeviceState::Unknown);
        };
        let report = tx.slave_state(dev.slave)?;
        Ok(self.observe(index, report))
    }

    /// Refresh every device; returns whether all of them are operational.
    pub fn refresh_all<B: BusMaster>(
        &mut self,
        tx: &BusTransactionManager<B>,
    ) -> Result<bool, TransactionError> {
        for index in 0..self.devices.len() {
            self.refresh(index, tx)?;
        }
        Ok(self.all_operational())
    }

    pub fn is_operational(&self, index: usize) -> bool {
        self.devices
            .get(index)
            .is_some_and(|d| d.state.is_operational())
    }

    /// True when at least one device is tracked and all of them are in OP.
    pub fn all_operational(&self) -> bool {
        !self.devices.is_empty() && self.devices.iter().all(|d| d.state.is_operational())
    }

    /// Number of devices not yet in OP.
    pub fn pending(&self) -> usize {
        self.devices
            .iter()
            .filter(|d| !d.state.is_operational())
            .count()
    }

    pub fn state(&self, index: usize) -> Option<DeviceState> {
        self.devices.get(index).map(TrackedDevice::state)
    }

    pub fn get(&self, index: usize) -> Option<&TrackedDevice> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedDevice> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
