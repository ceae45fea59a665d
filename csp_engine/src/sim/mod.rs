//! In-memory bus master.
//!
//! `SimMaster` implements [`BusMaster`] without hardware, for development
//! and tests. It models what the engine depends on:
//!
//! - slave configurations matched against the drives present on the bus
//! - PDO layout validation and packed domain offsets in registration order
//! - one LRW exchange per `send` → `receive` round trip, with per-drive
//!   working counters and AL state progression
//! - a 32-bit reference clock driven by the application time
//! - injected frame loss and transport errors
//! - a log of cyclic calls for ordering checks

mod drive;

pub use drive::{STATUS_OPERATION_ENABLED, STATUS_SWITCH_ON_DISABLED, SimDrive};

use std::cell::RefCell;

use csp_common::bus::{
    BusError, BusMaster, DcSettings, DomainHandle, DomainState, PdoEntryRegistration,
    SlaveConfigHandle,
};
use csp_common::config::EngineConfig;
use csp_common::consts::{OBJ_ACTUAL_POSITION, OBJ_CONTROL_WORD, OBJ_STATUS_WORD, OBJ_TARGET_POSITION};
use csp_common::device::{BusAddress, DeviceIdentity, DeviceState, ObjectId, SlaveConfigState};
use csp_common::pdo::{Direction, SyncManagerConfig, find_entry, mapped_entries};
use tracing::{debug, info};

/// Cyclic bus call, as recorded by [`SimMaster::call_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusCall {
    Receive,
    ProcessDomain,
    SlaveState(usize),
    QueueDomain,
    SetApplicationTime(u64),
    SyncReferenceClock,
    SyncSlaveClocks,
    ReferenceClockTime,
    Send,
}

/// An SDO download as seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdoRecord {
    pub position: u16,
    pub index: u16,
    pub subindex: u8,
    pub data: Vec<u8>,
    pub accepted: bool,
}

#[derive(Debug, Clone)]
struct SimSlave {
    address: BusAddress,
    identity: DeviceIdentity,
    /// Index into `drives` when a matching drive is present.
    drive: Option<usize>,
    layout: Vec<SyncManagerConfig>,
    dc: Option<DcSettings>,
}

#[derive(Debug, Clone, Copy)]
struct SimEntry {
    slave: usize,
    object: ObjectId,
    direction: Direction,
    offset: usize,
    bytes: usize,
    signed: bool,
}

#[derive(Debug, Clone, Default)]
struct SimDomain {
    entries: Vec<SimEntry>,
    size: usize,
    queued: Vec<u8>,
    in_flight: Vec<u8>,
    /// Working counter of the last returned frame, if one came back.
    returned: Option<u16>,
}

impl SimDomain {
    fn slaves(&self) -> impl Iterator<Item = usize> + '_ {
        let mut seen: Vec<usize> = Vec::new();
        self.entries.iter().filter_map(move |e| {
            if seen.contains(&e.slave) {
                None
            } else {
                seen.push(e.slave);
                Some(e.slave)
            }
        })
    }
}

/// Simulated master with its bus population.
#[derive(Debug)]
pub struct SimMaster {
    index: u32,
    /// `(position, drive)` pairs present on the bus.
    drives: Vec<(u16, SimDrive)>,
    slaves: Vec<SimSlave>,
    domains: Vec<SimDomain>,
    active: bool,
    released: bool,
    frame_in_flight: bool,
    exchanges: u64,
    drop_exchanges: u32,
    fail_receives: u32,
    app_time_origin: Option<u64>,
    app_time_ns: u64,
    reference_clock_start: u32,
    reference_clock: Option<u32>,
    slave_clock_syncs: u64,
    sdo_log: Vec<SdoRecord>,
    record_calls: bool,
    calls: RefCell<Vec<BusCall>>,
}

impl SimMaster {
    /// An empty bus behind master `index`.
    pub fn new(index: u32) -> Self {
        Self {
            index,
            drives: Vec::new(),
            slaves: Vec::new(),
            domains: Vec::new(),
            active: false,
            released: false,
            frame_in_flight: false,
            exchanges: 0,
            drop_exchanges: 0,
            fail_receives: 0,
            app_time_origin: None,
            app_time_ns: 0,
            reference_clock_start: 0,
            reference_clock: None,
            slave_clock_syncs: 0,
            sdo_log: Vec::new(),
            record_calls: false,
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Reserve simulated master `index` with one drive per configured device.
    ///
    /// Only master 0 exists.
    pub fn request(index: u32, config: &EngineConfig) -> Result<Self, BusError> {
        if index != 0 {
            return Err(BusError::MasterUnavailable(index));
        }
        let mut master = Self::new(index);
        master.reference_clock_start = config.simulation.reference_clock_start;
        for dev in &config.devices {
            let drive =
                SimDrive::new(dev.identity()).with_op_after(config.simulation.op_after_cycles);
            master.add_drive(dev.position, drive);
        }
        info!(
            "Simulated master {index} reserved with {} drive(s)",
            master.drives.len()
        );
        Ok(master)
    }

    /// Plug a drive in at a bus position, replacing any drive already there.
    pub fn add_drive(&mut self, position: u16, drive: SimDrive) {
        self.drives.retain(|(p, _)| *p != position);
        self.drives.push((position, drive));
    }

    pub fn drive(&self, position: u16) -> Option<&SimDrive> {
        self.drives.iter().find(|(p, _)| *p == position).map(|(_, d)| d)
    }

    pub fn drive_mut(&mut self, position: u16) -> Option<&mut SimDrive> {
        self.drives
            .iter_mut()
            .find(|(p, _)| *p == position)
            .map(|(_, d)| d)
    }

    pub fn set_reference_clock_start(&mut self, start: u32) {
        self.reference_clock_start = start;
    }

    /// Lose the next `n` frames: the exchange returns nothing.
    pub fn drop_exchanges(&mut self, n: u32) {
        self.drop_exchanges = n;
    }

    /// Fail the next `n` receive calls with a transport error.
    pub fn fail_transport(&mut self, n: u32) {
        self.fail_receives = n;
    }

    /// Start or stop recording cyclic calls. Starting clears the log.
    pub fn record_calls(&mut self, on: bool) {
        self.record_calls = on;
        if on {
            self.calls.borrow_mut().clear();
        }
    }

    pub fn call_log(&self) -> Vec<BusCall> {
        self.calls.borrow().clone()
    }

    pub fn sdo_log(&self) -> &[SdoRecord] {
        &self.sdo_log
    }

    /// Completed frame round trips.
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    pub fn slave_clock_syncs(&self) -> u64 {
        self.slave_clock_syncs
    }

    pub fn dc_settings(&self, slave: SlaveConfigHandle) -> Option<DcSettings> {
        self.slaves.get(slave.0).and_then(|s| s.dc)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn log(&self, call: BusCall) {
        if self.record_calls {
            self.calls.borrow_mut().push(call);
        }
    }

    fn configuring(&self, op: &'static str) -> Result<(), BusError> {
        if self.active || self.released {
            return Err(BusError::InvalidPhase(op));
        }
        Ok(())
    }

    fn cyclic(&self, op: &'static str) -> Result<(), BusError> {
        if !self.active {
            return Err(BusError::InvalidPhase(op));
        }
        Ok(())
    }

    fn slave(&self, handle: SlaveConfigHandle) -> Result<&SimSlave, BusError> {
        self.slaves.get(handle.0).ok_or(BusError::UnknownHandle {
            kind: "slave config",
            id: handle.0,
        })
    }

    fn domain_mut(&mut self, handle: DomainHandle) -> Result<&mut SimDomain, BusError> {
        self.domains.get_mut(handle.0).ok_or(BusError::UnknownHandle {
            kind: "domain",
            id: handle.0,
        })
    }

    fn attached_drive(&self, slave: usize) -> Option<&SimDrive> {
        let drive = self.slaves.get(slave)?.drive?;
        self.drives.get(drive).map(|(_, d)| d)
    }

    /// Deliver the outputs carried by the in-flight frame, then let every
    /// attached drive see the exchange.
    fn exchange(&mut self) {
        for d in 0..self.domains.len() {
            let domain = &self.domains[d];
            let mut outputs: Vec<(usize, Option<u16>, Option<i32>)> = Vec::new();
            for e in domain.entries.iter().filter(|e| e.direction == Direction::Output) {
                let Some(drive) = self.slaves[e.slave].drive else {
                    continue;
                };
                let value = decode(&domain.in_flight[e.offset..e.offset + e.bytes], e.signed);
                let slot = match outputs.iter().position(|(i, _, _)| *i == drive) {
                    Some(i) => i,
                    None => {
                        outputs.push((drive, None, None));
                        outputs.len() - 1
                    }
                };
                match e.object.index {
                    OBJ_CONTROL_WORD => outputs[slot].1 = Some(value as u16),
                    OBJ_TARGET_POSITION => outputs[slot].2 = Some(value as i32),
                    _ => {}
                }
            }
            for (drive, cw, tp) in outputs {
                self.drives[drive].1.apply_outputs(cw, tp);
            }
        }

        let attached: Vec<usize> = self.slaves.iter().filter_map(|s| s.drive).collect();
        for drive in attached {
            self.drives[drive].1.step();
        }
        self.exchanges += 1;

        for d in 0..self.domains.len() {
            let wc: u16 = self.domains[d]
                .slaves()
                .filter_map(|s| self.attached_drive(s))
                .map(SimDrive::working_counter)
                .sum();
            self.domains[d].returned = Some(wc);
        }
    }
}

fn decode(bytes: &[u8], signed: bool) -> i64 {
    let mut raw = 0u64;
    for (i, b) in bytes.iter().enumerate() {
        raw |= (*b as u64) << (8 * i);
    }
    let bits = 8 * bytes.len() as u32;
    if signed && bits > 0 && bits < 64 {
        let shift = 64 - bits;
        ((raw << shift) as i64) >> shift
    } else {
        raw as i64
    }
}

fn encode(value: i64, out: &mut [u8]) {
    let bytes = value.to_le_bytes();
    let n = out.len().min(8);
    out[..n].copy_from_slice(&bytes[..n]);
}

impl BusMaster for SimMaster {
    fn name(&self) -> &'static str {
        "simulation"
    }

    fn sdo_download(
        &mut self,
        position: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), BusError> {
        self.configuring("sdo_download")?;
        let fail = |reason: String| BusError::SdoDownload {
            position,
            index,
            subindex,
            reason,
        };
        let result = match self.drive_mut(position) {
            Some(drive) => drive.sdo_download(index, subindex, data).map_err(fail),
            None => Err(fail("no slave at position".to_string())),
        };
        self.sdo_log.push(SdoRecord {
            position,
            index,
            subindex,
            data: data.to_vec(),
            accepted: result.is_ok(),
        });
        result
    }

    fn configure_slave(
        &mut self,
        address: BusAddress,
        identity: DeviceIdentity,
    ) -> Result<SlaveConfigHandle, BusError> {
        self.configuring("configure_slave")?;
        if let Some(i) = self.slaves.iter().position(|s| s.address == address) {
            if self.slaves[i].identity != identity {
                return Err(BusError::SlaveConfig {
                    address,
                    reason: format!("already configured as {}", self.slaves[i].identity),
                });
            }
            return Ok(SlaveConfigHandle(i));
        }

        let drive = if address.alias == 0 {
            self.drives
                .iter()
                .position(|(p, d)| *p == address.position && d.identity() == identity)
        } else {
            None
        };
        if drive.is_none() {
            debug!("No {identity} at {address}; configuration stays detached");
        }
        self.slaves.push(SimSlave {
            address,
            identity,
            drive,
            layout: Vec::new(),
            dc: None,
        });
        Ok(SlaveConfigHandle(self.slaves.len() - 1))
    }

    fn configure_pdos(
        &mut self,
        slave: SlaveConfigHandle,
        layout: &[SyncManagerConfig],
    ) -> Result<(), BusError> {
        self.configuring("configure_pdos")?;
        self.slave(slave)?;
        for sm in layout {
            if sm.index > 15 {
                return Err(BusError::PdoMapping(format!(
                    "sync manager {} does not exist",
                    sm.index
                )));
            }
        }
        for (_, entry) in mapped_entries(layout) {
            if !matches!(entry.bits, 8 | 16 | 32) {
                return Err(BusError::PdoMapping(format!(
                    "entry {} has unsupported width {}",
                    entry.object(),
                    entry.bits
                )));
            }
        }
        self.slaves[slave.0].layout = layout.to_vec();
        Ok(())
    }

    fn create_domain(&mut self) -> Result<DomainHandle, BusError> {
        self.configuring("create_domain")?;
        self.domains.push(SimDomain::default());
        Ok(DomainHandle(self.domains.len() - 1))
    }

    fn register_pdo_entries(
        &mut self,
        domain: DomainHandle,
        entries: &[PdoEntryRegistration],
    ) -> Result<Vec<usize>, BusError> {
        self.configuring("register_pdo_entries")?;
        let mut resolved = Vec::with_capacity(entries.len());
        for reg in entries {
            let slave = self.slave(reg.slave)?;
            let (direction, info) =
                find_entry(&slave.layout, reg.object).ok_or_else(|| BusError::EntryRegistration {
                    object: reg.object,
                    reason: format!("not mapped by slave {}", slave.address),
                })?;
            resolved.push((reg.slave.0, direction, info));
        }

        let dom = self.domain_mut(domain)?;
        let mut offsets = Vec::with_capacity(resolved.len());
        for (slave, direction, info) in resolved {
            if dom
                .entries
                .iter()
                .any(|e| e.slave == slave && e.object == info.object())
            {
                return Err(BusError::EntryRegistration {
                    object: info.object(),
                    reason: "already registered".to_string(),
                });
            }
            let bytes = (info.bits / 8) as usize;
            dom.entries.push(SimEntry {
                slave,
                object: info.object(),
                direction,
                offset: dom.size,
                bytes,
                signed: info.signed,
            });
            offsets.push(dom.size);
            dom.size += bytes;
        }
        Ok(offsets)
    }

    fn configure_dc(&mut self, slave: SlaveConfigHandle, dc: &DcSettings) -> Result<(), BusError> {
        self.configuring("configure_dc")?;
        self.slave(slave)?;
        if dc.assign_activate != 0 && dc.sync0_cycle_ns == 0 {
            return Err(BusError::DcConfig(
                "SYNC0 activated with a zero cycle time".to_string(),
            ));
        }
        self.slaves[slave.0].dc = Some(*dc);
        Ok(())
    }

    fn activate(&mut self) -> Result<(), BusError> {
        self.configuring("activate")?;
        for dom in &mut self.domains {
            dom.queued = vec![0; dom.size];
            dom.in_flight = vec![0; dom.size];
        }
        self.active = true;
        info!(
            "Simulated master {} active: {} slave config(s), {} domain(s)",
            self.index,
            self.slaves.len(),
            self.domains.len()
        );
        Ok(())
    }

    fn domain_size(&self, domain: DomainHandle) -> Result<usize, BusError> {
        self.domains
            .get(domain.0)
            .map(|d| d.size)
            .ok_or(BusError::UnknownHandle {
                kind: "domain",
                id: domain.0,
            })
    }

    fn receive(&mut self) -> Result<(), BusError> {
        self.log(BusCall::Receive);
        self.cyclic("receive")?;
        for dom in &mut self.domains {
            dom.returned = None;
        }
        if self.fail_receives > 0 {
            self.fail_receives -= 1;
            self.frame_in_flight = false;
            return Err(BusError::Transport("simulated link down".to_string()));
        }
        if !self.frame_in_flight {
            return Ok(());
        }
        self.frame_in_flight = false;
        if self.drop_exchanges > 0 {
            self.drop_exchanges -= 1;
            return Ok(());
        }
        self.exchange();
        Ok(())
    }

    fn process_domain(
        &mut self,
        domain: DomainHandle,
        data: &mut [u8],
    ) -> Result<DomainState, BusError> {
        self.log(BusCall::ProcessDomain);
        self.cyclic("process_domain")?;
        let dom = self.domains.get(domain.0).ok_or(BusError::UnknownHandle {
            kind: "domain",
            id: domain.0,
        })?;
        let expected = 3 * dom.slaves().count() as u16;
        let Some(working_counter) = dom.returned else {
            return Ok(DomainState {
                working_counter: 0,
                expected_working_counter: expected,
            });
        };

        for e in dom.entries.iter().filter(|e| e.direction == Direction::Input) {
            let Some(drive) = self.attached_drive(e.slave) else {
                continue;
            };
            if !drive.inputs_valid() || e.offset + e.bytes > data.len() {
                continue;
            }
            let value = match e.object.index {
                OBJ_STATUS_WORD => drive.status_word() as i64,
                OBJ_ACTUAL_POSITION => drive.actual_position() as i64,
                _ => 0,
            };
            encode(value, &mut data[e.offset..e.offset + e.bytes]);
        }
        Ok(DomainState {
            working_counter,
            expected_working_counter: expected,
        })
    }

    fn queue_domain(&mut self, domain: DomainHandle, data: &[u8]) -> Result<(), BusError> {
        self.log(BusCall::QueueDomain);
        self.cyclic("queue_domain")?;
        let dom = self.domain_mut(domain)?;
        let n = dom.queued.len().min(data.len());
        dom.queued[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn send(&mut self) -> Result<(), BusError> {
        self.log(BusCall::Send);
        self.cyclic("send")?;
        for dom in &mut self.domains {
            dom.in_flight.copy_from_slice(&dom.queued);
        }
        self.frame_in_flight = true;
        Ok(())
    }

    fn slave_config_state(&self, slave: SlaveConfigHandle) -> Result<SlaveConfigState, BusError> {
        self.log(BusCall::SlaveState(slave.0));
        self.slave(slave)?;
        Ok(match self.attached_drive(slave.0) {
            Some(drive) if self.active => SlaveConfigState {
                online: true,
                operational: drive.state() == DeviceState::Op,
                al_state: drive.state().al_state(),
            },
            _ => SlaveConfigState::default(),
        })
    }

    fn set_application_time(&mut self, app_time_ns: u64) {
        self.log(BusCall::SetApplicationTime(app_time_ns));
        self.app_time_origin.get_or_insert(app_time_ns);
        self.app_time_ns = app_time_ns;
    }

    fn sync_reference_clock(&mut self) {
        self.log(BusCall::SyncReferenceClock);
        let origin = self.app_time_origin.unwrap_or(self.app_time_ns);
        // The counter is the low 32 bits of elapsed system time.
        let elapsed = self.app_time_ns.wrapping_sub(origin) as u32;
        self.reference_clock = Some(self.reference_clock_start.wrapping_add(elapsed));
    }

    fn sync_slave_clocks(&mut self) {
        self.log(BusCall::SyncSlaveClocks);
        self.slave_clock_syncs += 1;
    }

    fn reference_clock_time(&self) -> Result<u32, BusError> {
        self.log(BusCall::ReferenceClockTime);
        self.cyclic("reference_clock_time")?;
        self.reference_clock
            .ok_or_else(|| BusError::Transport("reference clock not synchronised yet".to_string()))
    }

    fn release(&mut self) {
        if !self.released {
            info!(
                "Simulated master {} released after {} exchange(s)",
                self.index, self.exchanges
            );
        }
        self.active = false;
        self.released = true;
        self.frame_in_flight = false;
    }
}
