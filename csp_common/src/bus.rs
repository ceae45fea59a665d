//! Bus master trait and error types.
//!
//! This module defines:
//! - `BusMaster` trait - Interface the engine drives every cycle
//! - `BusError` enum - Error types for bus master operations
//! - Opaque handles for slave configurations and process-data domains
//! - `DomainState` - Per-exchange working counter report

use thiserror::Error;

use crate::device::{BusAddress, DeviceIdentity, ObjectId, SlaveConfigState};
use crate::pdo::SyncManagerConfig;

/// Error types for bus master operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The requested master could not be reserved.
    #[error("master {0} unavailable")]
    MasterUnavailable(u32),

    /// No slave configuration could be created for the address.
    #[error("slave configuration {address} rejected: {reason}")]
    SlaveConfig { address: BusAddress, reason: String },

    /// The PDO mapping was rejected.
    #[error("PDO mapping rejected: {0}")]
    PdoMapping(String),

    /// A process-data entry could not be registered in a domain.
    #[error("PDO entry registration failed for {object}: {reason}")]
    EntryRegistration { object: ObjectId, reason: String },

    /// Distributed-clock configuration was rejected.
    #[error("DC configuration rejected: {0}")]
    DcConfig(String),

    /// Activation failed; the bus is not ready for cyclic operation.
    #[error("master activation failed: {0}")]
    Activation(String),

    /// A blocking SDO download failed.
    #[error("SDO download to position {position} 0x{index:04x}:{subindex:02x} failed: {reason}")]
    SdoDownload {
        position: u16,
        index: u16,
        subindex: u8,
        reason: String,
    },

    /// Frame could not be sent or received.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Handle does not refer to a known object.
    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: usize },

    /// Operation is not valid in the master's current phase.
    #[error("operation not allowed: {0}")]
    InvalidPhase(&'static str),
}

/// Handle to a slave configuration created by [`BusMaster::configure_slave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlaveConfigHandle(pub usize);

/// Handle to a process-data domain created by [`BusMaster::create_domain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainHandle(pub usize);

/// One process-data entry to register in a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoEntryRegistration {
    pub slave: SlaveConfigHandle,
    pub object: ObjectId,
}

/// Distributed-clock parameters for one slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcSettings {
    pub assign_activate: u16,
    pub sync0_cycle_ns: u32,
    pub sync0_shift_ns: i32,
    pub sync1_cycle_ns: u32,
    pub sync1_shift_ns: i32,
}

/// Combined working counter evaluation of a domain exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcState {
    /// No registered process data was exchanged.
    Zero,
    /// Some, but not all, registered process data was exchanged.
    Incomplete,
    /// All registered process data was exchanged.
    Complete,
}

/// Result of processing one domain exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainState {
    pub working_counter: u16,
    pub expected_working_counter: u16,
}

impl DomainState {
    pub const fn wc_state(&self) -> WcState {
        if self.working_counter == 0 {
            WcState::Zero
        } else if self.working_counter < self.expected_working_counter {
            WcState::Incomplete
        } else {
            WcState::Complete
        }
    }
}

/// Interface the engine consumes from a fieldbus master.
///
/// Implementations are obtained from a backend-specific `request(index)`
/// constructor, which is the counterpart of reserving a master.
///
/// # Lifecycle
///
/// 1. Configuration: `sdo_download`, `configure_slave`, `configure_pdos`,
///    `create_domain`, `register_pdo_entries`, `configure_dc`
/// 2. `activate()` - not real-time safe, called once
/// 3. Per cycle: `receive` → `process_domain` → (`slave_config_state`) →
///    `queue_domain` → (DC calls) → `send`
/// 4. `release()` on teardown
///
/// # Timing Contracts
///
/// | Operation | RT Constraint |
/// |-----------|---------------|
/// | configuration calls | None (pre-RT, may block) |
/// | `activate()` | None (allocates) |
/// | cyclic calls | **HARD**, bounded, non-blocking |
/// | `release()` | None (post-RT) |
pub trait BusMaster {
    /// Backend identifier (e.g., "simulation").
    fn name(&self) -> &'static str;

    /// Blocking object-dictionary write to the device at `position`.
    fn sdo_download(
        &mut self,
        position: u16,
        index: u16,
        subindex: u8,
        data: &[u8],
    ) -> Result<(), BusError>;

    /// Create a slave configuration for the given address and identity.
    fn configure_slave(
        &mut self,
        address: BusAddress,
        identity: DeviceIdentity,
    ) -> Result<SlaveConfigHandle, BusError>;

    /// Apply a sync manager / PDO mapping table to a slave configuration.
    fn configure_pdos(
        &mut self,
        slave: SlaveConfigHandle,
        layout: &[SyncManagerConfig],
    ) -> Result<(), BusError>;

    /// Create a process-data domain.
    fn create_domain(&mut self) -> Result<DomainHandle, BusError>;

    /// Register entries in a domain. Returns the byte offset of each entry,
    /// in the order given.
    fn register_pdo_entries(
        &mut self,
        domain: DomainHandle,
        entries: &[PdoEntryRegistration],
    ) -> Result<Vec<usize>, BusError>;

    /// Configure distributed clocks for a slave.
    fn configure_dc(&mut self, slave: SlaveConfigHandle, dc: &DcSettings) -> Result<(), BusError>;

    /// Finish configuration and start bringing slaves up.
    fn activate(&mut self) -> Result<(), BusError>;

    /// Size of the domain's process data [bytes]. Valid after activation.
    fn domain_size(&self, domain: DomainHandle) -> Result<usize, BusError>;

    /// Fetch received frames and dispatch their datagrams.
    fn receive(&mut self) -> Result<(), BusError>;

    /// Evaluate the domain's datagrams and copy inputs into `data`.
    fn process_domain(
        &mut self,
        domain: DomainHandle,
        data: &mut [u8],
    ) -> Result<DomainState, BusError>;

    /// Mark the domain's datagrams, carrying outputs from `data`, for the next send.
    fn queue_domain(&mut self, domain: DomainHandle, data: &[u8]) -> Result<(), BusError>;

    /// Send all queued datagrams.
    fn send(&mut self) -> Result<(), BusError>;

    /// Current state of a slave configuration.
    fn slave_config_state(&self, slave: SlaveConfigHandle) -> Result<SlaveConfigState, BusError>;

    /// Submit the application time [ns] for the next DC datagrams.
    fn set_application_time(&mut self, app_time_ns: u64);

    /// Queue the reference clock synchronisation datagram.
    fn sync_reference_clock(&mut self);

    /// Queue the slave clocks synchronisation datagram.
    fn sync_slave_clocks(&mut self);

    /// Lower 32 bits of the reference clock's system time [ns].
    fn reference_clock_time(&self) -> Result<u32, BusError>;

    /// Release the master. No other call is valid afterwards.
    fn release(&mut self);
}
