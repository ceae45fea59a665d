//! Engine error taxonomy and process exit codes.

use csp_common::bus::BusError;
use csp_common::config::ConfigError;
use thiserror::Error;

use crate::cycle::CycleError;
use crate::device::TrackerFull;
use crate::engine::EnginePhase;
use crate::image::ImageError;
use crate::registry::RegistryError;
use crate::transaction::TransactionError;

/// Exit code for configuration and start-up failures.
pub const EXIT_CONFIG: i32 = 1;
/// Exit code when devices did not reach OP in time.
pub const EXIT_BRINGUP_TIMEOUT: i32 = 2;
/// Exit code when the bus stopped answering during control.
pub const EXIT_TRANSPORT_FATAL: i32 = 3;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    TooManyDevices(#[from] TrackerFull),

    #[error("{op} not allowed in engine phase {phase:?}")]
    WrongPhase { op: &'static str, phase: EnginePhase },

    #[error("bring-up timed out after {cycles} cycles, {pending} device(s) not in OP")]
    BringupTimeout { cycles: u64, pending: usize },

    #[error("bus lost: {consecutive} consecutive missed exchanges")]
    TransportFatal { consecutive: u32 },
}

impl EngineError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BringupTimeout { .. } => EXIT_BRINGUP_TIMEOUT,
            Self::TransportFatal { .. } => EXIT_TRANSPORT_FATAL,
            _ => EXIT_CONFIG,
        }
    }
}
