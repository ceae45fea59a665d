//! System-wide constants for the CSP workspace.
//!
//! Single source of truth for numeric limits, defaults and the CiA 402
//! object dictionary indices the engine maps.

use static_assertions::const_assert;

/// Nanoseconds per second.
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Default cycle frequency [Hz].
pub const DEFAULT_CYCLE_FREQUENCY_HZ: u64 = 1000;

/// Default cycle period [ns] (1 kHz).
pub const DEFAULT_CYCLE_PERIOD_NS: u64 = NSEC_PER_SEC / DEFAULT_CYCLE_FREQUENCY_HZ;

/// Shortest accepted cycle period [ns] (20 kHz).
pub const CYCLE_PERIOD_NS_MIN: u64 = 50_000;

/// Longest accepted cycle period [ns] (10 Hz).
pub const CYCLE_PERIOD_NS_MAX: u64 = 100_000_000;

// A whole-number cycle frequency requires the period to divide one second.
const_assert!(NSEC_PER_SEC % DEFAULT_CYCLE_PERIOD_NS == 0);

/// Maximum number of devices tracked by one engine.
pub const MAX_DEVICES: usize = 16;

/// Default bring-up budget [cycles] (10 s at 1 kHz).
pub const DEFAULT_BRINGUP_TIMEOUT_CYCLES: u64 = 10_000;

/// Default number of consecutive missed exchanges before the loop aborts.
pub const DEFAULT_MAX_CONSECUTIVE_MISSED: u32 = 10;

/// Default DC AssignActivate word (SYNC0 enabled).
pub const DEFAULT_ASSIGN_ACTIVATE: u16 = 0x0300;

/// Stack bytes touched before entering the loop.
pub const STACK_PREFAULT_BYTES: usize = 8 * 1024;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config/csp.toml";

// ─── CiA 402 Objects ────────────────────────────────────────────────

/// Controlword (RxPDO, UNSIGNED16).
pub const OBJ_CONTROL_WORD: u16 = 0x6040;

/// Statusword (TxPDO, UNSIGNED16).
pub const OBJ_STATUS_WORD: u16 = 0x6041;

/// Modes of operation (SDO, INTEGER8).
pub const OBJ_MODES_OF_OPERATION: u16 = 0x6060;

/// Position actual value (TxPDO, INTEGER32).
pub const OBJ_ACTUAL_POSITION: u16 = 0x6064;

/// Target position (RxPDO, INTEGER32).
pub const OBJ_TARGET_POSITION: u16 = 0x607A;

/// 2nd receive PDO mapping.
pub const RX_PDO_MAPPING: u16 = 0x1601;

/// 2nd transmit PDO mapping.
pub const TX_PDO_MAPPING: u16 = 0x1A01;

/// Cyclic synchronous position mode.
pub const MODE_CSP: u8 = 0x08;
