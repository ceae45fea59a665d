//! CSP Common Library
//!
//! Shared vocabulary between the cyclic engine and whatever drives the
//! fieldbus underneath it.
//!
//! # Module Structure
//!
//! - [`bus`] - Bus master trait, handles and per-cycle health types
//! - [`device`] - Device addressing, identity and application-layer state
//! - [`pdo`] - PDO mapping tables and startup SDO writes
//! - [`config`] - TOML configuration loading and validation
//! - [`consts`] - Numeric limits, defaults and CiA 402 object indices
//! - [`prelude`] - Common re-exports for convenience

pub mod bus;
pub mod config;
pub mod consts;
pub mod device;
pub mod pdo;
pub mod prelude;
