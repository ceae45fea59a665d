//! # CSP Engine Library
//!
//! Deterministic cyclic synchronization for servo drives in cyclic
//! synchronous position (CSP) mode. Every period the engine exchanges one
//! process image with the fieldbus, tracks device states until all drives
//! are operational, then computes and sends position setpoints while keeping
//! the drives' distributed clocks locked to the host.
//!
//! ## Cycle Order
//!
//! 1. Wait for the next absolute deadline
//! 2. Receive and process the returned frame (inputs, working counter)
//! 3. Check device states / compute setpoints
//! 4. Queue outputs, synchronise clocks, send
//!
//! ## RT Path
//!
//! Everything the loop touches is allocated during configuration. The
//! image, field descriptors and per-device state are fixed in size once the
//! bus is activated.

pub mod clock;
pub mod cycle;
pub mod device;
pub mod engine;
pub mod error;
pub mod image;
pub mod motion;
pub mod registry;
pub mod sim;
pub mod transaction;
