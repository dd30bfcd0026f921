//! Software emulation of the MicroJewel laser engine.
//!
//! The [`ProtocolEngine`] interprets command frames against an in-memory
//! [`DeviceRegisters`] set and reproduces the device's arming delay and fire
//! timing. [`serve`] runs it over any async byte stream; [`spawn_emulator`]
//! wires it to an in-memory pipe for tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use ujlaser_emulator::{spawn_emulator, Fault};
//!
//! let (handle, client) = spawn_emulator(&LaserConfig::default());
//! handle.inject_fault(Fault::ExternalInterlock);
//! ```

pub mod engine;
pub mod faults;
pub mod registers;
pub mod server;

pub use engine::ProtocolEngine;
pub use faults::{Fault, FaultSet};
pub use registers::{ArmState, DeviceRegisters, Telemetry};
pub use server::{serve, spawn_emulator, EmulatorHandle};
