//! Shared building blocks for the MicroJewel laser driver and emulator.
//!
//! - [`status`]: the 16-bit system status word
//! - [`protocol`]: command frames, responses and the `?1`..`?8` error codes
//! - [`keywords`]: which keywords are settings, queries or actions
//! - [`types`]: mode enums, parameter bounds, the settings block
//! - [`error`]: the controller error type
//! - [`serial`]: the byte transport the controller talks through
//! - [`config`]: Figment-based configuration

pub mod config;
pub mod error;
pub mod keywords;
pub mod limits;
pub mod protocol;
pub mod serial;
pub mod status;
pub mod types;

pub use error::{LaserError, LaserResult};
pub use protocol::{CommandFrame, ErrorCode, ProtocolError, Response};
pub use status::StatusWord;
pub use types::{DeviceLimits, DiodeTrigger, EnergyMode, LaserSettings, PulseMode};
