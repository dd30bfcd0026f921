//! Controller for the MicroJewel laser engine.
//!
//! [`LaserController`] owns the serial link and exposes typed getters and
//! setters for every device parameter, the arm/fire sequence and the
//! background tasks that supervise it:
//!
//! - the fire task, which checks that the laser stays active for the whole
//!   sequence and goes inactive once it ends
//! - the kicker, which keeps querying status during long sequences so the
//!   device's communication watchdog does not trip
//!
//! ```rust,ignore
//! use ujlaser_core::config::LaserConfig;
//! use ujlaser_driver::LaserController;
//!
//! let laser = LaserController::connect(&LaserConfig::load()?).await?;
//! laser.arm().await?;
//! laser.wait_until_armed(Duration::from_secs(10)).await?;
//! laser.fire().await?;
//! let outcome = laser.wait_for_fire().await?;
//! ```

pub mod controller;
pub mod fire;
mod kicker;

pub use controller::LaserController;
pub use fire::{FireFault, FireOutcome};

/// Device error codes; [`ErrorCode::description`] gives the fixed reason text.
pub use ujlaser_core::protocol::ErrorCode;
