//! Default timing constants for the device link.
//!
//! These are the values observed on the hardware. Every one of them can be
//! overridden through [`crate::config::TimingConfig`].

use std::time::Duration;

// =============================================================================
// Serial Link
// =============================================================================

/// Default baud rate of the MicroJewel serial interface.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default device address.
pub const DEFAULT_ADDRESS: &str = "LA";

/// Time allowed for one response to arrive (1 second).
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Time spent discarding stale bytes after a missed response (50 ms).
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Upper bound on a single response line.
///
/// Longer lines are treated as garbage and discarded.
pub const MAX_RESPONSE_LEN: usize = 256;

// =============================================================================
// Arming and Firing
// =============================================================================

/// Delay between `EN 1` and ready-to-fire (8 seconds).
pub const ARMING_DELAY: Duration = Duration::from_secs(8);

/// Interval between status polls during a fire sequence (100 ms).
pub const FIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time allowed after the fire duration for the device to report inactive (1 second).
pub const FIRE_COMPLETION_GRACE: Duration = Duration::from_secs(1);

// =============================================================================
// Kicker
// =============================================================================

/// Interval between kicker status queries (500 ms).
///
/// Keeps the device's communication-timeout counter from tripping.
pub const KICKER_INTERVAL: Duration = Duration::from_millis(500);

/// Fire sequences at least this long run the kicker (2 seconds).
pub const KICKER_THRESHOLD: Duration = Duration::from_secs(2);
