//! Typed device model: mode enums, parameter bounds and the settings block.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Identification string reported by the device (and the emulator).
pub const DEVICE_IDENTITY: &str = "QC,MicroJewel,00101,1.0-0.0.0.8";

/// Substring that must appear in the `ID?` response.
pub const IDENTITY_MARKER: &str = "MicroJewel";

/// Numeric register value outside the variants of a mode enum.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} has no variant {value}")]
pub struct UnknownVariant {
    /// Name of the enum.
    pub kind: &'static str,
    /// Rejected register value.
    pub value: i64,
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Register value sent on the wire.
            pub fn as_wire(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<i64> for $name {
            type Error = UnknownVariant;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: stringify!($name), value }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_wire())
            }
        }
    };
}

wire_enum!(
    /// Pulse mode (`PM`).
    PulseMode {
        #[default]
        /// One sequence of `PE` seconds.
        Continuous = 0,
        /// One pulse.
        SingleShot = 1,
        /// `BC` pulses at `RR`.
        Burst = 2,
    }
);

wire_enum!(
    /// Energy mode (`EM`). Low and high select the matching status power bits.
    EnergyMode {
        #[default]
        /// Diode current set by `DC`.
        Manual = 0,
        /// Low power preset.
        Low = 1,
        /// High power preset.
        High = 2,
    }
);

wire_enum!(
    /// Diode trigger source (`DT`).
    DiodeTrigger {
        #[default]
        /// Device timing.
        Internal = 0,
        /// External trigger input.
        External = 1,
    }
);

impl EnergyMode {
    /// Modes in which `FL 1` is accepted.
    pub fn permits_fire(self) -> bool {
        matches!(self, EnergyMode::Manual | EnergyMode::High)
    }
}

/// Format a float the way it goes on the wire (shortest round-trip form).
pub fn format_float(value: f64) -> String {
    format!("{value}")
}

// =============================================================================
// Bounds
// =============================================================================

/// Inclusive parameter range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds<T> {
    /// Lowest allowed value.
    pub min: T,
    /// Highest allowed value.
    pub max: T,
}

impl<T: PartialOrd + Copy> Bounds<T> {
    /// Range from `min` to `max`, both inclusive.
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }

    /// True when `value` lies within the range.
    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    /// False when `min > max` (or a bound is NaN).
    pub fn is_ordered(&self) -> bool {
        self.min <= self.max
    }
}

impl<T: fmt::Display> fmt::Display for Bounds<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Valid ranges of the settable parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLimits {
    /// Pulses per burst (`BC`).
    pub burst_count: Bounds<u32>,
    /// Amperes.
    pub diode_current: Bounds<f64>,
    /// Seconds.
    pub pulse_width: Bounds<f64>,
    /// Seconds.
    pub pulse_period: Bounds<f64>,
    /// Hertz.
    pub rep_rate: Bounds<f64>,
    /// Save/recall slot numbers (`SV`, `RC`).
    pub settings_slot: Bounds<u8>,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            burst_count: Bounds::new(1, 65535),
            diode_current: Bounds::new(10.0, 140.0),
            pulse_width: Bounds::new(10e-6, 250e-6),
            pulse_period: Bounds::new(0.0, 10.0),
            rep_rate: Bounds::new(1.0, 5.0),
            settings_slot: Bounds::new(1, 6),
        }
    }
}

// =============================================================================
// Settings block
// =============================================================================

/// The settable parameter registers.
///
/// Held by the emulator as authoritative state and by the controller as its
/// mirror of the device. `Default` yields the factory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserSettings {
    /// `BC`, pulses per burst
    pub burst_count: u32,
    /// `DC`, amperes
    pub diode_current: f64,
    /// `DT`
    pub diode_trigger: DiodeTrigger,
    /// `DW`, seconds
    pub pulse_width: f64,
    /// `EC`
    pub echo: bool,
    /// `EM`
    pub energy_mode: EnergyMode,
    /// `PE`, seconds
    pub pulse_period: f64,
    /// `PM`
    pub pulse_mode: PulseMode,
    /// `RR`, hertz
    pub rep_rate: f64,
}

impl Default for LaserSettings {
    fn default() -> Self {
        Self {
            burst_count: 10,
            diode_current: 100.0,
            diode_trigger: DiodeTrigger::Internal,
            pulse_width: 140e-6,
            echo: false,
            energy_mode: EnergyMode::Manual,
            pulse_period: 0.2,
            pulse_mode: PulseMode::Continuous,
            rep_rate: 1.0,
        }
    }
}

impl LaserSettings {
    /// How long a fire sequence lasts in the current pulse mode.
    ///
    /// Continuous: the pulse period. Single shot: one repetition interval.
    /// Burst: `burst_count` repetition intervals.
    pub fn fire_duration(&self) -> Duration {
        let secs = match self.pulse_mode {
            PulseMode::Continuous => self.pulse_period,
            PulseMode::SingleShot => 1.0 / self.rep_rate,
            PulseMode::Burst => f64::from(self.burst_count) / self.rep_rate,
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
    }

    /// Shots counted when a fire sequence completes.
    pub fn shots_per_fire(&self) -> u64 {
        match self.pulse_mode {
            PulseMode::SingleShot => 1,
            PulseMode::Burst => u64::from(self.burst_count),
            PulseMode::Continuous => {
                let shots = (self.pulse_period * self.rep_rate).round();
                if shots.is_finite() && shots >= 1.0 {
                    shots as u64
                } else {
                    1
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_convert_from_wire_values() {
        assert_eq!(PulseMode::try_from(2), Ok(PulseMode::Burst));
        assert_eq!(EnergyMode::try_from(1), Ok(EnergyMode::Low));
        assert_eq!(DiodeTrigger::try_from(1), Ok(DiodeTrigger::External));
        let err = PulseMode::try_from(3).unwrap_err();
        assert_eq!(err.to_string(), "PulseMode has no variant 3");
        assert_eq!(EnergyMode::High.to_string(), "2");
    }

    #[test]
    fn only_manual_and_high_permit_fire() {
        assert!(EnergyMode::Manual.permits_fire());
        assert!(EnergyMode::High.permits_fire());
        assert!(!EnergyMode::Low.permits_fire());
    }

    #[test]
    fn fire_duration_follows_pulse_mode() {
        let mut settings = LaserSettings {
            pulse_period: 2.0,
            rep_rate: 4.0,
            burst_count: 10,
            ..Default::default()
        };
        assert_eq!(settings.fire_duration(), Duration::from_secs(2));
        assert_eq!(settings.shots_per_fire(), 8);

        settings.pulse_mode = PulseMode::SingleShot;
        assert_eq!(settings.fire_duration(), Duration::from_millis(250));
        assert_eq!(settings.shots_per_fire(), 1);

        settings.pulse_mode = PulseMode::Burst;
        assert_eq!(settings.fire_duration(), Duration::from_millis(2500));
        assert_eq!(settings.shots_per_fire(), 10);
    }

    #[test]
    fn continuous_fire_counts_at_least_one_shot() {
        let settings = LaserSettings {
            pulse_period: 0.0,
            ..Default::default()
        };
        assert_eq!(settings.fire_duration(), Duration::ZERO);
        assert_eq!(settings.shots_per_fire(), 1);
    }

    #[test]
    fn bounds_are_inclusive() {
        let limits = DeviceLimits::default();
        assert!(limits.rep_rate.contains(1.0));
        assert!(limits.rep_rate.contains(5.0));
        assert!(!limits.rep_rate.contains(5.01));
        assert!(!limits.burst_count.contains(0));
        assert_eq!(limits.settings_slot.to_string(), "1..=6");
    }

    #[test]
    fn floats_use_shortest_form() {
        assert_eq!(format_float(0.2), "0.2");
        assert_eq!(format_float(2.0), "2");
        assert_eq!(format_float(140e-6), "0.00014");
    }
}
