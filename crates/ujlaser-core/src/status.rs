//! System status word (`SS?`) codec.
//!
//! The device reports its state as a 16-bit decimal integer. Bit positions are
//! fixed by the MicroJewel user manual:
//!
//! | bit | flag |
//! |-----|------|
//! | 0   | laser enabled |
//! | 1   | laser active |
//! | 3   | diode external trigger |
//! | 6   | external interlock |
//! | 7   | resonator over-temperature |
//! | 8   | electrical over-temperature |
//! | 9   | power failure |
//! | 10  | ready to enable |
//! | 11  | ready to fire |
//! | 12  | low power mode |
//! | 13  | high power mode |
//!
//! All other bits are reserved: they are ignored when decoding and never set
//! when encoding.

use std::fmt;
use std::str::FromStr;

/// Laser enabled (armed).
pub const LASER_ENABLED: u16 = 1 << 0;
/// Laser actively firing.
pub const LASER_ACTIVE: u16 = 1 << 1;
/// Diode driven by the external trigger input.
pub const DIODE_EXTERNAL_TRIGGER: u16 = 1 << 3;
/// External interlock open.
pub const EXTERNAL_INTERLOCK: u16 = 1 << 6;
/// Resonator over-temperature.
pub const RESONATOR_OVER_TEMP: u16 = 1 << 7;
/// Electrical over-temperature.
pub const ELECTRICAL_OVER_TEMP: u16 = 1 << 8;
/// Power failure.
pub const POWER_FAILURE: u16 = 1 << 9;
/// Device can accept `EN 1`.
pub const READY_TO_ENABLE: u16 = 1 << 10;
/// Arming finished; device can accept `FL 1`.
pub const READY_TO_FIRE: u16 = 1 << 11;
/// Low power energy mode selected.
pub const LOW_POWER_MODE: u16 = 1 << 12;
/// High power energy mode selected.
pub const HIGH_POWER_MODE: u16 = 1 << 13;

/// Union of every defined flag bit.
pub const DEFINED_MASK: u16 = LASER_ENABLED
    | LASER_ACTIVE
    | DIODE_EXTERNAL_TRIGGER
    | EXTERNAL_INTERLOCK
    | RESONATOR_OVER_TEMP
    | ELECTRICAL_OVER_TEMP
    | POWER_FAILURE
    | READY_TO_ENABLE
    | READY_TO_FIRE
    | LOW_POWER_MODE
    | HIGH_POWER_MODE;

/// Bits the device never sets.
pub const RESERVED_MASK: u16 = !DEFINED_MASK;

/// Decoded system status word.
///
/// Built fresh from every status query and never mutated in place by the
/// driver; the emulator assembles one from its live registers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StatusWord {
    /// Bit 0: laser enabled.
    pub laser_enabled: bool,
    /// Bit 1: laser active (firing).
    pub laser_active: bool,
    /// Bit 3: diode trigger is external.
    pub diode_external_trigger: bool,
    /// Bit 6: external interlock open.
    pub external_interlock: bool,
    /// Bit 7: resonator over temperature.
    pub resonator_over_temp: bool,
    /// Bit 8: electrical over temperature.
    pub electrical_over_temp: bool,
    /// Bit 9: power failure.
    pub power_failure: bool,
    /// Bit 10: ready to enable.
    pub ready_to_enable: bool,
    /// Bit 11: ready to fire.
    pub ready_to_fire: bool,
    /// Bit 12: low power mode.
    pub low_power_mode: bool,
    /// Bit 13: high power mode.
    pub high_power_mode: bool,
}

impl StatusWord {
    fn flags(&self) -> [(bool, u16); 11] {
        [
            (self.laser_enabled, LASER_ENABLED),
            (self.laser_active, LASER_ACTIVE),
            (self.diode_external_trigger, DIODE_EXTERNAL_TRIGGER),
            (self.external_interlock, EXTERNAL_INTERLOCK),
            (self.resonator_over_temp, RESONATOR_OVER_TEMP),
            (self.electrical_over_temp, ELECTRICAL_OVER_TEMP),
            (self.power_failure, POWER_FAILURE),
            (self.ready_to_enable, READY_TO_ENABLE),
            (self.ready_to_fire, READY_TO_FIRE),
            (self.low_power_mode, LOW_POWER_MODE),
            (self.high_power_mode, HIGH_POWER_MODE),
        ]
    }

    /// Pack the flags into the wire integer.
    pub fn encode(&self) -> u16 {
        self.flags()
            .iter()
            .filter(|(set, _)| *set)
            .fold(0u16, |acc, (_, bit)| acc | bit)
    }

    /// Unpack a wire integer. Reserved bits are ignored.
    pub fn decode(value: u16) -> Self {
        let has = |bit: u16| value & bit != 0;
        Self {
            laser_enabled: has(LASER_ENABLED),
            laser_active: has(LASER_ACTIVE),
            diode_external_trigger: has(DIODE_EXTERNAL_TRIGGER),
            external_interlock: has(EXTERNAL_INTERLOCK),
            resonator_over_temp: has(RESONATOR_OVER_TEMP),
            electrical_over_temp: has(ELECTRICAL_OVER_TEMP),
            power_failure: has(POWER_FAILURE),
            ready_to_enable: has(READY_TO_ENABLE),
            ready_to_fire: has(READY_TO_FIRE),
            low_power_mode: has(LOW_POWER_MODE),
            high_power_mode: has(HIGH_POWER_MODE),
        }
    }

    /// True when any of the fault bits is raised.
    pub fn has_fault(&self) -> bool {
        self.external_interlock
            || self.resonator_over_temp
            || self.electrical_over_temp
            || self.power_failure
    }

    /// Armed and ready to accept a fire command.
    pub fn is_armed(&self) -> bool {
        self.laser_enabled && self.ready_to_fire
    }
}

impl From<u16> for StatusWord {
    fn from(value: u16) -> Self {
        Self::decode(value)
    }
}

impl From<StatusWord> for u16 {
    fn from(status: StatusWord) -> Self {
        status.encode()
    }
}

/// Error returned when a status response is not a 16-bit decimal integer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status word '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for StatusWord {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u16>()
            .map(Self::decode)
            .map_err(|_| ParseStatusError(s.trim().to_string()))
    }
}

impl fmt::Display for StatusWord {
    /// Human-readable report, one line per item.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Laser is {}",
            if self.laser_enabled { "enabled" } else { "disabled" }
        )?;
        writeln!(
            f,
            "External interlock is {}",
            if self.external_interlock {
                "DISCONNECTED"
            } else {
                "CONNECTED"
            }
        )?;
        writeln!(f, "Ready to fire: {}", self.ready_to_fire)?;
        writeln!(f, "Ready to enable: {}", self.ready_to_enable)?;

        let power = if self.low_power_mode {
            "LOW"
        } else if self.high_power_mode {
            "HIGH"
        } else {
            "MANUAL"
        };
        writeln!(f, "Laser is in {power} power mode")?;
        writeln!(
            f,
            "Laser is {}",
            if self.laser_active { "ACTIVE" } else { "not active" }
        )?;

        if self.power_failure {
            writeln!(f, "FAULT: power failure")?;
        }
        if self.resonator_over_temp {
            writeln!(f, "FAULT: resonator over temperature")?;
        }
        if self.electrical_over_temp {
            writeln!(f, "FAULT: electrical over temperature")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_is_identity_on_defined_bits() {
        for raw in 0..=u16::MAX {
            let masked = raw & DEFINED_MASK;
            assert_eq!(StatusWord::decode(masked).encode(), masked, "value {raw}");
        }
    }

    #[test]
    fn reserved_bits_are_ignored() {
        let status = StatusWord::decode(0xFFFF);
        assert_eq!(status.encode(), DEFINED_MASK);
        assert_eq!(StatusWord::decode(RESERVED_MASK), StatusWord::default());
    }

    #[test]
    fn known_device_values() {
        let fresh = StatusWord::decode(1024);
        assert!(fresh.ready_to_enable);
        assert!(!fresh.laser_enabled);

        let armed = StatusWord::decode(3073);
        assert!(armed.is_armed());
        assert!(!armed.laser_active);

        let firing = StatusWord::decode(3075);
        assert!(firing.laser_active);
        assert_eq!(firing.encode(), 3075);
    }

    #[test]
    fn parses_decimal_response() {
        let status: StatusWord = " 3073\r".parse().unwrap();
        assert_eq!(status.encode(), 3073);
        assert!("?8".parse::<StatusWord>().is_err());
        assert!("70000".parse::<StatusWord>().is_err());
    }

    #[test]
    fn report_mentions_faults() {
        let status = StatusWord {
            power_failure: true,
            high_power_mode: true,
            ..Default::default()
        };
        let report = status.to_string();
        assert!(report.contains("HIGH power mode"));
        assert!(report.contains("power failure"));
        assert!(status.has_fault());
    }
}
