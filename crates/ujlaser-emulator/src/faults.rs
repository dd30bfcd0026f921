//! Fault injection for the emulated device.
//!
//! Each fault raises its status bit. While any fault is present the device
//! reports ready-to-enable clear and refuses `EN 1`.

use std::fmt;

/// Injectable hardware fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// External interlock opened
    ExternalInterlock,
    /// Resonator over-temperature
    ResonatorOverTemp,
    /// Electrical over-temperature
    ElectricalOverTemp,
    /// Power failure
    PowerFailure,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Fault::ExternalInterlock => "external interlock",
            Fault::ResonatorOverTemp => "resonator over-temperature",
            Fault::ElectricalOverTemp => "electrical over-temperature",
            Fault::PowerFailure => "power failure",
        };
        write!(f, "{}", label)
    }
}

/// Currently raised faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultSet {
    /// External interlock open.
    pub external_interlock: bool,
    /// Resonator over temperature.
    pub resonator_over_temp: bool,
    /// Electrical over temperature.
    pub electrical_over_temp: bool,
    /// Power failure.
    pub power_failure: bool,
}

impl FaultSet {
    fn slot(&mut self, fault: Fault) -> &mut bool {
        match fault {
            Fault::ExternalInterlock => &mut self.external_interlock,
            Fault::ResonatorOverTemp => &mut self.resonator_over_temp,
            Fault::ElectricalOverTemp => &mut self.electrical_over_temp,
            Fault::PowerFailure => &mut self.power_failure,
        }
    }

    /// Raise a fault. Returns false if it was already raised.
    pub fn raise(&mut self, fault: Fault) -> bool {
        !std::mem::replace(self.slot(fault), true)
    }

    /// Clear a fault. Returns false if it was not raised.
    pub fn clear(&mut self, fault: Fault) -> bool {
        std::mem::replace(self.slot(fault), false)
    }

    /// True when any fault is raised.
    pub fn any(&self) -> bool {
        self.external_interlock
            || self.resonator_over_temp
            || self.electrical_over_temp
            || self.power_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_clear_report_changes() {
        let mut faults = FaultSet::default();
        assert!(!faults.any());
        assert!(faults.raise(Fault::PowerFailure));
        assert!(!faults.raise(Fault::PowerFailure));
        assert!(faults.any());
        assert!(faults.clear(Fault::PowerFailure));
        assert!(!faults.clear(Fault::PowerFailure));
        assert!(!faults.any());
    }
}
