//! Authoritative register set of the emulated device.

use std::collections::BTreeMap;

use ujlaser_core::status::StatusWord;
use ujlaser_core::types::{DEVICE_IDENTITY, DeviceLimits, DiodeTrigger, EnergyMode, LaserSettings};

use crate::faults::FaultSet;

/// Arm/fire state of the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArmState {
    /// Laser off.
    #[default]
    Disarmed,
    /// `EN 1` accepted, arming delay running.
    Arming,
    /// Enabled and ready to fire.
    Armed,
    /// Fire sequence running.
    Firing,
}

/// Read-only measurement registers.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// `BV`, volts
    pub bank_voltage: f64,
    /// `FT`, degrees C
    pub fet_temp: f64,
    /// `FT:MAX`
    pub fet_temp_max: f64,
    /// `FV`, volts
    pub fet_voltage: f64,
    /// `IM`, amperes
    pub current_measurement: f64,
    /// `TR`, degrees C
    pub thermistor: f64,
    /// `TR:MIN`
    pub thermistor_min: f64,
    /// `TR:MAX`
    pub thermistor_max: f64,
    /// `LS`
    pub latched_status: u16,
    /// `ID`
    pub identity: String,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            bank_voltage: 0.0,
            fet_temp: 35.0,
            fet_temp_max: 125.0,
            fet_voltage: 0.0,
            current_measurement: 0.258,
            thermistor: 25.0,
            thermistor_min: 15.0,
            thermistor_max: 50.0,
            latched_status: 0,
            identity: DEVICE_IDENTITY.to_string(),
        }
    }
}

/// Low/high power status bits. Written only by [`DeviceRegisters::set_energy_mode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PowerFlags {
    low: bool,
    high: bool,
}

/// The full register set.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRegisters {
    settings: LaserSettings,
    power: PowerFlags,
    /// Ranges the setters accept.
    pub limits: DeviceLimits,
    /// Arm/fire state.
    pub state: ArmState,
    /// Slot last recalled (`RC?`).
    pub recall_slot: u8,
    /// Slot last saved (`SV?`).
    pub save_slot: u8,
    saved: BTreeMap<u8, LaserSettings>,
    /// Lifetime shots, kept across `RS`.
    pub system_shots: u64,
    pub user_shots: i64,
    /// Raised faults.
    pub faults: FaultSet,
    /// Read-only measurements.
    pub telemetry: Telemetry,
}

impl DeviceRegisters {
    /// Factory-fresh registers.
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            settings: LaserSettings::default(),
            power: PowerFlags::default(),
            limits,
            state: ArmState::Disarmed,
            recall_slot: 1,
            save_slot: 1,
            saved: BTreeMap::new(),
            system_shots: 0,
            user_shots: 0,
            faults: FaultSet::default(),
            telemetry: Telemetry::default(),
        }
    }

    /// Current parameter registers.
    pub fn settings(&self) -> &LaserSettings {
        &self.settings
    }

    /// Mutable access to every setting except the energy mode.
    pub fn update_settings(&mut self, f: impl FnOnce(&mut LaserSettings)) {
        let mode = self.settings.energy_mode;
        f(&mut self.settings);
        self.settings.energy_mode = mode;
    }

    /// The single transition for the energy mode and its power status bits.
    pub fn set_energy_mode(&mut self, mode: EnergyMode) {
        self.settings.energy_mode = mode;
        self.power = match mode {
            EnergyMode::Manual => PowerFlags::default(),
            EnergyMode::Low => PowerFlags {
                low: true,
                high: false,
            },
            EnergyMode::High => PowerFlags {
                low: false,
                high: true,
            },
        };
    }

    /// Store the parameter registers in `slot`.
    pub fn save(&mut self, slot: u8) {
        self.saved.insert(slot, self.settings.clone());
        self.save_slot = slot;
    }

    /// Restore `slot` if it was saved. Returns whether anything was restored.
    pub fn recall(&mut self, slot: u8) -> bool {
        self.recall_slot = slot;
        match self.saved.get(&slot).cloned() {
            Some(stored) => {
                let mode = stored.energy_mode;
                self.update_settings(|settings| *settings = stored);
                self.set_energy_mode(mode);
                true
            }
            None => false,
        }
    }

    /// Factory reset. Keeps the lifetime shot count, saved slots, raised
    /// faults and telemetry.
    pub fn reset(&mut self) {
        self.settings = LaserSettings::default();
        self.set_energy_mode(self.settings.energy_mode);
        self.state = ArmState::Disarmed;
        self.recall_slot = 1;
        self.save_slot = 1;
        self.user_shots = 0;
    }

    /// Count a completed fire sequence.
    pub fn record_shots(&mut self, shots: u64) {
        self.system_shots = self.system_shots.saturating_add(shots);
        self.user_shots = self
            .user_shots
            .saturating_add(i64::try_from(shots).unwrap_or(i64::MAX));
    }

    /// No fault is raised.
    pub fn ready_to_enable(&self) -> bool {
        !self.faults.any()
    }

    /// Status word assembled from the live registers.
    pub fn status(&self) -> StatusWord {
        let enabled = matches!(self.state, ArmState::Armed | ArmState::Firing);
        StatusWord {
            laser_enabled: enabled,
            laser_active: self.state == ArmState::Firing,
            diode_external_trigger: self.settings.diode_trigger == DiodeTrigger::External,
            external_interlock: self.faults.external_interlock,
            resonator_over_temp: self.faults.resonator_over_temp,
            electrical_over_temp: self.faults.electrical_over_temp,
            power_failure: self.faults.power_failure,
            ready_to_enable: self.ready_to_enable(),
            ready_to_fire: enabled,
            low_power_mode: self.power.low,
            high_power_mode: self.power.high,
        }
    }
}

impl Default for DeviceRegisters {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faults::Fault;
    use ujlaser_core::types::PulseMode;

    #[test]
    fn fresh_registers_report_ready_to_enable_only() {
        let regs = DeviceRegisters::default();
        assert_eq!(regs.status().encode(), 1024);
    }

    #[test]
    fn energy_mode_drives_power_bits() {
        let mut regs = DeviceRegisters::default();
        regs.set_energy_mode(EnergyMode::Low);
        assert!(regs.status().low_power_mode);
        assert!(!regs.status().high_power_mode);

        regs.set_energy_mode(EnergyMode::High);
        assert!(!regs.status().low_power_mode);
        assert!(regs.status().high_power_mode);

        regs.set_energy_mode(EnergyMode::Manual);
        assert_eq!(regs.status().encode(), 1024);
    }

    #[test]
    fn update_settings_cannot_touch_energy_mode() {
        let mut regs = DeviceRegisters::default();
        regs.update_settings(|s| {
            s.energy_mode = EnergyMode::High;
            s.burst_count = 3;
        });
        assert_eq!(regs.settings().energy_mode, EnergyMode::Manual);
        assert_eq!(regs.settings().burst_count, 3);
        assert!(!regs.status().high_power_mode);
    }

    #[test]
    fn recall_restores_saved_slot_through_energy_transition() {
        let mut regs = DeviceRegisters::default();
        regs.set_energy_mode(EnergyMode::Low);
        regs.update_settings(|s| s.pulse_mode = PulseMode::Burst);
        regs.save(3);

        regs.reset();
        assert_eq!(regs.settings().pulse_mode, PulseMode::Continuous);
        assert!(!regs.status().low_power_mode);

        assert!(regs.recall(3));
        assert_eq!(regs.settings().pulse_mode, PulseMode::Burst);
        assert!(regs.status().low_power_mode);
        assert_eq!(regs.recall_slot, 3);
        assert!(!regs.recall(5));
    }

    #[test]
    fn reset_keeps_lifetime_count() {
        let mut regs = DeviceRegisters::default();
        regs.record_shots(7);
        regs.reset();
        assert_eq!(regs.system_shots, 7);
        assert_eq!(regs.user_shots, 0);
    }

    #[test]
    fn faults_clear_ready_to_enable() {
        let mut regs = DeviceRegisters::default();
        regs.faults.raise(Fault::ExternalInterlock);
        let status = regs.status();
        assert!(status.external_interlock);
        assert!(!status.ready_to_enable);
    }
}
