//! Keyword catalog shared by the command codec, the emulator and the driver.

/// How a keyword may be used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordKind {
    /// Queryable, and settable with exactly one argument.
    Setting,
    /// Only valid with a trailing `?`.
    QueryOnly,
    /// Only valid without an argument and without `?`.
    ActionOnly,
}

/// Burst count.
pub const BURST_COUNT: &str = "BC";
/// Bank voltage.
pub const BANK_VOLTAGE: &str = "BV";
/// Diode current.
pub const DIODE_CURRENT: &str = "DC";
/// Diode current lower bound.
pub const DIODE_CURRENT_MIN: &str = "DC:MIN";
/// Diode current upper bound.
pub const DIODE_CURRENT_MAX: &str = "DC:MAX";
/// Diode trigger source.
pub const DIODE_TRIGGER: &str = "DT";
/// Diode pulse width.
pub const PULSE_WIDTH: &str = "DW";
/// Diode pulse width lower bound.
pub const PULSE_WIDTH_MIN: &str = "DW:MIN";
/// Diode pulse width upper bound.
pub const PULSE_WIDTH_MAX: &str = "DW:MAX";
/// Echo flag.
pub const ECHO: &str = "EC";
/// Energy mode.
pub const ENERGY_MODE: &str = "EM";
/// Enable (arm).
pub const ENABLE: &str = "EN";
/// Fire.
pub const FIRE: &str = "FL";
/// FET temperature.
pub const FET_TEMP: &str = "FT";
/// FET temperature limit.
pub const FET_TEMP_MAX: &str = "FT:MAX";
/// FET voltage.
pub const FET_VOLTAGE: &str = "FV";
/// Identification string.
pub const IDENTITY: &str = "ID";
/// Diode current measurement.
pub const CURRENT_MEASUREMENT: &str = "IM";
/// Latched status.
pub const LATCHED_STATUS: &str = "LS";
/// Pulse period.
pub const PULSE_PERIOD: &str = "PE";
/// Pulse period lower bound.
pub const PULSE_PERIOD_MIN: &str = "PE:MIN";
/// Pulse period upper bound.
pub const PULSE_PERIOD_MAX: &str = "PE:MAX";
/// Pulse mode.
pub const PULSE_MODE: &str = "PM";
/// Recall settings slot.
pub const RECALL: &str = "RC";
/// Repetition rate.
pub const REP_RATE: &str = "RR";
/// Repetition rate lower bound.
pub const REP_RATE_MIN: &str = "RR:MIN";
/// Repetition rate upper bound.
pub const REP_RATE_MAX: &str = "RR:MAX";
/// Reset to factory defaults.
pub const RESET: &str = "RS";
/// System (lifetime) shot count.
pub const SYSTEM_SHOT_COUNT: &str = "SC";
/// System status word.
pub const SYSTEM_STATUS: &str = "SS";
/// Save settings slot.
pub const SAVE: &str = "SV";
/// Resonator thermistor temperature.
pub const THERMISTOR: &str = "TR";
/// Resonator temperature lower bound.
pub const THERMISTOR_MIN: &str = "TR:MIN";
/// Resonator temperature upper bound.
pub const THERMISTOR_MAX: &str = "TR:MAX";
/// User shot count.
pub const USER_SHOT_COUNT: &str = "UC";

const CATALOG: &[(&str, KeywordKind)] = &[
    (BURST_COUNT, KeywordKind::Setting),
    (BANK_VOLTAGE, KeywordKind::QueryOnly),
    (DIODE_CURRENT, KeywordKind::Setting),
    (DIODE_CURRENT_MIN, KeywordKind::QueryOnly),
    (DIODE_CURRENT_MAX, KeywordKind::QueryOnly),
    (DIODE_TRIGGER, KeywordKind::Setting),
    (PULSE_WIDTH, KeywordKind::Setting),
    (PULSE_WIDTH_MIN, KeywordKind::QueryOnly),
    (PULSE_WIDTH_MAX, KeywordKind::QueryOnly),
    (ECHO, KeywordKind::Setting),
    (ENERGY_MODE, KeywordKind::Setting),
    (ENABLE, KeywordKind::Setting),
    (FIRE, KeywordKind::Setting),
    (FET_TEMP, KeywordKind::QueryOnly),
    (FET_TEMP_MAX, KeywordKind::QueryOnly),
    (FET_VOLTAGE, KeywordKind::QueryOnly),
    (IDENTITY, KeywordKind::QueryOnly),
    (CURRENT_MEASUREMENT, KeywordKind::QueryOnly),
    (LATCHED_STATUS, KeywordKind::QueryOnly),
    (PULSE_PERIOD, KeywordKind::Setting),
    (PULSE_PERIOD_MIN, KeywordKind::QueryOnly),
    (PULSE_PERIOD_MAX, KeywordKind::QueryOnly),
    (PULSE_MODE, KeywordKind::Setting),
    (RECALL, KeywordKind::Setting),
    (REP_RATE, KeywordKind::Setting),
    (REP_RATE_MIN, KeywordKind::QueryOnly),
    (REP_RATE_MAX, KeywordKind::QueryOnly),
    (RESET, KeywordKind::ActionOnly),
    (SYSTEM_SHOT_COUNT, KeywordKind::QueryOnly),
    (SYSTEM_STATUS, KeywordKind::QueryOnly),
    (SAVE, KeywordKind::Setting),
    (THERMISTOR, KeywordKind::QueryOnly),
    (THERMISTOR_MIN, KeywordKind::QueryOnly),
    (THERMISTOR_MAX, KeywordKind::QueryOnly),
    (USER_SHOT_COUNT, KeywordKind::Setting),
];

/// Look up a keyword. Keywords are case-sensitive.
pub fn lookup(keyword: &str) -> Option<KeywordKind> {
    CATALOG
        .iter()
        .find(|(name, _)| *name == keyword)
        .map(|(_, kind)| *kind)
}

/// Every known keyword with its kind.
pub fn all() -> impl Iterator<Item = (&'static str, KeywordKind)> {
    CATALOG.iter().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_sensitive() {
        assert_eq!(lookup("SS"), Some(KeywordKind::QueryOnly));
        assert_eq!(lookup("ss"), None);
        assert_eq!(lookup("RS"), Some(KeywordKind::ActionOnly));
        assert_eq!(lookup("DC:MIN"), Some(KeywordKind::QueryOnly));
    }

    #[test]
    fn catalog_has_no_duplicates() {
        let mut names: Vec<_> = all().map(|(name, _)| name).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }
}
