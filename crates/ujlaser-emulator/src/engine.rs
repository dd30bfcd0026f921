//! Protocol engine: applies command frames to the register set.
//!
//! Every frame produces exactly one [`Response`]. The arming delay and the
//! fire duration are pending timers held by the engine; a timer is applied
//! the first time the engine is touched after its deadline, and when the
//! engine is shared through an [`crate::EmulatorHandle`] a watcher task also
//! applies it on time. Cancelling a timer drops it, which stops its watcher.

use parking_lot::Mutex;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ujlaser_core::config::LaserConfig;
use ujlaser_core::keywords::{self, KeywordKind};
use ujlaser_core::protocol::{self, CommandFrame, ErrorCode, Response};
use ujlaser_core::status::StatusWord;
use ujlaser_core::types::{format_float, Bounds, DiodeTrigger, EnergyMode, PulseMode};

use crate::faults::Fault;
use crate::registers::{ArmState, DeviceRegisters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Arming,
    Fire { shots: u64 },
}

#[derive(Debug)]
struct PendingTimer {
    kind: TimerKind,
    deadline: Instant,
    // Dropping the sender stops the watcher task.
    _cancel: oneshot::Sender<()>,
}

/// Register interpreter for one device address.
#[derive(Debug)]
pub struct ProtocolEngine {
    address: String,
    arming_delay: Duration,
    registers: DeviceRegisters,
    timer: Option<PendingTimer>,
    shared: Option<Weak<Mutex<ProtocolEngine>>>,
}

type Outcome = Result<Response, ErrorCode>;

impl ProtocolEngine {
    /// Fresh device at factory settings.
    pub fn new(config: &LaserConfig) -> Self {
        Self {
            address: config.device.address.clone(),
            arming_delay: config.timing.arming_delay,
            registers: DeviceRegisters::new(config.limits.clone()),
            timer: None,
            shared: None,
        }
    }

    /// Let timers re-enter the engine through `shared` when they expire.
    pub(crate) fn attach(&mut self, shared: Weak<Mutex<ProtocolEngine>>) {
        self.shared = Some(shared);
    }

    /// Address the engine answers to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Registers after applying any expired timer.
    pub fn registers(&mut self) -> &DeviceRegisters {
        self.advance();
        &self.registers
    }

    /// Current arm state, after applying any expired timer.
    pub fn state(&mut self) -> ArmState {
        self.advance();
        self.registers.state
    }

    /// Current status word, after applying any expired timer.
    pub fn status(&mut self) -> StatusWord {
        self.advance();
        self.registers.status()
    }

    /// Parse a raw frame and answer it. Malformed frames get their error code.
    pub fn handle_raw(&mut self, raw: &[u8]) -> Response {
        match protocol::parse_incoming(raw, &self.address) {
            Ok(frame) => self.handle(&frame),
            Err(err) => {
                warn!(code = %err.code(), error = %err, "rejected frame");
                Response::from(&err)
            }
        }
    }

    /// Apply one command frame.
    pub fn handle(&mut self, frame: &CommandFrame) -> Response {
        self.advance();

        if frame.address != self.address {
            warn!(address = %frame.address, "frame for another address");
            return Response::Error(ErrorCode::NotRecognized);
        }

        let outcome = if frame.query {
            self.query(&frame.keyword)
        } else {
            self.action(&frame.keyword, frame.argument.as_deref())
        };

        match outcome {
            Ok(response) => {
                debug!(keyword = %frame.keyword, query = frame.query, response = %response, "handled");
                response
            }
            Err(code) => {
                warn!(
                    keyword = %frame.keyword,
                    argument = ?frame.argument,
                    %code,
                    "command rejected"
                );
                Response::Error(code)
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    fn query(&self, keyword: &str) -> Outcome {
        let regs = &self.registers;
        let settings = regs.settings();
        let limits = &regs.limits;
        let telemetry = &regs.telemetry;

        let value = match keyword {
            keywords::BURST_COUNT => settings.burst_count.to_string(),
            keywords::DIODE_CURRENT => format_float(settings.diode_current),
            keywords::DIODE_CURRENT_MIN => format_float(limits.diode_current.min),
            keywords::DIODE_CURRENT_MAX => format_float(limits.diode_current.max),
            keywords::DIODE_TRIGGER => settings.diode_trigger.to_string(),
            keywords::PULSE_WIDTH => format_float(settings.pulse_width),
            keywords::PULSE_WIDTH_MIN => format_float(limits.pulse_width.min),
            keywords::PULSE_WIDTH_MAX => format_float(limits.pulse_width.max),
            keywords::ECHO => u8::from(settings.echo).to_string(),
            keywords::ENERGY_MODE => settings.energy_mode.to_string(),
            keywords::ENABLE => u8::from(regs.status().laser_enabled).to_string(),
            keywords::FIRE => u8::from(regs.state == ArmState::Firing).to_string(),
            keywords::PULSE_PERIOD => format_float(settings.pulse_period),
            keywords::PULSE_PERIOD_MIN => format_float(limits.pulse_period.min),
            keywords::PULSE_PERIOD_MAX => format_float(limits.pulse_period.max),
            keywords::PULSE_MODE => settings.pulse_mode.to_string(),
            keywords::RECALL => regs.recall_slot.to_string(),
            keywords::SAVE => regs.save_slot.to_string(),
            keywords::REP_RATE => format_float(settings.rep_rate),
            keywords::REP_RATE_MIN => format_float(limits.rep_rate.min),
            keywords::REP_RATE_MAX => format_float(limits.rep_rate.max),
            keywords::USER_SHOT_COUNT => regs.user_shots.to_string(),
            keywords::SYSTEM_SHOT_COUNT => regs.system_shots.to_string(),
            keywords::SYSTEM_STATUS => regs.status().encode().to_string(),
            keywords::BANK_VOLTAGE => format_float(telemetry.bank_voltage),
            keywords::FET_TEMP => format_float(telemetry.fet_temp),
            keywords::FET_TEMP_MAX => format_float(telemetry.fet_temp_max),
            keywords::FET_VOLTAGE => format_float(telemetry.fet_voltage),
            keywords::CURRENT_MEASUREMENT => format_float(telemetry.current_measurement),
            keywords::THERMISTOR => format_float(telemetry.thermistor),
            keywords::THERMISTOR_MIN => format_float(telemetry.thermistor_min),
            keywords::THERMISTOR_MAX => format_float(telemetry.thermistor_max),
            keywords::LATCHED_STATUS => telemetry.latched_status.to_string(),
            keywords::IDENTITY => telemetry.identity.clone(),
            _ => return Err(ErrorCode::NoQueryForm),
        };
        Ok(Response::Value(value))
    }

    // =========================================================================
    // Actions
    // =========================================================================

    fn action(&mut self, keyword: &str, argument: Option<&str>) -> Outcome {
        match keywords::lookup(keyword) {
            None => return Err(ErrorCode::NotRecognized),
            Some(KeywordKind::QueryOnly) => return Err(ErrorCode::QueryOnly),
            Some(KeywordKind::ActionOnly) => {
                if argument.is_some() {
                    return Err(ErrorCode::InvalidParameter);
                }
                self.reset();
                return Ok(Response::Ok);
            }
            Some(KeywordKind::Setting) => {}
        }

        let arg = argument.ok_or(ErrorCode::InvalidParameter)?;
        let limits = self.registers.limits.clone();

        match keyword {
            keywords::BURST_COUNT => {
                let count = parse_bounded(arg, &limits.burst_count)?;
                self.registers.update_settings(|s| s.burst_count = count);
            }
            keywords::DIODE_CURRENT => {
                let current = parse_bounded(arg, &limits.diode_current)?;
                self.registers.update_settings(|s| s.diode_current = current);
            }
            keywords::DIODE_TRIGGER => {
                let trigger = parse_enum::<DiodeTrigger>(arg)?;
                self.registers.update_settings(|s| s.diode_trigger = trigger);
            }
            keywords::PULSE_WIDTH => {
                let width = parse_bounded(arg, &limits.pulse_width)?;
                self.registers.update_settings(|s| s.pulse_width = width);
            }
            keywords::ECHO => {
                let echo = parse_flag(arg).ok_or(ErrorCode::InvalidParameter)?;
                self.registers.update_settings(|s| s.echo = echo);
            }
            keywords::ENERGY_MODE => {
                let mode = parse_enum::<EnergyMode>(arg)?;
                self.registers.set_energy_mode(mode);
            }
            keywords::ENABLE => match parse_flag(arg) {
                Some(true) => self.enable()?,
                Some(false) => self.disable(),
                None => return Err(ErrorCode::Unavailable),
            },
            keywords::FIRE => match parse_flag(arg) {
                Some(true) => self.fire()?,
                Some(false) => self.stop_fire(),
                None => return Err(ErrorCode::Unavailable),
            },
            keywords::PULSE_PERIOD => {
                let period = parse_bounded(arg, &limits.pulse_period)?;
                self.registers.update_settings(|s| s.pulse_period = period);
            }
            keywords::PULSE_MODE => {
                let mode = parse_enum::<PulseMode>(arg)?;
                self.registers.update_settings(|s| s.pulse_mode = mode);
            }
            keywords::RECALL => {
                let slot = parse_bounded(arg, &limits.settings_slot)?;
                if self.registers.recall(slot) {
                    info!(slot, "settings recalled");
                }
            }
            keywords::SAVE => {
                let slot = parse_bounded(arg, &limits.settings_slot)?;
                self.registers.save(slot);
                info!(slot, "settings saved");
            }
            keywords::REP_RATE => {
                let rate = parse_bounded(arg, &limits.rep_rate)?;
                self.registers.update_settings(|s| s.rep_rate = rate);
            }
            keywords::USER_SHOT_COUNT => {
                let count = arg
                    .parse::<i64>()
                    .map_err(|_| ErrorCode::InvalidParameter)?;
                self.registers.user_shots = count;
            }
            _ => return Err(ErrorCode::NotRecognized),
        }
        Ok(Response::Ok)
    }

    fn enable(&mut self) -> Result<(), ErrorCode> {
        if !self.registers.ready_to_enable() || self.registers.state != ArmState::Disarmed {
            return Err(ErrorCode::Unavailable);
        }
        self.registers.state = ArmState::Arming;
        self.start_timer(TimerKind::Arming, self.arming_delay);
        info!(delay = ?self.arming_delay, "arming");
        Ok(())
    }

    fn disable(&mut self) {
        self.timer = None;
        if self.registers.state != ArmState::Disarmed {
            info!(from = ?self.registers.state, "disarmed");
        }
        self.registers.state = ArmState::Disarmed;
    }

    fn fire(&mut self) -> Result<(), ErrorCode> {
        let settings = self.registers.settings();
        if self.registers.state != ArmState::Armed || !settings.energy_mode.permits_fire() {
            return Err(ErrorCode::Unavailable);
        }
        let duration = settings.fire_duration();
        let shots = settings.shots_per_fire();

        self.registers.state = ArmState::Firing;
        self.start_timer(TimerKind::Fire { shots }, duration);
        info!(?duration, shots, "firing");
        Ok(())
    }

    fn stop_fire(&mut self) {
        if self.registers.state == ArmState::Firing {
            self.timer = None;
            self.registers.state = ArmState::Armed;
            info!("fire stopped early");
        }
    }

    fn reset(&mut self) {
        self.timer = None;
        self.registers.reset();
        info!("factory reset");
    }

    // =========================================================================
    // Faults
    // =========================================================================

    /// Raise a fault. The device drops to Disarmed without counting shots.
    pub fn inject_fault(&mut self, fault: Fault) {
        self.advance();
        if self.registers.faults.raise(fault) {
            warn!(%fault, "fault injected");
        }
        self.timer = None;
        self.registers.state = ArmState::Disarmed;
    }

    /// Lower a fault. Ready-to-enable returns once no fault remains.
    pub fn clear_fault(&mut self, fault: Fault) {
        self.advance();
        if self.registers.faults.clear(fault) {
            info!(%fault, "fault cleared");
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn start_timer(&mut self, kind: TimerKind, duration: Duration) {
        let deadline = Instant::now() + duration;
        let (cancel, cancelled) = oneshot::channel::<()>();

        if let (Some(shared), Ok(runtime)) =
            (self.shared.clone(), tokio::runtime::Handle::try_current())
        {
            runtime.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        if let Some(engine) = shared.upgrade() {
                            engine.lock().advance();
                        }
                    }
                    _ = cancelled => {}
                }
            });
        }

        self.timer = Some(PendingTimer {
            kind,
            deadline,
            _cancel: cancel,
        });
    }

    /// Apply the pending timer if its deadline has passed.
    pub fn advance(&mut self) {
        let expired = matches!(&self.timer, Some(timer) if Instant::now() >= timer.deadline);
        if !expired {
            return;
        }
        let Some(timer) = self.timer.take() else {
            return;
        };

        match timer.kind {
            TimerKind::Arming => {
                self.registers.state = ArmState::Armed;
                info!("armed, ready to fire");
            }
            TimerKind::Fire { shots } => {
                self.registers.state = ArmState::Armed;
                self.registers.record_shots(shots);
                info!(shots, total = self.registers.system_shots, "fire complete");
            }
        }
    }

    /// Time left on the pending timer, if any.
    pub fn timer_remaining(&self) -> Option<Duration> {
        self.timer
            .as_ref()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }
}

fn parse_bounded<T>(arg: &str, bounds: &Bounds<T>) -> Result<T, ErrorCode>
where
    T: std::str::FromStr + PartialOrd + Copy,
{
    let value = arg.parse::<T>().map_err(|_| ErrorCode::InvalidParameter)?;
    if bounds.contains(value) {
        Ok(value)
    } else {
        Err(ErrorCode::InvalidParameter)
    }
}

fn parse_enum<T: TryFrom<i64>>(arg: &str) -> Result<T, ErrorCode> {
    arg.parse::<i64>()
        .ok()
        .and_then(|n| T::try_from(n).ok())
        .ok_or(ErrorCode::InvalidParameter)
}

fn parse_flag(arg: &str) -> Option<bool> {
    match arg.parse::<i64>().ok()? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(&LaserConfig::default())
    }

    fn send(engine: &mut ProtocolEngine, line: &str) -> String {
        engine.handle_raw(format!("{line}\r").as_bytes()).to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn arming_completes_after_delay() {
        let mut e = engine();
        assert_eq!(send(&mut e, ";LA:SS?"), "1024");
        assert_eq!(send(&mut e, ";LA:EN 1"), "OK");
        assert_eq!(e.state(), ArmState::Arming);
        assert_eq!(send(&mut e, ";LA:SS?"), "1024");

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(send(&mut e, ";LA:SS?"), "3073");
        assert_eq!(send(&mut e, ";LA:EN?"), "1");
    }

    #[tokio::test(start_paused = true)]
    async fn enable_while_arming_or_armed_is_unavailable() {
        let mut e = engine();
        send(&mut e, ";LA:EN 1");
        assert_eq!(send(&mut e, ";LA:EN 1"), "?8");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(send(&mut e, ";LA:EN 1"), "?8");
        assert_eq!(e.state(), ArmState::Armed);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_cancels_arming() {
        let mut e = engine();
        send(&mut e, ";LA:EN 1");
        assert_eq!(send(&mut e, ";LA:EN 0"), "OK");
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(send(&mut e, ";LA:SS?"), "1024");
    }

    #[tokio::test(start_paused = true)]
    async fn fire_counts_shots_on_completion() {
        let mut e = engine();
        send(&mut e, ";LA:EN 1");
        tokio::time::advance(Duration::from_secs(8)).await;

        assert_eq!(send(&mut e, ";LA:PM 2"), "OK");
        assert_eq!(send(&mut e, ";LA:BC 4"), "OK");
        assert_eq!(send(&mut e, ";LA:RR 2"), "OK");
        assert_eq!(send(&mut e, ";LA:FL 1"), "OK");
        assert_eq!(send(&mut e, ";LA:FL?"), "1");
        assert_eq!(e.timer_remaining(), Some(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(send(&mut e, ";LA:SS?"), "3073");
        assert_eq!(send(&mut e, ";LA:SC?"), "4");
        assert_eq!(send(&mut e, ";LA:UC?"), "4");
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_fire_counts_nothing() {
        let mut e = engine();
        send(&mut e, ";LA:EN 1");
        tokio::time::advance(Duration::from_secs(8)).await;
        send(&mut e, ";LA:FL 1");
        assert_eq!(send(&mut e, ";LA:FL 0"), "OK");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(send(&mut e, ";LA:SS?"), "3073");
        assert_eq!(send(&mut e, ";LA:SC?"), "0");
    }

    #[tokio::test(start_paused = true)]
    async fn low_energy_mode_blocks_fire() {
        let mut e = engine();
        send(&mut e, ";LA:EN 1");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(send(&mut e, ";LA:EM 1"), "OK");
        assert_eq!(send(&mut e, ";LA:FL 1"), "?8");
        assert_eq!(send(&mut e, ";LA:EM 2"), "OK");
        assert_eq!(send(&mut e, ";LA:SS?"), (3073 + 8192).to_string());
        assert_eq!(send(&mut e, ";LA:FL 1"), "OK");
    }

    #[tokio::test]
    async fn range_checks_reject_with_invalid_parameter() {
        let mut e = engine();
        assert_eq!(send(&mut e, ";LA:BC 0"), "?5");
        assert_eq!(send(&mut e, ";LA:BC 65535"), "OK");
        assert_eq!(send(&mut e, ";LA:DC 141"), "?5");
        assert_eq!(send(&mut e, ";LA:DW 0.00001"), "OK");
        assert_eq!(send(&mut e, ";LA:DT 2"), "?5");
        assert_eq!(send(&mut e, ";LA:EC x"), "?5");
        assert_eq!(send(&mut e, ";LA:EM 3"), "?5");
        assert_eq!(send(&mut e, ";LA:PE 10.5"), "?5");
        assert_eq!(send(&mut e, ";LA:RR 0.5"), "?5");
        assert_eq!(send(&mut e, ";LA:RC 7"), "?5");
        assert_eq!(send(&mut e, ";LA:UC -3"), "OK");
        assert_eq!(send(&mut e, ";LA:UC?"), "-3");
        assert_eq!(send(&mut e, ";LA:RS 1"), "?5");
    }

    #[test]
    fn fault_forces_disarm_and_blocks_enable() {
        let mut e = engine();
        e.inject_fault(Fault::PowerFailure);
        assert_eq!(e.status().encode(), 1 << 9);
        assert_eq!(send(&mut e, ";LA:EN 1"), "?8");

        e.clear_fault(Fault::PowerFailure);
        assert_eq!(e.status().encode(), 1024);
    }

    #[test]
    fn telemetry_queries() {
        let mut e = engine();
        assert_eq!(send(&mut e, ";LA:ID?"), "QC,MicroJewel,00101,1.0-0.0.0.8");
        assert_eq!(send(&mut e, ";LA:FT:MAX?"), "125");
        assert_eq!(send(&mut e, ";LA:IM?"), "0.258");
        assert_eq!(send(&mut e, ";LA:RR:MAX?"), "5");
        assert_eq!(send(&mut e, ";LA:RS?"), "?7");
        assert_eq!(send(&mut e, ";LA:XX?"), "?7");
    }
}
