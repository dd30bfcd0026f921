//! Device controller for the MicroJewel laser engine.
//!
//! All traffic goes through one shared transport. Every exchange (write one
//! command frame, read one response) holds the transport lock for its whole
//! duration, so frames from the caller, the fire task and the kicker never
//! interleave on the wire.
//!
//! # Arm/fire sequence
//!
//! ```text
//! Disarmed --arm()--> Arming --(device delay)--> Armed --fire()--> Firing
//!     ^                                            ^                  |
//!     |                                            +---(duration)-----+
//!     +------------- disarm() / emergency_stop() from any state
//! ```
//!
//! Transitions are taken from the device's own status word; the controller
//! never assumes one locally.
//!
//! # Mirrored settings
//!
//! Setters validate against the configured [`DeviceLimits`] before touching
//! the wire and update the local mirror only after the device answers `OK`.
//! `fire()` re-reads the timing registers before it computes the sequence
//! duration, so a change made behind the mirror never shortens a fire.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use ujlaser_core::config::LaserConfig;
use ujlaser_core::error::{LaserError, LaserResult};
use ujlaser_core::keywords;
use ujlaser_core::limits::DRAIN_TIMEOUT;
use ujlaser_core::protocol::{self, Response};
use ujlaser_core::serial::{self, SerialTransport, SharedTransport, Transport};
use ujlaser_core::status::StatusWord;
use ujlaser_core::types::{
    format_float, Bounds, DeviceLimits, DiodeTrigger, EnergyMode, LaserSettings, PulseMode,
    IDENTITY_MARKER,
};

use crate::fire::{self, FaultLog, FireFault, FireOutcome};
use crate::kicker::Kicker;

/// Responses are read up to the carriage return; a trailing `\n` is stripped
/// from the front of the next one.
const RESPONSE_END: u8 = b'\r';

type FireTask = JoinHandle<Result<FireOutcome, FireFault>>;

/// State shared between the controller and its background tasks.
pub(crate) struct ControllerInner {
    transport: SharedTransport,
    pub(crate) config: LaserConfig,
    settings: Mutex<LaserSettings>,
    /// Set by `emergency_stop()`/`disarm()`; an inactive laser is then expected.
    pub(crate) stop_requested: AtomicBool,
    /// Claimed by `fire()`, released when the fire task ends.
    firing: AtomicBool,
    /// A response went missing; drain stale bytes before the next exchange.
    needs_drain: AtomicBool,
    fire_task: Mutex<Option<FireTask>>,
    kicker: Mutex<Option<Kicker>>,
    pub(crate) last_kicker_status: Mutex<Option<StatusWord>>,
    faults: FaultLog,
}

impl ControllerInner {
    /// Send one frame and read its response. `None` means the read timed out.
    async fn exchange(&self, frame: &[u8], command: &str) -> LaserResult<Option<Response>> {
        let mut transport = self.transport.lock().await;
        if !transport.is_open() {
            return Err(LaserError::NotConnected);
        }
        if self.needs_drain.swap(false, Ordering::SeqCst) {
            transport.discard_pending(DRAIN_TIMEOUT).await;
        }

        transport.write(frame).await?;

        let deadline = Instant::now() + self.config.serial.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = transport.read_until(RESPONSE_END, remaining).await? else {
                self.needs_drain.store(true, Ordering::SeqCst);
                warn!(command, "no response");
                return Ok(None);
            };
            let response = protocol::parse_response(&line)?;
            if matches!(&response, Response::Value(v) if v.is_empty()) {
                continue;
            }
            debug!(command, %response, "exchange");
            return Ok(Some(response));
        }
    }

    /// `<keyword>?` returning the bare value.
    pub(crate) async fn query(&self, keyword: &str) -> LaserResult<String> {
        let frame = protocol::encode_query(&self.config.device.address, keyword)?;
        let command = format!("{keyword}?");
        match self.exchange(&frame, &command).await? {
            Some(Response::Value(value)) => Ok(value),
            Some(Response::Error(code)) => Err(LaserError::DeviceRejected {
                keyword: keyword.to_string(),
                code,
            }),
            Some(Response::Ok) => Err(LaserError::UnexpectedResponse {
                command,
                response: "OK".to_string(),
            }),
            None => Err(LaserError::NoResponse { command }),
        }
    }

    /// Action command expecting `OK`.
    pub(crate) async fn command(&self, keyword: &str, argument: Option<&str>) -> LaserResult<()> {
        let frame = protocol::encode_command(&self.config.device.address, keyword, argument)?;
        let command = match argument {
            Some(arg) => format!("{keyword} {arg}"),
            None => keyword.to_string(),
        };
        match self.exchange(&frame, &command).await? {
            Some(Response::Ok) => Ok(()),
            Some(Response::Error(code)) => {
                warn!(keyword, %code, reason = code.description(), "command rejected");
                Err(LaserError::DeviceRejected {
                    keyword: keyword.to_string(),
                    code,
                })
            }
            Some(Response::Value(response)) => {
                Err(LaserError::UnexpectedResponse { command, response })
            }
            None => Err(LaserError::NoResponse { command }),
        }
    }

    pub(crate) async fn query_status(&self) -> LaserResult<StatusWord> {
        let value = self.query(keywords::SYSTEM_STATUS).await?;
        value
            .parse::<StatusWord>()
            .map_err(|_| LaserError::UnexpectedResponse {
                command: "SS?".to_string(),
                response: value,
            })
    }

    fn stop_kicker(&self) {
        if let Some(kicker) = self.kicker.lock().take() {
            kicker.stop();
        }
    }
}

fn parse_value<T: FromStr>(keyword: &str, value: String) -> LaserResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| LaserError::UnexpectedResponse {
            command: format!("{keyword}?"),
            response: value,
        })
}

fn parse_wire_enum<T: TryFrom<i64>>(keyword: &str, value: String) -> LaserResult<T> {
    let raw: i64 = parse_value(keyword, value.clone())?;
    T::try_from(raw).map_err(|_| LaserError::UnexpectedResponse {
        command: format!("{keyword}?"),
        response: value,
    })
}

fn parse_flag(keyword: &str, value: String) -> LaserResult<bool> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(LaserError::UnexpectedResponse {
            command: format!("{keyword}?"),
            response: value,
        }),
    }
}

fn check_range<T>(keyword: &'static str, value: T, bounds: &Bounds<T>) -> LaserResult<()>
where
    T: PartialOrd + Copy + Display,
{
    if bounds.contains(value) {
        Ok(())
    } else {
        Err(LaserError::InvalidArgument {
            keyword,
            value: value.to_string(),
            bound: bounds.to_string(),
        })
    }
}

/// Driver for the MicroJewel laser engine.
pub struct LaserController {
    inner: Arc<ControllerInner>,
}

impl LaserController {
    /// Build a controller over an already-open transport.
    ///
    /// The mirrored settings start at the factory defaults; call
    /// [`LaserController::refresh_settings`] to read them from the device.
    pub fn new(transport: Box<dyn Transport>, config: LaserConfig) -> LaserResult<Self> {
        config.validate().map_err(LaserError::Configuration)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                transport: serial::wrap_shared(transport),
                config,
                settings: Mutex::new(LaserSettings::default()),
                stop_requested: AtomicBool::new(false),
                firing: AtomicBool::new(false),
                needs_drain: AtomicBool::new(false),
                fire_task: Mutex::new(None),
                kicker: Mutex::new(None),
                last_kicker_status: Mutex::new(None),
                faults: FaultLog::new(),
            }),
        })
    }

    /// Open the configured serial port and validate the device identity.
    ///
    /// # Errors
    /// Returns error if:
    /// - No port is configured
    /// - The serial port cannot be opened
    /// - The device doesn't answer `ID?` with a MicroJewel identity
    pub async fn connect(config: &LaserConfig) -> LaserResult<Self> {
        let port_path = config.serial.port.as_deref().ok_or_else(|| {
            LaserError::Configuration("serial.port is not set".to_string())
        })?;
        let port =
            serial::open_serial_async(port_path, config.serial.baud_rate, "MicroJewel").await?;
        let controller = Self::new(Box::new(SerialTransport::new(Box::new(port))), config.clone())?;

        let identity = controller.identity().await?;
        if !identity.contains(IDENTITY_MARKER) {
            return Err(LaserError::UnexpectedResponse {
                command: "ID?".to_string(),
                response: identity,
            });
        }
        info!(%identity, port = port_path, "MicroJewel laser validated");

        controller.refresh_settings().await?;
        Ok(controller)
    }

    /// Configuration the controller was built with.
    pub fn config(&self) -> &LaserConfig {
        &self.inner.config
    }

    fn limits(&self) -> &DeviceLimits {
        &self.inner.config.limits
    }

    /// Local mirror of the device settings.
    pub fn settings(&self) -> LaserSettings {
        self.inner.settings.lock().clone()
    }

    /// Whether the transport is still open.
    pub async fn is_open(&self) -> bool {
        self.inner.transport.lock().await.is_open()
    }

    /// Stop background tasks and close the transport.
    pub async fn close(&self) -> LaserResult<()> {
        self.inner.stop_kicker();
        if let Some(task) = self.inner.fire_task.lock().take() {
            task.abort();
            self.inner.firing.store(false, Ordering::SeqCst);
        }
        self.inner.transport.lock().await.close().await?;
        Ok(())
    }

    /// Send a raw command such as `SS?` or `BC 5`. Returns `None` on timeout.
    #[instrument(skip(self), err)]
    pub async fn send_raw(&self, command: &str) -> LaserResult<Option<String>> {
        let address = &self.inner.config.device.address;
        let command = command.trim();
        let frame: Bytes = match command.strip_suffix('?') {
            Some(keyword) => protocol::encode_query(address, keyword)?,
            None => match command.split_once(char::is_whitespace) {
                Some((keyword, arg)) => protocol::encode_command(address, keyword, Some(arg.trim()))?,
                None => protocol::encode_command(address, command, None)?,
            },
        };
        let response = self.inner.exchange(&frame, command).await?;
        Ok(response.map(|r| r.to_string()))
    }

    // =========================================================================
    // Status and telemetry
    // =========================================================================

    /// Query and decode the status word (`SS?`).
    #[instrument(skip(self), err)]
    pub async fn get_status(&self) -> LaserResult<StatusWord> {
        self.inner.query_status().await
    }

    /// Enabled and ready to fire.
    pub async fn is_armed(&self) -> LaserResult<bool> {
        Ok(self.get_status().await?.is_armed())
    }

    /// Identity string (`ID?`).
    pub async fn identity(&self) -> LaserResult<String> {
        self.inner.query(keywords::IDENTITY).await
    }

    /// Latched status word (`LS?`).
    pub async fn latched_status(&self) -> LaserResult<u16> {
        let value = self.inner.query(keywords::LATCHED_STATUS).await?;
        parse_value(keywords::LATCHED_STATUS, value)
    }

    /// Bank voltage in volts.
    pub async fn bank_voltage(&self) -> LaserResult<f64> {
        self.query_value(keywords::BANK_VOLTAGE).await
    }

    /// FET temperature in degrees C.
    pub async fn fet_temperature(&self) -> LaserResult<f64> {
        self.query_value(keywords::FET_TEMP).await
    }

    /// Highest FET temperature seen, degrees C.
    pub async fn fet_temperature_max(&self) -> LaserResult<f64> {
        self.query_value(keywords::FET_TEMP_MAX).await
    }

    /// FET voltage in volts.
    pub async fn fet_voltage(&self) -> LaserResult<f64> {
        self.query_value(keywords::FET_VOLTAGE).await
    }

    /// Measured diode current in amperes.
    pub async fn diode_current_measurement(&self) -> LaserResult<f64> {
        self.query_value(keywords::CURRENT_MEASUREMENT).await
    }

    /// Resonator temperature in degrees C.
    pub async fn resonator_temperature(&self) -> LaserResult<f64> {
        self.query_value(keywords::THERMISTOR).await
    }

    /// Allowed resonator temperature range.
    pub async fn resonator_temperature_range(&self) -> LaserResult<Bounds<f64>> {
        self.query_range(keywords::THERMISTOR_MIN, keywords::THERMISTOR_MAX)
            .await
    }

    /// Lifetime shot count (`SC?`).
    pub async fn system_shot_count(&self) -> LaserResult<u64> {
        self.query_value(keywords::SYSTEM_SHOT_COUNT).await
    }

    /// User shot count (`UC?`).
    pub async fn user_shot_count(&self) -> LaserResult<i64> {
        self.query_value(keywords::USER_SHOT_COUNT).await
    }

    async fn query_value<T: FromStr>(&self, keyword: &str) -> LaserResult<T> {
        let value = self.inner.query(keyword).await?;
        parse_value(keyword, value)
    }

    async fn query_range(&self, min: &str, max: &str) -> LaserResult<Bounds<f64>> {
        Ok(Bounds::new(
            self.query_value(min).await?,
            self.query_value(max).await?,
        ))
    }

    // =========================================================================
    // Settings getters (refresh the mirror)
    // =========================================================================

    /// Pulses per burst.
    pub async fn burst_count(&self) -> LaserResult<u32> {
        let count = self.query_value(keywords::BURST_COUNT).await?;
        self.inner.settings.lock().burst_count = count;
        Ok(count)
    }

    /// Diode current set point in amperes.
    pub async fn diode_current(&self) -> LaserResult<f64> {
        let current = self.query_value(keywords::DIODE_CURRENT).await?;
        self.inner.settings.lock().diode_current = current;
        Ok(current)
    }

    /// Allowed diode current range.
    pub async fn diode_current_range(&self) -> LaserResult<Bounds<f64>> {
        self.query_range(keywords::DIODE_CURRENT_MIN, keywords::DIODE_CURRENT_MAX)
            .await
    }

    /// Diode trigger source.
    pub async fn diode_trigger(&self) -> LaserResult<DiodeTrigger> {
        let value = self.inner.query(keywords::DIODE_TRIGGER).await?;
        let trigger = parse_wire_enum(keywords::DIODE_TRIGGER, value)?;
        self.inner.settings.lock().diode_trigger = trigger;
        Ok(trigger)
    }

    /// Diode pulse width in seconds.
    pub async fn pulse_width(&self) -> LaserResult<f64> {
        let width = self.query_value(keywords::PULSE_WIDTH).await?;
        self.inner.settings.lock().pulse_width = width;
        Ok(width)
    }

    /// Allowed diode pulse width range.
    pub async fn pulse_width_range(&self) -> LaserResult<Bounds<f64>> {
        self.query_range(keywords::PULSE_WIDTH_MIN, keywords::PULSE_WIDTH_MAX)
            .await
    }

    /// Whether the device echoes commands.
    pub async fn echo(&self) -> LaserResult<bool> {
        let value = self.inner.query(keywords::ECHO).await?;
        let echo = parse_flag(keywords::ECHO, value)?;
        self.inner.settings.lock().echo = echo;
        Ok(echo)
    }

    /// Energy mode.
    pub async fn energy_mode(&self) -> LaserResult<EnergyMode> {
        let value = self.inner.query(keywords::ENERGY_MODE).await?;
        let mode = parse_wire_enum(keywords::ENERGY_MODE, value)?;
        self.inner.settings.lock().energy_mode = mode;
        Ok(mode)
    }

    /// Value of the `EN` register.
    pub async fn is_enabled(&self) -> LaserResult<bool> {
        let value = self.inner.query(keywords::ENABLE).await?;
        parse_flag(keywords::ENABLE, value)
    }

    /// Value of the `FL` register.
    pub async fn is_fire_on(&self) -> LaserResult<bool> {
        let value = self.inner.query(keywords::FIRE).await?;
        parse_flag(keywords::FIRE, value)
    }

    /// Pulse period in seconds.
    pub async fn pulse_period(&self) -> LaserResult<f64> {
        let period = self.query_value(keywords::PULSE_PERIOD).await?;
        self.inner.settings.lock().pulse_period = period;
        Ok(period)
    }

    /// Allowed pulse period range.
    pub async fn pulse_period_range(&self) -> LaserResult<Bounds<f64>> {
        self.query_range(keywords::PULSE_PERIOD_MIN, keywords::PULSE_PERIOD_MAX)
            .await
    }

    /// Pulse mode.
    pub async fn pulse_mode(&self) -> LaserResult<PulseMode> {
        let value = self.inner.query(keywords::PULSE_MODE).await?;
        let mode = parse_wire_enum(keywords::PULSE_MODE, value)?;
        self.inner.settings.lock().pulse_mode = mode;
        Ok(mode)
    }

    /// Repetition rate in Hz.
    pub async fn rep_rate(&self) -> LaserResult<f64> {
        let rate = self.query_value(keywords::REP_RATE).await?;
        self.inner.settings.lock().rep_rate = rate;
        Ok(rate)
    }

    /// Allowed repetition rate range.
    pub async fn rep_rate_range(&self) -> LaserResult<Bounds<f64>> {
        self.query_range(keywords::REP_RATE_MIN, keywords::REP_RATE_MAX)
            .await
    }

    /// Slot last recalled.
    pub async fn recall_slot(&self) -> LaserResult<u8> {
        self.query_value(keywords::RECALL).await
    }

    /// Slot last saved.
    pub async fn save_slot(&self) -> LaserResult<u8> {
        self.query_value(keywords::SAVE).await
    }

    /// Read every setting from the device into the mirror.
    #[instrument(skip(self), err)]
    pub async fn refresh_settings(&self) -> LaserResult<LaserSettings> {
        self.burst_count().await?;
        self.diode_current().await?;
        self.diode_trigger().await?;
        self.pulse_width().await?;
        self.echo().await?;
        self.energy_mode().await?;
        self.pulse_period().await?;
        self.pulse_mode().await?;
        self.rep_rate().await?;
        Ok(self.settings())
    }

    // =========================================================================
    // Settings setters (validate, send, then commit the mirror)
    // =========================================================================

    /// Pulses per burst.
    #[instrument(skip(self), err)]
    pub async fn set_burst_count(&self, count: u32) -> LaserResult<()> {
        check_range(keywords::BURST_COUNT, count, &self.limits().burst_count)?;
        self.inner
            .command(keywords::BURST_COUNT, Some(&count.to_string()))
            .await?;
        self.inner.settings.lock().burst_count = count;
        Ok(())
    }

    /// Diode current in amperes.
    #[instrument(skip(self), err)]
    pub async fn set_diode_current(&self, current: f64) -> LaserResult<()> {
        check_range(keywords::DIODE_CURRENT, current, &self.limits().diode_current)?;
        self.inner
            .command(keywords::DIODE_CURRENT, Some(&format_float(current)))
            .await?;
        self.inner.settings.lock().diode_current = current;
        Ok(())
    }

    /// Diode trigger source.
    #[instrument(skip(self), err)]
    pub async fn set_diode_trigger(&self, trigger: DiodeTrigger) -> LaserResult<()> {
        self.inner
            .command(keywords::DIODE_TRIGGER, Some(&trigger.to_string()))
            .await?;
        self.inner.settings.lock().diode_trigger = trigger;
        Ok(())
    }

    /// Diode pulse width in seconds.
    #[instrument(skip(self), err)]
    pub async fn set_pulse_width(&self, width: f64) -> LaserResult<()> {
        check_range(keywords::PULSE_WIDTH, width, &self.limits().pulse_width)?;
        self.inner
            .command(keywords::PULSE_WIDTH, Some(&format_float(width)))
            .await?;
        self.inner.settings.lock().pulse_width = width;
        Ok(())
    }

    /// Command echo on or off.
    #[instrument(skip(self), err)]
    pub async fn set_echo(&self, echo: bool) -> LaserResult<()> {
        let arg = if echo { "1" } else { "0" };
        self.inner.command(keywords::ECHO, Some(arg)).await?;
        self.inner.settings.lock().echo = echo;
        Ok(())
    }

    /// Energy mode; the device updates its power mode bits to match.
    #[instrument(skip(self), err)]
    pub async fn set_energy_mode(&self, mode: EnergyMode) -> LaserResult<()> {
        self.inner
            .command(keywords::ENERGY_MODE, Some(&mode.to_string()))
            .await?;
        self.inner.settings.lock().energy_mode = mode;
        Ok(())
    }

    /// Pulse period in seconds.
    #[instrument(skip(self), err)]
    pub async fn set_pulse_period(&self, period: f64) -> LaserResult<()> {
        check_range(keywords::PULSE_PERIOD, period, &self.limits().pulse_period)?;
        self.inner
            .command(keywords::PULSE_PERIOD, Some(&format_float(period)))
            .await?;
        self.inner.settings.lock().pulse_period = period;
        Ok(())
    }

    /// Pulse mode.
    #[instrument(skip(self), err)]
    pub async fn set_pulse_mode(&self, mode: PulseMode) -> LaserResult<()> {
        self.inner
            .command(keywords::PULSE_MODE, Some(&mode.to_string()))
            .await?;
        self.inner.settings.lock().pulse_mode = mode;
        Ok(())
    }

    /// Repetition rate in Hz.
    #[instrument(skip(self), err)]
    pub async fn set_rep_rate(&self, rate: f64) -> LaserResult<()> {
        check_range(keywords::REP_RATE, rate, &self.limits().rep_rate)?;
        self.inner
            .command(keywords::REP_RATE, Some(&format_float(rate)))
            .await?;
        self.inner.settings.lock().rep_rate = rate;
        Ok(())
    }

    /// Store the current settings in a device slot.
    #[instrument(skip(self), err)]
    pub async fn save_settings(&self, slot: u8) -> LaserResult<()> {
        check_range(keywords::SAVE, slot, &self.limits().settings_slot)?;
        self.inner
            .command(keywords::SAVE, Some(&slot.to_string()))
            .await
    }

    /// Restore a device slot, then re-read the mirror.
    #[instrument(skip(self), err)]
    pub async fn recall_settings(&self, slot: u8) -> LaserResult<()> {
        check_range(keywords::RECALL, slot, &self.limits().settings_slot)?;
        self.inner
            .command(keywords::RECALL, Some(&slot.to_string()))
            .await?;
        self.refresh_settings().await?;
        Ok(())
    }

    /// Overwrite the user shot counter.
    #[instrument(skip(self), err)]
    pub async fn set_user_shot_count(&self, count: i64) -> LaserResult<()> {
        self.inner
            .command(keywords::USER_SHOT_COUNT, Some(&count.to_string()))
            .await
    }

    /// Factory reset. The mirror returns to the factory defaults.
    #[instrument(skip(self), err)]
    pub async fn reset(&self) -> LaserResult<()> {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.stop_kicker();
        self.inner.command(keywords::RESET, None).await?;
        *self.inner.settings.lock() = LaserSettings::default();
        Ok(())
    }

    /// Push every mirrored setting to the device.
    #[instrument(skip(self), err)]
    pub async fn apply_settings(&self) -> LaserResult<()> {
        let settings = self.settings();
        self.set_burst_count(settings.burst_count).await?;
        self.set_diode_current(settings.diode_current).await?;
        self.set_diode_trigger(settings.diode_trigger).await?;
        self.set_pulse_width(settings.pulse_width).await?;
        self.set_echo(settings.echo).await?;
        self.set_energy_mode(settings.energy_mode).await?;
        self.set_pulse_period(settings.pulse_period).await?;
        self.set_pulse_mode(settings.pulse_mode).await?;
        self.set_rep_rate(settings.rep_rate).await?;
        Ok(())
    }

    // =========================================================================
    // Arm / fire
    // =========================================================================

    /// Send `EN 1`. Arming completes on the device after its arming delay.
    #[instrument(skip(self), err)]
    pub async fn arm(&self) -> LaserResult<()> {
        let status = self.get_status().await?;
        if status.laser_enabled {
            return Err(LaserError::DeviceNotReady(
                "laser is already enabled".to_string(),
            ));
        }
        if !status.ready_to_enable {
            return Err(LaserError::DeviceNotReady(format!(
                "device is not ready to enable (status {})",
                status.encode()
            )));
        }
        self.inner.command(keywords::ENABLE, Some("1")).await?;
        info!("arming");
        Ok(())
    }

    /// Poll status until the device reports ready to fire.
    #[instrument(skip(self), err)]
    pub async fn wait_until_armed(&self, timeout: Duration) -> LaserResult<StatusWord> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_status().await?;
            if status.is_armed() {
                info!("armed");
                return Ok(status);
            }
            if status.has_fault() {
                return Err(LaserError::DeviceNotReady(format!(
                    "fault while arming (status {})",
                    status.encode()
                )));
            }
            if Instant::now() >= deadline {
                return Err(LaserError::DeviceNotReady(format!(
                    "not armed within {timeout:?}"
                )));
            }
            tokio::time::sleep(self.inner.config.timing.fire_poll_interval).await;
        }
    }

    /// Send `EN 0`. Callable at any time; a running fire sequence ends as aborted.
    #[instrument(skip(self), err)]
    pub async fn disarm(&self) -> LaserResult<()> {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.stop_kicker();
        self.inner.command(keywords::ENABLE, Some("0")).await?;
        info!("disarmed");
        Ok(())
    }

    /// Start a fire sequence and return once the device has accepted it.
    ///
    /// The sequence is supervised in the background; use
    /// [`LaserController::wait_for_fire`] to collect its outcome.
    #[instrument(skip(self), err)]
    pub async fn fire(&self) -> LaserResult<()> {
        if self
            .inner
            .firing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LaserError::FireInProgress);
        }

        let result = self.start_fire().await;
        if result.is_err() {
            self.inner.firing.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn start_fire(&self) -> LaserResult<()> {
        let status = self.get_status().await?;
        if !(status.laser_enabled && status.ready_to_fire) {
            return Err(LaserError::DeviceNotReady(format!(
                "laser is not armed (status {})",
                status.encode()
            )));
        }

        self.inner.stop_requested.store(false, Ordering::SeqCst);
        let duration = self.read_fire_duration().await?;

        let address = &self.inner.config.device.address;
        let frame = protocol::encode_command(address, keywords::FIRE, Some("1"))?;
        let started = Instant::now();
        let reply = self.inner.exchange(&frame, "FL 1").await;

        let failure = match reply {
            Ok(Some(Response::Ok)) => None,
            Ok(Some(Response::Error(code))) => Some((Some(code), code.description().to_string())),
            Ok(Some(Response::Value(v))) => Some((None, format!("unexpected response '{v}'"))),
            Ok(None) => Some((None, "no response".to_string())),
            Err(e) => Some((None, e.to_string())),
        };
        if let Some((code, reason)) = failure {
            if let Err(e) = self.inner.command(keywords::FIRE, Some("0")).await {
                warn!(error = %e, "FL 0 after failed fire also failed");
            }
            return Err(LaserError::FireFailed { code, reason });
        }

        let reason = match self.get_status().await {
            Ok(status) if status.laser_active => None,
            Ok(status) => Some(format!("laser failed to fire (status {})", status.encode())),
            Err(e) => Some(format!("status check after FL 1 failed: {e}")),
        };
        if let Some(reason) = reason {
            if let Err(e) = self.inner.command(keywords::FIRE, Some("0")).await {
                warn!(error = %e, "FL 0 after failed fire also failed");
            }
            return Err(LaserError::FireFailed { code: None, reason });
        }

        info!(?duration, "firing");
        if duration >= self.inner.config.timing.kicker_threshold {
            let kicker = Kicker::spawn(
                Arc::clone(&self.inner),
                self.inner.config.timing.kicker_interval,
            );
            if let Some(previous) = self.inner.kicker.lock().replace(kicker) {
                previous.stop();
            }
        }

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = fire::supervise(&inner, started, duration).await;
            inner.stop_kicker();
            if let Err(fault) = &result {
                inner.faults.record(fault.clone());
            }
            inner.firing.store(false, Ordering::SeqCst);
            result
        });
        *self.inner.fire_task.lock() = Some(task);
        Ok(())
    }

    /// Read the registers that set the sequence length and return it.
    ///
    /// The device may have been changed behind the mirror (`send_raw`, another
    /// client), so only what the device reports is trusted here.
    async fn read_fire_duration(&self) -> LaserResult<Duration> {
        match self.pulse_mode().await? {
            PulseMode::Continuous => {
                self.pulse_period().await?;
            }
            PulseMode::SingleShot => {
                self.rep_rate().await?;
            }
            PulseMode::Burst => {
                self.burst_count().await?;
                self.rep_rate().await?;
            }
        }
        Ok(self.settings().fire_duration())
    }

    /// Send `FL 0` unconditionally. A running fire sequence ends as aborted.
    #[instrument(skip(self), err)]
    pub async fn emergency_stop(&self) -> LaserResult<()> {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.stop_kicker();
        self.inner.command(keywords::FIRE, Some("0")).await?;
        warn!("emergency stop");
        Ok(())
    }

    /// Wait for the current fire sequence to end.
    ///
    /// A fault returned here is also removed from [`LaserController::take_fault`].
    pub async fn wait_for_fire(&self) -> LaserResult<FireOutcome> {
        let task = self
            .inner
            .fire_task
            .lock()
            .take()
            .ok_or_else(|| LaserError::DeviceNotReady("no fire sequence started".to_string()))?;

        match task.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(fault)) => {
                self.inner.faults.take();
                Err(fault.into())
            }
            Err(join) => Err(LaserError::TaskFailed(join.to_string())),
        }
    }

    /// A fire sequence is claimed and not yet finished.
    pub fn is_firing(&self) -> bool {
        self.inner.firing.load(Ordering::SeqCst)
    }

    /// The kicker task is running.
    pub fn kicker_active(&self) -> bool {
        self.inner
            .kicker
            .lock()
            .as_ref()
            .is_some_and(Kicker::is_running)
    }

    /// Status seen by the most recent kicker query.
    pub fn last_kicker_status(&self) -> Option<StatusWord> {
        *self.inner.last_kicker_status.lock()
    }

    /// Last background fault not yet collected.
    pub fn take_fault(&self) -> Option<LaserError> {
        self.inner.faults.take().map(LaserError::from)
    }

    /// Receive every background fault as it is recorded.
    pub fn subscribe_faults(&self) -> broadcast::Receiver<FireFault> {
        self.inner.faults.subscribe()
    }
}

impl Drop for LaserController {
    fn drop(&mut self) {
        self.inner.stop_kicker();
        if let Some(task) = self.inner.fire_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;
    use ujlaser_core::protocol::ErrorCode;

    fn controller(mock: tokio_test::io::Mock) -> LaserController {
        LaserController::new(
            Box::new(SerialTransport::new(Box::new(mock))),
            LaserConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn setter_sends_frame_and_commits_mirror() {
        let mock = Builder::new().write(b";LA:BC 25\r").read(b"OK\r\n").build();
        let laser = controller(mock);

        laser.set_burst_count(25).await.unwrap();
        assert_eq!(laser.settings().burst_count, 25);
    }

    #[tokio::test]
    async fn out_of_range_setter_never_touches_the_wire() {
        let laser = controller(Builder::new().build());

        let err = laser.set_rep_rate(7.5).await.unwrap_err();
        match err {
            LaserError::InvalidArgument {
                keyword,
                value,
                bound,
            } => {
                assert_eq!(keyword, "RR");
                assert_eq!(value, "7.5");
                assert_eq!(bound, "1..=5");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(laser.settings().rep_rate, 1.0);
    }

    #[tokio::test]
    async fn rejected_setter_keeps_mirror() {
        let mock = Builder::new().write(b";LA:PE 3.5\r").read(b"?8\r\n").build();
        let laser = controller(mock);

        let err = laser.set_pulse_period(3.5).await.unwrap_err();
        assert_eq!(err.device_code(), Some(ErrorCode::Unavailable));
        assert!(err.to_string().contains("unavailable in current system state"));
        assert_eq!(laser.settings().pulse_period, 0.2);
    }

    #[tokio::test]
    async fn accepts_lowercase_ok_and_bare_carriage_return() {
        let mock = Builder::new()
            .write(b";LA:EM 2\r")
            .read(b"ok\r")
            .write(b";LA:SS?\r")
            .read(b"11265\r")
            .build();
        let laser = controller(mock);

        laser.set_energy_mode(EnergyMode::High).await.unwrap();
        let status = laser.get_status().await.unwrap();
        assert!(status.high_power_mode);
        assert!(status.is_armed());
    }

    #[tokio::test]
    async fn typed_getters_parse_and_refresh_mirror() {
        let mock = Builder::new()
            .write(b";LA:PM?\r")
            .read(b"2\r\n")
            .write(b";LA:RR:MIN?\r")
            .read(b"1\r\n")
            .write(b";LA:RR:MAX?\r")
            .read(b"5\r\n")
            .write(b";LA:ID?\r")
            .read(b"QC,MicroJewel,00101,1.0-0.0.0.8\r\n")
            .build();
        let laser = controller(mock);

        assert_eq!(laser.pulse_mode().await.unwrap(), PulseMode::Burst);
        assert_eq!(laser.settings().pulse_mode, PulseMode::Burst);
        assert_eq!(laser.rep_rate_range().await.unwrap(), Bounds::new(1.0, 5.0));
        assert!(laser.identity().await.unwrap().contains("MicroJewel"));
    }

    #[tokio::test]
    async fn garbage_value_is_unexpected_response() {
        let mock = Builder::new().write(b";LA:SS?\r").read(b"hello\r\n").build();
        let laser = controller(mock);

        let err = laser.get_status().await.unwrap_err();
        assert!(matches!(err, LaserError::UnexpectedResponse { .. }));
    }

    #[tokio::test]
    async fn fire_requires_armed_device() {
        let mock = Builder::new().write(b";LA:SS?\r").read(b"1024\r\n").build();
        let laser = controller(mock);

        let err = laser.fire().await.unwrap_err();
        assert!(matches!(err, LaserError::DeviceNotReady(_)));
        assert!(!laser.is_firing());
    }

    #[tokio::test]
    async fn refused_fire_sends_stop_and_fails() {
        let mock = Builder::new()
            .write(b";LA:SS?\r")
            .read(b"3073\r\n")
            .write(b";LA:PM?\r")
            .read(b"0\r\n")
            .write(b";LA:PE?\r")
            .read(b"0.2\r\n")
            .write(b";LA:FL 1\r")
            .read(b"?8\r\n")
            .write(b";LA:FL 0\r")
            .read(b"OK\r\n")
            .build();
        let laser = controller(mock);

        let err = laser.fire().await.unwrap_err();
        match err {
            LaserError::FireFailed { code, .. } => assert_eq!(code, Some(ErrorCode::Unavailable)),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!laser.is_firing());
    }

    /// Mock script up to an accepted `FL 1` for a 200 ms continuous sequence.
    fn accepted_fire(builder: &mut Builder) -> &mut Builder {
        builder
            .write(b";LA:SS?\r")
            .read(b"3073\r\n")
            .write(b";LA:PM?\r")
            .read(b"0\r\n")
            .write(b";LA:PE?\r")
            .read(b"0.2\r\n")
            .write(b";LA:FL 1\r")
            .read(b"OK\r\n")
    }

    #[tokio::test(start_paused = true)]
    async fn laser_inactive_after_fire_sends_stop_and_fails() {
        let mock = accepted_fire(&mut Builder::new())
            .write(b";LA:SS?\r")
            .read(b"3073\r\n")
            .write(b";LA:FL 0\r")
            .read(b"OK\r\n")
            .build();
        let laser = controller(mock);

        match laser.fire().await.unwrap_err() {
            LaserError::FireFailed { code, reason } => {
                assert_eq!(code, None);
                assert!(reason.contains("failed to fire"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!laser.is_firing());
        assert!(laser.take_fault().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_delayed_past_deadline_completes() {
        let mock = accepted_fire(&mut Builder::new())
            .write(b";LA:SS?\r")
            .read(b"3075\r\n")
            // Caller's query holds the link from 50 ms to 250 ms.
            .write(b";LA:SS?\r")
            .wait(Duration::from_millis(200))
            .read(b"3075\r\n")
            // The fire task's first poll lands after the 200 ms sequence ended.
            .write(b";LA:SS?\r")
            .read(b"3073\r\n")
            .build();
        let laser = controller(mock);

        laser.fire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(laser.get_status().await.unwrap().laser_active);

        assert_eq!(laser.wait_for_fire().await.unwrap(), FireOutcome::Completed);
        assert!(laser.take_fault().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_releases_the_fire_claim() {
        let mock = accepted_fire(&mut Builder::new())
            .write(b";LA:SS?\r")
            .read(b"3075\r\n")
            .build();
        let laser = controller(mock);

        laser.fire().await.unwrap();
        assert!(laser.is_firing());
        laser.close().await.unwrap();
        assert!(!laser.is_firing());
        assert!(matches!(
            laser.wait_for_fire().await.unwrap_err(),
            LaserError::DeviceNotReady(_)
        ));
    }

    #[tokio::test]
    async fn arm_rejects_already_enabled_device() {
        let mock = Builder::new().write(b";LA:SS?\r").read(b"3073\r\n").build();
        let laser = controller(mock);

        let err = laser.arm().await.unwrap_err();
        assert!(matches!(err, LaserError::DeviceNotReady(_)));
    }

    #[tokio::test]
    async fn send_raw_passes_commands_through() {
        let mock = Builder::new()
            .write(b";LA:SC?\r")
            .read(b"42\r\n")
            .write(b";LA:UC 0\r")
            .read(b"OK\r\n")
            .build();
        let laser = controller(mock);

        assert_eq!(laser.send_raw("SC?").await.unwrap().as_deref(), Some("42"));
        assert_eq!(laser.send_raw("UC 0").await.unwrap().as_deref(), Some("OK"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_response_is_retryable() {
        let mock = Builder::new()
            .write(b";LA:SS?\r")
            .wait(Duration::from_secs(2))
            .build();
        let laser = controller(mock);

        let err = laser.get_status().await.unwrap_err();
        assert!(matches!(err, LaserError::NoResponse { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn closed_link_is_not_connected() {
        let laser = controller(Builder::new().build());
        laser.close().await.unwrap();
        assert!(!laser.is_open().await);
        assert!(matches!(
            laser.get_status().await.unwrap_err(),
            LaserError::NotConnected
        ));
    }
}
