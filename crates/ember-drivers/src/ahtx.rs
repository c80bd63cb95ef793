//! # AHTx Driver
//!
//! This module provides a non-blocking, architecture-agnostic driver for the
//! AHT10, AHT20 and AHT21 humidity and temperature sensors over the I²C
//! protocol.
//!
//! A measurement takes more than 80 ms, so it is never awaited. Instead, the
//! task walks through the phases of [`Phase`] one step per fast poll:
//! trigger a measurement once the sensor reports it is ready, then read and
//! validate the payload once the sensor reports it is done. A sensor which
//! stays unresponsive for more than [`DWELL_LIMIT_MS`] is soft-reset and
//! brought up again.
//!
//! For detailed information and specifications, see the
//! [datasheet](https://asairsensors.com/wp-content/uploads/2021/09/Data-Sheet-AHT20-Humidity-and-Temperature-Sensor-ASAIR-V1.0.03.pdf).

use alloc::boxed::Box;
use alloc::format;

use embedded_hal::i2c::I2c;

use log::{debug, error};

use serde::Deserialize;

use ember::clock::time_passed_since;
use ember::config::{DriverId, TaskConfig};
use ember::error::{Error, ErrorKind, Result};
use ember::plugin::{Plugin, PluginTask, TaskEvent};

use crate::bus::I2cAccess;

/// Driver identifier of the AHTx plugin.
pub const DRIVER_ID: DriverId = DriverId(105);

/// Maximum time spent waiting for the sensor before resetting it.
pub const DWELL_LIMIT_MS: u64 = 1000;

// Initialization opcodes, followed by the calibration arguments.
const AHT10_INIT: u8 = 0xE1;
const AHT2X_INIT: u8 = 0xBE;
const INIT_ARGS: [u8; 2] = [0x08, 0x00];

const TRIGGER_MEASUREMENT: [u8; 3] = [0xAC, 0x33, 0x00];
const SOFT_RESET: u8 = 0xBA;

const DATA_LEN: usize = 6;

// Full scale of the 20-bit raw values.
const FULL_SCALE: f32 = (1u32 << 20) as f32;

/// Errors that may occur while interacting with an AHTx sensor.
#[derive(Debug, Copy, Clone)]
pub enum AhtxError<E> {
    /// I²C bus error.
    I2c(E),
    /// The status byte is invalid.
    InvalidStatus,
    /// The sensor is not calibrated.
    NotCalibrated,
}

impl<E> From<E> for AhtxError<E> {
    fn from(e: E) -> Self {
        AhtxError::I2c(e)
    }
}

/// Supported sensor models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// AHT10.
    Aht10,
    /// AHT20.
    #[default]
    Aht20,
    /// AHT21.
    Aht21,
}

impl Device {
    /// Returns the sensor model name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Aht10 => "AHT10",
            Self::Aht20 => "AHT20",
            Self::Aht21 => "AHT21",
        }
    }

    #[inline]
    const fn init_opcode(self) -> u8 {
        match self {
            Self::Aht10 => AHT10_INIT,
            Self::Aht20 | Self::Aht21 => AHT2X_INIT,
        }
    }
}

/// I²C address of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    /// Low: `0x38`.
    Low = 0x38,
    /// High: `0x39`, AHT10 only, when ADR is connected to VCC.
    High = 0x39,
}

impl TryFrom<u8> for Address {
    type Error = u8;

    fn try_from(address: u8) -> core::result::Result<Self, Self::Error> {
        match address {
            0x38 => Ok(Self::Low),
            0x39 => Ok(Self::High),
            other => Err(other),
        }
    }
}

/// The sensor status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u8);

impl Status {
    /// Checks whether the status byte carries meaningful bits.
    #[must_use]
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0xFF
    }

    /// Checks whether the calibration bit is set.
    #[must_use]
    #[inline]
    pub const fn is_calibrated(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    /// Checks whether a measurement is in progress.
    #[must_use]
    #[inline]
    pub const fn is_busy(self) -> bool {
        self.0 & (1 << 7) != 0
    }

    /// Checks whether the sensor accepts a new command.
    #[must_use]
    #[inline]
    pub const fn is_ready(self) -> bool {
        self.is_valid() && self.is_calibrated() && !self.is_busy()
    }
}

/// A decoded measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Measurement {
    /// Relative humidity, in percent.
    pub humidity: f32,
    /// Temperature, in degrees Celsius.
    pub temperature: f32,
}

impl Measurement {
    /// Decodes the six-byte payload of a measurement.
    ///
    /// The status byte is checked before any conversion.
    ///
    /// # Errors
    ///
    /// Fails when the status byte is invalid or reports a sensor which is
    /// not calibrated.
    pub fn decode<E>(data: &[u8; DATA_LEN]) -> core::result::Result<Self, AhtxError<E>> {
        let status = Status(data[0]);
        if !status.is_valid() {
            return Err(AhtxError::InvalidStatus);
        }
        if !status.is_calibrated() {
            return Err(AhtxError::NotCalibrated);
        }

        // 20 bits of humidity followed by 20 bits of temperature.
        let humidity =
            (u32::from(data[1]) << 12) | (u32::from(data[2]) << 4) | (u32::from(data[3]) >> 4);
        let temperature =
            (u32::from(data[3] & 0x0F) << 16) | (u32::from(data[4]) << 8) | u32::from(data[5]);

        Ok(Self {
            humidity: humidity as f32 / FULL_SCALE * 100.,
            temperature: temperature as f32 / FULL_SCALE * 200. - 50.,
        })
    }
}

/// Low-level AHTx commands.
///
/// The device does not own the bus: every command borrows it for the
/// duration of one transaction.
#[derive(Debug, Clone, Copy)]
pub struct AhtxDevice {
    address: Address,
    device: Device,
    alt_init: bool,
}

impl AhtxDevice {
    /// Creates a new [`AhtxDevice`].
    ///
    /// With `alt_init`, an AHT10 is brought up with a soft reset only.
    #[must_use]
    pub const fn new(address: Address, device: Device, alt_init: bool) -> Self {
        Self {
            address,
            device,
            alt_init,
        }
    }

    /// Returns the sensor model name.
    #[must_use]
    #[inline]
    pub const fn name(&self) -> &'static str {
        self.device.name()
    }

    /// Sends the initialization command.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn initialize<I: I2c>(
        &self,
        i2c: &mut I,
    ) -> core::result::Result<(), AhtxError<I::Error>> {
        if self.device == Device::Aht10 && self.alt_init {
            return self.soft_reset(i2c);
        }

        let [arg0, arg1] = INIT_ARGS;
        i2c.write(self.address as u8, &[self.device.init_opcode(), arg0, arg1])?;

        Ok(())
    }

    /// Starts a measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn trigger_measurement<I: I2c>(
        &self,
        i2c: &mut I,
    ) -> core::result::Result<(), AhtxError<I::Error>> {
        i2c.write(self.address as u8, &TRIGGER_MEASUREMENT)?;

        Ok(())
    }

    /// Resets the sensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn soft_reset<I: I2c>(
        &self,
        i2c: &mut I,
    ) -> core::result::Result<(), AhtxError<I::Error>> {
        i2c.write(self.address as u8, &[SOFT_RESET])?;

        Ok(())
    }

    /// Reads the status byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying I²C bus operation fails.
    pub fn read_status<I: I2c>(
        &self,
        i2c: &mut I,
    ) -> core::result::Result<Status, AhtxError<I::Error>> {
        let mut buf = [0u8; 1];
        i2c.read(self.address as u8, &mut buf)?;

        Ok(Status(buf[0]))
    }

    /// Reads and decodes a measurement.
    ///
    /// # Errors
    ///
    /// Returns an error if the I²C bus operation fails or the payload does
    /// not pass validation.
    pub fn read_data<I: I2c>(
        &self,
        i2c: &mut I,
    ) -> core::result::Result<Measurement, AhtxError<I::Error>> {
        let mut buf = [0u8; DATA_LEN];
        i2c.read(self.address as u8, &mut buf)?;

        Measurement::decode(&buf)
    }
}

/// Phases of the measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The sensor must be brought up.
    Uninitialized,
    /// Waiting for the sensor to accept a measurement command.
    TriggerMeasurement,
    /// Waiting for the sensor to complete the measurement.
    WaitForSamples,
    /// A measurement is ready to be published.
    NewValues,
    /// The last measurement was published.
    ValuesRead,
}

/// Parameters of an AHTx task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AhtxParams {
    /// I²C address.
    pub address: u8,
    /// Sensor model.
    pub device: Device,
    /// Bring an AHT10 up with a soft reset only.
    pub alt_init: bool,
}

impl Default for AhtxParams {
    fn default() -> Self {
        Self {
            address: Address::Low as u8,
            device: Device::default(),
            alt_init: false,
        }
    }
}

/// The state of an AHTx task.
#[derive(Debug)]
pub struct AhtxTask {
    device: AhtxDevice,
    phase: Phase,
    last_measurement: Option<u64>,
    trigger_time: u64,
    measurement: Measurement,
}

impl AhtxTask {
    /// Creates a new [`AhtxTask`] in the [`Phase::Uninitialized`] phase.
    #[must_use]
    pub const fn new(device: AhtxDevice) -> Self {
        Self {
            device,
            phase: Phase::Uninitialized,
            last_measurement: None,
            trigger_time: 0,
            measurement: Measurement {
                humidity: 0.,
                temperature: 0.,
            },
        }
    }

    /// Returns the current phase.
    #[must_use]
    #[inline]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Returns the last decoded measurement.
    #[must_use]
    #[inline]
    pub const fn measurement(&self) -> Measurement {
        self.measurement
    }

    fn rearm_due(&self, now_ms: u64, interval_ms: u64) -> bool {
        self.last_measurement
            .is_none_or(|last| time_passed_since(now_ms, last) >= interval_ms)
    }

    fn check_dwell<I: I2c>(&mut self, i2c: &mut I, now_ms: u64) {
        if time_passed_since(now_ms, self.trigger_time) <= DWELL_LIMIT_MS {
            return;
        }

        error!("{} : reset", self.device.name());
        if let Err(e) = self.device.soft_reset(i2c) {
            error!("{} : soft reset failed: {e:?}", self.device.name());
        }
        self.phase = Phase::Uninitialized;
    }
}

impl<H: I2cAccess> PluginTask<H> for AhtxTask {
    fn init(&mut self, event: TaskEvent<'_, H>) -> bool {
        match self.device.initialize(event.hardware.i2c()) {
            Ok(()) => {
                debug!("{} : initialized", self.device.name());
                self.trigger_time = event.now_ms;
                self.phase = Phase::TriggerMeasurement;
                true
            }
            Err(e) => {
                error!("{} : unable to initialize: {e:?}", self.device.name());
                self.phase = Phase::Uninitialized;
                false
            }
        }
    }

    fn poll_fast(&mut self, event: TaskEvent<'_, H>) -> bool {
        let now_ms = event.now_ms;

        match self.phase {
            Phase::Uninitialized => return false,
            Phase::NewValues | Phase::ValuesRead => {
                if !self.rearm_due(now_ms, event.interval_ms) {
                    return false;
                }
                self.trigger_time = now_ms;
                self.phase = Phase::TriggerMeasurement;
            }
            Phase::TriggerMeasurement | Phase::WaitForSamples => {}
        }

        let i2c = event.hardware.i2c();

        let ready = self
            .device
            .read_status(i2c)
            .is_ok_and(|status| status.is_ready());
        if !ready {
            self.check_dwell(i2c, now_ms);
            return false;
        }

        if self.phase == Phase::TriggerMeasurement {
            if let Err(e) = self.device.trigger_measurement(i2c) {
                debug!("{} : trigger failed: {e:?}", self.device.name());
                self.check_dwell(i2c, now_ms);
                return false;
            }
            self.trigger_time = now_ms;
            self.phase = Phase::WaitForSamples;
            return false;
        }

        match self.device.read_data(i2c) {
            Ok(measurement) => {
                debug!(
                    "{} : humidity {:.2}% temperature {:.2}C",
                    self.device.name(),
                    measurement.humidity,
                    measurement.temperature
                );
                self.measurement = measurement;
                self.last_measurement = Some(now_ms);
                self.phase = Phase::NewValues;
                true
            }
            Err(e) => {
                debug!("{} : payload rejected: {e:?}", self.device.name());
                self.check_dwell(i2c, now_ms);
                false
            }
        }
    }

    fn read(&mut self, event: TaskEvent<'_, H>) -> bool {
        if self.phase != Phase::NewValues {
            return false;
        }

        let _ = event.values.set(0, self.measurement.temperature);
        let _ = event.values.set(1, self.measurement.humidity);
        self.phase = Phase::ValuesRead;
        true
    }

    fn initialized(&self) -> bool {
        self.phase != Phase::Uninitialized
    }
}

/// The AHTx plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct AhtxPlugin;

impl<H: I2cAccess> Plugin<H> for AhtxPlugin {
    fn id(&self) -> DriverId {
        DRIVER_ID
    }

    fn name(&self) -> &'static str {
        "Environment - AHT1x/AHT2x"
    }

    fn value_names(&self) -> &'static [&'static str] {
        &["Temperature", "Humidity"]
    }

    fn uses_fast_poll(&self) -> bool {
        true
    }

    fn instantiate(&self, config: &TaskConfig) -> Result<Box<dyn PluginTask<H>>> {
        let params: AhtxParams = config.parameters()?;

        let address = Address::try_from(params.address).map_err(|address| {
            Error::new(
                ErrorKind::InvalidParameters,
                format!("task {}: invalid AHTx address {address:#04x}", config.slot),
            )
        })?;

        Ok(Box::new(AhtxTask::new(AhtxDevice::new(
            address,
            params.device,
            params.alt_init,
        ))))
    }
}
