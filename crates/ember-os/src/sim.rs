use std::convert::Infallible;

use embedded_hal::i2c::{self, I2c, NoAcknowledgeSource, Operation};
use embedded_hal::spi::{self, SpiBus};

use ember_drivers::bus::{I2cAccess, SpiAccess};

const FULL_SCALE: f32 = 1_048_576.;

const STATUS_BUSY: u8 = 1 << 7;
const STATUS_CALIBRATED: u8 = 1 << 3;

/// A simulated `AHT20` humidity and temperature sensor.
///
/// A measurement stays busy for a configurable number of status reads,
/// standing in for the conversion time of the real device.
#[derive(Debug, Clone)]
pub struct SimulatedAht {
    address: u8,
    calibrated: bool,
    busy_reads: u8,
    conversion_reads: u8,
    stalled: bool,
    temperature: f32,
    humidity: f32,
    measurements: u32,
}

impl SimulatedAht {
    /// Creates a [`SimulatedAht`] answering on `address`.
    #[must_use]
    pub const fn new(address: u8) -> Self {
        Self {
            address,
            calibrated: false,
            busy_reads: 0,
            conversion_reads: 1,
            stalled: false,
            temperature: 21.5,
            humidity: 45.,
            measurements: 0,
        }
    }

    /// Sets the number of status reads reporting a busy sensor after every
    /// measurement command.
    #[must_use]
    pub const fn conversion_reads(mut self, reads: u8) -> Self {
        self.conversion_reads = reads;
        self
    }

    /// Sets the climate the sensor measures.
    pub const fn set_climate(&mut self, temperature: f32, humidity: f32) {
        self.temperature = temperature;
        self.humidity = humidity;
    }

    /// Keeps the sensor busy until the next soft reset.
    pub const fn stall(&mut self) {
        self.stalled = true;
    }

    /// Returns the number of completed measurements.
    #[must_use]
    pub const fn measurements(&self) -> u32 {
        self.measurements
    }

    fn status(&self) -> u8 {
        let mut status = 0x10;
        if self.stalled || self.busy_reads > 0 {
            status |= STATUS_BUSY;
        }
        if self.calibrated {
            status |= STATUS_CALIBRATED;
        }
        status
    }

    fn command(&mut self, bytes: &[u8]) {
        match bytes.first() {
            Some(0xBE | 0xE1) => self.calibrated = true,
            Some(0xAC) => self.busy_reads = self.conversion_reads,
            Some(0xBA) => {
                self.calibrated = true;
                self.busy_reads = 0;
                self.stalled = false;
            }
            _ => {}
        }
    }

    fn respond(&mut self, buf: &mut [u8]) {
        let status = self.status();
        if let [only] = buf {
            *only = status;
            self.busy_reads = self.busy_reads.saturating_sub(1);
            return;
        }

        let raw = |ratio: f32| ((ratio * FULL_SCALE + 0.5) as u32).min((1 << 20) - 1);
        let humidity = raw(self.humidity / 100.);
        let temperature = raw((self.temperature + 50.) / 200.);

        let data = [
            status,
            (humidity >> 12) as u8,
            (humidity >> 4) as u8,
            (((humidity & 0x0F) << 4) | (temperature >> 16)) as u8,
            (temperature >> 8) as u8,
            temperature as u8,
        ];
        for (byte, value) in buf.iter_mut().zip(data) {
            *byte = value;
        }
        self.measurements += 1;
    }
}

impl i2c::ErrorType for SimulatedAht {
    type Error = i2c::ErrorKind;
}

impl I2c for SimulatedAht {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        if address != self.address {
            return Err(i2c::ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }

        for operation in operations {
            match operation {
                Operation::Write(bytes) => self.command(bytes),
                Operation::Read(buf) => self.respond(buf),
            }
        }

        Ok(())
    }
}

/// An SPI bus keeping the last frame written to a LED strip.
#[derive(Debug, Clone, Default)]
pub struct FrameSink {
    pending: Vec<u8>,
    last: Vec<u8>,
    frames: usize,
}

impl FrameSink {
    /// Creates an empty [`FrameSink`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
            last: Vec::new(),
            frames: 0,
        }
    }

    /// Returns the number of complete frames received.
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Decodes the colour bytes of the last frame.
    ///
    /// Every four SPI bytes carry one colour byte, the trailing latch is
    /// skipped.
    #[must_use]
    pub fn colors(&self) -> Vec<u8> {
        let bit = |nibble: u8| u8::from(nibble & 0b0100 != 0);

        self.last
            .chunks_exact(4)
            .take_while(|group| group.iter().all(|&byte| byte != 0))
            .map(|group| {
                group.iter().fold(0, |color, byte| {
                    (color << 2) | (bit(byte >> 4) << 1) | bit(byte & 0x0F)
                })
            })
            .collect()
    }
}

impl spi::ErrorType for FrameSink {
    type Error = Infallible;
}

impl SpiBus for FrameSink {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        words.fill(0);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.pending.extend_from_slice(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        read.fill(0);
        self.write(write)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.pending.extend_from_slice(words);
        words.fill(0);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if !self.pending.is_empty() {
            self.last = std::mem::take(&mut self.pending);
            self.frames += 1;
        }
        Ok(())
    }
}

/// A simulated board with one I²C sensor and one LED strip.
#[derive(Debug, Clone)]
pub struct HostBoard {
    /// The sensor on the I²C bus.
    pub sensor: SimulatedAht,
    /// The strip on the SPI bus.
    pub strip: FrameSink,
}

impl Default for HostBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBoard {
    /// Creates a [`HostBoard`] with a sensor at the default `AHTx`
    /// address.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sensor: SimulatedAht::new(0x38),
            strip: FrameSink::new(),
        }
    }
}

impl I2cAccess for HostBoard {
    type Bus = SimulatedAht;

    fn i2c(&mut self) -> &mut Self::Bus {
        &mut self.sensor
    }
}

impl SpiAccess for HostBoard {
    type Bus = FrameSink;

    fn spi(&mut self) -> &mut Self::Bus {
        &mut self.strip
    }
}
