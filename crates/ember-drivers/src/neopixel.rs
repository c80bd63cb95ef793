//! # NeoPixel Driver
//!
//! This module provides an architecture-agnostic driver for WS2812 RGB and
//! SK6812 RGBW LED strips driven through an SPI bus.
//!
//! The SPI bus is expected to run at 3.2 MHz, so that every SPI byte carries
//! two colour bits with the timing the LEDs expect. A frame is written in
//! one transaction followed by a latch of zero bytes.
//!
//! The strip is an actuator: it publishes no value and is driven through
//! write commands.
//!
//! | Command | Arguments |
//! |---------|-----------|
//! | `neopixel` | `<led>,<red>,<green>,<blue>[,<white>]` |
//! | `neopixelall` | `<red>,<green>,<blue>[,<white>]` |
//! | `neopixelline` | `<from>,<to>,<red>,<green>,<blue>[,<white>]` |
//! | `neopixelhsv` | `<led>,<hue>,<saturation>,<value>` |
//! | `neopixelallhsv` | `<hue>,<saturation>,<value>` |
//! | `neopixellinehsv` | `<from>,<to>,<hue>,<saturation>,<value>` |
//! | `neopixelbright` | `<brightness>` |
//!
//! LED numbers start at 1. Hue ranges over `0..=360`, saturation and value
//! over `0..=100`.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec;
use alloc::vec::Vec;

use core::ops::RangeInclusive;

use embedded_hal::spi::SpiBus;

use log::{debug, error};

use serde::Deserialize;

use ember::command::Command;
use ember::config::{DriverId, TaskConfig};
use ember::error::{Error, ErrorKind, Result};
use ember::plugin::{Plugin, PluginTask, TaskEvent};

use crate::bus::SpiAccess;

/// Driver identifier of the NeoPixel plugin.
pub const DRIVER_ID: DriverId = DriverId(38);

/// Maximum number of LEDs of a strip.
pub const MAX_LEDS: u16 = 1024;

// Zero bytes keeping the line low for more than 50 µs at 3.2 MHz.
const LATCH_LEN: usize = 24;

// SPI nibbles encoding one colour bit.
const BIT_ZERO: u8 = 0b1000;
const BIT_ONE: u8 = 0b1110;

/// Errors that may occur while driving a strip.
#[derive(Debug, Copy, Clone)]
pub enum NeoPixelError<E> {
    /// SPI bus error.
    Spi(E),
}

impl<E> From<E> for NeoPixelError<E> {
    fn from(e: E) -> Self {
        NeoPixelError::Spi(e)
    }
}

/// The LED layout of a strip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StripKind {
    /// Three channels per LED.
    #[default]
    Rgb,
    /// Four channels per LED, the last one driving a white LED.
    Rgbw,
}

impl StripKind {
    /// Returns the number of channels per LED.
    #[must_use]
    pub const fn channels(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Rgbw => 4,
        }
    }
}

/// The colour of a LED.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rgbw {
    /// Red channel.
    pub red: u8,
    /// Green channel.
    pub green: u8,
    /// Blue channel.
    pub blue: u8,
    /// White channel, ignored by RGB strips.
    pub white: u8,
}

impl Rgbw {
    /// Creates a colour without white component.
    #[must_use]
    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self {
            red,
            green,
            blue,
            white: 0,
        }
    }

    /// Converts an HSV colour.
    ///
    /// `hue` is in degrees, `saturation` and `value` in percent.
    /// With `white`, the common part of the three channels is moved to the
    /// white channel.
    #[must_use]
    pub fn from_hsv(hue: f32, saturation: f32, value: f32, white: bool) -> Self {
        let value = value / 100.;
        let chroma = value * saturation / 100.;

        let sector = hue / 60.;
        let distance = sector % 2. - 1.;
        let x = chroma * (1. - if distance < 0. { -distance } else { distance });

        let (red, green, blue) = match sector as u32 % 6 {
            0 => (chroma, x, 0.),
            1 => (x, chroma, 0.),
            2 => (0., chroma, x),
            3 => (0., x, chroma),
            4 => (x, 0., chroma),
            _ => (chroma, 0., x),
        };

        let offset = value - chroma;
        let channel = |c: f32| ((c + offset) * 255. + 0.5) as u8;
        let color = Self::rgb(channel(red), channel(green), channel(blue));

        if white {
            let common = color.red.min(color.green).min(color.blue);
            Self {
                red: color.red - common,
                green: color.green - common,
                blue: color.blue - common,
                white: common,
            }
        } else {
            color
        }
    }
}

/// Encodes colour bytes into the SPI bit stream of a WS2812 LED.
///
/// Every colour byte becomes four SPI bytes, most significant bit first.
pub fn encode(colors: &[u8], out: &mut Vec<u8>) {
    let nibble = |bit: u8| if bit != 0 { BIT_ONE } else { BIT_ZERO };

    for color in colors {
        for shift in [6, 4, 2, 0] {
            let pair = color >> shift;
            out.push((nibble(pair & 0b10) << 4) | nibble(pair & 0b01));
        }
    }
}

#[inline]
const fn scale(channel: u8, brightness: u8) -> u8 {
    ((channel as u16 * (brightness as u16 + 1)) >> 8) as u8
}

/// Parameters of a NeoPixel task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NeoPixelParams {
    /// Number of LEDs.
    pub led_count: u16,
    /// LED layout.
    pub strip: StripKind,
    /// Initial brightness.
    pub brightness: u8,
    /// Upper bound of the brightness.
    pub max_brightness: u8,
}

impl Default for NeoPixelParams {
    fn default() -> Self {
        Self {
            led_count: 1,
            strip: StripKind::Rgb,
            brightness: u8::MAX,
            max_brightness: u8::MAX,
        }
    }
}

/// The state of a NeoPixel task.
#[derive(Debug)]
pub struct NeoPixelTask {
    strip: StripKind,
    pixels: Vec<Rgbw>,
    brightness: u8,
    max_brightness: u8,
    frame: Vec<u8>,
    initialized: bool,
}

impl NeoPixelTask {
    /// Creates a new [`NeoPixelTask`] with all LEDs off.
    ///
    /// The brightness is clamped to `params.max_brightness`.
    #[must_use]
    pub fn new(params: NeoPixelParams) -> Self {
        Self {
            strip: params.strip,
            pixels: vec![Rgbw::default(); usize::from(params.led_count)],
            brightness: params.brightness.min(params.max_brightness),
            max_brightness: params.max_brightness,
            frame: Vec::new(),
            initialized: false,
        }
    }

    /// Returns the colour of a LED, counting from zero.
    #[must_use]
    #[inline]
    pub fn pixel(&self, index: usize) -> Option<Rgbw> {
        self.pixels.get(index).copied()
    }

    /// Returns the current brightness.
    #[must_use]
    #[inline]
    pub const fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Transmits the current colours.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying SPI bus operation fails.
    pub fn show<S: SpiBus>(
        &mut self,
        spi: &mut S,
    ) -> core::result::Result<(), NeoPixelError<S::Error>> {
        self.frame.clear();
        for pixel in &self.pixels {
            let channels = [pixel.green, pixel.red, pixel.blue, pixel.white]
                .map(|channel| scale(channel, self.brightness));
            encode(&channels[..self.strip.channels()], &mut self.frame);
        }
        self.frame.resize(self.frame.len() + LATCH_LEN, 0);

        spi.write(&self.frame)?;
        spi.flush()?;

        Ok(())
    }

    fn led(&self, command: &Command<'_>, index: usize) -> Option<usize> {
        let led: usize = command.arg(index)?;
        (1..=self.pixels.len()).contains(&led).then(|| led - 1)
    }

    fn line(&self, command: &Command<'_>, index: usize) -> Option<RangeInclusive<usize>> {
        let from = self.led(command, index)?;
        let to = self.led(command, index + 1)?;
        (from <= to).then_some(from..=to)
    }

    fn color(&self, command: &Command<'_>, index: usize) -> Option<Rgbw> {
        Some(Rgbw {
            red: command.arg(index)?,
            green: command.arg(index + 1)?,
            blue: command.arg(index + 2)?,
            white: command.optional_arg(index + 3)?.unwrap_or(0),
        })
    }

    fn hsv(&self, command: &Command<'_>, index: usize) -> Option<Rgbw> {
        let hue: f32 = command.arg(index)?;
        let saturation: f32 = command.arg(index + 1)?;
        let value: f32 = command.arg(index + 2)?;

        let percent = 0.0..=100.0;
        if !(0.0..=360.0).contains(&hue)
            || !percent.contains(&saturation)
            || !percent.contains(&value)
        {
            return None;
        }

        Some(Rgbw::from_hsv(
            hue,
            saturation,
            value,
            self.strip == StripKind::Rgbw,
        ))
    }

    fn fill(&mut self, range: RangeInclusive<usize>, color: Rgbw) {
        if let Some(pixels) = self.pixels.get_mut(range) {
            pixels.fill(color);
        }
    }

    // Returns `None` for an unknown or malformed command.
    fn apply(&mut self, command: &Command<'_>) -> Option<()> {
        let all = 0..=self.pixels.len().saturating_sub(1);

        if command.is("neopixel") {
            let led = self.led(command, 0)?;
            let color = self.color(command, 1)?;
            self.fill(led..=led, color);
        } else if command.is("neopixelall") {
            let color = self.color(command, 0)?;
            self.fill(all, color);
        } else if command.is("neopixelline") {
            let line = self.line(command, 0)?;
            let color = self.color(command, 2)?;
            self.fill(line, color);
        } else if command.is("neopixelhsv") {
            let led = self.led(command, 0)?;
            let color = self.hsv(command, 1)?;
            self.fill(led..=led, color);
        } else if command.is("neopixelallhsv") {
            let color = self.hsv(command, 0)?;
            self.fill(all, color);
        } else if command.is("neopixellinehsv") {
            let line = self.line(command, 0)?;
            let color = self.hsv(command, 2)?;
            self.fill(line, color);
        } else if command.is("neopixelbright") {
            let brightness: u8 = command.arg(0)?;
            self.brightness = brightness.min(self.max_brightness);
        } else {
            return None;
        }

        Some(())
    }
}

impl<H: SpiAccess> PluginTask<H> for NeoPixelTask {
    fn init(&mut self, event: TaskEvent<'_, H>) -> bool {
        self.pixels.fill(Rgbw::default());
        match self.show(event.hardware.spi()) {
            Ok(()) => {
                debug!("NeoPixel : {} LEDs initialized", self.pixels.len());
                self.initialized = true;
            }
            Err(e) => error!("NeoPixel : unable to initialize: {e:?}"),
        }
        self.initialized
    }

    fn read(&mut self, _event: TaskEvent<'_, H>) -> bool {
        false
    }

    fn write(&mut self, event: TaskEvent<'_, H>, command: &Command<'_>) -> bool {
        if !self.initialized || self.apply(command).is_none() {
            return false;
        }

        if let Err(e) = self.show(event.hardware.spi()) {
            error!("NeoPixel : `{}` not shown: {e:?}", command.name());
            return false;
        }
        true
    }

    fn exit(&mut self, event: TaskEvent<'_, H>) {
        self.pixels.fill(Rgbw::default());
        if let Err(e) = self.show(event.hardware.spi()) {
            error!("NeoPixel : strip not blanked: {e:?}");
        }
        self.initialized = false;
    }

    fn initialized(&self) -> bool {
        self.initialized
    }
}

/// The NeoPixel plugin.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeoPixelPlugin;

impl<H: SpiAccess> Plugin<H> for NeoPixelPlugin {
    fn id(&self) -> DriverId {
        DRIVER_ID
    }

    fn name(&self) -> &'static str {
        "Output - NeoPixel (Basic)"
    }

    fn instantiate(&self, config: &TaskConfig) -> Result<Box<dyn PluginTask<H>>> {
        let params: NeoPixelParams = config.parameters()?;

        if !(1..=MAX_LEDS).contains(&params.led_count) {
            return Err(Error::new(
                ErrorKind::InvalidParameters,
                format!(
                    "task {}: LED count {} outside 1..={MAX_LEDS}",
                    config.slot, params.led_count
                ),
            ));
        }

        Ok(Box::new(NeoPixelTask::new(params)))
    }
}
