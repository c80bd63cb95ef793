use embedded_hal::i2c::I2c;
use embedded_hal::spi::SpiBus;

/// Access to the I²C bus of the hardware context.
///
/// The scheduler hands the hardware context to one dispatch call at a time,
/// so a driver holds the bus exclusively for the duration of the call.
pub trait I2cAccess {
    /// The I²C bus type.
    type Bus: I2c;

    /// Returns the I²C bus.
    fn i2c(&mut self) -> &mut Self::Bus;
}

/// Access to the SPI bus of the hardware context.
pub trait SpiAccess {
    /// The SPI bus type.
    type Bus: SpiBus;

    /// Returns the SPI bus.
    fn spi(&mut self) -> &mut Self::Bus;
}
