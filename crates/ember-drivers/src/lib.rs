//! `ember-drivers` is a library crate that provides architecture-agnostic
//! plugins for the `ember` runtime.
//!
//! All drivers are implemented using only the blocking [`embedded-hal`]
//! traits and never wait on hardware: every multi-step protocol is an
//! explicit phase machine advanced one step per dispatch call.
//!
//! Drivers reach their bus through the hardware context passed by the
//! scheduler, which implements the traits of the [`bus`] module.
//!
//! [`embedded-hal`]: https://crates.io/crates/embedded-hal

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// The `AHTx` humidity and temperature sensor plugin.
#[cfg(feature = "ahtx")]
pub mod ahtx;

/// Bus access traits.
pub mod bus;

/// The `NeoPixel` LED strip plugin.
#[cfg(feature = "neopixel")]
pub mod neopixel;

use ember::error::Result;
use ember::plugin::PluginRegistry;

/// Registers every plugin enabled through cargo features.
///
/// # Errors
///
/// Fails when one of the driver identifiers is already registered.
#[allow(unused_variables)]
pub fn register_all<H>(registry: &mut PluginRegistry<H>) -> Result<()>
where
    H: bus::I2cAccess + bus::SpiAccess,
{
    #[cfg(feature = "ahtx")]
    registry.register(ahtx::AhtxPlugin)?;

    #[cfg(feature = "neopixel")]
    registry.register(neopixel::NeoPixelPlugin)?;

    Ok(())
}
