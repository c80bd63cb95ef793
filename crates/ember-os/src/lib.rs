//! `ember-os` runs an `ember` node on a machine with an operating system.
//!
//! It provides:
//!
//! - A monotonic [`clock::HostClock`] backed by the system clock
//! - A synchronous socket writer, so responses are streamed in chunks by
//!   the same bounded output channel used on microcontrollers
//! - Simulated bus devices to exercise drivers without hardware
//! - A single-threaded [`tokio`] loop which ticks the scheduler and answers
//!   `HTTP/1.1` requests in between passes
//!
//! The node never leaves its thread: the scheduler state is neither `Send`
//! nor `Sync`, so the server must run on a current-thread runtime.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Host time source.
pub mod clock;
/// Error management.
pub mod error;
/// Minimal `HTTP/1.1` request parsing.
pub mod http;
/// The node: scheduler, settings and response routing.
pub mod node;
/// The network loop.
pub mod server;
/// Simulated bus devices.
pub mod sim;
/// Synchronous socket output.
pub mod socket;

pub use node::{Node, NodeConfig};
pub use server::serve;
