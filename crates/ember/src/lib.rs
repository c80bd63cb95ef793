//! `ember` is a runtime for firmware running on memory-constrained
//! microcontrollers without a preemptive operating system.
//!
//! It provides APIs to:
//!
//! - Register a static set of hardware drivers, called plugins, each one
//!   implementing the same non-blocking lifecycle contract
//! - Bind configured tasks to those plugins and keep one owned state object
//!   per task
//! - Run a cooperative scheduler which, on every pass, dispatches the
//!   lifecycle calls that are due and never waits on hardware
//! - Stream responses of unknown length through a fixed-size buffer which is
//!   flushed in chunks and degrades gracefully when free memory runs low
//!
//! Everything runs on a single thread of control. No call blocks: a plugin
//! either completes a small unit of work and returns, or records in its own
//! state that it is still waiting and resumes on a later pass. The only
//! bounded busy-wait in the crate happens while a stream hands a chunk over
//! to its transport.
//!
//! A plugin is free to fail. Bring-up failures are retried at the task
//! interval, stalled protocols are reset by the plugin itself and then
//! reinitialized by the scheduler, and none of those conditions ever
//! escalates beyond the task which produced it.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Monotonic time source and time arithmetic helpers.
pub mod clock;
/// Out-of-band commands delivered to plugins.
pub mod command;
/// Task and runtime configuration.
pub mod config;
/// Error management.
pub mod error;
/// Free-memory sampling and per-stream memory accounting.
pub mod memory;
/// The plugin contract and the plugin registry.
pub mod plugin;
/// Rendering of task values as a streamed JSON document.
pub mod report;
/// The cooperative scheduler.
pub mod scheduler;
/// Per-task instance state storage.
pub mod store;
/// The bounded streaming output channel.
pub mod stream;
/// The contract between a stream and the network layer.
pub mod transport;
/// Values reported by tasks.
pub mod values;

#[cfg(test)]
pub(crate) mod testing;
