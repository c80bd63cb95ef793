use alloc::borrow::ToOwned;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use serde_json::{Map, Value};

use crate::error::{Error, ErrorKind, Result};
use crate::stream::StreamConfig;

/// Maximum number of task slots.
pub const MAX_TASKS: usize = 32;

// Default interval between two slow calls.
const DEFAULT_INTERVAL_MS: u64 = 60_000;

/// The index of a task slot.
pub type TaskIndex = usize;

/// The identifier of a driver type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(pub u16);

impl core::fmt::Display for DriverId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "P{:03}", self.0)
    }
}

const fn enabled_by_default() -> bool {
    true
}

const fn default_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

/// The configuration of a task slot.
///
/// Written by the settings store, only read by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Slot index.
    pub slot: TaskIndex,
    /// Driver type bound to the slot.
    pub driver: DriverId,
    /// Task name.
    #[serde(default)]
    pub name: String,
    /// Whether the task runs.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Interval between two slow calls, in milliseconds.
    #[serde(default = "default_interval")]
    pub interval_ms: u64,
    /// Configuration revision.
    ///
    /// The settings store bumps it on every edit, the runtime rebuilds the
    /// task instance whenever it changes.
    #[serde(default)]
    pub revision: u32,
    /// Driver-specific parameters.
    #[serde(default)]
    pub params: Value,
}

impl TaskConfig {
    /// Creates an enabled [`TaskConfig`] without parameters.
    #[must_use]
    pub fn new(slot: TaskIndex, driver: DriverId, name: &str) -> Self {
        Self {
            slot,
            driver,
            name: name.to_owned(),
            enabled: true,
            interval_ms: DEFAULT_INTERVAL_MS,
            revision: 0,
            params: Value::Null,
        }
    }

    /// Sets the interval between two slow calls.
    #[must_use]
    pub const fn interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Sets the driver-specific parameters.
    #[must_use]
    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Disables the task.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Deserializes the driver-specific parameters.
    ///
    /// Missing parameters are deserialized from an empty object, so that
    /// defaulted fields still apply.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::InvalidParameters`] when the parameters do
    /// not match the expected shape.
    pub fn parameters<T: DeserializeOwned>(&self) -> Result<T> {
        let params = if self.params.is_null() {
            Value::Object(Map::new())
        } else {
            self.params.clone()
        };

        serde_json::from_value(params).map_err(|e| {
            Error::new(
                ErrorKind::InvalidParameters,
                format!("task {} ({}): {e}", self.slot, self.name),
            )
        })
    }
}

/// Read access to the configured task slots.
pub trait TaskTable {
    /// Returns the configuration of a slot, if any.
    fn task(&self, slot: TaskIndex) -> Option<&TaskConfig>;
}

impl TaskTable for [Option<TaskConfig>] {
    #[inline]
    fn task(&self, slot: TaskIndex) -> Option<&TaskConfig> {
        self.get(slot).and_then(Option::as_ref)
    }
}

const fn default_max_slow_dispatches() -> usize {
    8
}

/// Runtime settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum number of interval-driven dispatches per scheduler pass.
    ///
    /// Zero is treated as one, so tasks always get a chance to come up.
    pub max_slow_dispatches: usize,
    /// Minimum time between two fast polls of the same task.
    ///
    /// Zero polls on every scheduler pass.
    pub fast_poll_interval_ms: u64,
    /// Streaming output settings.
    pub stream: StreamConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_slow_dispatches: default_max_slow_dispatches(),
            fast_poll_interval_ms: 0,
            stream: StreamConfig::new(),
        }
    }
}

#[derive(Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    runtime: RuntimeConfig,
    #[serde(default)]
    tasks: Vec<TaskConfig>,
}

/// The settings store adaptor.
///
/// Holds the runtime settings and one optional [`TaskConfig`] per slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    runtime: RuntimeConfig,
    slots: Vec<Option<TaskConfig>>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Settings {
    /// Creates [`Settings`] without tasks.
    #[must_use]
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            slots: (0..MAX_TASKS).map(|_| None).collect(),
        }
    }

    /// Parses [`Settings`] from a JSON document.
    ///
    /// ```json
    /// {
    ///   "runtime": { "max_slow_dispatches": 4 },
    ///   "tasks": [
    ///     { "slot": 0, "driver": 105, "name": "Climate", "interval_ms": 5000 }
    ///   ]
    /// }
    /// ```
    ///
    /// # Errors
    ///
    /// Fails when the document is malformed, a slot is out of range or two
    /// tasks share a slot.
    pub fn from_json(json: &str) -> Result<Self> {
        let document: SettingsDocument = serde_json::from_str(json)?;

        let mut settings = Self::new(document.runtime);
        for task in document.tasks {
            if settings.task(task.slot).is_some() {
                return Err(Error::new(
                    ErrorKind::InvalidSlot,
                    format!("slot {} configured twice", task.slot),
                ));
            }
            settings.set_task(task)?;
        }

        Ok(settings)
    }

    /// Returns the runtime settings.
    #[must_use]
    #[inline]
    pub const fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    /// Stores a task configuration in its slot.
    ///
    /// Replacing an existing configuration bumps its revision.
    ///
    /// # Errors
    ///
    /// Fails when the slot is out of range.
    pub fn set_task(&mut self, mut task: TaskConfig) -> Result<()> {
        let slot = self.slots.get_mut(task.slot).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidSlot,
                format!("slot {} exceeds {MAX_TASKS} slots", task.slot),
            )
        })?;

        if let Some(previous) = slot {
            task.revision = task.revision.max(previous.revision.wrapping_add(1));
        }
        *slot = Some(task);

        Ok(())
    }

    /// Removes the configuration of a slot.
    pub fn remove_task(&mut self, slot: TaskIndex) -> Option<TaskConfig> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Enables or disables a task.
    ///
    /// Returns `false` when the slot is empty.
    pub fn set_enabled(&mut self, slot: TaskIndex, enabled: bool) -> bool {
        match self.slots.get_mut(slot).and_then(Option::as_mut) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Iterates over all configured tasks.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskConfig> {
        self.slots.iter().flatten()
    }
}

impl TaskTable for Settings {
    #[inline]
    fn task(&self, slot: TaskIndex) -> Option<&TaskConfig> {
        self.slots.task(slot)
    }
}
