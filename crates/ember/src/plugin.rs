use alloc::boxed::Box;
use alloc::format;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;

use crate::command::Command;
use crate::config::{DriverId, TaskConfig, TaskIndex};
use crate::error::{Error, ErrorKind, Result};
use crate::values::{TaskValues, VARS_PER_TASK};

/// The kind of a dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// Hardware bring-up.
    Init,
    /// Non-blocking advance of a hardware protocol.
    FastPoll,
    /// Interval-driven publication of new values.
    Read,
    /// Out-of-band command.
    Write,
    /// Release of driver-held resources.
    Exit,
}

impl CallKind {
    /// Returns the call kind name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::FastPoll => "fast-poll",
            Self::Read => "read",
            Self::Write => "write",
            Self::Exit => "exit",
        }
    }
}

impl core::fmt::Display for CallKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.name().fmt(f)
    }
}

/// The descriptor passed to every dispatch call.
///
/// It lives on the stack of the scheduler for the duration of one call.
pub struct TaskEvent<'a, H> {
    /// Slot of the task.
    pub task: TaskIndex,
    /// Kind of the call.
    pub kind: CallKind,
    /// Current time, in milliseconds.
    pub now_ms: u64,
    /// Configured interval of the task, in milliseconds.
    pub interval_ms: u64,
    /// Exclusive access to the hardware for the duration of the call.
    pub hardware: &'a mut H,
    /// The values published by the task.
    pub values: &'a mut TaskValues,
}

/// The state of one task instance.
///
/// Every call performs a small, bounded unit of work and returns. Waiting
/// on hardware is expressed as a phase revisited on later calls.
///
/// Calls are never issued concurrently: at most one call for any task is
/// in flight at a time.
pub trait PluginTask<H> {
    /// Attempts hardware bring-up.
    ///
    /// Returns `false` when the hardware does not respond. The scheduler
    /// retries on the next due cycle.
    fn init(&mut self, event: TaskEvent<'_, H>) -> bool;

    /// Advances non-blocking protocol steps.
    ///
    /// Returns `true` only when new values became available.
    fn poll_fast(&mut self, _event: TaskEvent<'_, H>) -> bool {
        false
    }

    /// Publishes the latest values into [`TaskEvent::values`].
    ///
    /// Returns `true` when values were published.
    fn read(&mut self, event: TaskEvent<'_, H>) -> bool;

    /// Applies an out-of-band command.
    ///
    /// Returns `false` when the command is unknown, malformed or the driver
    /// is not ready.
    fn write(&mut self, _event: TaskEvent<'_, H>, _command: &Command<'_>) -> bool {
        false
    }

    /// Releases driver-held resources.
    fn exit(&mut self, _event: TaskEvent<'_, H>) {}

    /// Checks whether the driver completed its bring-up.
    ///
    /// Turns `false` again when the driver forces itself back to an
    /// uninitialized phase.
    fn initialized(&self) -> bool;
}

/// A driver type.
///
/// A plugin is registered once and creates one [`PluginTask`] per
/// configured task bound to its [`DriverId`].
pub trait Plugin<H> {
    /// Returns the driver identifier.
    fn id(&self) -> DriverId;

    /// Returns the driver name.
    fn name(&self) -> &'static str;

    /// Returns the names of the values published by every task.
    ///
    /// At most [`VARS_PER_TASK`] names are used.
    fn value_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Checks whether tasks need a fast poll on every scheduler pass.
    fn uses_fast_poll(&self) -> bool {
        false
    }

    /// Creates the state of a task.
    ///
    /// # Errors
    ///
    /// Fails when the driver-specific parameters are malformed.
    fn instantiate(&self, config: &TaskConfig) -> Result<Box<dyn PluginTask<H>>>;

    /// Returns the number of values published by every task.
    #[inline]
    fn value_count(&self) -> usize {
        self.value_names().len().min(VARS_PER_TASK)
    }
}

/// The table of registered plugins.
///
/// Drivers are looked up by their static [`DriverId`].
pub struct PluginRegistry<H> {
    plugins: HashMap<DriverId, Box<dyn Plugin<H>>>,
}

impl<H> Default for PluginRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> PluginRegistry<H> {
    /// Creates an empty [`PluginRegistry`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registers a plugin.
    ///
    /// # Errors
    ///
    /// Fails when a plugin with the same [`DriverId`] is already registered.
    pub fn register<P>(&mut self, plugin: P) -> Result<()>
    where
        P: Plugin<H> + 'static,
    {
        match self.plugins.entry(plugin.id()) {
            Entry::Occupied(entry) => Err(Error::new(
                ErrorKind::DuplicateDriver,
                format!(
                    "{} already registered as `{}`",
                    entry.key(),
                    entry.get().name()
                ),
            )),
            Entry::Vacant(entry) => {
                let _ = entry.insert(Box::new(plugin));
                Ok(())
            }
        }
    }

    /// Registers a plugin, consuming the registry.
    ///
    /// # Errors
    ///
    /// Fails when a plugin with the same [`DriverId`] is already registered.
    pub fn with<P>(mut self, plugin: P) -> Result<Self>
    where
        P: Plugin<H> + 'static,
    {
        self.register(plugin)?;
        Ok(self)
    }

    /// Returns the plugin registered for a [`DriverId`].
    #[must_use]
    #[inline]
    pub fn get(&self, id: DriverId) -> Option<&dyn Plugin<H>> {
        self.plugins.get(&id).map(|plugin| &**plugin)
    }

    /// Returns the number of registered plugins.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Checks whether no plugin is registered.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Creates the state of a task through its plugin.
    ///
    /// # Errors
    ///
    /// Fails when no plugin is registered for the task driver, or when the
    /// plugin rejects the task parameters.
    pub fn instantiate(&self, config: &TaskConfig) -> Result<Box<dyn PluginTask<H>>> {
        let plugin = self.get(config.driver).ok_or_else(|| {
            Error::new(
                ErrorKind::UnknownDriver,
                format!("no plugin for {} (task {})", config.driver, config.slot),
            )
        })?;
        plugin.instantiate(config)
    }
}
