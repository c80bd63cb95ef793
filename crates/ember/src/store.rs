use alloc::boxed::Box;
use alloc::vec::Vec;

use log::debug;

use crate::config::{DriverId, MAX_TASKS, TaskIndex};
use crate::memory::AllocationCounter;
use crate::plugin::PluginTask;

/// A live task instance.
pub struct Instance<H> {
    driver: DriverId,
    revision: u32,
    footprint: usize,
    task: Box<dyn PluginTask<H>>,
}

impl<H> Instance<H> {
    /// Returns the driver the instance was built for.
    #[must_use]
    #[inline]
    pub const fn driver(&self) -> DriverId {
        self.driver
    }

    /// Returns the configuration revision the instance was built from.
    #[must_use]
    #[inline]
    pub const fn revision(&self) -> u32 {
        self.revision
    }

    /// Returns the size of the instance state, in bytes.
    #[must_use]
    #[inline]
    pub const fn footprint(&self) -> usize {
        self.footprint
    }

    /// Returns the instance state.
    #[inline]
    pub fn task(&self) -> &dyn PluginTask<H> {
        &*self.task
    }

    /// Returns the instance state mutably.
    #[inline]
    pub fn task_mut(&mut self) -> &mut dyn PluginTask<H> {
        &mut *self.task
    }
}

/// The task instance store.
///
/// An arena indexed by slot, holding at most one owned state object per
/// task. States are only built and dropped through the store, so their
/// sizes can be charged to an [`AllocationCounter`].
pub struct InstanceStore<H> {
    slots: Vec<Option<Instance<H>>>,
    counter: Option<AllocationCounter>,
}

impl<H> Default for InstanceStore<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> InstanceStore<H> {
    /// Creates an empty [`InstanceStore`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_TASKS).map(|_| None).collect(),
            counter: None,
        }
    }

    /// Charges the size of every stored state to an [`AllocationCounter`].
    #[must_use]
    pub fn with_counter(mut self, counter: AllocationCounter) -> Self {
        let reserved: usize = self.slots.iter().flatten().map(Instance::footprint).sum();
        counter.reserve(reserved);
        self.counter = Some(counter);
        self
    }

    /// Stores the state of a task, dropping the previous one.
    ///
    /// Out-of-range slots are ignored.
    pub fn insert(
        &mut self,
        slot: TaskIndex,
        driver: DriverId,
        revision: u32,
        task: Box<dyn PluginTask<H>>,
    ) {
        let _ = self.remove(slot);

        let Some(entry) = self.slots.get_mut(slot) else {
            return;
        };

        let footprint = core::mem::size_of_val(&*task);
        if let Some(counter) = &self.counter {
            counter.reserve(footprint);
        }
        debug!("Task {slot}: {footprint} bytes of state for {driver}");

        *entry = Some(Instance {
            driver,
            revision,
            footprint,
            task,
        });
    }

    /// Removes the state of a task.
    pub fn remove(&mut self, slot: TaskIndex) -> Option<Instance<H>> {
        let instance = self.slots.get_mut(slot).and_then(Option::take)?;
        if let Some(counter) = &self.counter {
            counter.release(instance.footprint);
        }
        Some(instance)
    }

    /// Returns the instance of a task.
    #[must_use]
    #[inline]
    pub fn get(&self, slot: TaskIndex) -> Option<&Instance<H>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Returns the instance of a task mutably.
    #[inline]
    pub fn get_mut(&mut self, slot: TaskIndex) -> Option<&mut Instance<H>> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    /// Checks whether the stored instance was built from the given driver
    /// and revision.
    #[must_use]
    pub fn matches(&self, slot: TaskIndex, driver: DriverId, revision: u32) -> bool {
        self.get(slot)
            .is_some_and(|instance| instance.driver == driver && instance.revision == revision)
    }

    /// Returns the number of stored instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Checks whether the store holds no instance.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Iterates over the slots holding an instance.
    pub fn occupied(&self) -> impl Iterator<Item = TaskIndex> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, instance)| instance.as_ref().map(|_| slot))
    }
}
