use alloc::vec::Vec;

use log::{debug, error, info, warn};

use serde::Serialize;

use crate::clock::{time_passed_since, timeout_reached};
use crate::command::Command;
use crate::config::{DriverId, MAX_TASKS, RuntimeConfig, TaskConfig, TaskIndex, TaskTable};
use crate::memory::AllocationCounter;
use crate::plugin::{CallKind, PluginRegistry, TaskEvent};
use crate::store::InstanceStore;
use crate::values::TaskValues;

/// Lifecycle counters of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Successful hardware bring-ups.
    pub init_ok: u32,
    /// Failed hardware bring-ups.
    pub init_failed: u32,
    /// Times the driver fell back to an uninitialized phase.
    pub resets: u32,
    /// Published value sets.
    pub reads: u32,
}

/// The outcome of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Number of dispatch calls issued.
    pub dispatched: usize,
    updated: u32,
}

impl PassSummary {
    /// Checks whether a task published new values during the pass.
    #[must_use]
    #[inline]
    pub const fn is_updated(&self, slot: TaskIndex) -> bool {
        slot < MAX_TASKS && self.updated & (1 << slot) != 0
    }

    /// Checks whether any task published new values during the pass.
    #[must_use]
    #[inline]
    pub const fn has_updates(&self) -> bool {
        self.updated != 0
    }

    /// Iterates over the tasks which published new values during the pass.
    pub fn updated(&self) -> impl Iterator<Item = TaskIndex> + '_ {
        (0..MAX_TASKS).filter(|slot| self.is_updated(*slot))
    }

    fn mark_updated(&mut self, slot: TaskIndex) {
        self.updated |= 1 << slot;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotState {
    next_due: u64,
    last_fast_poll: Option<u64>,
    was_initialized: bool,
    values: TaskValues,
    stats: TaskStats,
    // Configuration which failed to instantiate, skipped until edited.
    rejected: Option<(DriverId, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct SlowEvent {
    due: u64,
    slot: TaskIndex,
    kind: CallKind,
}

/// The cooperative scheduler.
///
/// On every pass, the scheduler brings the instance store in line with the
/// task table, then issues the dispatch calls which are due:
///
/// - Slow calls, gated by the task interval: a bring-up for tasks which are
///   not initialized, a read for the others. They are ordered by deadline,
///   ties broken by slot, and at most
///   [`RuntimeConfig::max_slow_dispatches`] are issued per pass.
/// - Fast polls, issued in slot order to every initialized task whose
///   plugin asks for them.
///
/// A pass never waits on hardware. All calls run to completion on the
/// caller's thread, one after the other, so two calls for the same task are
/// never in flight at the same time.
pub struct Scheduler<H> {
    hardware: H,
    registry: PluginRegistry<H>,
    store: InstanceStore<H>,
    config: RuntimeConfig,
    slots: Vec<SlotState>,
    // Slow events of the current pass, allocated once.
    due: Vec<SlowEvent>,
}

impl<H> Scheduler<H> {
    /// Creates a [`Scheduler`].
    #[must_use]
    pub fn new(hardware: H, registry: PluginRegistry<H>, config: RuntimeConfig) -> Self {
        Self {
            hardware,
            registry,
            store: InstanceStore::new(),
            config,
            slots: (0..MAX_TASKS).map(|_| SlotState::default()).collect(),
            due: Vec::with_capacity(MAX_TASKS),
        }
    }

    /// Charges the size of every task state to an [`AllocationCounter`].
    #[must_use]
    pub fn with_counter(mut self, counter: AllocationCounter) -> Self {
        self.store = self.store.with_counter(counter);
        self
    }

    /// Runs one scheduler pass.
    pub fn tick<T>(&mut self, now_ms: u64, table: &T) -> PassSummary
    where
        T: TaskTable + ?Sized,
    {
        let mut summary = PassSummary::default();

        self.reconcile(now_ms, table, &mut summary);

        let mut due = core::mem::take(&mut self.due);
        self.collect_slow_events(now_ms, table, &mut due);
        for event in &due {
            let Some(config) = table.task(event.slot) else {
                continue;
            };
            match event.kind {
                CallKind::Init => self.dispatch_init(now_ms, config),
                _ => self.dispatch_read(now_ms, config, &mut summary),
            }
            summary.dispatched += 1;
        }
        due.clear();
        self.due = due;

        self.dispatch_fast_polls(now_ms, table, &mut summary);

        summary
    }

    /// Issues an out-of-band write call to a task.
    ///
    /// Returns `false` when the task has no live instance or the plugin
    /// rejects the command.
    pub fn write<T>(
        &mut self,
        now_ms: u64,
        slot: TaskIndex,
        command: &Command<'_>,
        table: &T,
    ) -> bool
    where
        T: TaskTable + ?Sized,
    {
        let Some(config) = table.task(slot).filter(|config| config.enabled) else {
            return false;
        };
        if !self.store.matches(slot, config.driver, config.revision) {
            return false;
        }

        let (Some(instance), Some(state)) = (self.store.get_mut(slot), self.slots.get_mut(slot))
        else {
            return false;
        };

        let event = TaskEvent {
            task: slot,
            kind: CallKind::Write,
            now_ms,
            interval_ms: config.interval_ms,
            hardware: &mut self.hardware,
            values: &mut state.values,
        };
        let applied = instance.task_mut().write(event, command);
        if !applied {
            debug!("Task {slot}: command `{}` rejected", command.name());
        }
        applied
    }

    /// Exits and drops every task instance.
    pub fn shutdown(&mut self, now_ms: u64) {
        let occupied: Vec<TaskIndex> = self.store.occupied().collect();
        for slot in occupied {
            self.teardown(now_ms, slot, 0);
        }
    }

    /// Returns the last published values of a task.
    #[must_use]
    pub fn values(&self, slot: TaskIndex) -> Option<&TaskValues> {
        self.store
            .get(slot)
            .and_then(|_| self.slots.get(slot))
            .map(|state| &state.values)
    }

    /// Returns the value names of a task.
    #[must_use]
    pub fn value_names(&self, slot: TaskIndex) -> Option<&'static [&'static str]> {
        let driver = self.store.get(slot)?.driver();
        self.registry.get(driver).map(|plugin| plugin.value_names())
    }

    /// Returns the lifecycle counters of a task.
    #[must_use]
    pub fn stats(&self, slot: TaskIndex) -> Option<&TaskStats> {
        self.slots.get(slot).map(|state| &state.stats)
    }

    /// Checks whether a task has a live, initialized instance.
    #[must_use]
    pub fn is_initialized(&self, slot: TaskIndex) -> bool {
        self.store
            .get(slot)
            .is_some_and(|instance| instance.task().initialized())
    }

    /// Returns the hardware context.
    #[must_use]
    #[inline]
    pub const fn hardware(&self) -> &H {
        &self.hardware
    }

    /// Returns the hardware context mutably.
    #[inline]
    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Returns the plugin registry.
    #[must_use]
    #[inline]
    pub const fn registry(&self) -> &PluginRegistry<H> {
        &self.registry
    }

    /// Returns the task instance store.
    #[must_use]
    #[inline]
    pub const fn store(&self) -> &InstanceStore<H> {
        &self.store
    }

    /// Returns the runtime settings.
    #[must_use]
    #[inline]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn reconcile<T>(&mut self, now_ms: u64, table: &T, summary: &mut PassSummary)
    where
        T: TaskTable + ?Sized,
    {
        for slot in 0..MAX_TASKS {
            let config = table.task(slot).filter(|config| config.enabled);

            if let Some(instance) = self.store.get(slot) {
                let stale = config.is_none_or(|config| {
                    instance.driver() != config.driver || instance.revision() != config.revision
                });
                if !stale {
                    continue;
                }
                let interval_ms = config.map_or(0, |config| config.interval_ms);
                self.teardown(now_ms, slot, interval_ms);
                summary.dispatched += 1;
            }

            if let Some(config) = config {
                self.build(now_ms, config);
            }
        }
    }

    fn build(&mut self, now_ms: u64, config: &TaskConfig) {
        let slot = config.slot;
        let Some(state) = self.slots.get_mut(slot) else {
            return;
        };
        if state.rejected == Some((config.driver, config.revision)) {
            return;
        }

        match self.registry.instantiate(config) {
            Ok(task) => {
                let value_count = self
                    .registry
                    .get(config.driver)
                    .map_or(0, |plugin| plugin.value_count());
                *state = SlotState {
                    next_due: now_ms,
                    values: TaskValues::new(value_count),
                    ..SlotState::default()
                };
                self.store
                    .insert(slot, config.driver, config.revision, task);
                debug!("Task {slot}: instance of {} created", config.driver);
            }
            Err(e) => {
                error!("Task {slot}: {e}");
                state.rejected = Some((config.driver, config.revision));
            }
        }
    }

    fn teardown(&mut self, now_ms: u64, slot: TaskIndex, interval_ms: u64) {
        let (Some(mut instance), Some(state)) = (self.store.remove(slot), self.slots.get_mut(slot))
        else {
            return;
        };

        let event = TaskEvent {
            task: slot,
            kind: CallKind::Exit,
            now_ms,
            interval_ms,
            hardware: &mut self.hardware,
            values: &mut state.values,
        };
        instance.task_mut().exit(event);
        *state = SlotState::default();

        debug!("Task {slot}: instance of {} dropped", instance.driver());
    }

    // At most one event per slot, so `events` never grows past `MAX_TASKS`.
    fn collect_slow_events<T>(&mut self, now_ms: u64, table: &T, events: &mut Vec<SlowEvent>)
    where
        T: TaskTable + ?Sized,
    {
        events.clear();

        for slot in self.store.occupied() {
            let (Some(instance), Some(state)) = (self.store.get(slot), self.slots.get_mut(slot))
            else {
                continue;
            };
            if table.task(slot).is_none() {
                continue;
            }

            let initialized = instance.task().initialized();
            if state.was_initialized && !initialized {
                state.was_initialized = false;
                state.stats.resets += 1;
                state.next_due = now_ms;
                warn!("Task {slot}: driver reset, reinitializing");
            }

            if !timeout_reached(now_ms, state.next_due) {
                continue;
            }

            events.push(SlowEvent {
                due: state.next_due,
                slot,
                kind: if initialized {
                    CallKind::Read
                } else {
                    CallKind::Init
                },
            });
        }

        events.sort_unstable_by_key(|event| (event.due, event.slot));
        events.truncate(self.config.max_slow_dispatches.max(1));
    }

    fn dispatch_init(&mut self, now_ms: u64, config: &TaskConfig) {
        let slot = config.slot;
        let (Some(instance), Some(state)) = (self.store.get_mut(slot), self.slots.get_mut(slot))
        else {
            return;
        };

        let event = TaskEvent {
            task: slot,
            kind: CallKind::Init,
            now_ms,
            interval_ms: config.interval_ms,
            hardware: &mut self.hardware,
            values: &mut state.values,
        };

        if instance.task_mut().init(event) {
            state.was_initialized = true;
            state.last_fast_poll = None;
            state.stats.init_ok += 1;
            state.next_due = now_ms;
            info!("Task {slot}: {} initialized", config.name);
        } else {
            state.stats.init_failed += 1;
            state.next_due = now_ms.saturating_add(config.interval_ms);
            error!(
                "Task {slot}: {} initialization failed, retrying in {} ms",
                config.name, config.interval_ms
            );
        }
    }

    fn dispatch_read(&mut self, now_ms: u64, config: &TaskConfig, summary: &mut PassSummary) {
        let slot = config.slot;
        let (Some(instance), Some(state)) = (self.store.get_mut(slot), self.slots.get_mut(slot))
        else {
            return;
        };

        let event = TaskEvent {
            task: slot,
            kind: CallKind::Read,
            now_ms,
            interval_ms: config.interval_ms,
            hardware: &mut self.hardware,
            values: &mut state.values,
        };

        if instance.task_mut().read(event) {
            state.stats.reads += 1;
            summary.mark_updated(slot);
        }
        state.next_due = now_ms.saturating_add(config.interval_ms);
    }

    fn dispatch_fast_polls<T>(&mut self, now_ms: u64, table: &T, summary: &mut PassSummary)
    where
        T: TaskTable + ?Sized,
    {
        let fast_poll_interval = self.config.fast_poll_interval_ms;

        for slot in 0..MAX_TASKS {
            let Some(config) = table.task(slot) else {
                continue;
            };
            let (Some(instance), Some(state)) =
                (self.store.get_mut(slot), self.slots.get_mut(slot))
            else {
                continue;
            };

            let fast = self
                .registry
                .get(instance.driver())
                .is_some_and(|plugin| plugin.uses_fast_poll());
            if !fast || !instance.task().initialized() {
                continue;
            }
            if state
                .last_fast_poll
                .is_some_and(|last| time_passed_since(now_ms, last) < fast_poll_interval)
            {
                continue;
            }

            let event = TaskEvent {
                task: slot,
                kind: CallKind::FastPoll,
                now_ms,
                interval_ms: config.interval_ms,
                hardware: &mut self.hardware,
                values: &mut state.values,
            };

            state.last_fast_poll = Some(now_ms);
            summary.dispatched += 1;
            if instance.task_mut().poll_fast(event) {
                state.next_due = now_ms;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use crate::command::Command;
    use crate::config::{DriverId, MAX_TASKS, RuntimeConfig, Settings, TaskConfig};
    use crate::memory::AllocationCounter;
    use crate::plugin::{CallKind, PluginRegistry};
    use crate::testing::{Call, CallLog, RecordingPlugin};

    use super::Scheduler;

    const SLOW: DriverId = DriverId(1);
    const FAST: DriverId = DriverId(2);

    fn scheduler(log: &CallLog, config: RuntimeConfig) -> Scheduler<()> {
        let registry = PluginRegistry::new()
            .with(RecordingPlugin::new(SLOW, log))
            .unwrap()
            .with(RecordingPlugin::new(FAST, log).fast())
            .unwrap();
        Scheduler::new((), registry, config)
    }

    fn settings(tasks: &[TaskConfig]) -> Settings {
        let mut settings = Settings::default();
        for task in tasks {
            settings.set_task(task.clone()).unwrap();
        }
        settings
    }

    #[test]
    fn test_init_then_read() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[TaskConfig::new(0, SLOW, "Slow").interval(1000)]);

        let summary = scheduler.tick(0, &table);
        assert_eq!(summary.dispatched, 1);
        assert!(!summary.has_updates());
        assert!(scheduler.is_initialized(0));

        let summary = scheduler.tick(10, &table);
        assert!(summary.is_updated(0));
        assert_eq!(summary.updated().collect::<Vec<_>>(), [0]);
        assert_eq!(scheduler.values(0).unwrap().get(0), Some(1.));

        // Not due before the interval elapses.
        assert_eq!(scheduler.tick(500, &table).dispatched, 0);
        assert!(scheduler.tick(1010, &table).is_updated(0));

        assert_eq!(
            log.kinds(0),
            [CallKind::Init, CallKind::Read, CallKind::Read]
        );
        assert_eq!(
            log.calls().last(),
            Some(&Call {
                task: 0,
                kind: CallKind::Read,
                now: 1010
            })
        );
        assert_eq!(scheduler.stats(0).unwrap().reads, 2);
        assert_eq!(scheduler.value_names(0), Some(&["Count"][..]));
    }

    #[test]
    fn test_init_failure_retried_at_interval() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[TaskConfig::new(0, SLOW, "Slow").interval(1000)]);

        log.fail_init(true);
        let _ = scheduler.tick(0, &table);
        assert!(!scheduler.is_initialized(0));

        assert_eq!(scheduler.tick(999, &table).dispatched, 0);

        log.fail_init(false);
        let _ = scheduler.tick(1000, &table);
        assert!(scheduler.is_initialized(0));

        assert_eq!(log.kinds(0), [CallKind::Init, CallKind::Init]);

        let stats = scheduler.stats(0).unwrap();
        assert_eq!(stats.init_failed, 1);
        assert_eq!(stats.init_ok, 1);
    }

    #[test]
    fn test_init_before_measurement_after_reset() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[TaskConfig::new(0, FAST, "Fast").interval(1000)]);

        let _ = scheduler.tick(0, &table);
        let _ = scheduler.tick(10, &table);
        log.clear();

        // The driver falls back to its uninitialized phase during a fast poll.
        log.force_reset(0);
        let _ = scheduler.tick(20, &table);
        assert!(!scheduler.is_initialized(0));

        let _ = scheduler.tick(30, &table);
        let _ = scheduler.tick(40, &table);

        assert_eq!(
            log.kinds(0),
            [
                CallKind::FastPoll,
                CallKind::Init,
                CallKind::FastPoll,
                CallKind::Read,
                CallKind::FastPoll
            ]
        );
        assert_eq!(scheduler.stats(0).unwrap().resets, 1);
    }

    #[test]
    fn test_deadline_then_slot_ordering() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let mut table = settings(&[
            TaskConfig::new(4, SLOW, "A").interval(300),
            TaskConfig::new(1, SLOW, "B").interval(100),
            TaskConfig::new(2, SLOW, "C").interval(300),
        ]);

        let _ = scheduler.tick(0, &table);
        assert_eq!(
            log.calls().iter().map(|call| call.task).collect::<Vec<_>>(),
            [1, 2, 4]
        );

        // Reads at 10, then slot 1 is due again at 110, the others at 310.
        let _ = scheduler.tick(10, &table);
        log.clear();

        let _ = scheduler.tick(400, &table);
        assert_eq!(
            log.calls().iter().map(|call| call.task).collect::<Vec<_>>(),
            [1, 2, 4]
        );

        // Slot 1 is rebuilt and due at 800, slots 2 and 4 are due since 700.
        table
            .set_task(TaskConfig::new(1, SLOW, "B").interval(100))
            .unwrap();
        log.clear();
        let _ = scheduler.tick(800, &table);
        assert_eq!(
            log.calls()
                .iter()
                .map(|call| (call.task, call.kind))
                .collect::<Vec<_>>(),
            [
                (1, CallKind::Exit),
                (2, CallKind::Read),
                (4, CallKind::Read),
                (1, CallKind::Init)
            ]
        );
    }

    #[test]
    fn test_earliest_deadline_first() {
        let log = CallLog::new();
        let config = RuntimeConfig {
            max_slow_dispatches: 1,
            ..RuntimeConfig::default()
        };
        let mut scheduler = scheduler(&log, config);
        let table = settings(&[
            TaskConfig::new(0, SLOW, "A").interval(1000),
            TaskConfig::new(5, SLOW, "B").interval(100),
        ]);

        // Both tasks are due since 0: the slot breaks the tie.
        let _ = scheduler.tick(0, &table);
        let _ = scheduler.tick(1, &table);
        assert_eq!(log.kinds(0), [CallKind::Init, CallKind::Read]);
        assert!(log.kinds(5).is_empty());

        let _ = scheduler.tick(2, &table);
        let _ = scheduler.tick(3, &table);
        assert_eq!(log.kinds(5), [CallKind::Init, CallKind::Read]);
        log.clear();

        // Slot 0 is due since 1001, slot 5 since 103.
        let _ = scheduler.tick(2000, &table);
        assert_eq!(log.kinds(5), [CallKind::Read]);
        assert!(log.kinds(0).is_empty());
    }

    #[test]
    fn test_dispatch_cap() {
        let log = CallLog::new();
        let config = RuntimeConfig {
            max_slow_dispatches: 2,
            ..RuntimeConfig::default()
        };
        let mut scheduler = scheduler(&log, config);
        let tasks: Vec<TaskConfig> = (0..5)
            .map(|slot| TaskConfig::new(slot, SLOW, "Slow").interval(1000))
            .collect();
        let table = settings(&tasks);

        for now in 0..4 {
            assert_eq!(scheduler.tick(now, &table).dispatched, 2);
        }

        let inits: Vec<usize> = log
            .calls()
            .iter()
            .filter(|call| call.kind == CallKind::Init)
            .map(|call| call.task)
            .collect();
        assert_eq!(inits, [0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_dispatch_cap_still_dispatches() {
        let log = CallLog::new();
        let config = RuntimeConfig {
            max_slow_dispatches: 0,
            ..RuntimeConfig::default()
        };
        let mut scheduler = scheduler(&log, config);
        let table = settings(&[
            TaskConfig::new(0, SLOW, "A").interval(1000),
            TaskConfig::new(1, SLOW, "B").interval(1000),
        ]);

        // Slot 0 comes up, is read once, then slot 1 comes up.
        for now in 0..3 {
            assert_eq!(scheduler.tick(now, &table).dispatched, 1);
        }
        assert_eq!(log.kinds(0), [CallKind::Init, CallKind::Read]);
        assert_eq!(log.kinds(1), [CallKind::Init]);
        assert!(scheduler.is_initialized(0));
        assert!(scheduler.is_initialized(1));
    }

    #[test]
    fn test_slow_events_buffer_reused() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let tasks: Vec<TaskConfig> = (0..MAX_TASKS)
            .map(|slot| TaskConfig::new(slot, SLOW, "Slow").interval(10))
            .collect();
        let table = settings(&tasks);

        for now in (0..200).step_by(10) {
            let _ = scheduler.tick(now, &table);
            assert!(scheduler.due.is_empty());
            assert_eq!(scheduler.due.capacity(), MAX_TASKS);
        }
        assert!((0..MAX_TASKS).all(|slot| scheduler.is_initialized(slot)));
    }

    #[test]
    fn test_fast_poll_every_pass() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[
            TaskConfig::new(0, FAST, "Fast").interval(60_000),
            TaskConfig::new(1, SLOW, "Slow").interval(60_000),
        ]);

        let _ = scheduler.tick(0, &table);
        let _ = scheduler.tick(1, &table);
        log.clear();

        for now in 2..6 {
            let _ = scheduler.tick(now, &table);
        }

        assert_eq!(log.kinds(0), vec![CallKind::FastPoll; 4]);
        assert!(log.kinds(1).is_empty());
    }

    #[test]
    fn test_fast_poll_interval() {
        let log = CallLog::new();
        let config = RuntimeConfig {
            fast_poll_interval_ms: 50,
            ..RuntimeConfig::default()
        };
        let mut scheduler = scheduler(&log, config);
        let table = settings(&[TaskConfig::new(0, FAST, "Fast").interval(60_000)]);

        let _ = scheduler.tick(0, &table);
        let _ = scheduler.tick(1, &table);
        log.clear();

        for now in (10..=100).step_by(10) {
            let _ = scheduler.tick(now, &table);
        }

        assert_eq!(
            log.calls().iter().map(|call| call.now).collect::<Vec<_>>(),
            [50, 100]
        );
    }

    #[test]
    fn test_fresh_values_read_promptly() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[TaskConfig::new(0, FAST, "Fast").interval(60_000)]);

        let _ = scheduler.tick(0, &table);
        let _ = scheduler.tick(1, &table);
        log.clear();

        log.fresh_values(true);
        let _ = scheduler.tick(2, &table);
        log.fresh_values(false);
        let summary = scheduler.tick(3, &table);

        assert!(summary.is_updated(0));
        assert_eq!(
            log.kinds(0),
            [CallKind::FastPoll, CallKind::Read, CallKind::FastPoll]
        );
    }

    #[test]
    fn test_reconfiguration_rebuilds_instance() {
        let log = CallLog::new();
        let counter = AllocationCounter::new(4096);
        let mut scheduler =
            scheduler(&log, RuntimeConfig::default()).with_counter(counter.clone());
        let mut table = settings(&[TaskConfig::new(3, SLOW, "Slow").interval(1000)]);

        let _ = scheduler.tick(0, &table);
        let _ = scheduler.tick(1, &table);
        assert_eq!(scheduler.values(3).unwrap().get(0), Some(1.));
        assert!(counter.reserved() > 0);

        table
            .set_task(TaskConfig::new(3, SLOW, "Slow").interval(500))
            .unwrap();
        log.clear();
        let _ = scheduler.tick(2, &table);

        assert_eq!(log.kinds(3), [CallKind::Exit, CallKind::Init]);
        assert_eq!(scheduler.values(3).unwrap().get(0), Some(0.));
        assert_eq!(scheduler.stats(3).unwrap().init_ok, 1);
        assert_eq!(scheduler.stats(3).unwrap().reads, 0);

        // A changed driver rebuilds the instance too.
        table
            .set_task(TaskConfig::new(3, FAST, "Fast").interval(500))
            .unwrap();
        log.clear();
        let _ = scheduler.tick(3, &table);
        assert_eq!(log.kinds(3)[..2], [CallKind::Exit, CallKind::Init]);
        assert_eq!(scheduler.store().get(3).unwrap().driver(), FAST);
        assert_eq!(scheduler.store().len(), 1);
    }

    #[test]
    fn test_disabled_and_removed_tasks() {
        let log = CallLog::new();
        let counter = AllocationCounter::new(4096);
        let mut scheduler =
            scheduler(&log, RuntimeConfig::default()).with_counter(counter.clone());
        let mut table = settings(&[
            TaskConfig::new(0, SLOW, "A").interval(1000),
            TaskConfig::new(1, SLOW, "B").interval(1000).disabled(),
        ]);

        let _ = scheduler.tick(0, &table);
        assert!(log.kinds(1).is_empty());
        assert!(scheduler.values(1).is_none());

        assert!(table.set_enabled(0, false));
        log.clear();
        let _ = scheduler.tick(1, &table);
        assert_eq!(log.kinds(0), [CallKind::Exit]);
        assert!(scheduler.store().is_empty());
        assert_eq!(counter.reserved(), 0);

        let _ = table.remove_task(0);
        log.clear();
        assert_eq!(scheduler.tick(2, &table).dispatched, 0);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_unknown_driver_skipped() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[
            TaskConfig::new(0, DriverId(99), "Unknown"),
            TaskConfig::new(1, SLOW, "Known"),
        ]);

        let summary = scheduler.tick(0, &table);
        assert_eq!(summary.dispatched, 1);
        assert!(scheduler.store().get(0).is_none());
        assert!(scheduler.is_initialized(1));
        assert_eq!(scheduler.registry().len(), 2);
    }

    #[test]
    fn test_write_dispatch() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let table = settings(&[
            TaskConfig::new(0, SLOW, "A"),
            TaskConfig::new(1, SLOW, "B").disabled(),
        ]);

        let set = Command::parse("set,42.5").unwrap();
        let unknown = Command::parse("blink,1").unwrap();

        // No instance before the first pass.
        assert!(!scheduler.write(0, 0, &set, &table));

        let _ = scheduler.tick(0, &table);
        assert!(scheduler.write(1, 0, &set, &table));
        assert_eq!(scheduler.values(0).unwrap().get(0), Some(42.5));

        assert!(!scheduler.write(2, 0, &unknown, &table));
        assert!(!scheduler.write(3, 1, &set, &table));
        assert!(!scheduler.write(4, 7, &set, &table));

        assert_eq!(
            log.kinds(0),
            [CallKind::Init, CallKind::Write, CallKind::Write]
        );
    }

    #[test]
    fn test_sequential_calls() {
        let log = CallLog::new();
        let mut scheduler = scheduler(&log, RuntimeConfig::default());
        let tasks: Vec<TaskConfig> = (0..8)
            .map(|slot| {
                let driver = if slot % 2 == 0 { FAST } else { SLOW };
                TaskConfig::new(slot, driver, "Task").interval(20)
            })
            .collect();
        let table = settings(&tasks);

        log.fresh_values(true);
        for now in 0..200 {
            let _ = scheduler.tick(now, &table);
        }
        scheduler.shutdown(200);

        // Every call is recorded on entry and panics when another one is
        // still in flight.
        let calls = log.calls();
        assert!(calls.windows(2).all(|pair| pair[0].now <= pair[1].now));
        assert_eq!(
            calls.iter().filter(|call| call.kind == CallKind::Exit).count(),
            8
        );
        assert!(scheduler.store().is_empty());
        assert_eq!(scheduler.config().max_slow_dispatches, 8);
    }
}
