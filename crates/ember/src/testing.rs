// Test doubles shared by the unit tests of this crate.

use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use core::cell::{Cell, RefCell};

use crate::clock::Clock;
use crate::command::Command;
use crate::config::{DriverId, TaskConfig, TaskIndex};
use crate::error;
use crate::plugin::{CallKind, Plugin, PluginTask, TaskEvent};
use crate::transport::{ContentKind, ResponseHeader, Transport};

pub(crate) struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    pub(crate) const fn new() -> Self {
        Self { now: Cell::new(0) }
    }

    pub(crate) fn now(&self) -> u64 {
        self.now.get()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn pause_ms(&self, ms: u32) {
        self.now.set(self.now.get() + u64::from(ms));
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedHeader {
    pub(crate) status: u16,
    pub(crate) content_kind: ContentKind,
    pub(crate) cacheable: bool,
    pub(crate) cors_origin: Option<String>,
}

pub(crate) struct RecordingTransport {
    pub(crate) header: Option<RecordedHeader>,
    pub(crate) chunks: Vec<Vec<u8>>,
    pub(crate) terminators: usize,
    pub(crate) fallback: Option<String>,
    pub(crate) headroom: usize,
    // Number of chunks accepted before every send fails.
    pub(crate) fail_after: Option<usize>,
}

impl RecordingTransport {
    pub(crate) const fn new() -> Self {
        Self {
            header: None,
            chunks: Vec::new(),
            terminators: 0,
            fallback: None,
            headroom: usize::MAX,
            fail_after: None,
        }
    }

    pub(crate) fn body(&self) -> String {
        String::from_utf8(self.chunks.concat()).unwrap()
    }

    fn check(&self) -> Result<(), &'static str> {
        match self.fail_after {
            Some(limit) if self.chunks.len() >= limit => Err("connection reset"),
            _ => Ok(()),
        }
    }
}

impl Transport for RecordingTransport {
    type Error = &'static str;

    fn send_header(&mut self, header: &ResponseHeader<'_>) -> Result<(), Self::Error> {
        self.header = Some(RecordedHeader {
            status: header.status,
            content_kind: header.content_kind,
            cacheable: header.cacheable,
            cors_origin: header.cors_origin.map(ToString::to_string),
        });
        Ok(())
    }

    fn send_chunk(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.check()?;
        self.chunks.push(data.to_vec());
        Ok(())
    }

    fn send_terminator(&mut self) -> Result<(), Self::Error> {
        self.check()?;
        self.terminators += 1;
        Ok(())
    }

    fn send_fallback(
        &mut self,
        _status: u16,
        _content_kind: ContentKind,
        body: &str,
    ) -> Result<(), Self::Error> {
        self.fallback = Some(body.to_string());
        Ok(())
    }

    fn headroom(&self) -> usize {
        self.headroom
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Call {
    pub(crate) task: TaskIndex,
    pub(crate) kind: CallKind,
    pub(crate) now: u64,
}

#[derive(Default)]
struct Controls {
    calls: Vec<Call>,
    in_flight: bool,
    fail_init: bool,
    fresh_values: bool,
    resets: Vec<TaskIndex>,
}

// Shared by a plugin and all of its tasks to record calls and steer them.
#[derive(Clone, Default)]
pub(crate) struct CallLog {
    controls: Rc<RefCell<Controls>>,
}

impl CallLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.controls.borrow().calls.clone()
    }

    pub(crate) fn kinds(&self, task: TaskIndex) -> Vec<CallKind> {
        self.controls
            .borrow()
            .calls
            .iter()
            .filter(|call| call.task == task)
            .map(|call| call.kind)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.controls.borrow_mut().calls.clear();
    }

    pub(crate) fn fail_init(&self, fail: bool) {
        self.controls.borrow_mut().fail_init = fail;
    }

    pub(crate) fn fresh_values(&self, fresh: bool) {
        self.controls.borrow_mut().fresh_values = fresh;
    }

    // The task falls back to an uninitialized phase on its next call.
    pub(crate) fn force_reset(&self, task: TaskIndex) {
        self.controls.borrow_mut().resets.push(task);
    }

    fn enter(&self, task: TaskIndex, kind: CallKind, now: u64) {
        let mut controls = self.controls.borrow_mut();
        assert!(!controls.in_flight, "re-entrant {kind} call on task {task}");
        controls.in_flight = true;
        controls.calls.push(Call { task, kind, now });
    }

    fn leave(&self) {
        self.controls.borrow_mut().in_flight = false;
    }

    fn take_reset(&self, task: TaskIndex) -> bool {
        let mut controls = self.controls.borrow_mut();
        let before = controls.resets.len();
        controls.resets.retain(|slot| *slot != task);
        before != controls.resets.len()
    }
}

pub(crate) struct RecordingPlugin {
    id: DriverId,
    fast: bool,
    log: CallLog,
}

impl RecordingPlugin {
    pub(crate) fn new(id: DriverId, log: &CallLog) -> Self {
        Self {
            id,
            fast: false,
            log: log.clone(),
        }
    }

    pub(crate) const fn fast(mut self) -> Self {
        self.fast = true;
        self
    }
}

impl<H> Plugin<H> for RecordingPlugin {
    fn id(&self) -> DriverId {
        self.id
    }

    fn name(&self) -> &'static str {
        "Recording"
    }

    fn value_names(&self) -> &'static [&'static str] {
        &["Count"]
    }

    fn uses_fast_poll(&self) -> bool {
        self.fast
    }

    fn instantiate(&self, config: &TaskConfig) -> error::Result<Box<dyn PluginTask<H>>> {
        Ok(Box::new(RecordingTask {
            slot: config.slot,
            log: self.log.clone(),
            initialized: false,
            reads: 0,
        }))
    }
}

struct RecordingTask {
    slot: TaskIndex,
    log: CallLog,
    initialized: bool,
    reads: u32,
}

impl RecordingTask {
    fn check_reset(&mut self) {
        if self.log.take_reset(self.slot) {
            self.initialized = false;
        }
    }
}

impl<H> PluginTask<H> for RecordingTask {
    fn init(&mut self, event: TaskEvent<'_, H>) -> bool {
        self.log.enter(event.task, event.kind, event.now_ms);
        self.initialized = !self.log.controls.borrow().fail_init;
        self.log.leave();
        self.initialized
    }

    fn poll_fast(&mut self, event: TaskEvent<'_, H>) -> bool {
        self.log.enter(event.task, event.kind, event.now_ms);
        self.check_reset();
        let fresh = self.initialized && self.log.controls.borrow().fresh_values;
        self.log.leave();
        fresh
    }

    fn read(&mut self, event: TaskEvent<'_, H>) -> bool {
        self.log.enter(event.task, event.kind, event.now_ms);
        self.check_reset();
        self.reads += 1;
        let _ = event.values.set(0, self.reads as f32);
        self.log.leave();
        true
    }

    fn write(&mut self, event: TaskEvent<'_, H>, command: &Command<'_>) -> bool {
        self.log.enter(event.task, event.kind, event.now_ms);
        let applied = match command.arg::<f32>(0) {
            Some(value) if command.is("set") => event.values.set(0, value),
            _ => false,
        };
        self.log.leave();
        applied
    }

    fn exit(&mut self, event: TaskEvent<'_, H>) {
        self.log.enter(event.task, event.kind, event.now_ms);
        self.initialized = false;
        self.log.leave();
    }

    fn initialized(&self) -> bool {
        self.initialized
    }
}
