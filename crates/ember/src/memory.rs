use alloc::rc::Rc;

use core::cell::Cell;

use serde::Serialize;

/// A source of free-memory readings.
///
/// Implemented by the platform: heap introspection where the target offers
/// it, an [`AllocationCounter`] otherwise.
pub trait FreeMemory {
    /// Returns the number of free bytes.
    fn free_bytes(&self) -> usize;

    /// Accounts for `bytes` allocated by the runtime itself.
    ///
    /// Heap introspection already sees such allocations, so the default
    /// does nothing.
    fn charge(&self, _bytes: usize) {}

    /// Gives back `bytes` previously passed to [`FreeMemory::charge`].
    fn refund(&self, _bytes: usize) {}
}

impl<M: FreeMemory + ?Sized> FreeMemory for &M {
    #[inline]
    fn free_bytes(&self) -> usize {
        (**self).free_bytes()
    }

    #[inline]
    fn charge(&self, bytes: usize) {
        (**self).charge(bytes);
    }

    #[inline]
    fn refund(&self, bytes: usize) {
        (**self).refund(bytes);
    }
}

/// A tracked-allocation counter with a fixed budget.
///
/// Cloning the counter yields a handle to the same reservations, so the
/// instance store and the [`MemoryGuard`] can share it.
/// The runtime is single-threaded, hence the counter is neither `Send` nor
/// `Sync`.
#[derive(Debug, Clone)]
pub struct AllocationCounter {
    budget: usize,
    reserved: Rc<Cell<usize>>,
}

impl AllocationCounter {
    /// Creates an [`AllocationCounter`] with the given budget in bytes.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            reserved: Rc::new(Cell::new(0)),
        }
    }

    /// Charges `bytes` to the budget.
    #[inline]
    pub fn reserve(&self, bytes: usize) {
        self.reserved.set(self.reserved.get().saturating_add(bytes));
    }

    /// Returns `bytes` to the budget.
    #[inline]
    pub fn release(&self, bytes: usize) {
        self.reserved.set(self.reserved.get().saturating_sub(bytes));
    }

    /// Returns the number of reserved bytes.
    #[must_use]
    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved.get()
    }

    /// Returns the budget in bytes.
    #[must_use]
    #[inline]
    pub const fn budget(&self) -> usize {
        self.budget
    }
}

impl FreeMemory for AllocationCounter {
    #[inline]
    fn free_bytes(&self) -> usize {
        self.budget.saturating_sub(self.reserved.get())
    }

    #[inline]
    fn charge(&self, bytes: usize) {
        self.reserve(bytes);
    }

    #[inline]
    fn refund(&self, bytes: usize) {
        self.release(bytes);
    }
}

/// Free-memory readings taken during one streaming operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    /// Free memory when the stream started.
    pub initial: usize,
    /// Lowest free memory observed right before a chunk was transmitted.
    pub before_transmit: usize,
    /// Lowest free memory observed while a chunk was being transmitted.
    pub during_transmit: usize,
    /// Free memory when the stream ended.
    pub final_free: usize,
    /// Largest amount of memory consumed while producing output.
    pub max_render_usage: usize,
    /// Largest amount of memory consumed while the transport held a chunk.
    pub max_transmit_usage: usize,
}

/// The process-wide memory guard.
///
/// Only the streaming output channel writes to it. Its snapshot is reset at
/// the start of every stream and stays readable afterwards for diagnostics.
pub struct MemoryGuard<M: FreeMemory> {
    gauge: M,
    snapshot: MemorySnapshot,
    held: usize,
}

impl<M: FreeMemory> MemoryGuard<M> {
    /// Creates a [`MemoryGuard`] sampling the given gauge.
    #[must_use]
    pub const fn new(gauge: M) -> Self {
        Self {
            gauge,
            snapshot: MemorySnapshot {
                initial: 0,
                before_transmit: 0,
                during_transmit: 0,
                final_free: 0,
                max_render_usage: 0,
                max_transmit_usage: 0,
            },
            held: 0,
        }
    }

    /// Samples the current free memory.
    #[must_use]
    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.gauge.free_bytes()
    }

    /// Returns the underlying gauge.
    #[must_use]
    #[inline]
    pub const fn gauge(&self) -> &M {
        &self.gauge
    }

    /// Returns the last recorded snapshot.
    #[must_use]
    #[inline]
    pub const fn snapshot(&self) -> MemorySnapshot {
        self.snapshot
    }

    /// Resets the snapshot for a new stream and returns the free memory.
    pub fn begin(&mut self) -> usize {
        let free = self.free_bytes();
        self.snapshot = MemorySnapshot {
            initial: free,
            before_transmit: free,
            during_transmit: free,
            final_free: free,
            max_render_usage: 0,
            max_transmit_usage: 0,
        };
        free
    }

    /// Charges the output buffer to the gauge.
    ///
    /// A buffer still held from an earlier stream is given back first.
    pub fn hold_buffer(&mut self, bytes: usize) {
        self.release_buffer();
        self.gauge.charge(bytes);
        self.held = bytes;
    }

    /// Gives the output buffer back to the gauge.
    pub fn release_buffer(&mut self) {
        self.gauge.refund(self.held);
        self.held = 0;
    }

    /// Returns the size of the output buffer currently charged.
    #[must_use]
    #[inline]
    pub const fn held(&self) -> usize {
        self.held
    }

    /// Records the memory consumed while producing output.
    pub fn track_render(&mut self) {
        let free = self.free_bytes();
        self.snapshot.before_transmit = free;
        let used = self.snapshot.initial.saturating_sub(free);
        self.snapshot.max_render_usage = self.snapshot.max_render_usage.max(used);
    }

    /// Records the free memory right before a chunk is handed to the
    /// transport.
    pub fn before_send(&mut self) {
        let free = self.free_bytes();
        self.snapshot.before_transmit = self.snapshot.before_transmit.min(free);
        self.snapshot.during_transmit = free;
    }

    /// Records the memory consumed while the transport holds a chunk and
    /// returns the free memory.
    pub fn track_transmit(&mut self) -> usize {
        let free = self.free_bytes();
        self.snapshot.during_transmit = self.snapshot.during_transmit.min(free);
        let used = self.snapshot.initial.saturating_sub(free);
        self.snapshot.max_transmit_usage = self.snapshot.max_transmit_usage.max(used);
        free
    }

    /// Records the free memory at the end of a stream.
    pub fn finish(&mut self) -> MemorySnapshot {
        self.snapshot.final_free = self.free_bytes();
        self.snapshot
    }
}
