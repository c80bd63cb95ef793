/// A monotonic millisecond time source.
///
/// On bare metal this is usually backed by a hardware timer, on a hosted
/// system by the operating system clock.
pub trait Clock {
    /// Returns the milliseconds elapsed since boot.
    fn now_ms(&self) -> u64;

    /// Gives up the processor for roughly `ms` milliseconds.
    ///
    /// Only used for short, explicitly time-boxed waits.
    fn pause_ms(&self, ms: u32);
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    #[inline]
    fn pause_ms(&self, ms: u32) {
        (**self).pause_ms(ms);
    }
}

/// Returns the milliseconds elapsed from `then` to `now`.
///
/// A `then` in the future yields zero.
#[must_use]
#[inline]
pub const fn time_passed_since(now: u64, then: u64) -> u64 {
    now.saturating_sub(then)
}

/// Returns whether `deadline` has been reached at `now`.
#[must_use]
#[inline]
pub const fn timeout_reached(now: u64, deadline: u64) -> bool {
    now >= deadline
}
