use alloc::vec::Vec;

use core::fmt::{self, Display, Write as _};

use log::{debug, error};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, timeout_reached};
use crate::memory::{FreeMemory, MemoryGuard, MemorySnapshot};
use crate::transport::{ContentKind, ResponseHeader, Transport};

/// Default buffer capacity in bytes.
pub const DEFAULT_CAPACITY: usize = 1200;

// Body sent in place of the stream when memory is too low.
const LOW_MEMORY_BODY: &str = "Low memory. Cannot display webpage :-(";

/// Streaming output settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Number of bytes buffered before a chunk is transmitted.
    pub capacity: usize,
    /// Extra bytes reserved together with the buffer.
    pub slack: usize,
    /// Free memory below which a stream is not even started.
    pub low_memory_floor: usize,
    /// Free memory the transport should give back before the next chunk.
    pub transmit_floor: usize,
    /// Maximum time spent waiting for the transport after each chunk.
    pub backpressure_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConfig {
    /// Creates a [`StreamConfig`] with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slack: 50,
            low_memory_floor: 3000,
            transmit_floor: 4000,
            backpressure_timeout_ms: 100,
        }
    }

    /// Sets the buffer capacity.
    ///
    /// A capacity of zero is raised to one byte.
    #[must_use]
    pub const fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = if capacity == 0 { 1 } else { capacity };
        self
    }

    /// Sets the free memory below which streams fall back to a fixed
    /// response.
    #[must_use]
    pub const fn low_memory_floor(mut self, floor: usize) -> Self {
        self.low_memory_floor = floor;
        self
    }

    /// Sets the free memory awaited after each transmitted chunk.
    #[must_use]
    pub const fn transmit_floor(mut self, floor: usize) -> Self {
        self.transmit_floor = floor;
        self
    }

    /// Sets the maximum wait for the transport after each chunk.
    #[must_use]
    pub const fn backpressure_timeout(mut self, timeout_ms: u64) -> Self {
        self.backpressure_timeout_ms = timeout_ms;
        self
    }
}

/// Counters of a streaming operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Payload bytes handed to the transport, framing excluded.
    pub sent_bytes: usize,
    /// Number of transmitted chunks, terminator excluded.
    pub chunks: usize,
    /// Number of appends from constant storage.
    pub static_calls: usize,
    /// Bytes appended from constant storage.
    pub static_bytes: usize,
    /// Memory readings.
    pub memory: MemorySnapshot,
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// All output was transmitted.
    Completed(StreamStats),
    /// Memory was too low, a fixed fallback response was sent instead.
    LowMemory {
        /// Free memory observed when the stream started.
        free: usize,
    },
    /// The transport failed midway, the remaining output was discarded.
    Aborted(StreamStats),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Streaming,
    LowMemory,
    Broken,
}

/// The bounded streaming output channel.
///
/// Producers append fragments of any aggregate length. Fragments are
/// collected in a buffer of fixed capacity which is transmitted as one chunk
/// whenever the next fragment would overflow it, so the buffer never holds
/// more than the configured capacity.
///
/// When free memory is below [`StreamConfig::low_memory_floor`] at the
/// start of a stream, a short plain-text response is sent instead and every
/// further append is discarded.
pub struct StreamingOutput<'a, T, M, C>
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
{
    transport: &'a mut T,
    guard: &'a mut MemoryGuard<M>,
    clock: C,
    config: StreamConfig,
    buf: Vec<u8>,
    mode: Mode,
    low_memory_free: usize,
    stats: StreamStats,
}

impl<'a, T, M, C> StreamingOutput<'a, T, M, C>
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
{
    /// Creates a [`StreamingOutput`] over a transport.
    ///
    /// No memory is reserved until a stream starts.
    #[must_use]
    pub fn new(
        transport: &'a mut T,
        guard: &'a mut MemoryGuard<M>,
        clock: C,
        config: StreamConfig,
    ) -> Self {
        Self {
            transport,
            guard,
            clock,
            config: config.capacity(config.capacity),
            buf: Vec::new(),
            mode: Mode::Idle,
            low_memory_free: 0,
            stats: StreamStats::default(),
        }
    }

    /// Starts a stream, allowing any origin when `allow_cross_origin` is set.
    pub fn start(
        &mut self,
        content_kind: ContentKind,
        allow_cross_origin: bool,
        status: u16,
        cacheable: bool,
    ) {
        let origin = if allow_cross_origin { Some("*") } else { None };
        self.start_with_origin(content_kind, origin, status, cacheable);
    }

    /// Starts a JSON stream readable from any origin.
    #[inline]
    pub fn start_json(&mut self) {
        self.start(ContentKind::Json, true, 200, false);
    }

    /// Starts a stream with an explicit allowed origin.
    pub fn start_with_origin(
        &mut self,
        content_kind: ContentKind,
        origin: Option<&str>,
        status: u16,
        cacheable: bool,
    ) {
        self.stats = StreamStats::default();
        self.buf.clear();
        self.guard.release_buffer();

        let free = self.guard.begin();
        if free < self.config.low_memory_floor {
            self.mode = Mode::LowMemory;
            self.low_memory_free = free;
            if let Err(e) =
                self.transport
                    .send_fallback(200, ContentKind::PlainText, LOW_MEMORY_BODY)
            {
                error!("Low memory fallback not sent: {e:?}");
            }
            return;
        }

        self.buf
            .reserve_exact(self.config.capacity + self.config.slack);
        self.guard.hold_buffer(self.buf.capacity());

        let header = ResponseHeader {
            status,
            content_kind,
            cacheable,
            cors_origin: origin,
        };

        self.mode = Mode::Streaming;
        if let Err(e) = self.transport.send_header(&header) {
            self.abort(&e);
        }
    }

    /// Appends raw bytes.
    ///
    /// When the fragment does not fit into the remaining capacity, the
    /// buffered data is transmitted first. Fragments larger than the
    /// capacity are transmitted in capacity-sized slices.
    pub fn append(&mut self, data: &[u8]) {
        if self.mode != Mode::Streaming || data.is_empty() {
            return;
        }

        let capacity = self.config.capacity;
        if self.buf.len() + data.len() > capacity {
            self.flush();
        }

        let mut rest = data;
        while self.mode == Mode::Streaming && rest.len() > capacity - self.buf.len() {
            let (head, tail) = rest.split_at(capacity - self.buf.len());
            self.buf.extend_from_slice(head);
            rest = tail;
            self.transmit();
        }

        if self.mode == Mode::Streaming {
            self.buf.extend_from_slice(rest);
        }
    }

    /// Appends a string.
    #[inline]
    pub fn push_str(&mut self, text: &str) {
        self.append(text.as_bytes());
    }

    /// Appends a string from constant storage.
    pub fn push_static(&mut self, text: &'static str) {
        if self.mode == Mode::Streaming {
            self.stats.static_calls += 1;
            self.stats.static_bytes += text.len();
        }
        self.append(text.as_bytes());
    }

    /// Appends a single character.
    pub fn push_char(&mut self, c: char) {
        let mut encoded = [0u8; 4];
        self.append(c.encode_utf8(&mut encoded).as_bytes());
    }

    /// Appends a float with two decimals.
    pub fn push_float(&mut self, value: f32) {
        let _ = write!(self, "{value:.2}");
    }

    /// Appends any displayable value.
    pub fn push_display<D: Display + ?Sized>(&mut self, value: &D) {
        let _ = write!(self, "{value}");
    }

    /// Transmits the buffered data as one chunk.
    ///
    /// Does nothing on an empty buffer. In low-memory mode the buffer is
    /// cleared without transmitting anything.
    pub fn flush(&mut self) {
        match self.mode {
            Mode::Streaming if !self.buf.is_empty() => self.transmit(),
            Mode::Streaming | Mode::Idle => {}
            Mode::LowMemory | Mode::Broken => self.buf.clear(),
        }
    }

    /// Ends the stream.
    ///
    /// Transmits the remaining data followed by the end-of-stream marker and
    /// releases the buffer.
    pub fn end(&mut self) -> StreamOutcome {
        let outcome = match self.mode {
            Mode::LowMemory => {
                error!(
                    "Stream skipped: low memory: {} bytes free",
                    self.low_memory_free
                );
                StreamOutcome::LowMemory {
                    free: self.low_memory_free,
                }
            }
            Mode::Streaming | Mode::Broken | Mode::Idle => {
                self.flush();
                if self.mode == Mode::Streaming
                    && let Err(e) = self.transport.send_terminator()
                {
                    self.abort(&e);
                }
                self.stats.memory = self.guard.finish();

                debug!(
                    "Stream memory usage: rendering {} bytes, transmitting {} bytes, \
                     constant storage calls {} bytes {}",
                    self.stats.memory.max_render_usage,
                    self.stats.memory.max_transmit_usage,
                    self.stats.static_calls,
                    self.stats.static_bytes
                );

                if self.mode == Mode::Broken {
                    StreamOutcome::Aborted(self.stats)
                } else {
                    StreamOutcome::Completed(self.stats)
                }
            }
        };

        self.mode = Mode::Idle;
        self.buf = Vec::new();
        self.guard.release_buffer();
        outcome
    }

    /// Returns the number of buffered bytes.
    #[must_use]
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the buffer capacity.
    #[must_use]
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Returns whether the current stream is in low-memory mode.
    #[must_use]
    #[inline]
    pub fn is_low_memory(&self) -> bool {
        self.mode == Mode::LowMemory
    }

    /// Returns the counters of the current stream.
    #[must_use]
    #[inline]
    pub const fn stats(&self) -> &StreamStats {
        &self.stats
    }

    fn transmit(&mut self) {
        self.guard.track_render();
        self.guard.before_send();

        if let Err(e) = self.transport.send_chunk(&self.buf) {
            self.abort(&e);
            return;
        }

        self.stats.sent_bytes += self.buf.len();
        self.stats.chunks += 1;
        self.buf.clear();

        self.wait_for_transport();
    }

    // Gives the transport a bounded amount of time to release the memory
    // held by the last chunk.
    fn wait_for_transport(&mut self) {
        let deadline = self.clock.now_ms() + self.config.backpressure_timeout_ms;
        loop {
            let free = self.guard.track_transmit();
            if free >= self.config.transmit_floor
                && self.transport.headroom() >= self.config.capacity
            {
                return;
            }

            if timeout_reached(self.clock.now_ms(), deadline) {
                debug!(
                    "Transport still busy after {} ms, {free} bytes free",
                    self.config.backpressure_timeout_ms
                );
                return;
            }

            self.clock.pause_ms(1);
        }
    }

    fn abort(&mut self, e: &T::Error) {
        error!("Stream aborted, transport failure: {e:?}");
        self.mode = Mode::Broken;
        self.buf.clear();
    }
}

impl<T, M, C> fmt::Write for StreamingOutput<'_, T, M, C>
where
    T: Transport,
    M: FreeMemory,
    C: Clock,
{
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_str(s);
        Ok(())
    }
}
