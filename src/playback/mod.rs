//! Gapless playback scheduling
//!
//! The scheduler keeps a monotonically advancing "next start" timeline and
//! a live set of in-flight buffers. Each inbound chunk is decoded and
//! scheduled to start exactly when the previous one ends; interruption
//! flushes everything immediately and re-anchors the timeline at "now".

pub mod sink;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};

use crate::Result;
use crate::codec::{self, EncodedPacket, PLAYBACK_SAMPLE_RATE};

pub use sink::{CpalSink, OutputClock, OutputSink, SinkHandle};

/// Timeline and live-set state, guarded by a single mutex so every handler
/// observes and mutates it atomically.
struct SchedulerState {
    /// Next permissible start time, in seconds on the output clock.
    /// Monotonically non-decreasing while the session is active; reset
    /// only on interruption.
    cursor: f64,
    /// Ids of buffers that are scheduled but not yet finished or stopped
    live: HashSet<u64>,
    /// Ids finished naturally by the sink, reaped at handler entry
    completions: Receiver<u64>,
    next_id: u64,
}

/// Schedules decoded model speech onto the output device without gaps
pub struct PlaybackScheduler {
    state: Mutex<SchedulerState>,
    clock: Arc<dyn OutputClock>,
    sink: Arc<dyn OutputSink>,
    shut_down: AtomicBool,
}

impl PlaybackScheduler {
    /// Build a scheduler over an output clock and sink pair.
    ///
    /// Returns the scheduler plus the completion sender the sink must
    /// report finished buffer ids on.
    #[must_use]
    pub fn new(clock: Arc<dyn OutputClock>, sink: Arc<dyn OutputSink>) -> (Self, Sender<u64>) {
        let (completions_tx, completions_rx) = channel();
        let scheduler = Self::with_completions(clock, sink, completions_rx);
        (scheduler, completions_tx)
    }

    /// Build a scheduler over a sink that already owns the sending half of
    /// a completion channel.
    #[must_use]
    pub fn with_completions(
        clock: Arc<dyn OutputClock>,
        sink: Arc<dyn OutputSink>,
        completions: Receiver<u64>,
    ) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                cursor: 0.0,
                live: HashSet::new(),
                completions,
                next_id: 0,
            }),
            clock,
            sink,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Decode an inbound chunk and schedule it gaplessly.
    ///
    /// The scheduled start is `max(cursor, now)`: never in the past, and
    /// flush against the previous buffer's end when the pipeline keeps up.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Decode`] if the chunk payload is malformed;
    /// the timeline and live set are left untouched in that case.
    pub fn on_audio_chunk(&self, packet: &EncodedPacket) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Decode outside the lock; a bad chunk must not perturb the timeline.
        let samples = codec::decode(packet, 1)?;
        #[allow(clippy::cast_precision_loss)]
        let duration = samples.len() as f64 / f64::from(PLAYBACK_SAMPLE_RATE);

        let mut state = self.lock_and_reap();
        let now = self.clock.now();
        let start = state.cursor.max(now);

        let id = state.next_id;
        state.next_id += 1;
        state.live.insert(id);

        self.sink.schedule(id, samples, start);
        state.cursor = start + duration;

        tracing::trace!(id, start, duration, "scheduled playback buffer");
        Ok(())
    }

    /// Flush every pending and playing buffer immediately and re-anchor
    /// the timeline, so the next chunk starts at "now" rather than at a
    /// stale future time.
    pub fn on_interrupted(&self) {
        let mut state = self.lock_and_reap();
        self.sink.stop_all();
        let flushed = state.live.len();
        state.live.clear();
        state.cursor = 0.0;

        if flushed > 0 {
            tracing::debug!(flushed, "playback interrupted, buffers flushed");
        }
    }

    /// Interrupt, then refuse any further chunks.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.on_interrupted();
    }

    /// Number of buffers currently scheduled or playing
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.lock_and_reap().live.len()
    }

    /// Current timeline cursor in seconds
    #[must_use]
    pub fn cursor(&self) -> f64 {
        self.lock_and_reap().cursor
    }

    /// Take the state lock and drain naturally-completed ids first, so the
    /// live set is accurate at every observation point.
    fn lock_and_reap(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Ok(id) = state.completions.try_recv() {
            state.live.remove(&id);
        }
        state
    }
}
