//! Session lifecycle state machine
//!
//! Ties capture, transport, and playback together: owns the
//! idle → connecting → active → closed/failed lifecycle, wires capture
//! output to the transport and transport events to the scheduler, and
//! guarantees full resource teardown on stop from any state.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::capture::{CaptureSource, FrameSink, MicCapture};
use crate::config::Config;
use crate::playback::{CpalSink, OutputClock, OutputSink, PlaybackScheduler, SinkHandle};
use crate::transport::{TransportEvent, TransportSession};
use crate::{Error, Result};

/// Lifecycle states of a voice session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session
    Idle,
    /// Devices acquired, transport opening
    Connecting,
    /// Duplex session live, capture streaming
    Active,
    /// Teardown in progress
    Closing,
    /// Session ended cleanly
    Closed,
    /// Session ended with a fatal error
    Failed(String),
}

impl SessionState {
    /// Whether no further transitions can occur.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Caller-visible session status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Listening,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting..."),
            Self::Listening => write!(f, "Connected - Listening"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Drives one voice session at a time
///
/// All mutable session state lives behind this controller; callers interact
/// only through `start`, `stop`, and the read-only status accessors.
pub struct SessionController {
    config: Config,
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<SessionState>,
    last_error: Mutex<Option<String>>,
    capture: Mutex<Option<Box<dyn CaptureSource>>>,
    scheduler: Mutex<Option<Arc<PlaybackScheduler>>>,
    transport: Mutex<Option<Arc<TransportSession>>>,
    sink: Mutex<Option<Arc<dyn SinkHandle>>>,
}

impl SessionController {
    /// Create a controller for the given configuration. No resources are
    /// acquired until [`start`](Self::start).
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: Arc::new(Inner::new()),
        }
    }

    /// Open a session: acquire the output device, connect the transport,
    /// and begin capture once the remote side reports ready.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] or [`Error::Connection`] if session setup
    /// fails; the failure is also reflected in [`status`](Self::status)
    /// exactly once. No automatic retry.
    pub async fn start(&self) -> Result<()> {
        self.inner.transition_to_connecting()?;

        // Output side first: sample clock and sink share one device thread.
        let (completions_tx, completions_rx) = std::sync::mpsc::channel();
        let sink = match CpalSink::open(completions_tx) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                self.inner.fail_once(&e.to_string());
                return Err(e);
            }
        };

        let scheduler = Arc::new(PlaybackScheduler::with_completions(
            Arc::clone(&sink) as Arc<dyn OutputClock>,
            Arc::clone(&sink) as Arc<dyn OutputSink>,
            completions_rx,
        ));

        let (events_tx, events_rx) = mpsc::channel(64);
        let transport =
            match TransportSession::open(&self.config, events_tx, self.config.connect_timeout)
                .await
            {
                Ok(transport) => Arc::new(transport),
                Err(e) => {
                    sink.close();
                    self.inner.fail_once(&e.to_string());
                    return Err(e);
                }
            };

        let capture: Box<dyn CaptureSource> = Box::new(MicCapture::new(
            Arc::clone(&transport) as Arc<dyn FrameSink>,
        ));

        if !self.inner.install(capture, scheduler, transport, sink) {
            // A stop landed while the transport was connecting.
            tracing::debug!("session stopped during connect");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.pump_events(events_rx).await;
        });

        Ok(())
    }

    /// Tear down the session from any state: stop capture, flush playback,
    /// close the transport, release both audio devices. Re-entrant; a
    /// second call after the first is a no-op.
    pub fn stop(&self) {
        self.inner.teardown(SessionState::Closed);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Caller-visible status string source
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        match self.inner.state() {
            SessionState::Idle | SessionState::Closing | SessionState::Closed => {
                SessionStatus::Disconnected
            }
            SessionState::Connecting => SessionStatus::Connecting,
            SessionState::Active => SessionStatus::Listening,
            SessionState::Failed(_) => SessionStatus::Error,
        }
    }

    /// Human-readable message for a failed session, reported exactly once
    /// per session
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().map_or(None, |e| e.clone())
    }
}

impl Inner {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            last_error: Mutex::new(None),
            capture: Mutex::new(None),
            scheduler: Mutex::new(None),
            transport: Mutex::new(None),
            sink: Mutex::new(None),
        }
    }

    fn state(&self) -> SessionState {
        self.state
            .lock()
            .map_or(SessionState::Idle, |state| state.clone())
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            tracing::debug!(from = ?*state, to = ?next, "session state transition");
            *state = next;
        }
    }

    /// Idle (or a finished prior session) → Connecting.
    fn transition_to_connecting(&self) -> Result<()> {
        let Ok(mut state) = self.state.lock() else {
            return Err(Error::Config("session state poisoned".to_string()));
        };
        match &*state {
            SessionState::Idle | SessionState::Closed | SessionState::Failed(_) => {
                *state = SessionState::Connecting;
                drop(state);
                if let Ok(mut error) = self.last_error.lock() {
                    *error = None;
                }
                Ok(())
            }
            current => Err(Error::Config(format!(
                "cannot start a session from state {current:?}"
            ))),
        }
    }

    /// Hand freshly acquired resources to the session. If a stop finished
    /// while the transport was connecting, the session is already terminal;
    /// the late resources are released on the spot instead of leaking into
    /// slots no teardown will ever visit. The state lock is held across the
    /// handover so a concurrent teardown cannot interleave.
    fn install(
        &self,
        mut capture: Box<dyn CaptureSource>,
        scheduler: Arc<PlaybackScheduler>,
        transport: Arc<TransportSession>,
        sink: Arc<dyn SinkHandle>,
    ) -> bool {
        let state = self.state.lock();
        let refused = match &state {
            Ok(state) => state.is_terminal(),
            Err(_) => true,
        };
        if refused {
            drop(state);
            capture.stop();
            scheduler.shutdown();
            transport.close();
            sink.close();
            return false;
        }

        if let Ok(mut slot) = self.capture.lock() {
            *slot = Some(capture);
        }
        if let Ok(mut slot) = self.scheduler.lock() {
            *slot = Some(scheduler);
        }
        if let Ok(mut slot) = self.transport.lock() {
            *slot = Some(transport);
        }
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(sink);
        }
        drop(state);
        true
    }

    /// Record the first fatal error; later ones are logged, not surfaced.
    fn fail_once(&self, reason: &str) {
        if let Ok(mut error) = self.last_error.lock() {
            if error.is_none() {
                *error = Some(reason.to_string());
            } else {
                tracing::debug!(reason, "suppressing duplicate session error");
                return;
            }
        }
        self.set_state(SessionState::Failed(reason.to_string()));
    }

    /// Deterministic resource release; safe from any state and re-entrant.
    fn teardown(&self, terminal: SessionState) {
        {
            let Ok(mut state) = self.state.lock() else { return };
            if state.is_terminal() {
                return;
            }
            *state = SessionState::Closing;
        }

        self.release_resources();
        self.set_state(terminal);
        tracing::info!("session torn down");
    }

    /// Stop capture, flush playback, close transport, release devices.
    /// Every step is an `Option::take`, so repeated calls are no-ops.
    fn release_resources(&self) {
        if let Some(mut capture) = self.capture.lock().ok().and_then(|mut slot| slot.take()) {
            capture.stop();
        }
        if let Some(scheduler) = self.scheduler.lock().ok().and_then(|mut slot| slot.take()) {
            scheduler.shutdown();
        }
        if let Some(transport) = self.transport.lock().ok().and_then(|mut slot| slot.take()) {
            transport.close();
        }
        if let Some(sink) = self.sink.lock().ok().and_then(|mut slot| slot.take()) {
            sink.close();
        }
    }

    /// Forward transport events until the session reaches a terminal state.
    async fn pump_events(self: Arc<Self>, mut events_rx: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events_rx.recv().await {
            self.apply_event(event);
            if self.state().is_terminal() {
                break;
            }
        }
    }

    fn apply_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::AudioChunk(packet) => {
                let scheduler = self
                    .scheduler
                    .lock()
                    .ok()
                    .and_then(|slot| slot.as_ref().map(Arc::clone));
                if let Some(scheduler) = scheduler {
                    if let Err(e) = scheduler.on_audio_chunk(&packet) {
                        if e.is_fatal() {
                            tracing::error!(error = %e, "playback failed");
                            self.fail_once(&e.to_string());
                            self.release_resources();
                        } else {
                            // A single bad chunk is dropped; the session
                            // continues.
                            tracing::warn!(error = %e, "dropping malformed audio chunk");
                        }
                    }
                }
            }
            TransportEvent::Interrupted => {
                let scheduler = self
                    .scheduler
                    .lock()
                    .ok()
                    .and_then(|slot| slot.as_ref().map(Arc::clone));
                if let Some(scheduler) = scheduler {
                    scheduler.on_interrupted();
                }
            }
            TransportEvent::Closed => self.teardown(SessionState::Closed),
            TransportEvent::Error(reason) => {
                let error = Error::Transport(reason);
                tracing::error!(%error, "fatal transport error");
                self.fail_once(&error.to_string());
                // fail_once pinned the terminal state, which teardown's
                // re-entrancy guard would skip; release directly.
                self.release_resources();
            }
        }
    }

    /// Begin capture once the remote side reports ready.
    fn on_open(&self) {
        if self.state() != SessionState::Connecting {
            return;
        }

        let started = self
            .capture
            .lock()
            .ok()
            .and_then(|mut slot| slot.as_mut().map(|capture| capture.start()));

        match started {
            Some(Ok(())) => {
                self.set_state(SessionState::Active);
                tracing::info!("session active, listening");
            }
            Some(Err(e)) => {
                let reason = e.to_string();
                tracing::error!(error = %reason, "capture failed to start");
                self.fail_once(&reason);
                self.release_resources();
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::playback::{OutputClock, OutputSink};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClock(f64);

    impl OutputClock for FixedClock {
        fn now(&self) -> f64 {
            self.0
        }
    }

    #[derive(Default)]
    struct CountingSink {
        scheduled: AtomicUsize,
        stops: AtomicUsize,
    }

    impl OutputSink for CountingSink {
        fn schedule(&self, _id: u64, _samples: Vec<f32>, _start: f64) {
            self.scheduled.fetch_add(1, Ordering::SeqCst);
        }

        fn stop_all(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Capture source that counts starts and stops instead of opening a mic
    #[derive(Clone, Default)]
    struct FakeCapture {
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl CaptureSource for FakeCapture {
        fn start(&mut self) -> crate::Result<()> {
            if self.fail_start {
                return Err(Error::Device("mic denied".to_string()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler_for_tests() -> (Arc<PlaybackScheduler>, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        let (scheduler, _completions) = PlaybackScheduler::new(
            Arc::new(FixedClock(0.0)) as Arc<dyn OutputClock>,
            Arc::clone(&sink) as Arc<dyn OutputSink>,
        );
        (Arc::new(scheduler), sink)
    }

    fn wired_inner(capture: FakeCapture) -> (Arc<Inner>, Arc<CountingSink>) {
        let inner = Arc::new(Inner::new());
        inner.transition_to_connecting().unwrap();

        let (scheduler, sink) = scheduler_for_tests();
        if let Ok(mut slot) = inner.capture.lock() {
            *slot = Some(Box::new(capture));
        }
        if let Ok(mut slot) = inner.scheduler.lock() {
            *slot = Some(scheduler);
        }
        (inner, sink)
    }

    #[test]
    fn open_event_activates_the_session() {
        let capture = FakeCapture::default();
        let starts = Arc::clone(&capture.starts);
        let (inner, _sink) = wired_inner(capture);

        inner.apply_event(TransportEvent::Open);
        assert_eq!(inner.state(), SessionState::Active);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn device_failure_on_open_is_fatal() {
        let capture = FakeCapture {
            fail_start: true,
            ..FakeCapture::default()
        };
        let (inner, _sink) = wired_inner(capture);

        inner.apply_event(TransportEvent::Open);
        assert!(matches!(inner.state(), SessionState::Failed(_)));
    }

    #[test]
    fn audio_chunks_reach_the_scheduler_while_active() {
        let (inner, sink) = wired_inner(FakeCapture::default());
        inner.apply_event(TransportEvent::Open);

        let packet = codec::encode(&[0.1f32; 2400]);
        inner.apply_event(TransportEvent::AudioChunk(packet));
        assert_eq!(sink.scheduled.load(Ordering::SeqCst), 1);
        assert_eq!(inner.state(), SessionState::Active);
    }

    #[test]
    fn bad_chunk_does_not_leave_active() {
        let (inner, sink) = wired_inner(FakeCapture::default());
        inner.apply_event(TransportEvent::Open);

        let bad = crate::codec::EncodedPacket::new(
            "####".to_string(),
            "audio/pcm;rate=24000".to_string(),
        );
        inner.apply_event(TransportEvent::AudioChunk(bad));
        assert_eq!(inner.state(), SessionState::Active);
        assert_eq!(sink.scheduled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn interruption_keeps_the_session_active() {
        let (inner, sink) = wired_inner(FakeCapture::default());
        inner.apply_event(TransportEvent::Open);

        inner.apply_event(TransportEvent::Interrupted);
        assert_eq!(inner.state(), SessionState::Active);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transport_error_fails_and_releases() {
        let capture = FakeCapture::default();
        let stops = Arc::clone(&capture.stops);
        let (inner, sink) = wired_inner(capture);
        inner.apply_event(TransportEvent::Open);

        inner.apply_event(TransportEvent::Error("socket reset".to_string()));
        assert_eq!(
            inner.state(),
            SessionState::Failed("transport error: socket reset".to_string())
        );
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        // Scheduler shutdown flushes playback
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remote_close_tears_down_cleanly() {
        let capture = FakeCapture::default();
        let stops = Arc::clone(&capture.stops);
        let (inner, _sink) = wired_inner(capture);
        inner.apply_event(TransportEvent::Open);

        inner.apply_event(TransportEvent::Closed);
        assert_eq!(inner.state(), SessionState::Closed);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn teardown_is_reentrant() {
        let capture = FakeCapture::default();
        let stops = Arc::clone(&capture.stops);
        let (inner, _sink) = wired_inner(capture);
        inner.apply_event(TransportEvent::Open);

        inner.teardown(SessionState::Closed);
        inner.teardown(SessionState::Closed);
        assert_eq!(inner.state(), SessionState::Closed);
        // Devices released exactly once
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[derive(Default)]
    struct FakeSinkHandle {
        closes: AtomicUsize,
    }

    impl SinkHandle for FakeSinkHandle {
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_during_connect_releases_late_resources() {
        let inner = Arc::new(Inner::new());
        inner.transition_to_connecting().unwrap();

        // Stop lands while the transport is still opening
        inner.teardown(SessionState::Closed);
        assert_eq!(inner.state(), SessionState::Closed);

        // The connect resumes and tries to hand over what it acquired
        let capture = FakeCapture::default();
        let stops = Arc::clone(&capture.stops);
        let (scheduler, sink) = scheduler_for_tests();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
        let transport = Arc::new(TransportSession::stub(outbound_tx));
        let device = Arc::new(FakeSinkHandle::default());

        let installed = inner.install(
            Box::new(capture),
            scheduler,
            Arc::clone(&transport),
            Arc::clone(&device) as Arc<dyn SinkHandle>,
        );

        // Refused and released on the spot, nothing left behind
        assert!(!installed);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);
        assert_eq!(device.closes.load(Ordering::SeqCst), 1);
        assert!(outbound_rx.try_recv().is_err());
        assert!(inner.capture.lock().unwrap().is_none());
        assert!(inner.transport.lock().unwrap().is_none());

        // A later stop stays a no-op rather than finding leaked devices
        inner.teardown(SessionState::Closed);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(device.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn install_wires_resources_while_connecting() {
        let inner = Arc::new(Inner::new());
        inner.transition_to_connecting().unwrap();

        let (scheduler, _sink) = scheduler_for_tests();
        let (outbound_tx, _outbound_rx) = mpsc::channel(1);
        let transport = Arc::new(TransportSession::stub(outbound_tx));
        let device = Arc::new(FakeSinkHandle::default());

        let installed = inner.install(
            Box::new(FakeCapture::default()),
            scheduler,
            transport,
            device,
        );

        assert!(installed);
        assert_eq!(inner.state(), SessionState::Connecting);
        assert!(inner.transport.lock().unwrap().is_some());
        assert!(inner.sink.lock().unwrap().is_some());
    }

    #[test]
    fn stop_before_connected_is_safe() {
        let inner = Arc::new(Inner::new());
        inner.transition_to_connecting().unwrap();
        inner.teardown(SessionState::Closed);
        assert_eq!(inner.state(), SessionState::Closed);
    }

    #[test]
    fn exactly_one_error_is_surfaced() {
        let (inner, _sink) = wired_inner(FakeCapture::default());
        inner.apply_event(TransportEvent::Open);

        inner.apply_event(TransportEvent::Error("first".to_string()));
        inner.apply_event(TransportEvent::Error("second".to_string()));

        assert_eq!(
            inner.state(),
            SessionState::Failed("transport error: first".to_string())
        );
        let error = inner.last_error.lock().unwrap().clone();
        assert_eq!(error.as_deref(), Some("transport error: first"));
    }

    #[test]
    fn cannot_start_twice() {
        let inner = Inner::new();
        inner.transition_to_connecting().unwrap();
        assert!(inner.transition_to_connecting().is_err());
    }

    #[test]
    fn restart_after_close_is_allowed() {
        let inner = Inner::new();
        inner.transition_to_connecting().unwrap();
        inner.teardown(SessionState::Closed);
        assert!(inner.transition_to_connecting().is_ok());
    }

    #[test]
    fn status_strings_match_the_ui_contract() {
        assert_eq!(SessionStatus::Disconnected.to_string(), "Disconnected");
        assert_eq!(SessionStatus::Connecting.to_string(), "Connecting...");
        assert_eq!(SessionStatus::Listening.to_string(), "Connected - Listening");
        assert_eq!(SessionStatus::Error.to_string(), "Error");
    }
}
