//! Output-device seam for the playback scheduler
//!
//! The scheduler talks to the output side through two narrow traits so the
//! gapless-timing logic can be tested against a virtual clock, while the
//! real implementation rides the output device's free-running sample clock.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::thread::JoinHandle;

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::codec::PLAYBACK_SAMPLE_RATE;
use crate::{Error, Result};

/// A monotonic clock in seconds, anchored to the output device
pub trait OutputClock: Send + Sync {
    /// Current output clock time in seconds
    fn now(&self) -> f64;
}

/// Accepts decoded buffers for playback at a scheduled start time
pub trait OutputSink: Send + Sync {
    /// Queue `samples` to begin playing at `start` seconds on the output
    /// clock. The sink reports `id` on its completion channel when the
    /// buffer finishes naturally.
    fn schedule(&self, id: u64, samples: Vec<f32>, start: f64);

    /// Stop every queued and playing buffer immediately, mid-buffer.
    fn stop_all(&self);
}

/// An output device handle the session controller can release
pub trait SinkHandle: Send + Sync {
    /// Release the device. Idempotent.
    fn close(&self);
}

/// One buffer queued on the output device
struct QueuedBuffer {
    id: u64,
    samples: Vec<f32>,
    /// Output-clock sample index at which playback begins
    start_sample: u64,
    position: usize,
}

/// State shared between the control handle and the audio callback
struct SinkShared {
    queue: Vec<QueuedBuffer>,
    completions: Sender<u64>,
}

/// Playback sink backed by a cpal output stream
///
/// The `cpal::Stream` is not `Send`, so a dedicated thread owns it; this
/// handle carries only the shared queue and the sample playhead. The
/// playhead doubles as the output clock.
pub struct CpalSink {
    shared: Arc<Mutex<SinkShared>>,
    playhead: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CpalSink {
    /// Open the default output device at 24 kHz and start its stream.
    ///
    /// Completed buffer ids are reported on `completions`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if no output device is available or no
    /// suitable stream config exists.
    pub fn open(completions: Sender<u64>) -> Result<Self> {
        let shared = Arc::new(Mutex::new(SinkShared {
            queue: Vec::new(),
            completions,
        }));
        let playhead = Arc::new(AtomicU64::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let shared_worker = Arc::clone(&shared);
        let playhead_worker = Arc::clone(&playhead);
        let shutdown_worker = Arc::clone(&shutdown);

        let worker = std::thread::Builder::new()
            .name("aria-playback".to_string())
            .spawn(move || {
                run_output_stream(&shared_worker, &playhead_worker, &shutdown_worker, &ready_tx);
            })
            .map_err(|e| Error::Device(format!("failed to spawn playback thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                playhead,
                shutdown,
                worker: Mutex::new(Some(worker)),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(Error::Device("playback thread exited early".to_string()))
            }
        }
    }

    /// Release the output device. Idempotent.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            let _ = handle.join();
            tracing::debug!("playback sink closed");
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl SinkHandle for CpalSink {
    fn close(&self) {
        Self::close(self);
    }
}

impl OutputClock for CpalSink {
    fn now(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let played = self.playhead.load(Ordering::SeqCst) as f64;
        played / f64::from(PLAYBACK_SAMPLE_RATE)
    }
}

impl OutputSink for CpalSink {
    fn schedule(&self, id: u64, samples: Vec<f32>, start: f64) {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let start_sample = (start * f64::from(PLAYBACK_SAMPLE_RATE)).round().max(0.0) as u64;

        if let Ok(mut shared) = self.shared.lock() {
            shared.queue.push(QueuedBuffer {
                id,
                samples,
                start_sample,
                position: 0,
            });
        }
    }

    fn stop_all(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.queue.clear();
        }
    }
}

/// Thread body: owns the cpal stream for the sink's whole lifetime.
fn run_output_stream(
    shared: &Arc<Mutex<SinkShared>>,
    playhead: &Arc<AtomicU64>,
    shutdown: &Arc<AtomicBool>,
    ready_tx: &Sender<Result<()>>,
) {
    let stream = match build_output_stream(shared, playhead) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(Error::Device(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(25));
    }

    drop(stream);
}

fn build_output_stream(
    shared: &Arc<Mutex<SinkShared>>,
    playhead: &Arc<AtomicU64>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            // Fallback: stereo, same mono signal on both channels
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Device("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config();
    let channels = config.channels as usize;

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = PLAYBACK_SAMPLE_RATE,
        channels = config.channels,
        "audio playback initialized"
    );

    let shared = Arc::clone(shared);
    let playhead = Arc::clone(playhead);

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                fill_output(&shared, &playhead, data, channels);
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

/// Fill one output period from the scheduled queue and advance the playhead.
fn fill_output(
    shared: &Arc<Mutex<SinkShared>>,
    playhead: &Arc<AtomicU64>,
    data: &mut [f32],
    channels: usize,
) {
    let Ok(mut shared) = shared.lock() else {
        data.fill(0.0);
        return;
    };

    let mut cursor = playhead.load(Ordering::SeqCst);
    let mut finished: Vec<u64> = Vec::new();

    for frame in data.chunks_mut(channels) {
        let mut value = 0.0f32;
        for buffer in &mut shared.queue {
            if buffer.start_sample <= cursor && buffer.position < buffer.samples.len() {
                value += buffer.samples[buffer.position];
                buffer.position += 1;
            }
        }
        for out in frame.iter_mut() {
            *out = value;
        }
        cursor += 1;
    }

    shared.queue.retain(|buffer| {
        if buffer.position >= buffer.samples.len() {
            finished.push(buffer.id);
            false
        } else {
            true
        }
    });

    playhead.store(cursor, Ordering::SeqCst);

    let completions = shared.completions.clone();
    drop(shared);
    for id in finished {
        let _ = completions.send(id);
    }
}
