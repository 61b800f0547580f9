//! Microphone capture pipeline
//!
//! Owns the input device at 16 kHz mono, chunks live audio into fixed
//! 4096-sample frames, encodes each frame, and hands it to the transport
//! through a bounded queue. The handoff never blocks the audio callback;
//! the send itself happens on the transport's driver task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;

use cpal::SampleRate;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::codec::{self, CAPTURE_SAMPLE_RATE, EncodedPacket};
use crate::{Error, Result};

/// Samples per capture frame (~256 ms at 16 kHz)
pub const FRAME_SAMPLES: usize = 4096;

/// Destination for encoded capture frames.
///
/// Delivery happens on the audio callback thread, so implementations must
/// never block; a sink that cannot keep up drops the frame instead.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, packet: EncodedPacket);
}

impl FrameSink for mpsc::Sender<EncodedPacket> {
    fn deliver(&self, packet: EncodedPacket) {
        if self.try_send(packet).is_err() {
            tracing::warn!("capture queue full, dropping frame");
        }
    }
}

/// Something that can begin and end microphone capture.
///
/// The session controller drives capture through this seam so the state
/// machine is testable without audio hardware.
pub trait CaptureSource: Send {
    /// Open the input device and begin streaming frames.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if no input device is available or access
    /// is denied.
    fn start(&mut self) -> Result<()>;

    /// Disconnect the device and release capture resources. Idempotent.
    fn stop(&mut self);
}

/// Capture pipeline backed by the default cpal input device
///
/// The `cpal::Stream` is not `Send`, so a dedicated thread owns it for the
/// lifetime of the capture; this handle only carries the stop signal.
pub struct MicCapture {
    outbound: Arc<dyn FrameSink>,
    stop: Arc<AtomicBool>,
    peak_milli: Arc<AtomicU32>,
    worker: Option<JoinHandle<()>>,
}

impl MicCapture {
    /// Create a capture pipeline delivering encoded frames into `outbound`.
    #[must_use]
    pub fn new(outbound: Arc<dyn FrameSink>) -> Self {
        Self {
            outbound,
            stop: Arc::new(AtomicBool::new(false)),
            peak_milli: Arc::new(AtomicU32::new(0)),
            worker: None,
        }
    }

    /// Peak input level observed so far, in [0, 1]. Used by the mic check.
    #[must_use]
    pub fn peak_level(&self) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let milli = self.peak_milli.load(Ordering::SeqCst) as f32;
        milli / 1000.0
    }
}

impl CaptureSource for MicCapture {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        self.stop.store(false, Ordering::SeqCst);

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let outbound = Arc::clone(&self.outbound);
        let stop = Arc::clone(&self.stop);
        let peak_milli = Arc::clone(&self.peak_milli);

        let worker = std::thread::Builder::new()
            .name("aria-capture".to_string())
            .spawn(move || {
                run_input_stream(&outbound, &stop, &peak_milli, &ready_tx);
            })
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(Error::Device("capture thread exited early".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            tracing::debug!("audio capture stopped");
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        CaptureSource::stop(self);
    }
}

/// Thread body: owns the cpal input stream until the stop flag is set.
fn run_input_stream(
    outbound: &Arc<dyn FrameSink>,
    stop: &Arc<AtomicBool>,
    peak_milli: &Arc<AtomicU32>,
    ready_tx: &std::sync::mpsc::Sender<Result<()>>,
) {
    let stream = match build_input_stream(outbound, peak_milli) {
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

    while !stop.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(25));
    }

    drop(stream);
}

fn build_input_stream(
    outbound: &Arc<dyn FrameSink>,
    peak_milli: &Arc<AtomicU32>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(CAPTURE_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(CAPTURE_SAMPLE_RATE)
        })
        .ok_or_else(|| Error::Device("no suitable input config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(CAPTURE_SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = CAPTURE_SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    let outbound = Arc::clone(outbound);
    let peak_milli = Arc::clone(peak_milli);
    let mut pending: Vec<f32> = Vec::with_capacity(FRAME_SAMPLES * 2);

    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                track_peak(&peak_milli, data);
                pending.extend_from_slice(data);
                while pending.len() >= FRAME_SAMPLES {
                    let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                    outbound.deliver(codec::encode(&frame));
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

fn track_peak(peak_milli: &AtomicU32, data: &[f32]) {
    let peak = data.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()));
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let milli = (peak.min(1.0) * 1000.0) as u32;
    peak_milli.fetch_max(milli, Ordering::SeqCst);
}
