//! Aria Gateway - Real-time bidirectional voice session pipeline
//!
//! This library connects a microphone to a remote conversational model over
//! a persistent duplex session and plays the synthesized replies back with
//! gapless timing and mid-utterance interruption:
//! - PCM codec (f32 ⇄ base64 16-bit PCM)
//! - Capture pipeline (16 kHz mono, fixed 4096-sample frames)
//! - Transport session (duplex WebSocket to the model)
//! - Playback scheduler (gapless timeline, interruptible)
//! - Session controller (lifecycle state machine)
//!
//! # Architecture
//!
//! ```text
//! microphone ──► Capture ──► Codec ──► Transport ═══► remote model
//!                                          │
//!                                          ▼
//! speakers ◄── Sink ◄── Scheduler ◄── Codec ◄── inbound audio/events
//! ```
//!
//! The session controller drives open/close and observes transport
//! lifecycle events to update the externally visible status.

pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod session;
pub mod transport;

pub use capture::{CaptureSource, FRAME_SAMPLES, FrameSink, MicCapture};
pub use codec::{CAPTURE_SAMPLE_RATE, EncodedPacket, PLAYBACK_SAMPLE_RATE};
pub use config::Config;
pub use error::{Error, Result};
pub use playback::{CpalSink, OutputClock, OutputSink, PlaybackScheduler, SinkHandle};
pub use session::{SessionController, SessionState, SessionStatus};
pub use transport::{TransportEvent, TransportSession};
