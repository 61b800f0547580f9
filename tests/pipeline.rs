//! Voice pipeline integration tests
//!
//! Exercises the codec, wire protocol, and playback scheduling without
//! audio hardware: the scheduler runs against a hand-advanced clock and a
//! recording sink.

use std::sync::{Arc, Mutex};

use aria_gateway::playback::{OutputClock, OutputSink, PlaybackScheduler};
use aria_gateway::transport::protocol::ServerMessage;
use aria_gateway::{CAPTURE_SAMPLE_RATE, EncodedPacket, PLAYBACK_SAMPLE_RATE, codec};

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / CAPTURE_SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (CAPTURE_SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Clock advanced by hand from the test body
struct ManualClock(Mutex<f64>);

impl ManualClock {
    fn new(start: f64) -> Arc<Self> {
        Arc::new(Self(Mutex::new(start)))
    }

    fn advance_to(&self, t: f64) {
        *self.0.lock().unwrap() = t;
    }
}

impl OutputClock for ManualClock {
    fn now(&self) -> f64 {
        *self.0.lock().unwrap()
    }
}

/// Records every schedule call instead of touching a device
#[derive(Default)]
struct RecordingSink {
    scheduled: Mutex<Vec<(u64, usize, f64)>>,
}

impl RecordingSink {
    fn starts(&self) -> Vec<f64> {
        self.scheduled.lock().unwrap().iter().map(|s| s.2).collect()
    }
}

impl OutputSink for RecordingSink {
    fn schedule(&self, id: u64, samples: Vec<f32>, start: f64) {
        self.scheduled.lock().unwrap().push((id, samples.len(), start));
    }

    fn stop_all(&self) {}
}

fn playback_chunk(duration_secs: f64) -> EncodedPacket {
    let n = (duration_secs * f64::from(PLAYBACK_SAMPLE_RATE)).round() as usize;
    codec::encode(&vec![0.05f32; n])
}

#[test]
fn test_codec_round_trip_sine() {
    let samples = generate_sine_samples(440.0, 0.25, 0.8);
    let decoded = codec::decode(&codec::encode(&samples), 1).unwrap();

    assert_eq!(decoded.len(), samples.len());
    for (a, b) in samples.iter().zip(&decoded) {
        assert!((a - b).abs() <= 1.0 / 32768.0);
    }
}

#[test]
fn test_codec_round_trip_silence() {
    let samples = generate_silence(0.1);
    let decoded = codec::decode(&codec::encode(&samples), 1).unwrap();
    assert!(decoded.iter().all(|s| s.abs() < f32::EPSILON));
}

#[test]
fn test_codec_mime_tags() {
    let packet = codec::encode(&generate_silence(0.01));
    assert_eq!(packet.mime_type, "audio/pcm;rate=16000");
}

#[test]
fn test_gapless_scheduling_accumulates_durations() {
    let clock = ManualClock::new(10.0);
    let sink = Arc::new(RecordingSink::default());
    let (scheduler, _completions) = PlaybackScheduler::new(
        Arc::clone(&clock) as Arc<dyn OutputClock>,
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    );

    // N chunks arriving before the previous buffer finishes: the Nth start
    // is the initial now plus the sum of all previous durations.
    let durations = [0.08, 0.12, 0.2, 0.04, 0.16];
    for d in durations {
        scheduler.on_audio_chunk(&playback_chunk(d)).unwrap();
    }

    let starts = sink.starts();
    let mut expected = 10.0;
    for (start, d) in starts.iter().zip(durations) {
        assert!((start - expected).abs() < 1e-9, "expected {expected}, got {start}");
        expected += d;
    }
    assert!((scheduler.cursor() - expected).abs() < 1e-9);
}

#[test]
fn test_happy_path_two_chunks() {
    let clock = ManualClock::new(0.0);
    let sink = Arc::new(RecordingSink::default());
    let (scheduler, _completions) = PlaybackScheduler::new(
        Arc::clone(&clock) as Arc<dyn OutputClock>,
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    );

    scheduler.on_audio_chunk(&playback_chunk(0.5)).unwrap();
    scheduler.on_audio_chunk(&playback_chunk(0.3)).unwrap();

    let starts = sink.starts();
    // Chunk 2 starts at chunk-1-start + 0.5s; final cursor is start + 0.8s
    assert!((starts[1] - (starts[0] + 0.5)).abs() < 1e-9);
    assert!((scheduler.cursor() - (starts[0] + 0.8)).abs() < 1e-9);
}

#[test]
fn test_interruption_mid_playback() {
    let clock = ManualClock::new(1.0);
    let sink = Arc::new(RecordingSink::default());
    let (scheduler, _completions) = PlaybackScheduler::new(
        Arc::clone(&clock) as Arc<dyn OutputClock>,
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    );

    scheduler.on_audio_chunk(&playback_chunk(1.0)).unwrap();
    assert_eq!(scheduler.live_count(), 1);

    scheduler.on_interrupted();
    assert_eq!(scheduler.live_count(), 0);

    // A following chunk starts at "now", not at chunk 1's original end
    clock.advance_to(1.25);
    scheduler.on_audio_chunk(&playback_chunk(0.5)).unwrap();
    let starts = sink.starts();
    assert!((starts[1] - 1.25).abs() < 1e-9);
    assert!(starts[1] < 2.0, "scheduled against a stale cursor");
}

#[test]
fn test_bad_chunk_is_dropped_without_side_effects() {
    let clock = ManualClock::new(0.0);
    let sink = Arc::new(RecordingSink::default());
    let (scheduler, _completions) = PlaybackScheduler::new(
        clock as Arc<dyn OutputClock>,
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    );

    scheduler.on_audio_chunk(&playback_chunk(0.2)).unwrap();

    // Odd byte length after base64 decoding
    let odd = EncodedPacket::new(
        {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3])
        },
        "audio/pcm;rate=24000".to_string(),
    );

    assert!(scheduler.on_audio_chunk(&odd).is_err());
    assert_eq!(scheduler.live_count(), 1);
    assert!((scheduler.cursor() - 0.2).abs() < 1e-9);
}

#[test]
fn test_natural_completion_prunes_live_set() {
    let clock = ManualClock::new(0.0);
    let sink = Arc::new(RecordingSink::default());
    let (scheduler, completions) = PlaybackScheduler::new(
        clock as Arc<dyn OutputClock>,
        Arc::clone(&sink) as Arc<dyn OutputSink>,
    );

    scheduler.on_audio_chunk(&playback_chunk(0.1)).unwrap();
    scheduler.on_audio_chunk(&playback_chunk(0.1)).unwrap();

    let first_id = sink.scheduled.lock().unwrap()[0].0;
    completions.send(first_id).unwrap();

    assert_eq!(scheduler.live_count(), 1);
}

#[test]
fn test_server_message_audio_and_interrupt_extraction() {
    let raw = r#"{
        "serverContent": {
            "modelTurn": {
                "parts": [
                    {"inlineData": {"data": "AAAAAA==", "mimeType": "audio/pcm;rate=24000"}}
                ]
            },
            "interrupted": true
        }
    }"#;
    let message: ServerMessage = serde_json::from_str(raw).unwrap();

    assert!(message.interrupted());
    let packets = message.audio_packets();
    assert_eq!(packets.len(), 1);

    // The extracted packet decodes as 24 kHz mono PCM
    let samples = codec::decode(&packets[0], 1).unwrap();
    assert_eq!(samples.len(), 2);
}

#[test]
fn test_capture_frame_encodes_to_wire_size() {
    // A full 4096-sample frame is 8192 bytes of PCM before base64
    let frame = generate_silence(aria_gateway::FRAME_SAMPLES as f32 / CAPTURE_SAMPLE_RATE as f32);
    assert_eq!(frame.len(), aria_gateway::FRAME_SAMPLES);

    let packet = codec::encode(&frame);
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&packet.data)
        .unwrap();
    assert_eq!(bytes.len(), aria_gateway::FRAME_SAMPLES * 2);
}
