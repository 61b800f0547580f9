//! Duplex session with the remote conversational model
//!
//! One WebSocket carries both directions: outbound base64 PCM frames on the
//! realtime-input channel, inbound synthesized speech and control signals in
//! server-content envelopes. A single driver task owns the socket and
//! select-loops over the outbound queue, the inbound stream, and the close
//! signal, so sends stay FIFO and the producer never blocks.

pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::capture::FrameSink;
use crate::codec::EncodedPacket;
use crate::config::Config;
use crate::{Error, Result};

use protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};

/// Outbound queue depth: capture frames buffered ahead of the socket.
/// A full queue drops the newest frame rather than blocking the producer.
pub const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Events delivered by the transport as inbound data arrives
#[derive(Debug)]
pub enum TransportEvent {
    /// Session is ready to accept capture input
    Open,
    /// Synthesized speech at 24 kHz mono
    AudioChunk(EncodedPacket),
    /// The user's speech interrupted playback; delivered before any audio
    /// of the new turn
    Interrupted,
    /// Session ended (either side)
    Closed,
    /// Fatal transport error
    Error(String),
}

/// Handle to an open duplex session
pub struct TransportSession {
    outbound_tx: mpsc::Sender<EncodedPacket>,
    close_tx: mpsc::Sender<()>,
    closed: AtomicBool,
}

impl TransportSession {
    /// Open a duplex session and send the setup message, all under the
    /// given timeout. Inbound events are delivered on `events_tx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] on network or authorization failure,
    /// or if the timeout elapses first.
    pub async fn open(
        config: &Config,
        events_tx: mpsc::Sender<TransportEvent>,
        timeout: Duration,
    ) -> Result<Self> {
        let url = session_url(config)?;

        let (mut socket, _response) =
            tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                .await
                .map_err(|_| Error::Connection(format!("session open timed out after {timeout:?}")))?
                .map_err(|e| Error::Connection(e.to_string()))?;

        let setup = SetupMessage::new(&config.model, &config.voice, &config.system_instruction);
        let setup_json = serde_json::to_string(&setup)?;
        tokio::time::timeout(timeout, socket.send(Message::Text(setup_json.into())))
            .await
            .map_err(|_| Error::Connection("setup send timed out".to_string()))?
            .map_err(|e| Error::Connection(e.to_string()))?;

        tracing::info!(model = %config.model, voice = %config.voice, "session opened");

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let (close_tx, close_rx) = mpsc::channel(1);

        tokio::spawn(drive_session(socket, outbound_rx, close_rx, events_tx));

        Ok(Self {
            outbound_tx,
            close_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a packet for FIFO transmission. Non-blocking: a full queue
    /// drops the frame with a warning.
    pub fn send(&self, packet: EncodedPacket) {
        match self.outbound_tx.try_send(packet) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("outbound queue full, dropping capture frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("outbound queue closed, dropping capture frame");
            }
        }
    }

    /// Send a close frame if still open and release the session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.close_tx.try_send(());
        tracing::debug!("transport close requested");
    }

    #[cfg(test)]
    pub(crate) fn stub(outbound_tx: mpsc::Sender<EncodedPacket>) -> Self {
        let (close_tx, _close_rx) = mpsc::channel(1);
        Self {
            outbound_tx,
            close_tx,
            closed: AtomicBool::new(false),
        }
    }
}

/// The capture pipeline hands frames straight to the session's FIFO queue.
impl FrameSink for TransportSession {
    fn deliver(&self, packet: EncodedPacket) {
        self.send(packet);
    }
}

/// Build the endpoint URL with the API key attached.
fn session_url(config: &Config) -> Result<Url> {
    let mut url =
        Url::parse(&config.endpoint).map_err(|e| Error::Config(format!("bad endpoint: {e}")))?;
    url.query_pairs_mut().append_pair("key", config.api_key()?);
    Ok(url)
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Driver task: owns the socket until close or failure.
async fn drive_session(
    mut socket: WsStream,
    mut outbound_rx: mpsc::Receiver<EncodedPacket>,
    mut close_rx: mpsc::Receiver<()>,
    events_tx: mpsc::Sender<TransportEvent>,
) {
    loop {
        tokio::select! {
            packet = outbound_rx.recv() => {
                let Some(packet) = packet else { break };
                let frame = RealtimeInputMessage::new(packet);
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize capture frame, dropping");
                        continue;
                    }
                };
                if let Err(e) = socket.send(Message::Text(json.into())).await {
                    let _ = events_tx.send(TransportEvent::Error(e.to_string())).await;
                    return;
                }
            }
            _ = close_rx.recv() => {
                let _ = socket.close(None).await;
                let _ = events_tx.send(TransportEvent::Closed).await;
                return;
            }
            inbound = socket.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        if !handle_inbound(message, &events_tx).await {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = events_tx.send(TransportEvent::Error(e.to_string())).await;
                        return;
                    }
                    None => {
                        let _ = events_tx.send(TransportEvent::Closed).await;
                        return;
                    }
                }
            }
        }
    }

    // Outbound producers all dropped; close the socket gracefully.
    let _ = socket.close(None).await;
    let _ = events_tx.send(TransportEvent::Closed).await;
}

/// Parse one inbound frame and fan out events. Returns false when the
/// session is over and the driver should stop.
async fn handle_inbound(message: Message, events_tx: &mpsc::Sender<TransportEvent>) -> bool {
    let payload = match message {
        Message::Text(text) => text.to_string(),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => text,
            Err(_) => {
                tracing::warn!("non-UTF-8 binary frame from server, ignoring");
                return true;
            }
        },
        Message::Close(frame) => {
            tracing::debug!(?frame, "server closed the session");
            let _ = events_tx.send(TransportEvent::Closed).await;
            return false;
        }
        // Ping/pong handled by the library
        _ => return true,
    };

    let server_message: ServerMessage = match serde_json::from_str(&payload) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable server message, ignoring");
            return true;
        }
    };

    if server_message.is_setup_complete() {
        let _ = events_tx.send(TransportEvent::Open).await;
    }

    // Interruption always precedes any audio carried by the same message,
    // so the scheduler never plays a new turn against a stale timeline.
    if server_message.interrupted() {
        let _ = events_tx.send(TransportEvent::Interrupted).await;
    }

    for packet in server_message.audio_packets() {
        let _ = events_tx.send(TransportEvent::AudioChunk(packet)).await;
    }

    true
}
