//! Gemini Live `BidiGenerateContent` wire types
//!
//! Client messages carry either the one-time session setup or a block of
//! realtime input media; server messages arrive in a `serverContent`
//! envelope whose `modelTurn.parts[..].inlineData` holds base64 PCM at
//! 24 kHz mono. An absent audio field means "no audio in this turn" and
//! is not an error.

use serde::{Deserialize, Serialize};

use crate::codec::EncodedPacket;

/// First message on a fresh session: model plus generation config
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl SetupMessage {
    /// Assemble the setup message for an audio-modality session.
    #[must_use]
    pub fn new(model: &str, voice: &str, system_instruction: &str) -> Self {
        Self {
            setup: Setup {
                model: format!("models/{model}"),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: voice.to_string(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: system_instruction.to_string(),
                    }],
                },
            },
        }
    }
}

/// One captured frame on the realtime-input channel
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaBlob>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

impl RealtimeInputMessage {
    /// Wrap an encoded capture frame for transmission.
    #[must_use]
    pub fn new(packet: EncodedPacket) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaBlob {
                    data: packet.data,
                    mime_type: packet.mime_type,
                }],
            },
        }
    }
}

/// Inbound server message envelope
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<SetupComplete>,
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
pub struct SetupComplete {}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: Option<bool>,
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelTurn {
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub inline_data: Option<MediaBlob>,
}

impl ServerMessage {
    /// Extract inbound audio, if this message carries any.
    #[must_use]
    pub fn audio_packets(&self) -> Vec<EncodedPacket> {
        self.server_content
            .as_ref()
            .and_then(|content| content.model_turn.as_ref())
            .map(|turn| {
                turn.parts
                    .iter()
                    .filter_map(|part| part.inline_data.as_ref())
                    .map(|blob| EncodedPacket::new(blob.data.clone(), blob.mime_type.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the model signalled that the user interrupted playback.
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|content| content.interrupted)
            .unwrap_or(false)
    }

    /// Whether setup completed and the session is ready for input.
    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}
