//! Voice-agent provider wire protocol
//!
//! Control traffic is JSON text frames tagged by `type`; audio travels as
//! binary frames of 16-bit little-endian PCM. Inbound events the client does
//! not know deserialize to [`ServerMessage::Unknown`] instead of failing.

use serde::{Deserialize, Serialize};
use voice_client_config::ProviderConfig;

/// Audio format for one direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSettings {
    pub input: AudioFormat,
    pub output: AudioFormat,
}

/// Model selector used by every pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenSettings {
    pub provider: ProviderSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkSettings {
    pub provider: ProviderSpec,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakSettings {
    pub provider: ProviderSpec,
}

impl SpeakSettings {
    pub fn voice(voice_id: impl Into<String>) -> Self {
        Self {
            provider: ProviderSpec {
                kind: "deepgram".to_string(),
                model: voice_id.into(),
            },
        }
    }

    pub fn voice_id(&self) -> &str {
        &self.provider.model
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    pub listen: ListenSettings,
    pub think: ThinkSettings,
    pub speak: SpeakSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
}

/// Full session configuration sent once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub audio: AudioSettings,
    pub agent: AgentSettings,
}

impl SessionSettings {
    /// Build settings from provider config plus the per-call prompt and voice
    pub fn build(
        provider: &ProviderConfig,
        input_sample_rate: u32,
        prompt: String,
        voice_id: &str,
        greeting: Option<String>,
    ) -> Self {
        Self {
            audio: AudioSettings {
                input: AudioFormat {
                    encoding: provider.encoding.clone(),
                    sample_rate: input_sample_rate,
                    container: None,
                },
                output: AudioFormat {
                    encoding: provider.encoding.clone(),
                    sample_rate: provider.output_sample_rate,
                    container: Some("none".to_string()),
                },
            },
            agent: AgentSettings {
                listen: ListenSettings {
                    provider: ProviderSpec {
                        kind: "deepgram".to_string(),
                        model: provider.listen_model.clone(),
                    },
                },
                think: ThinkSettings {
                    provider: ProviderSpec {
                        kind: provider.think_provider.clone(),
                        model: provider.think_model.clone(),
                    },
                    prompt,
                },
                speak: SpeakSettings::voice(voice_id),
                greeting,
            },
        }
    }
}

/// Messages sent to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Settings(SessionSettings),
    UpdatePrompt { prompt: String },
    UpdateSpeak { speak: SpeakSettings },
    InjectAgentMessage { message: String },
    KeepAlive,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Settings(_) => "Settings",
            ClientMessage::UpdatePrompt { .. } => "UpdatePrompt",
            ClientMessage::UpdateSpeak { .. } => "UpdateSpeak",
            ClientMessage::InjectAgentMessage { .. } => "InjectAgentMessage",
            ClientMessage::KeepAlive => "KeepAlive",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Events received from the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    Welcome {
        #[serde(default)]
        request_id: Option<String>,
    },
    SettingsApplied,
    ConversationText {
        role: String,
        content: String,
    },
    UserStartedSpeaking,
    AgentThinking {
        #[serde(default)]
        content: Option<String>,
    },
    AgentStartedSpeaking,
    AgentAudioDone,
    PromptUpdated,
    SpeakUpdated,
    Error {
        #[serde(default)]
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    Warning {
        #[serde(default)]
        description: String,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// How an `Error`/`Warning` from the provider should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderNotice {
    /// Duplicate or already-applied configuration; swallowed
    Benign,
    /// The voice or a model could not be used; recovered by fallback
    VoiceOrModel,
    /// Anything else; closes the session
    Fatal,
}

const BENIGN_MARKERS: &[&str] = &[
    "already applied",
    "already_applied",
    "duplicate",
    "settings_already",
];

const VOICE_MARKERS: &[&str] = &["voice", "speak", "tts", "model"];

impl ProviderNotice {
    pub fn classify(code: Option<&str>, description: &str) -> Self {
        let code = code.unwrap_or_default().to_ascii_lowercase();
        let description = description.to_ascii_lowercase();
        let mentions = |markers: &[&str]| {
            markers
                .iter()
                .any(|m| code.contains(m) || description.contains(m))
        };

        if mentions(BENIGN_MARKERS) {
            ProviderNotice::Benign
        } else if mentions(VOICE_MARKERS) {
            ProviderNotice::VoiceOrModel
        } else {
            ProviderNotice::Fatal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_serialization_shape() {
        let settings = SessionSettings::build(
            &ProviderConfig::default(),
            16_000,
            "You are Dana.".into(),
            "aura-2-thalia-en",
            Some("Hi".into()),
        );
        let json: serde_json::Value =
            serde_json::from_str(&ClientMessage::Settings(settings).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "Settings");
        assert_eq!(json["audio"]["input"]["sample_rate"], 16_000);
        assert_eq!(json["audio"]["output"]["container"], "none");
        assert_eq!(json["agent"]["think"]["prompt"], "You are Dana.");
        assert_eq!(json["agent"]["speak"]["provider"]["model"], "aura-2-thalia-en");
        assert_eq!(json["agent"]["greeting"], "Hi");
        assert!(json["audio"]["input"].get("container").is_none());
    }

    #[test]
    fn test_keepalive_and_updates_are_tagged() {
        assert_eq!(ClientMessage::KeepAlive.to_json().unwrap(), r#"{"type":"KeepAlive"}"#);
        let update = ClientMessage::UpdatePrompt {
            prompt: "be brief".into(),
        };
        assert_eq!(
            update.to_json().unwrap(),
            r#"{"type":"UpdatePrompt","prompt":"be brief"}"#
        );
    }

    #[test]
    fn test_server_messages_parse() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"ConversationText","role":"assistant","content":"Hello"}"#)
                .unwrap(),
            ServerMessage::ConversationText {
                role: "assistant".into(),
                content: "Hello".into()
            }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"AgentStartedSpeaking","total_latency":0.4}"#).unwrap(),
            ServerMessage::AgentStartedSpeaking
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"History","content":"x"}"#).unwrap(),
            ServerMessage::Unknown
        );
    }

    #[test]
    fn test_notice_classification() {
        assert_eq!(
            ProviderNotice::classify(Some("SETTINGS_ALREADY_APPLIED"), ""),
            ProviderNotice::Benign
        );
        assert_eq!(
            ProviderNotice::classify(None, "Duplicate Settings message ignored"),
            ProviderNotice::Benign
        );
        assert_eq!(
            ProviderNotice::classify(Some("UNPARSABLE_SPEAK"), "Unknown voice aura-x"),
            ProviderNotice::VoiceOrModel
        );
        assert_eq!(
            ProviderNotice::classify(Some("INVALID_AUTH"), "token expired"),
            ProviderNotice::Fatal
        );
    }
}
