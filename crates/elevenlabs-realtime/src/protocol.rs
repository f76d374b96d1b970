//! Wire format of the ElevenLabs Conversational AI WebSocket.

use serde::{Deserialize, Serialize};

/// Messages sent to the agent.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first message on a new connection.
    ConversationInitiationClientData {
        conversation_config_override: ConversationConfigOverride,
    },
    Pong {
        event_id: u64,
    },
}

/// Microphone audio. Unlike every other message it carries no `type`.
#[derive(Serialize, Debug, Clone)]
pub struct UserAudioChunk {
    pub user_audio_chunk: String,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct ConversationConfigOverride {
    pub agent: AgentOverride,
    pub tts: TtsOverride,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct AgentOverride {
    pub prompt: PromptOverride,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct PromptOverride {
    pub prompt: String,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct TtsOverride {
    pub voice_id: String,
}

/// Messages received from the agent.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ConversationInitiationMetadata {
        #[serde(default)]
        conversation_initiation_metadata_event: InitiationMetadata,
    },
    Audio {
        audio_event: AudioEvent,
    },
    AgentResponse {
        agent_response_event: AgentResponseEvent,
    },
    UserTranscript {
        user_transcription_event: UserTranscriptionEvent,
    },
    Interruption {},
    Ping {
        ping_event: PingEvent,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct InitiationMetadata {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub agent_output_audio_format: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AudioEvent {
    pub audio_base_64: String,
    #[serde(default)]
    pub event_id: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AgentResponseEvent {
    pub agent_response: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UserTranscriptionEvent {
    pub user_transcript: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PingEvent {
    pub event_id: u64,
    #[serde(default)]
    pub ping_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initiation_serialization() {
        let event = ClientEvent::ConversationInitiationClientData {
            conversation_config_override: ConversationConfigOverride {
                agent: AgentOverride {
                    prompt: PromptOverride {
                        prompt: "You are Captain Ahab.".into(),
                    },
                    first_message: Some("Avast!".into()),
                },
                tts: TtsOverride {
                    voice_id: "goT3UYdM9bhm0n2lmKQx".into(),
                },
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "conversation_initiation_client_data",
                "conversation_config_override": {
                    "agent": {
                        "prompt": { "prompt": "You are Captain Ahab." },
                        "first_message": "Avast!"
                    },
                    "tts": { "voice_id": "goT3UYdM9bhm0n2lmKQx" }
                }
            })
        );
    }

    #[test]
    fn test_first_message_is_omitted_when_absent() {
        let value = serde_json::to_value(AgentOverride::default()).unwrap();
        assert!(value.get("first_message").is_none());
    }

    #[test]
    fn test_pong_and_audio_chunk_shapes() {
        let pong = serde_json::to_value(ClientEvent::Pong { event_id: 3 }).unwrap();
        assert_eq!(pong, json!({"type": "pong", "event_id": 3}));

        let chunk = serde_json::to_value(UserAudioChunk {
            user_audio_chunk: "AAA=".into(),
        })
        .unwrap();
        assert_eq!(chunk, json!({"user_audio_chunk": "AAA="}));
    }

    #[test]
    fn test_server_event_deserialization() {
        let audio: ServerEvent = serde_json::from_str(
            r#"{"type":"audio","audio_event":{"audio_base_64":"AAA=","event_id":4}}"#,
        )
        .unwrap();
        assert!(matches!(audio, ServerEvent::Audio { audio_event } if audio_event.event_id == 4));

        let ping: ServerEvent =
            serde_json::from_str(r#"{"type":"ping","ping_event":{"event_id":9,"ping_ms":null}}"#)
                .unwrap();
        assert!(matches!(ping, ServerEvent::Ping { ping_event } if ping_event.event_id == 9));

        let interruption: ServerEvent = serde_json::from_str(
            r#"{"type":"interruption","interruption_event":{"event_id":2}}"#,
        )
        .unwrap();
        assert!(matches!(interruption, ServerEvent::Interruption {}));
    }

    #[test]
    fn test_unknown_server_event() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"vad_score","vad_score_event":{"vad_score":0.9}}"#)
                .unwrap();
        assert!(matches!(event, ServerEvent::Unknown));
    }
}
