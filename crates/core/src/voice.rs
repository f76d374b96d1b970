//! Voice-agent and microphone seams.
//!
//! The controller never talks to a concrete voice provider or audio device.
//! Providers implement [`VoiceAgent`] and report back through an
//! [`EventSink`]; audio devices implement [`Microphone`].

use crate::error::{MicError, SessionError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Sample rate of the PCM chunks published by a [`MicTap`].
pub const MIC_SAMPLE_RATE: u32 = 16_000;

/// Appended to every character prompt before a session is opened.
pub const PROMPT_SUFFIX: &str = "\n\nStay in character at all times. You are speaking aloud in a live voice \
conversation, so keep replies short and conversational, and never mention that you are an AI.";

/// Who produced a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSource {
    User,
    Agent,
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageSource::User => write!(f, "you"),
            MessageSource::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Speaking,
    Listening,
}

/// Everything a voice provider can report about a session.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The provider acknowledged the session.
    Connected,
    /// The session closed, either on request or from the provider's side.
    Disconnected,
    Error(String),
    ModeChange(AgentMode),
    Message { source: MessageSource, message: String },
}

/// Parameters used to open a session for one character.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub agent_id: String,
    pub voice_id: String,
    pub prompt: String,
    pub first_message: Option<String>,
    pub character_name: String,
}

impl SessionConfig {
    pub fn for_character(
        agent_id: &str,
        character: &crate::models::Character,
        first_message: Option<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            voice_id: character.assigned_voice_id.clone(),
            prompt: format!("{}{}", character.system_prompt, PROMPT_SUFFIX),
            first_message,
            character_name: character.name.clone(),
        }
    }
}

/// Delivers provider events to the controller, tagged with the generation of
/// the session that produced them.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, AgentEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, AgentEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the controller is gone.
    pub fn emit(&self, event: AgentEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// A live microphone. Dropping the last handle releases the device.
pub trait MicTap: Send + Sync {
    /// Latest RMS level of the input, in `0.0..=1.0`.
    fn level(&self) -> f32;
    /// Mono PCM16 chunks at [`MIC_SAMPLE_RATE`].
    fn subscribe(&self) -> broadcast::Receiver<Arc<[i16]>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn acquire(&self) -> Result<Arc<dyn MicTap>, MicError>;
}

/// An open session with the voice provider.
#[async_trait]
pub trait AgentSession: Send {
    /// Closes the session and waits until the provider has confirmed it.
    async fn close(self: Box<Self>) -> Result<(), SessionError>;
}

#[async_trait]
pub trait VoiceAgent: Send + Sync {
    /// Starts opening a session. A returned handle is not yet connected; the
    /// provider emits [`AgentEvent::Connected`] once it acknowledges.
    async fn open(
        &self,
        config: SessionConfig,
        mic: Arc<dyn MicTap>,
        events: EventSink,
    ) -> Result<Box<dyn AgentSession>, SessionError>;
}
