//! ElevenLabs Conversational AI adapter.
//!
//! Implements [`fourthwall_core::voice::VoiceAgent`] on top of the agent's
//! WebSocket endpoint. Microphone PCM goes up as base64 chunks; agent speech
//! comes back as audio events and is handed to an [`client::AudioOutput`].

pub mod client;
pub mod protocol;

pub use client::{AudioOutput, DEFAULT_ENDPOINT, ElevenLabsAgent, NullOutput};
