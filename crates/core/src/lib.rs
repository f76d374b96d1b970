//! Fourth Wall core library.
//!
//! Everything needed to browse a library of books, mount a cast of character
//! cards and hold a live voice conversation with one character at a time.
//! Presentation and concrete audio/voice providers plug in through the
//! [`card::CardRegistry`], [`voice::Microphone`] and [`voice::VoiceAgent`]
//! traits.

pub mod audio_utils;
pub mod card;
pub mod controller;
pub mod error;
pub mod library_client;
pub mod models;
pub mod sidebar;
pub mod title;
pub mod visualizer;
pub mod voice;
