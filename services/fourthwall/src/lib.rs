//! Fourth Wall Terminal Front End
//!
//! Wires the core library to real devices: `cpal` audio, the ElevenLabs
//! agent and a line-oriented console. The `fourthwall` binary is a thin
//! wrapper around this library.

pub mod app;
pub mod audio;
pub mod config;
pub mod console;
