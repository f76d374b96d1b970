//! Error taxonomy shared by every Fourth Wall component.
//!
//! Each enum is scoped to one collaborator so that the controller can decide
//! which card (or which region of the screen) an error belongs to.

use thiserror::Error;

/// Failure to obtain microphone access. Both variants surface to the user
/// as a denied microphone on the requesting card.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MicError {
    #[error("Microphone access denied")]
    Denied,
    #[error("Microphone unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the external voice-agent session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("Failed to open voice session: {0}")]
    Open(String),
    #[error("Voice session failed: {0}")]
    Runtime(String),
    #[error("Failed to close voice session: {0}")]
    Close(String),
}

/// Failures of the book library backend.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("File is {size} bytes, uploads must be smaller than {limit} bytes")]
    OversizedUpload { size: u64, limit: u64 },
    #[error("Could not read upload: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for LibraryError {
    fn from(e: reqwest::Error) -> Self {
        LibraryError::Backend(e.to_string())
    }
}
