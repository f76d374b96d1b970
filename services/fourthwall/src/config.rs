use secrecy::SecretString;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_FAILURE_DISPLAY_MS: u64 = 2000;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub backend_url: String,
    pub agent_id: String,
    pub elevenlabs_api_key: Option<SecretString>,
    pub access_token: Option<String>,
    pub first_message: Option<String>,
    pub failure_display: Duration,
    pub log_level: Level,
}

fn non_blank(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let backend_url =
            non_blank("FOURTHWALL_BACKEND_URL").unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());

        let agent_id = non_blank("ELEVENLABS_AGENT_ID")
            .ok_or_else(|| ConfigError::MissingVar("ELEVENLABS_AGENT_ID".to_string()))?;

        let elevenlabs_api_key = non_blank("ELEVENLABS_API_KEY").map(SecretString::from);
        let access_token = non_blank("FOURTHWALL_ACCESS_TOKEN");
        let first_message = non_blank("FOURTHWALL_FIRST_MESSAGE");

        let failure_display = match non_blank("FOURTHWALL_FAILURE_DISPLAY_MS") {
            Some(ms) => Duration::from_millis(ms.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue(
                    "FOURTHWALL_FAILURE_DISPLAY_MS".to_string(),
                    e.to_string(),
                )
            })?),
            None => Duration::from_millis(DEFAULT_FAILURE_DISPLAY_MS),
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            backend_url,
            agent_id,
            elevenlabs_api_key,
            access_token,
            first_message,
            failure_display,
            log_level,
        })
    }
}
