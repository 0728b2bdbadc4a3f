//! Application Configuration Module
//!
//! Loads the companion service settings from environment variables into a single struct
//! that the rest of the binary reads from.

use companion_core::SessionOptions;
use companion_core::tutor::DEFAULT_CONTEXT_WINDOW;
use secrecy::SecretString;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o";
pub const DEFAULT_CAPTURE_RESTART_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TutorProvider {
    Gemini,
    OpenAI,
}

/// Holds all configuration loaded from the environment.
#[derive(Debug)]
pub struct Config {
    pub provider: TutorProvider,
    pub api_key: SecretString,
    pub model: String,
    pub context_window: usize,
    pub capture_restart_delay: Duration,
    pub prompts_dir: PathBuf,
    pub history_file: PathBuf,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Unknown tutor provider {0:?}; expected \"gemini\" or \"openai\"")]
    InvalidProvider(String),
    #[error("Invalid value for {var}: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `TUTOR_PROVIDER`: "gemini" or "openai". Defaults to "gemini".
    // *   `GEMINI_API_KEY` / `OPENAI_API_KEY`: required for the selected provider.
    // *   `TUTOR_MODEL`: defaults to "gemini-1.5-flash" or "gpt-4o" depending on the provider.
    // *   `CONTEXT_WINDOW`: transcript entries sent as context. Defaults to 10.
    // *   `CAPTURE_RESTART_MS`: pause before re-arming recognition. Defaults to 100.
    // *   `PROMPTS_DIR`: directory holding prompt overrides. Defaults to "prompts".
    // *   `HISTORY_FILE`: JSON-lines session history. Defaults to "session_history.jsonl".
    // *   `RUST_LOG`: "TRACE", "DEBUG", "INFO", "WARN" or "ERROR". Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file. Ignored if not present.
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let provider = match lookup("TUTOR_PROVIDER") {
            None => TutorProvider::Gemini,
            Some(value) => match value.trim().to_lowercase().as_str() {
                "gemini" => TutorProvider::Gemini,
                "openai" => TutorProvider::OpenAI,
                _ => return Err(ConfigError::InvalidProvider(value)),
            },
        };

        let (key_var, default_model) = match provider {
            TutorProvider::Gemini => ("GEMINI_API_KEY", DEFAULT_GEMINI_MODEL),
            TutorProvider::OpenAI => ("OPENAI_API_KEY", DEFAULT_OPENAI_MODEL),
        };
        let api_key = lookup(key_var)
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| {
                ConfigError::MissingVar(format!("{key_var} must be set for the selected provider"))
            })?;

        let model = lookup("TUTOR_MODEL").unwrap_or_else(|| default_model.to_string());

        let context_window = match lookup("CONTEXT_WINDOW") {
            None => DEFAULT_CONTEXT_WINDOW,
            Some(value) => match value.trim().parse::<usize>() {
                Ok(window) if window >= 1 => window,
                _ => {
                    return Err(ConfigError::InvalidNumber {
                        var: "CONTEXT_WINDOW",
                        value,
                    });
                }
            },
        };

        let restart_ms = match lookup("CAPTURE_RESTART_MS") {
            None => DEFAULT_CAPTURE_RESTART_MS,
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "CAPTURE_RESTART_MS",
                    value,
                })?,
        };

        let prompts_dir = PathBuf::from(lookup("PROMPTS_DIR").unwrap_or_else(|| "prompts".to_string()));
        let history_file = PathBuf::from(
            lookup("HISTORY_FILE").unwrap_or_else(|| "session_history.jsonl".to_string()),
        );

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            provider,
            api_key,
            model,
            context_window,
            capture_restart_delay: Duration::from_millis(restart_ms),
            prompts_dir,
            history_file,
            log_level,
        })
    }

    /// Session tunables derived from this configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            capture_restart_delay: self.capture_restart_delay,
            ..SessionOptions::default()
        }
    }
}
