use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::speech::{MAX_SPEECH_INPUT, MIN_SPEECH_INPUT};

pub const API_KEY_VAR: &str = "OPENAI_API_KEY";
pub const BASE_URL_VAR: &str = "OPENAI_BASE_URL";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub model: String,
    pub speech_model: String,
    pub voice: String,
    /// Largest text, in bytes, sent in a single speech request.
    pub max_speech_input: usize,
    /// How many reply snapshots a slow display may fall behind by.
    pub update_buffer: usize,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            speech_model: "tts-1".to_string(),
            voice: "nova".to_string(),
            max_speech_input: MAX_SPEECH_INPUT,
            update_buffer: 64,
            log_filter: None,
        }
    }
}

impl Config {
    /// Apply environment overrides, reading variables through `var`.
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = var(BASE_URL_VAR).filter(|value| !value.trim().is_empty()) {
            self.base_url = base_url.trim().to_string();
        }
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_speech_input < MIN_SPEECH_INPUT {
            return Err(format!(
                "max_speech_input must be at least {MIN_SPEECH_INPUT}, got {}",
                self.max_speech_input
            ));
        }
        Ok(())
    }

    pub fn log_filter_or_default(&self) -> &str {
        self.log_filter.as_deref().unwrap_or("warn")
    }
}

/// Show a path with the home directory abbreviated to `~`.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
