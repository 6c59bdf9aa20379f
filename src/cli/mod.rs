//! Command-line interface parsing and handling

pub mod chat;
pub mod say;
pub mod speak;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::audio::openai::OpenAiSpeech;
use crate::core::chat_stream::OpenAiGenerator;
use crate::core::config::data::API_KEY_VAR;
use crate::core::config::Config;
use crate::core::engine::ChatEngine;

#[derive(Parser)]
#[command(name = "palaver")]
#[command(about = "Streaming terminal chat with an OpenAI-compatible API")]
#[command(
    long_about = "Palaver streams replies from an OpenAI-compatible API straight into your \
terminal, and can read them aloud into an mp3 file.\n\n\
Environment Variables:\n\
  OPENAI_API_KEY    Your API key (required)\n\
  OPENAI_BASE_URL   Custom API base URL (optional, defaults to https://api.openai.com/v1)\n\
  RUST_LOG          Diagnostic log filter, written to stderr\n\n\
Chat commands:\n\
  /retry            Regenerate the last reply\n\
  /system <text>    Add context the model should see\n\
  /file <path>      Add a file's contents as context\n\
  /save <path>      Write the last reply to a file\n\
  /prev, /next      Show the previous or next exchange\n\
  /quit             Leave the chat\n\
  Ctrl+C            Stop the reply being streamed, or quit when idle"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Model to use instead of the configured one
    #[arg(short = 'm', long, global = true, value_name = "MODEL")]
    pub model: Option<String>,

    /// Read configuration from this file instead of the per-user config
    #[arg(short = 'c', long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive chat (default)
    Chat {
        /// Append finished exchanges to a transcript file
        #[arg(short = 'l', long, value_name = "FILE")]
        log: Option<PathBuf>,
    },
    /// Send a single prompt and print the reply
    Say {
        /// Also write the reply as speech to this mp3 file
        #[arg(long, value_name = "FILE")]
        speak: Option<PathBuf>,
        #[arg(required = true, trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Convert a text file to speech
    Speak {
        input: PathBuf,
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,
    },
}

/// Everything needed to reach the API.
pub struct Backend {
    pub config: Config,
    client: reqwest::Client,
    api_key: String,
}

impl Backend {
    pub fn from_env(config: Config) -> Result<Self, Box<dyn Error>> {
        let api_key = std::env::var(API_KEY_VAR)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| format!("{API_KEY_VAR} is not set"))?;
        Ok(Self {
            config,
            client: reqwest::Client::new(),
            api_key,
        })
    }

    pub fn engine(&self) -> ChatEngine {
        let generator = OpenAiGenerator::new(
            self.client.clone(),
            &self.config.base_url,
            &self.api_key,
            &self.config.model,
        );
        ChatEngine::new(Arc::new(generator), self.config.update_buffer)
    }

    pub fn speech(&self) -> OpenAiSpeech {
        OpenAiSpeech::new(
            self.client.clone(),
            &self.config.base_url,
            &self.api_key,
            &self.config.speech_model,
            &self.config.voice,
        )
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter_or_default()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(model) = args.model {
        config.model = model;
    }
    init_tracing(&config);

    tokio::runtime::Runtime::new()?.block_on(async_main(args.command, config))
}

async fn async_main(command: Option<Commands>, config: Config) -> Result<(), Box<dyn Error>> {
    let backend = Backend::from_env(config)?;
    match command.unwrap_or(Commands::Chat { log: None }) {
        Commands::Chat { log } => chat::run_chat(&backend, log).await,
        Commands::Say { speak, prompt } => say::run_say(&backend, prompt, speak).await,
        Commands::Speak { input, output } => speak::run_speak(&backend, &input, &output).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_is_the_default_command() {
        let args = Args::try_parse_from(["palaver", "--model", "gpt-4.1"]).expect("parse");
        assert!(args.command.is_none());
        assert_eq!(args.model.as_deref(), Some("gpt-4.1"));
    }

    #[test]
    fn say_collects_prompt_words() {
        let args = Args::try_parse_from([
            "palaver", "say", "--speak", "out.mp3", "tell", "me", "a", "joke",
        ])
        .expect("parse");
        match args.command {
            Some(Commands::Say { speak, prompt }) => {
                assert_eq!(speak, Some(PathBuf::from("out.mp3")));
                assert_eq!(prompt.join(" "), "tell me a joke");
            }
            _ => panic!("expected say"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let args = Args::try_parse_from([
            "palaver", "speak", "notes.txt", "-o", "notes.mp3", "-c", "alt.toml",
        ])
        .expect("parse");
        assert_eq!(args.config, Some(PathBuf::from("alt.toml")));
        assert!(matches!(args.command, Some(Commands::Speak { .. })));
    }

    #[test]
    fn say_requires_a_prompt() {
        assert!(Args::try_parse_from(["palaver", "say"]).is_err());
    }
}
