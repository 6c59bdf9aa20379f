use std::io::Cursor;

use async_trait::async_trait;
use tracing::debug;

use crate::api::{endpoint_url, SpeechRequest};
use crate::audio::segmented::Segment;
use crate::audio::speech::{SpeechError, SpeechSynthesizer};
use crate::core::chat_stream::format_api_error;
use crate::core::generation::GenerationError;

/// Speech from the OpenAI `/audio/speech` endpoint, returned as mp3.
#[derive(Clone)]
pub struct OpenAiSpeech {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: voice.into(),
        }
    }

    fn request_for(&self, text: &str) -> SpeechRequest {
        SpeechRequest {
            model: self.model.clone(),
            input: text.to_string(),
            voice: self.voice.clone(),
            response_format: "mp3".to_string(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn synthesize(&self, text: &str) -> Result<Box<dyn Segment>, SpeechError> {
        let response = self
            .client
            .post(endpoint_url(&self.base_url, "audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&self.request_for(text))
            .send()
            .await
            .map_err(|err| GenerationError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(GenerationError::Api(format_api_error(&error_text)).into());
        }

        let audio = response
            .bytes()
            .await
            .map_err(|err| GenerationError::Stream(err.to_string()))?;
        debug!(input = text.len(), audio = audio.len(), "Synthesized speech part");
        Ok(Box::new(Cursor::new(audio.to_vec())))
    }
}
