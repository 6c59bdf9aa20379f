//! OpenAI-compatible chat completions over server-sent events.

use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{endpoint_url, ChatMessage, ChatRequest, ChatResponse};
use crate::core::generation::{FragmentStream, GenerationError, Generator};

type FragmentSender = mpsc::UnboundedSender<Result<String, GenerationError>>;

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Fragment(String),
    Done,
    Error(String),
    Skip,
}

fn extract_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim_start)
}

fn parse_sse_line(line: &str) -> SseEvent {
    let Some(payload) = extract_data_payload(line) else {
        return SseEvent::Skip;
    };
    if payload == "[DONE]" {
        return SseEvent::Done;
    }
    if payload.trim().is_empty() {
        return SseEvent::Skip;
    }

    match serde_json::from_str::<ChatResponse>(payload) {
        Ok(response) => response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(SseEvent::Skip, SseEvent::Fragment),
        Err(_) => SseEvent::Error(format_api_error(payload)),
    }
}

fn extract_error_summary(value: &serde_json::Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .or_else(|| value.get("error").and_then(|v| v.as_str()))
        .or_else(|| value.get("message").and_then(|v| v.as_str()))?;
    let collapsed = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    (!collapsed.is_empty()).then_some(collapsed)
}

/// Turn an error body into one readable line for the terminal.
pub(crate) fn format_api_error(error_text: &str) -> String {
    const MAX_BODY: usize = 300;

    let trimmed = error_text.trim();
    if trimmed.is_empty() {
        return "API error: <empty response>".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(summary) = extract_error_summary(&json_value) {
            return format!("API error: {summary}");
        }
        return format!("API error: {json_value}");
    }

    let body: String = trimmed.chars().take(MAX_BODY).collect();
    if body.len() < trimmed.len() {
        format!("API error: {body}…")
    } else {
        format!("API error: {body}")
    }
}

/// Streams replies from any backend speaking the OpenAI chat completions API.
#[derive(Clone)]
pub struct OpenAiGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiGenerator {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn stream(&self, history: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: history,
            stream: true,
        };
        debug!(model = %self.model, messages = request.messages.len(), "Sending chat request");

        let response = self
            .client
            .post(endpoint_url(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| GenerationError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(GenerationError::Api(format_api_error(&error_text)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_events(response, tx));
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

/// Forward fragments until `[DONE]`, an error, or the consumer going away.
async fn pump_events(response: reqwest::Response, tx: FragmentSender) {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => return,
            chunk = stream.next() => chunk,
        };
        let chunk_bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                let _ = tx.send(Err(GenerationError::Stream(err.to_string())));
                return;
            }
            None => return,
        };
        buffer.extend_from_slice(&chunk_bytes);

        while let Some(newline_pos) = memchr(b'\n', &buffer) {
            let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
            let line_str = match std::str::from_utf8(&line) {
                Ok(s) => s.trim(),
                Err(err) => {
                    warn!(error = %err, "Skipping invalid UTF-8 line in stream");
                    continue;
                }
            };

            match parse_sse_line(line_str) {
                SseEvent::Skip => {}
                SseEvent::Fragment(content) => {
                    if tx.send(Ok(content)).is_err() {
                        return;
                    }
                }
                SseEvent::Done => return,
                SseEvent::Error(message) => {
                    let _ = tx.send(Err(GenerationError::Api(message)));
                    return;
                }
            }
        }
    }
}
