//! The generation capability consumed by streaming sessions.
//!
//! A [`Generator`] turns an ordered conversation history into a stream of
//! text fragments. Dropping the returned stream abandons the request, which
//! is how a cancelled session stops a generation it no longer wants.

use std::error::Error;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

use crate::api::ChatMessage;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The request never produced a response (connection, TLS, timeout).
    Request(String),
    /// The backend answered with an error payload.
    Api(String),
    /// The response stream broke off or carried data we could not read.
    Stream(String),
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Request(msg) => write!(f, "request failed: {msg}"),
            GenerationError::Api(msg) => f.write_str(msg),
            GenerationError::Stream(msg) => write!(f, "stream interrupted: {msg}"),
        }
    }
}

impl Error for GenerationError {}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Begin generating a reply to `history`.
    ///
    /// The returned stream yields fragments in the order the backend emits
    /// them and ends on natural end-of-stream.
    async fn stream(&self, history: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError>;

    /// Run a generation to completion and return the whole reply.
    async fn complete(&self, history: Vec<ChatMessage>) -> Result<String, GenerationError> {
        let mut stream = self.stream(history).await?;
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            reply.push_str(&fragment?);
        }
        Ok(reply)
    }
}

/// Wrap an already complete reply as a single-fragment stream, for backends
/// that only answer in one piece.
pub fn single_fragment(reply: String) -> FragmentStream {
    Box::pin(futures_util::stream::once(async move { Ok(reply) }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::ScriptedGenerator;

    #[tokio::test]
    async fn complete_concatenates_fragments() {
        let generator = ScriptedGenerator::new(["Hel", "lo", "!"]);
        let reply = generator.complete(Vec::new()).await.expect("reply");
        assert_eq!(reply, "Hello!");
    }

    #[tokio::test]
    async fn complete_surfaces_mid_stream_errors() {
        let generator =
            ScriptedGenerator::new(["partial"]).failing_with(GenerationError::Api("boom".into()));
        let err = generator.complete(Vec::new()).await.expect_err("error");
        assert_eq!(err, GenerationError::Api("boom".into()));
    }

    #[tokio::test]
    async fn single_fragment_yields_once() {
        let mut stream = single_fragment("whole".into());
        assert_eq!(stream.next().await, Some(Ok("whole".to_string())));
        assert!(stream.next().await.is_none());
    }
}
