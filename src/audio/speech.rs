//! Text-to-speech delivered as one continuous stream.
//!
//! Speech backends cap the size of a single request, so long text is split
//! on line boundaries and each part is synthesized separately. The first part
//! is synthesized before [`speak_segmented`] returns; the rest are produced by
//! a background task while the caller is already reading.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::audio::segmented::{Segment, SegmentProducer, SegmentedStream};
use crate::core::generation::GenerationError;

/// Default request size limit, in bytes.
pub const MAX_SPEECH_INPUT: usize = 4096;

/// Smallest limit every part can honor: one byte more than the widest
/// UTF-8 char.
pub const MIN_SPEECH_INPUT: usize = 5;

#[derive(Debug)]
pub enum SpeechError {
    EmptyInput,
    Backend(GenerationError),
    Io(io::Error),
}

impl fmt::Display for SpeechError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeechError::EmptyInput => write!(f, "nothing to speak"),
            SpeechError::Backend(err) => write!(f, "speech synthesis failed: {err}"),
            SpeechError::Io(err) => write!(f, "speech output failed: {err}"),
        }
    }
}

impl Error for SpeechError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SpeechError::EmptyInput => None,
            SpeechError::Backend(err) => Some(err),
            SpeechError::Io(err) => Some(err),
        }
    }
}

impl From<GenerationError> for SpeechError {
    fn from(value: GenerationError) -> Self {
        SpeechError::Backend(value)
    }
}

impl From<io::Error> for SpeechError {
    fn from(value: io::Error) -> Self {
        SpeechError::Io(value)
    }
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize one part that already fits the backend's size limit.
    async fn synthesize(&self, text: &str) -> Result<Box<dyn Segment>, SpeechError>;
}

impl Segment for Box<dyn Segment> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Split `text` into parts shorter than `max_input` bytes.
///
/// Text already under the limit is returned whole. Otherwise lines (kept with
/// their trailing newline) are packed greedily, starting a new part whenever
/// the next line would reach the limit. A line that alone reaches the limit
/// is cut on char boundaries. No part is empty.
///
/// Below [`MIN_SPEECH_INPUT`] a char may not fit under the limit. Such a char
/// becomes a part of its own, so parts never split a char but may reach
/// `max_input`.
pub fn split_for_speech(text: &str, max_input: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.len() < max_input {
        return vec![text.to_string()];
    }

    let limit = max_input.saturating_sub(1).max(1);
    let mut parts = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        for piece in cut_line(line, limit) {
            if !current.is_empty() && current.len() + piece.len() > limit {
                parts.push(std::mem::take(&mut current));
            }
            current.push_str(piece);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn cut_line(line: &str, limit: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = line;
    while rest.len() > limit {
        let mut cut = limit;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(cut);
        pieces.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }
    pieces
}

/// Speech for a whole text, readable while later parts are still being made.
pub struct SpeechStream {
    pub stream: SegmentedStream,
    /// Background production of every part after the first. `None` when the
    /// text fit in a single part.
    pub producer: Option<JoinHandle<Result<(), SpeechError>>>,
    pub parts: usize,
}

impl SpeechStream {
    /// Copy the whole stream into `path`, then report any failure of the
    /// background producer. Returns the number of bytes written.
    pub async fn write_to(self, path: &Path) -> Result<u64, SpeechError> {
        let SpeechStream {
            mut stream,
            producer,
            ..
        } = self;
        let path = path.to_path_buf();

        // Reading blocks while later parts are pending, keep it off the runtime.
        let written = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            let mut file = std::fs::File::create(&path)?;
            let written = io::copy(&mut stream, &mut file)?;
            stream.close()?;
            Ok(written)
        })
        .await
        .map_err(io::Error::other)??;

        if let Some(producer) = producer {
            producer.await.map_err(io::Error::other)??;
        }
        Ok(written)
    }
}

/// Synthesize `text` as a [`SpeechStream`].
///
/// Errors on the first part are returned directly. Errors on later parts end
/// the stream after the parts produced so far and are reported through
/// [`SpeechStream::producer`]. The stream must be read from a blocking
/// context, since reads wait for the background producer.
pub async fn speak_segmented(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    text: &str,
    max_input: usize,
) -> Result<SpeechStream, SpeechError> {
    if text.trim().is_empty() {
        return Err(SpeechError::EmptyInput);
    }
    let mut parts = split_for_speech(text, max_input).into_iter();
    let Some(first) = parts.next() else {
        return Err(SpeechError::EmptyInput);
    };
    let rest: Vec<String> = parts.collect();
    let total = rest.len() + 1;

    let stream = SegmentedStream::new();
    stream.append(synthesizer.synthesize(&first).await?);

    let producer = if rest.is_empty() {
        None
    } else {
        Some(tokio::spawn(produce_remaining(
            synthesizer,
            rest,
            stream.producer(),
        )))
    };

    Ok(SpeechStream {
        stream,
        producer,
        parts: total,
    })
}

async fn produce_remaining(
    synthesizer: Arc<dyn SpeechSynthesizer>,
    parts: Vec<String>,
    appender: SegmentProducer,
) -> Result<(), SpeechError> {
    let total = parts.len() + 1;
    for (index, part) in parts.iter().enumerate() {
        if appender.is_closed() {
            debug!(part = index + 2, "Speech reader closed, stopping synthesis");
            return Ok(());
        }
        let segment = synthesizer.synthesize(part).await?;
        debug!(part = index + 2, total, bytes = part.len(), "Speech part ready");
        if !appender.append(segment) {
            return Ok(());
        }
    }
    appender.finish();
    Ok(())
}
