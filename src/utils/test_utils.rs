#[cfg(test)]
use crate::api::ChatMessage;
#[cfg(test)]
use crate::audio::segmented::Segment;
#[cfg(test)]
use crate::core::cancellation::CancellationRegistry;
#[cfg(test)]
use crate::core::conversation::ConversationStore;
#[cfg(test)]
use crate::core::generation::{FragmentStream, GenerationError, Generator};
#[cfg(test)]
use crate::core::message::Turn;
#[cfg(test)]
use crate::core::session::SessionContext;
#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use std::collections::VecDeque;
#[cfg(test)]
use std::io::{self, Read};
#[cfg(test)]
use std::sync::{Arc, Mutex};
#[cfg(test)]
use tokio::sync::{broadcast, mpsc};

#[cfg(test)]
pub fn test_context(
    generator: Arc<dyn Generator>,
    updates: Option<broadcast::Sender<Turn>>,
) -> SessionContext {
    SessionContext {
        store: ConversationStore::new(),
        registry: CancellationRegistry::new(),
        generator,
        updates,
    }
}

/// Replays a fixed list of fragments for every request, optionally ending in
/// an error instead of a clean end-of-stream.
#[cfg(test)]
pub struct ScriptedGenerator {
    fragments: Vec<String>,
    failure: Option<GenerationError>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

#[cfg(test)]
impl ScriptedGenerator {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            failure: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_with(mut self, error: GenerationError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Generator for ScriptedGenerator {
    async fn stream(&self, history: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError> {
        self.requests.lock().unwrap().push(history);
        let mut items: Vec<Result<String, GenerationError>> =
            self.fragments.iter().cloned().map(Ok).collect();
        if let Some(failure) = &self.failure {
            items.push(Err(failure.clone()));
        }
        Ok(Box::pin(futures_util::stream::iter(items)))
    }
}

/// Hands each request a stream fed by the test through [`ManualGenerator::feed`],
/// so fragments arrive exactly when the test sends them.
#[cfg(test)]
pub struct ManualGenerator {
    pending: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<String, GenerationError>>>>,
}

#[cfg(test)]
impl ManualGenerator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a stream for the next request. Dropping the sender ends it.
    pub fn feed(&self) -> mpsc::UnboundedSender<Result<String, GenerationError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().unwrap().push_back(rx);
        tx
    }
}

#[cfg(test)]
#[async_trait]
impl Generator for ManualGenerator {
    async fn stream(&self, _history: Vec<ChatMessage>) -> Result<FragmentStream, GenerationError> {
        let rx = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| GenerationError::Request("no stream queued".into()))?;
        Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

/// In-memory segment that records whether it was closed and can be told to
/// fail reads or closing.
#[cfg(test)]
pub struct TestSegment {
    data: io::Cursor<Vec<u8>>,
    pub closed: Arc<Mutex<bool>>,
    fail_reads: usize,
    fail_close: bool,
}

#[cfg(test)]
impl TestSegment {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: io::Cursor::new(data.to_vec()),
            closed: Arc::new(Mutex::new(false)),
            fail_reads: 0,
            fail_close: false,
        }
    }

    /// Fail the next `count` reads before serving data.
    pub fn failing_reads(mut self, count: usize) -> Self {
        self.fail_reads = count;
        self
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn closed_flag(&self) -> Arc<Mutex<bool>> {
        Arc::clone(&self.closed)
    }
}

#[cfg(test)]
impl Read for TestSegment {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads > 0 {
            self.fail_reads -= 1;
            return Err(io::Error::other("segment read failed"));
        }
        self.data.read(buf)
    }
}

#[cfg(test)]
impl Segment for TestSegment {
    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock().unwrap() = true;
        if self.fail_close {
            Err(io::Error::other("segment close failed"))
        } else {
            Ok(())
        }
    }
}
