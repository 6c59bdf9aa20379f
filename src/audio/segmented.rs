//! One readable stream stitched together from segments that arrive over time.
//!
//! Segments are read strictly in the order they were appended. A segment is
//! closed and evicted as soon as it reports end-of-data, and the read carries
//! on with the next one inside the same call. While a [`SegmentProducer`] is
//! alive, an exhausted queue means "more is coming" and reads wait for it;
//! once every producer is gone an empty queue is end-of-data.
//!
//! Close errors follow one policy everywhere: keep closing the remaining
//! segments, report the first failure, log the others.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

/// A byte source that can be assembled into a [`SegmentedStream`].
pub trait Segment: Read + Send {
    /// Release whatever the segment holds. Called once, after end-of-data or
    /// when the stream is closed early.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Segment for Cursor<Vec<u8>> {}

impl Segment for File {}

#[derive(Default)]
struct Queue {
    pending: VecDeque<Box<dyn Segment>>,
    producers: usize,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when the consuming side has already been closed. A
    /// refused segment is closed on the spot.
    fn push(&self, mut segment: Box<dyn Segment>) -> bool {
        let mut queue = self.lock();
        if queue.closed {
            drop(queue);
            if let Err(err) = segment.close() {
                warn!(error = %err, "Refused segment failed to close");
            }
            return false;
        }
        queue.pending.push_back(segment);
        drop(queue);
        self.ready.notify_all();
        true
    }
}

/// Reading side. Only one reader exists, so the segment being read is owned
/// outside the lock and appends never wait on a slow read.
pub struct SegmentedStream {
    current: Option<Box<dyn Segment>>,
    shared: Arc<Shared>,
    deferred_error: Option<io::Error>,
}

impl Default for SegmentedStream {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentedStream {
    pub fn new() -> Self {
        Self {
            current: None,
            shared: Arc::new(Shared::default()),
            deferred_error: None,
        }
    }

    /// Add a segment to the tail. Safe to call while a read is in progress.
    pub fn append(&self, segment: impl Segment + 'static) {
        if !self.shared.push(Box::new(segment)) {
            debug!("Segment appended to a closed stream, dropping it");
        }
    }

    /// A handle for appending from another task or thread. Reads wait for
    /// more segments until every producer has been dropped or finished.
    pub fn producer(&self) -> SegmentProducer {
        self.shared.lock().producers += 1;
        SegmentProducer {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Segments queued behind the one currently being read.
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Close every remaining segment.
    ///
    /// All segments are closed even if some fail; the first failure (including
    /// one recorded while evicting an exhausted segment) is returned and the
    /// rest are logged. Later appends are closed and dropped.
    pub fn close(&mut self) -> io::Result<()> {
        let remaining: Vec<_> = {
            let mut queue = self.shared.lock();
            queue.closed = true;
            queue.pending.drain(..).collect()
        };
        self.shared.ready.notify_all();

        let mut first = self.deferred_error.take();
        for mut segment in self.current.take().into_iter().chain(remaining) {
            if let Err(err) = segment.close() {
                if first.is_none() {
                    first = Some(err);
                } else {
                    warn!(error = %err, "Additional segment failed to close");
                }
            }
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_segment(&self) -> Option<Box<dyn Segment>> {
        let mut queue = self.shared.lock();
        loop {
            if let Some(segment) = queue.pending.pop_front() {
                return Some(segment);
            }
            if queue.producers == 0 || queue.closed {
                return None;
            }
            queue = self
                .shared
                .ready
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn evict_current(&mut self) {
        if let Some(mut segment) = self.current.take() {
            debug!("Segment exhausted, moving to next");
            if let Err(err) = segment.close() {
                if self.deferred_error.is_none() {
                    self.deferred_error = Some(err);
                } else {
                    warn!(error = %err, "Additional segment failed to close");
                }
            }
        }
    }
}

impl Read for SegmentedStream {
    /// Reads from the head segment. An error from a segment is returned as
    /// is and the stream stays on that segment, so the read can be retried.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                self.current = self.next_segment();
            }
            let Some(segment) = self.current.as_mut() else {
                return Ok(0);
            };

            match segment.read(buf)? {
                0 => self.evict_current(),
                n => return Ok(n),
            }
        }
    }
}

impl Drop for SegmentedStream {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Segment failed to close while dropping stream");
        }
    }
}

/// Appending side handed to background producers.
pub struct SegmentProducer {
    shared: Arc<Shared>,
}

impl SegmentProducer {
    /// Queue a segment. Returns false once the reader has closed the stream,
    /// which tells the producer it can stop.
    pub fn append(&self, segment: impl Segment + 'static) -> bool {
        self.shared.push(Box::new(segment))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Signal that no more segments will come from this producer.
    pub fn finish(self) {}
}

impl Clone for SegmentProducer {
    fn clone(&self) -> Self {
        self.shared.lock().producers += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for SegmentProducer {
    fn drop(&mut self) {
        self.shared.lock().producers -= 1;
        self.shared.ready.notify_all();
    }
}
