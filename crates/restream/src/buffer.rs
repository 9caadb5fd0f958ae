//! A live byte log with one producer and any number of readers.
//!
//! The producer appends immutable chunks; each [StreamReader] keeps its own cursor into
//! the retained window and pulls chunks at its own pace. The state lock is only held to
//! copy a chunk handle, never across an await, so a reader stuck on a slow socket cannot
//! hold back the producer or the other readers.
//!
//! A reader which falls behind the retained window gets [RestreamError::BufferTrimmed]
//! instead of silently skipping ahead. Closing the buffer ends every reader.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use bytes::Bytes;
use futures::Stream;
use tokio::sync::watch;

use crate::error::{RestreamError, RestreamResult};

struct Chunk {
    /// Byte offset of the chunk in the stream.
    offset: u64,
    data: Bytes,
}

#[derive(Default)]
struct State {
    header: Option<Bytes>,
    chunks: VecDeque<Chunk>,
    /// Index of `chunks.front()`.
    first_index: u64,
    write_offset: u64,
    retained_bytes: usize,
    closed: bool,
}

impl State {
    fn end_index(&self) -> u64 {
        self.first_index + self.chunks.len() as u64
    }
}

pub struct LiveBuffer {
    state: Mutex<State>,
    // Bumped on every append and on close.
    changed: watch::Sender<u64>,

    max_chunks: usize,
    max_bytes: usize,

    readers: AtomicUsize,
    waiting: AtomicUsize,
}

impl LiveBuffer {
    pub fn new(max_chunks: usize, max_bytes: usize) -> Arc<Self> {
        let (changed, _) = watch::channel(0);
        Arc::new(Self {
            state: Mutex::new(State::default()),
            changed,
            max_chunks: max_chunks.max(1),
            max_bytes,
            readers: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Set the initialization data every reader receives before its first chunk.
    pub fn set_header(&self, header: Bytes) {
        self.lock().header = Some(header);
        self.changed.send_modify(|_| {});
    }

    /// Append a chunk and return its index. Oldest chunks are evicted once the
    /// retention limits are exceeded; the newest chunk is always kept.
    pub fn append(&self, data: Bytes) -> RestreamResult<u64> {
        let index = {
            let mut state = self.lock();
            if state.closed {
                return Err(RestreamError::BufferClosed);
            }

            let index = state.end_index();
            let len = data.len();
            let offset = state.write_offset;
            state.chunks.push_back(Chunk { offset, data });
            state.write_offset += len as u64;
            state.retained_bytes += len;

            while state.chunks.len() > self.max_chunks
                || (state.retained_bytes > self.max_bytes && state.chunks.len() > 1)
            {
                if let Some(evicted) = state.chunks.pop_front() {
                    state.retained_bytes -= evicted.data.len();
                    state.first_index += 1;
                }
            }

            index
        };

        self.changed.send_replace(index + 1);
        Ok(index)
    }

    /// Close the buffer. Readers stop at their next read, including suspended ones.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.changed.send_modify(|_| {});
    }

    /// Open a reader at the start of the retained window.
    pub fn open_reader(self: &Arc<Self>) -> StreamReader {
        let (next_index, offset) = {
            let state = self.lock();
            let offset = state
                .chunks
                .front()
                .map(|c| c.offset)
                .unwrap_or(state.write_offset);
            (state.first_index, offset)
        };
        self.readers.fetch_add(1, Ordering::Relaxed);

        StreamReader {
            buffer: self.clone(),
            changes: self.changed.subscribe(),
            next_index,
            offset,
            header_sent: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Total bytes appended so far.
    pub fn write_offset(&self) -> u64 {
        self.lock().write_offset
    }

    /// Index of the oldest retained chunk and one past the newest.
    pub fn window(&self) -> (u64, u64) {
        let state = self.lock();
        (state.first_index, state.end_index())
    }

    pub fn retained_chunks(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn retained_bytes(&self) -> usize {
        self.lock().retained_bytes
    }

    /// Readers currently attached.
    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Relaxed)
    }

    /// Readers currently suspended waiting for the producer.
    pub fn waiting_readers(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One viewer's cursor into a [LiveBuffer].
///
/// Dropping the reader detaches it; the producer never notices.
pub struct StreamReader {
    buffer: Arc<LiveBuffer>,
    changes: watch::Receiver<u64>,
    next_index: u64,
    /// Byte offset of the next chunk.
    offset: u64,
    header_sent: bool,
}

impl StreamReader {
    /// Next unread piece of the stream: the header first, then every chunk in append
    /// order. Suspends while the reader is caught up. Returns `None` once the buffer
    /// is closed.
    pub async fn read(&mut self) -> RestreamResult<Option<Bytes>> {
        loop {
            // mark the current version as seen before looking at the state, so an
            // append racing with this check still wakes us up
            self.changes.borrow_and_update();

            if let Some(data) = self.try_read()? {
                return Ok(Some(data));
            }
            if self.buffer.lock().closed {
                return Ok(None);
            }

            let _waiting = WaitingGuard::new(&self.buffer.waiting);
            if self.changes.changed().await.is_err() {
                return Ok(None);
            }
        }
    }

    fn try_read(&mut self) -> RestreamResult<Option<Bytes>> {
        let state = self.buffer.lock();
        if state.closed {
            return Ok(None);
        }

        if !self.header_sent {
            if let Some(header) = &state.header {
                self.header_sent = true;
                return Ok(Some(header.clone()));
            }
            if state.chunks.is_empty() {
                return Ok(None);
            }
            // no header was ever set, start with the media directly
            self.header_sent = true;
        }

        if self.next_index < state.first_index {
            return Err(RestreamError::BufferTrimmed);
        }

        let position = (self.next_index - state.first_index) as usize;
        let Some(chunk) = state.chunks.get(position) else {
            return Ok(None);
        };
        self.next_index += 1;
        self.offset = chunk.offset + chunk.data.len() as u64;
        Ok(Some(chunk.data.clone()))
    }

    /// Bytes appended by the producer which this reader has not consumed yet.
    pub fn lag(&self) -> u64 {
        self.buffer.write_offset().saturating_sub(self.offset)
    }

    /// Index of the next chunk this reader will receive.
    pub fn position(&self) -> u64 {
        self.next_index
    }

    /// Detach from the buffer.
    pub fn release(self) {}

    /// Adapt the reader into a stream of chunks for an HTTP body. The stream ends
    /// after the buffer closes or after the first error.
    pub fn into_stream(self) -> impl Stream<Item = RestreamResult<Bytes>> + Send + 'static {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read().await {
                Ok(Some(data)) => Some((Ok(data), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.buffer.readers.fetch_sub(1, Ordering::Relaxed);
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
