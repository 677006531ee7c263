//! Consuming captured payloads as an async [`Stream`].
//!
//! ```no_run
//! # #[cfg(windows)] pollster::block_on(async {
//! use futures_lite::StreamExt;
//! use usbtap::{CaptureSession, platform, stream::payload_stream};
//!
//! let mut session = CaptureSession::new(platform::WindowsHost::new());
//! session.find_device(&platform::list_endpoints(), 0x1234, 0x5678).unwrap();
//!
//! let (sink, mut payloads) = payload_stream();
//! session.start(sink).unwrap();
//! while let Some(payload) = payloads.next().await {
//!     println!("{:02x?}", payload);
//! }
//! # });
//! ```

use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use atomic_waker::AtomicWaker;
use futures_core::Stream;

use crate::session::PayloadSink;

struct Shared {
    queue: Mutex<VecDeque<Vec<u8>>>,
    waker: AtomicWaker,
    closed: AtomicBool,
}

/// [`PayloadSink`] half of [`payload_stream`], passed to
/// [`CaptureSession::start`][crate::CaptureSession::start].
pub struct StreamSink {
    shared: Arc<Shared>,
}

/// Stream of payloads delivered to the paired [`StreamSink`].
///
/// Ends once the sink is dropped, which happens when the capture loop exits,
/// and all queued payloads have been returned.
pub struct PayloadStream {
    shared: Arc<Shared>,
}

/// Create a connected sink and stream.
///
/// The queue between them is unbounded.
pub fn payload_stream() -> (StreamSink, PayloadStream) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        waker: AtomicWaker::new(),
        closed: AtomicBool::new(false),
    });
    (
        StreamSink {
            shared: shared.clone(),
        },
        PayloadStream { shared },
    )
}

impl PayloadSink for StreamSink {
    fn deliver(&mut self, payload: &[u8]) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.push_back(payload.to_vec());
        }
        self.shared.waker.wake();
    }
}

impl Drop for StreamSink {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.waker.wake();
    }
}

impl PayloadStream {
    /// Take the next queued payload without waiting.
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.shared.queue.lock().ok()?.pop_front()
    }

    /// Whether the sink has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Stream for PayloadStream {
    type Item = Vec<u8>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Vec<u8>>> {
        let this = self.get_mut();
        this.shared.waker.register(cx.waker());

        // check closed first so a payload delivered just before the close is not lost
        let closed = this.is_closed();
        if let Some(payload) = this.try_next() {
            return Poll::Ready(Some(payload));
        }
        if closed {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}
