//! Response body tee: forwards every frame untouched while a copy accumulates
//! into the exchange's capture record
//!
//! Decoding, parsing and recording run on the blocking pool once the body
//! ends, so the final frame reaches the client without waiting on them.

use crate::capture::body::BodyAccumulator;
use crate::capture::{CaptureRecorder, PendingCapture};
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::runtime::Handle;
use tracing::debug;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error stored when the client goes away mid-response
pub const CLIENT_DISCONNECTED: &str = "client disconnected before response completed";

/// Capture state that is finalized exactly once
pub struct ResponseCapture {
    pending: PendingCapture,
    accumulator: BodyAccumulator,
    recorder: Arc<dyn CaptureRecorder>,
}

impl ResponseCapture {
    pub fn new(
        pending: PendingCapture,
        accumulator: BodyAccumulator,
        recorder: Arc<dyn CaptureRecorder>,
    ) -> Self {
        Self {
            pending,
            accumulator,
            recorder,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.accumulator.push(chunk);
    }

    /// Hand finalisation off the poll path; inline only outside a runtime
    fn finish(self, ended: bool, error: Option<String>) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || self.complete(ended, error));
            }
            Err(_) => self.complete(ended, error),
        }
    }

    fn complete(self, ended: bool, error: Option<String>) {
        debug!(
            capture_id = %self.pending.id,
            bytes = self.accumulator.bytes_seen(),
            ended,
            "Response body finished"
        );
        let body = self.accumulator.finish(ended);
        self.recorder.record(self.pending.finish(Some(body), error));
    }
}

pin_project! {
    /// Streaming body that records what it forwards
    pub struct CapturingBody<B> {
        #[pin]
        inner: B,
        capture: Option<ResponseCapture>,
    }

    impl<B> PinnedDrop for CapturingBody<B> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(capture) = this.capture.take() {
                capture.finish(false, Some(CLIENT_DISCONNECTED.to_string()));
            }
        }
    }
}

impl<B> CapturingBody<B>
where
    B: Body<Data = Bytes>,
{
    pub fn new(body: B, capture: ResponseCapture) -> Self {
        // Bodies known to be empty may never be polled
        let capture = if body.is_end_stream() {
            capture.finish(true, None);
            None
        } else {
            Some(capture)
        };

        Self {
            inner: body,
            capture,
        }
    }
}

impl<B> Body for CapturingBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();

        match ready!(this.inner.as_mut().poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(capture) = this.capture.as_mut() {
                    if let Some(data) = frame.data_ref() {
                        capture.push(data);
                    }
                }
                if this.inner.is_end_stream() {
                    if let Some(capture) = this.capture.take() {
                        capture.finish(true, None);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(e)) => {
                let e: BoxError = e.into();
                if let Some(capture) = this.capture.take() {
                    capture.finish(false, Some(format!("upstream body error: {e}")));
                }
                Poll::Ready(Some(Err(e)))
            }
            None => {
                if let Some(capture) = this.capture.take() {
                    capture.finish(true, None);
                }
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
