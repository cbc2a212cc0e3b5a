//! Capture records, their reassembly and their in-memory buffer

pub mod body;
pub mod buffer;
pub mod record;
pub mod recorder;
pub mod redact;
pub mod sse;
pub mod trace_context;

pub use buffer::{BufferStats, CaptureBuffer, Subscription};
pub use record::{
    CaptureId, CaptureRecord, CapturedBody, CapturedEvent, PendingCapture, TraceContext,
    TunnelStats,
};
pub use recorder::{BufferedRecorder, CaptureRecorder};
pub use redact::HeaderRedactor;
