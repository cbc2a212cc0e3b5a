//! Hand-off of finished records to their consumers

use super::buffer::CaptureBuffer;
use super::record::CaptureRecord;
use crate::pipeline::{Enqueued, LoggingPipeline};
use std::sync::Arc;
use tracing::debug;

/// Receives each finished record exactly once
///
/// Implementations must not block: this runs on the proxied path.
pub trait CaptureRecorder: Send + Sync {
    fn record(&self, record: CaptureRecord);
}

/// Buffer first, so the dashboard shows records the pipeline later drops
#[derive(Debug, Clone)]
pub struct BufferedRecorder {
    buffer: Arc<CaptureBuffer>,
    pipeline: Option<Arc<LoggingPipeline>>,
}

impl BufferedRecorder {
    pub fn new(buffer: Arc<CaptureBuffer>, pipeline: Option<Arc<LoggingPipeline>>) -> Self {
        Self { buffer, pipeline }
    }

    pub fn buffer(&self) -> &Arc<CaptureBuffer> {
        &self.buffer
    }
}

impl CaptureRecorder for BufferedRecorder {
    fn record(&self, record: CaptureRecord) {
        let record = Arc::new(record);
        debug!(
            capture_id = %record.id,
            provider = %record.provider,
            status = ?record.status_code,
            "Capture finished"
        );

        self.buffer.insert(Arc::clone(&record));

        if let Some(pipeline) = &self.pipeline {
            if pipeline.enqueue(record) == Enqueued::Rejected {
                debug!("Pipeline closed; record kept on the dashboard only");
            }
        }
    }
}
