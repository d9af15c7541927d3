//! # Submission Back Ends
//!
//! The boundary between the receiver and whatever executes its batches.
//! A back end sees one call per physical submission.

use alloc::sync::Arc;

use magma_cmd::BatchBuffer;
use magma_core::{CompletionTag, FlushStamp, Result};
use magma_mem::GraphicsAllocation;

/// Executes physical submissions
pub trait SubmissionBackend: Send {
    /// Receive the completion tag the epilogue barriers write
    ///
    /// Back ends without a GPU use it to emulate the post-sync write.
    fn bind_completion_tag(&mut self, _tag: Arc<CompletionTag>) {}

    /// Submit a batch with its residency list, returning its flush stamp
    ///
    /// An error leaves the batch unsubmitted.
    fn submit(&mut self, batch: &BatchBuffer, residency: &[Arc<GraphicsAllocation>]) -> Result<FlushStamp>;
}

/// Back end that completes every batch at once
#[derive(Debug, Default)]
pub struct ImmediateBackend {
    tag: Option<Arc<CompletionTag>>,
    last_stamp: FlushStamp,
}

impl ImmediateBackend {
    /// Create a new back end
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions accepted so far
    pub fn submissions(&self) -> u64 {
        self.last_stamp
    }
}

impl SubmissionBackend for ImmediateBackend {
    fn bind_completion_tag(&mut self, tag: Arc<CompletionTag>) {
        self.tag = Some(tag);
    }

    fn submit(&mut self, batch: &BatchBuffer, _residency: &[Arc<GraphicsAllocation>]) -> Result<FlushStamp> {
        self.last_stamp += 1;
        if let Some(tag) = &self.tag {
            tag.signal(batch.task_count);
        }
        Ok(self.last_stamp)
    }
}

/// Back end that accepts batches and never completes them
#[derive(Debug, Default)]
pub struct NullBackend {
    last_stamp: FlushStamp,
}

impl NullBackend {
    /// Create a new back end
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubmissionBackend for NullBackend {
    fn submit(&mut self, _batch: &BatchBuffer, _residency: &[Arc<GraphicsAllocation>]) -> Result<FlushStamp> {
        self.last_stamp += 1;
        Ok(self.last_stamp)
    }
}

// =============================================================================
// TEST BACK END
// =============================================================================
