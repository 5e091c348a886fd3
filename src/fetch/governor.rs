//! Per-operation byte accounting.
//!
//! A budget is opened for one logical operation (a warm-up navigation or one
//! API call) and fed every received chunk; the chunk that pushes the running
//! total past the ceiling fails the operation.

use super::error::FetchError;

/// Ceiling applied to page navigation traffic.
pub const DEFAULT_GOVERNOR_CEILING_BYTES: usize = 10 * 1024;

/// Ceiling applied to API response bodies.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteBudget {
    ceiling: usize,
    received: usize,
}

impl ByteBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            received: 0,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Bytes admitted so far, including the chunk that tripped the ceiling.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn admit(&mut self, chunk_len: usize) -> Result<(), FetchError> {
        self.received = self.received.saturating_add(chunk_len);
        if self.received > self.ceiling {
            return Err(FetchError::PayloadLimit {
                limit: self.ceiling,
            });
        }
        Ok(())
    }
}
