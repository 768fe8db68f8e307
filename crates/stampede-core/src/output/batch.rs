//! Batch buffering for the output pipeline: results accumulate until the
//! batch size is reached or the flush interval elapses.

use crate::results::TestResult;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2_000;

pub struct BatchBuffer {
    buffer: Vec<TestResult>,
    batch_size: usize,
}

impl BatchBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Add a result; returns a full batch when the size threshold is hit.
    pub fn push(&mut self, result: TestResult) -> Option<Vec<TestResult>> {
        self.buffer.push(result);
        if self.buffer.len() >= self.batch_size {
            Some(self.take())
        } else {
            None
        }
    }

    /// Drain whatever is buffered (interval flush and finalisation).
    pub fn take(&mut self) -> Vec<TestResult> {
        std::mem::take(&mut self.buffer)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_result(i: u64) -> TestResult {
        TestResult::new(i, 0, "s", "rest", "step")
    }

    #[test]
    fn push_returns_batch_at_threshold() {
        let mut buffer = BatchBuffer::new(3);
        assert!(buffer.push(make_result(1)).is_none());
        assert!(buffer.push(make_result(2)).is_none());
        let batch = buffer.push(make_result(3)).expect("batch at threshold");
        assert_eq!(batch.len(), 3);
        assert!(buffer.is_empty());
    }

    #[test]
    fn take_drains_partial_batches() {
        let mut buffer = BatchBuffer::new(10);
        buffer.push(make_result(1));
        buffer.push(make_result(2));
        let batch = buffer.take();
        assert_eq!(batch.len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.take().is_empty());
    }

    #[test]
    fn batch_preserves_insertion_order() {
        let mut buffer = BatchBuffer::new(3);
        for i in 1..=3 {
            buffer.push(make_result(i));
        }
        // The threshold push returned the batch already; refill and check.
        for i in 4..=5 {
            buffer.push(make_result(i));
        }
        let batch = buffer.take();
        assert_eq!(batch[0].vu_id, 4);
        assert_eq!(batch[1].vu_id, 5);
    }
}
