//! Per-session job numbering.
//!
//! Each session hands out job ids from its own counter, so ids are unique
//! within a session and start at 1 on every connection.  Clients correlate
//! `progress`, `result`, `error`, and `cancelled` frames by this id.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::domain::job::JobId;

/// Monotonically increasing source of [`JobId`]s, starting at 1.
///
/// # Examples
///
/// ```rust
/// use lipsync_core::protocol::JobCounter;
/// use lipsync_core::JobId;
///
/// let counter = JobCounter::new();
/// assert_eq!(counter.next(), JobId(1));
/// assert_eq!(counter.next(), JobId(2));
/// ```
#[derive(Debug)]
pub struct JobCounter {
    /// The id handed out by the next call to [`JobCounter::next`].
    next: AtomicU64,
}

impl JobCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns a fresh id.
    ///
    /// `Relaxed` is enough: ids only need to be distinct, they do not order
    /// any other memory access.
    pub fn next(&self) -> JobId {
        JobId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for JobCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_job_counter_starts_at_one() {
        // Arrange
        let counter = JobCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, JobId(1));
    }

    #[test]
    fn test_issued_tracks_handed_out_ids() {
        let counter = JobCounter::default();
        assert_eq!(counter.issued(), 0);
        counter.next();
        counter.next();
        assert_eq!(counter.issued(), 2);
    }

    #[test]
    fn test_job_counter_is_unique_across_threads() {
        // Arrange
        let counter = Arc::new(JobCounter::new());

        // Act
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..250).map(|_| c.next().0).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(all.first(), Some(&1));
    }
}
