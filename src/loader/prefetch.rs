//! Background prefetch queue.
//!
//! Identifiers are queued and drained by a single background task in
//! batches of `prefetchSize`, pausing briefly between batches so interactive
//! loads get a look in.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Pause between prefetch batches.
pub const PREFETCH_BATCH_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct PrefetchState {
    pending: VecDeque<String>,
    draining: bool,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
pub(crate) struct PrefetchQueue {
    state: Mutex<PrefetchState>,
}

impl PrefetchQueue {
    fn lock(&self) -> MutexGuard<'_, PrefetchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue identifiers not already pending. Returns true when the caller
    /// must start a drain task.
    pub(crate) fn enqueue(&self, identifiers: impl IntoIterator<Item = String>) -> bool {
        let mut state = self.lock();
        for identifier in identifiers {
            if !state.pending.contains(&identifier) {
                state.pending.push_back(identifier);
            }
        }
        if state.draining || state.pending.is_empty() {
            return false;
        }
        state.draining = true;
        true
    }

    /// Take the next batch, or mark the drain finished when nothing is left.
    pub(crate) fn next_batch(&self, size: usize) -> Option<(Vec<String>, CancellationToken)> {
        let mut state = self.lock();
        if state.pending.is_empty() {
            state.draining = false;
            return None;
        }
        let take = size.max(1).min(state.pending.len());
        let batch = state.pending.drain(..take).collect();
        Some((batch, state.cancel.clone()))
    }

    /// Drop everything pending and cancel the batch in progress.
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.lock();
        let dropped = state.pending.len();
        state.pending.clear();
        state.cancel.cancel();
        state.cancel = CancellationToken::new();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_starts_one_drain() {
        let queue = PrefetchQueue::default();
        assert!(queue.enqueue(vec!["a".to_string(), "b".to_string()]));
        assert!(!queue.enqueue(vec!["c".to_string(), "a".to_string()]));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_batches() {
        let queue = PrefetchQueue::default();
        queue.enqueue((0..5).map(|i| i.to_string()));

        let (batch, _) = queue.next_batch(2).unwrap();
        assert_eq!(batch, vec!["0", "1"]);
        let (batch, _) = queue.next_batch(2).unwrap();
        assert_eq!(batch, vec!["2", "3"]);
        let (batch, _) = queue.next_batch(2).unwrap();
        assert_eq!(batch, vec!["4"]);
        assert!(queue.next_batch(2).is_none());

        // Drain finished, so the next enqueue starts a new one
        assert!(queue.enqueue(vec!["x".to_string()]));
    }

    #[test]
    fn test_clear_cancels_batch() {
        let queue = PrefetchQueue::default();
        queue.enqueue((0..4).map(|i| i.to_string()));
        let (_, token) = queue.next_batch(1).unwrap();

        assert_eq!(queue.clear(), 3);
        assert!(token.is_cancelled());
        assert_eq!(queue.len(), 0);
    }
}
