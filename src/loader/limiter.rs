//! Priority-admission concurrency limiter.
//!
//! A counting limiter like `tokio::sync::Semaphore`, with two differences the
//! loader needs:
//!
//! - waiters are admitted by priority (higher first, FIFO within a level)
//! - the capacity can change at runtime
//!
//! ```text
//!   acquire(p) ──► slot free and nobody queued? ──yes──► LimiterPermit
//!                        │ no
//!                        ▼
//!                  BinaryHeap<Waiter> ◄── release() hands the slot
//!                                         to the best waiter
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{LoaderError, Result};

struct Waiter {
    priority: u8,
    seq: u64,
    tx: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier arrival
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LimiterState {
    capacity: usize,
    in_use: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

impl LimiterState {
    /// Hand one slot to the best live waiter. Returns false if none is left.
    fn hand_over(&mut self) -> bool {
        while let Some(waiter) = self.waiters.pop() {
            if waiter.tx.send(()).is_ok() {
                return true;
            }
        }
        false
    }
}

/// Bounds the number of concurrent single-image fetches.
pub struct ConcurrencyLimiter {
    state: Mutex<LimiterState>,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LimiterState {
                capacity: capacity.max(1),
                in_use: 0,
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a slot. Fails with `Cancelled` if `cancel` fires first.
    pub async fn acquire(
        self: &Arc<Self>,
        priority: u8,
        cancel: &CancellationToken,
    ) -> Result<LimiterPermit> {
        let mut rx = {
            let mut state = self.lock();
            if cancel.is_cancelled() {
                return Err(LoaderError::Cancelled);
            }
            if state.in_use < state.capacity && state.waiters.is_empty() {
                state.in_use += 1;
                return Ok(self.permit());
            }
            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            rx
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {}
            granted = &mut rx => {
                return match granted {
                    Ok(()) => Ok(self.permit()),
                    Err(_) => Err(LoaderError::Cancelled),
                };
            }
        }

        rx.close();
        // A slot may have been handed over just before the close
        if rx.try_recv().is_ok() {
            self.release();
        }
        Err(LoaderError::Cancelled)
    }

    fn permit(self: &Arc<Self>) -> LimiterPermit {
        LimiterPermit {
            limiter: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        if state.in_use > state.capacity || !state.hand_over() {
            state.in_use -= 1;
        }
    }

    /// Change the capacity. Queued waiters are admitted up to the new limit;
    /// on shrink, running holders finish and the excess slots disappear.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity.max(1);
        while state.in_use < state.capacity && state.hand_over() {
            state.in_use += 1;
        }
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Number of slots currently held.
    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Number of queued acquirers, including abandoned ones not yet skipped.
    pub fn queued(&self) -> usize {
        self.lock().waiters.len()
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConcurrencyLimiter")
            .field("capacity", &state.capacity)
            .field("in_use", &state.in_use)
            .field("queued", &state.waiters.len())
            .finish()
    }
}

/// A held slot, released on drop.
pub struct LimiterPermit {
    limiter: Arc<ConcurrencyLimiter>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

impl std::fmt::Debug for LimiterPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LimiterPermit")
    }
}
