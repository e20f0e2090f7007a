// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Host-agnostic transaction queue with urgent and non-urgent lanes.
//!
//! Time is passed in as a [`Duration`] since an arbitrary epoch chosen by the
//! driver, so the queue itself never reads a clock.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::{LanePolicy, QueueMode};
use crate::txn::Lane;

/// Scheduling knobs of a [`TxnQueue`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Fifo or lanes.
    pub mode: QueueMode,
    /// Quiet time after the last non-urgent push before the lane flushes.
    pub debounce: Duration,
    /// Longest a non-urgent item may wait; past it the lane jumps ahead of
    /// urgent work.
    pub max_lag: Duration,
    /// Flush every pending non-urgent item as one batch.
    pub coalesce: bool,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            mode: QueueMode::Lanes,
            debounce: Duration::ZERO,
            max_lag: Duration::from_millis(50),
            coalesce: true,
        }
    }
}

impl From<&LanePolicy> for QueuePolicy {
    fn from(policy: &LanePolicy) -> Self {
        Self {
            mode: policy.queue_mode,
            debounce: policy.debounce(),
            max_lag: policy.max_lag(),
            coalesce: policy.allow_coalesce,
        }
    }
}

/// Why a batch left the queue.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushReason {
    /// Fifo mode serves every item immediately.
    Fifo,
    /// Urgent item.
    Urgent,
    /// The non-urgent lane was quiet for the debounce window.
    Debounced,
    /// The oldest non-urgent item waited past the max lag.
    MaxLag,
}

/// Items leaving the queue together; each batch becomes one commit.
#[derive(Debug)]
pub struct Batch<T> {
    /// Lane of the items.
    pub lane: Lane,
    /// Why the batch was released.
    pub reason: FlushReason,
    /// Items in arrival order.
    pub items: Vec<T>,
}

#[derive(Debug)]
struct Pending<T> {
    ticket: u64,
    lane: Lane,
    enqueued: Duration,
    item: T,
}

/// Two-lane transaction queue.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use understory_transaction::{FlushReason, Lane, QueuePolicy, TxnQueue};
///
/// let mut queue = TxnQueue::new(QueuePolicy {
///     debounce: Duration::from_millis(10),
///     ..QueuePolicy::default()
/// });
/// let ms = Duration::from_millis;
/// queue.push(Lane::NonUrgent, "low-1", ms(0));
/// queue.push(Lane::NonUrgent, "low-2", ms(2));
/// queue.push(Lane::Urgent, "click", ms(3));
///
/// // Urgent work goes first; the non-urgent lane waits for quiet.
/// assert_eq!(queue.pop(ms(3)).unwrap().items, vec!["click"]);
/// assert!(queue.pop(ms(5)).is_none());
/// assert_eq!(queue.next_deadline(), Some(ms(12)));
///
/// let batch = queue.pop(ms(12)).unwrap();
/// assert_eq!(batch.reason, FlushReason::Debounced);
/// assert_eq!(batch.items, vec!["low-1", "low-2"]);
/// ```
#[derive(Debug)]
pub struct TxnQueue<T> {
    policy: QueuePolicy,
    urgent: VecDeque<Pending<T>>,
    non_urgent: VecDeque<Pending<T>>,
    last_non_urgent_push: Option<Duration>,
    next_ticket: u64,
}

impl<T> TxnQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            urgent: VecDeque::new(),
            non_urgent: VecDeque::new(),
            last_non_urgent_push: None,
            next_ticket: 0,
        }
    }

    /// Scheduling knobs.
    #[must_use]
    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.urgent.len() + self.non_urgent.len()
    }

    /// Returns `true` if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.urgent.is_empty() && self.non_urgent.is_empty()
    }

    /// Enqueues `item` and returns its arrival ticket.
    pub fn push(&mut self, lane: Lane, item: T, now: Duration) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let pending = Pending {
            ticket,
            lane,
            enqueued: now,
            item,
        };
        match (self.policy.mode, lane) {
            (QueueMode::Lanes, Lane::NonUrgent) => {
                self.non_urgent.push_back(pending);
                self.last_non_urgent_push = Some(now);
            }
            _ => self.urgent.push_back(pending),
        }
        tracing::trace!(ticket, ?lane, pending = self.len(), "transaction queued");
        ticket
    }

    /// Releases the next batch that is due at `now`.
    pub fn pop(&mut self, now: Duration) -> Option<Batch<T>> {
        if self.policy.mode == QueueMode::Fifo {
            let pending = self.urgent.pop_front()?;
            return Some(Batch {
                lane: pending.lane,
                reason: FlushReason::Fifo,
                items: vec![pending.item],
            });
        }
        if self.lagging(now) {
            return Some(self.flush_non_urgent(FlushReason::MaxLag));
        }
        if let Some(pending) = self.urgent.pop_front() {
            return Some(Batch {
                lane: Lane::Urgent,
                reason: FlushReason::Urgent,
                items: vec![pending.item],
            });
        }
        let quiet_since = self.last_non_urgent_push?;
        if !self.non_urgent.is_empty() && now >= quiet_since + self.policy.debounce {
            return Some(self.flush_non_urgent(FlushReason::Debounced));
        }
        None
    }

    /// Earliest time at which [`pop`](Self::pop) may release something.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Duration> {
        let urgent = self.urgent.front().map(|p| p.enqueued);
        let non_urgent = self.non_urgent.front().and_then(|oldest| {
            let debounced = self.last_non_urgent_push? + self.policy.debounce;
            Some(debounced.min(oldest.enqueued + self.policy.max_lag))
        });
        match (urgent, non_urgent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn lagging(&self, now: Duration) -> bool {
        self.non_urgent
            .front()
            .is_some_and(|oldest| now.saturating_sub(oldest.enqueued) >= self.policy.max_lag)
    }

    fn flush_non_urgent(&mut self, reason: FlushReason) -> Batch<T> {
        let items: Vec<Pending<T>> = if self.policy.coalesce {
            self.non_urgent.drain(..).collect()
        } else {
            self.non_urgent.pop_front().into_iter().collect()
        };
        tracing::trace!(
            count = items.len(),
            first = items.first().map(|p| p.ticket),
            ?reason,
            "non-urgent lane flushed"
        );
        Batch {
            lane: Lane::NonUrgent,
            reason,
            items: items.into_iter().map(|p| p.item).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn lanes(debounce: u64, max_lag: u64, coalesce: bool) -> TxnQueue<u32> {
        TxnQueue::new(QueuePolicy {
            mode: QueueMode::Lanes,
            debounce: ms(debounce),
            max_lag: ms(max_lag),
            coalesce,
        })
    }

    #[test]
    fn urgent_first() {
        let mut q = lanes(0, 50, true);
        q.push(Lane::NonUrgent, 1, ms(0));
        q.push(Lane::Urgent, 2, ms(0));
        q.push(Lane::Urgent, 3, ms(0));
        let order: Vec<Vec<u32>> = core::iter::from_fn(|| q.pop(ms(1)).map(|b| b.items)).collect();
        assert_eq!(order, vec![vec![2], vec![3], vec![1]]);
        assert!(q.is_empty());
    }

    #[test]
    fn debounce_restarts_on_each_push() {
        let mut q = lanes(10, 1_000, true);
        q.push(Lane::NonUrgent, 1, ms(0));
        q.push(Lane::NonUrgent, 2, ms(8));
        assert!(q.pop(ms(10)).is_none(), "second push restarted the window");
        assert_eq!(q.next_deadline(), Some(ms(18)));
        let batch = q.pop(ms(18)).unwrap();
        assert_eq!(batch.items, vec![1, 2]);
        assert_eq!(batch.lane, Lane::NonUrgent);
    }

    #[test]
    fn max_lag_beats_urgent_and_debounce() {
        let mut q = lanes(100, 50, true);
        q.push(Lane::NonUrgent, 1, ms(0));
        q.push(Lane::NonUrgent, 2, ms(40));
        q.push(Lane::Urgent, 3, ms(45));
        assert_eq!(q.next_deadline(), Some(ms(45)));
        assert_eq!(q.pop(ms(45)).unwrap().items, vec![3]);
        assert_eq!(q.next_deadline(), Some(ms(50)));

        q.push(Lane::Urgent, 4, ms(50));
        let batch = q.pop(ms(50)).unwrap();
        assert_eq!(batch.reason, FlushReason::MaxLag);
        assert_eq!(batch.items, vec![1, 2]);
        assert_eq!(q.pop(ms(50)).unwrap().items, vec![4]);
    }

    #[test]
    fn without_coalescing_items_flush_one_by_one() {
        let mut q = lanes(0, 50, false);
        q.push(Lane::NonUrgent, 1, ms(0));
        q.push(Lane::NonUrgent, 2, ms(0));
        assert_eq!(q.pop(ms(0)).unwrap().items, vec![1]);
        assert_eq!(q.pop(ms(0)).unwrap().items, vec![2]);
        assert!(q.pop(ms(0)).is_none());
    }

    #[test]
    fn fifo_keeps_arrival_order() {
        let mut q = TxnQueue::new(QueuePolicy {
            mode: QueueMode::Fifo,
            ..QueuePolicy::default()
        });
        q.push(Lane::NonUrgent, 1, ms(0));
        q.push(Lane::Urgent, 2, ms(0));
        let first = q.pop(ms(0)).unwrap();
        assert_eq!(first.items, vec![1]);
        assert_eq!(first.reason, FlushReason::Fifo);
        assert_eq!(first.lane, Lane::NonUrgent);
        assert_eq!(q.pop(ms(0)).unwrap().items, vec![2]);
        assert_eq!(q.next_deadline(), None);
    }
}
