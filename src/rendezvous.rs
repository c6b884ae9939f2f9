use crate::error::{PipelineError, Result};
use crate::frame::Timestamp;
use crate::health::{QueueStats, QueueView};
use crate::shutdown::ShutdownSignal;
use parking_lot::{Condvar, Mutex};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

const TAKE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Completion waiting for its reservation to reach the head of `pending`.
/// Ordered by timestamp only.
struct Ready<T> {
    timestamp: Timestamp,
    payload: T,
}

impl<T> PartialEq for Ready<T> {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp
    }
}

impl<T> Eq for Ready<T> {}

impl<T> PartialOrd for Ready<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ready<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.timestamp.cmp(&other.timestamp)
    }
}

struct RendezvousState<T> {
    pending: VecDeque<Timestamp>,
    ready: BinaryHeap<Reverse<Ready<T>>>,
    output: VecDeque<(Timestamp, T)>,
}

impl<T> RendezvousState<T> {
    /// Move every completion whose timestamp matches the oldest reservation
    /// into the output FIFO. Returns the number released.
    fn release_due(&mut self) -> usize {
        let mut released = 0;
        loop {
            let due = match (self.ready.peek(), self.pending.front()) {
                (Some(Reverse(head)), Some(oldest)) => head.timestamp == *oldest,
                _ => false,
            };
            if !due {
                break;
            }
            self.pending.pop_front();
            if let Some(Reverse(item)) = self.ready.pop() {
                self.output.push_back((item.timestamp, item.payload));
                released += 1;
            }
        }
        released
    }
}

#[derive(Default)]
struct RendezvousCounters {
    reserved: AtomicU64,
    released: AtomicU64,
    withdrawn: AtomicU64,
    out_of_order: AtomicU64,
}

/// Releases completions strictly in reservation order, whatever order they
/// complete in.
///
/// `reserve`, `complete` and `withdraw` share one lock, so any number of
/// producers may complete concurrently while one producer reserves.
pub struct OrderedRendezvousQueue<T> {
    name: String,
    state: Mutex<RendezvousState<T>>,
    available: Condvar,
    counters: RendezvousCounters,
    shutdown: ShutdownSignal,
}

impl<T> OrderedRendezvousQueue<T> {
    pub fn new<S: Into<String>>(name: S, shutdown: ShutdownSignal) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RendezvousState {
                pending: VecDeque::new(),
                ready: BinaryHeap::new(),
                output: VecDeque::new(),
            }),
            available: Condvar::new(),
            counters: RendezvousCounters::default(),
            shutdown,
        }
    }

    /// Register a timestamp whose result will be completed or withdrawn later.
    ///
    /// Timestamps are expected in non-decreasing order. An older timestamp is
    /// still accepted, but it is reported on the `detstream::ordering` target
    /// and the pending list is re-sorted.
    pub fn reserve(&self, timestamp: Timestamp) {
        let mut state = self.state.lock();
        match state.pending.back().copied() {
            Some(newest) if timestamp < newest => {
                self.counters.out_of_order.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "detstream::ordering",
                    queue = %self.name,
                    "Reservation {} is older than newest pending {}; re-sorting",
                    timestamp,
                    newest
                );
                state.pending.push_back(timestamp);
                state.pending.make_contiguous().sort();
            }
            _ => state.pending.push_back(timestamp),
        }
        self.counters.reserved.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %self.name, "Reserved {}", timestamp);
    }

    /// Submit the result for a reserved timestamp and release everything that
    /// is now due.
    pub fn complete(&self, timestamp: Timestamp, payload: T) -> Result<()> {
        let mut state = self.state.lock();
        let reserved = state.pending.iter().filter(|t| **t == timestamp).count();
        if reserved == 0 {
            return Err(PipelineError::UnknownReservation { timestamp });
        }
        let completed = state
            .ready
            .iter()
            .filter(|Reverse(item)| item.timestamp == timestamp)
            .count();
        if completed >= reserved {
            return Err(PipelineError::DuplicateCompletion { timestamp });
        }

        state.ready.push(Reverse(Ready { timestamp, payload }));
        let released = state.release_due();
        drop(state);

        self.note_released(released);
        Ok(())
    }

    /// Drop a reservation that will never be completed.
    pub fn withdraw(&self, timestamp: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        let position = state
            .pending
            .iter()
            .position(|pending| *pending == timestamp)
            .ok_or(PipelineError::UnknownReservation { timestamp })?;
        state.pending.remove(position);

        if !state.pending.contains(&timestamp) {
            state.ready.retain(|Reverse(item)| item.timestamp != timestamp);
        }

        let released = state.release_due();
        drop(state);

        self.counters.withdrawn.fetch_add(1, Ordering::Relaxed);
        trace!(queue = %self.name, "Withdrew {}", timestamp);
        self.note_released(released);
        Ok(())
    }

    /// Block until the next item is released. `None` once shutdown is signalled.
    pub fn take(&self) -> Option<T> {
        self.take_with_timestamp().map(|(_, payload)| payload)
    }

    /// Block until the next item is released, returning it with its timestamp.
    pub fn take_with_timestamp(&self) -> Option<(Timestamp, T)> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.output.pop_front() {
                return Some(item);
            }
            if self.shutdown.is_cancelled() {
                return None;
            }
            self.available.wait_for(&mut state, TAKE_POLL_INTERVAL);
        }
    }

    pub fn try_take(&self) -> Option<(Timestamp, T)> {
        self.state.lock().output.pop_front()
    }

    /// Number of released items waiting for the consumer
    pub fn len(&self) -> usize {
        self.state.lock().output.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn note_released(&self, released: usize) {
        if released > 0 {
            self.counters
                .released
                .fetch_add(released as u64, Ordering::Relaxed);
            self.available.notify_all();
        }
    }
}

impl<T: Send> QueueView for OrderedRendezvousQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> QueueStats {
        let (depth, in_flight) = {
            let state = self.state.lock();
            (state.output.len(), state.pending.len())
        };
        QueueStats {
            depth,
            capacity: None,
            in_flight,
            pushed: self.counters.reserved.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            dropped: 0,
            withdrawn: self.counters.withdrawn.load(Ordering::Relaxed),
            out_of_order: self.counters.out_of_order.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ts(micros: i64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn queue() -> OrderedRendezvousQueue<&'static str> {
        OrderedRendezvousQueue::new("test", ShutdownSignal::new())
    }

    #[test]
    fn test_releases_in_reservation_order() {
        let queue = queue();
        for t in [1, 2, 3] {
            queue.reserve(ts(t));
        }

        queue.complete(ts(3), "c").unwrap();
        assert!(queue.is_empty());
        queue.complete(ts(1), "a").unwrap();
        assert_eq!(queue.len(), 1);
        queue.complete(ts(2), "b").unwrap();

        assert_eq!(queue.take(), Some("a"));
        assert_eq!(queue.take(), Some("b"));
        assert_eq!(queue.take(), Some("c"));
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_every_permutation_is_ordered() {
        let orders: [[i64; 4]; 6] = [
            [1, 2, 3, 4],
            [4, 3, 2, 1],
            [2, 4, 1, 3],
            [3, 1, 4, 2],
            [4, 1, 2, 3],
            [1, 4, 3, 2],
        ];

        for order in orders {
            let queue = OrderedRendezvousQueue::new("perm", ShutdownSignal::new());
            for t in 1..=4 {
                queue.reserve(ts(t));
            }
            for t in order {
                queue.complete(ts(t), t).unwrap();
            }
            let released: Vec<i64> = (0..4).filter_map(|_| queue.take()).collect();
            assert_eq!(released, vec![1, 2, 3, 4], "completion order {:?}", order);
        }
    }

    #[test]
    fn test_withdraw_unblocks_later_completions() {
        let queue = queue();
        for t in [1, 2, 3] {
            queue.reserve(ts(t));
        }

        queue.complete(ts(2), "b").unwrap();
        queue.complete(ts(3), "c").unwrap();
        assert!(queue.is_empty());

        queue.withdraw(ts(1)).unwrap();
        assert_eq!(
            queue.take_with_timestamp(),
            Some((ts(2), "b"))
        );
        assert_eq!(queue.take_with_timestamp(), Some((ts(3), "c")));
        assert_eq!(queue.stats().withdrawn, 1);
    }

    #[test]
    fn test_withdraw_middle_produces_no_output() {
        let queue = queue();
        for t in [1, 2, 3] {
            queue.reserve(ts(t));
        }
        queue.withdraw(ts(2)).unwrap();
        queue.complete(ts(1), "a").unwrap();
        queue.complete(ts(3), "c").unwrap();

        assert_eq!(queue.take(), Some("a"));
        assert_eq!(queue.take(), Some("c"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_withdraw_unknown_is_logic_error() {
        let queue = queue();
        queue.reserve(ts(1));
        let err = queue.withdraw(ts(7)).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownReservation { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_complete_unreserved_is_logic_error() {
        let queue = queue();
        let err = queue.complete(ts(9), "x").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownReservation { .. }));
    }

    #[test]
    fn test_second_completion_is_rejected() {
        let queue = queue();
        queue.reserve(ts(1));
        queue.reserve(ts(2));

        queue.complete(ts(2), "b").unwrap();
        let err = queue.complete(ts(2), "b-again").unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateCompletion { .. }));
        assert!(err.is_fatal());

        queue.complete(ts(1), "a").unwrap();
        queue.reserve(ts(3));
        queue.complete(ts(3), "c").unwrap();

        assert_eq!(queue.take(), Some("a"));
        assert_eq!(queue.take(), Some("b"));
        assert_eq!(queue.take(), Some("c"));
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_out_of_order_reservation_is_resorted() {
        let queue = queue();
        queue.reserve(ts(10));
        queue.reserve(ts(30));
        queue.reserve(ts(20));

        queue.complete(ts(20), "twenty").unwrap();
        queue.complete(ts(10), "ten").unwrap();
        queue.complete(ts(30), "thirty").unwrap();

        assert_eq!(queue.take(), Some("ten"));
        assert_eq!(queue.take(), Some("twenty"));
        assert_eq!(queue.take(), Some("thirty"));
        assert_eq!(queue.stats().out_of_order, 1);
    }

    #[test]
    fn test_concurrent_completions_keep_order() {
        let queue = Arc::new(OrderedRendezvousQueue::new("concurrent", ShutdownSignal::new()));
        for t in 0..200 {
            queue.reserve(ts(t));
        }

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for t in (0..200).rev().filter(|t| t % 4 == worker) {
                        queue.complete(ts(t), t).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let released: Vec<i64> = (0..200).filter_map(|_| queue.take()).collect();
        assert_eq!(released, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn test_take_blocks_until_release() {
        let queue = Arc::new(OrderedRendezvousQueue::new("blocking", ShutdownSignal::new()));
        queue.reserve(ts(1));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(30));
        queue.complete(ts(1), "late").unwrap();
        assert_eq!(consumer.join().unwrap(), Some("late"));
    }

    #[test]
    fn test_take_returns_none_on_shutdown() {
        let shutdown = ShutdownSignal::new();
        let queue: Arc<OrderedRendezvousQueue<u8>> =
            Arc::new(OrderedRendezvousQueue::new("idle", shutdown.clone()));

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(20));
        shutdown.cancel();
        assert_eq!(consumer.join().unwrap(), None);
    }
}
