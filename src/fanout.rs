use crate::health::{QueueStats, QueueView};
use crate::shutdown::ShutdownSignal;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Generation counter that consumers wait on for "something was pushed".
///
/// Several queues can share one doorbell so a single consumer can sleep on
/// all of them at once.
pub struct Doorbell {
    generation: Mutex<u64>,
    rung: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            rung: Condvar::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    pub fn ring(&self) {
        *self.generation.lock() += 1;
        self.rung.notify_all();
    }

    /// Wait until the generation moves past `seen`. Returns `false` on shutdown.
    pub fn wait_past(&self, seen: u64, shutdown: &ShutdownSignal) -> bool {
        let mut generation = self.generation.lock();
        while *generation == seen {
            if shutdown.is_cancelled() {
                return false;
            }
            self.rung.wait_for(&mut generation, WAIT_POLL_INTERVAL);
        }
        true
    }
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-capacity queue between a camera's dispatcher and one model worker.
///
/// The producer never blocks: pushing into a full queue evicts the oldest
/// entry and hands it back to the caller.
pub struct BoundedFanoutQueue<T> {
    name: String,
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    doorbell: Arc<Doorbell>,
    shutdown: ShutdownSignal,
    pushed: AtomicU64,
    dropped: AtomicU64,
    popped: AtomicU64,
}

impl<T> BoundedFanoutQueue<T> {
    pub fn new<S: Into<String>>(name: S, capacity: usize, shutdown: ShutdownSignal) -> Self {
        Self::with_doorbell(name, capacity, Arc::new(Doorbell::new()), shutdown)
    }

    /// Create a queue that rings a shared doorbell on every push
    pub fn with_doorbell<S: Into<String>>(
        name: S,
        capacity: usize,
        doorbell: Arc<Doorbell>,
        shutdown: ShutdownSignal,
    ) -> Self {
        assert!(capacity > 0, "Fan-out queue capacity must be greater than 0");
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            doorbell,
            shutdown,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        }
    }

    /// Insert an item, evicting and returning the oldest one if the queue is full.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };

        self.pushed.fetch_add(1, Ordering::Relaxed);
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(queue = %self.name, "Queue full, dropped oldest entry");
        }
        self.doorbell.ring();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    /// Block until an item is available. `None` once shutdown is signalled.
    pub fn pop(&self) -> Option<T> {
        loop {
            let seen = self.doorbell.generation();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            if !self.doorbell.wait_past(seen, &self.shutdown) {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Send> QueueView for BoundedFanoutQueue<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.len(),
            capacity: Some(self.capacity),
            in_flight: 0,
            pushed: self.pushed.load(Ordering::Relaxed),
            released: self.popped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            withdrawn: 0,
            out_of_order: 0,
        }
    }
}

/// All fan-out queues feeding one model worker, one lane per camera.
///
/// Lanes are served round-robin so a busy camera cannot starve the others.
pub struct ModelInbox<T> {
    lanes: Vec<Arc<BoundedFanoutQueue<T>>>,
    doorbell: Arc<Doorbell>,
    shutdown: ShutdownSignal,
    next_lane: AtomicUsize,
}

impl<T> ModelInbox<T> {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            lanes: Vec::new(),
            doorbell: Arc::new(Doorbell::new()),
            shutdown,
            next_lane: AtomicUsize::new(0),
        }
    }

    /// Create a new lane that wakes this inbox's consumer
    pub fn add_lane<S: Into<String>>(&mut self, name: S, capacity: usize) -> Arc<BoundedFanoutQueue<T>> {
        let lane = Arc::new(BoundedFanoutQueue::with_doorbell(
            name,
            capacity,
            Arc::clone(&self.doorbell),
            self.shutdown.clone(),
        ));
        self.lanes.push(Arc::clone(&lane));
        lane
    }

    pub fn lanes(&self) -> &[Arc<BoundedFanoutQueue<T>>] {
        &self.lanes
    }

    fn try_recv(&self) -> Option<T> {
        let count = self.lanes.len();
        if count == 0 {
            return None;
        }
        let start = self.next_lane.load(Ordering::Relaxed);
        for offset in 0..count {
            let index = (start + offset) % count;
            if let Some(item) = self.lanes[index].try_pop() {
                self.next_lane.store((index + 1) % count, Ordering::Relaxed);
                return Some(item);
            }
        }
        None
    }

    /// Block until any lane has an item. `None` once shutdown is signalled.
    pub fn recv(&self) -> Option<T> {
        loop {
            let seen = self.doorbell.generation();
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if !self.doorbell.wait_past(seen, &self.shutdown) {
                return None;
            }
        }
    }
}
