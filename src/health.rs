use crate::config::MonitorConfig;
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Point-in-time counters of one pipeline queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Items waiting for the consumer
    pub depth: usize,
    /// Fixed capacity, `None` for unbounded queues
    pub capacity: Option<usize>,
    /// Reservations not yet released (rendezvous queues only)
    pub in_flight: usize,
    pub pushed: u64,
    pub released: u64,
    /// Entries evicted by drop-oldest backpressure
    pub dropped: u64,
    pub withdrawn: u64,
    /// Reservations that arrived with a timestamp older than the newest pending one
    pub out_of_order: u64,
}

/// Read-only view of a queue handed to the monitor.
pub trait QueueView: Send + Sync {
    fn name(&self) -> &str;
    fn stats(&self) -> QueueStats;
}

/// Result of auditing one queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueHealth {
    Ok,
    Warning,
}

/// Polling period that backs off while the pipeline is quiet and snaps back
/// to the initial value as soon as any queue is congested.
#[derive(Debug, Clone)]
pub struct AdaptivePeriod {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl AdaptivePeriod {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Feed the outcome of a check and return the wait before the next one
    pub fn advance(&mut self, congested: bool) -> Duration {
        self.current = if congested {
            self.initial
        } else {
            (self.current * 2).min(self.max)
        };
        self.current
    }
}

/// Periodic queue-depth auditor. Purely observational.
pub struct HealthMonitor {
    views: Vec<Arc<dyn QueueView>>,
    depth_threshold: usize,
    period: AdaptivePeriod,
    span: tracing::Span,
}

impl HealthMonitor {
    pub fn new(config: &MonitorConfig, views: Vec<Arc<dyn QueueView>>) -> Self {
        Self {
            views,
            depth_threshold: config.depth_threshold,
            period: AdaptivePeriod::new(
                Duration::from_secs(config.initial_period_secs),
                Duration::from_secs(config.max_period_secs),
            ),
            span: tracing::info_span!("monitor"),
        }
    }

    pub fn classify(&self, stats: &QueueStats) -> QueueHealth {
        if stats.depth < self.depth_threshold {
            QueueHealth::Ok
        } else {
            QueueHealth::Warning
        }
    }

    /// Audit every view once. Returns `true` if any queue is congested.
    pub fn check_all(&self) -> bool {
        let mut congested = false;

        for view in &self.views {
            let stats = view.stats();
            let capacity = stats
                .capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unbounded".to_string());

            match self.classify(&stats) {
                QueueHealth::Ok => {
                    debug!(
                        queue = view.name(),
                        depth = stats.depth,
                        in_flight = stats.in_flight,
                        dropped = stats.dropped,
                        "Queue depth {}/{}",
                        stats.depth,
                        capacity
                    );
                }
                QueueHealth::Warning => {
                    congested = true;
                    warn!(
                        queue = view.name(),
                        depth = stats.depth,
                        in_flight = stats.in_flight,
                        dropped = stats.dropped,
                        out_of_order = stats.out_of_order,
                        "Queue depth {}/{} is at or above threshold {}",
                        stats.depth,
                        capacity,
                        self.depth_threshold
                    );
                }
            }
        }

        congested
    }

    /// Run until shutdown: sleep, audit, adapt the period
    pub fn run(mut self, shutdown: ShutdownSignal) {
        let span = self.span.clone();
        let _guard = span.enter();
        info!(
            "Health monitor watching {} queues (threshold {})",
            self.views.len(),
            self.depth_threshold
        );

        let mut wait = self.period.current();
        while !shutdown.sleep(wait) {
            let congested = self.check_all();
            wait = self.period.advance(congested);
            debug!("Next queue audit in {:?}", wait);
        }

        info!("Health monitor stopped");
    }
}
