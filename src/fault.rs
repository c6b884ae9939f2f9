use crate::error::{ErrorCategory, PipelineError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Diagnostic record of the fault that ends the run.
#[derive(Debug, Clone)]
pub struct FaultRecord {
    pub category: ErrorCategory,
    pub message: String,
    /// Component that reported the fault, e.g. `model/person`
    pub origin: String,
    /// `source()` chain of the originating error, outermost first
    pub causes: Vec<String>,
    pub occurred_at: DateTime<Utc>,
}

impl FaultRecord {
    pub fn new<O: Into<String>, M: Into<String>>(
        category: ErrorCategory,
        origin: O,
        message: M,
    ) -> Self {
        Self {
            category,
            message: message.into(),
            origin: origin.into(),
            causes: Vec::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn from_error<O: Into<String>>(origin: O, err: &PipelineError) -> Self {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            category: err.category(),
            message: err.to_string(),
            origin: origin.into(),
            causes,
            occurred_at: Utc::now(),
        }
    }

    /// Process exit code for this fault
    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.category)
    }

    /// Write the full diagnostic dump at error level
    pub fn log(&self) {
        error!("Fatal fault category ==> {}", self.category);
        error!("Fatal fault origin   ==> {}", self.origin);
        error!("Fatal fault message  ==> {}", self.message);
        error!("Fatal fault time     ==> {}", self.occurred_at.to_rfc3339());
        for (depth, cause) in self.causes.iter().enumerate() {
            error!("Fatal fault cause #{} ==> {}", depth + 1, cause);
        }
    }
}

/// Exit code taxonomy for fatal faults
pub fn exit_code_for(category: ErrorCategory) -> i32 {
    match category {
        ErrorCategory::Configuration => 2,
        ErrorCategory::Inference => 3,
        ErrorCategory::InternalLogic => 4,
        ErrorCategory::Startup => 5,
        _ => 1,
    }
}

/// Cloneable publishing side of the fault slot.
///
/// Only the first published record is delivered; later ones are counted and
/// discarded without blocking.
#[derive(Clone)]
pub struct FaultReporter {
    slot: Arc<Mutex<Option<oneshot::Sender<FaultRecord>>>>,
    suppressed: Arc<AtomicU64>,
}

impl FaultReporter {
    /// Publish a fault. Returns `true` if this record claimed the slot.
    pub fn publish(&self, record: FaultRecord) -> bool {
        let sender = self.slot.lock().take();
        match sender {
            Some(sender) => {
                error!(
                    origin = %record.origin,
                    category = %record.category,
                    "Fatal fault reported: {}",
                    record.message
                );
                // The receiver may be gone during teardown; nothing left to notify then
                let _ = sender.send(record);
                true
            }
            None => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    origin = %record.origin,
                    "Fault slot already taken, dropping: {}",
                    record.message
                );
                false
            }
        }
    }

    pub fn report<O: Into<String>>(&self, origin: O, err: &PipelineError) -> bool {
        self.publish(FaultRecord::from_error(origin, err))
    }

    /// Faults discarded because the slot was already taken
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn is_claimed(&self) -> bool {
        self.slot.lock().is_none()
    }
}

/// Single-slot handoff from any pipeline thread to the supervisor.
pub struct FaultAggregator {
    reporter: FaultReporter,
    receiver: Option<oneshot::Receiver<FaultRecord>>,
}

impl FaultAggregator {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            reporter: FaultReporter {
                slot: Arc::new(Mutex::new(Some(sender))),
                suppressed: Arc::new(AtomicU64::new(0)),
            },
            receiver: Some(receiver),
        }
    }

    pub fn reporter(&self) -> FaultReporter {
        self.reporter.clone()
    }

    /// Take the receiving side; the supervisor awaits it
    pub fn take_receiver(&mut self) -> Option<oneshot::Receiver<FaultRecord>> {
        self.receiver.take()
    }

    /// Block the calling thread until the first fault arrives
    pub fn wait_blocking(&mut self) -> Option<FaultRecord> {
        self.receiver.take()?.blocking_recv().ok()
    }
}

impl Default for FaultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a named pipeline thread whose error or panic is published as a fault.
///
/// Non-fatal errors returned by `body` are logged and not published.
pub fn spawn_component<F>(
    name: String,
    reporter: FaultReporter,
    body: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    let origin = name.clone();
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(Ok(())) => debug!(component = %origin, "Component finished"),
            Ok(Err(e)) if e.is_fatal() => {
                reporter.report(origin, &e);
            }
            Ok(Err(e)) => warn!(component = %origin, "Component stopped: {}", e),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                reporter.publish(FaultRecord::new(
                    ErrorCategory::InternalLogic,
                    origin,
                    format!("thread panicked: {}", message),
                ));
            }
        })
        .map_err(|e| PipelineError::startup(name, format!("failed to spawn thread: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_first_fault_wins() {
        let mut aggregator = FaultAggregator::new();
        let reporter = aggregator.reporter();

        assert!(reporter.publish(FaultRecord::new(
            ErrorCategory::Inference,
            "model/person",
            "CUDA out of memory"
        )));
        assert!(!reporter.publish(FaultRecord::new(
            ErrorCategory::InternalLogic,
            "camera/gate",
            "second fault"
        )));

        let record = aggregator.wait_blocking().unwrap();
        assert_eq!(record.origin, "model/person");
        assert_eq!(record.exit_code(), 3);
        assert_eq!(reporter.suppressed(), 1);
    }

    #[test]
    fn test_concurrent_reports_deliver_exactly_one() {
        let mut aggregator = FaultAggregator::new();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reporter = aggregator.reporter();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    reporter.publish(FaultRecord::new(
                        ErrorCategory::InternalLogic,
                        format!("worker/{}", i),
                        "simultaneous",
                    ))
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|claimed| *claimed)
            .count();
        assert_eq!(winners, 1);

        let record = aggregator.wait_blocking().unwrap();
        assert!(record.origin.starts_with("worker/"));
        assert_eq!(aggregator.reporter().suppressed(), 7);
    }

    #[test]
    fn test_record_captures_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = PipelineError::from(io);
        let record = FaultRecord::from_error("model/person", &err);

        assert_eq!(record.category, ErrorCategory::TransientIo);
        assert!(record.message.contains("pipe closed"));
        assert_eq!(record.causes, vec!["pipe closed".to_string()]);
    }

    #[test]
    fn test_spawned_panic_becomes_logic_fault() {
        let mut aggregator = FaultAggregator::new();
        let handle = spawn_component("sampler/gate".to_string(), aggregator.reporter(), || {
            panic!("pending list corrupted")
        })
        .unwrap();
        handle.join().unwrap();

        let record = aggregator.wait_blocking().unwrap();
        assert_eq!(record.category, ErrorCategory::InternalLogic);
        assert_eq!(record.origin, "sampler/gate");
        assert!(record.message.contains("pending list corrupted"));
    }

    #[test]
    fn test_spawned_fatal_error_is_reported() {
        let mut aggregator = FaultAggregator::new();
        let handle = spawn_component("model/person".to_string(), aggregator.reporter(), || {
            Err(PipelineError::Detection {
                model: "person".to_string(),
                message: "reply was not JSON".to_string(),
            })
        })
        .unwrap();
        handle.join().unwrap();

        let record = aggregator.wait_blocking().unwrap();
        assert_eq!(record.category, ErrorCategory::Inference);
        assert_eq!(record.exit_code(), 3);
    }

    #[test]
    fn test_spawned_clean_exit_reports_nothing() {
        let aggregator = FaultAggregator::new();
        let reporter = aggregator.reporter();
        spawn_component("monitor".to_string(), reporter.clone(), || Ok(()))
            .unwrap()
            .join()
            .unwrap();
        assert!(!reporter.is_claimed());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(ErrorCategory::Configuration), 2);
        assert_eq!(exit_code_for(ErrorCategory::Inference), 3);
        assert_eq!(exit_code_for(ErrorCategory::InternalLogic), 4);
        assert_eq!(exit_code_for(ErrorCategory::Startup), 5);
        assert_eq!(exit_code_for(ErrorCategory::TransientIo), 1);
    }
}
