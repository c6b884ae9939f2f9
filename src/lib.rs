pub mod app;
pub mod config;
pub mod error;
pub mod fanout;
pub mod fault;
pub mod frame;
pub mod health;
pub mod inference;
pub mod ingest;
pub mod rendezvous;
pub mod restream;
pub mod shutdown;

pub use app::{Backends, ComponentState, PipelineOrchestrator, ShutdownReason};
pub use config::PipelineConfig;
pub use error::{ErrorCategory, PipelineError, Result};
pub use fanout::{BoundedFanoutQueue, ModelInbox};
pub use fault::{FaultAggregator, FaultRecord, FaultReporter};
pub use frame::{BoundingBox, Detection, Frame, InferenceResult, Timestamp};
pub use health::{HealthMonitor, QueueStats, QueueView};
pub use inference::{Detector, DetectorLoader, InferenceWorkerPool};
pub use ingest::{MotionGate, StreamIngestor};
pub use rendezvous::OrderedRendezvousQueue;
pub use restream::{Annotator, FrameSink, Restreamer, SinkFactory};
pub use shutdown::ShutdownSignal;
