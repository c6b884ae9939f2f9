pub mod detector;


pub use detector::{Detector, DetectorChannel, DetectorLoader, ProcessDetector, ProcessDetectorLoader};

use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::fanout::ModelInbox;
use crate::fault::{spawn_component, FaultReporter};
use crate::frame::{Frame, InferenceResult, Timestamp};
use crate::rendezvous::OrderedRendezvousQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace};

/// One sampled frame on its way to a model, with the queue its result goes to.
pub struct InferenceJob {
    pub camera: String,
    pub timestamp: Timestamp,
    pub frame: Frame,
    pub results: Arc<OrderedRendezvousQueue<InferenceResult>>,
}

/// Dedicated thread for one model. Owns its detector exclusively.
pub struct ModelWorker {
    model: String,
    config: ModelConfig,
    inbox: ModelInbox<InferenceJob>,
    loader: Arc<dyn DetectorLoader>,
    processed: Arc<AtomicU64>,
    span: tracing::Span,
}

impl ModelWorker {
    pub fn new(
        model: &str,
        config: ModelConfig,
        inbox: ModelInbox<InferenceJob>,
        loader: Arc<dyn DetectorLoader>,
    ) -> Self {
        Self {
            model: model.to_string(),
            span: tracing::info_span!("model", name = %model),
            config,
            inbox,
            loader,
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Frames this worker has completed so far
    pub fn processed(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.processed)
    }

    /// Load the detector, then serve the inbox until shutdown.
    ///
    /// Every error is returned as fatal; the worker never skips a frame it
    /// failed to process.
    pub fn run(self) -> Result<()> {
        let _guard = self.span.enter();

        let mut detector = self
            .loader
            .load(&self.model, &self.config)
            .map_err(|e| self.escalate_load(e))?;
        info!(
            "Worker ready, serving {} camera lanes",
            self.inbox.lanes().len()
        );

        while let Some(job) = self.inbox.recv() {
            let mut detections = detector
                .detect(&job.frame)
                .map_err(|e| self.escalate_detection(e))?;

            let before = detections.len();
            detections.retain(|d| d.confidence >= self.config.threshold);
            trace!(
                camera = %job.camera,
                "Frame {}: {} detections ({} below threshold)",
                job.timestamp,
                detections.len(),
                before - detections.len()
            );

            job.results.complete(
                job.timestamp,
                InferenceResult {
                    frame: job.frame,
                    detections,
                },
            )?;
            self.processed.fetch_add(1, Ordering::Relaxed);
        }

        debug!("Worker stopped after {} frames", self.processed.load(Ordering::Relaxed));
        Ok(())
    }

    fn escalate_load(&self, err: PipelineError) -> PipelineError {
        match err {
            PipelineError::DetectorLoad { .. } => err,
            other => PipelineError::DetectorLoad {
                model: self.model.clone(),
                message: other.to_string(),
            },
        }
    }

    fn escalate_detection(&self, err: PipelineError) -> PipelineError {
        if err.is_fatal() {
            err
        } else {
            PipelineError::Detection {
                model: self.model.clone(),
                message: err.to_string(),
            }
        }
    }
}

/// One worker per configured model.
pub struct InferenceWorkerPool {
    loader: Arc<dyn DetectorLoader>,
    workers: Vec<ModelWorker>,
}

impl InferenceWorkerPool {
    pub fn new(loader: Arc<dyn DetectorLoader>) -> Self {
        Self {
            loader,
            workers: Vec::new(),
        }
    }

    pub fn add_worker(&mut self, model: &str, config: ModelConfig, inbox: ModelInbox<InferenceJob>) {
        self.workers.push(ModelWorker::new(
            model,
            config,
            inbox,
            Arc::clone(&self.loader),
        ));
    }

    pub fn models(&self) -> Vec<&str> {
        self.workers.iter().map(ModelWorker::model).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Start every worker on its own thread
    pub fn spawn(self, faults: &FaultReporter) -> Result<Vec<JoinHandle<()>>> {
        self.workers
            .into_iter()
            .map(|worker| {
                let name = format!("model/{}", worker.model);
                spawn_component(name, faults.clone(), move || worker.run())
            })
            .collect()
    }
}
