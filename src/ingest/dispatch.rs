use crate::error::Result;
use crate::fanout::BoundedFanoutQueue;
use crate::frame::{Frame, InferenceResult, Timestamp};
use crate::inference::InferenceJob;
use crate::rendezvous::OrderedRendezvousQueue;
use std::sync::Arc;
use tracing::{debug, info};

/// Where one camera's samples go for one model.
#[derive(Clone)]
pub struct ModelRoute {
    pub model: String,
    /// Fan-out lane into the model worker's inbox
    pub lane: Arc<BoundedFanoutQueue<InferenceJob>>,
    /// Ordered results of this (camera, model) pair
    pub results: Arc<OrderedRendezvousQueue<InferenceResult>>,
}

/// Moves ordered captures of one camera into every assigned model's lane.
pub struct CaptureDispatcher {
    camera: String,
    captures: Arc<OrderedRendezvousQueue<Frame>>,
    routes: Vec<ModelRoute>,
}

impl CaptureDispatcher {
    pub fn new(
        camera: &str,
        captures: Arc<OrderedRendezvousQueue<Frame>>,
        routes: Vec<ModelRoute>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            captures,
            routes,
        }
    }

    /// Reserve the result slot first, then enqueue the job. An entry evicted
    /// by drop-oldest will never be completed, so its reservation is withdrawn.
    pub fn dispatch(&self, timestamp: Timestamp, frame: Frame) -> Result<()> {
        for route in &self.routes {
            route.results.reserve(timestamp);

            let job = InferenceJob {
                camera: self.camera.clone(),
                timestamp,
                frame: frame.clone(),
                results: Arc::clone(&route.results),
            };

            if let Some(evicted) = route.lane.push(job) {
                debug!(
                    camera = %self.camera,
                    model = %route.model,
                    "Inference lane full, dropped frame {}",
                    evicted.timestamp
                );
                evicted.results.withdraw(evicted.timestamp)?;
            }
        }
        Ok(())
    }

    pub fn run(self) -> Result<()> {
        info!(
            camera = %self.camera,
            "Dispatcher started for {} models",
            self.routes.len()
        );

        while let Some((timestamp, frame)) = self.captures.take_with_timestamp() {
            self.dispatch(timestamp, frame)?;
        }

        debug!(camera = %self.camera, "Dispatcher stopped");
        Ok(())
    }
}
