//! Ordered result consumers: the restreamer annotates and encodes one model's
//! results per camera, drains log the rest.

pub mod annotate;
pub mod encoder;


pub use annotate::{build_annotator, Annotator, PassthroughAnnotator};
pub use encoder::{EncoderSettings, FfmpegEncoder, FfmpegSinkFactory, FrameSink, SinkFactory, SinkProtocol};

use crate::error::Result;
use crate::frame::InferenceResult;
use crate::rendezvous::OrderedRendezvousQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Failures logged at the start of a failing run and every this many after
const WRITE_FAILURE_LOG_EVERY: u64 = 100;

#[derive(Debug, Default)]
pub struct RestreamStats {
    pub written: AtomicU64,
    pub failed: AtomicU64,
}

/// Whether the `n`th consecutive write failure (1-based) gets a log line
pub fn should_log_failure(n: u64) -> bool {
    n == 1 || n % WRITE_FAILURE_LOG_EVERY == 0
}

/// Annotates a camera's ordered results and writes them to its encoder.
///
/// Write errors never stop the loop.
pub struct Restreamer {
    camera: String,
    model: String,
    results: Arc<OrderedRendezvousQueue<InferenceResult>>,
    annotator: Arc<dyn Annotator>,
    sink: Box<dyn FrameSink>,
    stats: Arc<RestreamStats>,
}

impl Restreamer {
    pub fn new(
        camera: &str,
        model: &str,
        results: Arc<OrderedRendezvousQueue<InferenceResult>>,
        annotator: Arc<dyn Annotator>,
        sink: Box<dyn FrameSink>,
    ) -> Self {
        Self {
            camera: camera.to_string(),
            model: model.to_string(),
            results,
            annotator,
            sink,
            stats: Arc::new(RestreamStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RestreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn run(mut self) -> Result<()> {
        info!(camera = %self.camera, model = %self.model, "Restreamer started");
        let mut consecutive_failures = 0u64;

        while let Some((timestamp, result)) = self.results.take_with_timestamp() {
            let InferenceResult {
                mut frame,
                detections,
            } = result;
            self.annotator.annotate(&mut frame, &detections);

            match self.sink.write_frame(&frame) {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!(
                            camera = %self.camera,
                            "Restream recovered after {} failed writes",
                            consecutive_failures
                        );
                    }
                    consecutive_failures = 0;
                    self.stats.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    if should_log_failure(consecutive_failures) {
                        warn!(
                            camera = %self.camera,
                            failures = consecutive_failures,
                            "Restream write failed for frame {}: {}",
                            timestamp,
                            e
                        );
                    }
                }
            }
        }

        info!(
            camera = %self.camera,
            "Restreamer stopped after {} frames",
            self.stats.written.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

/// Consumes a (camera, model) result queue that is not restreamed, logging
/// its detections so the queue never backs up.
pub struct ResultDrain {
    camera: String,
    model: String,
    results: Arc<OrderedRendezvousQueue<InferenceResult>>,
    drained: Arc<AtomicU64>,
}

impl ResultDrain {
    pub fn new(camera: &str, model: &str, results: Arc<OrderedRendezvousQueue<InferenceResult>>) -> Self {
        Self {
            camera: camera.to_string(),
            model: model.to_string(),
            results,
            drained: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn drained(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.drained)
    }

    pub fn run(self) -> Result<()> {
        while let Some((timestamp, result)) = self.results.take_with_timestamp() {
            self.drained.fetch_add(1, Ordering::Relaxed);
            if result.detections.is_empty() {
                continue;
            }
            debug!(
                camera = %self.camera,
                model = %self.model,
                "Frame {}: {}",
                timestamp,
                result
                    .detections
                    .iter()
                    .map(|d| format!("{} {:.2}", d.label, d.confidence))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        Ok(())
    }
}
