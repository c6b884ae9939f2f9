use super::types::ComponentState;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::fanout::ModelInbox;
use crate::fault::{FaultAggregator, FaultReporter};
use crate::frame::{Frame, InferenceResult};
use crate::health::{HealthMonitor, QueueView};
use crate::inference::{DetectorLoader, InferenceJob, InferenceWorkerPool, ProcessDetectorLoader};
use crate::ingest::{
    CaptureDispatcher, FfmpegSourceFactory, LinkPolicy, ModelRoute, MotionGate, SourceFactory,
    SourceGeometry, StreamIngestor,
};
use crate::rendezvous::OrderedRendezvousQueue;
use crate::restream::{build_annotator, Annotator, FfmpegSinkFactory, SinkFactory};
use crate::shutdown::ShutdownSignal;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// External collaborators the pipeline is assembled from
#[derive(Clone)]
pub struct Backends {
    pub sources: Arc<dyn SourceFactory>,
    pub detectors: Arc<dyn DetectorLoader>,
    pub sinks: Arc<dyn SinkFactory>,
    pub annotator: Arc<dyn Annotator>,
}

impl Backends {
    /// ffmpeg decoding and encoding, process detectors, box annotation
    pub fn ffmpeg(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            sources: Arc::new(FfmpegSourceFactory),
            detectors: Arc::new(ProcessDetectorLoader),
            sinks: Arc::new(FfmpegSinkFactory),
            annotator: build_annotator(&config.annotation)?,
        })
    }
}

/// Consumer of one (camera, model) result queue
pub(super) enum ResultConsumer {
    Restream {
        model: String,
        sink: String,
        results: Arc<OrderedRendezvousQueue<InferenceResult>>,
    },
    Drain {
        model: String,
        results: Arc<OrderedRendezvousQueue<InferenceResult>>,
    },
}

/// Everything built for one camera, waiting to be started
pub(super) struct CameraPipeline {
    pub(super) name: String,
    pub(super) geometry: SourceGeometry,
    pub(super) ingestor: Option<StreamIngestor>,
    pub(super) dispatcher: Option<CaptureDispatcher>,
    pub(super) consumers: Vec<ResultConsumer>,
}

/// Builds the pipeline from configuration and supervises it until the first
/// fault or a termination signal.
pub struct PipelineOrchestrator {
    pub(super) config: PipelineConfig,
    pub(super) backends: Backends,

    // Components, taken when started
    pub(super) cameras: Vec<CameraPipeline>,
    pub(super) pool: Option<InferenceWorkerPool>,
    pub(super) monitor: Option<HealthMonitor>,
    pub(super) queue_views: Vec<Arc<dyn QueueView>>,
    pub(super) gates: BTreeMap<String, MotionGate>,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) threads: Vec<(String, JoinHandle<()>)>,
    pub(super) faults: FaultAggregator,
    pub(super) shutdown: ShutdownSignal,
    pub(super) span: tracing::Span,
}

impl PipelineOrchestrator {
    /// Validate the configuration, open every source and build all queues,
    /// workers and consumers. Nothing runs until [`start`](Self::start).
    pub fn new(config: PipelineConfig, backends: Backends) -> Result<Self> {
        config.validate()?;

        let span = tracing::info_span!("supervisor");
        let shutdown = ShutdownSignal::new();
        let mut queue_views: Vec<Arc<dyn QueueView>> = Vec::new();
        let mut gates = BTreeMap::new();
        let mut inboxes: BTreeMap<String, ModelInbox<InferenceJob>> = BTreeMap::new();
        let mut cameras = Vec::new();

        for (name, camera) in &config.cameras {
            let handle = backends.sources.open(name, camera, &config.link)?;
            info!(
                camera = %name,
                "Camera configured at {}x{} for models {:?}",
                handle.geometry.width,
                handle.geometry.height,
                camera.models
            );

            let captures: Arc<OrderedRendezvousQueue<Frame>> = Arc::new(OrderedRendezvousQueue::new(
                format!("captures/{}", name),
                shutdown.clone(),
            ));
            queue_views.push(captures.clone());

            let restream_model = camera
                .sink
                .as_ref()
                .and_then(|_| camera.restream_model())
                .map(str::to_string);

            let mut routes = Vec::new();
            let mut consumers = Vec::new();
            for model in &camera.models {
                let model_config = config.models.get(model).ok_or_else(|| {
                    PipelineError::invalid_config(
                        format!("cameras.{}.models", name),
                        format!("unknown model `{}`", model),
                    )
                })?;

                let lane = inboxes
                    .entry(model.clone())
                    .or_insert_with(|| ModelInbox::new(shutdown.clone()))
                    .add_lane(format!("{}/{}", name, model), model_config.queue_capacity);
                let results: Arc<OrderedRendezvousQueue<InferenceResult>> =
                    Arc::new(OrderedRendezvousQueue::new(
                        format!("results/{}/{}", name, model),
                        shutdown.clone(),
                    ));
                queue_views.push(lane.clone());
                queue_views.push(results.clone());

                consumers.push(match (&restream_model, &camera.sink) {
                    (Some(restream), Some(sink)) if restream == model => ResultConsumer::Restream {
                        model: model.clone(),
                        sink: sink.clone(),
                        results: Arc::clone(&results),
                    },
                    _ => ResultConsumer::Drain {
                        model: model.clone(),
                        results: Arc::clone(&results),
                    },
                });

                routes.push(ModelRoute {
                    model: model.clone(),
                    lane,
                    results,
                });
            }

            let ingestor = StreamIngestor::new(
                name,
                handle.connector,
                LinkPolicy::from(&config.link),
                config.sampling.fps,
                Arc::clone(&captures),
                shutdown.clone(),
            );
            gates.insert(name.clone(), ingestor.gate());

            cameras.push(CameraPipeline {
                name: name.clone(),
                geometry: handle.geometry,
                ingestor: Some(ingestor),
                dispatcher: Some(CaptureDispatcher::new(name, captures, routes)),
                consumers,
            });
        }

        let mut pool = InferenceWorkerPool::new(Arc::clone(&backends.detectors));
        for (model, model_config) in &config.models {
            match inboxes.remove(model) {
                Some(inbox) => pool.add_worker(model, model_config.clone(), inbox),
                None => warn!(model = %model, "Model is not assigned to any camera, not loading it"),
            }
        }

        let monitor = HealthMonitor::new(&config.monitor, queue_views.clone());
        debug!(
            "Pipeline built: {} cameras, {} workers, {} queues",
            cameras.len(),
            pool.len(),
            queue_views.len()
        );

        Ok(Self {
            config,
            backends,
            cameras,
            pool: Some(pool),
            monitor: Some(monitor),
            queue_views,
            gates,
            component_states: Arc::new(Mutex::new(HashMap::new())),
            threads: Vec::new(),
            faults: FaultAggregator::new(),
            shutdown,
            span,
        })
    }

    /// Motion gate of a camera, for pausing its sampler
    pub fn motion_gate(&self, camera: &str) -> Option<MotionGate> {
        self.gates.get(camera).cloned()
    }

    pub fn queue_views(&self) -> &[Arc<dyn QueueView>] {
        &self.queue_views
    }

    /// Cancelling this signal stops the pipeline as a clean shutdown
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn fault_reporter(&self) -> FaultReporter {
        self.faults.reporter()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
