use super::orchestrator::ResultConsumer;
use super::{ComponentState, PipelineOrchestrator};
use crate::error::{PipelineError, Result};
use crate::fault::spawn_component;
use crate::restream::{EncoderSettings, Restreamer, ResultDrain};
use std::sync::Arc;
use tracing::{error, info};

/// A consumer ready to be spawned, with its sink already open
enum ReadyConsumer {
    Restream(Restreamer),
    Drain(ResultDrain),
}

impl PipelineOrchestrator {
    /// Names of every pipeline thread, in start order
    fn component_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pool
            .as_ref()
            .map(|pool| pool.models().iter().map(|m| format!("model/{}", m)).collect())
            .unwrap_or_default();

        for camera in &self.cameras {
            for consumer in &camera.consumers {
                names.push(match consumer {
                    ResultConsumer::Restream { .. } => format!("restream/{}", camera.name),
                    ResultConsumer::Drain { model, .. } => {
                        format!("drain/{}/{}", camera.name, model)
                    }
                });
            }
        }
        for camera in &self.cameras {
            names.push(format!("dispatch/{}", camera.name));
        }
        for camera in &self.cameras {
            names.push(format!("link/{}", camera.name));
            names.push(format!("sampler/{}", camera.name));
        }
        names.push("monitor".to_string());
        names
    }

    /// Register every component as stopped
    pub async fn initialize(&mut self) -> Result<()> {
        info!(parent: &self.span, "Initializing pipeline components");

        let names = self.component_names();
        let mut states = self.component_states.lock().await;
        for name in &names {
            states.insert(name.clone(), ComponentState::Stopped);
        }
        drop(states);

        info!(parent: &self.span, "{} components initialized", names.len());
        Ok(())
    }

    /// Open every sink, then start the pipeline from the output end backwards
    /// so no stage produces into a queue nobody consumes.
    pub async fn start(&mut self) -> Result<()> {
        info!(parent: &self.span, "Starting pipeline");

        // Sinks first: a sink that cannot start aborts before any thread runs
        let mut ready = Vec::new();
        for camera in &mut self.cameras {
            for consumer in camera.consumers.drain(..) {
                ready.push(match consumer {
                    ResultConsumer::Restream {
                        model,
                        sink,
                        results,
                    } => {
                        let settings = EncoderSettings::new(
                            &sink,
                            camera.geometry.width,
                            camera.geometry.height,
                            f64::from(self.config.sampling.fps),
                        )?;
                        let sink = self
                            .backends
                            .sinks
                            .open(&camera.name, &settings)
                            .map_err(|e| {
                                error!(camera = %camera.name, "Failed to open restream sink: {}", e);
                                e
                            })?;
                        (
                            format!("restream/{}", camera.name),
                            ReadyConsumer::Restream(Restreamer::new(
                                &camera.name,
                                &model,
                                results,
                                Arc::clone(&self.backends.annotator),
                                sink,
                            )),
                        )
                    }
                    ResultConsumer::Drain { model, results } => (
                        format!("drain/{}/{}", camera.name, model),
                        ReadyConsumer::Drain(ResultDrain::new(&camera.name, &model, results)),
                    ),
                });
            }
        }

        let faults = self.faults.reporter();

        let pool = self
            .pool
            .take()
            .ok_or_else(|| PipelineError::system("Pipeline already started"))?;
        let models: Vec<String> = pool.models().iter().map(|m| format!("model/{}", m)).collect();
        for name in &models {
            self.set_component_state(name, ComponentState::Starting).await;
        }
        let handles = pool.spawn(&faults)?;
        for (name, handle) in models.into_iter().zip(handles) {
            self.mark_running(name, handle).await;
        }
        info!(parent: &self.span, "Inference workers started");

        for (name, consumer) in ready {
            self.set_component_state(&name, ComponentState::Starting).await;
            let handle = match consumer {
                ReadyConsumer::Restream(restreamer) => {
                    spawn_component(name.clone(), faults.clone(), move || restreamer.run())?
                }
                ReadyConsumer::Drain(drain) => {
                    spawn_component(name.clone(), faults.clone(), move || drain.run())?
                }
            };
            self.mark_running(name, handle).await;
        }

        let dispatchers: Vec<_> = self
            .cameras
            .iter_mut()
            .filter_map(|camera| camera.dispatcher.take().map(|d| (camera.name.clone(), d)))
            .collect();
        for (camera, dispatcher) in dispatchers {
            let name = format!("dispatch/{}", camera);
            self.set_component_state(&name, ComponentState::Starting).await;
            let handle = spawn_component(name.clone(), faults.clone(), move || dispatcher.run())?;
            self.mark_running(name, handle).await;
        }

        let ingestors: Vec<_> = self
            .cameras
            .iter_mut()
            .filter_map(|camera| camera.ingestor.take())
            .collect();
        for ingestor in ingestors {
            let names = [
                format!("link/{}", ingestor.camera()),
                format!("sampler/{}", ingestor.camera()),
            ];
            for name in &names {
                self.set_component_state(name, ComponentState::Starting).await;
            }
            let handles = ingestor.spawn(&faults)?;
            for (name, handle) in names.into_iter().zip(handles) {
                self.mark_running(name, handle).await;
            }
        }
        info!(parent: &self.span, "{} cameras streaming", self.cameras.len());

        if let Some(monitor) = self.monitor.take() {
            let name = "monitor".to_string();
            self.set_component_state(&name, ComponentState::Starting).await;
            let shutdown = self.shutdown.clone();
            let handle = spawn_component(name.clone(), faults, move || {
                monitor.run(shutdown);
                Ok(())
            })?;
            self.mark_running(name, handle).await;
        }

        info!(parent: &self.span, "Pipeline started with {} threads", self.threads.len());
        Ok(())
    }

    async fn mark_running(&mut self, name: String, handle: std::thread::JoinHandle<()>) {
        self.set_component_state(&name, ComponentState::Running).await;
        self.threads.push((name, handle));
    }
}
