use super::{ComponentState, PipelineOrchestrator};
use crate::error::Result;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, warn};

/// Total time granted to all threads to observe cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

impl PipelineOrchestrator {
    /// Cancel the shutdown signal and join every pipeline thread.
    ///
    /// Threads that do not finish within the grace period are detached and
    /// marked failed.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!(parent: &self.span, "Beginning graceful shutdown");
        self.shutdown.cancel();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut detached = 0usize;

        // Reverse start order: producers stop before the stages they feed
        while let Some((name, handle)) = self.threads.pop() {
            self.set_component_state(&name, ComponentState::Stopping).await;

            let joined = timeout_at(deadline, tokio::task::spawn_blocking(move || handle.join()));
            match joined.await {
                Ok(Ok(Ok(()))) => {
                    self.set_component_state(&name, ComponentState::Stopped).await;
                }
                Ok(Ok(Err(_))) | Ok(Err(_)) => {
                    self.set_component_state(&name, ComponentState::Failed).await;
                    error!(parent: &self.span, "{} did not exit cleanly", name);
                }
                Err(_) => {
                    detached += 1;
                    self.set_component_state(&name, ComponentState::Failed).await;
                    warn!(parent: &self.span, "{} did not stop within {:?}, detaching", name, SHUTDOWN_GRACE);
                }
            }
        }

        if detached > 0 {
            warn!(parent: &self.span, "Shutdown completed with {} detached threads", detached);
        } else {
            info!(parent: &self.span, "Graceful shutdown completed");
        }
        Ok(())
    }
}
