use super::{PipelineOrchestrator, ShutdownReason};
use crate::error::{ErrorCategory, PipelineError, Result};
use crate::fault::FaultRecord;
use tokio::signal;
use tracing::{info, warn};

impl PipelineOrchestrator {
    /// Supervise until the first fault, a termination signal or a requested
    /// shutdown, then stop everything. Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        info!(parent: &self.span, "Pipeline is running");

        let faults = self
            .faults
            .take_receiver()
            .ok_or_else(|| PipelineError::system("Fault receiver already taken"))?;
        let requested = self.shutdown.token();

        let reason = tokio::select! {
            fault = faults => match fault {
                Ok(record) => ShutdownReason::Fault(record),
                Err(_) => ShutdownReason::Fault(FaultRecord::new(
                    ErrorCategory::InternalLogic,
                    "supervisor",
                    "fault channel closed unexpectedly",
                )),
            },
            name = termination_signal() => ShutdownReason::Signal(name.to_string()),
            _ = requested.cancelled() => ShutdownReason::Requested,
        };

        match &reason {
            ShutdownReason::Fault(record) => record.log(),
            ShutdownReason::Signal(name) => info!(parent: &self.span, "Received {}", name),
            ShutdownReason::Requested => info!(parent: &self.span, "Shutdown requested"),
        }

        self.shutdown().await?;

        let suppressed = self.faults.reporter().suppressed();
        if suppressed > 0 {
            warn!(parent: &self.span, "{} further faults were reported during teardown", suppressed);
        }

        let exit_code = reason.exit_code();
        info!(parent: &self.span, "Pipeline stopped ({}), exit code {}", reason_label(&reason), exit_code);
        Ok(exit_code)
    }
}

fn reason_label(reason: &ShutdownReason) -> &str {
    match reason {
        ShutdownReason::Signal(name) => name,
        ShutdownReason::Fault(record) => record.category.label(),
        ShutdownReason::Requested => "requested",
    }
}

/// Resolves with the name of the first SIGINT or SIGTERM received
async fn termination_signal() -> &'static str {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                warn!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate() => "SIGTERM",
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
