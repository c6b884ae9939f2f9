mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;


pub use orchestrator::{Backends, PipelineOrchestrator};
pub use types::{ComponentState, ShutdownReason};
