use crate::fault::FaultRecord;

/// Component lifecycle states
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Why the supervisor stopped the pipeline
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    Fault(FaultRecord),
    /// The shutdown signal was cancelled by its owner
    Requested,
}

impl ShutdownReason {
    /// Process exit code for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fault(record) => record.exit_code(),
            Self::Signal(_) | Self::Requested => 0,
        }
    }
}
