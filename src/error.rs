use crate::frame::Timestamp;
use thiserror::Error;

/// Failure classes used to decide whether an error ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing or invalid required configuration, fatal at startup
    Configuration,
    /// Source disconnects and read timeouts, absorbed by the link maintainer
    TransientIo,
    /// Fan-out queue full, absorbed by drop-oldest
    Overload,
    /// Detector load or invocation failure
    Inference,
    /// Encoder pipe failures, logged and swallowed
    RestreamIo,
    /// Broken internal invariant
    InternalLogic,
    /// Resources that could not be brought up at startup (threads, processes)
    Startup,
}

impl ErrorCategory {
    /// Whether errors of this category must reach the fault aggregator
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Configuration
                | ErrorCategory::Inference
                | ErrorCategory::InternalLogic
                | ErrorCategory::Startup
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::TransientIo => "transient-io",
            ErrorCategory::Overload => "overload",
            ErrorCategory::Inference => "inference",
            ErrorCategory::RestreamIo => "restream-io",
            ErrorCategory::InternalLogic => "internal-logic",
            ErrorCategory::Startup => "startup",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Source error on camera {camera}: {message}")]
    Source { camera: String, message: String },

    #[error("Detector load failed for model {model}: {message}")]
    DetectorLoad { model: String, message: String },

    #[error("Detection failed for model {model}: {message}")]
    Detection { model: String, message: String },

    #[error("Encoder error on camera {camera}: {message}")]
    Encoder { camera: String, message: String },

    #[error("No pending reservation for timestamp {timestamp}")]
    UnknownReservation { timestamp: Timestamp },

    #[error("Timestamp {timestamp} was already completed")]
    DuplicateCompletion { timestamp: Timestamp },

    #[error("Failed to start {component}: {message}")]
    Startup { component: String, message: String },

    #[error("System error: {message}")]
    System { message: String },
}

impl PipelineError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn invalid_config<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn startup<C: Into<String>, M: Into<String>>(component: C, message: M) -> Self {
        Self::Startup {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Map the error onto the failure taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Config(_)
            | PipelineError::InvalidConfig { .. }
            | PipelineError::Serialization(_) => ErrorCategory::Configuration,
            PipelineError::Io(_) | PipelineError::Source { .. } => ErrorCategory::TransientIo,
            PipelineError::DetectorLoad { .. }
            | PipelineError::Detection { .. }
            | PipelineError::Json(_) => ErrorCategory::Inference,
            PipelineError::Encoder { .. } => ErrorCategory::RestreamIo,
            PipelineError::UnknownReservation { .. }
            | PipelineError::DuplicateCompletion { .. }
            | PipelineError::System { .. } => ErrorCategory::InternalLogic,
            PipelineError::Startup { .. } => ErrorCategory::Startup,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
