//! Custom error types for the plan engine.
//!
//! `PlanError` is the single error type returned by the library. Configuration
//! problems (an empty segment chain, duplicate names, a missing SEV) are caught
//! synchronously when a plan is defined or started, so a misconfigured plan
//! never activates a segment.
//!
//! ## Error Hierarchy
//!
//! - **Plan definition**: `NoSegments`, `DuplicateSegmentName`,
//!   `DuplicateTriggerName`, `NoSampleEnvironment`.
//! - **Lifecycle misuse**: `AlreadyRunning`, `StillRunning`, `NeverRun`,
//!   `SegmentAlreadyActive`, `InvalidDriverState`.
//! - **Runtime resources**: `TimerSpawn` when a background timer thread
//!   cannot be created.
//! - **Wrapped errors**: `Io`, `Serialization`, `Config`.
//!
//! Signal read failures never surface here: they are absorbed at the
//! signal boundary (see [`crate::experiment::signal::LenientSignal`]).

use thiserror::Error;

/// Convenience alias for results using the plan error type.
pub type PlanResult<T> = std::result::Result<T, PlanError>;

/// Errors produced while defining, running or inspecting a plan.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("No segments defined!")]
    NoSegments,

    #[error("Segments should have unique names! '{0}' is defined more than once")]
    DuplicateSegmentName(String),

    #[error("Triggers should have unique names! '{0}' is defined more than once")]
    DuplicateTriggerName(String),

    #[error("No SEVs defined!")]
    NoSampleEnvironment,

    #[error("Plan '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Experiment '{0}' is still running!")]
    StillRunning(String),

    #[error("Experiment '{0}' has not been run")]
    NeverRun(String),

    #[error("Segment '{0}' is already active")]
    SegmentAlreadyActive(String),

    #[error("Method {method} can only be called from: {allowed}")]
    InvalidDriverState {
        method: &'static str,
        allowed: String,
    },

    #[error("Failed to spawn timer thread '{name}': {source}")]
    TimerSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for PlanError {
    fn from(value: figment::Error) -> Self {
        PlanError::Config(Box::new(value))
    }
}

impl PlanError {
    /// Whether the error stems from an invalid plan definition rather than
    /// a runtime or lifecycle problem.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PlanError::NoSegments
                | PlanError::DuplicateSegmentName(_)
                | PlanError::DuplicateTriggerName(_)
                | PlanError::NoSampleEnvironment
                | PlanError::Configuration(_)
                | PlanError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_errors_are_configuration_errors() {
        assert!(PlanError::NoSegments.is_configuration());
        assert!(PlanError::DuplicateSegmentName("ramp".into()).is_configuration());
        assert!(PlanError::DuplicateTriggerName("xrd".into()).is_configuration());
        assert!(PlanError::NoSampleEnvironment.is_configuration());
        assert!(!PlanError::StillRunning("plan".into()).is_configuration());
    }

    #[test]
    fn messages_name_the_offender() {
        let err = PlanError::DuplicateSegmentName("hold".into());
        assert!(err.to_string().contains("'hold'"));

        let err = PlanError::InvalidDriverState {
            method: "resume",
            allowed: "Paused".into(),
        };
        assert_eq!(err.to_string(), "Method resume can only be called from: Paused");
    }
}
