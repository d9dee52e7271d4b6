//! Error types for cohort.

use thiserror::Error;

use crate::task::{PlanStatus, TaskStatus};

/// Cohort error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Task not found in the store
    #[error("task not found: {id}")]
    TaskNotFound { id: String },

    /// Caller is not the owner/planner the operation requires
    #[error("owner mismatch on task {id}: expected {expected:?}, got {actual}")]
    OwnerMismatch {
        id: String,
        expected: Option<String>,
        actual: String,
    },

    /// Illegal status / plan-status transition
    #[error("invalid transition on task {id}: {detail}")]
    InvalidTransition { id: String, detail: String },

    /// Phase send-back past the task's revision cap
    #[error("revision limit reached on task {id}: {count}/{max}")]
    RevisionLimit { id: String, count: u32, max: u32 },

    /// Could not acquire the state lock within the timeout. Fatal to the run.
    #[error("timed out acquiring state lock at {path} after {waited_ms}ms")]
    LockTimeout {
        path: std::path::PathBuf,
        waited_ms: u64,
    },

    /// Malformed provider payload
    #[error("decision validation failed: {0}")]
    DecisionValidation(String),

    /// Teammate adapter failure (subprocess failure, timeout)
    #[error("adapter error for {subject}: {detail}")]
    Adapter { subject: String, detail: String },

    /// Execution-result contract violation
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Build an InvalidTransition from the usual status pair.
    pub fn bad_transition(id: &str, from: TaskStatus, to: TaskStatus) -> Self {
        Error::InvalidTransition {
            id: id.to_string(),
            detail: format!("{:?} -> {:?}", from, to),
        }
    }

    /// Build an InvalidTransition for a plan-status violation.
    pub fn bad_plan_state(id: &str, plan: PlanStatus, wanted: &str) -> Self {
        Error::InvalidTransition {
            id: id.to_string(),
            detail: format!("plan is {:?}, operation requires {}", plan, wanted),
        }
    }
}

/// Result type alias for cohort.
pub type Result<T> = std::result::Result<T, Error>;
