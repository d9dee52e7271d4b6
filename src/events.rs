//! Orchestrator events and their severity triage.
//!
//! Each round produces a batch of events; the persona pipeline maps them
//! to severity-tagged comments. Event kinds without a severity mapping are
//! carried for observability but ignored by the pipeline.

use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Kinds of events a round can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// First round of the run started.
    Kickoff,
    /// A task completed.
    TaskCompleted,
    /// A task moved into needs_approval.
    NeedsApproval,
    /// An idle-round threshold was crossed.
    NoProgress,
    /// A claim-ready task is waiting on a running task's target paths.
    Collision,
    /// A task was marked blocked.
    Blocked,
    /// A reviewer subject signalled a rule violation.
    ReviewerViolation,
    /// Re-check requested by a warn-severity comment last round.
    WarnRecheck,
    /// A task advanced to its next phase.
    PhaseAdvanced,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Kickoff => "kickoff",
            EventKind::TaskCompleted => "task_completed",
            EventKind::NeedsApproval => "needs_approval",
            EventKind::NoProgress => "no_progress",
            EventKind::Collision => "collision",
            EventKind::Blocked => "blocked",
            EventKind::ReviewerViolation => "reviewer_violation",
            EventKind::WarnRecheck => "warn_recheck",
            EventKind::PhaseAdvanced => "phase_advanced",
        }
    }
}

/// Severity of a persona comment, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Blocker,
    Critical,
    Warn,
    Info,
}

impl Severity {
    /// Fixed event-kind → severity table. None means the pipeline ignores
    /// the event kind.
    pub fn for_event(kind: EventKind) -> Option<Severity> {
        match kind {
            EventKind::Kickoff | EventKind::TaskCompleted => Some(Severity::Info),
            EventKind::NeedsApproval | EventKind::NoProgress | EventKind::Collision => {
                Some(Severity::Warn)
            }
            EventKind::Blocked => Some(Severity::Critical),
            EventKind::ReviewerViolation => Some(Severity::Blocker),
            EventKind::WarnRecheck | EventKind::PhaseAdvanced => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Blocker => "blocker",
            Severity::Critical => "critical",
            Severity::Warn => "warn",
            Severity::Info => "info",
        }
    }
}

/// One orchestrator event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub kind: EventKind,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Acting subject, when one is involved.
    #[serde(default)]
    pub teammate: Option<String>,
    pub detail: String,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: None,
            teammate: None,
            detail: detail.into(),
        }
    }

    pub fn for_task(kind: EventKind, task_id: &TaskId, detail: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: Some(task_id.clone()),
            teammate: None,
            detail: detail.into(),
        }
    }

    pub fn by(mut self, teammate: impl Into<String>) -> Self {
        self.teammate = Some(teammate.into());
        self
    }
}
