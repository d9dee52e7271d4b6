//! Task types for cohort.
//!
//! A Task is the unit of work teammates claim, plan, execute, and hand off
//! between phases. All mutation goes through the store so that only legal
//! status / plan-status pairs can exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::personas::TaskPersonaPolicy;

/// Unique identifier for a task. Ids come from the task file and are
/// stable for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed and executing
    InProgress,
    /// Stopped with a blocking reason
    Blocked,
    /// Waiting on plan review or an escalation decision
    NeedsApproval,
    /// Done
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::NeedsApproval => "needs_approval",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "blocked" => Some(TaskStatus::Blocked),
            "needs_approval" => Some(TaskStatus::NeedsApproval),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

/// Plan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Task never needed a plan
    NotRequired,
    /// Plan needed, nobody claimed it yet
    Pending,
    /// A planner claimed it and is writing
    Drafting,
    /// Submitted, waiting for review
    Submitted,
    /// Approved, task may be claimed for execution
    Approved,
    /// Rejected outright, needs a fresh claim
    Rejected,
    /// Sent back for revision
    RevisionRequested,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::NotRequired => "not_required",
            PlanStatus::Pending => "pending",
            PlanStatus::Drafting => "drafting",
            PlanStatus::Submitted => "submitted",
            PlanStatus::Approved => "approved",
            PlanStatus::Rejected => "rejected",
            PlanStatus::RevisionRequested => "revision_requested",
        }
    }

    /// Plan states that make a task claimable by a planner.
    pub fn is_plannable(&self) -> bool {
        matches!(
            self,
            PlanStatus::Pending | PlanStatus::Rejected | PlanStatus::RevisionRequested
        )
    }
}

/// Review verdict on a submitted plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Approve,
    Reject,
    Revise,
}

impl PlanAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(PlanAction::Approve),
            "reject" => Some(PlanAction::Reject),
            "revise" => Some(PlanAction::Revise),
            _ => None,
        }
    }
}

/// One line of a task's bounded audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub at: DateTime<Utc>,
    /// Who wrote the line (subject id, "store", "provider", ...)
    pub source: String,
    pub text: String,
}

/// A cohort task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Resource paths this task writes. Two tasks sharing a path never run
    /// concurrently.
    #[serde(default)]
    pub target_paths: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Execution claimant
    #[serde(default)]
    pub owner: Option<String>,
    /// Plan claimant
    #[serde(default)]
    pub planner: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub requires_plan: bool,
    pub plan_status: PlanStatus,
    #[serde(default)]
    pub plan_text: Option<String>,
    #[serde(default)]
    pub plan_feedback: Option<String>,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub progress_log: Vec<ProgressEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Per-task override of the global persona defaults.
    #[serde(default)]
    pub persona_policy: Option<TaskPersonaPolicy>,
    /// Index into the effective phase order. None means the first phase.
    #[serde(default)]
    pub current_phase_index: Option<usize>,
    #[serde(default)]
    pub revision_count: u32,
    #[serde(default = "default_max_revision_cycles")]
    pub max_revision_cycles: u32,
}

pub(crate) fn default_max_revision_cycles() -> u32 {
    3
}

impl Task {
    /// Create a fresh task. Establishes the invariant that `plan_status`
    /// is `NotRequired` exactly when `requires_plan` is false.
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>, requires_plan: bool) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            target_paths: Vec::new(),
            depends_on: Vec::new(),
            owner: None,
            planner: None,
            status: TaskStatus::Pending,
            requires_plan,
            plan_status: if requires_plan {
                PlanStatus::Pending
            } else {
                PlanStatus::NotRequired
            },
            plan_text: None,
            plan_feedback: None,
            result_summary: None,
            block_reason: None,
            progress_log: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            persona_policy: None,
            current_phase_index: None,
            revision_count: 0,
            max_revision_cycles: default_max_revision_cycles(),
        }
    }

    /// True when every plan gate has cleared and the task could run, given
    /// its dependencies are completed.
    pub fn plan_cleared(&self) -> bool {
        !self.requires_plan || self.plan_status == PlanStatus::Approved
    }

    /// Whether this task shares any target path with another.
    pub fn paths_overlap(&self, other: &Task) -> bool {
        self.target_paths
            .iter()
            .any(|p| other.target_paths.iter().any(|q| p == q))
    }
}

/// Bootstrap input shape for a task, as authored in the task file. The
/// store turns these into Tasks at bootstrap, normalizing paths and
/// dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_paths: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub requires_plan: bool,
    #[serde(default)]
    pub persona_policy: Option<TaskPersonaPolicy>,
    #[serde(default = "default_max_revision_cycles")]
    pub max_revision_cycles: u32,
}

impl TaskSpec {
    /// Minimal spec for tests and programmatic bootstrap.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            target_paths: Vec::new(),
            depends_on: Vec::new(),
            requires_plan: false,
            persona_policy: None,
            max_revision_cycles: default_max_revision_cycles(),
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_paths(mut self, paths: &[&str]) -> Self {
        self.target_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_plan(mut self) -> Self {
        self.requires_plan = true;
        self
    }

    pub fn with_policy(mut self, policy: TaskPersonaPolicy) -> Self {
        self.persona_policy = Some(policy);
        self
    }

    /// Materialize into a Task, deduplicating paths and dependencies while
    /// preserving author order.
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.id.as_str(), self.title, self.requires_plan);
        task.description = self.description;
        task.target_paths = dedup_preserving(self.target_paths);
        task.depends_on = dedup_preserving(self.depends_on)
            .into_iter()
            .map(TaskId)
            .collect();
        task.persona_policy = self.persona_policy;
        task.max_revision_cycles = self.max_revision_cycles;
        task
    }
}

fn dedup_preserving(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_plan_invariant() {
        let planned = Task::new("t1", "needs a plan", true);
        assert_eq!(planned.plan_status, PlanStatus::Pending);
        assert!(!planned.plan_cleared());

        let unplanned = Task::new("t2", "no plan", false);
        assert_eq!(unplanned.plan_status, PlanStatus::NotRequired);
        assert!(unplanned.plan_cleared());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::NeedsApproval,
            TaskStatus::Completed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("running"), None);
    }

    #[test]
    fn test_plannable_states() {
        assert!(PlanStatus::Pending.is_plannable());
        assert!(PlanStatus::Rejected.is_plannable());
        assert!(PlanStatus::RevisionRequested.is_plannable());
        assert!(!PlanStatus::Drafting.is_plannable());
        assert!(!PlanStatus::Submitted.is_plannable());
        assert!(!PlanStatus::Approved.is_plannable());
        assert!(!PlanStatus::NotRequired.is_plannable());
    }

    #[test]
    fn test_paths_overlap() {
        let mut a = Task::new("a", "a", false);
        let mut b = Task::new("b", "b", false);
        a.target_paths = vec!["src/lib.rs".to_string(), "src/main.rs".to_string()];
        b.target_paths = vec!["src/main.rs".to_string()];
        assert!(a.paths_overlap(&b));

        b.target_paths = vec!["README.md".to_string()];
        assert!(!a.paths_overlap(&b));
    }

    #[test]
    fn test_spec_dedup() {
        let spec = TaskSpec::new("t1", "title")
            .with_paths(&["a.rs", "b.rs", "a.rs"])
            .with_deps(&["t0", "t0"]);
        let task = spec.into_task();
        assert_eq!(task.target_paths, vec!["a.rs", "b.rs"]);
        assert_eq!(task.depends_on, vec![TaskId::from("t0")]);
    }
}
