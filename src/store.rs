//! Lock-guarded persistent task and mailbox store.
//!
//! One JSON document per run directory is the single source of truth for
//! tasks and inter-subject mail. Multiple processes may share a directory:
//! every mutation runs under a sentinel-file lock and lands via an atomic
//! rename, so readers always observe a fully committed document without
//! taking the lock themselves.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{PlanAction, PlanStatus, ProgressEntry, Task, TaskId, TaskSpec, TaskStatus};

/// Current on-disk document version.
pub const STATE_VERSION: u32 = 1;

const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "state.lock";

/// One mailbox message. Append-only, `seq` strictly increasing per store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub seq: u64,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub created_at: chrono::DateTime<Utc>,
}

/// Document-level bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreMeta {
    /// Mailbox sequence counter.
    pub sequence: u64,
    /// Bumped on every committed mutation; the orchestrator compares this
    /// across a round to detect store-level progress.
    pub progress_counter: u64,
    /// Epoch millis of the last committed mutation.
    pub last_progress_at: i64,
}

/// The persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    /// BTreeMap so every scan is in sorted task-id order. Claim
    /// determinism depends on this.
    pub tasks: BTreeMap<TaskId, Task>,
    pub messages: Vec<MailMessage>,
    pub meta: StoreMeta,
}

impl Default for StateDocument {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tasks: BTreeMap::new(),
            messages: Vec::new(),
            meta: StoreMeta::default(),
        }
    }
}

/// Snapshot of the store's progress counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMarker {
    pub counter: u64,
    pub last_progress_at: i64,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub needs_approval: usize,
    pub completed: usize,
}

/// A (waiting, running) pair of tasks sharing a target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub waiting: TaskId,
    pub running: TaskId,
}

/// Lock-guarded store bound to one run directory.
pub struct TaskStore {
    dir: PathBuf,
    state_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_stale_after: Duration,
    lock_poll: Duration,
    progress_log_limit: usize,
}

impl TaskStore {
    /// Open (or create) a store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            state_path: dir.join(STATE_FILE),
            lock_path: dir.join(LOCK_FILE),
            dir,
            lock_timeout: Duration::from_secs(10),
            lock_stale_after: Duration::from_secs(30),
            lock_poll: Duration::from_millis(10),
            progress_log_limit: 50,
        })
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_stale_after(mut self, stale: Duration) -> Self {
        self.lock_stale_after = stale;
        self
    }

    pub fn with_progress_log_limit(mut self, limit: usize) -> Self {
        self.progress_log_limit = limit;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ------------------------------------------------------------------
    // Locking and document IO
    // ------------------------------------------------------------------

    fn acquire_lock(&self) -> Result<LockGuard<'_>> {
        let start = Instant::now();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339());
                    return Ok(LockGuard { path: &self.lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale() {
                        log::warn!(
                            "removing stale lock {} (older than {:?})",
                            self.lock_path.display(),
                            self.lock_stale_after
                        );
                        match fs::remove_file(&self.lock_path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    if start.elapsed() >= self.lock_timeout {
                        return Err(Error::LockTimeout {
                            path: self.lock_path.clone(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(self.lock_poll);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn lock_is_stale(&self) -> bool {
        fs::metadata(&self.lock_path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age >= self.lock_stale_after)
    }

    fn read_doc(&self) -> Result<StateDocument> {
        if !self.state_path.exists() {
            return Ok(StateDocument::default());
        }
        let raw = fs::read_to_string(&self.state_path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_doc(&self, doc: &StateDocument) -> Result<()> {
        let tmp = self.state_path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(doc)?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.state_path)?;
        Ok(())
    }

    /// Run a mutation under the lock. The closure returns (value, changed);
    /// the document is only written back (and the progress counter bumped)
    /// when `changed` is true.
    fn mutate<T>(&self, f: impl FnOnce(&mut StateDocument) -> Result<(T, bool)>) -> Result<T> {
        let _guard = self.acquire_lock()?;
        let mut doc = self.read_doc()?;
        let (value, changed) = f(&mut doc)?;
        if changed {
            doc.meta.progress_counter += 1;
            doc.meta.last_progress_at = Utc::now().timestamp_millis();
            self.write_doc(&doc)?;
        }
        Ok(value)
    }

    fn push_log(&self, task: &mut Task, source: &str, text: impl Into<String>) {
        task.progress_log.push(ProgressEntry {
            at: Utc::now(),
            source: source.to_string(),
            text: text.into(),
        });
        let limit = self.progress_log_limit;
        if task.progress_log.len() > limit {
            let excess = task.progress_log.len() - limit;
            task.progress_log.drain(..excess);
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Load tasks into the store. `merge` keeps existing tasks (and their
    /// runtime state) and only adds unknown ids; otherwise the task set is
    /// replaced wholesale.
    pub fn bootstrap(&self, specs: Vec<TaskSpec>, merge: bool) -> Result<usize> {
        self.mutate(|doc| {
            if !merge {
                doc.tasks.clear();
            }
            let mut added = 0;
            for spec in specs {
                let task = spec.into_task();
                if merge && doc.tasks.contains_key(&task.id) {
                    continue;
                }
                doc.tasks.insert(task.id.clone(), task);
                added += 1;
            }
            Ok((added, true))
        })
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    pub fn get_task(&self, id: &TaskId) -> Result<Task> {
        self.read_doc()?
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound { id: id.to_string() })
    }

    /// All tasks in sorted id order.
    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.read_doc()?.tasks.into_values().collect())
    }

    pub fn status_summary(&self) -> Result<StatusSummary> {
        let doc = self.read_doc()?;
        let mut summary = StatusSummary::default();
        for task in doc.tasks.values() {
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::NeedsApproval => summary.needs_approval += 1,
                TaskStatus::Completed => summary.completed += 1,
            }
        }
        Ok(summary)
    }

    pub fn all_tasks_completed(&self) -> Result<bool> {
        let doc = self.read_doc()?;
        Ok(!doc.tasks.is_empty() && doc.tasks.values().all(|t| t.status == TaskStatus::Completed))
    }

    pub fn progress_marker(&self) -> Result<ProgressMarker> {
        let doc = self.read_doc()?;
        Ok(ProgressMarker {
            counter: doc.meta.progress_counter,
            last_progress_at: doc.meta.last_progress_at,
        })
    }

    /// All (waiting, running) pairs where a claim-ready pending task shares
    /// a target path with a running task. Observability only; the actual
    /// gating happens inside `claim_execution_task`.
    pub fn detect_collisions(&self) -> Result<Vec<Collision>> {
        let doc = self.read_doc()?;
        let running: Vec<&Task> = doc
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .collect();

        let mut collisions = Vec::new();
        for task in doc.tasks.values() {
            if task.status != TaskStatus::Pending
                || task.owner.is_some()
                || !task.plan_cleared()
                || !deps_completed(&doc, task)
            {
                continue;
            }
            for other in &running {
                if task.paths_overlap(other) {
                    collisions.push(Collision {
                        waiting: task.id.clone(),
                        running: other.id.clone(),
                    });
                }
            }
        }
        Ok(collisions)
    }

    // ------------------------------------------------------------------
    // Plan lifecycle
    // ------------------------------------------------------------------

    /// Claim the first plannable task for `subject`. Returns None when
    /// nothing is claimable; that is not an error.
    pub fn claim_plan_task(&self, subject: &str) -> Result<Option<Task>> {
        self.mutate(|doc| {
            let candidate = doc
                .tasks
                .values()
                .find(|t| {
                    t.status == TaskStatus::Pending
                        && t.requires_plan
                        && t.plan_status.is_plannable()
                        && t.planner.is_none()
                        && deps_completed(doc, t)
                })
                .map(|t| t.id.clone());

            let Some(id) = candidate else {
                return Ok((None, false));
            };
            let task = doc.tasks.get_mut(&id).expect("candidate exists");
            task.planner = Some(subject.to_string());
            task.plan_status = PlanStatus::Drafting;
            task.updated_at = Utc::now();
            self.push_log(task, subject, "claimed for planning");
            Ok((Some(task.clone()), true))
        })
    }

    /// Submit a drafted plan. Requires the caller to be the planner.
    pub fn submit_plan(&self, task_id: &TaskId, subject: &str, text: &str) -> Result<Task> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            if task.planner.as_deref() != Some(subject) {
                return Err(Error::OwnerMismatch {
                    id: task_id.to_string(),
                    expected: task.planner.clone(),
                    actual: subject.to_string(),
                });
            }
            if task.plan_status != PlanStatus::Drafting {
                return Err(Error::bad_plan_state(task_id.as_ref(), task.plan_status, "drafting"));
            }
            task.plan_text = Some(text.to_string());
            task.status = TaskStatus::NeedsApproval;
            task.plan_status = PlanStatus::Submitted;
            task.updated_at = Utc::now();
            self.push_log(task, subject, "plan submitted");
            Ok((task.clone(), true))
        })
    }

    /// Review a submitted plan.
    pub fn review_plan(
        &self,
        task_id: &TaskId,
        reviewer: &str,
        action: PlanAction,
        feedback: Option<&str>,
    ) -> Result<Task> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            if task.status != TaskStatus::NeedsApproval || task.plan_status != PlanStatus::Submitted {
                return Err(Error::bad_plan_state(
                    task_id.as_ref(),
                    task.plan_status,
                    "submitted plan awaiting approval",
                ));
            }
            task.plan_feedback = feedback.map(|f| f.to_string());
            match action {
                PlanAction::Approve => {
                    task.plan_status = PlanStatus::Approved;
                    task.status = TaskStatus::Pending;
                    task.owner = None;
                }
                PlanAction::Reject => {
                    task.plan_status = PlanStatus::Rejected;
                    task.planner = None;
                    task.status = TaskStatus::Pending;
                }
                PlanAction::Revise => {
                    task.plan_status = PlanStatus::RevisionRequested;
                    task.planner = None;
                    task.status = TaskStatus::Pending;
                }
            }
            task.updated_at = Utc::now();
            self.push_log(task, reviewer, format!("plan review: {:?}", action));
            Ok((task.clone(), true))
        })
    }

    // ------------------------------------------------------------------
    // Execution lifecycle
    // ------------------------------------------------------------------

    /// Claim the first execution-ready task for `subject`. A task is ready
    /// when pending, unowned, dependency-complete, plan-cleared, inside the
    /// allow-list (when given), and free of target-path collisions with any
    /// other running task.
    pub fn claim_execution_task(
        &self,
        subject: &str,
        allowed: Option<&[TaskId]>,
    ) -> Result<Option<Task>> {
        self.mutate(|doc| {
            let running: Vec<(TaskId, Vec<String>)> = doc
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::InProgress)
                .map(|t| (t.id.clone(), t.target_paths.clone()))
                .collect();

            let candidate = doc
                .tasks
                .values()
                .find(|t| {
                    t.status == TaskStatus::Pending
                        && t.owner.is_none()
                        && t.plan_cleared()
                        && deps_completed(doc, t)
                        && allowed.is_none_or(|ids| ids.contains(&t.id))
                        && !running.iter().any(|(other_id, paths)| {
                            *other_id != t.id
                                && t.target_paths.iter().any(|p| paths.contains(p))
                        })
                })
                .map(|t| t.id.clone());

            let Some(id) = candidate else {
                return Ok((None, false));
            };
            let task = doc.tasks.get_mut(&id).expect("candidate exists");
            task.owner = Some(subject.to_string());
            task.status = TaskStatus::InProgress;
            task.block_reason = None;
            task.updated_at = Utc::now();
            self.push_log(task, subject, "claimed for execution");
            Ok((Some(task.clone()), true))
        })
    }

    /// Hand a task off to its next phase: back to pending, unowned, with
    /// the new phase index recorded.
    pub fn handoff_task_phase(
        &self,
        task_id: &TaskId,
        subject: &str,
        next_phase_index: usize,
    ) -> Result<Task> {
        self.mutate(|doc| {
            let task = require_owned_in_progress(doc, task_id, subject)?;
            task.status = TaskStatus::Pending;
            task.owner = None;
            task.current_phase_index = Some(next_phase_index);
            task.updated_at = Utc::now();
            self.push_log(task, subject, format!("handed off to phase {}", next_phase_index));
            Ok((task.clone(), true))
        })
    }

    /// Send a task back to an earlier phase, optionally counting it as a
    /// revision cycle. Refuses once the revision cap is reached.
    pub fn send_back_task_to_phase(
        &self,
        task_id: &TaskId,
        subject: &str,
        phase_index: usize,
        increment_revision: bool,
    ) -> Result<Task> {
        self.mutate(|doc| {
            let task = require_owned_in_progress(doc, task_id, subject)?;
            if increment_revision {
                if task.revision_count >= task.max_revision_cycles {
                    return Err(Error::RevisionLimit {
                        id: task_id.to_string(),
                        count: task.revision_count,
                        max: task.max_revision_cycles,
                    });
                }
                task.revision_count += 1;
            }
            task.status = TaskStatus::Pending;
            task.owner = None;
            task.current_phase_index = Some(phase_index);
            task.updated_at = Utc::now();
            self.push_log(
                task,
                subject,
                format!(
                    "sent back to phase {} (revision {}/{})",
                    phase_index, task.revision_count, task.max_revision_cycles
                ),
            );
            Ok((task.clone(), true))
        })
    }

    pub fn mark_task_blocked(&self, task_id: &TaskId, subject: &str, reason: &str) -> Result<Task> {
        self.mutate(|doc| {
            let task = require_owned_in_progress(doc, task_id, subject)?;
            task.status = TaskStatus::Blocked;
            task.block_reason = Some(reason.to_string());
            task.updated_at = Utc::now();
            self.push_log(task, subject, format!("blocked: {}", reason));
            Ok((task.clone(), true))
        })
    }

    pub fn complete_task(&self, task_id: &TaskId, subject: &str, summary: &str) -> Result<Task> {
        self.mutate(|doc| {
            let task = require_owned_in_progress(doc, task_id, subject)?;
            let now = Utc::now();
            task.status = TaskStatus::Completed;
            task.result_summary = Some(summary.to_string());
            task.completed_at = Some(now);
            task.updated_at = now;
            self.push_log(task, subject, "completed");
            Ok((task.clone(), true))
        })
    }

    /// Resume-safety sweep: any task left in_progress (say, after a crash)
    /// goes back to pending with an audit line. Returns the requeued ids.
    pub fn requeue_in_progress_tasks(&self) -> Result<Vec<TaskId>> {
        self.mutate(|doc| {
            let mut requeued = Vec::new();
            let ids: Vec<TaskId> = doc
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::InProgress)
                .map(|t| t.id.clone())
                .collect();
            for id in ids {
                let task = doc.tasks.get_mut(&id).expect("id from scan");
                let prior = task.owner.take();
                task.status = TaskStatus::Pending;
                task.updated_at = Utc::now();
                self.push_log(
                    task,
                    "store",
                    format!(
                        "requeued after interrupted execution (was owned by {})",
                        prior.as_deref().unwrap_or("nobody")
                    ),
                );
                requeued.push(id);
            }
            let changed = !requeued.is_empty();
            Ok((requeued, changed))
        })
    }

    /// Persona/critical escalation path: move a task into needs_approval.
    /// Idempotent for tasks already awaiting approval; completed tasks are
    /// left alone. Returns whether the task actually moved.
    pub fn escalate_task(&self, task_id: &TaskId, source: &str, reason: &str) -> Result<bool> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            match task.status {
                TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Blocked => {
                    task.status = TaskStatus::NeedsApproval;
                    task.owner = None;
                    task.updated_at = Utc::now();
                    self.push_log(task, source, format!("escalated: {}", reason));
                    Ok((true, true))
                }
                TaskStatus::NeedsApproval | TaskStatus::Completed => Ok((false, false)),
            }
        })
    }

    /// Provider unblocking path: a blocked task goes back to pending.
    pub fn unblock_task(&self, task_id: &TaskId, source: &str) -> Result<Task> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            if task.status != TaskStatus::Blocked {
                return Err(Error::bad_transition(task_id.as_ref(), task.status, TaskStatus::Pending));
            }
            task.status = TaskStatus::Pending;
            task.owner = None;
            task.block_reason = None;
            task.updated_at = Utc::now();
            self.push_log(task, source, "unblocked");
            Ok((task.clone(), true))
        })
    }

    /// Release a single non-plan approval back to pending. Refuses while a
    /// submitted plan is actually waiting for review.
    pub fn release_approval(&self, task_id: &TaskId, source: &str) -> Result<Task> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            if task.status != TaskStatus::NeedsApproval {
                return Err(Error::bad_transition(task_id.as_ref(), task.status, TaskStatus::Pending));
            }
            if task.plan_status == PlanStatus::Submitted {
                return Err(Error::bad_plan_state(
                    task_id.as_ref(),
                    task.plan_status,
                    "no submitted plan",
                ));
            }
            task.status = TaskStatus::Pending;
            task.owner = None;
            task.updated_at = Utc::now();
            self.push_log(task, source, "approval released");
            Ok((task.clone(), true))
        })
    }

    /// Give up a plan claim (adapter failure mid-draft): the task becomes
    /// plannable again by anyone.
    pub fn abandon_plan(&self, task_id: &TaskId, subject: &str, reason: &str) -> Result<Task> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            if task.planner.as_deref() != Some(subject) {
                return Err(Error::OwnerMismatch {
                    id: task_id.to_string(),
                    expected: task.planner.clone(),
                    actual: subject.to_string(),
                });
            }
            if task.plan_status != PlanStatus::Drafting {
                return Err(Error::bad_plan_state(task_id.as_ref(), task.plan_status, "drafting"));
            }
            task.planner = None;
            task.plan_status = PlanStatus::Pending;
            task.updated_at = Utc::now();
            self.push_log(task, subject, format!("plan abandoned: {}", reason));
            Ok((task.clone(), true))
        })
    }

    /// Release tasks stuck in needs_approval with no submitted plan (used
    /// by the auto-approve fallback). Returns the released ids.
    pub fn release_stuck_approvals(&self) -> Result<Vec<TaskId>> {
        self.mutate(|doc| {
            let mut released = Vec::new();
            let ids: Vec<TaskId> = doc
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::NeedsApproval && t.plan_status != PlanStatus::Submitted
                })
                .map(|t| t.id.clone())
                .collect();
            for id in ids {
                let task = doc.tasks.get_mut(&id).expect("id from scan");
                task.status = TaskStatus::Pending;
                task.owner = None;
                task.updated_at = Utc::now();
                self.push_log(task, "store", "approval released (no plan pending)");
                released.push(id);
            }
            let changed = !released.is_empty();
            Ok((released, changed))
        })
    }

    pub fn append_task_progress_log(
        &self,
        task_id: &TaskId,
        source: &str,
        text: &str,
        max_entries: usize,
    ) -> Result<()> {
        self.mutate(|doc| {
            let task = doc
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
            task.progress_log.push(ProgressEntry {
                at: Utc::now(),
                source: source.to_string(),
                text: text.to_string(),
            });
            if task.progress_log.len() > max_entries {
                let excess = task.progress_log.len() - max_entries;
                task.progress_log.drain(..excess);
            }
            task.updated_at = Utc::now();
            Ok(((), true))
        })
    }

    // ------------------------------------------------------------------
    // Mailbox
    // ------------------------------------------------------------------

    pub fn send_message(
        &self,
        sender: &str,
        receiver: &str,
        content: &str,
        task_id: Option<&TaskId>,
    ) -> Result<MailMessage> {
        self.mutate(|doc| {
            doc.meta.sequence += 1;
            let message = MailMessage {
                seq: doc.meta.sequence,
                sender: sender.to_string(),
                receiver: receiver.to_string(),
                content: content.to_string(),
                task_id: task_id.cloned(),
                created_at: Utc::now(),
            };
            doc.messages.push(message.clone());
            Ok((message, true))
        })
    }

    /// Messages for `receiver` with seq greater than `since_seq`.
    pub fn get_inbox(&self, receiver: &str, since_seq: u64) -> Result<Vec<MailMessage>> {
        let doc = self.read_doc()?;
        Ok(doc
            .messages
            .into_iter()
            .filter(|m| m.receiver == receiver && m.seq > since_seq)
            .collect())
    }

    /// The most recent `limit` messages regardless of receiver (snapshot
    /// building).
    pub fn recent_messages(&self, limit: usize) -> Result<Vec<MailMessage>> {
        let doc = self.read_doc()?;
        let skip = doc.messages.len().saturating_sub(limit);
        Ok(doc.messages.into_iter().skip(skip).collect())
    }
}

fn deps_completed(doc: &StateDocument, task: &Task) -> bool {
    task.depends_on.iter().all(|dep| {
        doc.tasks
            .get(dep)
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
}

fn require_owned_in_progress<'a>(
    doc: &'a mut StateDocument,
    task_id: &TaskId,
    subject: &str,
) -> Result<&'a mut Task> {
    let task = doc
        .tasks
        .get_mut(task_id)
        .ok_or_else(|| Error::TaskNotFound { id: task_id.to_string() })?;
    if task.owner.as_deref() != Some(subject) {
        return Err(Error::OwnerMismatch {
            id: task_id.to_string(),
            expected: task.owner.clone(),
            actual: subject.to_string(),
        });
    }
    if task.status != TaskStatus::InProgress {
        return Err(Error::bad_transition(task_id.as_ref(), task.status, TaskStatus::InProgress));
    }
    Ok(task)
}

/// Removes the sentinel on drop so a panicking mutation does not wedge the
/// store for other processes (the staleness sweep still covers hard crashes).
struct LockGuard<'a> {
    path: &'a Path,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove lock {}: {}", self.path.display(), e);
            }
        }
    }
}
