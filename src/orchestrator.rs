//! Round-based orchestrator.
//!
//! Drives execution subjects over the shared store until a stop condition
//! fires: claims plan and execution work for each subject in order, routes
//! tasks between phases, feeds round events through the persona pipeline,
//! consults the decision provider, and accounts for idleness. Every run
//! ends with a structured result carrying a named stop reason.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::adapter::{DecisionProvider, TeammateAdapter};
use crate::decision::{validate_decision, OrchestratorDecision};
use crate::error::{Error, Result};
use crate::events::{EventKind, OrchestratorEvent, Severity};
use crate::personas::{
    evaluate_events, ActivePersonaMap, PersonaComment, PersonaDefaults, PersonaDefinition,
    PhasePolicy,
};
use crate::protocol::{classify_reviewer_stop, parse_execution_report, ReportStatus};
use crate::snapshot::{MailView, PersonaView, Snapshot, TaskView};
use crate::store::TaskStore;
use crate::task::{PlanAction, PlanStatus, Task, TaskId, TaskStatus};

/// Plain-value configuration surface for one run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lead_id: String,
    /// Fallback subjects when no persona carries an execution binding.
    pub teammate_ids: Vec<String>,
    pub personas: Vec<PersonaDefinition>,
    pub persona_defaults: PersonaDefaults,
    pub max_rounds: u64,
    /// 0 disables the idle-round stop.
    pub max_idle_rounds: u64,
    /// 0 disables the idle-seconds stop.
    pub max_idle_seconds: u64,
    /// Emit a NoProgress event every this many consecutive idle rounds.
    pub no_progress_event_interval: u64,
    pub progress_log_limit: usize,
    pub max_comments_per_event: usize,
    /// Halt before the provider whenever a plan awaits human review.
    pub human_approval: bool,
    /// Approve the oldest submitted plan when the provider declines to.
    pub auto_approve_fallback: bool,
    /// Adapter call bound for subjects without a persona-level timeout.
    pub adapter_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lead_id: "lead".to_string(),
            teammate_ids: Vec::new(),
            personas: Vec::new(),
            persona_defaults: PersonaDefaults::default(),
            max_rounds: 40,
            max_idle_rounds: 6,
            max_idle_seconds: 900,
            no_progress_event_interval: 3,
            progress_log_limit: 50,
            max_comments_per_event: 2,
            human_approval: false,
            auto_approve_fallback: true,
            adapter_timeout_secs: 600,
        }
    }
}

/// Persona-layer counters reported with the run result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersonaMetrics {
    pub severity_counts: BTreeMap<String, u64>,
    pub persona_blocker_triggered: bool,
    pub warn_recheck_queue_remaining: usize,
}

/// Structured outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stop_reason: String,
    pub elapsed_seconds: f64,
    pub summary: crate::store::StatusSummary,
    pub tasks_total: usize,
    pub provider_calls: u64,
    pub provider: String,
    pub human_approval: bool,
    pub persona_metrics: PersonaMetrics,
}

/// The round-based scheduler.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: TaskStore,
    adapter: Arc<dyn TeammateAdapter>,
    provider: Arc<dyn DecisionProvider>,
    run_id: String,
    subjects: Vec<String>,
    persona_mode: bool,
    warn_recheck_queue: Vec<OrchestratorEvent>,
    known_collisions: HashSet<(TaskId, TaskId)>,
    recent_decisions: VecDeque<String>,
    provider_calls: u64,
    metrics: PersonaMetrics,
}

impl Orchestrator {
    /// Resolve execution subjects and validate the persona/policy wiring.
    /// Persona mode wins whenever any enabled persona carries an enabled
    /// execution binding; otherwise the configured teammate ids run.
    pub fn new(
        mut config: OrchestratorConfig,
        store: TaskStore,
        adapter: Arc<dyn TeammateAdapter>,
        provider: Arc<dyn DecisionProvider>,
    ) -> Result<Self> {
        let mut seen = HashSet::new();
        for persona in &config.personas {
            if !seen.insert(persona.id.clone()) {
                return Err(Error::Config(format!("duplicate persona id '{}'", persona.id)));
            }
        }
        config.persona_defaults.normalize(&config.personas)?;

        let persona_subjects: Vec<String> = config
            .personas
            .iter()
            .filter(|p| p.is_execution_subject())
            .map(|p| p.id.clone())
            .collect();

        let (subjects, persona_mode) = if persona_subjects.is_empty() {
            (config.teammate_ids.clone(), false)
        } else {
            (persona_subjects, true)
        };
        if subjects.is_empty() {
            return Err(Error::Config(
                "no execution subjects: configure teammates or executable personas".to_string(),
            ));
        }

        Ok(Self {
            config,
            store,
            adapter,
            provider,
            run_id: format!("run-{}", Uuid::new_v4()),
            subjects,
            persona_mode,
            warn_recheck_queue: Vec::new(),
            known_collisions: HashSet::new(),
            recent_decisions: VecDeque::new(),
            provider_calls: 0,
            metrics: PersonaMetrics::default(),
        })
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn persona_mode(&self) -> bool {
        self.persona_mode
    }

    /// Drive rounds until a stop condition fires.
    pub async fn run(&mut self) -> Result<RunResult> {
        let started = Instant::now();
        let mut last_progress = Instant::now();
        let mut idle_rounds: u64 = 0;
        let mut round: u64 = 0;
        let mut stop_reason: Option<String> = None;

        let requeued = self.store.requeue_in_progress_tasks()?;
        if !requeued.is_empty() {
            log::info!("requeued {} interrupted task(s) on resume", requeued.len());
        }

        'rounds: while round < self.config.max_rounds {
            round += 1;
            let mut events: Vec<OrchestratorEvent> = std::mem::take(&mut self.warn_recheck_queue);
            if round == 1 {
                events.push(OrchestratorEvent::new(
                    EventKind::Kickoff,
                    format!("{} started with {} subject(s)", self.run_id, self.subjects.len()),
                ));
            }

            let marker_before = self.store.progress_marker()?;
            let mut subject_changed = false;

            for subject in self.subjects.clone() {
                match self.teammate_process_plan(&subject, &mut events).await {
                    Ok(true) => {
                        subject_changed = true;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) if is_fatal(&e) => {
                        stop_reason = Some("lock_timeout".to_string());
                        log::error!("fatal store error during {}'s plan turn: {}", subject, e);
                        break 'rounds;
                    }
                    Err(e) => {
                        log::warn!("plan turn failed for {}: {}", subject, e);
                        continue;
                    }
                }
                match self.teammate_process_execution(&subject, &mut events).await {
                    Ok(changed) => subject_changed |= changed,
                    Err(e) if is_fatal(&e) => {
                        stop_reason = Some("lock_timeout".to_string());
                        log::error!("fatal store error during {}'s execution turn: {}", subject, e);
                        break 'rounds;
                    }
                    Err(e) => log::warn!("execution turn failed for {}: {}", subject, e),
                }
            }

            self.collect_new_collisions(&mut events)?;

            if self.store.all_tasks_completed()? {
                stop_reason = Some("all_tasks_completed".to_string());
                break;
            }

            let marker_after = self.store.progress_marker()?;
            let progressed = subject_changed || marker_after.counter > marker_before.counter;
            if progressed {
                idle_rounds = 0;
                last_progress = Instant::now();
            } else {
                idle_rounds += 1;
                let interval = self.config.no_progress_event_interval;
                if interval > 0 && idle_rounds % interval == 0 {
                    events.push(OrchestratorEvent::new(
                        EventKind::NoProgress,
                        format!("{} consecutive idle round(s)", idle_rounds),
                    ));
                }
            }

            if self.config.human_approval && self.has_pending_plan_approval()? {
                stop_reason = Some("human_approval_required".to_string());
                break;
            }

            let mut comments: Vec<PersonaComment> = Vec::new();
            if !events.is_empty() {
                let active = self.active_persona_map()?;
                comments = evaluate_events(
                    &events,
                    &self.config.personas,
                    &active,
                    self.config.max_comments_per_event,
                );
                self.record_severities(&comments);
                if let Some(reason) = self.apply_persona_actions(&comments)? {
                    stop_reason = Some(reason);
                    break;
                }
            }

            let snapshot = self.build_snapshot(round, idle_rounds, &events, &comments)?;
            self.provider_calls += 1;
            let raw = match self.provider.run(&snapshot).await {
                Ok(raw) => raw,
                Err(e) => {
                    log::error!("provider failed on round {}: {}", round, e);
                    stop_reason = Some("provider_error".to_string());
                    break;
                }
            };
            let decision = match validate_decision(raw) {
                Ok(decision) => decision,
                Err(e) => {
                    log::error!("provider payload rejected on round {}: {}", round, e);
                    stop_reason = Some("provider_error".to_string());
                    break;
                }
            };
            match self.apply_decision(round, &decision) {
                Ok(()) => {}
                Err(e) if is_fatal(&e) => {
                    log::error!("fatal store error applying decision: {}", e);
                    stop_reason = Some("lock_timeout".to_string());
                    break;
                }
                Err(e) => log::warn!("decision application incomplete: {}", e),
            }
            if decision.stop.should_stop {
                stop_reason = Some(format!("provider_stop:{}", decision.stop.reason_short));
                break;
            }

            if self.store.all_tasks_completed()? {
                stop_reason = Some("all_tasks_completed".to_string());
                break;
            }
            if self.config.max_idle_rounds > 0 && idle_rounds >= self.config.max_idle_rounds {
                stop_reason = Some("idle_rounds_limit".to_string());
                break;
            }
            if self.config.max_idle_seconds > 0
                && last_progress.elapsed().as_secs() >= self.config.max_idle_seconds
            {
                stop_reason = Some("idle_seconds_limit".to_string());
                break;
            }
        }

        let stop_reason = stop_reason.unwrap_or_else(|| "max_rounds".to_string());
        log::info!("{} stopped after {} round(s): {}", self.run_id, round, stop_reason);

        let mut persona_metrics = self.metrics.clone();
        persona_metrics.warn_recheck_queue_remaining = self.warn_recheck_queue.len();

        Ok(RunResult {
            stop_reason,
            elapsed_seconds: started.elapsed().as_secs_f64(),
            summary: self.store.status_summary()?,
            tasks_total: self.store.list_tasks()?.len(),
            provider_calls: self.provider_calls,
            provider: self.provider.name().to_string(),
            human_approval: self.config.human_approval,
            persona_metrics,
        })
    }

    // ------------------------------------------------------------------
    // Subject turns
    // ------------------------------------------------------------------

    async fn teammate_process_plan(
        &mut self,
        subject: &str,
        events: &mut Vec<OrchestratorEvent>,
    ) -> Result<bool> {
        let Some(task) = self.store.claim_plan_task(subject)? else {
            return Ok(false);
        };
        log::info!("{} drafting plan for {}", subject, task.id);

        let timeout = self.subject_timeout(subject);
        match tokio::time::timeout(timeout, self.adapter.build_plan(subject, &task)).await {
            Ok(Ok(plan)) => {
                self.store.submit_plan(&task.id, subject, &plan)?;
                events.push(
                    OrchestratorEvent::for_task(
                        EventKind::NeedsApproval,
                        &task.id,
                        "plan submitted, awaiting approval",
                    )
                    .by(subject),
                );
            }
            Ok(Err(e)) => {
                log::warn!("plan build failed for {} on {}: {}", subject, task.id, e);
                self.store
                    .abandon_plan(&task.id, subject, &format!("plan build failed: {}", e))?;
            }
            Err(_) => {
                log::warn!("plan build timed out for {} on {}", subject, task.id);
                self.store
                    .abandon_plan(&task.id, subject, "plan build timed out")?;
            }
        }
        Ok(true)
    }

    async fn teammate_process_execution(
        &mut self,
        subject: &str,
        events: &mut Vec<OrchestratorEvent>,
    ) -> Result<bool> {
        let allowed = self.allowed_execution_tasks(subject)?;
        let Some(task) = self.store.claim_execution_task(subject, allowed.as_deref())? else {
            return Ok(false);
        };
        log::info!("{} executing {}", subject, task.id);

        let timeout = self.subject_timeout(subject);
        let output = match tokio::time::timeout(timeout, self.adapter.execute_task(subject, &task)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                let reason = format!("adapter failure: {}", e);
                self.store.mark_task_blocked(&task.id, subject, &reason)?;
                events.push(OrchestratorEvent::for_task(EventKind::Blocked, &task.id, reason).by(subject));
                return Ok(true);
            }
            Err(_) => {
                let reason = format!("execution timed out after {:?}", timeout);
                self.store.mark_task_blocked(&task.id, subject, &reason)?;
                events.push(OrchestratorEvent::for_task(EventKind::Blocked, &task.id, reason).by(subject));
                return Ok(true);
            }
        };

        if self.subject_is_reviewer(subject) {
            if let Some(rule) = classify_reviewer_stop(&output) {
                self.store.escalate_task(
                    &task.id,
                    subject,
                    &format!("reviewer stop: {}", rule.as_str()),
                )?;
                events.push(
                    OrchestratorEvent::for_task(EventKind::ReviewerViolation, &task.id, rule.as_str())
                        .by(subject),
                );
                return Ok(true);
            }
        }

        match parse_execution_report(&output) {
            Err(e) => {
                let reason = e.to_string();
                self.store.mark_task_blocked(&task.id, subject, &reason)?;
                events.push(OrchestratorEvent::for_task(EventKind::Blocked, &task.id, reason).by(subject));
            }
            Ok(report) => match report.status {
                ReportStatus::Blocked => {
                    let reason = report
                        .summary
                        .unwrap_or_else(|| "blocked by teammate".to_string());
                    self.store.mark_task_blocked(&task.id, subject, &reason)?;
                    events.push(
                        OrchestratorEvent::for_task(EventKind::Blocked, &task.id, reason).by(subject),
                    );
                }
                ReportStatus::Completed => {
                    let order = self.effective_phase_order(&task);
                    let index = current_phase_index(&task, &order);
                    if !order.is_empty() && index + 1 < order.len() {
                        self.store.handoff_task_phase(&task.id, subject, index + 1)?;
                        events.push(
                            OrchestratorEvent::for_task(
                                EventKind::PhaseAdvanced,
                                &task.id,
                                format!("{} -> {}", order[index], order[index + 1]),
                            )
                            .by(subject),
                        );
                    } else {
                        let summary = report.summary.unwrap_or_else(|| "completed".to_string());
                        self.store.complete_task(&task.id, subject, &summary)?;
                        events.push(
                            OrchestratorEvent::for_task(EventKind::TaskCompleted, &task.id, summary)
                                .by(subject),
                        );
                    }
                }
            },
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Phase routing
    // ------------------------------------------------------------------

    fn effective_phase_order(&self, task: &Task) -> Vec<String> {
        if let Some(policy) = &task.persona_policy {
            if !policy.phase_order.is_empty() {
                return policy.phase_order.clone();
            }
        }
        self.config.persona_defaults.phase_order.clone()
    }

    fn effective_phase_policy(&self, task: &Task, phase: &str) -> PhasePolicy {
        let base = self
            .config
            .persona_defaults
            .phase_policies
            .get(phase)
            .cloned()
            .unwrap_or_default();
        match &task.persona_policy {
            Some(policy) => {
                let merged = match policy.phase_overrides.get(phase) {
                    Some(over) => base.merged_with(over),
                    None => base,
                };
                merged.without(&policy.disable_personas)
            }
            None => base,
        }
    }

    fn current_phase_name(&self, task: &Task) -> Option<String> {
        let order = self.effective_phase_order(task);
        if order.is_empty() {
            return None;
        }
        Some(order[current_phase_index(task, &order)].clone())
    }

    /// A persona may execute a task in persona mode only when the task's
    /// current phase lists it as an executor; tasks without a phase order
    /// are open to any enabled persona.
    fn may_execute(&self, subject: &str, task: &Task) -> bool {
        match self.current_phase_name(task) {
            None => true,
            Some(phase) => self
                .effective_phase_policy(task, &phase)
                .executor_personas
                .iter()
                .any(|id| id == subject),
        }
    }

    fn allowed_execution_tasks(&self, subject: &str) -> Result<Option<Vec<TaskId>>> {
        if !self.persona_mode {
            return Ok(None);
        }
        let allowed = self
            .store
            .list_tasks()?
            .iter()
            .filter(|t| self.may_execute(subject, t))
            .map(|t| t.id.clone())
            .collect();
        Ok(Some(allowed))
    }

    fn transition_permitted(&self, persona_id: &str, task: &Task) -> bool {
        if !self.persona_mode {
            return true;
        }
        match self.current_phase_name(task) {
            None => true,
            Some(phase) => self
                .effective_phase_policy(task, &phase)
                .state_transition_personas
                .iter()
                .any(|id| id == persona_id),
        }
    }

    /// Per-task "active persona" restriction handed to the pipeline.
    /// Only tasks with a phase order restrict; the rest stay open.
    fn active_persona_map(&self) -> Result<ActivePersonaMap> {
        let mut map = ActivePersonaMap::new();
        for task in self.store.list_tasks()? {
            if let Some(phase) = self.current_phase_name(&task) {
                let policy = self.effective_phase_policy(&task, &phase);
                map.insert(task.id.clone(), policy.active_personas.into_iter().collect());
            }
        }
        Ok(map)
    }

    fn subject_is_reviewer(&self, subject: &str) -> bool {
        match self.config.personas.iter().find(|p| p.id == subject) {
            Some(persona) => persona.is_reviewer(),
            None => subject.to_lowercase().contains("review"),
        }
    }

    fn subject_timeout(&self, subject: &str) -> Duration {
        let secs = self
            .config
            .personas
            .iter()
            .find(|p| p.id == subject)
            .and_then(|p| p.execution.as_ref())
            .map(|e| e.timeout_secs)
            .unwrap_or(self.config.adapter_timeout_secs);
        Duration::from_secs(secs)
    }

    // ------------------------------------------------------------------
    // Persona actions and the provider
    // ------------------------------------------------------------------

    fn record_severities(&mut self, comments: &[PersonaComment]) {
        for comment in comments {
            *self
                .metrics
                .severity_counts
                .entry(comment.severity.as_str().to_string())
                .or_default() += 1;
        }
    }

    /// Apply persona comments. Warns queue a recheck for next round,
    /// criticals escalate (once per task per round), blockers halt the run
    /// when the persona has blocking authority, else downgrade to an
    /// escalation. Returns the stop reason on a blocker halt.
    fn apply_persona_actions(&mut self, comments: &[PersonaComment]) -> Result<Option<String>> {
        let tasks: HashMap<TaskId, Task> = self
            .store
            .list_tasks()?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        let mut escalated: HashSet<TaskId> = HashSet::new();

        for comment in comments {
            match comment.severity {
                Severity::Info => {}
                Severity::Warn => {
                    let mut event = OrchestratorEvent::new(EventKind::WarnRecheck, comment.text.clone());
                    event.task_id = comment.task_id.clone();
                    self.warn_recheck_queue.push(event);
                }
                Severity::Critical | Severity::Blocker => {
                    let permitted = match &comment.task_id {
                        Some(id) => tasks
                            .get(id)
                            .is_some_and(|t| self.transition_permitted(&comment.persona_id, t)),
                        None => true,
                    };

                    if comment.severity == Severity::Blocker
                        && permitted
                        && self.persona_can_block(&comment.persona_id)
                    {
                        self.metrics.persona_blocker_triggered = true;
                        return Ok(Some(format!("persona_blocker:{}", comment.persona_id)));
                    }

                    if let Some(id) = &comment.task_id {
                        if permitted && !escalated.contains(id) {
                            match self.store.escalate_task(
                                id,
                                &format!("persona:{}", comment.persona_id),
                                &comment.text,
                            ) {
                                Ok(true) => {
                                    escalated.insert(id.clone());
                                }
                                Ok(false) => {}
                                Err(e) if is_fatal(&e) => return Err(e),
                                Err(e) => log::warn!("escalation of {} failed: {}", id, e),
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn persona_can_block(&self, persona_id: &str) -> bool {
        self.config
            .personas
            .iter()
            .any(|p| p.id == persona_id && p.can_block)
    }

    fn collect_new_collisions(&mut self, events: &mut Vec<OrchestratorEvent>) -> Result<()> {
        let collisions = self.store.detect_collisions()?;
        let current: HashSet<(TaskId, TaskId)> = collisions
            .iter()
            .map(|c| (c.waiting.clone(), c.running.clone()))
            .collect();
        for collision in &collisions {
            let pair = (collision.waiting.clone(), collision.running.clone());
            if !self.known_collisions.contains(&pair) {
                events.push(OrchestratorEvent::for_task(
                    EventKind::Collision,
                    &collision.waiting,
                    format!("waiting on target paths held by {}", collision.running),
                ));
            }
        }
        self.known_collisions = current;
        Ok(())
    }

    fn has_pending_plan_approval(&self) -> Result<bool> {
        Ok(self.store.list_tasks()?.iter().any(|t| {
            t.status == TaskStatus::NeedsApproval && t.plan_status == PlanStatus::Submitted
        }))
    }

    fn build_snapshot(
        &self,
        round: u64,
        idle_rounds: u64,
        events: &[OrchestratorEvent],
        comments: &[PersonaComment],
    ) -> Result<Snapshot> {
        let tasks = self.store.list_tasks()?;
        Ok(Snapshot {
            run_id: self.run_id.clone(),
            lead: self.config.lead_id.clone(),
            round,
            idle_rounds,
            subjects: self.subjects.clone(),
            personas: self.config.personas.iter().map(PersonaView::from).collect(),
            summary: self.store.status_summary()?,
            tasks: tasks.iter().map(TaskView::from).collect(),
            events: events.to_vec(),
            comments: comments.to_vec(),
            recent_messages: self
                .store
                .recent_messages(12)?
                .iter()
                .map(MailView::from)
                .collect(),
            recent_decisions: self.recent_decisions.iter().cloned().collect(),
        })
    }

    /// Apply a validated decision. Providers gate, they never execute: the
    /// only accepted moves are pending -> needs_approval, needs_approval ->
    /// pending (without a submitted plan), and blocked -> pending.
    fn apply_decision(&mut self, round: u64, decision: &OrchestratorDecision) -> Result<()> {
        let mut plan_actions = 0usize;

        for update in &decision.task_updates {
            let task = match self.store.get_task(&update.task_id) {
                Ok(task) => task,
                Err(e) => {
                    log::warn!("decision references unknown task {}: {}", update.task_id, e);
                    continue;
                }
            };

            if let Some(action) = update.plan_action {
                if task.status == TaskStatus::NeedsApproval && task.plan_status == PlanStatus::Submitted
                {
                    match self.store.review_plan(
                        &update.task_id,
                        "provider",
                        action,
                        update.feedback.as_deref(),
                    ) {
                        Ok(_) => plan_actions += 1,
                        Err(e) if is_fatal(&e) => return Err(e),
                        Err(e) => log::warn!("plan action on {} failed: {}", update.task_id, e),
                    }
                } else {
                    log::debug!(
                        "ignoring plan action on {}: no submitted plan awaiting review",
                        update.task_id
                    );
                }
            }

            if update.owner.is_some() {
                log::debug!("ignoring owner assignment on {}: claims are teammate-owned", update.task_id);
            }

            let Some(new_status) = update.new_status else {
                continue;
            };
            // Re-read: the plan action above may have already moved it.
            let Ok(task) = self.store.get_task(&update.task_id) else {
                continue;
            };
            let result = match (task.status, new_status) {
                (from, to) if from == to => Ok(()),
                (TaskStatus::Pending, TaskStatus::NeedsApproval) => self
                    .store
                    .escalate_task(
                        &update.task_id,
                        "provider",
                        update.feedback.as_deref().unwrap_or("provider escalation"),
                    )
                    .map(|_| ()),
                (TaskStatus::NeedsApproval, TaskStatus::Pending) => self
                    .store
                    .release_approval(&update.task_id, "provider")
                    .map(|_| ()),
                (TaskStatus::Blocked, TaskStatus::Pending) => {
                    self.store.unblock_task(&update.task_id, "provider").map(|_| ())
                }
                (from, to) => {
                    log::debug!(
                        "rejecting provider transition {:?} -> {:?} on {}",
                        from,
                        to,
                        update.task_id
                    );
                    Ok(())
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => log::warn!("decision update on {} failed: {}", update.task_id, e),
            }
        }

        for message in &decision.messages {
            self.store
                .send_message(&self.config.lead_id, &message.to, &message.text_short, None)?;
        }

        if self.config.auto_approve_fallback && plan_actions == 0 {
            let mut submitted: Vec<Task> = self
                .store
                .list_tasks()?
                .into_iter()
                .filter(|t| {
                    t.status == TaskStatus::NeedsApproval && t.plan_status == PlanStatus::Submitted
                })
                .collect();
            submitted.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
            if let Some(oldest) = submitted.first() {
                log::info!("auto-approving oldest submitted plan: {}", oldest.id);
                self.store
                    .review_plan(&oldest.id, "auto_approve", PlanAction::Approve, None)?;
            }
            let released = self.store.release_stuck_approvals()?;
            if !released.is_empty() {
                log::info!("auto-released {} stuck approval(s)", released.len());
            }
        }

        self.recent_decisions.push_back(decision.summary(round));
        while self.recent_decisions.len() > 5 {
            self.recent_decisions.pop_front();
        }
        Ok(())
    }
}

fn current_phase_index(task: &Task, order: &[String]) -> usize {
    task.current_phase_index
        .unwrap_or(0)
        .min(order.len().saturating_sub(1))
}

fn is_fatal(e: &Error) -> bool {
    matches!(e, Error::LockTimeout { .. })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ScriptedProvider, StubAdapter};
    use crate::personas::{PersonaRole, TaskPersonaPolicy};
    use crate::task::TaskSpec;
    use std::collections::HashMap as StdHashMap;
    use tempfile::TempDir;

    fn store_with(specs: Vec<TaskSpec>) -> (TempDir, TaskStore) {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::open(temp.path()).unwrap();
        if !specs.is_empty() {
            store.bootstrap(specs, false).unwrap();
        }
        (temp, store)
    }

    fn teammate_config(ids: &[&str]) -> OrchestratorConfig {
        OrchestratorConfig {
            teammate_ids: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_construction_requires_subjects() {
        let (_temp, store) = store_with(vec![]);
        let result = Orchestrator::new(
            OrchestratorConfig::default(),
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_persona_mode_wins_over_teammates() {
        let (_temp, store) = store_with(vec![]);
        let mut config = teammate_config(&["dev1"]);
        config.personas = vec![
            PersonaDefinition::new("builder", PersonaRole::Implementer).executable(),
            PersonaDefinition::new("watcher", PersonaRole::SpecGuard),
        ];
        let orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();
        assert!(orchestrator.persona_mode());
        assert_eq!(orchestrator.subjects(), ["builder"]);
    }

    #[test]
    fn test_teammate_mode_fallback() {
        let (_temp, store) = store_with(vec![]);
        let mut config = teammate_config(&["dev1", "dev2"]);
        config.personas = vec![PersonaDefinition::new("watcher", PersonaRole::SpecGuard)];
        let orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();
        assert!(!orchestrator.persona_mode());
        assert_eq!(orchestrator.subjects(), ["dev1", "dev2"]);
    }

    #[test]
    fn test_duplicate_persona_rejected() {
        let (_temp, store) = store_with(vec![]);
        let mut config = teammate_config(&["dev1"]);
        config.personas = vec![
            PersonaDefinition::new("twin", PersonaRole::Implementer),
            PersonaDefinition::new("twin", PersonaRole::Reviewer),
        ];
        assert!(matches!(
            Orchestrator::new(
                config,
                store,
                Arc::new(StubAdapter::new()),
                Arc::new(ScriptedProvider::quiet()),
            ),
            Err(Error::Config(_))
        ));
    }

    fn phased_config(executors: &[(&str, &str)]) -> OrchestratorConfig {
        // executors: (phase, persona)
        let mut config = OrchestratorConfig::default();
        let mut phase_order = Vec::new();
        let mut phase_policies = StdHashMap::new();
        for (phase, persona) in executors {
            phase_order.push(phase.to_string());
            phase_policies.insert(
                phase.to_string(),
                PhasePolicy {
                    active_personas: vec![persona.to_string()],
                    executor_personas: vec![persona.to_string()],
                    state_transition_personas: vec![persona.to_string()],
                },
            );
            if !config.personas.iter().any(|p| p.id == *persona) {
                config
                    .personas
                    .push(PersonaDefinition::new(*persona, PersonaRole::Implementer).executable());
            }
        }
        config.persona_defaults = PersonaDefaults {
            phase_order,
            phase_policies,
        };
        config
    }

    #[test]
    fn test_phase_policy_merging_with_task_override() {
        let (_temp, store) = store_with(vec![]);
        let mut config = phased_config(&[("implement", "alpha"), ("review", "beta")]);
        config
            .personas
            .push(PersonaDefinition::new("gamma", PersonaRole::TestGuard));
        let orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let mut task = Task::new("t1", "phased", false);
        task.persona_policy = Some(TaskPersonaPolicy {
            phase_order: vec![],
            phase_overrides: StdHashMap::from([(
                "implement".to_string(),
                PhasePolicy {
                    active_personas: vec![],
                    executor_personas: vec!["gamma".to_string()],
                    state_transition_personas: vec![],
                },
            )]),
            disable_personas: vec![],
        });

        // Override wins for executors, base survives for the rest.
        assert!(orchestrator.may_execute("gamma", &task));
        assert!(!orchestrator.may_execute("alpha", &task));
        assert!(orchestrator.transition_permitted("alpha", &task));
    }

    #[test]
    fn test_disable_personas_strips_everywhere() {
        let (_temp, store) = store_with(vec![]);
        let config = phased_config(&[("implement", "alpha")]);
        let orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let mut task = Task::new("t1", "phased", false);
        task.persona_policy = Some(TaskPersonaPolicy {
            phase_order: vec![],
            phase_overrides: StdHashMap::new(),
            disable_personas: vec!["alpha".to_string()],
        });
        assert!(!orchestrator.may_execute("alpha", &task));
        assert!(!orchestrator.transition_permitted("alpha", &task));
    }

    #[test]
    fn test_no_phase_order_leaves_tasks_open() {
        let (_temp, store) = store_with(vec![]);
        let mut config = teammate_config(&[]);
        config.personas =
            vec![PersonaDefinition::new("builder", PersonaRole::Implementer).executable()];
        let orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let task = Task::new("t1", "plain", false);
        assert!(orchestrator.may_execute("builder", &task));
        assert!(orchestrator.transition_permitted("builder", &task));
    }

    #[tokio::test]
    async fn test_single_task_run_completes() {
        let (_temp, store) = store_with(vec![TaskSpec::new("t1", "only task")]);
        let mut orchestrator = Orchestrator::new(
            teammate_config(&["dev1"]),
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.stop_reason, "all_tasks_completed");
        assert_eq!(result.summary.completed, 1);
        assert_eq!(result.tasks_total, 1);
        // Completed during round 1, before any provider consult.
        assert_eq!(result.provider_calls, 0);
    }

    #[tokio::test]
    async fn test_blocked_output_blocks_task() {
        let (_temp, store) = store_with(vec![TaskSpec::new("t1", "doomed")]);
        let adapter = Arc::new(
            StubAdapter::new().script_execution("dev1", "t1", "RESULT: blocked\nSUMMARY: no fixture"),
        );
        let mut config = teammate_config(&["dev1"]);
        config.max_rounds = 2;
        config.max_idle_rounds = 1;
        let mut orchestrator = Orchestrator::new(
            config,
            store,
            adapter,
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.summary.blocked, 1);
        assert!(result.persona_metrics.severity_counts.is_empty());
    }

    #[tokio::test]
    async fn test_missing_result_marker_blocks_not_throws() {
        let (_temp, store) = store_with(vec![TaskSpec::new("t1", "chatty")]);
        let adapter = Arc::new(
            StubAdapter::new().script_execution("dev1", "t1", "I did many things, trust me."),
        );
        let mut config = teammate_config(&["dev1"]);
        config.max_rounds = 1;
        let mut orchestrator = Orchestrator::new(
            config,
            store,
            adapter,
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.summary.blocked, 1);
        assert_eq!(result.stop_reason, "max_rounds");
    }

    #[tokio::test]
    async fn test_provider_error_stops_run() {
        struct ExplodingProvider;
        #[async_trait::async_trait]
        impl DecisionProvider for ExplodingProvider {
            fn name(&self) -> &str {
                "exploding"
            }
            async fn run(&self, _snapshot: &Snapshot) -> Result<serde_json::Value> {
                Err(Error::Adapter {
                    subject: "provider".to_string(),
                    detail: "boom".to_string(),
                })
            }
        }

        let (_temp, store) = store_with(vec![
            TaskSpec::new("t1", "one"),
            TaskSpec::new("t2", "two"),
        ]);
        let mut orchestrator = Orchestrator::new(
            teammate_config(&["dev1"]),
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ExplodingProvider),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.stop_reason, "provider_error");
        assert_eq!(result.provider_calls, 1);
    }

    #[tokio::test]
    async fn test_malformed_decision_stops_run() {
        let (_temp, store) = store_with(vec![
            TaskSpec::new("t1", "one"),
            TaskSpec::new("t2", "two"),
        ]);
        let provider = ScriptedProvider::new(vec![serde_json::json!("not an object")]);
        let mut orchestrator = Orchestrator::new(
            teammate_config(&["dev1"]),
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(provider),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.stop_reason, "provider_error");
    }

    #[tokio::test]
    async fn test_provider_stop_reason_propagates() {
        let (_temp, store) = store_with(vec![
            TaskSpec::new("t1", "one"),
            TaskSpec::new("t2", "two"),
        ]);
        let provider = ScriptedProvider::new(vec![serde_json::json!({
            "stop": {"should_stop": true, "reason_short": "budget exhausted"}
        })]);
        // Script a slow path so tasks are not all done in round 1.
        let adapter =
            StubAdapter::new().script_execution("dev1", "t1", "RESULT: blocked\nSUMMARY: stuck");
        let mut orchestrator = Orchestrator::new(
            teammate_config(&["dev1"]),
            store,
            Arc::new(adapter),
            Arc::new(provider),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.stop_reason, "provider_stop:budget exhausted");
    }

    #[tokio::test]
    async fn test_provider_cannot_force_completed() {
        let (_temp, store) = store_with(vec![
            TaskSpec::new("t1", "one").with_deps(&["ghost"]),
        ]);
        let provider = ScriptedProvider::new(vec![serde_json::json!({
            "task_updates": [{"task_id": "t1", "new_status": "completed"}]
        })]);
        let mut config = teammate_config(&["dev1"]);
        config.max_idle_rounds = 2;
        let mut orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(provider),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        // The rejected transition leaves the dependency-starved task pending.
        assert_eq!(result.summary.pending, 1);
        assert_eq!(result.summary.completed, 0);
        assert_eq!(result.stop_reason, "idle_rounds_limit");
    }

    #[tokio::test]
    async fn test_provider_unblocks_blocked_task() {
        let (_temp, store) = store_with(vec![TaskSpec::new("t1", "flaky")]);
        // First execution blocks; after the provider unblocks, the default
        // stub output completes it.
        let adapter = StubAdapter::new();
        let provider = ScriptedProvider::new(vec![serde_json::json!({
            "task_updates": [{"task_id": "t1", "new_status": "pending"}]
        })]);

        // Pre-block the task through the store to simulate the failure.
        store.claim_execution_task("dev1", None).unwrap().unwrap();
        store
            .mark_task_blocked(&TaskId::from("t1"), "dev1", "transient")
            .unwrap();

        let mut orchestrator = Orchestrator::new(
            teammate_config(&["dev1"]),
            store,
            Arc::new(adapter),
            Arc::new(provider),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.stop_reason, "all_tasks_completed");
        assert_eq!(result.summary.completed, 1);
    }

    #[tokio::test]
    async fn test_warn_comments_queue_recheck_events() {
        // A plan submission is a warn-severity event; a non-blocking persona
        // turns it into a queued recheck rather than any state change.
        let (_temp, store) = store_with(vec![TaskSpec::new("t1", "planned").with_plan()]);
        let mut config = teammate_config(&["dev1"]);
        config.personas = vec![PersonaDefinition::new("guard", PersonaRole::SpecGuard)];
        config.auto_approve_fallback = false;
        config.max_rounds = 1;
        let mut orchestrator = Orchestrator::new(
            config,
            store,
            Arc::new(StubAdapter::new()),
            Arc::new(ScriptedProvider::quiet()),
        )
        .unwrap();

        let result = orchestrator.run().await.unwrap();
        assert_eq!(result.stop_reason, "max_rounds");
        assert!(result.persona_metrics.severity_counts.contains_key("warn"));
        assert!(result.persona_metrics.warn_recheck_queue_remaining > 0);
    }
}
