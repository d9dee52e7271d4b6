//! Persona evaluation pipeline.
//!
//! Stateless triage: a batch of orchestrator events in, a bounded set of
//! severity-tagged persona comments out. Selection is deterministic so two
//! runs over the same events always surface the same comments.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::events::{OrchestratorEvent, Severity};
use crate::personas::PersonaDefinition;
use crate::task::TaskId;

/// A persona's reaction to one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaComment {
    pub persona_id: String,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub severity: Severity,
    pub text: String,
}

/// Restriction of which personas are "active" per task. A task id missing
/// from the map means unrestricted.
pub type ActivePersonaMap = HashMap<TaskId, HashSet<String>>;

/// Evaluate a batch of events.
///
/// For every enabled persona that is active for the event's task (or any
/// enabled persona for task-less events), synthesize one comment. Each
/// event's comment set is sorted by (severity, persona id, task id) and
/// truncated to `max_comments_per_event`.
pub fn evaluate_events(
    events: &[OrchestratorEvent],
    personas: &[PersonaDefinition],
    active: &ActivePersonaMap,
    max_comments_per_event: usize,
) -> Vec<PersonaComment> {
    let mut out = Vec::new();

    for event in events {
        let Some(severity) = Severity::for_event(event.kind) else {
            continue;
        };

        let restriction = event.task_id.as_ref().and_then(|id| active.get(id));

        let mut comments: Vec<PersonaComment> = personas
            .iter()
            .filter(|p| p.enabled)
            .filter(|p| restriction.is_none_or(|set| set.contains(&p.id)))
            .map(|p| PersonaComment {
                persona_id: p.id.clone(),
                task_id: event.task_id.clone(),
                severity,
                text: comment_text(p, event, severity),
            })
            .collect();

        comments.sort_by(|a, b| {
            a.severity
                .cmp(&b.severity)
                .then_with(|| a.persona_id.cmp(&b.persona_id))
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        comments.truncate(max_comments_per_event);
        out.extend(comments);
    }

    out
}

fn comment_text(persona: &PersonaDefinition, event: &OrchestratorEvent, severity: Severity) -> String {
    let scope = event
        .task_id
        .as_ref()
        .map(|id| format!(" on {}", id))
        .unwrap_or_default();
    format!(
        "[{}] {}{}: {}",
        severity.as_str(),
        event.kind.as_str(),
        scope,
        if event.detail.is_empty() {
            persona.focus.as_str()
        } else {
            event.detail.as_str()
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::personas::PersonaRole;

    fn personas() -> Vec<PersonaDefinition> {
        vec![
            PersonaDefinition::new("alpha", PersonaRole::Implementer),
            PersonaDefinition::new("beta", PersonaRole::Reviewer),
            PersonaDefinition::new("gamma", PersonaRole::SpecGuard),
        ]
    }

    #[test]
    fn test_unmapped_events_ignored() {
        let events = vec![
            OrchestratorEvent::new(EventKind::PhaseAdvanced, "implement -> review"),
            OrchestratorEvent::new(EventKind::WarnRecheck, "recheck t1"),
        ];
        let comments = evaluate_events(&events, &personas(), &HashMap::new(), 2);
        assert!(comments.is_empty());
    }

    #[test]
    fn test_cap_and_lexical_tiebreak() {
        let events = vec![OrchestratorEvent::new(EventKind::Kickoff, "round 1")];
        let comments = evaluate_events(&events, &personas(), &HashMap::new(), 2);
        // Three personas commented, capped to two, lexical by persona id.
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].persona_id, "alpha");
        assert_eq!(comments[1].persona_id, "beta");
    }

    #[test]
    fn test_disabled_personas_skipped() {
        let mut set = personas();
        set[0].enabled = false;
        let events = vec![OrchestratorEvent::new(EventKind::Kickoff, "round 1")];
        let comments = evaluate_events(&events, &set, &HashMap::new(), 10);
        assert!(comments.iter().all(|c| c.persona_id != "alpha"));
        assert_eq!(comments.len(), 2);
    }

    #[test]
    fn test_active_restriction_applies_per_task() {
        let task = TaskId::from("t1");
        let active: ActivePersonaMap = HashMap::from([(
            task.clone(),
            HashSet::from(["beta".to_string()]),
        )]);
        let events = vec![OrchestratorEvent::for_task(
            EventKind::Blocked,
            &task,
            "stuck on missing fixture",
        )];
        let comments = evaluate_events(&events, &personas(), &active, 10);
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].persona_id, "beta");
        assert_eq!(comments[0].severity, Severity::Critical);
    }

    #[test]
    fn test_severity_assignment() {
        let task = TaskId::from("t1");
        let events = vec![
            OrchestratorEvent::for_task(EventKind::ReviewerViolation, &task, "drift"),
            OrchestratorEvent::for_task(EventKind::Collision, &task, "shared path"),
        ];
        let comments = evaluate_events(&events, &personas(), &HashMap::new(), 1);
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].severity, Severity::Blocker);
        assert_eq!(comments[1].severity, Severity::Warn);
    }
}
