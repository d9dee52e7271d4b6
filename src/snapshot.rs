//! The compact state view sent to the decision provider.

use serde::Serialize;

use crate::events::OrchestratorEvent;
use crate::personas::{PersonaComment, PersonaDefinition, PersonaRole};
use crate::store::{MailMessage, StatusSummary};
use crate::task::{Task, TaskId};

/// Provider-facing view of one persona.
#[derive(Debug, Clone, Serialize)]
pub struct PersonaView {
    pub id: String,
    pub role: PersonaRole,
    pub focus: String,
    pub can_block: bool,
}

impl From<&PersonaDefinition> for PersonaView {
    fn from(p: &PersonaDefinition) -> Self {
        Self {
            id: p.id.clone(),
            role: p.role.clone(),
            focus: p.focus.clone(),
            can_block: p.can_block,
        }
    }
}

/// Provider-facing view of one task. Plan text and progress logs stay out
/// of the snapshot to keep it compact.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub title: String,
    pub status: String,
    pub plan_status: String,
    pub owner: Option<String>,
    pub planner: Option<String>,
    pub depends_on: Vec<TaskId>,
    pub current_phase_index: Option<usize>,
    pub block_reason: Option<String>,
    pub revision_count: u32,
}

impl From<&Task> for TaskView {
    fn from(t: &Task) -> Self {
        Self {
            id: t.id.clone(),
            title: t.title.clone(),
            status: t.status.as_str().to_string(),
            plan_status: t.plan_status.as_str().to_string(),
            owner: t.owner.clone(),
            planner: t.planner.clone(),
            depends_on: t.depends_on.clone(),
            current_phase_index: t.current_phase_index,
            block_reason: t.block_reason.clone(),
            revision_count: t.revision_count,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MailView {
    pub seq: u64,
    pub sender: String,
    pub receiver: String,
    pub content: String,
}

impl From<&MailMessage> for MailView {
    fn from(m: &MailMessage) -> Self {
        Self {
            seq: m.seq,
            sender: m.sender.clone(),
            receiver: m.receiver.clone(),
            content: m.content.clone(),
        }
    }
}

/// Everything the provider sees for one consultation.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub run_id: String,
    pub lead: String,
    pub round: u64,
    pub idle_rounds: u64,
    pub subjects: Vec<String>,
    pub personas: Vec<PersonaView>,
    pub summary: StatusSummary,
    pub tasks: Vec<TaskView>,
    pub events: Vec<OrchestratorEvent>,
    pub comments: Vec<PersonaComment>,
    pub recent_messages: Vec<MailView>,
    pub recent_decisions: Vec<String>,
}

impl Snapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("snapshot serializes")
    }
}
