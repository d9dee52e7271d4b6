//! Provider decision wire contract.
//!
//! The decision provider returns raw JSON. Ingestion goes through a
//! permissive raw layer, then `validate_decision` normalizes and clamps
//! every field into the strict form the orchestrator applies. Malformed
//! payloads fail closed with `DecisionValidation`; nothing from a bad
//! payload is ever partially applied.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::{PlanAction, TaskId, TaskStatus};

/// Length cap for reasons and feedback.
const MAX_REASON_LEN: usize = 240;
/// Length cap for outbound mailbox messages.
const MAX_MESSAGE_LEN: usize = 480;

/// Advisory routing note. Recorded for observability, never applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionNote {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub action: String,
    pub reason: String,
}

/// One requested task mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: TaskId,
    #[serde(default)]
    pub new_status: Option<TaskStatus>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub plan_action: Option<PlanAction>,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Mailbox message the provider wants delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub to: String,
    pub text_short: String,
}

/// Stop instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopDirective {
    pub should_stop: bool,
    pub reason_short: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenBudget {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionMeta {
    pub provider: String,
    pub model: String,
    pub token_budget: TokenBudget,
    pub elapsed_ms: u64,
}

impl Default for DecisionMeta {
    fn default() -> Self {
        Self {
            provider: "unknown".to_string(),
            model: "unknown".to_string(),
            token_budget: TokenBudget::default(),
            elapsed_ms: 0,
        }
    }
}

/// A validated provider decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorDecision {
    pub decisions: Vec<DecisionNote>,
    pub task_updates: Vec<TaskUpdate>,
    pub messages: Vec<OutboundMessage>,
    pub stop: StopDirective,
    pub meta: DecisionMeta,
}

impl OrchestratorDecision {
    /// One-line summary kept in the snapshot's recent-decision history.
    pub fn summary(&self, round: u64) -> String {
        format!(
            "round {}: {} update(s), {} message(s), stop={} [{}/{}]",
            round,
            self.task_updates.len(),
            self.messages.len(),
            self.stop.should_stop,
            self.meta.provider,
            self.meta.model,
        )
    }
}

// Raw (permissive) wire shapes. Every field optional; validation decides
// what is tolerable and what fails closed.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDecision {
    decisions: Vec<RawNote>,
    task_updates: Vec<RawTaskUpdate>,
    messages: Vec<RawMessage>,
    stop: RawStop,
    meta: RawMeta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawNote {
    task_id: Option<String>,
    action: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTaskUpdate {
    task_id: Option<String>,
    new_status: Option<String>,
    owner: Option<String>,
    plan_action: Option<String>,
    feedback: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMessage {
    to: Option<String>,
    text_short: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawStop {
    should_stop: Option<bool>,
    reason_short: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBudget {
    input: Option<u64>,
    output: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMeta {
    provider: Option<String>,
    model: Option<String>,
    token_budget: RawBudget,
    elapsed_ms: Option<u64>,
}

fn clamp(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Validate and normalize a raw provider payload.
pub fn validate_decision(raw: serde_json::Value) -> Result<OrchestratorDecision> {
    if !raw.is_object() {
        return Err(Error::DecisionValidation(format!(
            "payload must be a JSON object, got {}",
            json_kind(&raw)
        )));
    }
    let raw: RawDecision = serde_json::from_value(raw)
        .map_err(|e| Error::DecisionValidation(e.to_string()))?;

    let decisions = raw
        .decisions
        .into_iter()
        .map(|n| DecisionNote {
            task_id: n.task_id.filter(|id| !id.is_empty()).map(TaskId),
            action: clamp(n.action.as_deref().unwrap_or(""), MAX_REASON_LEN),
            reason: clamp(n.reason.as_deref().unwrap_or(""), MAX_REASON_LEN),
        })
        .collect();

    let mut task_updates = Vec::new();
    for update in raw.task_updates {
        let id = update
            .task_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::DecisionValidation("task_update without task_id".to_string()))?;
        let new_status = match update.new_status.as_deref() {
            None | Some("") => None,
            Some(s) => Some(TaskStatus::parse(s).ok_or_else(|| {
                Error::DecisionValidation(format!("unknown status '{}' for task {}", s, id))
            })?),
        };
        let plan_action = match update.plan_action.as_deref() {
            None | Some("") => None,
            Some(s) => Some(PlanAction::parse(s).ok_or_else(|| {
                Error::DecisionValidation(format!("unknown plan_action '{}' for task {}", s, id))
            })?),
        };
        task_updates.push(TaskUpdate {
            task_id: TaskId(id),
            new_status,
            owner: update.owner.filter(|o| !o.is_empty()),
            plan_action,
            feedback: update
                .feedback
                .filter(|f| !f.is_empty())
                .map(|f| clamp(&f, MAX_REASON_LEN)),
        });
    }

    let mut messages = Vec::new();
    for message in raw.messages {
        let to = message
            .to
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::DecisionValidation("message without receiver".to_string()))?;
        let text = message.text_short.unwrap_or_default();
        if text.is_empty() {
            continue;
        }
        messages.push(OutboundMessage {
            to,
            text_short: clamp(&text, MAX_MESSAGE_LEN),
        });
    }

    let should_stop = raw.stop.should_stop.unwrap_or(false);
    let mut reason_short = clamp(raw.stop.reason_short.as_deref().unwrap_or(""), MAX_REASON_LEN);
    if should_stop && reason_short.is_empty() {
        reason_short = "unspecified".to_string();
    }

    Ok(OrchestratorDecision {
        decisions,
        task_updates,
        messages,
        stop: StopDirective {
            should_stop,
            reason_short,
        },
        meta: DecisionMeta {
            provider: raw.meta.provider.unwrap_or_else(|| "unknown".to_string()),
            model: raw.meta.model.unwrap_or_else(|| "unknown".to_string()),
            token_budget: TokenBudget {
                input: raw.meta.token_budget.input.unwrap_or(0),
                output: raw.meta.token_budget.output.unwrap_or(0),
            },
            elapsed_ms: raw.meta.elapsed_ms.unwrap_or(0),
        },
    })
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
