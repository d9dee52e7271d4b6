//! Persona definitions.
//!
//! A persona is a named review/execution identity with a focus, blocking
//! authority, and an optional execution binding that turns it into a
//! runnable subject.

use serde::{Deserialize, Serialize};

/// Role a persona plays in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaRole {
    Implementer,
    Reviewer,
    SpecGuard,
    TestGuard,
    Custom,
}

impl Default for PersonaRole {
    fn default() -> Self {
        PersonaRole::Custom
    }
}

/// How a persona is realized as a runnable subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaExecution {
    /// Whether this persona participates as an execution subject.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Reference to the command/template the adapter runs for it.
    #[serde(default)]
    pub command_ref: Option<String>,
    /// Run the command sandboxed.
    #[serde(default)]
    pub sandbox: bool,
    /// Wall-clock bound for one adapter call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for PersonaExecution {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            command_ref: None,
            sandbox: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// A persona definition. Loaded once per run and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaDefinition {
    pub id: String,
    #[serde(default)]
    pub role: PersonaRole,
    /// Free-text description of what this persona watches for.
    #[serde(default)]
    pub focus: String,
    /// Only blocker-severity comments from personas with this flag may
    /// halt the run.
    #[serde(default)]
    pub can_block: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub execution: Option<PersonaExecution>,
}

impl PersonaDefinition {
    pub fn new(id: impl Into<String>, role: PersonaRole) -> Self {
        Self {
            id: id.into(),
            role,
            focus: String::new(),
            can_block: false,
            enabled: true,
            execution: None,
        }
    }

    pub fn with_focus(mut self, focus: impl Into<String>) -> Self {
        self.focus = focus.into();
        self
    }

    pub fn blocking(mut self) -> Self {
        self.can_block = true;
        self
    }

    pub fn executable(mut self) -> Self {
        self.execution = Some(PersonaExecution::default());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// True when the persona is wired up as a runnable subject.
    pub fn is_execution_subject(&self) -> bool {
        self.enabled && self.execution.as_ref().is_some_and(|e| e.enabled)
    }

    /// Reviewer detection for stop-token scanning: by role, or by the id
    /// heuristic for custom personas named like reviewers.
    pub fn is_reviewer(&self) -> bool {
        self.role == PersonaRole::Reviewer || self.id.to_lowercase().contains("review")
    }
}
