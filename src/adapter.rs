//! Adapter seams: teammate execution and the decision provider.
//!
//! The orchestrator only ever talks to these traits. The shipped
//! implementations are the templated stub (deterministic, scriptable, used
//! by tests and dry runs), the subprocess adapter, and the scripted
//! provider. LLM-backed implementations live outside this crate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use crate::task::Task;

/// Executes planning and execution turns on behalf of a subject.
#[async_trait]
pub trait TeammateAdapter: Send + Sync {
    async fn build_plan(&self, subject: &str, task: &Task) -> Result<String>;
    async fn execute_task(&self, subject: &str, task: &Task) -> Result<String>;
}

/// Produces a raw decision payload from a snapshot. Validation happens on
/// the orchestrator side.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, snapshot: &Snapshot) -> Result<serde_json::Value>;
}

/// One recorded adapter call, for assertions on claim/phase routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterCall {
    pub subject: String,
    pub task_id: String,
    pub phase_index: Option<usize>,
    pub kind: AdapterCallKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterCallKind {
    Plan,
    Execute,
}

/// Deterministic templated adapter.
///
/// Default behavior: plans are a short template, executions report
/// `RESULT: completed`. Individual (subject, task) pairs can be scripted
/// with fixed output; `"*"` works as a subject wildcard.
#[derive(Default)]
pub struct StubAdapter {
    execution_scripts: HashMap<(String, String), String>,
    plan_scripts: HashMap<(String, String), String>,
    calls: Mutex<Vec<AdapterCall>>,
}

impl StubAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_execution(
        mut self,
        subject: &str,
        task_id: &str,
        output: impl Into<String>,
    ) -> Self {
        self.execution_scripts
            .insert((subject.to_string(), task_id.to_string()), output.into());
        self
    }

    pub fn script_plan(mut self, subject: &str, task_id: &str, output: impl Into<String>) -> Self {
        self.plan_scripts
            .insert((subject.to_string(), task_id.to_string()), output.into());
        self
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn lookup<'a>(
        scripts: &'a HashMap<(String, String), String>,
        subject: &str,
        task_id: &str,
    ) -> Option<&'a String> {
        scripts
            .get(&(subject.to_string(), task_id.to_string()))
            .or_else(|| scripts.get(&("*".to_string(), task_id.to_string())))
    }

    fn record(&self, subject: &str, task: &Task, kind: AdapterCallKind) {
        self.calls.lock().expect("calls lock").push(AdapterCall {
            subject: subject.to_string(),
            task_id: task.id.to_string(),
            phase_index: task.current_phase_index,
            kind,
        });
    }
}

#[async_trait]
impl TeammateAdapter for StubAdapter {
    async fn build_plan(&self, subject: &str, task: &Task) -> Result<String> {
        self.record(subject, task, AdapterCallKind::Plan);
        if let Some(scripted) = Self::lookup(&self.plan_scripts, subject, task.id.as_ref()) {
            return Ok(scripted.clone());
        }
        Ok(format!(
            "Plan for {}: inspect {}, apply the change, verify.",
            task.id,
            if task.target_paths.is_empty() {
                "the tree".to_string()
            } else {
                task.target_paths.join(", ")
            }
        ))
    }

    async fn execute_task(&self, subject: &str, task: &Task) -> Result<String> {
        self.record(subject, task, AdapterCallKind::Execute);
        if let Some(scripted) = Self::lookup(&self.execution_scripts, subject, task.id.as_ref()) {
            return Ok(scripted.clone());
        }
        Ok(format!(
            "Executed {} as {}.\nRESULT: completed\nSUMMARY: {} done\nCHANGED_FILES: {}",
            task.id,
            subject,
            task.title,
            task.target_paths.join(", ")
        ))
    }
}

/// Runs a configured command per subject. The task context is passed on
/// stdin as JSON; stdout is the result text. Non-zero exit and timeouts
/// surface as adapter errors, which the orchestrator degrades to a block.
pub struct CommandAdapter {
    commands: HashMap<String, String>,
    timeout: Duration,
}

impl CommandAdapter {
    pub fn new(commands: HashMap<String, String>, timeout: Duration) -> Self {
        Self { commands, timeout }
    }

    async fn run_command(&self, subject: &str, mode: &str, task: &Task) -> Result<String> {
        let command = self.commands.get(subject).ok_or_else(|| Error::Adapter {
            subject: subject.to_string(),
            detail: "no command configured".to_string(),
        })?;

        let payload = serde_json::to_string(&serde_json::json!({
            "mode": mode,
            "subject": subject,
            "task": task,
        }))?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("COHORT_SUBJECT", subject)
            .env("COHORT_TASK_ID", task.id.as_ref())
            .env("COHORT_MODE", mode)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| Error::Adapter {
                subject: subject.to_string(),
                detail: format!("spawn failed: {}", e),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(payload.as_bytes()).await.map_err(|e| Error::Adapter {
                subject: subject.to_string(),
                detail: format!("stdin write failed: {}", e),
            })?;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Adapter {
                    subject: subject.to_string(),
                    detail: format!("wait failed: {}", e),
                })
            }
            Err(_) => {
                return Err(Error::Adapter {
                    subject: subject.to_string(),
                    detail: format!("timed out after {:?}", self.timeout),
                })
            }
        };

        if !output.status.success() {
            return Err(Error::Adapter {
                subject: subject.to_string(),
                detail: format!(
                    "exit {}: {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TeammateAdapter for CommandAdapter {
    async fn build_plan(&self, subject: &str, task: &Task) -> Result<String> {
        self.run_command(subject, "plan", task).await
    }

    async fn execute_task(&self, subject: &str, task: &Task) -> Result<String> {
        self.run_command(subject, "execute", task).await
    }
}

/// Deterministic provider: pops canned decisions in order, then keeps
/// returning empty no-op decisions.
pub struct ScriptedProvider {
    queue: Mutex<std::collections::VecDeque<serde_json::Value>>,
}

impl ScriptedProvider {
    pub fn new(decisions: Vec<serde_json::Value>) -> Self {
        Self {
            queue: Mutex::new(decisions.into()),
        }
    }

    /// A provider that always answers with a no-op decision.
    pub fn quiet() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl DecisionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(&self, _snapshot: &Snapshot) -> Result<serde_json::Value> {
        let next = self.queue.lock().expect("queue lock").pop_front();
        Ok(next.unwrap_or_else(|| serde_json::json!({})))
    }
}
