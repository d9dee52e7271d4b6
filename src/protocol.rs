//! Execution-output protocol.
//!
//! Two contracts live here: the `RESULT:` terminal block every execution
//! subject must emit, and the reviewer-stop signal scan applied to
//! reviewer-role output. The token and alias tables are plain data so new
//! locales or phrasings extend without touching the matching logic.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

/// Terminal state a teammate reports for an execution turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Completed,
    Blocked,
}

/// Parsed form of a subject's terminal output block.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub status: ReportStatus,
    pub summary: Option<String>,
    pub changed_files: Vec<String>,
    pub checks: Option<String>,
}

/// Parse the terminal block from free-text execution output.
///
/// Recognized lines are `RESULT:`, `SUMMARY:`, `CHANGED_FILES:` and
/// `CHECKS:`, order-independent, last occurrence wins. A missing or
/// unrecognizable `RESULT:` line is a protocol violation.
pub fn parse_execution_report(output: &str) -> Result<ExecutionReport> {
    let mut result_line: Option<String> = None;
    let mut summary: Option<String> = None;
    let mut changed_files: Option<String> = None;
    let mut checks: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("RESULT:") {
            result_line = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("SUMMARY:") {
            summary = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("CHANGED_FILES:") {
            changed_files = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("CHECKS:") {
            checks = Some(rest.trim().to_string());
        }
    }

    let result_line = result_line
        .ok_or_else(|| Error::Protocol("output has no RESULT: line".to_string()))?;
    let status = match result_line.to_lowercase().as_str() {
        "completed" => ReportStatus::Completed,
        "blocked" => ReportStatus::Blocked,
        other => {
            return Err(Error::Protocol(format!(
                "RESULT must be completed or blocked, got '{}'",
                other
            )))
        }
    };

    Ok(ExecutionReport {
        status,
        summary: summary.filter(|s| !s.is_empty()),
        changed_files: changed_files
            .map(|files| {
                files
                    .split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        checks: checks.filter(|c| !c.is_empty()),
    })
}

/// Canonical reviewer-stop rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewerRule {
    /// Implementation drifted from what was asked.
    RequirementDrift,
    /// Changes far beyond the task's scope.
    OverEditing,
    /// Output padded to the point of hiding the work.
    Verbosity,
}

impl ReviewerRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewerRule::RequirementDrift => "requirement_drift",
            ReviewerRule::OverEditing => "over_editing",
            ReviewerRule::Verbosity => "verbosity",
        }
    }
}

/// Explicit stop markers, canonical first. Localized deployments have
/// shipped reviewers emitting the latter spellings.
const STOP_MARKERS: &[&str] = &["REVIEWER_STOP", "REVIEW_STOP", "STOP_REVISEUR", "REVISOR_ALTO"];

/// Rule-name aliases accepted after an explicit marker.
const RULE_ALIASES: &[(&str, ReviewerRule)] = &[
    ("requirement_drift", ReviewerRule::RequirementDrift),
    ("requirements_drift", ReviewerRule::RequirementDrift),
    ("drift", ReviewerRule::RequirementDrift),
    ("over_editing", ReviewerRule::OverEditing),
    ("overediting", ReviewerRule::OverEditing),
    ("scope_creep", ReviewerRule::OverEditing),
    ("verbosity", ReviewerRule::Verbosity),
    ("verbose", ReviewerRule::Verbosity),
];

static HINT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(stop|blocker|violation)\b").unwrap());

static RULE_PATTERNS: LazyLock<Vec<(ReviewerRule, Regex)>> = LazyLock::new(|| {
    vec![
        (
            ReviewerRule::RequirementDrift,
            Regex::new(r"(?i)requirement|drift(ed)?\s+from\s+(the\s+)?(spec|task)").unwrap(),
        ),
        (
            ReviewerRule::OverEditing,
            Regex::new(r"(?i)over[-_\s]?edit|unrelated\s+(changes|files)|rewrote\s+far\s+more").unwrap(),
        ),
        (
            ReviewerRule::Verbosity,
            Regex::new(r"(?i)verbos|padded\s+output|wall\s+of\s+text").unwrap(),
        ),
    ]
});

/// Scan reviewer output for a stop signal.
///
/// An explicit `<MARKER>:<rule>` token wins; failing that, a generic
/// stop/blocker/violation hint combined with a rule-specific pattern
/// classifies. Returns None when nothing matches.
pub fn classify_reviewer_stop(output: &str) -> Option<ReviewerRule> {
    for marker in STOP_MARKERS {
        let Some(pos) = output.find(marker) else {
            continue;
        };
        let after = &output[pos + marker.len()..];
        let Some(after) = after.strip_prefix(':') else {
            continue;
        };
        let token: String = after
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_lowercase();
        if let Some((_, rule)) = RULE_ALIASES.iter().find(|(alias, _)| *alias == token) {
            return Some(*rule);
        }
    }

    if HINT_PATTERN.is_match(output) {
        for (rule, pattern) in RULE_PATTERNS.iter() {
            if pattern.is_match(output) {
                return Some(*rule);
            }
        }
    }

    None
}
