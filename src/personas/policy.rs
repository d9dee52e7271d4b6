//! Phase policies: which personas watch, execute, and gate each phase.
//!
//! Policy JSON/YAML is loosely typed as authored; everything is normalized
//! and validated against the declared persona set at load time. Unknown
//! persona ids or phase keys are a hard error, never silently ignored.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::personas::PersonaDefinition;

/// Per-phase persona assignments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhasePolicy {
    /// Personas whose comments apply to tasks in this phase.
    #[serde(default)]
    pub active_personas: Vec<String>,
    /// Personas allowed to claim execution in this phase.
    #[serde(default)]
    pub executor_personas: Vec<String>,
    /// Personas allowed to escalate/block tasks in this phase.
    #[serde(default)]
    pub state_transition_personas: Vec<String>,
}

impl PhasePolicy {
    fn dedup(&mut self) {
        dedup_preserving(&mut self.active_personas);
        dedup_preserving(&mut self.executor_personas);
        dedup_preserving(&mut self.state_transition_personas);
    }

    fn referenced_ids(&self) -> impl Iterator<Item = &String> {
        self.active_personas
            .iter()
            .chain(self.executor_personas.iter())
            .chain(self.state_transition_personas.iter())
    }

    /// Merge `over` on top of self, key-by-key: a field present (non-empty)
    /// in the override wins wholesale.
    pub fn merged_with(&self, over: &PhasePolicy) -> PhasePolicy {
        PhasePolicy {
            active_personas: pick(&over.active_personas, &self.active_personas),
            executor_personas: pick(&over.executor_personas, &self.executor_personas),
            state_transition_personas: pick(
                &over.state_transition_personas,
                &self.state_transition_personas,
            ),
        }
    }

    /// Remove disabled personas from every list.
    pub fn without(&self, disabled: &[String]) -> PhasePolicy {
        let keep = |ids: &[String]| {
            ids.iter()
                .filter(|id| !disabled.contains(id))
                .cloned()
                .collect()
        };
        PhasePolicy {
            active_personas: keep(&self.active_personas),
            executor_personas: keep(&self.executor_personas),
            state_transition_personas: keep(&self.state_transition_personas),
        }
    }
}

fn pick(over: &[String], base: &[String]) -> Vec<String> {
    if over.is_empty() {
        base.to_vec()
    } else {
        over.to_vec()
    }
}

fn dedup_preserving(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|i| seen.insert(i.clone()));
}

/// Global phase defaults for the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaDefaults {
    /// Ordered phase names, e.g. ["implement", "review"].
    #[serde(default)]
    pub phase_order: Vec<String>,
    /// Policy per phase name. Keys must be members of `phase_order`.
    #[serde(default)]
    pub phase_policies: HashMap<String, PhasePolicy>,
}

impl PersonaDefaults {
    /// Normalize and validate against the declared persona set.
    pub fn normalize(&mut self, personas: &[PersonaDefinition]) -> Result<()> {
        dedup_preserving(&mut self.phase_order);
        validate_phase_map(&mut self.phase_policies, &self.phase_order, personas, "defaults")
    }
}

/// Task-level policy override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPersonaPolicy {
    /// Replaces the global phase order when non-empty.
    #[serde(default)]
    pub phase_order: Vec<String>,
    /// Per-phase overrides, merged key-by-key over the global policy.
    #[serde(default)]
    pub phase_overrides: HashMap<String, PhasePolicy>,
    /// Personas excluded from this task entirely.
    #[serde(default)]
    pub disable_personas: Vec<String>,
}

impl TaskPersonaPolicy {
    /// Normalize and validate against the declared persona set and the
    /// effective phase order (the task's own when set, else the global).
    pub fn normalize(
        &mut self,
        personas: &[PersonaDefinition],
        global_order: &[String],
        context: &str,
    ) -> Result<()> {
        dedup_preserving(&mut self.phase_order);
        dedup_preserving(&mut self.disable_personas);

        let known: HashSet<&str> = personas.iter().map(|p| p.id.as_str()).collect();
        for id in &self.disable_personas {
            if !known.contains(id.as_str()) {
                return Err(Error::Config(format!(
                    "{}: disable_personas references unknown persona '{}'",
                    context, id
                )));
            }
        }

        let effective_order: Vec<String> = if self.phase_order.is_empty() {
            global_order.to_vec()
        } else {
            self.phase_order.clone()
        };
        validate_phase_map(&mut self.phase_overrides, &effective_order, personas, context)
    }
}

fn validate_phase_map(
    map: &mut HashMap<String, PhasePolicy>,
    order: &[String],
    personas: &[PersonaDefinition],
    context: &str,
) -> Result<()> {
    let known: HashSet<&str> = personas.iter().map(|p| p.id.as_str()).collect();
    for (phase, policy) in map.iter_mut() {
        if !order.contains(phase) {
            return Err(Error::Config(format!(
                "{}: phase '{}' is not in the phase order {:?}",
                context, phase, order
            )));
        }
        policy.dedup();
        for id in policy.referenced_ids() {
            if !known.contains(id.as_str()) {
                return Err(Error::Config(format!(
                    "{}: phase '{}' references unknown persona '{}'",
                    context, phase, id
                )));
            }
        }
    }
    Ok(())
}
