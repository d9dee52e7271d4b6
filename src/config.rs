//! Run configuration for cohort.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::OrchestratorConfig;
use crate::personas::{PersonaDefaults, PersonaDefinition};
use crate::task::TaskSpec;

/// Cohort run configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunConfig {
    /// Lead identity used as the sender of provider messages.
    pub lead: String,
    /// Plain teammate ids, used when no persona is executable.
    pub teammates: Vec<String>,
    pub personas: Vec<PersonaDefinition>,
    pub persona_defaults: PersonaDefaults,
    pub limits: LimitSettings,
    /// Halt for human review instead of letting the provider approve plans.
    pub human_approval: bool,
    pub auto_approve_fallback: bool,
    /// Commands per subject for the subprocess adapter. Empty means the
    /// templated stub adapter (dry runs).
    pub commands: HashMap<String, String>,
    /// Tasks to bootstrap into the run directory.
    pub tasks: Vec<TaskSpec>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lead: "lead".to_string(),
            teammates: Vec::new(),
            personas: Vec::new(),
            persona_defaults: PersonaDefaults::default(),
            limits: LimitSettings::default(),
            human_approval: false,
            auto_approve_fallback: true,
            commands: HashMap::new(),
            tasks: Vec::new(),
        }
    }
}

/// Stop-condition and sizing knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_rounds: u64,
    pub max_idle_rounds: u64,
    pub max_idle_seconds: u64,
    pub no_progress_event_interval: u64,
    pub progress_log_limit: usize,
    pub max_comments_per_event: usize,
    pub adapter_timeout_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_rounds: 40,
            max_idle_rounds: 6,
            max_idle_seconds: 900,
            no_progress_event_interval: 3,
            progress_log_limit: 50,
            max_comments_per_event: 2,
            adapter_timeout_secs: 600,
        }
    }
}

impl RunConfig {
    /// Load configuration with fallback chain.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            let mut config = Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()))?;
            config.validate()?;
            return Ok(config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let primary = config_dir.join("cohort").join("cohort.yml");
            if primary.exists() {
                match Self::load_from_file(&primary) {
                    Ok(mut config) => {
                        config.validate()?;
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary.display(), e);
                    }
                }
            }
        }

        let fallback = PathBuf::from("cohort.yml");
        if fallback.exists() {
            match Self::load_from_file(&fallback) {
                Ok(mut config) => {
                    config.validate()?;
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback.display(), e);
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        log::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Normalize and validate persona wiring: deduplicate the policy lists
    /// and fail closed on references to unknown personas or phases.
    pub fn validate(&mut self) -> Result<()> {
        self.persona_defaults.normalize(&self.personas)?;
        let global_order = self.persona_defaults.phase_order.clone();
        for task in &mut self.tasks {
            if let Some(policy) = &mut task.persona_policy {
                policy.normalize(&self.personas, &global_order, &format!("task {}", task.id))?;
            }
        }
        Ok(())
    }

    pub fn to_orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            lead_id: self.lead.clone(),
            teammate_ids: self.teammates.clone(),
            personas: self.personas.clone(),
            persona_defaults: self.persona_defaults.clone(),
            max_rounds: self.limits.max_rounds,
            max_idle_rounds: self.limits.max_idle_rounds,
            max_idle_seconds: self.limits.max_idle_seconds,
            no_progress_event_interval: self.limits.no_progress_event_interval,
            progress_log_limit: self.limits.progress_log_limit,
            max_comments_per_event: self.limits.max_comments_per_event,
            human_approval: self.human_approval,
            auto_approve_fallback: self.auto_approve_fallback,
            adapter_timeout_secs: self.limits.adapter_timeout_secs,
        }
    }
}
