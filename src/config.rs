//! Typed configuration for the engine core.
//!
//! Every recognized key is a struct field with its default; unknown keys in
//! loaded config are an error (`deny_unknown_fields`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid run params: {0}")]
    InvalidRun(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

/// Run-budget and collaborator deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RunConfig {
    /// Default number of iterations when the caller omits `n`.
    pub n_default: u32,
    /// Wall-clock cap for a meta-run; `None` means unlimited.
    pub run_timeout_s: Option<u64>,
    pub generation_timeout_s: u64,
    pub judge_timeout_s: u64,
    /// Meta-run starts allowed per client per sliding hour.
    pub runs_max_per_hour: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_default: 16,
            run_timeout_s: None,
            generation_timeout_s: 180,
            judge_timeout_s: 60,
            runs_max_per_hour: 30,
        }
    }
}

impl RunConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_s)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    EpsilonGreedy,
    Ucb1,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EpsilonGreedy => "epsilon_greedy",
            Self::Ucb1 => "ucb1",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "epsilon_greedy" => Self::EpsilonGreedy,
            _ => Self::Ucb1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BanditConfig {
    pub strategy: Strategy,
    /// Exploration rate for ε-greedy. When unset by the caller the
    /// effective value depends on stratified exploration (0.6 off / 0.3 on).
    pub epsilon: Option<f64>,
    pub ucb_c: f64,
    pub warm_start_min_pulls: i64,
    pub stratified_exploration: bool,
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Ucb1,
            epsilon: None,
            ucb_c: 2.0,
            warm_start_min_pulls: 1,
            stratified_exploration: true,
        }
    }
}

impl BanditConfig {
    pub fn effective_epsilon(&self) -> f64 {
        match self.epsilon {
            Some(e) => e,
            None if self.stratified_exploration => 0.3,
            None => 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RewardConfig {
    pub alpha: f64,
    pub beta_process: f64,
    pub gamma_cost: f64,
    /// Weight of the AI-judge blend in the outcome reward.
    pub ai_weight: f64,
    /// Weight of semantic similarity in the outcome reward.
    pub semantic_weight: f64,
    pub judge_disagreement_threshold: f64,
    /// Tuning multipliers adjusted by the code-loop critic.
    pub process_multiplier: f64,
    pub cost_multiplier: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta_process: 0.2,
            gamma_cost: -0.0005,
            ai_weight: 0.9,
            semantic_weight: 0.1,
            judge_disagreement_threshold: 0.3,
            process_multiplier: 1.0,
            cost_multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PromotionConfig {
    pub delta_reward_min: f64,
    pub cost_ratio_max: f64,
    pub auto_approve_delta: f64,
    pub auto_approve_cost_ratio: f64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            delta_reward_min: 0.05,
            cost_ratio_max: 0.9,
            auto_approve_delta: 0.2,
            auto_approve_cost_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CodeLoopConfig {
    pub max_per_hour: u32,
    pub timeout_s: u64,
    pub max_loc: u32,
    pub max_patches: u32,
    pub max_files: u32,
    pub delta_reward_min: f64,
    pub cost_ratio_max: f64,
    pub golden_pass_rate_target: f64,
    /// Path prefixes a patch may touch.
    pub allowlist: Vec<String>,
}

impl Default for CodeLoopConfig {
    fn default() -> Self {
        Self {
            max_per_hour: 3,
            timeout_s: 600,
            max_loc: 50,
            max_patches: 3,
            max_files: 5,
            delta_reward_min: 0.05,
            cost_ratio_max: 0.9,
            golden_pass_rate_target: 0.80,
            allowlist: vec![
                "tuning/".to_string(),
                "golden/".to_string(),
                "tests/".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EventBusConfig {
    pub queue_size: usize,
    pub keep_alive_interval_s: u64,
    pub replay_grace_s: u64,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            keep_alive_interval_s: 15,
            replay_grace_s: 60,
        }
    }
}

impl EventBusConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_s)
    }

    pub fn replay_grace(&self) -> Duration {
        Duration::from_secs(self.replay_grace_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AnalyticsConfig {
    pub snapshot_ttl_s: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self { snapshot_ttl_s: 60 }
    }
}

/// Root configuration record for the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub run: RunConfig,
    pub bandit: BanditConfig,
    pub reward: RewardConfig,
    pub promotion: PromotionConfig,
    pub code_loop: CodeLoopConfig,
    pub events: EventBusConfig,
    pub analytics: AnalyticsConfig,
}

impl CoreConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(eps) = self.bandit.epsilon {
            if !(0.0..=1.0).contains(&eps) {
                return Err(ConfigError::InvalidValue(format!(
                    "epsilon must be in [0,1], got {eps}"
                )));
            }
        }
        if self.bandit.ucb_c < 0.0 || !self.bandit.ucb_c.is_finite() {
            return Err(ConfigError::InvalidValue(
                "ucb_c must be finite and >= 0".to_string(),
            ));
        }
        if self.run.n_default == 0 {
            return Err(ConfigError::InvalidValue(
                "n_default must be >= 1".to_string(),
            ));
        }
        for (name, v) in [
            ("alpha", self.reward.alpha),
            ("beta_process", self.reward.beta_process),
            ("gamma_cost", self.reward.gamma_cost),
            ("ai_weight", self.reward.ai_weight),
            ("semantic_weight", self.reward.semantic_weight),
        ] {
            if !v.is_finite() {
                return Err(ConfigError::InvalidValue(format!("{name} must be finite")));
            }
        }
        if !(0.0..=1.0).contains(&self.code_loop.golden_pass_rate_target) {
            return Err(ConfigError::InvalidValue(
                "golden_pass_rate_target must be in [0,1]".to_string(),
            ));
        }
        Ok(())
    }
}
