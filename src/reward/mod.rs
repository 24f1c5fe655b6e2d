//! The total-reward model: outcome (AI judges + semantic similarity),
//! process heuristics, and cost penalty blended into one scalar the bandit
//! learns from.
//!
//! Non-finite values never leave this module: a score that cannot be
//! computed finitely is an error and the iteration is treated as failed.

pub mod cost;
pub mod judge;
pub mod process;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RewardConfig;
use crate::engines::{Embedder, JudgeEngine};

pub use cost::{cost_penalty, default_baseline_for, estimate_tokens, raw_cost, CostWeights};
pub use judge::{normalize_score, JudgeInfo, JudgePanel, JudgePools, JudgeVote, WeightedJudge};
pub use process::process_reward;

#[derive(Debug, Error)]
pub enum RewardError {
    /// Neither the judges nor the embedder produced a usable outcome signal.
    #[error("no outcome signal: all judges and the embedder failed")]
    NoSignal,
    /// A component came out NaN or infinite.
    #[error("non-finite reward component: {0}")]
    NonFinite(&'static str),
}

/// Everything the reward model needs to know about one variant.
#[derive(Debug, Clone)]
pub struct VariantContext<'a> {
    pub task: &'a str,
    pub assertions: &'a [String],
    /// Optional expected reference attached to the task (golden items).
    pub expected: Option<&'a str>,
    pub output: &'a str,
    pub duration_ms: u64,
    pub tool_calls: u32,
    /// Rolling raw-cost baseline for the task class.
    pub baseline_cost: f64,
}

/// Component scores plus the blended total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredReward {
    pub outcome: f64,
    pub process: f64,
    pub cost_penalty: f64,
    pub total: f64,
    /// Raw cost in millisecond-equivalents, kept for the rolling baseline.
    pub raw_cost: f64,
    pub judge_info: JudgeInfo,
}

pub struct RewardModel {
    panel: JudgePanel,
    embedder: Arc<dyn Embedder>,
    cfg: RewardConfig,
    weights: CostWeights,
}

impl RewardModel {
    pub fn new(
        judge_engine: Arc<dyn JudgeEngine>,
        embedder: Arc<dyn Embedder>,
        pools: JudgePools,
        cfg: RewardConfig,
        judge_timeout: Duration,
    ) -> Self {
        let panel = JudgePanel::new(
            judge_engine,
            pools,
            judge_timeout,
            cfg.judge_disagreement_threshold,
        );
        Self {
            panel,
            embedder,
            cfg,
            weights: CostWeights::default(),
        }
    }

    pub fn config(&self) -> &RewardConfig {
        &self.cfg
    }

    /// Score one variant. The caller owns the PRNG (judge pool draws are
    /// part of the run's reproducible randomness).
    pub async fn score(
        &self,
        ctx: &VariantContext<'_>,
        rng: &mut StdRng,
    ) -> Result<ScoredReward, RewardError> {
        let (ai, judge_info) = self
            .panel
            .evaluate(ctx.task, ctx.assertions, ctx.output, rng)
            .await;
        let semantic = self.semantic_similarity(ctx).await;

        let outcome = match (ai, semantic) {
            (Some(ai), Some(sem)) => self.cfg.ai_weight * ai + self.cfg.semantic_weight * sem,
            (Some(ai), None) => ai,
            (None, Some(sem)) => sem,
            (None, None) => return Err(RewardError::NoSignal),
        };

        let process = process_reward(ctx.output, ctx.assertions) * self.cfg.process_multiplier;

        let tokens = estimate_tokens(ctx.output) + estimate_tokens(ctx.task);
        let raw = raw_cost(&self.weights, ctx.duration_ms, ctx.tool_calls, tokens);
        let penalty = cost_penalty(raw, ctx.baseline_cost) * self.cfg.cost_multiplier;

        let total =
            self.cfg.alpha * outcome + self.cfg.beta_process * process + self.cfg.gamma_cost * penalty;

        for (name, v) in [
            ("outcome", outcome),
            ("process", process),
            ("cost_penalty", penalty),
            ("total", total),
        ] {
            if !v.is_finite() {
                return Err(RewardError::NonFinite(name));
            }
        }

        Ok(ScoredReward {
            outcome,
            process,
            cost_penalty: penalty,
            total,
            raw_cost: raw,
            judge_info,
        })
    }

    /// Cosine similarity between the output embedding and the task (plus
    /// any expected reference), clipped to [0, 1]. None when embedding
    /// fails; the outcome then rests on the judges alone.
    async fn semantic_similarity(&self, ctx: &VariantContext<'_>) -> Option<f64> {
        let reference = match ctx.expected {
            Some(expected) => format!("{}\n{expected}", ctx.task),
            None => ctx.task.to_string(),
        };
        // Long outputs are truncated for embedding; similarity saturates
        // well before that.
        let output_head: String = ctx.output.chars().take(1500).collect();

        let out_vec = match self.embedder.embed(&output_head).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "output embedding failed");
                return None;
            }
        };
        let ref_vec = match self.embedder.embed(&reference).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "reference embedding failed");
                return None;
            }
        };
        let sim = cosine(&out_vec, &ref_vec)?;
        Some(sim.clamp(0.0, 1.0))
    }
}

/// Cosine similarity; None for mismatched or zero-magnitude vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        na += (*x as f64) * (*x as f64);
        nb += (*y as f64) * (*y as f64);
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom <= 0.0 {
        return None;
    }
    Some(dot / denom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{EngineError, JudgeRequest, Judgement};
    use async_trait::async_trait;
    use rand::SeedableRng;

    struct FixedJudge(f64);

    #[async_trait]
    impl JudgeEngine for FixedJudge {
        async fn judge(&self, _req: JudgeRequest<'_>) -> Result<Judgement, EngineError> {
            Ok(Judgement {
                score: self.0,
                rationale: None,
                duration_ms: 1,
            })
        }
    }

    struct FailingJudge;

    #[async_trait]
    impl JudgeEngine for FailingJudge {
        async fn judge(&self, _req: JudgeRequest<'_>) -> Result<Judgement, EngineError> {
            Err(EngineError::failure("judge", "down", true))
        }
    }

    /// Embeds text as a unit direction depending on shared vocabulary.
    struct WordEmbedder;

    #[async_trait]
    impl Embedder for WordEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
            let mut v = vec![0.0f32; 16];
            for word in text.split_whitespace() {
                let h = word
                    .bytes()
                    .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                v[h % 16] += 1.0;
            }
            Ok(v)
        }
    }

    struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
            Err(EngineError::failure("embed", "down", false))
        }
    }

    fn ctx<'a>(task: &'a str, output: &'a str) -> VariantContext<'a> {
        VariantContext {
            task,
            assertions: &[],
            expected: None,
            output,
            duration_ms: 1000,
            tool_calls: 0,
            baseline_cost: 50_000.0,
        }
    }

    #[tokio::test]
    async fn total_is_the_weighted_blend() {
        let model = RewardModel::new(
            Arc::new(FixedJudge(0.8)),
            Arc::new(WordEmbedder),
            JudgePools::default(),
            RewardConfig::default(),
            Duration::from_secs(5),
        );
        let mut rng = StdRng::seed_from_u64(11);
        let c = ctx("sort the list", "sort the list ascending");
        let scored = model.score(&c, &mut rng).await.unwrap();
        let cfg = RewardConfig::default();
        let expected = cfg.alpha * scored.outcome
            + cfg.beta_process * scored.process
            + cfg.gamma_cost * scored.cost_penalty;
        assert!((scored.total - expected).abs() < 1e-6);
        assert!((0.0..=1.0).contains(&scored.outcome));
    }

    #[tokio::test]
    async fn judge_failure_degrades_to_semantic_only() {
        let model = RewardModel::new(
            Arc::new(FailingJudge),
            Arc::new(WordEmbedder),
            JudgePools::default(),
            RewardConfig::default(),
            Duration::from_secs(5),
        );
        let mut rng = StdRng::seed_from_u64(11);
        let c = ctx("sort the list", "sort the list ascending");
        let scored = model.score(&c, &mut rng).await.unwrap();
        // Identical shared words push semantic similarity high.
        assert!(scored.outcome > 0.5);
        assert!(scored.judge_info.judges.iter().all(|v| v.error.is_some()));
    }

    #[tokio::test]
    async fn no_signal_at_all_is_an_error() {
        let model = RewardModel::new(
            Arc::new(FailingJudge),
            Arc::new(FailingEmbedder),
            JudgePools::default(),
            RewardConfig::default(),
            Duration::from_secs(5),
        );
        let mut rng = StdRng::seed_from_u64(11);
        let c = ctx("task", "output");
        assert!(matches!(
            model.score(&c, &mut rng).await,
            Err(RewardError::NoSignal)
        ));
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]).unwrap() - 1.0).abs() < 1e-9);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).unwrap().abs() < 1e-9);
        assert!(cosine(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine(&[1.0], &[1.0, 2.0]).is_none());
    }
}
