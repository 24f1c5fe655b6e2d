//! Two-judge evaluation protocol with a tie-breaker.
//!
//! Two distinct models are drawn from the first two pools under a weighted
//! rotation, each scores the output independently, and a third model from
//! the tie-break pool decides when the first two disagree by at least the
//! configured threshold.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::engines::{EngineError, JudgeEngine, JudgeRequest, Judgement};
use crate::prompts::{
    build_judge_prompt, build_tie_breaker_prompt, JUDGE_SYSTEM, TIE_BREAKER_SYSTEM,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedJudge {
    pub model_id: String,
    pub weight: f64,
}

impl WeightedJudge {
    pub fn new(model_id: impl Into<String>, weight: f64) -> Self {
        Self {
            model_id: model_id.into(),
            weight,
        }
    }
}

/// The three judge pools: one per initial judge plus the tie-break pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgePools {
    pub primary: Vec<WeightedJudge>,
    pub secondary: Vec<WeightedJudge>,
    pub tiebreak: Vec<WeightedJudge>,
}

impl Default for JudgePools {
    fn default() -> Self {
        Self {
            primary: vec![
                WeightedJudge::new("llama-3.3-70b-versatile", 1.0),
                WeightedJudge::new("qwen/qwen3-32b", 1.0),
            ],
            secondary: vec![
                WeightedJudge::new("openai/gpt-oss-120b", 1.0),
                WeightedJudge::new("moonshotai/kimi-k2-instruct", 1.0),
            ],
            tiebreak: vec![
                WeightedJudge::new("meta-llama/llama-4-maverick-17b-128e-instruct", 1.0),
                WeightedJudge::new("llama-3.1-8b-instant", 1.0),
            ],
        }
    }
}

/// One judge's vote as recorded on the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVote {
    pub model: String,
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeInfo {
    pub judges: Vec<JudgeVote>,
    pub tie_breaker_used: bool,
    pub final_score: f64,
}

impl JudgeInfo {
    pub fn empty() -> Self {
        Self {
            judges: Vec::new(),
            tie_breaker_used: false,
            final_score: 0.0,
        }
    }
}

/// Normalize a judge score at the reward boundary: values above 1.0 are
/// taken to be on a 1-10 scale, then everything is clamped to [0, 1].
pub fn normalize_score(score: f64) -> f64 {
    let s = if score > 1.0 { score / 10.0 } else { score };
    s.clamp(0.0, 1.0)
}

pub struct JudgePanel {
    engine: Arc<dyn JudgeEngine>,
    pools: JudgePools,
    usage: Mutex<HashMap<String, u64>>,
    timeout: Duration,
    disagreement_threshold: f64,
}

impl JudgePanel {
    pub fn new(
        engine: Arc<dyn JudgeEngine>,
        pools: JudgePools,
        timeout: Duration,
        disagreement_threshold: f64,
    ) -> Self {
        Self {
            engine,
            pools,
            usage: Mutex::new(HashMap::new()),
            timeout,
            disagreement_threshold,
        }
    }

    /// Weighted draw from a pool, balanced by per-model usage so configured
    /// weights hold over time rather than per call.
    fn draw(&self, pool: &[WeightedJudge], exclude: &[&str], rng: &mut StdRng) -> Option<String> {
        let usage = self
            .usage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let candidates: Vec<(&WeightedJudge, f64)> = pool
            .iter()
            .filter(|j| !exclude.contains(&j.model_id.as_str()))
            .map(|j| {
                let uses = usage.get(&j.model_id).copied().unwrap_or(0);
                (j, j.weight / (1.0 + uses as f64))
            })
            .collect();
        drop(usage);

        let total: f64 = candidates.iter().map(|(_, w)| w).sum();
        if candidates.is_empty() || total <= 0.0 {
            return None;
        }
        let mut roll = rng.gen::<f64>() * total;
        let mut chosen = candidates.last().map(|(j, _)| j.model_id.clone());
        for (j, w) in &candidates {
            if roll < *w {
                chosen = Some(j.model_id.clone());
                break;
            }
            roll -= w;
        }
        if let Some(model) = &chosen {
            let mut usage = self
                .usage
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *usage.entry(model.clone()).or_insert(0) += 1;
        }
        chosen
    }

    async fn call_judge(&self, model: &str, system: &str, prompt: &str) -> Result<Judgement, EngineError> {
        let req = JudgeRequest {
            model_id: model,
            system,
            prompt,
        };
        match tokio::time::timeout(self.timeout, self.engine.judge(req)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.timeout)),
        }
    }

    /// Run the full protocol. Returns the AI score (None when every judge
    /// failed) and the recorded judge info.
    pub async fn evaluate(
        &self,
        task: &str,
        assertions: &[String],
        output: &str,
        rng: &mut StdRng,
    ) -> (Option<f64>, JudgeInfo) {
        let prompt = build_judge_prompt(task, assertions, output);

        let model1 = self.draw(&self.pools.primary, &[], rng);
        let exclude: Vec<&str> = model1.as_deref().into_iter().collect();
        let model2 = self.draw(&self.pools.secondary, &exclude, rng);

        let mut info = JudgeInfo::empty();
        let (r1, r2) = match (&model1, &model2) {
            (Some(m1), Some(m2)) => futures::join!(
                self.call_judge(m1, JUDGE_SYSTEM, &prompt),
                self.call_judge(m2, JUDGE_SYSTEM, &prompt)
            ),
            _ => {
                return (None, info);
            }
        };

        let vote1 = vote_from(model1.unwrap_or_default(), r1);
        let vote2 = vote_from(model2.unwrap_or_default(), r2);
        let s1 = vote1.score;
        let s2 = vote2.score;
        info.judges.push(vote1);
        info.judges.push(vote2);

        let ai = match (s1, s2) {
            (Some(a), Some(b)) if (a - b).abs() >= self.disagreement_threshold => {
                info.tie_breaker_used = true;
                let used: Vec<&str> = info.judges.iter().map(|v| v.model.as_str()).collect();
                match self.draw(&self.pools.tiebreak, &used, rng) {
                    Some(tb_model) => {
                        let tb_prompt = build_tie_breaker_prompt(
                            task,
                            assertions,
                            output,
                            (
                                info.judges[0].model.as_str(),
                                a,
                                info.judges[0].rationale.as_deref(),
                            ),
                            (
                                info.judges[1].model.as_str(),
                                b,
                                info.judges[1].rationale.as_deref(),
                            ),
                        );
                        let tb = self
                            .call_judge(&tb_model, TIE_BREAKER_SYSTEM, &tb_prompt)
                            .await;
                        let tb_vote = vote_from(tb_model, tb);
                        let tb_score = tb_vote.score;
                        info.judges.push(tb_vote);
                        // Tie-breaker failure falls back to the mean.
                        Some(tb_score.unwrap_or((a + b) / 2.0))
                    }
                    None => Some((a + b) / 2.0),
                }
            }
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };

        info.final_score = ai.unwrap_or(0.0);
        (ai, info)
    }
}

fn vote_from(model: String, result: Result<Judgement, EngineError>) -> JudgeVote {
    match result {
        Ok(j) => JudgeVote {
            model,
            score: Some(normalize_score(j.score)),
            rationale: j.rationale,
            error: None,
        },
        Err(e) => {
            tracing::warn!(model = %model, error = %e, "judge call failed");
            JudgeVote {
                model,
                score: None,
                rationale: None,
                error: Some(e.code().to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rand::SeedableRng;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn normalization_handles_ten_point_scales() {
        assert!((normalize_score(8.0) - 0.8).abs() < 1e-9);
        assert!((normalize_score(0.8) - 0.8).abs() < 1e-9);
        assert_eq!(normalize_score(-0.5), 0.0);
        assert_eq!(normalize_score(15.0), 1.0);
    }

    /// Scripted judge: returns queued scores in call order.
    struct ScriptedJudge {
        scores: Vec<f64>,
        calls: AtomicUsize,
    }

    impl ScriptedJudge {
        fn new(scores: Vec<f64>) -> Self {
            Self {
                scores,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JudgeEngine for ScriptedJudge {
        async fn judge(&self, _req: JudgeRequest<'_>) -> Result<Judgement, EngineError> {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.scores.get(idx) {
                Some(&score) => Ok(Judgement {
                    score,
                    rationale: None,
                    duration_ms: 5,
                }),
                None => Err(EngineError::failure("judge", "script exhausted", false)),
            }
        }
    }

    fn panel(scores: Vec<f64>) -> JudgePanel {
        JudgePanel::new(
            Arc::new(ScriptedJudge::new(scores)),
            JudgePools::default(),
            Duration::from_secs(5),
            0.3,
        )
    }

    #[tokio::test]
    async fn agreement_uses_the_mean() {
        let panel = panel(vec![0.8, 0.7]);
        let mut rng = StdRng::seed_from_u64(1);
        let (ai, info) = panel.evaluate("task", &[], "output", &mut rng).await;
        assert!((ai.unwrap() - 0.75).abs() < 1e-9);
        assert!(!info.tie_breaker_used);
        assert_eq!(info.judges.len(), 2);
    }

    #[tokio::test]
    async fn disagreement_invokes_tie_breaker_exactly_once() {
        // 0.80 vs 0.40 disagree by 0.4 >= 0.3; third call is the tie-breaker.
        let panel = panel(vec![0.80, 0.40, 0.55]);
        let mut rng = StdRng::seed_from_u64(1);
        let (ai, info) = panel.evaluate("task", &[], "output", &mut rng).await;
        assert!(info.tie_breaker_used);
        assert_eq!(info.judges.len(), 3);
        assert!((ai.unwrap() - 0.55).abs() < 1e-9);
        assert!((info.final_score - 0.55).abs() < 1e-9);
    }

    #[tokio::test]
    async fn single_failure_falls_back_to_survivor() {
        // Second call errors (script exhausted after one score).
        let panel = panel(vec![0.9]);
        let mut rng = StdRng::seed_from_u64(1);
        let (ai, info) = panel.evaluate("task", &[], "output", &mut rng).await;
        assert!((ai.unwrap() - 0.9).abs() < 1e-9);
        assert_eq!(info.judges.iter().filter(|v| v.error.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn total_failure_returns_none() {
        let panel = panel(vec![]);
        let mut rng = StdRng::seed_from_u64(1);
        let (ai, _info) = panel.evaluate("task", &[], "output", &mut rng).await;
        assert!(ai.is_none());
    }

    #[test]
    fn draw_respects_exclusions_and_balances_usage() {
        let panel = panel(vec![]);
        let mut rng = StdRng::seed_from_u64(7);
        let pool = vec![
            WeightedJudge::new("a", 1.0),
            WeightedJudge::new("b", 1.0),
        ];
        let first = panel.draw(&pool, &[], &mut rng).unwrap();
        let second = panel.draw(&pool, &[first.as_str()], &mut rng).unwrap();
        assert_ne!(first, second);
    }
}
