//! Golden Set evaluator: a deterministic KPI suite with pinned flags and
//! seeds, used to benchmark the system and to gate self-edits.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engines::{EngineError, EngineKind, EngineSet};
use crate::operators::{assemble_prompt, GatheredContext, Recipe};
use crate::reward::{RewardModel, VariantContext};
use crate::store::{MetaStore, NewGoldenResult, StoreError};

/// Subset selection bounds, mirroring the gating suite: at least one item
/// per task type, at least three types, at most five items.
const SUBSET_MAX_ITEMS: usize = 5;
const SUBSET_MIN_TYPES: usize = 3;

#[derive(Debug, Error)]
pub enum GoldenError {
    #[error("golden set is empty")]
    Empty,
    #[error("failed to load golden items: {0}")]
    Load(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoldenFlags {
    pub web: bool,
    pub rag_k: u32,
}

/// One deterministic benchmark item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenItem {
    pub id: String,
    pub task_type: String,
    pub task_class: String,
    pub task: String,
    #[serde(default)]
    pub assertions: Vec<String>,
    #[serde(default)]
    pub inputs: Option<serde_json::Value>,
    #[serde(default)]
    pub expected: Option<String>,
    pub seed: u64,
    #[serde(default)]
    pub flags: GoldenFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenItemResult {
    pub item_id: String,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub steps: i64,
    pub passed: bool,
}

/// Aggregate KPIs over one evaluation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenKpi {
    pub suite_run_id: String,
    pub model_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_index_hash: Option<String>,
    pub per_item: Vec<GoldenItemResult>,
    pub avg_total_reward: f64,
    pub avg_cost_penalty: f64,
    pub avg_steps: f64,
    pub pass_rate: f64,
}

/// Load golden items from a directory of JSON files, sorted by filename so
/// the suite order is stable.
pub fn load_items(dir: impl AsRef<Path>) -> Result<Vec<GoldenItem>, GoldenError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())
        .map_err(|e| GoldenError::Load(e.to_string()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();

    let mut items = Vec::new();
    for path in paths {
        let raw = std::fs::read_to_string(&path).map_err(|e| GoldenError::Load(e.to_string()))?;
        let item: GoldenItem = serde_json::from_str(&raw)
            .map_err(|e| GoldenError::Load(format!("{}: {e}", path.display())))?;
        items.push(item);
    }
    Ok(items)
}

/// Pick the gating subset: one item per task type until at least three
/// types are covered, capped at five items.
pub fn select_subset(items: &[GoldenItem]) -> Vec<&GoldenItem> {
    let mut subset: Vec<&GoldenItem> = Vec::new();
    let mut seen_types: Vec<&str> = Vec::new();
    for item in items {
        let ttype = item.task_type.as_str();
        if !seen_types.contains(&ttype) || subset.len() < SUBSET_MIN_TYPES {
            subset.push(item);
            if !seen_types.contains(&ttype) {
                seen_types.push(ttype);
            }
        }
        if subset.len() >= SUBSET_MAX_ITEMS && seen_types.len() >= SUBSET_MIN_TYPES {
            break;
        }
    }
    subset
}

/// Blake3 hash of a RAG index payload, recorded on artifacts.
pub fn hash_index_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub struct GoldenEvaluator {
    engines: EngineSet,
    reward: Arc<RewardModel>,
    store: MetaStore,
    model_id: String,
    rag_index_hash: Option<String>,
    generation_timeout: Duration,
}

impl GoldenEvaluator {
    pub fn new(
        engines: EngineSet,
        reward: Arc<RewardModel>,
        store: MetaStore,
        model_id: impl Into<String>,
        rag_index_hash: Option<String>,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            engines,
            reward,
            store,
            model_id: model_id.into(),
            rag_index_hash,
            generation_timeout,
        }
    }

    /// Run every item with pinned flags and aggregate. Per-item results are
    /// persisted as they complete; an engine failure zeroes the item rather
    /// than aborting the suite.
    pub async fn evaluate(&self, items: &[&GoldenItem]) -> Result<GoldenKpi, GoldenError> {
        if items.is_empty() {
            return Err(GoldenError::Empty);
        }
        let suite_run_id = uuid::Uuid::new_v4().to_string();
        let mut per_item = Vec::with_capacity(items.len());

        for item in items {
            let result = self.evaluate_item(item).await;
            self.store
                .insert_golden_result(NewGoldenResult {
                    suite_run_id: suite_run_id.clone(),
                    item_id: result.item_id.clone(),
                    outcome_reward: result.outcome_reward,
                    process_reward: result.process_reward,
                    cost_penalty: result.cost_penalty,
                    total_reward: result.total_reward,
                    steps: result.steps,
                    passed: result.passed,
                    model_id: self.model_id.clone(),
                    rag_index_hash: self.rag_index_hash.clone(),
                })
                .await?;
            per_item.push(result);
        }

        let n = per_item.len() as f64;
        let avg_total_reward = per_item.iter().map(|r| r.total_reward).sum::<f64>() / n;
        let avg_cost_penalty = per_item.iter().map(|r| r.cost_penalty).sum::<f64>() / n;
        let avg_steps = per_item.iter().map(|r| r.steps as f64).sum::<f64>() / n;
        let pass_rate = per_item.iter().filter(|r| r.passed).count() as f64 / n;

        Ok(GoldenKpi {
            suite_run_id,
            model_id: self.model_id.clone(),
            rag_index_hash: self.rag_index_hash.clone(),
            per_item,
            avg_total_reward,
            avg_cost_penalty,
            avg_steps,
            pass_rate,
        })
    }

    async fn evaluate_item(&self, item: &GoldenItem) -> GoldenItemResult {
        // Pinned flags: no web, fixed rag depth, the local engine.
        let recipe = Recipe {
            rag_k: item.flags.rag_k,
            use_web: false,
            engine: EngineKind::Local,
            ..Recipe::default()
        };
        let mut rng = StdRng::seed_from_u64(item.seed);

        let mut gathered = GatheredContext::default();
        if recipe.rag_k > 0 {
            if let Some(rag) = &self.engines.rag {
                if let Ok(snippets) = rag.retrieve(&item.task, recipe.rag_k as usize).await {
                    gathered.rag = snippets;
                }
            }
        }
        let prompt = assemble_prompt(&recipe, &item.task, &gathered);

        let failed = |steps: i64| GoldenItemResult {
            item_id: item.id.clone(),
            outcome_reward: 0.0,
            process_reward: 0.0,
            cost_penalty: 0.0,
            total_reward: 0.0,
            steps,
            passed: false,
        };

        let engine = self.engines.generator(EngineKind::Local);
        let generation =
            match tokio::time::timeout(self.generation_timeout, engine.generate(&recipe, &prompt))
                .await
            {
                Ok(Ok(g)) => g,
                Ok(Err(e)) => {
                    tracing::warn!(item = %item.id, error = %e, "golden generation failed");
                    return failed(1);
                }
                Err(_) => {
                    tracing::warn!(item = %item.id, "golden generation timed out");
                    return failed(1);
                }
            };

        let ctx = VariantContext {
            task: &item.task,
            assertions: &item.assertions,
            expected: item.expected.as_deref(),
            output: &generation.output,
            duration_ms: generation.duration_ms,
            tool_calls: 0,
            baseline_cost: crate::reward::default_baseline_for(&item.task),
        };
        let eval_started = std::time::Instant::now();
        let scored = match self.reward.score(&ctx, &mut rng).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(item = %item.id, error = %e, "golden scoring failed");
                return failed(2);
            }
        };
        let eval_ms = eval_started.elapsed().as_millis() as f64;

        // Fold evaluation latency into the cost penalty, keeping the
        // total = alpha*outcome + beta*process + gamma*penalty identity.
        let cfg = self.reward.config();
        let eval_extra = (eval_ms / ctx.baseline_cost.max(1.0)).min(1.0) * 0.1;
        let cost_penalty = scored.cost_penalty + eval_extra;
        let total_reward = scored.total + cfg.gamma_cost * eval_extra;

        let haystack = generation.output.to_ascii_lowercase();
        let passed = item
            .assertions
            .iter()
            .all(|a| haystack.contains(&a.to_ascii_lowercase()));

        let steps = 1 + scored.judge_info.judges.len() as i64;
        GoldenItemResult {
            item_id: item.id.clone(),
            outcome_reward: scored.outcome,
            process_reward: scored.process,
            cost_penalty,
            total_reward,
            steps,
            passed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, task_type: &str) -> GoldenItem {
        GoldenItem {
            id: id.to_string(),
            task_type: task_type.to_string(),
            task_class: "code".to_string(),
            task: "task".to_string(),
            assertions: vec![],
            inputs: None,
            expected: None,
            seed: 1,
            flags: GoldenFlags::default(),
        }
    }

    #[test]
    fn subset_covers_types_within_caps() {
        let items = vec![
            item("a", "code"),
            item("b", "code"),
            item("c", "analysis"),
            item("d", "design"),
            item("e", "design"),
            item("f", "debug"),
        ];
        let subset = select_subset(&items);
        assert!(subset.len() <= SUBSET_MAX_ITEMS);
        let mut types: Vec<&str> = subset.iter().map(|i| i.task_type.as_str()).collect();
        types.sort();
        types.dedup();
        assert!(types.len() >= SUBSET_MIN_TYPES);
    }

    #[test]
    fn subset_of_homogeneous_set_stays_small() {
        let items = vec![item("a", "code"), item("b", "code"), item("c", "code")];
        let subset = select_subset(&items);
        assert_eq!(subset.len(), 3);
    }

    #[test]
    fn golden_item_parses_with_defaults() {
        let raw = r#"{"id":"g1","task_type":"code","task_class":"code","task":"write","seed":7}"#;
        let item: GoldenItem = serde_json::from_str(raw).unwrap();
        assert_eq!(item.seed, 7);
        assert!(!item.flags.web);
        assert!(item.assertions.is_empty());
    }

    #[test]
    fn index_hash_is_stable() {
        assert_eq!(hash_index_bytes(b"abc"), hash_index_bytes(b"abc"));
        assert_ne!(hash_index_bytes(b"abc"), hash_index_bytes(b"abd"));
    }
}
