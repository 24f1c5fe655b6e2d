//! The gated self-edit cycle: criticize → edit → test → decide.
//!
//! A patch is accepted only when unit tests pass, the golden suite improves
//! by at least the reward threshold, cost does not regress past its ratio
//! cap, and the pass rate stays above target. Anything else rolls back to
//! the pre-patch commit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CodeLoopConfig;
use crate::engines::{EditsPackage, EngineError, FileEdit, Patcher, TestHarness};
use crate::golden::{select_subset, GoldenError, GoldenEvaluator, GoldenItem, GoldenKpi};
use crate::store::{CodeLoopDecision, CodeLoopMode, MetaStore, StoreError};

#[derive(Debug, Error)]
pub enum CodeLoopError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("golden error: {0}")]
    Golden(#[from] GoldenError),
    #[error("patcher error: {0}")]
    Patcher(#[from] EngineError),
    #[error("code loop requires a patcher and a test harness")]
    MissingCollaborators,
    #[error("artifact encode error: {0}")]
    Encode(String),
    #[error("code loop timed out")]
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSummary {
    pub files: Vec<String>,
    pub diff: String,
    pub edit_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestsSummary {
    pub passed: bool,
    pub failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenSummary {
    pub avg_total_reward: f64,
    pub avg_cost_penalty: f64,
    pub pass_rate: f64,
}

impl From<&GoldenKpi> for GoldenSummary {
    fn from(kpi: &GoldenKpi) -> Self {
        Self {
            avg_total_reward: kpi.avg_total_reward,
            avg_cost_penalty: kpi.avg_cost_penalty,
            pass_rate: kpi.pass_rate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub delta_reward_min: f64,
    pub cost_ratio_max: f64,
    pub golden_pass_rate_target: f64,
}

/// The persisted record of one gated cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeLoopArtifact {
    pub loop_id: String,
    pub source_run_id: i64,
    pub mode: CodeLoopMode,
    pub critic: String,
    pub patch: PatchSummary,
    pub tests: TestsSummary,
    pub golden_before: GoldenSummary,
    pub golden_after: GoldenSummary,
    pub thresholds: Thresholds,
    pub decision: CodeLoopDecision,
    pub reasons: Vec<String>,
}

/// Reward-tuning multipliers the critic is allowed to nudge.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TuningKnobs {
    pub process_multiplier: f64,
    pub cost_multiplier: f64,
}

impl Default for TuningKnobs {
    fn default() -> Self {
        Self {
            process_multiplier: 1.0,
            cost_multiplier: 1.0,
        }
    }
}

/// Critic: nudge the tuning multipliers based on where the suite sits.
/// Weak rewards push the process weight up; otherwise cost pressure eases.
pub fn propose_tuning(before: &GoldenSummary, current: TuningKnobs) -> (TuningKnobs, String) {
    if before.avg_total_reward < 0.35 {
        let next = TuningKnobs {
            process_multiplier: (current.process_multiplier + 0.05).min(1.5),
            ..current
        };
        (
            next,
            "raise process multiplier: golden rewards below 0.35".to_string(),
        )
    } else {
        let next = TuningKnobs {
            cost_multiplier: (current.cost_multiplier - 0.05).max(0.5),
            ..current
        };
        (
            next,
            "lower cost multiplier: golden rewards healthy, trim cost pressure".to_string(),
        )
    }
}

fn tuning_edits(current: TuningKnobs, next: TuningKnobs) -> EditsPackage {
    let before = serde_json::to_string(&current).unwrap_or_default();
    let after = serde_json::to_string(&next).unwrap_or_default();
    EditsPackage {
        files: vec![FileEdit {
            path: "tuning/reward.json".to_string(),
            diff: format!("- {before}\n+ {after}"),
            lines_changed: 2,
        }],
        summary: "adjust reward tuning multipliers".to_string(),
    }
}

pub struct CodeLoopGate {
    store: MetaStore,
    patcher: Arc<dyn Patcher>,
    tests: Arc<dyn TestHarness>,
    cfg: CodeLoopConfig,
}

impl CodeLoopGate {
    pub fn new(
        store: MetaStore,
        patcher: Arc<dyn Patcher>,
        tests: Arc<dyn TestHarness>,
        cfg: CodeLoopConfig,
    ) -> Self {
        Self {
            store,
            patcher,
            tests,
            cfg,
        }
    }

    /// Run one gated cycle. Idempotent per source run: a completed loop for
    /// the same run is returned as-is.
    pub async fn run(
        &self,
        source_run_id: i64,
        mode: CodeLoopMode,
        golden: &GoldenEvaluator,
        items: &[GoldenItem],
        current: TuningKnobs,
    ) -> Result<CodeLoopArtifact, CodeLoopError> {
        if let Some(existing) = self.store.get_code_loop_by_source(source_run_id).await? {
            let artifact: CodeLoopArtifact = serde_json::from_str(&existing.artifact_json)
                .map_err(|e| CodeLoopError::Encode(e.to_string()))?;
            return Ok(artifact);
        }

        let loop_id = uuid::Uuid::new_v4().to_string();
        let subset = select_subset(items);
        let before_kpi = golden.evaluate(&subset).await?;
        let before = GoldenSummary::from(&before_kpi);

        let (next, critic) = propose_tuning(&before, current);
        let edits = tuning_edits(current, next);

        let thresholds = Thresholds {
            delta_reward_min: self.cfg.delta_reward_min,
            cost_ratio_max: self.cfg.cost_ratio_max,
            golden_pass_rate_target: self.cfg.golden_pass_rate_target,
        };

        if let Some(violation) = self.validate_patch(&edits) {
            let artifact = CodeLoopArtifact {
                loop_id,
                source_run_id,
                mode,
                critic,
                patch: patch_summary(&edits, 0),
                tests: TestsSummary {
                    passed: false,
                    failures: 0,
                },
                golden_before: before.clone(),
                golden_after: before,
                thresholds,
                decision: CodeLoopDecision::Reject,
                reasons: vec![violation],
            };
            self.persist(&artifact).await?;
            return Ok(artifact);
        }

        let head = self.patcher.head().await?;
        let mut applied_files = edits.files.iter().map(|f| f.path.clone()).collect();
        let mut diff: String = edits
            .files
            .iter()
            .map(|f| f.diff.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut edit_count = edits.files.len() as u32;

        if mode == CodeLoopMode::Live {
            let outcome = self.patcher.apply(&edits).await?;
            applied_files = outcome.touched_files;
            diff = outcome.diffs.join("\n");
            edit_count = applied_files.len() as u32;
        }

        let test_report = self.tests.run_tests().await?;
        let after_kpi = golden.evaluate(&subset).await?;
        let after = GoldenSummary::from(&after_kpi);

        let reasons = gate_reasons(test_report.passed, &before, &after, &self.cfg);
        let accepted = reasons.is_empty();
        let decision = if accepted {
            CodeLoopDecision::Commit
        } else if mode == CodeLoopMode::Live {
            self.patcher.rollback(&head).await?;
            CodeLoopDecision::Rollback
        } else {
            CodeLoopDecision::Reject
        };

        let artifact = CodeLoopArtifact {
            loop_id,
            source_run_id,
            mode,
            critic,
            patch: PatchSummary {
                files: applied_files,
                diff,
                edit_count,
            },
            tests: TestsSummary {
                passed: test_report.passed,
                failures: test_report.failures,
            },
            golden_before: before,
            golden_after: after,
            thresholds,
            decision,
            reasons,
        };
        self.persist(&artifact).await?;
        Ok(artifact)
    }

    /// Hard caps and the path allowlist. Returns the violation, if any.
    fn validate_patch(&self, edits: &EditsPackage) -> Option<String> {
        if edits.files.len() as u32 > self.cfg.max_files {
            return Some(format!(
                "patch touches {} files, cap is {}",
                edits.files.len(),
                self.cfg.max_files
            ));
        }
        if edits.files.len() as u32 > self.cfg.max_patches {
            return Some(format!(
                "patch count {} exceeds cap {}",
                edits.files.len(),
                self.cfg.max_patches
            ));
        }
        if edits.total_lines() > self.cfg.max_loc {
            return Some(format!(
                "patch changes {} lines, cap is {}",
                edits.total_lines(),
                self.cfg.max_loc
            ));
        }
        for file in &edits.files {
            let allowed = self
                .cfg
                .allowlist
                .iter()
                .any(|prefix| file.path.starts_with(prefix.as_str()));
            if !allowed {
                return Some(format!("path {} is outside the allowlist", file.path));
            }
        }
        None
    }

    async fn persist(&self, artifact: &CodeLoopArtifact) -> Result<(), CodeLoopError> {
        let json =
            serde_json::to_string(artifact).map_err(|e| CodeLoopError::Encode(e.to_string()))?;
        // Artifact schema validity is itself a gate: a payload that cannot
        // round-trip is never recorded as committed.
        serde_json::from_str::<CodeLoopArtifact>(&json)
            .map_err(|e| CodeLoopError::Encode(e.to_string()))?;
        self.store
            .insert_code_loop(
                &artifact.loop_id,
                artifact.source_run_id,
                artifact.mode,
                artifact.decision,
                &json,
            )
            .await?;
        Ok(())
    }
}

/// Acceptance gates. Empty result means the patch is committed; any entry
/// names a failed gate.
pub fn gate_reasons(
    tests_passed: bool,
    before: &GoldenSummary,
    after: &GoldenSummary,
    cfg: &CodeLoopConfig,
) -> Vec<String> {
    let delta = after.avg_total_reward - before.avg_total_reward;
    let cost_ok = if before.avg_cost_penalty > 0.0 {
        after.avg_cost_penalty <= cfg.cost_ratio_max * before.avg_cost_penalty
    } else {
        after.avg_cost_penalty <= before.avg_cost_penalty.max(0.0)
    };
    let pass_rate_ok = after.pass_rate >= cfg.golden_pass_rate_target;

    let mut reasons = Vec::new();
    if !tests_passed {
        reasons.push("tests_failed".to_string());
    }
    if delta < cfg.delta_reward_min {
        reasons.push("delta_too_small".to_string());
    }
    if !cost_ok {
        reasons.push("cost_too_high".to_string());
    }
    if !pass_rate_ok {
        reasons.push("pass_rate_low".to_string());
    }
    reasons
}

fn patch_summary(edits: &EditsPackage, edit_count: u32) -> PatchSummary {
    PatchSummary {
        files: edits.files.iter().map(|f| f.path.clone()).collect(),
        diff: edits
            .files
            .iter()
            .map(|f| f.diff.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        edit_count,
    }
}
