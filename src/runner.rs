//! The meta-evolution run loop: select an operator, build a recipe,
//! generate, score, persist, publish events. One task owns one run's state
//! from start to terminal status.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bandit::{self, ArmSnapshot};
use crate::config::{BanditConfig, PromotionConfig, RunConfig};
use crate::engines::{EngineError, EngineSet, Generation};
use crate::events::{EventBus, RewardBreakdown, RunEvent};
use crate::jobs::CancelToken;
use crate::operators::{self, GatheredContext, Operator, OperatorContext, Recipe};
use crate::reward::{default_baseline_for, RewardModel, ScoredReward, VariantContext};
use crate::store::{
    with_retry, MetaStore, NewVariant, PromotionOutcome, RunRow, RunStatus, StoreError,
};

/// How many recent variants feed the rolling cost baseline.
const BASELINE_WINDOW: i64 = 20;

pub(crate) struct RunWorker {
    pub run: RunRow,
    pub store: MetaStore,
    pub bus: Arc<EventBus>,
    pub engines: EngineSet,
    pub reward: Arc<RewardModel>,
    pub run_cfg: RunConfig,
    pub bandit_cfg: BanditConfig,
    pub promotion_cfg: PromotionConfig,
    pub cancel: Arc<CancelToken>,
}

enum IterationOutcome {
    Saved(i64),
    /// The run ended underneath us; the in-flight iteration is abandoned.
    Abandoned,
}

impl RunWorker {
    /// Drive the run to a terminal status. Every exit path persists the
    /// terminal state and publishes a terminal event.
    pub async fn run(mut self) {
        let run_id = self.run.id;
        match self.run_loop().await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(run_id, error = %e, "run failed on storage");
                let message = e.to_string();
                let _ = self
                    .store
                    .finish_run(run_id, RunStatus::Error, Some(message.clone()))
                    .await;
                self.bus.publish(run_id, RunEvent::Error { message });
            }
        }
    }

    async fn run_loop(&mut self) -> Result<(), StoreError> {
        let run_id = self.run.id;
        let task_class = self.run.normalized_task_class.clone();
        let mut rng = StdRng::seed_from_u64(self.run.seed);

        let mut arms: HashMap<Operator, ArmSnapshot> =
            self.store.arm_snapshots(&task_class).await?;
        let mut run_pulls: HashMap<Operator, u32> = HashMap::new();
        let allowed = operators::Operator::allowed(&self.run.framework_mask);

        // Baseline recipe: the stored best for the task class, else default.
        let base_recipe = match self.store.take_top_recipe(&task_class).await? {
            Some(row) => row.recipe,
            None => Recipe::default(),
        };
        let baseline_cost = self
            .store
            .rolling_baseline_cost(&task_class, BASELINE_WINDOW)
            .await?
            .unwrap_or_else(|| default_baseline_for(&self.run.task));

        let display_class = self.run.task_class.clone();
        let memory_k = self.run.memory_k as u32;
        let rag_k = self.run.rag_k as u32;

        let mut best: Option<(i64, f64)> = None;
        let mut baseline_recorded = false;

        for i in 0..self.run.n_total as usize {
            if self.cancel.is_cancelled() {
                return self.finish_cancelled().await;
            }

            let Some(op) = bandit::select(&allowed, &arms, &run_pulls, &self.bandit_cfg, &mut rng)
            else {
                return self.finish_with_error("no operators allowed by mask").await;
            };
            self.bus
                .publish(run_id, RunEvent::IterSelected { i, operator: op });

            let op_ctx = OperatorContext {
                task_class: &display_class,
                memory_k,
                rag_k,
            };
            let recipe = operators::apply(op, &base_recipe, &op_ctx, &mut rng);
            let gathered = self.gather_context(&recipe).await;
            let prompt = operators::assemble_prompt(&recipe, &self.run.task, &gathered);

            self.bus.publish(run_id, RunEvent::IterGenStart { i });
            let generation = match self.generate(&recipe, &prompt).await {
                Ok(g) => g,
                Err(e) => {
                    // Collaborator failure: record and move on. The arm is
                    // not updated, there was no reward observation.
                    self.bus.publish(
                        run_id,
                        RunEvent::IterError {
                            i,
                            reason: e.code().to_string(),
                        },
                    );
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                // In-flight iteration abandoned before scoring.
                self.bus.publish(
                    run_id,
                    RunEvent::IterError {
                        i,
                        reason: "cancelled".to_string(),
                    },
                );
                return self.finish_cancelled().await;
            }

            self.bus.publish(
                run_id,
                RunEvent::IterGenDone {
                    i,
                    duration_ms: generation.duration_ms,
                    prompt_length: generation.prompt_length,
                },
            );

            self.bus.publish(run_id, RunEvent::IterScoreStart { i });
            let ctx = VariantContext {
                task: &self.run.task,
                assertions: &self.run.assertions,
                expected: None,
                output: &generation.output,
                duration_ms: generation.duration_ms,
                tool_calls: 0,
                baseline_cost,
            };
            let scored = match self.reward.score(&ctx, &mut rng).await {
                Ok(s) => s,
                Err(e) => {
                    self.bus.publish(
                        run_id,
                        RunEvent::IterError {
                            i,
                            reason: e.to_string(),
                        },
                    );
                    continue;
                }
            };

            for vote in &scored.judge_info.judges {
                if let Some(score) = vote.score {
                    self.bus.publish(
                        run_id,
                        RunEvent::Judge {
                            i,
                            model: vote.model.clone(),
                            score,
                        },
                    );
                }
            }
            self.bus.publish(
                run_id,
                RunEvent::IterScoreDone {
                    i,
                    total_reward: scored.total,
                    reward_breakdown: RewardBreakdown::from(&scored),
                    judge_info: scored.judge_info.clone(),
                },
            );

            let variant_id = match self
                .persist_iteration(i, op, &recipe, &generation, &scored, &mut baseline_recorded)
                .await?
            {
                IterationOutcome::Saved(id) => id,
                IterationOutcome::Abandoned => return self.finish_cancelled().await,
            };

            // Local mirror of the arm update keeps selection consistent even
            // if concurrent runs touch the same arms.
            let arm = arms.entry(op).or_default();
            arm.pulls += 1;
            arm.mean_reward += (scored.total - arm.mean_reward) / arm.pulls as f64;
            *run_pulls.entry(op).or_default() += 1;

            let is_new_best = best.map(|(_, score)| scored.total > score).unwrap_or(true);
            if is_new_best {
                with_retry(|| self.store.mark_best(run_id, variant_id, scored.total)).await?;
                best = Some((variant_id, scored.total));
            }
        }

        if let Some((best_id, _)) = best {
            match self.store.promote_recipe(best_id, &self.promotion_cfg).await {
                Ok(PromotionOutcome::Promoted { recipe_id, .. }) => {
                    tracing::debug!(run_id, recipe_id, "recipe promoted");
                }
                Ok(PromotionOutcome::Conflict { recipe_id }) => {
                    tracing::debug!(run_id, recipe_id, "recipe promotion conflict, kept pending");
                }
                Ok(PromotionOutcome::Rejected) => {}
                Err(e) => {
                    // Promotion trouble never fails a finished run.
                    tracing::warn!(run_id, error = %e, "recipe promotion failed");
                }
            }
        }

        self.store.finish_run(run_id, RunStatus::Complete, None).await?;
        self.bus.publish(
            run_id,
            RunEvent::Done {
                status: RunStatus::Complete,
                reason: None,
            },
        );
        Ok(())
    }

    async fn generate(&self, recipe: &Recipe, prompt: &str) -> Result<Generation, EngineError> {
        let engine = self.engines.generator(recipe.engine);
        match tokio::time::timeout(
            self.run_cfg.generation_timeout(),
            engine.generate(recipe, prompt),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.run_cfg.generation_timeout())),
        }
    }

    /// Retrieval failures degrade to an empty context; the iteration runs on.
    async fn gather_context(&self, recipe: &Recipe) -> GatheredContext {
        let mut gathered = GatheredContext::default();
        if recipe.memory_k > 0 {
            if let Some(memory) = &self.engines.memory {
                match memory.retrieve(&self.run.task, recipe.memory_k as usize).await {
                    Ok(snippets) => gathered.memory = snippets,
                    Err(e) => tracing::warn!(error = %e, "memory retrieval failed"),
                }
            }
        }
        if recipe.rag_k > 0 {
            if let Some(rag) = &self.engines.rag {
                match rag.retrieve(&self.run.task, recipe.rag_k as usize).await {
                    Ok(snippets) => gathered.rag = snippets,
                    Err(e) => tracing::warn!(error = %e, "rag retrieval failed"),
                }
            }
        }
        if recipe.use_web {
            if let Some(web) = &self.engines.web {
                match web.retrieve(&self.run.task, 3).await {
                    Ok(snippets) => gathered.web = snippets,
                    Err(e) => tracing::warn!(error = %e, "web search failed"),
                }
            }
        }
        gathered
    }

    async fn persist_iteration(
        &self,
        i: usize,
        op: Operator,
        recipe: &Recipe,
        generation: &Generation,
        scored: &ScoredReward,
        baseline_recorded: &mut bool,
    ) -> Result<IterationOutcome, StoreError> {
        let run_id = self.run.id;
        let variant = NewVariant {
            run_id,
            iteration_index: i as i64,
            operator: op,
            recipe: recipe.clone(),
            prompt_length: generation.prompt_length as i64,
            output: generation.output.clone(),
            duration_ms: generation.duration_ms as i64,
            outcome_reward: scored.outcome,
            process_reward: scored.process,
            cost_penalty: scored.cost_penalty,
            total_reward: scored.total,
            raw_cost: scored.raw_cost,
            judge_info: scored.judge_info.clone(),
        };

        let variant_id = match with_retry(|| self.store.save_variant(variant.clone())).await {
            Ok(id) => id,
            Err(StoreError::RunNotActive(_)) => {
                return Ok(IterationOutcome::Abandoned);
            }
            Err(e) => return Err(e),
        };

        let task_class = self.run.normalized_task_class.clone();
        with_retry(|| {
            self.store
                .update_operator_stat(&task_class, op, scored.total)
        })
        .await?;

        if !*baseline_recorded {
            with_retry(|| self.store.set_run_baseline(run_id, scored.total, scored.raw_cost))
                .await?;
            *baseline_recorded = true;
        }

        self.bus
            .publish(run_id, RunEvent::IterSaved { i, variant_id });
        Ok(IterationOutcome::Saved(variant_id))
    }

    async fn finish_cancelled(&self) -> Result<(), StoreError> {
        let run_id = self.run.id;
        self.store
            .finish_run(run_id, RunStatus::Cancelled, None)
            .await?;
        self.bus.publish(
            run_id,
            RunEvent::Done {
                status: RunStatus::Cancelled,
                reason: self.cancel.reason(),
            },
        );
        Ok(())
    }

    async fn finish_with_error(&self, message: &str) -> Result<(), StoreError> {
        let run_id = self.run.id;
        self.store
            .finish_run(run_id, RunStatus::Error, Some(message.to_string()))
            .await?;
        self.bus.publish(
            run_id,
            RunEvent::Error {
                message: message.to_string(),
            },
        );
        Ok(())
    }
}
