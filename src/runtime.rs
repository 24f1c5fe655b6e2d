//! `CoreRuntime`: the single object threaded through request handlers.
//! Owns the store, event bus, job manager, collaborator engines, and the
//! reward model, and exposes the core API surface.

use std::sync::Arc;

use thiserror::Error;

use crate::analytics::{SnapshotCache, SnapshotResponse, Window};
use crate::code_loop::{CodeLoopArtifact, CodeLoopError, CodeLoopGate, TuningKnobs};
use crate::config::{ConfigError, CoreConfig, Strategy};
use crate::engines::{EngineSet, Patcher, TestHarness};
use crate::events::{EventBus, EventStream};
use crate::golden::{GoldenError, GoldenEvaluator, GoldenItem, GoldenKpi};
use crate::jobs::{CancelToken, JobError, JobManager};
use crate::operators::{Framework, Operator};
use crate::reward::{JudgePools, RewardModel};
use crate::runner::RunWorker;
use crate::store::{
    now_epoch, CodeLoopMode, MetaStore, NewRun, OperatorStatRow, RunRow, StoreError, VariantRow,
};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Golden(#[from] GoldenError),
    #[error(transparent)]
    CodeLoop(#[from] CodeLoopError),
}

/// Parameters for `start_run`. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default)]
pub struct StartRun {
    pub session_id: Option<String>,
    pub task_class: String,
    pub task: String,
    pub assertions: Vec<String>,
    pub n: Option<u32>,
    pub strategy: Option<Strategy>,
    pub epsilon: Option<f64>,
    pub memory_k: Option<u32>,
    pub rag_k: Option<u32>,
    pub framework_mask: Option<Vec<Framework>>,
    pub seed: Option<u64>,
}

pub struct CoreRuntime {
    cfg: CoreConfig,
    store: MetaStore,
    bus: Arc<EventBus>,
    jobs: Arc<JobManager>,
    engines: EngineSet,
    reward: Arc<RewardModel>,
    snapshots: SnapshotCache,
    patcher: Option<Arc<dyn Patcher>>,
    tests: Option<Arc<dyn TestHarness>>,
    golden_items: Vec<GoldenItem>,
    golden_model_id: String,
    rag_index_hash: Option<String>,
    tuning: TuningKnobs,
}

impl CoreRuntime {
    pub fn new(cfg: CoreConfig, store: MetaStore, engines: EngineSet) -> Self {
        Self::with_judge_pools(cfg, store, engines, JudgePools::default())
    }

    pub fn with_judge_pools(
        cfg: CoreConfig,
        store: MetaStore,
        engines: EngineSet,
        pools: JudgePools,
    ) -> Self {
        let reward = Arc::new(RewardModel::new(
            Arc::clone(&engines.judge),
            Arc::clone(&engines.embedder),
            pools,
            cfg.reward.clone(),
            cfg.run.judge_timeout(),
        ));
        Self {
            bus: Arc::new(EventBus::new(cfg.events.clone())),
            jobs: Arc::new(JobManager::new(&cfg.run, &cfg.code_loop)),
            snapshots: SnapshotCache::new(&cfg.analytics),
            tuning: TuningKnobs {
                process_multiplier: cfg.reward.process_multiplier,
                cost_multiplier: cfg.reward.cost_multiplier,
            },
            cfg,
            store,
            engines,
            reward,
            patcher: None,
            tests: None,
            golden_items: Vec::new(),
            golden_model_id: "local:default".to_string(),
            rag_index_hash: None,
        }
    }

    pub fn with_patcher(mut self, patcher: Arc<dyn Patcher>) -> Self {
        self.patcher = Some(patcher);
        self
    }

    pub fn with_test_harness(mut self, tests: Arc<dyn TestHarness>) -> Self {
        self.tests = Some(tests);
        self
    }

    pub fn with_golden_items(mut self, items: Vec<GoldenItem>) -> Self {
        self.golden_items = items;
        self
    }

    pub fn with_golden_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.golden_model_id = model_id.into();
        self
    }

    pub fn with_rag_index_hash(mut self, hash: impl Into<String>) -> Self {
        self.rag_index_hash = Some(hash.into());
        self
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    /// Validate, persist, and spawn a run. Returns before the first
    /// iteration; observe progress through `subscribe_events`.
    pub async fn start_run(&self, req: StartRun) -> Result<i64, CoreError> {
        let params = self.validate_start(&req)?;
        let client = req
            .session_id
            .clone()
            .unwrap_or_else(|| "anonymous".to_string());
        self.jobs.admit_run(&client)?;

        let run_id = self.store.create_run(params).await?;
        let run = self.store.get_run(run_id).await?;
        self.spawn_worker(run);
        Ok(run_id)
    }

    fn validate_start(&self, req: &StartRun) -> Result<NewRun, ConfigError> {
        if req.task.trim().is_empty() {
            return Err(ConfigError::InvalidRun("task must be non-empty".to_string()));
        }
        if req.task_class.trim().is_empty() {
            return Err(ConfigError::InvalidRun(
                "task_class must be non-empty".to_string(),
            ));
        }
        let n = req.n.unwrap_or(self.cfg.run.n_default);
        if n == 0 {
            return Err(ConfigError::InvalidRun("n must be >= 1".to_string()));
        }
        if let Some(eps) = req.epsilon {
            if !(0.0..=1.0).contains(&eps) || !eps.is_finite() {
                return Err(ConfigError::InvalidRun(format!(
                    "epsilon must be in [0,1], got {eps}"
                )));
            }
        }
        let mask = req
            .framework_mask
            .clone()
            .unwrap_or_else(|| Framework::ALL.to_vec());
        if Operator::allowed(&mask).is_empty() {
            return Err(ConfigError::InvalidRun(
                "framework mask allows no operators".to_string(),
            ));
        }

        let strategy = req.strategy.unwrap_or(self.cfg.bandit.strategy);
        let epsilon = req
            .epsilon
            .unwrap_or_else(|| self.cfg.bandit.effective_epsilon());
        let seed = req.seed.unwrap_or_else(|| now_epoch() as u64);
        Ok(NewRun {
            session_id: req.session_id.clone(),
            task_class: req.task_class.clone(),
            normalized_task_class: req.task_class.trim().to_ascii_lowercase(),
            task: req.task.clone(),
            assertions: req.assertions.clone(),
            n_total: n,
            strategy,
            epsilon,
            framework_mask: mask,
            memory_k: req.memory_k.unwrap_or(0),
            rag_k: req.rag_k.unwrap_or(0),
            seed,
            reward_weights: (
                self.cfg.reward.alpha,
                self.cfg.reward.beta_process,
                self.cfg.reward.gamma_cost,
            ),
        })
    }

    fn spawn_worker(&self, run: RunRow) {
        let run_id = run.id;
        let cancel = Arc::new(CancelToken::new());
        let bandit_cfg = {
            let mut cfg = self.cfg.bandit.clone();
            cfg.strategy = run.strategy;
            cfg.epsilon = Some(run.epsilon);
            cfg
        };
        let worker = RunWorker {
            run,
            store: self.store.clone(),
            bus: Arc::clone(&self.bus),
            engines: self.engines.clone(),
            reward: Arc::clone(&self.reward),
            run_cfg: self.cfg.run.clone(),
            bandit_cfg,
            promotion_cfg: self.cfg.promotion.clone(),
            cancel: Arc::clone(&cancel),
        };
        let jobs = Arc::clone(&self.jobs);
        // The worker waits for registration so the registry never holds a
        // handle for a run that already finished.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let _ = ready_rx.await;
            worker.run().await;
            jobs.finish_run(run_id);
        });
        self.jobs.register_run(run_id, cancel, join);
        let _ = ready_tx.send(());
    }

    /// Flip a run's cancellation flag; the runner lands a terminal
    /// `done{status=cancelled}` within one iteration's worth of latency.
    pub fn cancel_run(&self, run_id: i64) -> Result<(), CoreError> {
        self.jobs.cancel_run(run_id)?;
        Ok(())
    }

    pub fn subscribe_events(&self, run_id: i64) -> EventStream {
        self.bus.subscribe(run_id)
    }

    pub fn active_runs(&self) -> Vec<i64> {
        self.jobs.active_runs()
    }

    pub async fn get_run(&self, run_id: i64) -> Result<RunRow, CoreError> {
        Ok(self.store.get_run(run_id).await?)
    }

    pub async fn get_variant(&self, variant_id: i64) -> Result<VariantRow, CoreError> {
        Ok(self.store.get_variant(variant_id).await?)
    }

    pub async fn list_operator_stats(
        &self,
        task_class: Option<&str>,
    ) -> Result<Vec<OperatorStatRow>, CoreError> {
        Ok(self.store.list_operator_stats(task_class).await?)
    }

    /// Record a human rating (1-10). Ratings feed analytics only and never
    /// alter a stored total_reward.
    pub async fn rate(
        &self,
        variant_id: i64,
        score: i64,
        feedback: Option<&str>,
    ) -> Result<(), CoreError> {
        self.store.insert_rating(variant_id, score, feedback).await?;
        Ok(())
    }

    fn golden_evaluator(&self) -> GoldenEvaluator {
        GoldenEvaluator::new(
            self.engines.clone(),
            Arc::clone(&self.reward),
            self.store.clone(),
            self.golden_model_id.clone(),
            self.rag_index_hash.clone(),
            self.cfg.run.generation_timeout(),
        )
    }

    /// Evaluate the golden set, optionally restricted to specific item ids.
    pub async fn run_golden(&self, subset: Option<&[String]>) -> Result<GoldenKpi, CoreError> {
        let items: Vec<&GoldenItem> = match subset {
            Some(ids) => self
                .golden_items
                .iter()
                .filter(|item| ids.contains(&item.id))
                .collect(),
            None => self.golden_items.iter().collect(),
        };
        if items.is_empty() {
            return Err(GoldenError::Empty.into());
        }
        Ok(self.golden_evaluator().evaluate(&items).await?)
    }

    /// Run one gated code-loop for a source run. Completed loops are
    /// idempotent per source run; concurrent calls contend on the global
    /// lock and rate limit.
    pub async fn run_code_loop(
        &self,
        source_run_id: i64,
        mode: CodeLoopMode,
    ) -> Result<CodeLoopArtifact, CoreError> {
        // Idempotency first: a completed loop returns without consuming
        // the lock or rate budget.
        if let Some(existing) = self.store.get_code_loop_by_source(source_run_id).await? {
            let artifact: CodeLoopArtifact = serde_json::from_str(&existing.artifact_json)
                .map_err(|e| CodeLoopError::Encode(e.to_string()))?;
            return Ok(artifact);
        }

        let (patcher, tests) = match (&self.patcher, &self.tests) {
            (Some(p), Some(t)) => (Arc::clone(p), Arc::clone(t)),
            _ => return Err(CodeLoopError::MissingCollaborators.into()),
        };
        let _permit = self.jobs.acquire_code_loop()?;

        let gate = CodeLoopGate::new(
            self.store.clone(),
            patcher,
            tests,
            self.cfg.code_loop.clone(),
        );
        let evaluator = self.golden_evaluator();
        let timeout = std::time::Duration::from_secs(self.cfg.code_loop.timeout_s);
        let artifact = match tokio::time::timeout(
            timeout,
            gate.run(
                source_run_id,
                mode,
                &evaluator,
                &self.golden_items,
                self.tuning,
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(CodeLoopError::Timeout.into()),
        };
        Ok(artifact)
    }

    pub async fn get_analytics_snapshot(
        &self,
        window: Window,
    ) -> Result<SnapshotResponse, CoreError> {
        Ok(self.snapshots.get_or_build(window, &self.store).await?)
    }
}
