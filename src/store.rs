//! SQLite-backed persistent store for runs, variants, operator arms,
//! promoted recipes, human ratings, golden results, code-loop artifacts,
//! and analytics snapshots.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::bandit::ArmSnapshot;
use crate::config::{PromotionConfig, Strategy};
use crate::operators::{Framework, Operator, Recipe};
use crate::reward::JudgeInfo;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Complete,
    Error,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "complete" => Self::Complete,
            "cancelled" => Self::Cancelled,
            _ => Self::Error,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Auto,
    Pending,
    Manual,
}

impl Approval {
    fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Pending => "pending",
            Self::Manual => "manual",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "auto" => Self::Auto,
            "manual" => Self::Manual,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLoopMode {
    Live,
    DryRun,
}

impl CodeLoopMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::DryRun => "dry_run",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "live" => Self::Live,
            _ => Self::DryRun,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLoopDecision {
    Commit,
    Rollback,
    Reject,
}

impl CodeLoopDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Reject => "reject",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "commit" => Self::Commit,
            "rollback" => Self::Rollback,
            _ => Self::Reject,
        }
    }
}

/// Parameters persisted when a run is created.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub session_id: Option<String>,
    pub task_class: String,
    pub normalized_task_class: String,
    pub task: String,
    pub assertions: Vec<String>,
    pub n_total: u32,
    pub strategy: Strategy,
    pub epsilon: f64,
    pub framework_mask: Vec<Framework>,
    pub memory_k: u32,
    pub rag_k: u32,
    pub seed: u64,
    /// `(alpha, beta_process, gamma_cost)` recorded with the run.
    pub reward_weights: (f64, f64, f64),
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub session_id: Option<String>,
    pub task_class: String,
    pub normalized_task_class: String,
    pub task: String,
    pub assertions: Vec<String>,
    pub n_total: i64,
    pub strategy: Strategy,
    pub epsilon: f64,
    pub framework_mask: Vec<Framework>,
    pub memory_k: i64,
    pub rag_k: i64,
    pub seed: u64,
    pub reward_weights: (f64, f64, f64),
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub baseline_score: Option<f64>,
    pub baseline_cost: Option<f64>,
    pub best_score: Option<f64>,
    pub best_variant_id: Option<i64>,
    pub status: RunStatus,
    pub error: Option<String>,
}

/// A scored attempt, immutable after persist.
#[derive(Debug, Clone)]
pub struct NewVariant {
    pub run_id: i64,
    pub iteration_index: i64,
    pub operator: Operator,
    pub recipe: Recipe,
    pub prompt_length: i64,
    pub output: String,
    pub duration_ms: i64,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub raw_cost: f64,
    pub judge_info: JudgeInfo,
}

#[derive(Debug, Clone)]
pub struct VariantRow {
    pub id: i64,
    pub run_id: i64,
    pub iteration_index: i64,
    pub operator: Operator,
    pub recipe: Recipe,
    pub prompt_length: i64,
    pub output: String,
    pub duration_ms: i64,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub raw_cost: f64,
    pub is_best: bool,
    pub judge_info: JudgeInfo,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatorStatRow {
    pub task_class: String,
    pub operator: Operator,
    pub pulls: i64,
    pub sum_reward: f64,
    pub mean_reward: f64,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct RecipeRow {
    pub id: i64,
    pub task_class: String,
    pub parent_variant_id: i64,
    pub recipe: Recipe,
    pub baseline_delta: f64,
    pub cost_ratio: f64,
    pub approved: Approval,
    pub uses: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct RatingRow {
    pub id: i64,
    pub variant_id: i64,
    pub score: i64,
    pub feedback: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewGoldenResult {
    pub suite_run_id: String,
    pub item_id: String,
    pub outcome_reward: f64,
    pub process_reward: f64,
    pub cost_penalty: f64,
    pub total_reward: f64,
    pub steps: i64,
    pub passed: bool,
    pub model_id: String,
    pub rag_index_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CodeLoopRow {
    pub id: i64,
    pub loop_id: String,
    pub source_run_id: i64,
    pub mode: CodeLoopMode,
    pub decision: CodeLoopDecision,
    pub artifact_json: String,
    pub created_at: i64,
}

/// Outcome of a promotion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted { recipe_id: i64, approved: Approval },
    /// Collision on `(task_class, parent_variant_id)`; the existing recipe
    /// was downgraded to pending.
    Conflict { recipe_id: i64 },
    /// Predicate not met.
    Rejected,
}

// =============================================================================
// Error
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("run {0} is not running")]
    RunNotActive(i64),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Retry a durable write with exponential backoff: 3 attempts, base 100 ms.
/// Only retryable store failures are retried; logical errors surface at
/// once.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    const ATTEMPTS: u32 = 3;
    const BASE: Duration = Duration::from_millis(100);
    let mut last: Option<StoreError> = None;
    for attempt in 0..ATTEMPTS {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let retryable = matches!(e, StoreError::Sqlite(_) | StoreError::Io(_));
                if !retryable || attempt == ATTEMPTS - 1 {
                    return Err(e);
                }
                tracing::warn!(error = %e, attempt, "storage write failed, retrying");
                last = Some(e);
                tokio::time::sleep(BASE * 2u32.pow(attempt)).await;
            }
        }
    }
    Err(last.unwrap_or_else(|| StoreError::Join("retry exhausted".to_string())))
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct MetaStore {
    conn: Arc<Mutex<Connection>>,
    /// Gate concurrent spawn_blocking calls so only one blocking thread
    /// waits on the connection mutex at a time.
    sem: Arc<Semaphore>,
}

impl MetaStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA foreign_keys=ON;\
             PRAGMA busy_timeout=5000;",
        )?;
        Self::create_tables(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("PROMPTFORGE_STORE") {
            return PathBuf::from(path);
        }
        PathBuf::from(".promptforge.sqlite")
    }

    /// Recover from mutex poisoning; the SQLite connection is still usable.
    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    fn create_tables(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS runs (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               session_id TEXT,\
               task_class TEXT NOT NULL,\
               normalized_task_class TEXT NOT NULL,\
               task TEXT NOT NULL,\
               assertions_json TEXT NOT NULL DEFAULT '[]',\
               n_total INTEGER NOT NULL,\
               strategy TEXT NOT NULL,\
               epsilon REAL NOT NULL,\
               framework_mask_json TEXT NOT NULL DEFAULT '[]',\
               memory_k INTEGER NOT NULL DEFAULT 0,\
               rag_k INTEGER NOT NULL DEFAULT 0,\
               seed INTEGER NOT NULL DEFAULT 0,\
               reward_weights_json TEXT NOT NULL,\
               started_at INTEGER NOT NULL,\
               finished_at INTEGER,\
               baseline_score REAL,\
               baseline_cost REAL,\
               best_score REAL,\
               best_variant_id INTEGER,\
               status TEXT NOT NULL DEFAULT 'running',\
               error TEXT\
             );\
             CREATE TABLE IF NOT EXISTS variants (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,\
               iteration_index INTEGER NOT NULL,\
               operator TEXT NOT NULL,\
               recipe_json TEXT NOT NULL,\
               prompt_length INTEGER NOT NULL,\
               output TEXT NOT NULL,\
               duration_ms INTEGER NOT NULL,\
               outcome_reward REAL NOT NULL,\
               process_reward REAL NOT NULL,\
               cost_penalty REAL NOT NULL,\
               total_reward REAL NOT NULL,\
               raw_cost REAL NOT NULL DEFAULT 0,\
               is_best INTEGER NOT NULL DEFAULT 0,\
               judge_info_json TEXT NOT NULL DEFAULT '{}',\
               created_at INTEGER NOT NULL,\
               UNIQUE(run_id, iteration_index)\
             );\
             CREATE TABLE IF NOT EXISTS operator_stats (\
               task_class TEXT NOT NULL,\
               operator TEXT NOT NULL,\
               pulls INTEGER NOT NULL DEFAULT 0,\
               sum_reward REAL NOT NULL DEFAULT 0,\
               mean_reward REAL NOT NULL DEFAULT 0,\
               last_updated INTEGER NOT NULL,\
               PRIMARY KEY (task_class, operator)\
             );\
             CREATE TABLE IF NOT EXISTS recipes (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               task_class TEXT NOT NULL,\
               parent_variant_id INTEGER NOT NULL REFERENCES variants(id),\
               recipe_json TEXT NOT NULL,\
               baseline_delta REAL NOT NULL,\
               cost_ratio REAL NOT NULL,\
               approved TEXT NOT NULL DEFAULT 'pending',\
               uses INTEGER NOT NULL DEFAULT 0,\
               created_at INTEGER NOT NULL,\
               UNIQUE(task_class, parent_variant_id)\
             );\
             CREATE TABLE IF NOT EXISTS human_ratings (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               variant_id INTEGER NOT NULL REFERENCES variants(id) ON DELETE CASCADE,\
               score INTEGER NOT NULL,\
               feedback TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS golden_results (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               suite_run_id TEXT NOT NULL,\
               item_id TEXT NOT NULL,\
               outcome_reward REAL NOT NULL,\
               process_reward REAL NOT NULL,\
               cost_penalty REAL NOT NULL,\
               total_reward REAL NOT NULL,\
               steps INTEGER NOT NULL,\
               passed INTEGER NOT NULL,\
               model_id TEXT NOT NULL,\
               rag_index_hash TEXT,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS code_loops (\
               id INTEGER PRIMARY KEY AUTOINCREMENT,\
               loop_id TEXT NOT NULL UNIQUE,\
               source_run_id INTEGER NOT NULL UNIQUE,\
               mode TEXT NOT NULL,\
               decision TEXT NOT NULL,\
               artifact_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE TABLE IF NOT EXISTS snapshots (\
               window TEXT PRIMARY KEY,\
               payload_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(started_at);\
             CREATE INDEX IF NOT EXISTS idx_runs_task_class ON runs(normalized_task_class);\
             CREATE INDEX IF NOT EXISTS idx_variants_created ON variants(created_at);\
             CREATE INDEX IF NOT EXISTS idx_ratings_variant ON human_ratings(variant_id);\
             CREATE INDEX IF NOT EXISTS idx_golden_suite ON golden_results(suite_run_id);",
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    pub async fn create_run(&self, new: NewRun) -> Result<i64, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let now = now_epoch();
                let assertions = encode_json(&new.assertions)?;
                let mask = encode_json(&new.framework_mask)?;
                let weights = encode_json(&[
                    new.reward_weights.0,
                    new.reward_weights.1,
                    new.reward_weights.2,
                ])?;
                conn.execute(
                    "INSERT INTO runs (session_id, task_class, normalized_task_class, task, \
                     assertions_json, n_total, strategy, epsilon, framework_mask_json, memory_k, \
                     rag_k, seed, reward_weights_json, started_at, status) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    params![
                        new.session_id,
                        new.task_class,
                        new.normalized_task_class,
                        new.task,
                        assertions,
                        new.n_total,
                        new.strategy.as_str(),
                        new.epsilon,
                        mask,
                        new.memory_k,
                        new.rag_k,
                        new.seed as i64,
                        weights,
                        now,
                        RunStatus::Running.as_str(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get_run(&self, run_id: i64) -> Result<RunRow, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                    params![run_id],
                    row_to_run,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("run {run_id}"))
                    }
                    other => StoreError::Sqlite(other),
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRow>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
                ))?;
                let mut rows = stmt.query(params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_run(row)?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Record the baseline score and raw cost once the first iteration of a
    /// run has been scored.
    pub async fn set_run_baseline(
        &self,
        run_id: i64,
        baseline_score: f64,
        baseline_cost: f64,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let rows = conn.execute(
                    "UPDATE runs SET baseline_score = ?1, baseline_cost = ?2 WHERE id = ?3",
                    params![baseline_score, baseline_cost, run_id],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(format!("run {run_id}")));
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Terminal transition; idempotent. Only the first call with a terminal
    /// status sets `finished_at`.
    pub async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "UPDATE runs SET finished_at = ?1, status = ?2, error = ?3 \
                     WHERE id = ?4 AND finished_at IS NULL",
                    params![now_epoch(), status.as_str(), error, run_id],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Variants
    // -------------------------------------------------------------------------

    /// Persist a scored variant. Rejected when the owning run is no longer
    /// running.
    pub async fn save_variant(&self, new: NewVariant) -> Result<i64, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let status: String = conn
                    .query_row(
                        "SELECT status FROM runs WHERE id = ?1",
                        params![new.run_id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            StoreError::NotFound(format!("run {}", new.run_id))
                        }
                        other => StoreError::Sqlite(other),
                    })?;
                if RunStatus::from_str(&status) != RunStatus::Running {
                    return Err(StoreError::RunNotActive(new.run_id));
                }

                let recipe = encode_json(&new.recipe)?;
                let judge_info = encode_json(&new.judge_info)?;
                conn.execute(
                    "INSERT INTO variants (run_id, iteration_index, operator, recipe_json, \
                     prompt_length, output, duration_ms, outcome_reward, process_reward, \
                     cost_penalty, total_reward, raw_cost, judge_info_json, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        new.run_id,
                        new.iteration_index,
                        new.operator.as_str(),
                        recipe,
                        new.prompt_length,
                        new.output,
                        new.duration_ms,
                        new.outcome_reward,
                        new.process_reward,
                        new.cost_penalty,
                        new.total_reward,
                        new.raw_cost,
                        judge_info,
                        now_epoch(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Atomically mark a variant as the run's best. At most one variant per
    /// run carries the flag.
    pub async fn mark_best(
        &self,
        run_id: i64,
        variant_id: i64,
        score: f64,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let tx_done: Result<(), rusqlite::Error> = (|| {
                    conn.execute_batch("BEGIN IMMEDIATE")?;
                    conn.execute(
                        "UPDATE variants SET is_best = 0 WHERE run_id = ?1",
                        params![run_id],
                    )?;
                    conn.execute(
                        "UPDATE variants SET is_best = 1 WHERE id = ?1 AND run_id = ?2",
                        params![variant_id, run_id],
                    )?;
                    conn.execute(
                        "UPDATE runs SET best_variant_id = ?1, best_score = ?2 WHERE id = ?3",
                        params![variant_id, score, run_id],
                    )?;
                    conn.execute_batch("COMMIT")?;
                    Ok(())
                })();
                if tx_done.is_err() {
                    let _ = conn.execute_batch("ROLLBACK");
                }
                tx_done.map_err(StoreError::Sqlite)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn get_variant(&self, variant_id: i64) -> Result<VariantRow, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {VARIANT_COLUMNS} FROM variants WHERE id = ?1"),
                    params![variant_id],
                    row_to_variant,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("variant {variant_id}"))
                    }
                    other => StoreError::Sqlite(other),
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn list_variants(&self, run_id: i64) -> Result<Vec<VariantRow>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {VARIANT_COLUMNS} FROM variants WHERE run_id = ?1 \
                     ORDER BY iteration_index"
                ))?;
                let mut rows = stmt.query(params![run_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_variant(row)?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Operator stats (bandit arms)
    // -------------------------------------------------------------------------

    /// Read-modify-write of one arm under the connection lock: pulls,
    /// sum_reward, and mean_reward move together.
    pub async fn update_operator_stat(
        &self,
        task_class: &str,
        operator: Operator,
        reward: f64,
    ) -> Result<(), StoreError> {
        let store = self.clone();
        let task_class = task_class.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO operator_stats (task_class, operator, pulls, sum_reward, \
                     mean_reward, last_updated) VALUES (?1, ?2, 1, ?3, ?3, ?4) \
                     ON CONFLICT(task_class, operator) DO UPDATE SET \
                       pulls = pulls + 1, \
                       sum_reward = sum_reward + excluded.sum_reward, \
                       mean_reward = (sum_reward + excluded.sum_reward) / (pulls + 1), \
                       last_updated = excluded.last_updated",
                    params![task_class, operator.as_str(), reward, now_epoch()],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn list_operator_stats(
        &self,
        task_class: Option<&str>,
    ) -> Result<Vec<OperatorStatRow>, StoreError> {
        let store = self.clone();
        let task_class = task_class.map(String::from);
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut out = Vec::new();
                let mut push = |row: &rusqlite::Row<'_>| -> rusqlite::Result<()> {
                    let op: String = row.get(1)?;
                    if let Some(operator) = Operator::from_str(&op) {
                        out.push(OperatorStatRow {
                            task_class: row.get(0)?,
                            operator,
                            pulls: row.get(2)?,
                            sum_reward: row.get(3)?,
                            mean_reward: row.get(4)?,
                            last_updated: row.get(5)?,
                        });
                    }
                    Ok(())
                };
                if let Some(tc) = task_class {
                    let mut stmt = conn.prepare(
                        "SELECT task_class, operator, pulls, sum_reward, mean_reward, \
                         last_updated FROM operator_stats WHERE task_class = ?1 \
                         ORDER BY mean_reward DESC",
                    )?;
                    let mut rows = stmt.query(params![tc])?;
                    while let Some(row) = rows.next()? {
                        push(row)?;
                    }
                } else {
                    let mut stmt = conn.prepare(
                        "SELECT task_class, operator, pulls, sum_reward, mean_reward, \
                         last_updated FROM operator_stats ORDER BY task_class, mean_reward DESC",
                    )?;
                    let mut rows = stmt.query([])?;
                    while let Some(row) = rows.next()? {
                        push(row)?;
                    }
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Arm statistics for a task class in the shape the selector consumes.
    pub async fn arm_snapshots(
        &self,
        task_class: &str,
    ) -> Result<HashMap<Operator, ArmSnapshot>, StoreError> {
        let stats = self.list_operator_stats(Some(task_class)).await?;
        Ok(stats
            .into_iter()
            .map(|s| {
                (
                    s.operator,
                    ArmSnapshot {
                        pulls: s.pulls,
                        mean_reward: s.mean_reward,
                    },
                )
            })
            .collect())
    }

    // -------------------------------------------------------------------------
    // Recipes
    // -------------------------------------------------------------------------

    /// Promote a variant's recipe if the predicate holds. A collision on
    /// `(task_class, parent_variant_id)` downgrades the stored recipe to
    /// pending instead of failing.
    pub async fn promote_recipe(
        &self,
        variant_id: i64,
        cfg: &PromotionConfig,
    ) -> Result<PromotionOutcome, StoreError> {
        let store = self.clone();
        let cfg = cfg.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let (run_id, total, raw_cost, recipe_json): (i64, f64, f64, String) = conn
                    .query_row(
                        "SELECT run_id, total_reward, raw_cost, recipe_json \
                         FROM variants WHERE id = ?1",
                        params![variant_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => {
                            StoreError::NotFound(format!("variant {variant_id}"))
                        }
                        other => StoreError::Sqlite(other),
                    })?;
                let (task_class, baseline_score, baseline_cost): (String, Option<f64>, Option<f64>) =
                    conn.query_row(
                        "SELECT normalized_task_class, baseline_score, baseline_cost \
                         FROM runs WHERE id = ?1",
                        params![run_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?;

                let baseline_score = baseline_score.unwrap_or(0.0);
                let baseline_cost = baseline_cost.unwrap_or(raw_cost).max(1.0);
                let delta = total - baseline_score;
                let cost_ratio = raw_cost / baseline_cost;

                if delta < cfg.delta_reward_min || cost_ratio > cfg.cost_ratio_max {
                    return Ok(PromotionOutcome::Rejected);
                }
                let approved = if delta >= cfg.auto_approve_delta
                    && cost_ratio <= cfg.auto_approve_cost_ratio
                {
                    Approval::Auto
                } else {
                    Approval::Pending
                };

                let existing = conn.query_row(
                    "SELECT id FROM recipes WHERE task_class = ?1 AND parent_variant_id = ?2",
                    params![task_class, variant_id],
                    |row| row.get::<_, i64>(0),
                );
                match existing {
                    Ok(recipe_id) => {
                        // Collision: keep the stored recipe, downgraded to pending.
                        conn.execute(
                            "UPDATE recipes SET approved = 'pending' WHERE id = ?1",
                            params![recipe_id],
                        )?;
                        Ok(PromotionOutcome::Conflict { recipe_id })
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => {
                        conn.execute(
                            "INSERT INTO recipes (task_class, parent_variant_id, recipe_json, \
                             baseline_delta, cost_ratio, approved, created_at) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                task_class,
                                variant_id,
                                recipe_json,
                                delta,
                                cost_ratio,
                                approved.as_str(),
                                now_epoch(),
                            ],
                        )?;
                        Ok(PromotionOutcome::Promoted {
                            recipe_id: conn.last_insert_rowid(),
                            approved,
                        })
                    }
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn list_recipes(&self, task_class: &str) -> Result<Vec<RecipeRow>, StoreError> {
        let store = self.clone();
        let task_class = task_class.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_class, parent_variant_id, recipe_json, baseline_delta, \
                     cost_ratio, approved, uses, created_at FROM recipes \
                     WHERE task_class = ?1 ORDER BY baseline_delta DESC",
                )?;
                let mut rows = stmt.query(params![task_class])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_recipe(row)?);
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Best approved recipe for a task class, bumping its usage counter.
    pub async fn take_top_recipe(&self, task_class: &str) -> Result<Option<RecipeRow>, StoreError> {
        let store = self.clone();
        let task_class = task_class.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let result = conn.query_row(
                    "SELECT id, task_class, parent_variant_id, recipe_json, baseline_delta, \
                     cost_ratio, approved, uses, created_at FROM recipes \
                     WHERE task_class = ?1 AND approved IN ('auto', 'manual') \
                     ORDER BY baseline_delta DESC LIMIT 1",
                    params![task_class],
                    row_to_recipe,
                );
                match result {
                    Ok(recipe) => {
                        conn.execute(
                            "UPDATE recipes SET uses = uses + 1 WHERE id = ?1",
                            params![recipe.id],
                        )?;
                        Ok(Some(recipe))
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Human ratings
    // -------------------------------------------------------------------------

    /// Append a rating. History is preserved; the latest score supersedes
    /// for display. Ratings never alter a stored total_reward.
    pub async fn insert_rating(
        &self,
        variant_id: i64,
        score: i64,
        feedback: Option<&str>,
    ) -> Result<i64, StoreError> {
        if !(1..=10).contains(&score) {
            return Err(StoreError::InvalidValue(format!(
                "rating score must be in [1,10], got {score}"
            )));
        }
        let store = self.clone();
        let feedback = feedback.map(String::from);
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM variants WHERE id = ?1",
                    params![variant_id],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    return Err(StoreError::NotFound(format!("variant {variant_id}")));
                }
                conn.execute(
                    "INSERT INTO human_ratings (variant_id, score, feedback, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![variant_id, score, feedback, now_epoch()],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn latest_rating(&self, variant_id: i64) -> Result<Option<RatingRow>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let result = conn.query_row(
                    "SELECT id, variant_id, score, feedback, created_at FROM human_ratings \
                     WHERE variant_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![variant_id],
                    |row| {
                        Ok(RatingRow {
                            id: row.get(0)?,
                            variant_id: row.get(1)?,
                            score: row.get(2)?,
                            feedback: row.get(3)?,
                            created_at: row.get(4)?,
                        })
                    },
                );
                match result {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn rating_count(&self, variant_id: i64) -> Result<i64, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM human_ratings WHERE variant_id = ?1",
                    params![variant_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Golden results
    // -------------------------------------------------------------------------

    pub async fn insert_golden_result(&self, new: NewGoldenResult) -> Result<i64, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO golden_results (suite_run_id, item_id, outcome_reward, \
                     process_reward, cost_penalty, total_reward, steps, passed, model_id, \
                     rag_index_hash, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        new.suite_run_id,
                        new.item_id,
                        new.outcome_reward,
                        new.process_reward,
                        new.cost_penalty,
                        new.total_reward,
                        new.steps,
                        new.passed as i64,
                        new.model_id,
                        new.rag_index_hash,
                        now_epoch(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Pass rate over golden results since a cutoff (0 when none exist).
    pub async fn golden_pass_rate_since(&self, cutoff: i64) -> Result<f64, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let (total, passed): (i64, i64) = conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(passed), 0) FROM golden_results \
                     WHERE created_at >= ?1",
                    params![cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                if total == 0 {
                    Ok(0.0)
                } else {
                    Ok(passed as f64 / total as f64)
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Code loops
    // -------------------------------------------------------------------------

    pub async fn insert_code_loop(
        &self,
        loop_id: &str,
        source_run_id: i64,
        mode: CodeLoopMode,
        decision: CodeLoopDecision,
        artifact_json: &str,
    ) -> Result<i64, StoreError> {
        let store = self.clone();
        let loop_id = loop_id.to_string();
        let artifact_json = artifact_json.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO code_loops (loop_id, source_run_id, mode, decision, \
                     artifact_json, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        loop_id,
                        source_run_id,
                        mode.as_str(),
                        decision.as_str(),
                        artifact_json,
                        now_epoch(),
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Idempotency lookup: a code-loop keyed by its source run.
    pub async fn get_code_loop_by_source(
        &self,
        source_run_id: i64,
    ) -> Result<Option<CodeLoopRow>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let result = conn.query_row(
                    "SELECT id, loop_id, source_run_id, mode, decision, artifact_json, \
                     created_at FROM code_loops WHERE source_run_id = ?1",
                    params![source_run_id],
                    |row| {
                        Ok(CodeLoopRow {
                            id: row.get(0)?,
                            loop_id: row.get(1)?,
                            source_run_id: row.get(2)?,
                            mode: CodeLoopMode::from_str(&row.get::<_, String>(3)?),
                            decision: CodeLoopDecision::from_str(&row.get::<_, String>(4)?),
                            artifact_json: row.get(5)?,
                            created_at: row.get(6)?,
                        })
                    },
                );
                match result {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    pub async fn snapshot_put(&self, window: &str, payload_json: &str) -> Result<(), StoreError> {
        let store = self.clone();
        let window = window.to_string();
        let payload_json = payload_json.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO snapshots (window, payload_json, created_at) \
                     VALUES (?1, ?2, ?3) \
                     ON CONFLICT(window) DO UPDATE SET \
                       payload_json = excluded.payload_json, \
                       created_at = excluded.created_at",
                    params![window, payload_json, now_epoch()],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    pub async fn snapshot_get(&self, window: &str) -> Result<Option<(String, i64)>, StoreError> {
        let store = self.clone();
        let window = window.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let result = conn.query_row(
                    "SELECT payload_json, created_at FROM snapshots WHERE window = ?1",
                    params![window],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                );
                match result {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    // -------------------------------------------------------------------------
    // Aggregates
    // -------------------------------------------------------------------------

    /// Rolling raw-cost baseline for a task class: the mean over the most
    /// recent scored variants.
    pub async fn rolling_baseline_cost(
        &self,
        task_class: &str,
        limit: i64,
    ) -> Result<Option<f64>, StoreError> {
        let store = self.clone();
        let task_class = task_class.to_string();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let avg: Option<f64> = conn.query_row(
                    "SELECT AVG(raw_cost) FROM (\
                       SELECT v.raw_cost FROM variants v \
                       JOIN runs r ON r.id = v.run_id \
                       WHERE r.normalized_task_class = ?1 AND v.raw_cost > 0 \
                       ORDER BY v.id DESC LIMIT ?2)",
                    params![task_class, limit],
                    |row| row.get(0),
                )?;
                Ok(avg)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Roll-up totals for analytics windows.
    pub async fn analytics_totals(&self, cutoff: i64) -> Result<AnalyticsTotals, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let (runs, completed, errored): (i64, i64, i64) = conn.query_row(
                    "SELECT COUNT(*), \
                       COALESCE(SUM(CASE WHEN status = 'complete' THEN 1 ELSE 0 END), 0), \
                       COALESCE(SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END), 0) \
                     FROM runs WHERE started_at >= ?1",
                    params![cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                let variants: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM variants WHERE created_at >= ?1",
                    params![cutoff],
                    |row| row.get(0),
                )?;
                let avg_best: Option<f64> = conn.query_row(
                    "SELECT AVG(best_score) FROM runs \
                     WHERE started_at >= ?1 AND best_score IS NOT NULL",
                    params![cutoff],
                    |row| row.get(0),
                )?;
                let avg_total: Option<f64> = conn.query_row(
                    "SELECT AVG(total_reward) FROM variants WHERE created_at >= ?1",
                    params![cutoff],
                    |row| row.get(0),
                )?;
                let recipes: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM recipes WHERE created_at >= ?1",
                    params![cutoff],
                    |row| row.get(0),
                )?;
                Ok(AnalyticsTotals {
                    runs,
                    completed_runs: completed,
                    error_runs: errored,
                    variants,
                    recipes,
                    avg_best_score: avg_best,
                    avg_total_reward: avg_total,
                })
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Per-day run and reward series since the cutoff.
    pub async fn daily_series(&self, cutoff: i64) -> Result<Vec<DailyPoint>, StoreError> {
        let store = self.clone();
        let _permit = self.sem.acquire().await.expect("semaphore closed");
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT created_at / 86400 AS day, COUNT(*), AVG(total_reward) \
                     FROM variants WHERE created_at >= ?1 GROUP BY day ORDER BY day",
                )?;
                let mut rows = stmt.query(params![cutoff])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(DailyPoint {
                        day_epoch: row.get::<_, i64>(0)? * 86400,
                        variants: row.get(1)?,
                        avg_total_reward: row.get(2)?,
                    });
                }
                Ok(out)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsTotals {
    pub runs: i64,
    pub completed_runs: i64,
    pub error_runs: i64,
    pub variants: i64,
    pub recipes: i64,
    pub avg_best_score: Option<f64>,
    pub avg_total_reward: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPoint {
    pub day_epoch: i64,
    pub variants: i64,
    pub avg_total_reward: Option<f64>,
}

// =============================================================================
// Row converters
// =============================================================================

const RUN_COLUMNS: &str = "id, session_id, task_class, normalized_task_class, task, \
    assertions_json, n_total, strategy, epsilon, framework_mask_json, memory_k, rag_k, seed, \
    reward_weights_json, started_at, finished_at, baseline_score, baseline_cost, best_score, \
    best_variant_id, status, error";

const VARIANT_COLUMNS: &str = "id, run_id, iteration_index, operator, recipe_json, \
    prompt_length, output, duration_ms, outcome_reward, process_reward, cost_penalty, \
    total_reward, raw_cost, is_best, judge_info_json, created_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    let assertions: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    let mask: Vec<Framework> = serde_json::from_str(&row.get::<_, String>(9)?).unwrap_or_default();
    let weights: Vec<f64> = serde_json::from_str(&row.get::<_, String>(13)?).unwrap_or_default();
    let weights = (
        weights.first().copied().unwrap_or(1.0),
        weights.get(1).copied().unwrap_or(0.2),
        weights.get(2).copied().unwrap_or(-0.0005),
    );
    Ok(RunRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        task_class: row.get(2)?,
        normalized_task_class: row.get(3)?,
        task: row.get(4)?,
        assertions,
        n_total: row.get(6)?,
        strategy: Strategy::from_str(&row.get::<_, String>(7)?),
        epsilon: row.get(8)?,
        framework_mask: mask,
        memory_k: row.get(10)?,
        rag_k: row.get(11)?,
        seed: row.get::<_, i64>(12)? as u64,
        reward_weights: weights,
        started_at: row.get(14)?,
        finished_at: row.get(15)?,
        baseline_score: row.get(16)?,
        baseline_cost: row.get(17)?,
        best_score: row.get(18)?,
        best_variant_id: row.get(19)?,
        status: RunStatus::from_str(&row.get::<_, String>(20)?),
        error: row.get(21)?,
    })
}

fn row_to_variant(row: &rusqlite::Row<'_>) -> rusqlite::Result<VariantRow> {
    let operator = Operator::from_str(&row.get::<_, String>(3)?).unwrap_or(Operator::ChangeSystem);
    let recipe: Recipe =
        serde_json::from_str(&row.get::<_, String>(4)?).unwrap_or_default();
    let judge_info: JudgeInfo = serde_json::from_str(&row.get::<_, String>(14)?)
        .unwrap_or_else(|_| JudgeInfo::empty());
    Ok(VariantRow {
        id: row.get(0)?,
        run_id: row.get(1)?,
        iteration_index: row.get(2)?,
        operator,
        recipe,
        prompt_length: row.get(5)?,
        output: row.get(6)?,
        duration_ms: row.get(7)?,
        outcome_reward: row.get(8)?,
        process_reward: row.get(9)?,
        cost_penalty: row.get(10)?,
        total_reward: row.get(11)?,
        raw_cost: row.get(12)?,
        is_best: row.get::<_, i64>(13)? != 0,
        judge_info,
        created_at: row.get(15)?,
    })
}

fn row_to_recipe(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecipeRow> {
    let recipe: Recipe =
        serde_json::from_str(&row.get::<_, String>(3)?).unwrap_or_default();
    Ok(RecipeRow {
        id: row.get(0)?,
        task_class: row.get(1)?,
        parent_variant_id: row.get(2)?,
        recipe,
        baseline_delta: row.get(4)?,
        cost_ratio: row.get(5)?,
        approved: Approval::from_str(&row.get::<_, String>(6)?),
        uses: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Encode(e.to_string()))
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// =============================================================================
// Tests
// =============================================================================
