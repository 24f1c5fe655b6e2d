//! Collaborator contracts: generation, judging, embedding, context
//! retrieval, patching, and the unit-test harness used by the code loop.
//!
//! The core never talks to a provider directly; everything behind these
//! traits is replaceable, and tests script them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operators::Recipe;

/// Which generation backend a recipe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// The default single-model local backend.
    Local,
    /// The hosted multi-model backend.
    Hosted,
}

impl EngineKind {
    pub fn alternate(self) -> Self {
        match self {
            Self::Local => Self::Hosted,
            Self::Hosted => Self::Local,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Hosted => "hosted",
        }
    }
}

/// Errors from any collaborator call.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The collaborator did not answer within its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The collaborator answered with a failure.
    #[error("{engine} failure: {message}")]
    Failure {
        engine: &'static str,
        message: String,
        retryable: bool,
    },

    /// The collaborator answered, but the payload was unusable.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The collaborator is not configured (missing backend, bad model id).
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn failure(engine: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Failure {
            engine,
            message: message.into(),
            retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Failure { retryable, .. } => *retryable,
            Self::InvalidResponse(_) => false,
            Self::Config(_) => false,
        }
    }

    /// Short code for logs and iteration error events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Failure { .. } => "collaborator_failure",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Config(_) => "config_error",
        }
    }
}

/// One completed generation call.
#[derive(Debug, Clone)]
pub struct Generation {
    pub output: String,
    pub duration_ms: u64,
    pub prompt_length: usize,
    pub engine_id: String,
    pub model_id: String,
}

#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Generate output for the assembled prompt under the recipe's sampling
    /// parameters. The system prompt is `recipe.system`.
    async fn generate(&self, recipe: &Recipe, prompt: &str) -> Result<Generation, EngineError>;
}

/// One judge verdict. Scores are normalized at the reward boundary, so a
/// judge may legally answer on a 1–10 scale.
#[derive(Debug, Clone)]
pub struct Judgement {
    pub score: f64,
    pub rationale: Option<String>,
    pub duration_ms: u64,
}

/// A single judging call: model id plus fully rendered prompt pair.
#[derive(Debug, Clone)]
pub struct JudgeRequest<'a> {
    pub model_id: &'a str,
    pub system: &'a str,
    pub prompt: &'a str,
}

#[async_trait]
pub trait JudgeEngine: Send + Sync {
    async fn judge(&self, req: JudgeRequest<'_>) -> Result<Judgement, EngineError>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fixed-dimension embedding of `text`.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;
}

/// Bounded textual snippets for a query; backs RAG, memory, and web lookup.
#[async_trait]
pub trait SnippetRetriever: Send + Sync {
    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<String>, EngineError>;
}

// =============================================================================
// Code-loop collaborators
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: String,
    pub diff: String,
    pub lines_changed: u32,
}

/// A bounded package of edits proposed by the code-loop critic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditsPackage {
    pub files: Vec<FileEdit>,
    pub summary: String,
}

impl EditsPackage {
    pub fn total_lines(&self) -> u32 {
        self.files.iter().map(|f| f.lines_changed).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOutcome {
    pub ok: bool,
    /// Commit identifier after the patch was applied.
    pub commit: String,
    pub diffs: Vec<String>,
    pub touched_files: Vec<String>,
}

#[async_trait]
pub trait Patcher: Send + Sync {
    /// Current pre-patch commit, used as the rollback target.
    async fn head(&self) -> Result<String, EngineError>;
    async fn apply(&self, edits: &EditsPackage) -> Result<PatchOutcome, EngineError>;
    async fn rollback(&self, commit: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub failures: u32,
    pub output: String,
}

#[async_trait]
pub trait TestHarness: Send + Sync {
    async fn run_tests(&self) -> Result<TestReport, EngineError>;
}

// =============================================================================
// Engine set
// =============================================================================

/// The bundle of collaborators a runtime is wired with.
#[derive(Clone)]
pub struct EngineSet {
    pub local: Arc<dyn GenerationEngine>,
    pub hosted: Option<Arc<dyn GenerationEngine>>,
    pub judge: Arc<dyn JudgeEngine>,
    pub embedder: Arc<dyn Embedder>,
    pub memory: Option<Arc<dyn SnippetRetriever>>,
    pub rag: Option<Arc<dyn SnippetRetriever>>,
    pub web: Option<Arc<dyn SnippetRetriever>>,
}

impl EngineSet {
    pub fn new(
        local: Arc<dyn GenerationEngine>,
        judge: Arc<dyn JudgeEngine>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            local,
            hosted: None,
            judge,
            embedder,
            memory: None,
            rag: None,
            web: None,
        }
    }

    pub fn with_hosted(mut self, hosted: Arc<dyn GenerationEngine>) -> Self {
        self.hosted = Some(hosted);
        self
    }

    pub fn with_memory(mut self, r: Arc<dyn SnippetRetriever>) -> Self {
        self.memory = Some(r);
        self
    }

    pub fn with_rag(mut self, r: Arc<dyn SnippetRetriever>) -> Self {
        self.rag = Some(r);
        self
    }

    pub fn with_web(mut self, r: Arc<dyn SnippetRetriever>) -> Self {
        self.web = Some(r);
        self
    }

    /// Resolve the generator for an engine flag. Falls back to the local
    /// backend when no hosted engine is wired.
    pub fn generator(&self, kind: EngineKind) -> &Arc<dyn GenerationEngine> {
        match kind {
            EngineKind::Local => &self.local,
            EngineKind::Hosted => self.hosted.as_ref().unwrap_or(&self.local),
        }
    }
}
