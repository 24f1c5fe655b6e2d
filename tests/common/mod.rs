//! Scripted collaborator fakes shared by the integration suites.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use promptforge::engines::{
    EditsPackage, Embedder, EngineError, Generation, GenerationEngine, JudgeEngine, JudgeRequest,
    Judgement, PatchOutcome, Patcher, SnippetRetriever, TestHarness, TestReport,
};
use promptforge::operators::Recipe;

/// Generator that answers deterministically from the prompt, with scripted
/// per-call durations and an optional artificial delay.
pub struct FakeGenerator {
    durations: Mutex<VecDeque<u64>>,
    default_duration: u64,
    delay: Option<Duration>,
    output_tail: String,
    calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self {
            durations: Mutex::new(VecDeque::new()),
            default_duration: 800,
            delay: None,
            output_tail: String::new(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue per-call reported durations (ms); later calls use the default.
    pub fn with_durations(mut self, durations: Vec<u64>) -> Self {
        self.durations = Mutex::new(durations.into());
        self
    }

    /// Sleep this long inside each generate call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append fixed text to every output (to satisfy assertions).
    pub fn with_output_tail(mut self, tail: impl Into<String>) -> Self {
        self.output_tail = tail.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationEngine for FakeGenerator {
    async fn generate(&self, recipe: &Recipe, prompt: &str) -> Result<Generation, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let duration_ms = self
            .durations
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_duration);
        let head: String = prompt.chars().take(80).collect();
        Ok(Generation {
            output: format!("Answer: {head} {}", self.output_tail),
            duration_ms,
            prompt_length: prompt.len(),
            engine_id: recipe.engine.as_str().to_string(),
            model_id: "fake:model".to_string(),
        })
    }
}

/// Judge that pops scripted scores, then falls back to a default.
pub struct StepJudge {
    scores: Mutex<VecDeque<f64>>,
    default: f64,
}

impl StepJudge {
    pub fn new(scores: Vec<f64>, default: f64) -> Self {
        Self {
            scores: Mutex::new(scores.into()),
            default,
        }
    }
}

#[async_trait]
impl JudgeEngine for StepJudge {
    async fn judge(&self, _req: JudgeRequest<'_>) -> Result<Judgement, EngineError> {
        let score = self.scores.lock().unwrap().pop_front().unwrap_or(self.default);
        Ok(Judgement {
            score,
            rationale: None,
            duration_ms: 3,
        })
    }
}

/// Deterministic bag-of-words embedding.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let mut v = vec![0.0f32; 32];
        for word in text.split_whitespace() {
            let h = word
                .bytes()
                .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[h % 32] += 1.0;
        }
        Ok(v)
    }
}

pub struct StaticRetriever(pub Vec<String>);

#[async_trait]
impl SnippetRetriever for StaticRetriever {
    async fn retrieve(&self, _query: &str, k: usize) -> Result<Vec<String>, EngineError> {
        Ok(self.0.iter().take(k).cloned().collect())
    }
}

/// Patcher that records applies and rollbacks.
pub struct FakePatcher {
    pub applied: AtomicUsize,
    pub rolled_back: AtomicBool,
}

impl FakePatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            applied: AtomicUsize::new(0),
            rolled_back: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Patcher for FakePatcher {
    async fn head(&self) -> Result<String, EngineError> {
        Ok("commit-before".to_string())
    }

    async fn apply(&self, edits: &EditsPackage) -> Result<PatchOutcome, EngineError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(PatchOutcome {
            ok: true,
            commit: "commit-after".to_string(),
            diffs: edits.files.iter().map(|f| f.diff.clone()).collect(),
            touched_files: edits.files.iter().map(|f| f.path.clone()).collect(),
        })
    }

    async fn rollback(&self, commit: &str) -> Result<(), EngineError> {
        assert_eq!(commit, "commit-before");
        self.rolled_back.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeTests {
    pub pass: bool,
}

#[async_trait]
impl TestHarness for FakeTests {
    async fn run_tests(&self) -> Result<TestReport, EngineError> {
        Ok(TestReport {
            passed: self.pass,
            failures: if self.pass { 0 } else { 1 },
            output: String::new(),
        })
    }
}

/// Fresh on-disk store under a leaked tempdir.
pub fn temp_store() -> promptforge::MetaStore {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let path = dir.path().join("promptforge.sqlite");
    std::mem::forget(dir);
    promptforge::MetaStore::new(path).expect("create store")
}
