#![forbid(unsafe_code)]

//! # promptforge
//!
//! A self-improving prompt-optimization engine. Given a task and a task
//! class, it runs a bounded budget of candidate attempts ("variants"), each
//! produced by applying one mutation operator to a base recipe. Variants
//! are scored by a blended reward (outcome + process - cost), operator
//! selection is guided by a multi-armed bandit so the engine learns which
//! operators help which task classes, and winning recipes are promoted for
//! reuse. A deterministic Golden Set and a gated criticize → edit → test →
//! decide loop close the system with safety gates.
//!
//! Generation, judging, embedding, retrieval, and patching are external
//! collaborators behind the traits in [`engines`]; the core owns selection,
//! scoring, persistence, scheduling, and event fan-out.

pub mod analytics;
pub mod bandit;
pub mod code_loop;
pub mod config;
pub mod engines;
pub mod events;
pub mod golden;
pub mod jobs;
pub mod operators;
pub mod prompts;
pub mod reward;
pub mod runner;
pub mod runtime;
pub mod store;

pub use analytics::{Snapshot, SnapshotResponse, Window};
pub use code_loop::{CodeLoopArtifact, CodeLoopError, TuningKnobs};
pub use config::{ConfigError, CoreConfig, Strategy};
pub use engines::{
    Embedder, EngineError, EngineKind, EngineSet, Generation, GenerationEngine, JudgeEngine,
    JudgeRequest, Judgement, Patcher, SnippetRetriever, TestHarness,
};
pub use events::{EventStream, RunEvent};
pub use golden::{GoldenItem, GoldenKpi};
pub use jobs::JobError;
pub use operators::{Framework, Operator, Recipe};
pub use reward::{JudgeInfo, JudgePools, RewardModel, WeightedJudge};
pub use runtime::{CoreError, CoreRuntime, StartRun};
pub use store::{CodeLoopMode, MetaStore, RunStatus};
