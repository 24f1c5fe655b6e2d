//! End-to-end meta-run: warm-start coverage, event ordering, reward
//! invariants, best tracking, and promotion.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{temp_store, FakeGenerator, HashEmbedder, StepJudge};
use promptforge::config::CoreConfig;
use promptforge::engines::EngineSet;
use promptforge::events::RunEvent;
use promptforge::operators::Operator;
use promptforge::store::Approval;
use promptforge::{CoreRuntime, RunStatus, StartRun, Strategy};

async fn collect_events(
    mut stream: promptforge::EventStream,
) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        let terminal = event.is_terminal();
        if !matches!(event, RunEvent::KeepAlive) {
            events.push(event);
        }
        if terminal {
            break;
        }
    }
    events
}

fn runtime_with_judge(judge: StepJudge) -> CoreRuntime {
    // The baseline iteration is slow; everything after is cheap, so the
    // best variant clears the promotion cost gate.
    let mut durations = vec![60_000u64];
    durations.extend(std::iter::repeat(2_000).take(16));
    let generator = Arc::new(FakeGenerator::new().with_durations(durations));
    let engines = EngineSet::new(generator, Arc::new(judge), Arc::new(HashEmbedder));
    CoreRuntime::new(CoreConfig::default(), temp_store(), engines)
}

#[tokio::test]
async fn run_covers_all_operators_and_completes() {
    // Scores climb after the baseline so a clear best emerges.
    let mut scores = vec![0.30, 0.30];
    scores.extend(std::iter::repeat(0.80).take(40));
    let runtime = runtime_with_judge(StepJudge::new(scores, 0.80));

    let run_id = runtime
        .start_run(StartRun {
            session_id: Some("s-e2e".to_string()),
            task_class: "code".to_string(),
            task: "write a rust function that reverses a string".to_string(),
            assertions: vec!["answer".to_string()],
            n: Some(11),
            strategy: Some(Strategy::Ucb1),
            seed: Some(42),
            ..StartRun::default()
        })
        .await
        .expect("start run");

    let events = collect_events(runtime.subscribe_events(run_id)).await;
    assert!(matches!(
        events.last(),
        Some(RunEvent::Done {
            status: RunStatus::Complete,
            ..
        })
    ));

    // Warm start: 11 iterations cover all 11 operators exactly once.
    let selected: Vec<Operator> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::IterSelected { operator, .. } => Some(*operator),
            _ => None,
        })
        .collect();
    assert_eq!(selected.len(), 11);
    let mut dedup = selected.clone();
    dedup.sort_by_key(|op| op.as_str());
    dedup.dedup();
    assert_eq!(dedup.len(), 11, "every operator pulled exactly once");

    let stats = runtime.list_operator_stats(Some("code")).await.unwrap();
    assert_eq!(stats.len(), 11);
    assert!(stats.iter().all(|s| s.pulls == 1));
    let total_pulls: i64 = stats.iter().map(|s| s.pulls).sum();
    assert_eq!(total_pulls, 11);

    // Event ordering per iteration, and no interleaving across iterations.
    let mut phase: HashMap<usize, u8> = HashMap::new();
    let mut last_saved: i64 = -1;
    for event in &events {
        match event {
            RunEvent::IterSelected { i, .. } => {
                assert_eq!(*i as i64, last_saved + 1, "selected before prior save");
                phase.insert(*i, 1);
            }
            RunEvent::IterGenDone { i, .. } => {
                assert_eq!(phase.get(i), Some(&1));
                phase.insert(*i, 2);
            }
            RunEvent::IterScoreDone { i, .. } => {
                assert_eq!(phase.get(i), Some(&2));
                phase.insert(*i, 3);
            }
            RunEvent::IterSaved { i, .. } => {
                assert_eq!(phase.get(i), Some(&3));
                last_saved = *i as i64;
            }
            _ => {}
        }
    }
    assert_eq!(last_saved, 10);

    // Stored variants satisfy the reward identity and the best invariant.
    let run = runtime.get_run(run_id).await.unwrap();
    let (alpha, beta, gamma) = run.reward_weights;
    let variants = runtime.store().list_variants(run_id).await.unwrap();
    assert_eq!(variants.len(), 11);
    for v in &variants {
        let expected = alpha * v.outcome_reward + beta * v.process_reward + gamma * v.cost_penalty;
        assert!(
            (v.total_reward - expected).abs() < 1e-6,
            "reward identity broken for variant {}",
            v.id
        );
    }
    let best: Vec<_> = variants.iter().filter(|v| v.is_best).collect();
    assert_eq!(best.len(), 1);
    let max_total = variants
        .iter()
        .map(|v| v.total_reward)
        .fold(f64::NEG_INFINITY, f64::max);
    assert_eq!(run.best_score, Some(max_total));
    assert_eq!(run.best_variant_id, Some(best[0].id));
    assert_eq!(run.baseline_score, Some(variants[0].total_reward));
    assert_eq!(run.status, RunStatus::Complete);
    assert!(run.finished_at.is_some());
}

#[tokio::test]
async fn winning_cheap_variant_is_promoted() {
    let mut scores = vec![0.20, 0.20];
    scores.extend(std::iter::repeat(0.90).take(40));
    let runtime = runtime_with_judge(StepJudge::new(scores, 0.90));

    let run_id = runtime
        .start_run(StartRun {
            session_id: Some("s-promote".to_string()),
            task_class: "code".to_string(),
            task: "implement a parser".to_string(),
            n: Some(6),
            seed: Some(7),
            ..StartRun::default()
        })
        .await
        .unwrap();
    collect_events(runtime.subscribe_events(run_id)).await;

    let recipes = runtime.store().list_recipes("code").await.unwrap();
    assert_eq!(recipes.len(), 1, "best variant should be promoted");
    // Large delta and a fraction of the baseline cost: auto-approved.
    assert_eq!(recipes[0].approved, Approval::Auto);
    assert!(recipes[0].baseline_delta >= 0.05);
    assert!(recipes[0].cost_ratio <= 0.9);
}

#[tokio::test]
async fn invalid_params_fail_before_run_creation() {
    let runtime = runtime_with_judge(StepJudge::new(vec![], 0.5));

    let empty_task = runtime
        .start_run(StartRun {
            task_class: "code".to_string(),
            task: "  ".to_string(),
            ..StartRun::default()
        })
        .await;
    assert!(empty_task.is_err());

    let bad_epsilon = runtime
        .start_run(StartRun {
            task_class: "code".to_string(),
            task: "do something".to_string(),
            epsilon: Some(2.0),
            ..StartRun::default()
        })
        .await;
    assert!(bad_epsilon.is_err());

    let empty_mask = runtime
        .start_run(StartRun {
            task_class: "code".to_string(),
            task: "do something".to_string(),
            framework_mask: Some(vec![]),
            ..StartRun::default()
        })
        .await;
    assert!(empty_mask.is_err());

    assert!(runtime.active_runs().is_empty());
}

#[tokio::test]
async fn rating_supersedes_but_keeps_history() {
    let runtime = runtime_with_judge(StepJudge::new(vec![], 0.6));
    let run_id = runtime
        .start_run(StartRun {
            task_class: "code".to_string(),
            task: "sum a list".to_string(),
            n: Some(2),
            seed: Some(3),
            ..StartRun::default()
        })
        .await
        .unwrap();
    collect_events(runtime.subscribe_events(run_id)).await;

    let variants = runtime.store().list_variants(run_id).await.unwrap();
    let vid = variants[0].id;
    let before = variants[0].total_reward;

    runtime.rate(vid, 3, Some("weak")).await.unwrap();
    runtime.rate(vid, 8, Some("actually fine")).await.unwrap();

    let latest = runtime.store().latest_rating(vid).await.unwrap().unwrap();
    assert_eq!(latest.score, 8);
    assert_eq!(runtime.store().rating_count(vid).await.unwrap(), 2);

    // Ratings never rewrite the stored reward.
    let after = runtime.get_variant(vid).await.unwrap().total_reward;
    assert_eq!(before, after);
}
