//! Bandit selection over the operator registry.
//!
//! Selection is a pure function of `(arm stats, run-local pulls, config,
//! PRNG)`; the caller owns the PRNG so tests pin seeds. Arm updates are an
//! incremental mean and live in storage (`MetaStore::update_operator_stat`).

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::{BanditConfig, Strategy};
use crate::operators::{Framework, Operator};

/// Cross-run statistics for one `(task_class, operator)` arm, as seen by
/// the selector.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArmSnapshot {
    pub pulls: i64,
    pub mean_reward: f64,
}

/// Pick the next operator.
///
/// Warm start first: any allowed operator with fewer than
/// `warm_start_min_pulls` cross-run pulls is selected (least pulls wins,
/// ties broken by registry order), which guarantees full coverage of the
/// allowed set within its first `|allowed|` iterations. After warm start,
/// stratified exploration (when enabled) restricts candidates to frameworks
/// still below their run-local pull quota, then the configured strategy
/// picks among the candidates.
pub fn select(
    allowed: &[Operator],
    arms: &HashMap<Operator, ArmSnapshot>,
    run_pulls: &HashMap<Operator, u32>,
    cfg: &BanditConfig,
    rng: &mut StdRng,
) -> Option<Operator> {
    if allowed.is_empty() {
        return None;
    }

    // Warm start: cover every allowed arm before trusting the statistics.
    let mut coldest: Option<(Operator, i64)> = None;
    for &op in allowed {
        let pulls = arms.get(&op).map(|a| a.pulls).unwrap_or(0);
        if pulls < cfg.warm_start_min_pulls {
            match coldest {
                Some((_, best)) if best <= pulls => {}
                _ => coldest = Some((op, pulls)),
            }
        }
    }
    if let Some((op, _)) = coldest {
        return Some(op);
    }

    let candidates = if cfg.stratified_exploration {
        stratified_candidates(allowed, run_pulls)
    } else {
        allowed.to_vec()
    };

    match cfg.strategy {
        Strategy::EpsilonGreedy => {
            let eps = cfg.effective_epsilon();
            if rng.gen::<f64>() < eps {
                Some(candidates[rng.gen_range(0..candidates.len())])
            } else {
                argmax_random_tiebreak(&candidates, rng, |op| {
                    let arm = arms.get(&op).copied().unwrap_or_default();
                    if arm.pulls > 0 {
                        arm.mean_reward
                    } else {
                        f64::NEG_INFINITY
                    }
                })
            }
        }
        Strategy::Ucb1 => {
            let total: i64 = candidates
                .iter()
                .map(|op| arms.get(op).map(|a| a.pulls).unwrap_or(0))
                .sum();
            let ln_n = (total.max(1) as f64).ln();
            argmax_random_tiebreak(&candidates, rng, |op| {
                let arm = arms.get(&op).copied().unwrap_or_default();
                if arm.pulls == 0 {
                    // Unreached only when warm_start_min_pulls is 0.
                    f64::INFINITY
                } else {
                    arm.mean_reward + cfg.ucb_c * (ln_n / arm.pulls as f64).sqrt()
                }
            })
        }
    }
}

/// Frameworks below their run-local quota, expressed as the operators that
/// belong to them. The quota for a framework is its share of the allowed
/// set scaled by the pulls made so far in this run.
fn stratified_candidates(allowed: &[Operator], run_pulls: &HashMap<Operator, u32>) -> Vec<Operator> {
    let total_pulls: u32 = allowed.iter().map(|op| run_pulls.get(op).copied().unwrap_or(0)).sum();

    let mut below: Vec<Framework> = Vec::new();
    for fw in Framework::ALL {
        let ops_in_fw: Vec<Operator> = allowed
            .iter()
            .copied()
            .filter(|op| op.framework() == fw)
            .collect();
        if ops_in_fw.is_empty() {
            continue;
        }
        let share = ops_in_fw.len() as f64 / allowed.len() as f64;
        let fw_pulls: u32 = ops_in_fw
            .iter()
            .map(|op| run_pulls.get(op).copied().unwrap_or(0))
            .sum();
        if (fw_pulls as f64) < share * (total_pulls as f64 + 1.0) {
            below.push(fw);
        }
    }

    if below.is_empty() {
        return allowed.to_vec();
    }
    allowed
        .iter()
        .copied()
        .filter(|op| below.contains(&op.framework()))
        .collect()
}

fn argmax_random_tiebreak<F>(candidates: &[Operator], rng: &mut StdRng, score: F) -> Option<Operator>
where
    F: Fn(Operator) -> f64,
{
    let mut best_score = f64::NEG_INFINITY;
    let mut best: Vec<Operator> = Vec::new();
    for &op in candidates {
        let s = score(op);
        if s > best_score {
            best_score = s;
            best.clear();
            best.push(op);
        } else if (s - best_score).abs() <= 1e-12 {
            best.push(op);
        }
    }
    if best.is_empty() {
        // All candidates scored NEG_INFINITY (no stats): explore uniformly.
        if candidates.is_empty() {
            return None;
        }
        return Some(candidates[rng.gen_range(0..candidates.len())]);
    }
    Some(best[rng.gen_range(0..best.len())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cfg(strategy: Strategy) -> BanditConfig {
        BanditConfig {
            strategy,
            epsilon: None,
            ucb_c: 2.0,
            warm_start_min_pulls: 1,
            stratified_exploration: false,
        }
    }

    #[test]
    fn warm_start_covers_all_eleven_operators_once() {
        let allowed: Vec<Operator> = Operator::ALL.to_vec();
        let mut arms: HashMap<Operator, ArmSnapshot> = HashMap::new();
        let mut run_pulls: HashMap<Operator, u32> = HashMap::new();
        let mut rng = StdRng::seed_from_u64(42);
        let cfg = cfg(Strategy::Ucb1);

        let mut seen: Vec<Operator> = Vec::new();
        for _ in 0..allowed.len() {
            let op = select(&allowed, &arms, &run_pulls, &cfg, &mut rng).unwrap();
            seen.push(op);
            let arm = arms.entry(op).or_default();
            arm.pulls += 1;
            arm.mean_reward = 0.5;
            *run_pulls.entry(op).or_default() += 1;
        }

        let mut sorted = seen.clone();
        sorted.sort_by_key(|op| op.as_str());
        sorted.dedup();
        assert_eq!(sorted.len(), 11, "each operator selected exactly once");
        let total: i64 = arms.values().map(|a| a.pulls).sum();
        assert_eq!(total, 11);
    }

    #[test]
    fn warm_start_prefers_least_pulled_with_registry_tiebreak() {
        let allowed = vec![Operator::ChangeSystem, Operator::ChangeNudge];
        let mut arms = HashMap::new();
        arms.insert(
            Operator::ChangeSystem,
            ArmSnapshot {
                pulls: 1,
                mean_reward: 0.9,
            },
        );
        let run_pulls = HashMap::new();
        let mut rng = StdRng::seed_from_u64(0);
        let op = select(&allowed, &arms, &run_pulls, &cfg(Strategy::Ucb1), &mut rng).unwrap();
        assert_eq!(op, Operator::ChangeNudge);
    }

    #[test]
    fn epsilon_zero_tiebreaks_uniformly() {
        let allowed = vec![Operator::RaiseTemp, Operator::LowerTemp];
        let mut arms = HashMap::new();
        for op in &allowed {
            arms.insert(
                *op,
                ArmSnapshot {
                    pulls: 3,
                    mean_reward: 0.5,
                },
            );
        }
        let run_pulls = HashMap::new();
        let mut cfg = cfg(Strategy::EpsilonGreedy);
        cfg.epsilon = Some(0.0);

        let mut rng = StdRng::seed_from_u64(1234);
        let trials = 1000;
        let mut first = 0;
        for _ in 0..trials {
            let op = select(&allowed, &arms, &run_pulls, &cfg, &mut rng).unwrap();
            if op == Operator::RaiseTemp {
                first += 1;
            }
        }
        // Binomial(1000, 0.5): 3 sigma is ~47.4.
        assert!(
            (452..=548).contains(&first),
            "tie-break not uniform: {first}/1000"
        );
    }

    #[test]
    fn epsilon_greedy_exploits_best_mean() {
        let allowed = vec![Operator::RaiseTemp, Operator::LowerTemp];
        let mut arms = HashMap::new();
        arms.insert(
            Operator::RaiseTemp,
            ArmSnapshot {
                pulls: 5,
                mean_reward: 0.2,
            },
        );
        arms.insert(
            Operator::LowerTemp,
            ArmSnapshot {
                pulls: 5,
                mean_reward: 0.8,
            },
        );
        let run_pulls = HashMap::new();
        let mut cfg = cfg(Strategy::EpsilonGreedy);
        cfg.epsilon = Some(0.0);
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..20 {
            let op = select(&allowed, &arms, &run_pulls, &cfg, &mut rng).unwrap();
            assert_eq!(op, Operator::LowerTemp);
        }
    }

    #[test]
    fn ucb1_balances_mean_and_uncertainty() {
        let allowed = vec![Operator::RaiseTemp, Operator::LowerTemp];
        let mut arms = HashMap::new();
        // Equal means; the less-pulled arm has the larger bonus.
        arms.insert(
            Operator::RaiseTemp,
            ArmSnapshot {
                pulls: 100,
                mean_reward: 0.5,
            },
        );
        arms.insert(
            Operator::LowerTemp,
            ArmSnapshot {
                pulls: 2,
                mean_reward: 0.5,
            },
        );
        let run_pulls = HashMap::new();
        let mut rng = StdRng::seed_from_u64(3);
        let op = select(&allowed, &arms, &run_pulls, &cfg(Strategy::Ucb1), &mut rng).unwrap();
        assert_eq!(op, Operator::LowerTemp);
    }

    #[test]
    fn stratified_exploration_feeds_starved_frameworks() {
        // SEAL has 7 of 9 allowed ops here; SAMPLING has 2. After many SEAL
        // pulls and none for SAMPLING, candidates restrict to SAMPLING.
        let allowed: Vec<Operator> = Operator::ALL
            .into_iter()
            .filter(|op| {
                matches!(op.framework(), Framework::Seal | Framework::Sampling)
            })
            .collect();
        let mut arms = HashMap::new();
        let mut run_pulls = HashMap::new();
        for op in &allowed {
            arms.insert(
                *op,
                ArmSnapshot {
                    pulls: 5,
                    mean_reward: if op.framework() == Framework::Seal {
                        0.9
                    } else {
                        0.1
                    },
                },
            );
            if op.framework() == Framework::Seal {
                run_pulls.insert(*op, 4u32);
            }
        }
        let mut cfg = cfg(Strategy::EpsilonGreedy);
        cfg.epsilon = Some(0.0);
        cfg.stratified_exploration = true;
        let mut rng = StdRng::seed_from_u64(5);
        let op = select(&allowed, &arms, &run_pulls, &cfg, &mut rng).unwrap();
        assert_eq!(op.framework(), Framework::Sampling);
    }

    #[test]
    fn empty_allowed_set_selects_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(select(
            &[],
            &HashMap::new(),
            &HashMap::new(),
            &cfg(Strategy::Ucb1),
            &mut rng
        )
        .is_none());
    }
}
