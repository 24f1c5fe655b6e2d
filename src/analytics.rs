//! Windowed analytics roll-ups behind a TTL cache.
//!
//! The cache is read-copy-update: a built snapshot is an immutable `Arc`
//! swapped in under a short write lock, so readers never block a rebuild.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::AnalyticsConfig;
use crate::operators::Operator;
use crate::store::{now_epoch, AnalyticsTotals, DailyPoint, MetaStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "all")]
    All,
}

impl Window {
    pub const ALL_WINDOWS: [Window; 3] = [Window::Days7, Window::Days30, Window::All];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Days7 => "7d",
            Self::Days30 => "30d",
            Self::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "7d" => Some(Self::Days7),
            "30d" => Some(Self::Days30),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// Epoch-second cutoff for this window.
    pub fn cutoff(self, now: i64) -> i64 {
        match self {
            Self::Days7 => now - 7 * 86_400,
            Self::Days30 => now - 30 * 86_400,
            Self::All => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorLeader {
    pub task_class: String,
    pub operator: Operator,
    pub pulls: i64,
    pub mean_reward: f64,
}

/// One immutable roll-up over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub window: Window,
    pub totals: AnalyticsTotals,
    pub operator_leaderboard: Vec<OperatorLeader>,
    pub series: Vec<DailyPoint>,
    pub golden_pass_rate: f64,
    pub generated_at: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotResponse {
    pub snapshot: Arc<Snapshot>,
    pub cached: bool,
    pub age_seconds: u64,
}

pub struct SnapshotCache {
    ttl: Duration,
    inner: RwLock<HashMap<Window, (Arc<Snapshot>, Instant)>>,
}

impl SnapshotCache {
    pub fn new(cfg: &AnalyticsConfig) -> Self {
        Self {
            ttl: Duration::from_secs(cfg.snapshot_ttl_s),
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Cached snapshot when fresh, otherwise rebuild from the store and
    /// swap it in. Two calls within the TTL return the identical snapshot.
    pub async fn get_or_build(
        &self,
        window: Window,
        store: &MetaStore,
    ) -> Result<SnapshotResponse, StoreError> {
        {
            let cache = self
                .inner
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some((snapshot, built_at)) = cache.get(&window) {
                let age = built_at.elapsed();
                if age < self.ttl {
                    return Ok(SnapshotResponse {
                        snapshot: Arc::clone(snapshot),
                        cached: true,
                        age_seconds: age.as_secs(),
                    });
                }
            }
        }

        let snapshot = Arc::new(build_snapshot(window, store).await?);
        {
            let mut cache = self
                .inner
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.insert(window, (Arc::clone(&snapshot), Instant::now()));
        }

        // Persist best-effort so the snapshot survives a restart.
        match serde_json::to_string(snapshot.as_ref()) {
            Ok(json) => {
                if let Err(e) = store.snapshot_put(window.as_str(), &json).await {
                    tracing::warn!(window = window.as_str(), error = %e, "snapshot persist failed");
                }
            }
            Err(e) => {
                tracing::warn!(window = window.as_str(), error = %e, "snapshot encode failed")
            }
        }

        Ok(SnapshotResponse {
            snapshot,
            cached: false,
            age_seconds: 0,
        })
    }
}

async fn build_snapshot(window: Window, store: &MetaStore) -> Result<Snapshot, StoreError> {
    let now = now_epoch();
    let cutoff = window.cutoff(now);
    let totals = store.analytics_totals(cutoff).await?;
    let series = store.daily_series(cutoff).await?;
    let golden_pass_rate = store.golden_pass_rate_since(cutoff).await?;

    let mut leaderboard: Vec<OperatorLeader> = store
        .list_operator_stats(None)
        .await?
        .into_iter()
        .map(|s| OperatorLeader {
            task_class: s.task_class,
            operator: s.operator,
            pulls: s.pulls,
            mean_reward: s.mean_reward,
        })
        .collect();
    leaderboard.sort_by(|a, b| {
        b.mean_reward
            .partial_cmp(&a.mean_reward)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    leaderboard.truncate(10);

    Ok(Snapshot {
        window,
        totals,
        operator_leaderboard: leaderboard,
        series,
        golden_pass_rate,
        generated_at: now,
    })
}
