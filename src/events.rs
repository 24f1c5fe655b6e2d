//! Per-run event bus with multi-subscriber fan-out.
//!
//! Each run gets a bounded broadcast channel. Publishing never blocks the
//! runner; a subscriber that falls behind loses its oldest pending events
//! and receives a `dropped` marker instead. Terminal events are cached for
//! a grace period so late subscribers can still observe how a run ended.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::Serializer;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::EventBusConfig;
use crate::operators::Operator;
use crate::reward::{JudgeInfo, ScoredReward};
use crate::store::RunStatus;

fn round3<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64((v * 1000.0).round() / 1000.0)
}

/// Reward components as carried on score events, serialized to three
/// decimal places.
#[derive(Debug, Clone, Serialize)]
pub struct RewardBreakdown {
    #[serde(serialize_with = "round3")]
    pub outcome: f64,
    #[serde(serialize_with = "round3")]
    pub process: f64,
    #[serde(serialize_with = "round3")]
    pub cost_penalty: f64,
    #[serde(serialize_with = "round3")]
    pub total: f64,
}

impl From<&ScoredReward> for RewardBreakdown {
    fn from(s: &ScoredReward) -> Self {
        Self {
            outcome: s.outcome,
            process: s.process,
            cost_penalty: s.cost_penalty,
            total: s.total,
        }
    }
}

/// The closed set of run events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    IterSelected {
        i: usize,
        operator: Operator,
    },
    IterGenStart {
        i: usize,
    },
    IterGenDone {
        i: usize,
        duration_ms: u64,
        prompt_length: usize,
    },
    IterScoreStart {
        i: usize,
    },
    IterScoreDone {
        i: usize,
        #[serde(serialize_with = "round3")]
        total_reward: f64,
        reward_breakdown: RewardBreakdown,
        judge_info: JudgeInfo,
    },
    IterSaved {
        i: usize,
        variant_id: i64,
    },
    IterError {
        i: usize,
        reason: String,
    },
    Judge {
        i: usize,
        model: String,
        #[serde(serialize_with = "round3")]
        score: f64,
    },
    Done {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
    },
    KeepAlive,
    Dropped {
        count: u64,
    },
}

impl RunEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

struct RunChannel {
    tx: broadcast::Sender<RunEvent>,
    terminal: Option<RunEvent>,
}

/// Bus shared by the runtime, runners, and subscribers.
pub struct EventBus {
    cfg: EventBusConfig,
    channels: Arc<Mutex<HashMap<i64, RunChannel>>>,
}

impl EventBus {
    pub fn new(cfg: EventBusConfig) -> Self {
        Self {
            cfg,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<i64, RunChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish an event for a run. Never blocks; subscribers that lag past
    /// the queue bound observe a `dropped` marker from the channel itself.
    pub fn publish(&self, run_id: i64, event: RunEvent) {
        let terminal = event.is_terminal();
        {
            let mut channels = self.lock_channels();
            let channel = channels.entry(run_id).or_insert_with(|| RunChannel {
                tx: broadcast::channel(self.cfg.queue_size).0,
                terminal: None,
            });
            if channel.terminal.is_some() {
                tracing::debug!(run_id, "event after terminal dropped");
                return;
            }
            if terminal {
                channel.terminal = Some(event.clone());
            }
            // Send fails only when no subscriber is listening, which is fine.
            let _ = channel.tx.send(event);
        }

        if terminal {
            let channels = Arc::clone(&self.channels);
            let grace = self.cfg.replay_grace();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                channels
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&run_id);
            });
        }
    }

    /// Subscribe to a run's events. Events arrive in publication order; a
    /// run that already ended (within the replay grace period) yields its
    /// terminal event and then the stream closes.
    pub fn subscribe(&self, run_id: i64) -> EventStream {
        let mut channels = self.lock_channels();
        let channel = channels.entry(run_id).or_insert_with(|| RunChannel {
            tx: broadcast::channel(self.cfg.queue_size).0,
            terminal: None,
        });
        let mut replay = VecDeque::new();
        if let Some(terminal) = &channel.terminal {
            replay.push_back(terminal.clone());
        }
        let rx = channel.tx.subscribe();
        let period = self.cfg.keep_alive_interval();
        let mut keep_alive = interval_at(Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        EventStream {
            rx,
            replay,
            keep_alive,
            finished: false,
        }
    }

    #[cfg(test)]
    fn channel_count(&self) -> usize {
        self.lock_channels().len()
    }
}

/// One subscriber's ordered view of a run.
pub struct EventStream {
    rx: broadcast::Receiver<RunEvent>,
    replay: VecDeque<RunEvent>,
    keep_alive: Interval,
    finished: bool,
}

impl EventStream {
    /// Next event, a keep-alive tick when the run is quiet, or `None` once
    /// the stream is closed.
    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.replay.pop_front() {
            if event.is_terminal() {
                self.finished = true;
            }
            return Some(event);
        }
        tokio::select! {
            result = self.rx.recv() => match result {
                Ok(event) => {
                    self.keep_alive.reset();
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    Some(event)
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    Some(RunEvent::Dropped { count })
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    None
                }
            },
            _ = self.keep_alive.tick() => Some(RunEvent::KeepAlive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(EventBusConfig::default())
    }

    fn small_bus() -> EventBus {
        EventBus::new(EventBusConfig {
            queue_size: 2,
            keep_alive_interval_s: 15,
            replay_grace_s: 60,
        })
    }

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = bus();
        let mut stream = bus.subscribe(1);
        for i in 0..4 {
            bus.publish(1, RunEvent::IterGenStart { i });
        }
        for i in 0..4 {
            match stream.next().await.unwrap() {
                RunEvent::IterGenStart { i: got } => assert_eq!(got, i),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_gets_dropped_marker() {
        let bus = small_bus();
        let mut stream = bus.subscribe(1);
        for i in 0..5 {
            bus.publish(1, RunEvent::IterGenStart { i });
        }
        match stream.next().await.unwrap() {
            RunEvent::Dropped { count } => assert_eq!(count, 3),
            other => panic!("expected dropped marker, got {other:?}"),
        }
        // The two newest events survive.
        assert!(matches!(
            stream.next().await.unwrap(),
            RunEvent::IterGenStart { i: 3 }
        ));
    }

    #[tokio::test]
    async fn terminal_event_closes_the_stream() {
        let bus = bus();
        let mut stream = bus.subscribe(1);
        bus.publish(
            1,
            RunEvent::Done {
                status: RunStatus::Complete,
                reason: None,
            },
        );
        assert!(matches!(
            stream.next().await.unwrap(),
            RunEvent::Done { .. }
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_replays_terminal_within_grace() {
        let bus = bus();
        bus.publish(
            7,
            RunEvent::Done {
                status: RunStatus::Cancelled,
                reason: Some("timeout".to_string()),
            },
        );
        let mut stream = bus.subscribe(7);
        match stream.next().await.unwrap() {
            RunEvent::Done { status, reason } => {
                assert_eq!(status, RunStatus::Cancelled);
                assert_eq!(reason.as_deref(), Some("timeout"));
            }
            other => panic!("expected done, got {other:?}"),
        }
        assert!(stream.next().await.is_none());

        // Past the grace period the channel is gone.
        tokio::time::sleep(std::time::Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(bus.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_run_emits_keep_alives() {
        let bus = bus();
        let mut stream = bus.subscribe(1);
        assert!(matches!(stream.next().await.unwrap(), RunEvent::KeepAlive));
    }

    #[test]
    fn scores_serialize_to_three_decimals() {
        let event = RunEvent::Judge {
            i: 0,
            model: "m".to_string(),
            score: 0.123456,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("0.123"), "{json}");
        assert!(!json.contains("0.1234"), "{json}");
    }
}
