//! Process-wide job manager: the active-run registry, the global code-loop
//! lock, sliding-hour rate limits, and the timeout supervisor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{CodeLoopConfig, RunConfig};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a code loop is already active")]
    CodeLoopBusy,
    #[error("rate limited; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("unknown run {0}")]
    UnknownRun(i64),
}

/// Cooperative cancellation flag with an optional reason, checked by the
/// runner between iteration steps.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: Option<String>) {
        {
            let mut guard = self
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if guard.is_none() {
                *guard = reason;
            }
        }
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

struct RunHandle {
    cancel: Arc<CancelToken>,
    #[allow(dead_code)]
    join: JoinHandle<()>,
}

/// Sliding-hour window of start times.
#[derive(Default)]
struct RateWindow {
    starts: VecDeque<Instant>,
}

impl RateWindow {
    fn admit(&mut self, now: Instant, max_per_hour: u32) -> Result<(), Duration> {
        let hour = Duration::from_secs(3600);
        if max_per_hour == 0 {
            return Err(hour);
        }
        while let Some(front) = self.starts.front() {
            if now.duration_since(*front) >= hour {
                self.starts.pop_front();
            } else {
                break;
            }
        }
        if self.starts.len() >= max_per_hour as usize {
            let oldest = *self.starts.front().expect("non-empty window");
            return Err(hour.saturating_sub(now.duration_since(oldest)));
        }
        self.starts.push_back(now);
        Ok(())
    }
}

pub struct JobManager {
    runs: Mutex<HashMap<i64, RunHandle>>,
    code_loop_active: AtomicBool,
    code_loop_window: Mutex<RateWindow>,
    run_windows: Mutex<HashMap<String, RateWindow>>,
    run_timeout: Option<Duration>,
    runs_max_per_hour: u32,
    code_loop_max_per_hour: u32,
}

impl JobManager {
    pub fn new(run_cfg: &RunConfig, code_cfg: &CodeLoopConfig) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            code_loop_active: AtomicBool::new(false),
            code_loop_window: Mutex::new(RateWindow::default()),
            run_windows: Mutex::new(HashMap::new()),
            run_timeout: run_cfg.run_timeout_s.map(Duration::from_secs),
            runs_max_per_hour: run_cfg.runs_max_per_hour,
            code_loop_max_per_hour: code_cfg.max_per_hour,
        }
    }

    /// Admit a meta-run start for a client, or reject with a retry-after
    /// hint. Rejections do not enqueue.
    pub fn admit_run(&self, client_id: &str) -> Result<(), JobError> {
        let mut windows = self
            .run_windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        windows
            .entry(client_id.to_string())
            .or_default()
            .admit(Instant::now(), self.runs_max_per_hour)
            .map_err(|retry_after| JobError::RateLimited { retry_after })
    }

    /// Register a spawned run and arm its timeout supervisor.
    pub fn register_run(&self, run_id: i64, cancel: Arc<CancelToken>, join: JoinHandle<()>) {
        if let Some(timeout) = self.run_timeout {
            let watchdog_cancel = Arc::clone(&cancel);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                watchdog_cancel.cancel(Some("timeout".to_string()));
            });
        }
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(run_id, RunHandle { cancel, join });
    }

    /// Toggle a run's cancellation flag. The runner observes it between
    /// iteration steps.
    pub fn cancel_run(&self, run_id: i64) -> Result<(), JobError> {
        let runs = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match runs.get(&run_id) {
            Some(handle) => {
                handle.cancel.cancel(None);
                Ok(())
            }
            None => Err(JobError::UnknownRun(run_id)),
        }
    }

    /// Drop a completed run from the registry.
    pub fn finish_run(&self, run_id: i64) {
        self.runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&run_id);
    }

    pub fn active_runs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Take the global code-loop lock (covers live and dry-run modes) after
    /// passing the sliding-hour rate limit. The permit releases on drop.
    pub fn acquire_code_loop(&self) -> Result<CodeLoopPermit<'_>, JobError> {
        if self
            .code_loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(JobError::CodeLoopBusy);
        }
        let admitted = {
            let mut window = self
                .code_loop_window
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            window.admit(Instant::now(), self.code_loop_max_per_hour)
        };
        if let Err(retry_after) = admitted {
            self.code_loop_active.store(false, Ordering::SeqCst);
            return Err(JobError::RateLimited { retry_after });
        }
        Ok(CodeLoopPermit { mgr: self })
    }
}

/// Holder of the global code-loop lock.
pub struct CodeLoopPermit<'a> {
    mgr: &'a JobManager,
}

impl std::fmt::Debug for CodeLoopPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeLoopPermit").finish()
    }
}

impl Drop for CodeLoopPermit<'_> {
    fn drop(&mut self) {
        self.mgr.code_loop_active.store(false, Ordering::SeqCst);
    }
}
