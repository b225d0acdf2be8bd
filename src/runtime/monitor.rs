//! Background health sampling and the one-way degradation trigger.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;

/// One health reading of the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    /// `None` when there is no GPU to read.
    pub gpu_memory_pct: Option<f64>,
    pub memory_available_gb: f64,
    pub memory_used_pct: f64,
    pub cpu_pct: f64,
    pub editor_busy: bool,
}

impl MetricsSample {
    pub fn idle() -> Self {
        Self {
            timestamp: Utc::now(),
            gpu_memory_pct: None,
            memory_available_gb: f64::INFINITY,
            memory_used_pct: 0.0,
            cpu_pct: 0.0,
            editor_busy: false,
        }
    }
}

pub trait MetricsSource: Send {
    fn sample(&mut self) -> MetricsSample;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    pub gpu_memory_degrade_pct: f64,
    pub min_available_memory_gb: f64,
    pub failure_rate: f64,
    pub min_task_samples: u64,
    pub cpu_vision_gpu_pct: f64,
    pub cpu_vision_memory_gb: f64,
}

impl From<&MonitorConfig> for Thresholds {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            gpu_memory_degrade_pct: cfg.gpu_memory_degrade_pct,
            min_available_memory_gb: cfg.min_available_memory_gb,
            failure_rate: cfg.failure_rate_threshold,
            min_task_samples: cfg.min_task_samples,
            cpu_vision_gpu_pct: cfg.cpu_vision_gpu_pct,
            cpu_vision_memory_gb: cfg.cpu_vision_memory_gb,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TaskStats {
    pub total: u64,
    pub failed: u64,
}

impl TaskStats {
    pub fn failure_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub latest: Option<MetricsSample>,
    pub task_stats: TaskStats,
    pub failure_rate: f64,
    pub samples: usize,
}

type DegradeCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Default)]
struct MonitorState {
    history: VecDeque<MetricsSample>,
    degraded: bool,
    reason: Option<String>,
    tasks: TaskStats,
}

pub struct RuntimeMonitor {
    thresholds: Thresholds,
    max_history: usize,
    interval: Duration,
    state: Mutex<MonitorState>,
    callbacks: Mutex<Vec<DegradeCallback>>,
    running: AtomicBool,
}

impl RuntimeMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            thresholds: Thresholds::from(config),
            max_history: config.max_history.max(1),
            interval: Duration::from_secs(config.interval_secs.max(1)),
            state: Mutex::new(MonitorState::default()),
            callbacks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Registers a callback run once, with the reason, when the monitor
    /// degrades.
    pub fn on_degrade(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        lock(&self.callbacks).push(Arc::new(callback));
    }

    /// Records a sample and evaluates the degrade predicates. Returns the
    /// reason when this sample flipped the monitor to degraded.
    pub fn observe(&self, sample: MetricsSample) -> Option<String> {
        let flipped = {
            let mut state = lock(&self.state);
            if state.history.len() == self.max_history {
                state.history.pop_front();
            }
            state.history.push_back(sample);
            let reason = state
                .history
                .back()
                .and_then(|latest| self.sample_trigger(latest))
                .or_else(|| self.failure_trigger(&state.tasks));
            reason.and_then(|r| flip(&mut state, r))
        };
        self.fire(flipped.as_deref());
        flipped
    }

    /// Feeds the failure-rate predicate, which is evaluated right away.
    pub fn record_task_result(&self, success: bool) -> Option<String> {
        let flipped = {
            let mut state = lock(&self.state);
            state.tasks.total += 1;
            if !success {
                state.tasks.failed += 1;
            }
            self.failure_trigger(&state.tasks)
                .and_then(|r| flip(&mut state, r))
        };
        self.fire(flipped.as_deref());
        flipped
    }

    /// Decided from the latest sample only. No sample means no pressure.
    pub fn should_use_cpu_for_vision(&self) -> bool {
        let state = lock(&self.state);
        let Some(latest) = state.history.back() else {
            return false;
        };
        latest
            .gpu_memory_pct
            .is_some_and(|pct| pct > self.thresholds.cpu_vision_gpu_pct)
            || latest.editor_busy
            || latest.memory_available_gb < self.thresholds.cpu_vision_memory_gb
    }

    pub fn is_degraded(&self) -> bool {
        lock(&self.state).degraded
    }

    pub fn status(&self) -> MonitorStatus {
        let state = lock(&self.state);
        MonitorStatus {
            running: self.running.load(Ordering::SeqCst),
            degraded: state.degraded,
            degraded_reason: state.reason.clone(),
            latest: state.history.back().cloned(),
            task_stats: state.tasks,
            failure_rate: state.tasks.failure_rate(),
            samples: state.history.len(),
        }
    }

    /// Samples taken within the last `window`, oldest first.
    pub fn history(&self, window: chrono::Duration) -> Vec<MetricsSample> {
        let cutoff = Utc::now() - window;
        lock(&self.state)
            .history
            .iter()
            .filter(|s| s.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Samples `source` every interval until `shutdown` is cancelled.
    pub async fn run<S>(self: Arc<Self>, mut source: S, shutdown: CancellationToken)
    where
        S: MetricsSource + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("runtime monitor already running");
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "runtime monitor started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            // Sources may shell out (nvidia-smi), so sampling stays off the runtime threads.
            let sampled = tokio::task::spawn_blocking(move || {
                let sample = source.sample();
                (source, sample)
            })
            .await;
            let sample = match sampled {
                Ok((returned, sample)) => {
                    source = returned;
                    sample
                }
                Err(e) => {
                    error!(error = %e, "metrics source panicked; monitor stopping");
                    break;
                }
            };
            debug!(
                gpu_memory_pct = ?sample.gpu_memory_pct,
                memory_available_gb = sample.memory_available_gb,
                cpu_pct = sample.cpu_pct,
                editor_busy = sample.editor_busy,
                "runtime sample"
            );
            self.observe(sample);
        }

        self.running.store(false, Ordering::SeqCst);
        info!("runtime monitor stopped");
    }

    fn sample_trigger(&self, sample: &MetricsSample) -> Option<String> {
        let t = &self.thresholds;
        if let Some(pct) = sample.gpu_memory_pct
            && pct > t.gpu_memory_degrade_pct
        {
            return Some(format!(
                "GPU memory at {pct:.1}% (limit {:.0}%)",
                t.gpu_memory_degrade_pct
            ));
        }
        if sample.memory_available_gb < t.min_available_memory_gb {
            return Some(format!(
                "available memory {:.2}GB below {:.1}GB",
                sample.memory_available_gb, t.min_available_memory_gb
            ));
        }
        None
    }

    fn failure_trigger(&self, tasks: &TaskStats) -> Option<String> {
        let rate = tasks.failure_rate();
        (tasks.total >= self.thresholds.min_task_samples && rate > self.thresholds.failure_rate)
            .then(|| {
                format!(
                    "task failure rate {:.0}% over {} tasks",
                    rate * 100.0,
                    tasks.total
                )
            })
    }

    fn fire(&self, reason: Option<&str>) {
        let Some(reason) = reason else {
            return;
        };
        warn!(reason, "runtime degraded");
        let callbacks: Vec<DegradeCallback> = lock(&self.callbacks).clone();
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(reason))).is_err() {
                error!(reason, "degrade callback panicked");
            }
        }
    }
}

fn flip(state: &mut MonitorState, reason: String) -> Option<String> {
    if state.degraded {
        return None;
    }
    state.degraded = true;
    state.reason = Some(reason.clone());
    Some(reason)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
