//! Periodic reconciliation between the ephemeral and durable stores.
//!
//! Each job is wrapped in a [`PeriodicJob`] that owns its timer task, can be
//! started and stopped independently, and keeps a status snapshot for
//! `/health`.

pub mod expiry;
pub mod stats;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{oneshot, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

pub use expiry::ExpirySweeper;
pub use stats::StatsAggregator;

/// What one run of a job got through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub processed: u64,
    pub failed: u64,
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self) -> anyhow::Result<JobOutcome>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatus {
    pub name: &'static str,
    pub running: bool,
    pub interval_secs: u64,
    pub runs: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
    pub last_error: Option<String>,
}

struct Shared {
    job: Arc<dyn Job>,
    status: RwLock<JobStatus>,
    // Held for the length of a run so a manual run never overlaps a tick.
    gate: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn run_and_record(&self) -> anyhow::Result<JobOutcome> {
        let _gate = self.gate.lock().await;
        let name = self.job.name();
        debug!("{}: run started", name);

        let result = self.job.run().await;

        let mut status = self.status.write().await;
        status.runs += 1;
        status.last_run = Some(Utc::now());
        match &result {
            Ok(outcome) => {
                status.last_outcome = Some(*outcome);
                status.last_error = if outcome.failed > 0 {
                    Some(format!("{} item(s) failed and will be retried", outcome.failed))
                } else {
                    None
                };
                if outcome.processed > 0 || outcome.failed > 0 {
                    info!(
                        "{}: processed {}, failed {}",
                        name, outcome.processed, outcome.failed
                    );
                }
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                error!("{}: run failed: {:#}", name, e);
            }
        }
        result
    }
}

pub struct PeriodicJob {
    shared: Arc<Shared>,
    interval: Duration,
    task: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl PeriodicJob {
    pub fn new(job: impl Job, interval: Duration) -> Self {
        let status = JobStatus {
            name: job.name(),
            interval_secs: interval.as_secs(),
            ..JobStatus::default()
        };
        Self {
            shared: Arc::new(Shared {
                job: Arc::new(job),
                status: RwLock::new(status),
                gate: tokio::sync::Mutex::new(()),
            }),
            interval,
            task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.job.name()
    }

    /// Spawn the timer task. The first run happens one interval from now.
    /// Starting a job that is already running does nothing.
    pub fn start(&self) {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.is_some() {
            warn!("{}: already running", self.name());
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let period = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        // Errors are recorded in the status; the next tick retries.
                        let _ = shared.run_and_record().await;
                    }
                }
            }
        });
        *task = Some((stop_tx, handle));
        info!("{}: started, every {:?}", self.name(), self.interval);
    }

    /// Stop the timer task, letting a run in progress finish first.
    pub async fn stop(&self) {
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some((stop_tx, handle)) = task else {
            return;
        };
        let _ = stop_tx.send(());
        if let Err(e) = handle.await {
            error!("{}: task ended abnormally: {}", self.name(), e);
        }
        info!("{}: stopped", self.name());
    }

    /// Run immediately, outside the timer.
    pub async fn run_once(&self) -> anyhow::Result<JobOutcome> {
        self.shared.run_and_record().await
    }

    pub fn is_running(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    pub async fn status(&self) -> JobStatus {
        let mut status = self.shared.status.read().await.clone();
        status.running = self.is_running();
        status
    }
}
