use crate::config::SensorConfig;
use crate::ingest::Ingestor;
use crate::worker::{SensorWorker, StopReason, WorkerOutcome, WorkerPolicy, WorkerState};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;


/// Starts one worker task per sensor and stops them together.
pub struct FleetOrchestrator {
    ingestor: Arc<dyn Ingestor>,
    policy: WorkerPolicy,
    shutdown_timeout: Option<Duration>,
}

impl FleetOrchestrator {
    pub fn new(ingestor: Arc<dyn Ingestor>, policy: WorkerPolicy) -> Self {
        Self {
            ingestor,
            policy,
            shutdown_timeout: None,
        }
    }

    /// Bounds how long shutdown waits for workers; stragglers are aborted after it.
    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Spawns every worker immediately. Must be called inside a tokio runtime.
    pub fn start(&self, configs: Vec<SensorConfig>) -> Fleet {
        let mut tasks = JoinSet::new();
        let mut slots = Vec::with_capacity(configs.len());

        for config in configs {
            let worker = SensorWorker::new(config, self.ingestor.clone(), self.policy);
            let cancel = CancellationToken::new();
            let sensor_id = worker.config().id.clone();
            tracing::info!(
                sensor_id = %sensor_id,
                location = %worker.config().location,
                "starting sensor worker"
            );
            slots.push(WorkerSlot {
                sensor_id: sensor_id.clone(),
                state: worker.subscribe(),
                cancel: cancel.clone(),
            });

            tasks.spawn(async move {
                match AssertUnwindSafe(worker.run(cancel)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        tracing::error!(sensor_id = %sensor_id, "sensor worker panicked");
                        WorkerOutcome::panicked(sensor_id)
                    }
                }
            });
        }

        tracing::info!(
            sensors = slots.len(),
            "all sensor workers are running; press Ctrl+C to stop them"
        );
        Fleet {
            slots,
            tasks,
            outcomes: Vec::new(),
            shutdown_requested: false,
        }
    }

    /// Runs the fleet until `shutdown` resolves (or every worker has stopped on its own), then
    /// cancels and reaps all workers.
    pub async fn run<F>(&self, configs: Vec<SensorConfig>, shutdown: F) -> FleetReport
    where
        F: Future<Output = ()>,
    {
        let mut fleet = self.start(configs);
        fleet.wait(shutdown).await;
        fleet.shutdown(self.shutdown_timeout).await
    }
}

struct WorkerSlot {
    sensor_id: String,
    state: watch::Receiver<WorkerState>,
    cancel: CancellationToken,
}

impl WorkerSlot {
    // A worker that panicked or was aborted drops its sender without publishing `Stopped`.
    fn current_state(&self) -> WorkerState {
        if self.state.has_changed().is_err() {
            return WorkerState::Stopped;
        }
        *self.state.borrow()
    }
}

/// Live fleet: one slot per worker plus the fleet-wide shutdown flag.
pub struct Fleet {
    slots: Vec<WorkerSlot>,
    tasks: JoinSet<WorkerOutcome>,
    outcomes: Vec<WorkerOutcome>,
    shutdown_requested: bool,
}

impl Fleet {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn states(&self) -> Vec<(String, WorkerState)> {
        self.slots
            .iter()
            .map(|slot| (slot.sensor_id.clone(), slot.current_state()))
            .collect()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// Idles until `shutdown` resolves (returns `true`) or the last worker exits (`false`).
    /// Workers that stop early are reaped along the way and are not restarted.
    pub async fn wait<F>(&mut self, shutdown: F) -> bool
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested; terminating all sensor workers");
                    return true;
                }
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => self.record(joined),
                    None => {
                        tracing::warn!("every sensor worker has stopped on its own");
                        return false;
                    }
                },
            }
        }
    }

    /// Best effort and not atomic across workers: each live worker's token is cancelled in turn.
    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
        for slot in &self.slots {
            if slot.current_state() != WorkerState::Stopped {
                slot.cancel.cancel();
            }
        }
    }

    pub async fn shutdown(mut self, timeout: Option<Duration>) -> FleetReport {
        self.request_shutdown();

        match timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, self.drain()).await.is_err() {
                    tracing::warn!(
                        timeout_secs = limit.as_secs_f64(),
                        remaining = self.tasks.len(),
                        "sensor workers did not stop in time; aborting them"
                    );
                    self.tasks.abort_all();
                    self.drain().await;
                }
            }
            None => self.drain().await,
        }

        let aborted = self
            .slots
            .iter()
            .filter(|slot| !self.outcomes.iter().any(|o| o.sensor_id == slot.sensor_id))
            .map(|slot| slot.sensor_id.clone())
            .collect();
        tracing::info!("all sensor workers have been stopped");

        FleetReport {
            states: self.states(),
            outcomes: self.outcomes,
            aborted,
        }
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.record(joined);
        }
    }

    fn record(&mut self, joined: Result<WorkerOutcome, JoinError>) {
        match joined {
            Ok(outcome) => {
                if outcome.is_failure() && !self.shutdown_requested {
                    tracing::debug!(
                        sensor_id = %outcome.sensor_id,
                        remaining = self.tasks.len(),
                        "sensor worker left the fleet"
                    );
                }
                self.outcomes.push(outcome);
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => tracing::error!(error = %err, "sensor worker task failed"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub outcomes: Vec<WorkerOutcome>,
    /// Workers that had to be aborted after the shutdown timeout.
    pub aborted: Vec<String>,
    /// Final state of every worker once the fleet has been reaped.
    pub states: Vec<(String, WorkerState)>,
}

impl FleetReport {
    pub fn outcome(&self, sensor_id: &str) -> Option<&WorkerOutcome> {
        self.outcomes.iter().find(|o| o.sensor_id == sensor_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &WorkerOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }

    pub fn total_published(&self) -> u64 {
        self.outcomes.iter().map(|o| o.published).sum()
    }

    pub fn log_summary(&self) {
        for outcome in &self.outcomes {
            match &outcome.reason {
                StopReason::Cancelled => tracing::info!(
                    sensor_id = %outcome.sensor_id,
                    published = outcome.published,
                    failed_publishes = outcome.failed_publishes,
                    "sensor stopped"
                ),
                StopReason::Failed(err) => tracing::warn!(
                    sensor_id = %outcome.sensor_id,
                    published = outcome.published,
                    error = %err,
                    "sensor failed"
                ),
                StopReason::Panicked => {
                    tracing::warn!(sensor_id = %outcome.sensor_id, "sensor panicked")
                }
            }
        }
        for sensor_id in &self.aborted {
            tracing::warn!(sensor_id = %sensor_id, "sensor aborted during shutdown");
        }
        tracing::info!(
            sensors = self.outcomes.len() + self.aborted.len(),
            published = self.total_published(),
            "sensor fleet stopped"
        );
    }
}
