use crate::config::{PublishFailurePolicy, SensorConfig};
use crate::error::SensorError;
use crate::ingest::{Connection, Ingestor};
use crate::reading::{self, Reading};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerPolicy {
    pub publish_failure: PublishFailurePolicy,
    /// Upper bound on one publish call; `None` waits as long as the endpoint takes.
    pub publish_timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Shutdown was requested; the normal way out.
    Cancelled,
    Failed(SensorError),
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub sensor_id: String,
    pub published: u64,
    pub failed_publishes: u64,
    pub reason: StopReason,
}

impl WorkerOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self.reason, StopReason::Cancelled)
    }

    pub(crate) fn panicked(sensor_id: String) -> Self {
        Self {
            sensor_id,
            published: 0,
            failed_publishes: 0,
            reason: StopReason::Panicked,
        }
    }
}

/// The sensor's exclusive link to the endpoint. Released exactly once, when dropped, whatever
/// ended the worker: cancellation, an error, a panic, or the task being aborted.
pub struct ConnectionHandle {
    sensor_id: String,
    inner: Option<Box<dyn Connection>>,
}

impl ConnectionHandle {
    fn new(sensor_id: String, connection: Box<dyn Connection>) -> Self {
        Self {
            sensor_id,
            inner: Some(connection),
        }
    }

    async fn publish(&mut self, payload: &[u8]) -> Result<(), SensorError> {
        match self.inner.as_mut() {
            Some(connection) => connection.publish(payload).await,
            None => Err(SensorError::transport("connection already released")),
        }
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(connection) = self.inner.take() {
            connection.release();
            tracing::debug!(sensor_id = %self.sensor_id, "connection released");
        }
    }
}

/// Runs one sensor from `Connecting` to `Stopped`: generate, publish, wait, until cancelled.
pub struct SensorWorker {
    config: SensorConfig,
    ingestor: Arc<dyn Ingestor>,
    policy: WorkerPolicy,
    state: watch::Sender<WorkerState>,
}

impl SensorWorker {
    pub fn new(config: SensorConfig, ingestor: Arc<dyn Ingestor>, policy: WorkerPolicy) -> Self {
        let (state, _) = watch::channel(WorkerState::Connecting);
        Self {
            config,
            ingestor,
            policy,
            state,
        }
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub async fn run(self, cancel: CancellationToken) -> WorkerOutcome {
        let sensor_id = self.config.id.clone();
        let mut published = 0u64;
        let mut failed_publishes = 0u64;

        let reason = self
            .run_inner(&cancel, &mut published, &mut failed_publishes)
            .await;
        self.set_state(WorkerState::Stopped);

        match &reason {
            StopReason::Cancelled => {
                tracing::info!(sensor_id = %sensor_id, published, "stopped sending messages")
            }
            StopReason::Failed(err) => {
                tracing::error!(sensor_id = %sensor_id, published, error = %err, "sensor worker failed")
            }
            StopReason::Panicked => {}
        }

        WorkerOutcome {
            sensor_id,
            published,
            failed_publishes,
            reason,
        }
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        published: &mut u64,
        failed_publishes: &mut u64,
    ) -> StopReason {
        if let Err(err) = self.config.validate() {
            return StopReason::Failed(err);
        }

        self.set_state(WorkerState::Connecting);
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StopReason::Cancelled,
            res = self.ingestor.connect(&self.config) => res,
        };
        let mut handle = match connection {
            Ok(connection) => ConnectionHandle::new(self.config.id.clone(), connection),
            Err(err) => return StopReason::Failed(err),
        };

        self.set_state(WorkerState::Running);
        tracing::info!(
            sensor_id = %self.config.id,
            location = %self.config.location,
            interval_secs = self.config.interval.as_secs_f64(),
            "sending telemetry to ingestion endpoint"
        );

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }

            let reading = reading::generate(&self.config);
            let result = {
                let publish = self.publish(&mut handle, &reading);
                tokio::pin!(publish);
                tokio::select! {
                    biased;
                    res = &mut publish => res,
                    _ = cancel.cancelled() => {
                        // The in-flight publish is drained, not dropped.
                        self.set_state(WorkerState::Stopping);
                        publish.await
                    }
                }
            };
            match result {
                Ok(()) => {
                    *published += 1;
                    tracing::info!(sensor_id = %self.config.id, reading = ?reading, "sent message");
                }
                Err(err) => match self.policy.publish_failure {
                    PublishFailurePolicy::Terminate => break StopReason::Failed(err),
                    PublishFailurePolicy::Continue => {
                        *failed_publishes += 1;
                        tracing::warn!(sensor_id = %self.config.id, error = %err, "publish failed; continuing");
                    }
                },
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        };

        if reason == StopReason::Cancelled {
            self.set_state(WorkerState::Stopping);
        }
        handle.release();
        reason
    }

    async fn publish(&self, handle: &mut ConnectionHandle, reading: &Reading) -> Result<(), SensorError> {
        let payload = reading.to_payload()?;
        match self.policy.publish_timeout {
            Some(limit) => tokio::time::timeout(limit, handle.publish(&payload))
                .await
                .map_err(|_| SensorError::transport(format!("publish timed out after {limit:?}")))?,
            None => handle.publish(&payload).await,
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::debug!(sensor_id = %self.config.id, from = ?*current, to = ?state, "worker state");
            *current = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ConnectBehavior, PublishBehavior, ScriptedIngestor};

    fn sensor(id: &str) -> SensorConfig {
        SensorConfig::new(id, format!("{id} location"), "cs").with_interval(Duration::from_secs(10))
    }

    fn spawn(
        config: SensorConfig,
        ingestor: &ScriptedIngestor,
        policy: WorkerPolicy,
    ) -> (
        tokio::task::JoinHandle<WorkerOutcome>,
        watch::Receiver<WorkerState>,
        CancellationToken,
    ) {
        let worker = SensorWorker::new(config, Arc::new(ingestor.clone()), policy);
        let state = worker.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        (handle, state, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_every_interval_until_cancelled() {
        let ingestor = ScriptedIngestor::new();
        let (handle, state, cancel) = spawn(sensor("a"), &ingestor, WorkerPolicy::default());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(*state.borrow(), WorkerState::Running);
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert_eq!(outcome.published, 3);
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(ingestor.ledger().published_for("a").len(), 3);
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let ingestor = ScriptedIngestor::new();
        let config = sensor("a").with_interval(Duration::from_secs(3600));
        let (handle, _state, cancel) = spawn(config, &ingestor, WorkerPolicy::default());

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancelled_at = tokio::time::Instant::now();
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(tokio::time::Instant::now(), cancelled_at);
        assert_eq!(outcome.published, 1);
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_publish_completes_before_stopping() {
        let ingestor = ScriptedIngestor::new()
            .with_publish("a", PublishBehavior::Delay(Duration::from_secs(4)));
        let (handle, state, cancel) = spawn(sensor("a"), &ingestor, WorkerPolicy::default());

        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert_eq!(outcome.published, 1);
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    async fn record_states(mut state: watch::Receiver<WorkerState>) -> Vec<WorkerState> {
        let mut seen = vec![*state.borrow_and_update()];
        while state.changed().await.is_ok() {
            seen.push(*state.borrow_and_update());
        }
        seen
    }

    // The recorder is spawned before the worker so it sees every transition.
    async fn transitions(
        config: SensorConfig,
        ingestor: &ScriptedIngestor,
        cancel_after: Option<Duration>,
    ) -> Vec<WorkerState> {
        let worker = SensorWorker::new(config, Arc::new(ingestor.clone()), WorkerPolicy::default());
        let recorder = tokio::spawn(record_states(worker.subscribe()));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));
        if let Some(delay) = cancel_after {
            tokio::time::sleep(delay).await;
            cancel.cancel();
        }
        handle.await.unwrap();
        recorder.await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_passes_through_stopping() {
        let ingestor = ScriptedIngestor::new()
            .with_publish("a", PublishBehavior::Delay(Duration::from_secs(4)));
        let seen = transitions(sensor("a"), &ingestor, Some(Duration::from_secs(2))).await;
        assert_eq!(
            seen,
            vec![
                WorkerState::Connecting,
                WorkerState::Running,
                WorkerState::Stopping,
                WorkerState::Stopped,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_skip_stopping() {
        let ingestor = ScriptedIngestor::new()
            .with_connect("refused", ConnectBehavior::Fail)
            .with_publish("broken", PublishBehavior::FailFrom(1));

        let seen = transitions(sensor("refused"), &ingestor, None).await;
        assert_eq!(seen, vec![WorkerState::Connecting, WorkerState::Stopped]);

        let seen = transitions(sensor("broken"), &ingestor, None).await;
        assert_eq!(
            seen,
            vec![WorkerState::Connecting, WorkerState::Running, WorkerState::Stopped]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_stops_without_opening_a_connection() {
        let ingestor = ScriptedIngestor::new().with_connect("a", ConnectBehavior::Fail);
        let (handle, state, _cancel) = spawn(sensor("a"), &ingestor, WorkerPolicy::default());

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome.reason, StopReason::Failed(SensorError::Connection(_))));
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(ingestor.ledger().opened("a"), 0);
        assert_eq!(ingestor.ledger().releases("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_ranges_are_rejected_before_connecting() {
        let mut config = sensor("a");
        config.ranges.ice_thickness.min = 50.0;
        let ingestor = ScriptedIngestor::new();
        let (handle, _state, _cancel) = spawn(config, &ingestor, WorkerPolicy::default());

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome.reason, StopReason::Failed(SensorError::Configuration(_))));
        assert_eq!(ingestor.ledger().connect_attempts("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_terminates_by_default() {
        let ingestor = ScriptedIngestor::new().with_publish("a", PublishBehavior::FailFrom(2));
        let (handle, state, _cancel) = spawn(sensor("a"), &ingestor, WorkerPolicy::default());

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome.reason, StopReason::Failed(SensorError::Transport(_))));
        assert_eq!(outcome.published, 2);
        assert_eq!(*state.borrow(), WorkerState::Stopped);
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_tolerated_under_continue_policy() {
        let ingestor = ScriptedIngestor::new().with_publish("a", PublishBehavior::FailFrom(1));
        let policy = WorkerPolicy {
            publish_failure: PublishFailurePolicy::Continue,
            publish_timeout: None,
        };
        let (handle, _state, cancel) = spawn(sensor("a"), &ingestor, policy);

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        let outcome = handle.await.unwrap();

        assert_eq!(outcome.reason, StopReason::Cancelled);
        assert_eq!(outcome.published, 1);
        assert_eq!(outcome.failed_publishes, 3);
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_timeout_turns_a_hang_into_a_transport_error() {
        let ingestor = ScriptedIngestor::new().with_publish("a", PublishBehavior::Hang);
        let policy = WorkerPolicy {
            publish_failure: PublishFailurePolicy::Terminate,
            publish_timeout: Some(Duration::from_secs(5)),
        };
        let (handle, _state, _cancel) = spawn(sensor("a"), &ingestor, policy);

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome.reason, StopReason::Failed(SensorError::Transport(ref msg)) if msg.contains("timed out")));
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_the_task_still_releases_the_connection() {
        let ingestor = ScriptedIngestor::new();
        let (handle, _state, _cancel) = spawn(sensor("a"), &ingestor, WorkerPolicy::default());

        tokio::time::sleep(Duration::from_secs(15)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(ingestor.ledger().releases("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn every_lifetime_releases_its_connection_exactly_once() {
        let ingestor = ScriptedIngestor::new();
        for cycle in 0..1_000u32 {
            let id = format!("s{cycle}");
            let ingestor = match cycle % 3 {
                0 => ingestor.clone(),
                1 => ingestor.clone().with_connect(&id, ConnectBehavior::Fail),
                _ => ingestor.clone().with_publish(&id, PublishBehavior::FailFrom(cycle as usize % 4)),
            };
            let config = sensor(&id).with_interval(Duration::from_secs(1));
            let (handle, _state, cancel) = spawn(config, &ingestor, WorkerPolicy::default());
            let canceller = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2_500)).await;
                cancel.cancel();
            });
            handle.await.unwrap();
            canceller.await.unwrap();
        }

        let ledger = ingestor.ledger();
        for cycle in 0..1_000u32 {
            let id = format!("s{cycle}");
            assert_eq!(ledger.releases(&id), ledger.opened(&id), "sensor {id}");
            assert!(ledger.releases(&id) <= 1, "sensor {id}");
        }
        assert_eq!(ledger.total_releases(), ledger.total_opened());
    }
}
