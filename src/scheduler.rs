use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    batch::{Batch, BatchRegistry, BatchSnapshot, BatchStatus},
    error::SimulationError,
    retry::RetryPolicy,
    runner::{FailureKind, ScenarioExecutor, ScenarioFailure, ScenarioResult, ScenarioStatus},
    scenario::ScenarioSpec,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound on scenarios executing at once.
    pub concurrency: usize,
    /// Re-runs of a whole scenario whose failure is classified retryable.
    pub scenario_retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            scenario_retry: RetryPolicy::new(1, Duration::from_secs(1)),
        }
    }
}

impl SchedulerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_scenario_retry(mut self, retry: RetryPolicy) -> Self {
        self.scenario_retry = retry;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started {
        batch_id: String,
        total: usize,
    },
    ScenarioFinished {
        batch_id: String,
        index: usize,
        scenario: String,
        status: ScenarioStatus,
        attempts: u32,
        progress: f64,
    },
    Finished {
        batch_id: String,
        status: BatchStatus,
    },
}

type EventCallback = Arc<dyn Fn(&BatchEvent) + Send + Sync>;

/// Runs batches of scenarios with bounded concurrency and keeps their state
/// in a [`BatchRegistry`].
pub struct BatchScheduler {
    executor: Arc<dyn ScenarioExecutor>,
    registry: BatchRegistry,
    config: SchedulerConfig,
    event_callback: Option<EventCallback>,
}

impl BatchScheduler {
    pub fn new(executor: Arc<dyn ScenarioExecutor>, registry: BatchRegistry, config: SchedulerConfig) -> Self {
        Self {
            executor,
            registry,
            config,
            event_callback: None,
        }
    }

    pub fn with_event_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&BatchEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn registry(&self) -> &BatchRegistry {
        &self.registry
    }

    /// Registers the batch and starts driving it in the background. Must be
    /// called from within a tokio runtime.
    pub fn submit(&self, specs: Vec<ScenarioSpec>) -> Result<String, SimulationError> {
        if self.config.concurrency == 0 {
            return Err(SimulationError::InvalidConfig("concurrency must be at least 1".into()));
        }

        let batch_id = Uuid::new_v4().to_string();
        let names = specs.iter().map(|spec| spec.name.clone()).collect();
        let cancel = self.registry.insert(Batch::new(batch_id.clone(), names));

        let dispatcher = Dispatcher {
            executor: Arc::clone(&self.executor),
            registry: self.registry.clone(),
            batch_id: batch_id.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.concurrency)),
            retry: self.config.scenario_retry,
            cancel,
            event_callback: self.event_callback.clone(),
        };
        tokio::spawn(dispatcher.drive(specs));

        Ok(batch_id)
    }

    pub fn status(&self, batch_id: &str) -> Result<BatchSnapshot, SimulationError> {
        self.registry.snapshot(batch_id)
    }

    pub fn batch(&self, batch_id: &str) -> Result<Batch, SimulationError> {
        self.registry.get(batch_id)
    }

    pub fn cancel(&self, batch_id: &str) -> Result<bool, SimulationError> {
        let cancelled = self.registry.cancel(batch_id)?;
        if cancelled {
            tracing::info!(batch_id, "batch cancellation requested");
        }
        Ok(cancelled)
    }

    /// Resolves once the batch reaches a terminal status.
    pub async fn wait(&self, batch_id: &str) -> Result<Batch, SimulationError> {
        let mut done = self.registry.subscribe(batch_id)?;
        done.wait_for(|finished| *finished)
            .await
            .map(|_| ())
            .map_err(|_| SimulationError::UnknownBatch(batch_id.to_string()))?;
        self.registry.get(batch_id)
    }

    pub async fn run(&self, specs: Vec<ScenarioSpec>) -> Result<Batch, SimulationError> {
        let batch_id = self.submit(specs)?;
        self.wait(&batch_id).await
    }
}

#[derive(Clone)]
struct Dispatcher {
    executor: Arc<dyn ScenarioExecutor>,
    registry: BatchRegistry,
    batch_id: String,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    event_callback: Option<EventCallback>,
}

impl Dispatcher {
    /// A panicking callback is logged and otherwise ignored so the batch still
    /// reaches a terminal status.
    fn emit_event(&self, event: &BatchEvent) {
        if let Some(callback) = &self.event_callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::error!(batch_id = %self.batch_id, "batch event callback panicked");
            }
        }
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
        }
    }

    async fn drive(self, specs: Vec<ScenarioSpec>) {
        let batch_id = self.batch_id.clone();
        let total = specs.len();
        if let Err(err) = self.registry.mark_running(&batch_id) {
            tracing::error!(batch_id = %batch_id, error = %err, "batch vanished before start");
            return;
        }
        tracing::info!(batch_id = %batch_id, total, "batch started");
        self.emit_event(&BatchEvent::Started {
            batch_id: batch_id.clone(),
            total,
        });

        let mut dispatched = vec![false; total];
        let mut workers = JoinSet::new();
        for (index, spec) in specs.into_iter().enumerate() {
            let Some(permit) = self.acquire().await else {
                tracing::info!(batch_id = %batch_id, remaining = total - index, "dispatch stopped by cancellation");
                break;
            };
            dispatched[index] = true;
            let worker = self.clone();
            workers.spawn(async move { worker.run_slot(index, spec, permit).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(batch_id = %batch_id, error = %err, "scenario worker aborted");
            }
        }

        let filled = self.registry.fill_missing(&batch_id, |index, name| {
            if dispatched[index] {
                ScenarioResult::failed(
                    String::new(),
                    name,
                    ScenarioFailure::new(FailureKind::Internal, "worker ended without a result"),
                )
            } else {
                ScenarioResult::not_started(name)
            }
        });
        if let Ok(count) = filled {
            if count > 0 {
                tracing::warn!(batch_id = %batch_id, count, "filled empty result slots");
            }
        }

        match self.registry.finalize(&batch_id) {
            Ok(snapshot) => {
                tracing::info!(
                    batch_id = %batch_id,
                    status = ?snapshot.status,
                    completed = snapshot.completed,
                    failed = snapshot.failed,
                    "batch finished"
                );
                self.emit_event(&BatchEvent::Finished {
                    batch_id,
                    status: snapshot.status,
                });
            }
            Err(err) => tracing::error!(batch_id = %batch_id, error = %err, "batch removed while running"),
        }
    }

    /// Runs one scenario, re-running it on retryable failure. The permit is
    /// released for the duration of each backoff.
    async fn run_slot(self, index: usize, spec: ScenarioSpec, permit: OwnedSemaphorePermit) {
        let mut permit = Some(permit);
        let mut attempt = 1u32;

        let result = loop {
            let mut result = self.executor.execute(&spec, &self.cancel).await;
            result.attempts = attempt;

            if !result.is_retryable() || !self.retry.allows(attempt) || self.cancel.is_cancelled() {
                break result;
            }

            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                batch_id = %self.batch_id,
                scenario = %spec.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = ?result.error.as_ref().map(|error| error.message.as_str()),
                "retrying scenario"
            );
            drop(permit.take());

            let resumed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            if !resumed {
                break result;
            }
            match self.acquire().await {
                Some(next) => permit = Some(next),
                None => break result,
            }
            attempt += 1;
        };
        drop(permit);

        let status = result.status;
        let attempts = result.attempts;
        match self.registry.record(&self.batch_id, index, result) {
            Ok(true) => {
                let progress = self
                    .registry
                    .snapshot(&self.batch_id)
                    .map(|snapshot| snapshot.progress)
                    .unwrap_or_default();
                self.emit_event(&BatchEvent::ScenarioFinished {
                    batch_id: self.batch_id.clone(),
                    index,
                    scenario: spec.name,
                    status,
                    attempts,
                    progress,
                });
            }
            Ok(false) => tracing::warn!(batch_id = %self.batch_id, index, "result slot already filled"),
            Err(err) => tracing::error!(batch_id = %self.batch_id, error = %err, "could not record result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;

    use super::*;

    /// Counts how many scenarios run at the same time.
    struct GaugeExecutor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ScenarioExecutor for GaugeExecutor {
        async fn execute(&self, spec: &ScenarioSpec, _cancel: &CancellationToken) -> ScenarioResult {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut result = ScenarioResult::not_started(&spec.name);
            result.status = ScenarioStatus::Completed;
            result.termination_reason = None;
            result.error = None;
            result
        }
    }

    #[tokio::test(start_paused = true)]
    async fn respects_concurrency_bound() {
        let executor = Arc::new(GaugeExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let scheduler = BatchScheduler::new(
            executor.clone(),
            BatchRegistry::new(),
            SchedulerConfig::default().with_concurrency(2),
        )
        .with_event_callback(move |event| sink.lock().unwrap().push(event.clone()));

        let specs = (0..6).map(|i| ScenarioSpec::new(format!("s{i}"))).collect();
        let batch = scheduler.run(specs).await.unwrap();

        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.completed, 6);

        let events = events.lock().unwrap();
        assert!(matches!(events.first(), Some(BatchEvent::Started { total: 6, .. })));
        assert!(matches!(events.last(), Some(BatchEvent::Finished { status: BatchStatus::Completed, .. })));
        assert_eq!(
            events
                .iter()
                .filter(|event| matches!(event, BatchEvent::ScenarioFinished { .. }))
                .count(),
            6
        );
    }

    #[tokio::test]
    async fn panicking_event_callback_does_not_stall_the_batch() {
        let executor = Arc::new(GaugeExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = BatchScheduler::new(executor, BatchRegistry::new(), SchedulerConfig::default())
            .with_event_callback(|_| panic!("observer failed"));

        let specs = (0..3).map(|i| ScenarioSpec::new(format!("s{i}"))).collect();
        let batch = scheduler.run(specs).await.unwrap();

        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.completed, 3);
        assert!(batch.status.is_terminal());
    }

    #[tokio::test]
    async fn rejects_zero_concurrency() {
        let executor = Arc::new(GaugeExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = BatchScheduler::new(executor, BatchRegistry::new(), SchedulerConfig::default().with_concurrency(0));
        assert!(matches!(scheduler.submit(vec![]), Err(SimulationError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn empty_batch_completes_immediately() {
        let executor = Arc::new(GaugeExecutor {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let scheduler = BatchScheduler::new(executor, BatchRegistry::new(), SchedulerConfig::default());
        let batch = scheduler.run(Vec::new()).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.progress(), 100.0);
    }
}
