use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    error::SimulationError,
    runner::{ResultRecord, ScenarioResult, ScenarioStatus},
    types::TokenUsage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::PartiallyFailed | BatchStatus::Cancelled)
    }
}

/// A set of scenarios submitted together. `results[i]` belongs to the i-th
/// submitted scenario no matter when it finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub status: BatchStatus,
    pub scenario_names: Vec<String>,
    pub results: Vec<Option<ScenarioResult>>,
    /// Slots filled so far, whatever their status.
    pub completed: usize,
    pub failed: usize,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(batch_id: impl Into<String>, scenario_names: Vec<String>) -> Self {
        let total = scenario_names.len();
        Self {
            batch_id: batch_id.into(),
            status: BatchStatus::Pending,
            scenario_names,
            results: vec![None; total],
            completed: 0,
            failed: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn progress(&self) -> f64 {
        if self.total() == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total() as f64 * 100.0
    }

    pub fn is_full(&self) -> bool {
        self.results.iter().all(Option::is_some)
    }

    /// Filled slots in submission order.
    pub fn finished_results(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.iter().flatten()
    }

    pub fn records(&self) -> Vec<ResultRecord> {
        self.finished_results().map(ScenarioResult::record).collect()
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.batch_id.clone(),
            status: self.status,
            total: self.total(),
            completed: self.completed,
            failed: self.failed,
            progress: self.progress(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary {
            total: self.total(),
            ..BatchSummary::default()
        };

        let mut scores = Vec::new();
        let mut turns = 0usize;
        let mut duration = 0.0f64;
        let mut finished = 0usize;

        for result in self.finished_results() {
            finished += 1;
            turns += result.turn_count;
            duration += result.duration_seconds;
            summary.usage_totals += result.usage_totals;

            match result.status {
                ScenarioStatus::Completed => summary.completed += 1,
                ScenarioStatus::Failed => summary.failed += 1,
                ScenarioStatus::Timeout => summary.timed_out += 1,
                ScenarioStatus::Cancelled => summary.cancelled += 1,
            }

            if let Some(score) = result.score() {
                scores.push(score);
                let bucket = match score {
                    1 => &mut summary.score_distribution.poor,
                    2 => &mut summary.score_distribution.fair,
                    _ => &mut summary.score_distribution.excellent,
                };
                *bucket += 1;
            }
        }

        if !scores.is_empty() {
            let sum: u32 = scores.iter().map(|&score| u32::from(score)).sum();
            summary.average_score = Some(f64::from(sum) / scores.len() as f64);
        }
        if finished > 0 {
            summary.average_turns = turns as f64 / finished as f64;
            summary.average_duration_seconds = duration / finished as f64;
        }
        summary
    }

    fn record(&mut self, index: usize, result: ScenarioResult) -> bool {
        let Some(slot) = self.results.get_mut(index) else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        if result.status == ScenarioStatus::Failed {
            self.failed += 1;
        }
        self.completed += 1;
        *slot = Some(result);
        true
    }

    fn final_status(&self, cancelled: bool) -> BatchStatus {
        if cancelled {
            BatchStatus::Cancelled
        } else if self.failed > 0 {
            BatchStatus::PartiallyFailed
        } else {
            BatchStatus::Completed
        }
    }
}

/// Read-only view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: String,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub poor: usize,
    pub fair: usize,
    pub excellent: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub average_score: Option<f64>,
    pub score_distribution: ScoreDistribution,
    pub average_turns: f64,
    pub average_duration_seconds: f64,
    pub usage_totals: TokenUsage,
}

struct Entry {
    batch: Batch,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

/// Process-wide table of batches keyed by id. Cloning shares the table.
/// Every mutation of a batch goes through one of these methods.
#[derive(Clone, Default)]
pub struct BatchRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<T>(&self, batch_id: &str, f: impl FnOnce(&mut Entry) -> T) -> Result<T, SimulationError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(batch_id)
            .ok_or_else(|| SimulationError::UnknownBatch(batch_id.to_string()))?;
        Ok(f(entry))
    }

    /// Registers a pending batch and returns its cancellation token.
    pub fn insert(&self, batch: Batch) -> CancellationToken {
        let cancel = CancellationToken::new();
        let (done, _) = watch::channel(false);
        self.lock().insert(
            batch.batch_id.clone(),
            Entry {
                batch,
                cancel: cancel.clone(),
                done,
            },
        );
        cancel
    }

    pub fn snapshot(&self, batch_id: &str) -> Result<BatchSnapshot, SimulationError> {
        self.with_entry(batch_id, |entry| entry.batch.snapshot())
    }

    pub fn get(&self, batch_id: &str) -> Result<Batch, SimulationError> {
        self.with_entry(batch_id, |entry| entry.batch.clone())
    }

    /// Snapshots of every batch, newest first.
    pub fn list(&self) -> Vec<BatchSnapshot> {
        let mut snapshots: Vec<_> = self.lock().values().map(|entry| entry.batch.snapshot()).collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    pub fn mark_running(&self, batch_id: &str) -> Result<(), SimulationError> {
        self.with_entry(batch_id, |entry| {
            entry.batch.status = BatchStatus::Running;
            entry.batch.started_at = Some(Utc::now());
        })
    }

    /// Writes the result for slot `index`. Returns `false` if the slot was
    /// already filled or does not exist.
    pub fn record(&self, batch_id: &str, index: usize, result: ScenarioResult) -> Result<bool, SimulationError> {
        self.with_entry(batch_id, |entry| entry.batch.record(index, result))
    }

    /// Fills every empty slot with the result produced by `fill`.
    pub fn fill_missing(
        &self,
        batch_id: &str,
        mut fill: impl FnMut(usize, &str) -> ScenarioResult,
    ) -> Result<usize, SimulationError> {
        self.with_entry(batch_id, |entry| {
            let batch = &mut entry.batch;
            let empty: Vec<usize> = (0..batch.total()).filter(|&i| batch.results[i].is_none()).collect();
            for &index in &empty {
                let result = fill(index, &batch.scenario_names[index]);
                batch.record(index, result);
            }
            empty.len()
        })
    }

    /// Sets the terminal status and wakes every waiter.
    pub fn finalize(&self, batch_id: &str) -> Result<BatchSnapshot, SimulationError> {
        self.with_entry(batch_id, |entry| {
            entry.batch.status = entry.batch.final_status(entry.cancel.is_cancelled());
            entry.batch.completed_at = Some(Utc::now());
            entry.done.send_replace(true);
            entry.batch.snapshot()
        })
    }

    /// Signals cancellation. Returns `false` when the batch already finished.
    pub fn cancel(&self, batch_id: &str) -> Result<bool, SimulationError> {
        self.with_entry(batch_id, |entry| {
            if entry.batch.status.is_terminal() {
                return false;
            }
            entry.cancel.cancel();
            true
        })
    }

    pub fn subscribe(&self, batch_id: &str) -> Result<watch::Receiver<bool>, SimulationError> {
        self.with_entry(batch_id, |entry| entry.done.subscribe())
    }

    pub fn remove(&self, batch_id: &str) -> Option<Batch> {
        self.lock().remove(batch_id).map(|entry| entry.batch)
    }

    /// Drops terminal batches that finished more than `max_age` ago and
    /// returns their ids.
    pub fn reap_finished(&self, max_age: Duration) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Vec::new();
        };
        let mut entries = self.lock();

        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.batch.status.is_terminal()
                    && entry.batch.completed_at.map_or(false, |done| done <= cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            entries.remove(id);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "reaped finished batches");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        evaluator::parse_evaluation,
        runner::{FailureKind, ScenarioFailure},
        transcript::TerminationReason,
    };

    fn completed(name: &str, score: u8, turns: usize) -> ScenarioResult {
        let mut result = ScenarioResult::failed("s", name, ScenarioFailure::new(FailureKind::Fatal, "placeholder"));
        result.status = ScenarioStatus::Completed;
        result.error = None;
        result.termination_reason = Some(TerminationReason::ClientEnded);
        result.turn_count = turns;
        result.duration_seconds = 2.0;
        result.usage_totals = TokenUsage::new(10, 5);
        result.evaluation = Some(parse_evaluation(&format!(r#"{{"score": {score}, "comment": "ok"}}"#)));
        result
    }

    fn failed(name: &str) -> ScenarioResult {
        ScenarioResult::failed("s", name, ScenarioFailure::new(FailureKind::Fatal, "boom"))
    }

    fn batch(names: &[&str]) -> Batch {
        Batch::new("b-1", names.iter().map(|name| name.to_string()).collect())
    }

    #[test]
    fn slots_are_written_by_index_once() {
        let mut batch = batch(&["a", "b", "c"]);
        assert!(batch.record(1, completed("b", 3, 2)));
        assert!(!batch.record(1, failed("b")));
        assert!(!batch.record(7, failed("x")));

        assert_eq!(batch.completed, 1);
        assert_eq!(batch.failed, 0);
        assert!(batch.results[0].is_none());
        assert_eq!(batch.results[1].as_ref().map(|r| r.scenario_name.as_str()), Some("b"));
        assert!((batch.progress() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn summary_aggregates_scores_and_statuses() {
        let mut batch = batch(&["a", "b", "c"]);
        batch.record(0, completed("a", 3, 2));
        batch.record(1, completed("b", 2, 4));
        batch.record(2, failed("c"));

        let summary = batch.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.average_score, Some(2.5));
        assert_eq!(summary.score_distribution, ScoreDistribution { poor: 0, fair: 1, excellent: 1 });
        assert_eq!(summary.average_turns, 2.0);
        assert_eq!(summary.usage_totals, TokenUsage::new(20, 10));
    }

    #[test]
    fn finalize_picks_status_from_failures() {
        let registry = BatchRegistry::new();
        registry.insert(batch(&["a", "b"]));
        registry.mark_running("b-1").unwrap();
        registry.record("b-1", 0, completed("a", 3, 1)).unwrap();
        registry.record("b-1", 1, failed("b")).unwrap();

        let snapshot = registry.finalize("b-1").unwrap();
        assert_eq!(snapshot.status, BatchStatus::PartiallyFailed);
        assert_eq!(snapshot.failed, 1);
        assert!(snapshot.completed_at.is_some());
        assert!(*registry.subscribe("b-1").unwrap().borrow());
        assert!(!registry.cancel("b-1").unwrap());
    }

    #[test]
    fn unknown_batches_are_errors() {
        let registry = BatchRegistry::new();
        assert!(matches!(registry.snapshot("nope"), Err(SimulationError::UnknownBatch(_))));
        assert!(registry.remove("nope").is_none());
    }

    #[test]
    fn reaps_only_old_terminal_batches() {
        let registry = BatchRegistry::new();
        registry.insert(Batch::new("running", vec!["a".into()]));
        registry.insert(Batch::new("done", vec![]));
        registry.finalize("done").unwrap();

        assert!(registry.reap_finished(Duration::from_secs(3600)).is_empty());
        assert_eq!(registry.reap_finished(Duration::ZERO), vec!["done".to_string()]);
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.snapshot("running").unwrap().status, BatchStatus::Pending);
    }
}
