//! Bounded, batched execution of transfers.
//!
//! The work set is split into fixed-size batches that run strictly one after
//! another. Inside a batch every item gets its own task, and a counting
//! semaphore keeps at most `max_concurrency` of them mid-transfer. A batch is
//! done when every task has produced an outcome; failures are recorded and
//! never cancel siblings.

use crate::diff::WorkItem;
use crate::error::{FailureKind, TransferError};
use crate::transfer::{Origin, TransferOutcome, TransferWorker};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One failed item, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub key: String,
    pub reason: String,
    pub kind: FailureKind,
    pub partial_bytes: u64,
}

/// Aggregate of the outcomes of one batch, or of several merged batches.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub items: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Bytes fetched from the source and committed.
    pub bytes_transferred: u64,
    /// Bytes re-hashed in place at the destination.
    pub bytes_verified: u64,
    /// Bytes streamed by items that then failed.
    pub partial_bytes: u64,
    /// Successes verified in place at the destination instead of fetched.
    pub served_from_destination: usize,
    /// Highest number of transfers observed in flight at once.
    pub peak_in_flight: usize,
    /// First failures, bounded by the scheduler's limit.
    pub failures: Vec<FailureRecord>,
    /// Keys whose transfer succeeded.
    #[serde(skip)]
    pub completed: Vec<String>,
}

impl BatchReport {
    /// Folds `other` into `self`, keeping at most `max_failures` records.
    pub fn merge(&mut self, other: BatchReport, max_failures: usize) {
        self.items += other.items;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.bytes_transferred += other.bytes_transferred;
        self.bytes_verified += other.bytes_verified;
        self.partial_bytes += other.partial_bytes;
        self.served_from_destination += other.served_from_destination;
        self.peak_in_flight = self.peak_in_flight.max(other.peak_in_flight);
        let room = max_failures.saturating_sub(self.failures.len());
        self.failures.extend(other.failures.into_iter().take(room));
        self.completed.extend(other.completed);
    }

    fn record(&mut self, key: String, outcome: TransferOutcome, max_failures: usize) {
        self.items += 1;
        match outcome {
            TransferOutcome::Succeeded {
                bytes_transferred,
                origin,
                ..
            } => {
                self.succeeded += 1;
                match origin {
                    Origin::Source => self.bytes_transferred += bytes_transferred,
                    Origin::Destination => {
                        self.bytes_verified += bytes_transferred;
                        self.served_from_destination += 1;
                    }
                }
                self.completed.push(key);
            }
            TransferOutcome::Failed {
                error,
                partial_bytes,
            } => {
                self.failed += 1;
                self.partial_bytes += partial_bytes;
                if self.failures.len() < max_failures {
                    self.failures.push(FailureRecord {
                        key,
                        reason: error.to_string(),
                        kind: error.kind(),
                        partial_bytes,
                    });
                }
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

/// Result of scheduling a whole work set.
#[derive(Debug, Default)]
pub struct ScheduleOutcome {
    pub report: BatchReport,
    /// Items never dispatched because the run was interrupted.
    pub unprocessed: usize,
    pub interrupted: bool,
}

/// Counts transfers in flight and remembers the peak.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Drives a [`TransferWorker`] over a work set.
pub struct Scheduler {
    worker: Arc<TransferWorker>,
    max_concurrency: usize,
    batch_size: usize,
    max_reported_failures: usize,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        worker: TransferWorker,
        max_concurrency: usize,
        batch_size: usize,
        max_reported_failures: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker: Arc::new(worker),
            max_concurrency: max_concurrency.max(1),
            batch_size: batch_size.max(1),
            max_reported_failures,
            cancel,
        }
    }

    /// Runs every batch in order. Cancellation is checked between batches;
    /// a batch that already started always drains.
    pub async fn run(&self, items: Vec<WorkItem>) -> ScheduleOutcome {
        let total = items.len();
        let batches = total.div_ceil(self.batch_size);
        let limiter = Arc::new(Semaphore::new(self.max_concurrency));
        let mut outcome = ScheduleOutcome::default();

        for (index, batch) in items.chunks(self.batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                outcome.interrupted = true;
                outcome.unprocessed = total - outcome.report.items;
                warn!(
                    "Interrupted: stopping before batch {}/{}, {} items not started",
                    index + 1,
                    batches,
                    outcome.unprocessed
                );
                break;
            }

            info!(
                "Batch {}/{}: {} items, up to {} at a time",
                index + 1,
                batches,
                batch.len(),
                self.max_concurrency
            );
            let report = self.run_batch(batch, &limiter).await;
            if !report.is_clean() {
                warn!(
                    "Batch {}/{} finished with {} failed items",
                    index + 1,
                    batches,
                    report.failed
                );
            }
            outcome.report.merge(report, self.max_reported_failures);
        }

        outcome
    }

    /// Runs one batch to completion and aggregates its outcomes.
    pub async fn run_batch(&self, batch: &[WorkItem], limiter: &Arc<Semaphore>) -> BatchReport {
        let gauge = Arc::new(InFlight::default());
        let mut tasks = Vec::with_capacity(batch.len());

        for item in batch {
            let worker = Arc::clone(&self.worker);
            let limiter = Arc::clone(limiter);
            let gauge = Arc::clone(&gauge);
            let item = item.clone();
            let key = item.key().to_string();

            let task = tokio::spawn(async move {
                let outcome = match limiter.acquire_owned().await {
                    Ok(_permit) => {
                        let _in_flight = gauge.enter();
                        worker.transfer(&item).await
                    }
                    Err(_) => TransferOutcome::Failed {
                        error: TransferError::LimiterClosed,
                        partial_bytes: 0,
                    },
                };
                worker.progress().complete_item(item.key());
                outcome
            });
            tasks.push((key, task));
        }

        let mut report = BatchReport::default();
        for (key, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Transfer task for {} failed: {}", key, e);
                    self.worker.progress().complete_item(&key);
                    TransferOutcome::Failed {
                        error: TransferError::Panicked(e.to_string()),
                        partial_bytes: 0,
                    }
                }
            };
            report.record(key, outcome, self.max_reported_failures);
        }
        report.peak_in_flight = gauge.peak();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;
    use crate::progress::{NoProgress, Progress};
    use crate::store::{LocalStore, Store};
    use crate::verify::compute_file_sha256;
    use std::path::Path;

    async fn fixture(source: &Path, count: usize) -> Vec<WorkItem> {
        let mut items = Vec::new();
        for i in 0..count {
            let key = format!("sig-{:03}", i);
            let path = source.join(&key);
            let body = vec![b'x'; 1000 + i];
            std::fs::write(&path, &body).unwrap();
            let hash = compute_file_sha256(path).await.unwrap();
            items.push(WorkItem {
                entry: ManifestEntry::new(key)
                    .with_hash(hash)
                    .with_size(body.len() as u64),
            });
        }
        items
    }

    fn scheduler(
        source: &Path,
        destination: &Path,
        max_concurrency: usize,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Scheduler {
        let worker = TransferWorker::new(
            Store::Local(LocalStore::new(source)),
            Store::Local(LocalStore::new(destination)),
            None,
            Arc::new(Progress::new(0, Arc::new(NoProgress))),
        );
        Scheduler::new(worker, max_concurrency, batch_size, 3, cancel)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_limit() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let items = fixture(source.path(), 40).await;

        let outcome = scheduler(
            source.path(),
            destination.path(),
            3,
            100,
            CancellationToken::new(),
        )
        .run(items)
        .await;

        assert_eq!(outcome.report.succeeded, 40);
        assert!(outcome.report.peak_in_flight >= 1);
        assert!(outcome.report.peak_in_flight <= 3);
        assert!(!outcome.interrupted);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_and_bounded() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let mut items = fixture(source.path(), 6).await;
        let committed: u64 = items.iter().filter_map(|i| i.expected_size()).sum();
        std::fs::write(source.path().join("corrupt"), b"hello").unwrap();
        items.push(WorkItem {
            entry: ManifestEntry::new("corrupt")
                .with_hash(crate::manifest::tests::hash('0'))
                .with_size(5),
        });
        for i in 0..5 {
            items.push(WorkItem {
                entry: ManifestEntry::new(format!("missing-{}", i)).with_size(1),
            });
        }

        let outcome = scheduler(
            source.path(),
            destination.path(),
            4,
            100,
            CancellationToken::new(),
        )
        .run(items)
        .await;

        let report = outcome.report;
        assert_eq!(report.items, 12);
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.failed, 6);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(report.completed.len(), 6);
        assert!(!report.completed.iter().any(|k| k == "corrupt"));
        // Bytes of the corrupt object were streamed but never committed.
        assert_eq!(report.bytes_transferred, committed);
        assert_eq!(report.partial_bytes, 5);
        assert_eq!(report.bytes_verified, 0);
        assert!(destination.path().join("sig-005").exists());
    }

    #[tokio::test]
    async fn test_all_batches_run_in_order() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let items = fixture(source.path(), 7).await;
        let expected: u64 = items.iter().filter_map(|i| i.expected_size()).sum();

        let outcome = scheduler(
            source.path(),
            destination.path(),
            2,
            3,
            CancellationToken::new(),
        )
        .run(items)
        .await;

        assert_eq!(outcome.report.succeeded, 7);
        assert_eq!(outcome.report.bytes_transferred, expected);
        assert_eq!(outcome.unprocessed, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_starts_no_batch() {
        let source = tempfile::tempdir().unwrap();
        let destination = tempfile::tempdir().unwrap();
        let items = fixture(source.path(), 5).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = scheduler(source.path(), destination.path(), 2, 2, cancel)
            .run(items)
            .await;

        assert!(outcome.interrupted);
        assert_eq!(outcome.unprocessed, 5);
        assert_eq!(outcome.report.items, 0);
        assert!(!destination.path().join("sig-000").exists());
    }

    #[test]
    fn test_merge_keeps_failure_limit() {
        let failure = |key: &str| FailureRecord {
            key: key.to_string(),
            reason: "boom".to_string(),
            kind: FailureKind::Io,
            partial_bytes: 0,
        };
        let mut total = BatchReport {
            items: 2,
            failed: 2,
            failures: vec![failure("a"), failure("b")],
            peak_in_flight: 2,
            ..BatchReport::default()
        };
        total.merge(
            BatchReport {
                items: 2,
                failed: 2,
                failures: vec![failure("c"), failure("d")],
                peak_in_flight: 1,
                ..BatchReport::default()
            },
            3,
        );
        assert_eq!(total.failed, 4);
        assert_eq!(total.failures.len(), 3);
        assert_eq!(total.failures[2].key, "c");
        assert_eq!(total.peak_in_flight, 2);
    }
}
