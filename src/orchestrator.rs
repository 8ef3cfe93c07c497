//! Main orchestration logic for a mirror run.

use crate::diff::{compute_work, missing_entries, WorkItem};
use crate::error::MirrorError;
use crate::fetch::load_manifest;
use crate::manifest::{Column, Deduplicated, ManifestSnapshot};
use crate::progress::{Progress, ProgressSink};
use crate::publish::publish;
use crate::scan::{scan_destination, ScanIssue, ScanOptions};
use crate::scheduler::{FailureRecord, ScheduleOutcome, Scheduler};
use crate::store::Store;
use crate::transfer::TransferWorker;
use crate::types::{MirrorConfig, PublishPolicy};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One item a dry run would transfer.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedTransfer {
    pub key: String,
    pub size_bytes: Option<u64>,
    pub source: String,
    pub destination: String,
}

/// What happened to the destination manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    Published { location: String, entries: usize },
    /// Dry run: nothing was written.
    DryRun,
    /// Some items failed and the policy requires full success.
    WithheldFailures,
    /// The run was interrupted and the policy requires full success.
    WithheldInterrupted,
}

/// Terminal summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub source: String,
    pub destination: String,
    /// Rows in the remote manifest, duplicates included.
    pub remote_entries: usize,
    pub duplicate_keys: usize,
    /// Unique remote entries left after the `since` filter.
    pub considered: usize,
    pub destination_entries: usize,
    pub scan_issues: Vec<ScanIssue>,
    /// Remote rows without a sha256 compared by key only.
    pub compared_by_key_only: usize,
    pub work_items: usize,
    pub transferred: usize,
    pub served_from_destination: usize,
    pub failed: usize,
    /// First failures, bounded by `max_reported_failures`.
    pub failures: Vec<FailureRecord>,
    /// Bytes fetched from the source and committed.
    pub bytes_transferred: u64,
    /// Bytes re-hashed in place at the destination.
    pub bytes_verified: u64,
    /// Bytes streamed by items that failed.
    pub partial_bytes: u64,
    pub peak_in_flight: usize,
    /// Items never started because of an interrupt.
    pub unprocessed: usize,
    pub interrupted: bool,
    pub publish: PublishStatus,
    /// Work set of a dry run; empty otherwise.
    pub planned: Vec<PlannedTransfer>,
    pub elapsed: Duration,
}

impl RunReport {
    /// True when every item succeeded and the run was not interrupted.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }

    /// Process exit code: 0 on complete success, 2 when items failed or the
    /// run was interrupted.
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            2
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Mirror {} -> {}", self.source, self.destination)?;
        writeln!(
            f,
            "  remote entries:      {} ({} duplicate keys)",
            self.remote_entries, self.duplicate_keys
        )?;
        writeln!(f, "  considered:          {}", self.considered)?;
        writeln!(
            f,
            "  destination entries: {} ({} scan issues)",
            self.destination_entries,
            self.scan_issues.len()
        )?;
        writeln!(
            f,
            "  work items:          {} ({} compared by key only)",
            self.work_items, self.compared_by_key_only
        )?;
        writeln!(
            f,
            "  transferred:         {} ({} verified in place)",
            self.transferred, self.served_from_destination
        )?;
        writeln!(f, "  failed:              {}", self.failed)?;
        writeln!(
            f,
            "  bytes moved:         {}",
            indicatif::HumanBytes(self.bytes_transferred)
        )?;
        writeln!(
            f,
            "  bytes verified:      {} in place, {} discarded",
            indicatif::HumanBytes(self.bytes_verified),
            indicatif::HumanBytes(self.partial_bytes)
        )?;
        writeln!(f, "  peak concurrency:    {}", self.peak_in_flight)?;
        if self.interrupted {
            writeln!(
                f,
                "  interrupted:         {} items not started",
                self.unprocessed
            )?;
        }
        let publish = match &self.publish {
            PublishStatus::Published { location, entries } => {
                format!("published {} entries to {}", entries, location)
            }
            PublishStatus::DryRun => "not written (dry run)".to_string(),
            PublishStatus::WithheldFailures => "withheld (items failed)".to_string(),
            PublishStatus::WithheldInterrupted => "withheld (interrupted)".to_string(),
        };
        writeln!(f, "  manifest:            {}", publish)?;
        let elapsed = Duration::from_millis(self.elapsed.as_millis() as u64);
        write!(
            f,
            "  elapsed:             {}",
            humantime::format_duration(elapsed)
        )?;
        if !self.failures.is_empty() {
            write!(f, "\n  first failures:")?;
            for failure in &self.failures {
                write!(f, "\n    {}: {}", failure.key, failure.reason)?;
            }
        }
        Ok(())
    }
}

/// Mirrors the remote corpus into the destination.
///
/// This is the main entry point. It performs the following steps:
///
/// 1. Loads and de-duplicates the remote manifest, then applies `since`
/// 2. Scans the destination (hashing every file when `verify_hash` is set)
/// 3. Computes the work set
/// 4. Transfers it in sequential batches under bounded concurrency
/// 5. Publishes the updated manifest if the publish policy allows it
///
/// Fatal problems (manifest unreadable, destination root inaccessible,
/// publish failure) are returned as errors. Per-item failures are reported
/// in the returned [`RunReport`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use wort_mirror::{run_mirror, LogProgress, MirrorConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = MirrorConfig {
///     destination: "/data/wort-img".to_string(),
///     ..MirrorConfig::default()
/// };
/// let client = reqwest::Client::new();
/// let report = run_mirror(&config, &client, Arc::new(LogProgress), CancellationToken::new()).await?;
/// println!("{}", report);
/// # Ok(())
/// # }
/// ```
pub async fn run_mirror(
    config: &MirrorConfig,
    client: &reqwest::Client,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
) -> Result<RunReport, MirrorError> {
    let started = Instant::now();
    config.validate()?;

    let source = Store::open(&config.source, client, None);
    let destination = Store::open(&config.destination, client, config.destination_token.clone());

    let loaded = load_manifest(client, &config.manifest_location()).await?;
    let remote_entries = loaded.len();
    let Deduplicated {
        snapshot: remote,
        collisions,
    } = loaded.unique_by_key();

    let filtered;
    let considered: &ManifestSnapshot = match config.since {
        Some(since) => {
            filtered = remote.created_after(since);
            info!(
                "{} of {} entries were created after {}",
                filtered.len(),
                remote.len(),
                since
            );
            &filtered
        }
        None => &remote,
    };

    let scan = scan_destination(
        &destination,
        &ScanOptions {
            hash: config.verify_hash,
            max_concurrency: config.max_concurrency,
            manifest_name: config.manifest_name.clone(),
        },
    )
    .await?;

    let plan = compute_work(considered, &scan.snapshot, config.verify_hash);
    info!(
        "{} of {} entries need to be transferred ({})",
        plan.items.len(),
        considered.len(),
        indicatif::HumanBytes(plan.total_bytes())
    );

    let mut report = RunReport {
        source: config.source.clone(),
        destination: config.destination.clone(),
        remote_entries,
        duplicate_keys: collisions,
        considered: considered.len(),
        destination_entries: scan.snapshot.len(),
        scan_issues: scan.issues.clone(),
        compared_by_key_only: plan.unverifiable,
        work_items: plan.items.len(),
        transferred: 0,
        served_from_destination: 0,
        failed: 0,
        failures: Vec::new(),
        bytes_transferred: 0,
        bytes_verified: 0,
        partial_bytes: 0,
        peak_in_flight: 0,
        unprocessed: 0,
        interrupted: false,
        publish: PublishStatus::DryRun,
        planned: Vec::new(),
        elapsed: Duration::ZERO,
    };

    if config.dry_run {
        report.planned = plan
            .items
            .iter()
            .map(|item| planned(item, &source, &destination))
            .collect();
        report.elapsed = started.elapsed();
        return Ok(report);
    }

    sink.start(plan.items.len(), plan.total_bytes());
    let progress = Arc::new(Progress::new(plan.items.len(), sink));
    let worker = TransferWorker::new(
        source,
        destination.clone(),
        config.staging_dir.clone(),
        Arc::clone(&progress),
    );
    let scheduler = Scheduler::new(
        worker,
        config.max_concurrency,
        config.batch_size,
        config.max_reported_failures,
        cancel,
    );

    let ScheduleOutcome {
        report: batches,
        unprocessed,
        interrupted,
    } = scheduler.run(plan.items).await;
    progress.finish(&format!(
        "{} transferred, {} failed",
        batches.succeeded, batches.failed
    ));

    report.transferred = batches.succeeded;
    report.served_from_destination = batches.served_from_destination;
    report.failed = batches.failed;
    report.failures = batches.failures.clone();
    report.bytes_transferred = batches.bytes_transferred;
    report.bytes_verified = batches.bytes_verified;
    report.partial_bytes = batches.partial_bytes;
    report.peak_in_flight = batches.peak_in_flight;
    report.unprocessed = unprocessed;
    report.interrupted = interrupted;

    let withheld = match config.publish_policy {
        PublishPolicy::RequireFullSuccess if interrupted => Some(PublishStatus::WithheldInterrupted),
        PublishPolicy::RequireFullSuccess if batches.failed > 0 => {
            Some(PublishStatus::WithheldFailures)
        }
        _ => None,
    };

    report.publish = match withheld {
        Some(status) => {
            warn!(
                "Not publishing the manifest: {} items failed, {} not started",
                batches.failed, unprocessed
            );
            status
        }
        None => {
            let available = available_entries(
                &remote,
                &scan.snapshot,
                &batches.completed,
                config.verify_hash,
            );
            let entries = available.len();
            let location = publish(&available, &destination, &config.manifest_name).await?;
            PublishStatus::Published { location, entries }
        }
    };

    report.elapsed = started.elapsed();
    info!(
        "Run finished in {}: {} transferred, {} failed",
        humantime::format_duration(Duration::from_secs(report.elapsed.as_secs())),
        report.transferred,
        report.failed
    );
    Ok(report)
}

/// Remote entries the destination can vouch for after the run: those it
/// already held plus those transferred now.
fn available_entries(
    remote: &ManifestSnapshot,
    held: &ManifestSnapshot,
    completed: &[String],
    verify_hash: bool,
) -> ManifestSnapshot {
    let (missing, _) = missing_entries(remote, held, verify_hash);
    let completed: HashSet<&str> = completed.iter().map(String::as_str).collect();
    let unresolved = missing.filter(|e| !completed.contains(e.key.as_str()));
    remote.difference(&unresolved, &[Column::Key])
}

fn planned(item: &WorkItem, source: &Store, destination: &Store) -> PlannedTransfer {
    PlannedTransfer {
        key: item.key().to_string(),
        size_bytes: item.expected_size(),
        source: source.locator(item.key()),
        destination: destination.locator(item.key()),
    }
}
