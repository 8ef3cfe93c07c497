//! wort-mirror - Verified mirroring of sourmash signature archives
//!
//! This library keeps a secondary copy of a content-addressed object corpus
//! in sync with the manifest that describes it. The manifest is a Parquet
//! table of `(internal_location, sha256, size, creation_date)` rows; the
//! mirror can be a local directory or an HTTP object store.
//!
//! # Features
//!
//! - **Incremental**: Only objects missing at the destination are transferred
//! - **Verified**: Every object is hashed while streaming and only committed on a match
//! - **Atomic**: Objects and the manifest are staged and renamed into place
//! - **Bounded**: Transfers run in sequential batches under a concurrency limit
//! - **Honest manifests**: The published manifest never lists unverified data
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use wort_mirror::{run_mirror, Database, MirrorConfig, NoProgress, ARCHIVE_URL};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MirrorConfig {
//!     source: Database::Sra.source_url(ARCHIVE_URL),
//!     destination: "/data/wort-sra".to_string(),
//!     verify_hash: true,
//!     ..MirrorConfig::default()
//! };
//!
//! let client = reqwest::Client::new();
//! let report = run_mirror(&config, &client, Arc::new(NoProgress), CancellationToken::new()).await?;
//! std::process::exit(report.exit_code().into());
//! # }
//! ```

pub mod codec;
pub mod diff;
pub mod error;
pub mod fetch;
pub mod manifest;
pub mod orchestrator;
pub mod progress;
pub mod publish;
pub mod scan;
pub mod scheduler;
pub mod store;
pub mod transfer;
pub mod types;
mod verify;

#[cfg(test)]
mod test_server;

pub use diff::{compute_work, WorkItem, WorkPlan};
pub use error::{
    FailureKind, ManifestLoadError, MirrorError, PublishError, ScanError, StoreError,
    TransferError,
};
pub use fetch::load_manifest;
pub use manifest::{Column, ContentHash, ManifestEntry, ManifestSnapshot};
pub use orchestrator::{run_mirror, PlannedTransfer, PublishStatus, RunReport};
pub use progress::{BarProgress, LogProgress, NoProgress, Progress, ProgressSink};
pub use publish::publish;
pub use scan::{scan, scan_destination, ScanOptions, ScanReport};
pub use scheduler::{BatchReport, Scheduler};
pub use store::Store;
pub use transfer::{TransferOutcome, TransferWorker};
pub use types::{Database, MirrorConfig, PublishPolicy, ARCHIVE_URL, MANIFEST_NAME};
