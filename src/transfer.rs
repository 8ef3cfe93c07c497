//! Single-object transfer with streaming verification.
//!
//! A worker streams one object from the source into a staging file while
//! hashing it, checks the digest and byte count against the manifest, and only
//! then commits the object under its final name. Nothing unverified is ever
//! visible at the destination key: on any failure the staging file is dropped
//! and removed.

use crate::diff::WorkItem;
use crate::error::TransferError;
use crate::manifest::ContentHash;
use crate::progress::Progress;
use crate::store::{make_readable, Store, CHUNK_SIZE, PARTIAL_SUFFIX};
use crate::verify::{already_mirrored, is_simple_etag, Digests, StreamDigest};
use futures_util::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Where the verified bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Fetched from the source and committed.
    Source,
    /// The destination already held an identical object; it was re-hashed in
    /// place.
    Destination,
}

/// Result of one transfer. Produced exactly once per work item.
#[derive(Debug)]
pub enum TransferOutcome {
    Succeeded {
        bytes_transferred: u64,
        verified_hash: ContentHash,
        origin: Origin,
    },
    Failed {
        error: TransferError,
        /// Bytes streamed before the failure.
        partial_bytes: u64,
    },
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded { .. })
    }
}

/// Moves objects from `source` to `destination`.
pub struct TransferWorker {
    source: Store,
    destination: Store,
    staging_dir: Option<PathBuf>,
    progress: Arc<Progress>,
}

impl TransferWorker {
    /// `staging_dir` is only used for HTTP destinations; local destinations
    /// stage next to the final file so the commit is a same-directory rename.
    pub fn new(
        source: Store,
        destination: Store,
        staging_dir: Option<PathBuf>,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            source,
            destination,
            staging_dir,
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    /// Transfers one item. Never returns an error: every failure becomes a
    /// `Failed` outcome.
    pub async fn transfer(&self, item: &WorkItem) -> TransferOutcome {
        let mut streamed = 0u64;
        let result = match self.choose_origin(item).await {
            Origin::Destination => self.verify_in_place(item, &mut streamed).await,
            Origin::Source => self.fetch_and_commit(item, &mut streamed).await,
        };

        match result {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!("Transfer of {} failed: {}", item.key(), error);
                TransferOutcome::Failed {
                    error,
                    partial_bytes: streamed,
                }
            }
        }
    }

    /// Probes the destination first; the source is only asked for its tag
    /// when the destination holds a same-sized, tagged object.
    async fn choose_origin(&self, item: &WorkItem) -> Origin {
        let key = item.key();
        let destination = match self.destination.probe(key).await {
            Ok(Some(meta)) if meta.tag.is_some() => meta,
            Ok(_) => return Origin::Source,
            Err(e) => {
                debug!("Destination probe for {} failed: {}", key, e);
                return Origin::Source;
            }
        };
        if destination.size.is_none()
            || item
                .expected_size()
                .is_some_and(|size| Some(size) != destination.size)
        {
            return Origin::Source;
        }

        match self.source.probe(key).await {
            Ok(Some(source)) if already_mirrored(item.expected_size(), &source, &destination) => {
                debug!("{} already mirrored, verifying in place", key);
                Origin::Destination
            }
            Ok(_) => Origin::Source,
            Err(e) => {
                debug!("Source probe for {} failed: {}", key, e);
                Origin::Source
            }
        }
    }

    async fn verify_in_place(
        &self,
        item: &WorkItem,
        streamed: &mut u64,
    ) -> Result<TransferOutcome, TransferError> {
        let key = item.key();
        let mut stream = self.destination.get(key).await?;
        let mut digest = StreamDigest::new(false);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            *streamed = digest.bytes();
            self.progress.advance_bytes(chunk.len() as u64, key);
        }

        let digests = digest.finish();
        check(item, &digests)?;
        Ok(TransferOutcome::Succeeded {
            bytes_transferred: digests.bytes,
            verified_hash: digests.sha256,
            origin: Origin::Destination,
        })
    }

    async fn fetch_and_commit(
        &self,
        item: &WorkItem,
        streamed: &mut u64,
    ) -> Result<TransferOutcome, TransferError> {
        let key = item.key();
        let staged = self.stage(key).await?;
        let mut stream = self.source.get(key).await?;

        let mut digest = StreamDigest::new(matches!(self.destination, Store::Http(_)));
        let mut writer = BufWriter::with_capacity(
            CHUNK_SIZE,
            tokio::fs::File::from_std(staged.as_file().try_clone()?),
        );

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            digest.update(&chunk);
            writer.write_all(&chunk).await?;
            *streamed = digest.bytes();
            self.progress.advance_bytes(chunk.len() as u64, key);
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);

        let digests = digest.finish();
        check(item, &digests)?;
        self.commit(key, staged, &digests).await?;

        debug!("Committed {} ({} bytes)", key, digests.bytes);
        Ok(TransferOutcome::Succeeded {
            bytes_transferred: digests.bytes,
            verified_hash: digests.sha256,
            origin: Origin::Source,
        })
    }

    /// Creates the staging file. Dropping it removes it.
    async fn stage(&self, key: &str) -> Result<NamedTempFile, TransferError> {
        match &self.destination {
            Store::Local(local) => {
                let path = local.resolve(key)?;
                let parent = path
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| local.root().to_path_buf());
                tokio::fs::create_dir_all(&parent).await?;

                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let prefix = format!(".{}.", name);
                Ok(tempfile::Builder::new()
                    .prefix(&prefix)
                    .suffix(PARTIAL_SUFFIX)
                    .tempfile_in(&parent)?)
            }
            Store::Http(_) => {
                let mut builder = tempfile::Builder::new();
                builder.prefix(".wort-mirror.").suffix(PARTIAL_SUFFIX);
                Ok(match &self.staging_dir {
                    Some(dir) => {
                        tokio::fs::create_dir_all(dir).await?;
                        builder.tempfile_in(dir)?
                    }
                    None => builder.tempfile()?,
                })
            }
        }
    }

    /// Makes a verified staging file visible under `key`.
    async fn commit(
        &self,
        key: &str,
        staged: NamedTempFile,
        digests: &Digests,
    ) -> Result<(), TransferError> {
        match &self.destination {
            Store::Local(local) => {
                let path = local.resolve(key)?;
                make_readable(staged.as_file())?;
                staged.persist(&path).map_err(|e| e.error)?;
                Ok(())
            }
            Store::Http(http) => {
                let etag = http.put_file(key, staged.path(), digests.bytes).await?;
                if let (Some(etag), Some(md5)) = (etag, digests.md5.as_ref()) {
                    if is_simple_etag(&etag) && etag != *md5 {
                        return Err(TransferError::ETagMismatch {
                            expected: md5.clone(),
                            actual: etag,
                        });
                    }
                }
                Ok(())
            }
        }
    }
}

/// Compares streamed content against the manifest row. The hash is checked
/// first; rows without a hash are only size-checked.
fn check(item: &WorkItem, digests: &Digests) -> Result<(), TransferError> {
    match item.expected_hash() {
        Some(expected) if *expected != digests.sha256 => {
            return Err(TransferError::IntegrityMismatch {
                expected: expected.to_string(),
                actual: digests.sha256.to_string(),
            });
        }
        Some(_) => {}
        None => debug!("{} has no sha256 in the manifest, checking size only", item.key()),
    }
    match item.expected_size() {
        Some(expected) if expected != digests.bytes => Err(TransferError::SizeMismatch {
            expected,
            actual: digests.bytes,
        }),
        _ => Ok(()),
    }
}
