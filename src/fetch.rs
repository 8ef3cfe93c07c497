//! Fetching manifest artifacts.

use crate::codec::decode_manifest;
use crate::error::{ManifestLoadError, StoreError};
use crate::manifest::ManifestSnapshot;
use crate::store::{is_url, Store};
use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use std::io;
use tokio_retry2::{Retry, RetryError};
use tracing::{info, warn};

const FETCH_RETRY_INTERVAL_MS: u64 = 2_000;
const FETCH_RETRIES: usize = 3;

/// Loads a manifest from an `http(s)://` URL or a local path.
///
/// Transport errors and 5xx answers are retried a few times; any other
/// failure is returned immediately.
pub async fn load_manifest(
    client: &reqwest::Client,
    location: &str,
) -> Result<ManifestSnapshot, ManifestLoadError> {
    info!("Retrieving manifest from {}", location);

    let data = if is_url(location) {
        fetch_url(client, location).await?
    } else {
        tokio::fs::read(location)
            .await
            .map(Bytes::from)
            .map_err(|source| ManifestLoadError::Io {
                location: location.to_string(),
                source,
            })?
    };

    let snapshot = decode_blocking(data, location).await?;
    info!("Manifest {} lists {} entries", location, snapshot.len());
    Ok(snapshot)
}

/// Parses manifest bytes on the blocking pool.
pub(crate) async fn decode_blocking(
    data: Bytes,
    location: &str,
) -> Result<ManifestSnapshot, ManifestLoadError> {
    tokio::task::spawn_blocking(move || decode_manifest(data))
        .await
        .map_err(|e| ManifestLoadError::Io {
            location: location.to_string(),
            source: io::Error::other(format!("Task join error: {}", e)),
        })?
}

async fn fetch_url(client: &reqwest::Client, url: &str) -> Result<Bytes, ManifestLoadError> {
    let retry_strategy =
        tokio_retry2::strategy::FixedInterval::from_millis(FETCH_RETRY_INTERVAL_MS)
            .take(FETCH_RETRIES);

    Retry::spawn(retry_strategy, || async move {
        let response = match client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to connect to {}: {}", url, e);
                return RetryError::to_transient(ManifestLoadError::Unreachable {
                    location: url.to_string(),
                    source: e,
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let err = ManifestLoadError::Status {
                location: url.to_string(),
                status,
            };
            return if status.is_server_error() {
                warn!("Manifest request to {} failed: HTTP {}", url, status);
                RetryError::to_transient(err)
            } else {
                RetryError::to_permanent(err)
            };
        }

        match response.bytes().await {
            Ok(body) => Ok(body),
            Err(e) => {
                warn!("Manifest download from {} interrupted: {}", url, e);
                RetryError::to_transient(ManifestLoadError::Unreachable {
                    location: url.to_string(),
                    source: e,
                })
            }
        }
    })
    .await
}

/// Reads a whole object from a store, or `None` if it does not exist.
pub(crate) async fn read_object(store: &Store, key: &str) -> Result<Option<Bytes>, StoreError> {
    if store.probe(key).await?.is_none() {
        return Ok(None);
    }
    let buffer = store
        .get(key)
        .await?
        .try_fold(BytesMut::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await?;
    Ok(Some(buffer.freeze()))
}
