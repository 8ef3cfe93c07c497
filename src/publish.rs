//! Atomic replacement of the destination manifest.

use crate::codec::encode_manifest;
use crate::error::PublishError;
use crate::manifest::ManifestSnapshot;
use crate::store::{make_readable, Store, PARTIAL_SUFFIX};
use std::io::Write;
use std::path::Path;
use tracing::info;

/// Writes `snapshot` as the manifest `manifest_name` at the destination root
/// and returns its location.
///
/// Entries are written sorted by key. A local manifest is staged next to the
/// final file and renamed over it; an object-store manifest is uploaded in a
/// single PUT. Either way readers see the previous manifest or the new one,
/// never a partial file.
pub async fn publish(
    snapshot: &ManifestSnapshot,
    destination: &Store,
    manifest_name: &str,
) -> Result<String, PublishError> {
    let sorted = snapshot.sorted_by_key();
    let entries = sorted.len();
    let data = tokio::task::spawn_blocking(move || encode_manifest(&sorted))
        .await
        .map_err(|e| PublishError::Encode(format!("Task join error: {}", e)))??;

    let location = destination.locator(manifest_name);
    match destination {
        Store::Local(local) => {
            let root = local.root().to_path_buf();
            let name = manifest_name.to_string();
            tokio::task::spawn_blocking(move || write_atomically(&root, &name, &data))
                .await
                .map_err(|e| PublishError::Encode(format!("Task join error: {}", e)))??;
        }
        Store::Http(http) => {
            http.put_bytes(manifest_name, data).await?;
        }
    }

    info!("Published manifest with {} entries to {}", entries, location);
    Ok(location)
}

fn write_atomically(root: &Path, name: &str, data: &[u8]) -> Result<(), PublishError> {
    let path = root.join(name);
    let io_error = |source| PublishError::Io {
        path: path.clone(),
        source,
    };

    std::fs::create_dir_all(root).map_err(io_error)?;
    let prefix = format!(".{}.", name);
    let mut staged = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(PARTIAL_SUFFIX)
        .tempfile_in(root)
        .map_err(io_error)?;
    staged.write_all(data).map_err(io_error)?;
    staged.as_file().sync_all().map_err(io_error)?;
    make_readable(staged.as_file()).map_err(io_error)?;
    staged.persist(&path).map_err(|e| io_error(e.error))?;
    Ok(())
}
