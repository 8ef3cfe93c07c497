//! Content digests and the already-mirrored probe decision.

use crate::manifest::ContentHash;
use crate::store::{ObjectMeta, CHUNK_SIZE};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;

/// Computes the SHA-256 of a local file.
///
/// The file is read in 1 MiB chunks on the blocking pool so large trees can
/// be hashed without stalling the runtime.
pub(crate) async fn compute_file_sha256(path: PathBuf) -> io::Result<ContentHash> {
    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(CHUNK_SIZE, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(ContentHash::from_digest(hasher.finalize()))
    })
    .await
    .map_err(|e| io::Error::other(format!("Task join error: {}", e)))?
}

/// Digests accumulated while content streams through a worker.
pub(crate) struct StreamDigest {
    sha256: Sha256,
    md5: Option<Md5>,
    bytes: u64,
}

/// Final values of a [`StreamDigest`].
pub(crate) struct Digests {
    pub sha256: ContentHash,
    /// Hex MD5, computed only when an upload ETag has to be checked.
    pub md5: Option<String>,
    pub bytes: u64,
}

impl StreamDigest {
    pub(crate) fn new(with_md5: bool) -> Self {
        Self {
            sha256: Sha256::new(),
            md5: with_md5.then(Md5::new),
            bytes: 0,
        }
    }

    pub(crate) fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        if let Some(md5) = self.md5.as_mut() {
            md5.update(chunk);
        }
        self.bytes += chunk.len() as u64;
    }

    pub(crate) fn bytes(&self) -> u64 {
        self.bytes
    }

    pub(crate) fn finish(self) -> Digests {
        Digests {
            sha256: ContentHash::from_digest(self.sha256.finalize()),
            md5: self.md5.map(|m| format!("{:x}", m.finalize())),
            bytes: self.bytes,
        }
    }
}

/// Decides whether the destination already holds the object.
///
/// True only when both sides report the same known size and the same
/// non-empty identity tag, and that size matches the manifest when it has
/// one. A destination without tags (a local directory) never qualifies.
pub(crate) fn already_mirrored(
    expected_size: Option<u64>,
    source: &ObjectMeta,
    destination: &ObjectMeta,
) -> bool {
    let sizes_match = source.size.is_some()
        && source.size == destination.size
        && expected_size.map_or(true, |expected| Some(expected) == destination.size);
    let tags_match = match (&source.tag, &destination.tag) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    };
    sizes_match && tags_match
}

/// Returns true if an upload ETag can be compared against an MD5.
///
/// Multipart uploads have ETags of the form `<md5-of-md5s>-<parts>`.
pub(crate) fn is_simple_etag(etag: &str) -> bool {
    !etag.is_empty() && !etag.contains('-')
}
