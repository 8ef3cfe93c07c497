//! Enumeration of what the destination already holds.
//!
//! A local destination is walked and every regular file becomes an entry
//! keyed by its path relative to the root. An object-store destination is
//! described by the manifest it last published.

use crate::error::ScanError;
use crate::fetch::{decode_blocking, read_object};
use crate::manifest::{is_valid_key, Column, ManifestEntry, ManifestSnapshot};
use crate::store::{is_staging_name, Store};
use crate::verify::compute_file_sha256;
use futures_util::StreamExt;
use serde::Serialize;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How to enumerate the destination.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Compute the SHA-256 of every file (full-verification mode).
    pub hash: bool,
    /// Maximum number of files hashed at once.
    pub max_concurrency: usize,
    /// Name of the published manifest at the root, which is not an object.
    pub manifest_name: String,
}

/// A file that was skipped during the scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanIssue {
    pub path: String,
    pub error: String,
}

/// Entries found plus the files that could not be read.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub snapshot: ManifestSnapshot,
    pub issues: Vec<ScanIssue>,
}

struct FoundFile {
    key: String,
    path: PathBuf,
    size: u64,
}

/// Describes the destination as a manifest-shaped snapshot.
pub async fn scan_destination(
    destination: &Store,
    options: &ScanOptions,
) -> Result<ScanReport, ScanError> {
    match destination {
        Store::Local(local) => scan(local.root(), options).await,
        Store::Http(_) => {
            let location = destination.locator(&options.manifest_name);
            let Some(data) = read_object(destination, &options.manifest_name).await? else {
                info!("No manifest published at {}, destination treated as empty", location);
                return Ok(ScanReport::default());
            };
            let deduplicated = decode_blocking(data, &location).await?.unique_by_key();
            let snapshot = if options.hash {
                deduplicated.snapshot
            } else {
                deduplicated.snapshot.project(&[Column::Key, Column::Size])
            };
            info!("Destination manifest lists {} objects", snapshot.len());
            Ok(ScanReport {
                snapshot,
                issues: Vec::new(),
            })
        }
    }
}

/// Walks `root` and returns one entry per file.
///
/// A missing root is an empty destination. A root that exists but cannot be
/// listed is fatal; unreadable files and subdirectories below it are
/// skipped and reported as issues.
pub async fn scan(root: &Path, options: &ScanOptions) -> Result<ScanReport, ScanError> {
    match tokio::fs::metadata(root).await {
        Ok(m) if m.is_dir() => {}
        Ok(_) => {
            return Err(ScanError::RootUnreadable {
                root: root.to_path_buf(),
                source: io::Error::other("not a directory"),
            })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("Destination {} does not exist yet", root.display());
            return Ok(ScanReport::default());
        }
        Err(source) => {
            return Err(ScanError::RootUnreadable {
                root: root.to_path_buf(),
                source,
            })
        }
    }

    let walk_root = root.to_path_buf();
    let manifest_name = options.manifest_name.clone();
    let (files, mut issues) = tokio::task::spawn_blocking(move || walk(&walk_root, &manifest_name))
        .await
        .map_err(|e| ScanError::Task(e.to_string()))??;

    info!("Found {} files under {}", files.len(), root.display());

    let entries = if options.hash {
        info!(
            "Computing sha256 for {} files ({} at a time)",
            files.len(),
            options.max_concurrency
        );
        let (entries, hash_issues) = hash_files(files, options.max_concurrency).await;
        issues.extend(hash_issues);
        entries
    } else {
        files
            .into_iter()
            .map(|f| ManifestEntry::new(f.key).with_size(f.size))
            .collect()
    };

    for issue in issues.iter() {
        warn!("Skipped {}: {}", issue.path, issue.error);
    }

    Ok(ScanReport {
        snapshot: ManifestSnapshot::new(entries),
        issues,
    })
}

fn walk(root: &Path, manifest_name: &str) -> Result<(Vec<FoundFile>, Vec<ScanIssue>), ScanError> {
    std::fs::read_dir(root).map_err(|source| ScanError::RootUnreadable {
        root: root.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    let mut issues = Vec::new();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                issues.push(ScanIssue {
                    path: e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string()),
                    error: e.to_string(),
                });
                continue;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if is_staging_name(&name) {
            debug!("Ignoring staged file {}", entry.path().display());
            continue;
        }
        if entry.depth() == 1 && name == manifest_name {
            continue;
        }

        let file_type = entry.file_type();
        let metadata = if file_type.is_file() {
            entry.metadata().map_err(io::Error::from)
        } else if file_type.is_symlink() {
            std::fs::metadata(entry.path())
        } else {
            continue;
        };
        let size = match metadata {
            Ok(m) if m.is_file() => m.len(),
            Ok(_) => continue,
            Err(e) => {
                issues.push(ScanIssue {
                    path: entry.path().display().to_string(),
                    error: e.to_string(),
                });
                continue;
            }
        };

        match relative_key(root, entry.path()) {
            Some(key) => files.push(FoundFile {
                key,
                path: entry.into_path(),
                size,
            }),
            None => issues.push(ScanIssue {
                path: entry.path().display().to_string(),
                error: "path is not valid UTF-8 or not a usable key".to_string(),
            }),
        }
    }

    Ok((files, issues))
}

/// `/`-separated key of `path` relative to `root`.
fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let segments = relative
        .components()
        .map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    let key = segments.join("/");
    is_valid_key(&key).then_some(key)
}

async fn hash_files(
    files: Vec<FoundFile>,
    max_concurrency: usize,
) -> (Vec<ManifestEntry>, Vec<ScanIssue>) {
    let mut results = futures_util::stream::iter(files)
        .map(|file| async move {
            let result = compute_file_sha256(file.path.clone()).await;
            (file, result)
        })
        .buffer_unordered(max_concurrency.max(1));

    let mut entries = Vec::new();
    let mut issues = Vec::new();
    while let Some((file, result)) = results.next().await {
        match result {
            Ok(hash) => entries.push(
                ManifestEntry::new(file.key)
                    .with_hash(hash)
                    .with_size(file.size),
            ),
            Err(e) => issues.push(ScanIssue {
                path: file.path.display().to_string(),
                error: e.to_string(),
            }),
        }
    }
    (entries, issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_manifest;
    use crate::manifest::tests::hash;
    use crate::store::LocalStore;
    use crate::test_server::{self, Response, TestServer};

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn options(hash: bool) -> ScanOptions {
        ScanOptions {
            hash,
            max_concurrency: 2,
            manifest_name: "SOURMASH-MANIFEST.parquet".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scan_keys_are_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sigs/nested")).unwrap();
        std::fs::write(dir.path().join("sigs/a.sig"), b"hello").unwrap();
        std::fs::write(dir.path().join("sigs/nested/b.sig"), b"hi").unwrap();

        let report = scan(dir.path(), &options(false)).await.unwrap();
        let mut keys: Vec<_> = report.snapshot.iter().map(|e| e.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["sigs/a.sig", "sigs/nested/b.sig"]);
        assert!(report.snapshot.iter().all(|e| e.content_hash.is_none()));
        assert_eq!(report.snapshot.get("sigs/a.sig").unwrap().size_bytes, Some(5));
    }

    #[tokio::test]
    async fn test_scan_full_check_hashes_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hello").unwrap();

        let report = scan(dir.path(), &options(true)).await.unwrap();
        let entry = report.snapshot.get("a").unwrap();
        assert_eq!(entry.content_hash.as_ref().unwrap().as_str(), HELLO_SHA256);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn test_scan_skips_manifest_and_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOURMASH-MANIFEST.parquet"), b"x").unwrap();
        std::fs::write(dir.path().join(".a.sig.k3j4.partial"), b"x").unwrap();
        std::fs::write(dir.path().join("a.sig"), b"x").unwrap();

        let report = scan(dir.path(), &options(false)).await.unwrap();
        assert_eq!(report.snapshot.len(), 1);
        assert!(report.snapshot.get("a.sig").is_some());
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = scan(&dir.path().join("new-mirror"), &options(true))
            .await
            .unwrap();
        assert!(report.snapshot.is_empty());
    }

    #[tokio::test]
    async fn test_scan_root_that_is_a_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"x").unwrap();
        let err = scan(&file, &options(false)).await.unwrap_err();
        assert!(matches!(err, ScanError::RootUnreadable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_collects_unreadable_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::write(&locked, b"secret").unwrap();
        std::fs::write(dir.path().join("open"), b"hello").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();

        // Root ignores permission bits.
        if std::fs::File::open(&locked).is_ok() {
            return;
        }

        let report = scan(dir.path(), &options(true)).await.unwrap();
        assert_eq!(report.snapshot.len(), 1);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].path.ends_with("locked"));
    }

    #[tokio::test]
    async fn test_scan_destination_walks_local_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"hello").unwrap();
        let published = ManifestSnapshot::new(vec![ManifestEntry::new("zzz")
            .with_hash(hash('1'))
            .with_size(1)]);
        std::fs::write(
            dir.path().join("SOURMASH-MANIFEST.parquet"),
            encode_manifest(&published).unwrap(),
        )
        .unwrap();

        // Local destinations are walked; the published manifest is not trusted.
        let store = Store::Local(LocalStore::new(dir.path()));
        let report = scan_destination(&store, &options(false)).await.unwrap();
        assert_eq!(report.snapshot.len(), 1);
        assert!(report.snapshot.get("a").is_some());
    }

    #[tokio::test]
    async fn test_scan_destination_reads_published_manifest_over_http() {
        let published = ManifestSnapshot::new(vec![
            ManifestEntry::new("a").with_hash(hash('1')).with_size(5),
            ManifestEntry::new("a").with_hash(hash('2')).with_size(6),
            ManifestEntry::new("b").with_hash(hash('3')).with_size(7),
        ]);
        let data = encode_manifest(&published).unwrap();
        // Streamed answers carry no Content-Length.
        let server = TestServer::start(move |request| match request.path.as_str() {
            "/mirror/SOURMASH-MANIFEST.parquet" => Response::ok(&data).chunked(),
            _ => Response::not_found(),
        })
        .await;
        let store = Store::open(&server.url("/mirror"), &test_server::client(), None);

        let report = scan_destination(&store, &options(false)).await.unwrap();
        assert_eq!(report.snapshot.len(), 2);
        let a = report.snapshot.get("a").unwrap();
        assert_eq!(a.size_bytes, Some(5));
        assert!(a.content_hash.is_none());

        let report = scan_destination(&store, &options(true)).await.unwrap();
        assert_eq!(report.snapshot.get("b").unwrap().content_hash, Some(hash('3')));
    }

    #[tokio::test]
    async fn test_scan_destination_without_published_manifest_is_empty() {
        let server = TestServer::start(|_| Response::not_found()).await;
        let store = Store::open(&server.url("/mirror"), &test_server::client(), None);

        let report = scan_destination(&store, &options(true)).await.unwrap();
        assert!(report.snapshot.is_empty());
        assert!(report.issues.is_empty());
    }
}
