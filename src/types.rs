//! Configuration for mirror runs.

use crate::error::MirrorError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// File name of the manifest artifact at the source and destination roots.
pub const MANIFEST_NAME: &str = "SOURMASH-MANIFEST.parquet";

/// Default base URL of the main archive.
pub const ARCHIVE_URL: &str = "https://farm.cse.ucdavis.edu/~irber";

/// Databases published by the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Database {
    Full,
    Img,
    Genomes,
    Sra,
}

impl Database {
    /// Name of the database as used in archive paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Database::Full => "full",
            Database::Img => "img",
            Database::Genomes => "genomes",
            Database::Sra => "sra",
        }
    }

    /// Base location of this database under an archive URL
    /// (e.g. `https://farm.cse.ucdavis.edu/~irber/wort-img`).
    pub fn source_url(&self, archive_url: &str) -> String {
        format!("{}/wort-{}", archive_url.trim_end_matches('/'), self.as_str())
    }
}

/// What to do with the manifest when some transfers failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Publish only when every item of the run succeeded.
    #[default]
    RequireFullSuccess,
    /// Publish after dropping entries whose transfer did not succeed.
    AcceptPartial,
}

/// Configuration for a mirror run.
///
/// # Example
///
/// ```
/// use wort_mirror::MirrorConfig;
///
/// let config = MirrorConfig {
///     source: "https://example.com/wort-img".to_string(),
///     destination: "/data/wort-img".to_string(),
///     max_concurrency: 8,
///     verify_hash: true,
///     ..MirrorConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Base location of the source objects: an `http(s)://` URL or a local directory.
    pub source: String,
    /// Location of the remote manifest. Defaults to `<source>/<manifest_name>`.
    pub manifest: Option<String>,
    /// Base location of the destination: a local directory or an `http(s)://` object store.
    pub destination: String,
    /// Maximum number of transfers (and local hash computations) in flight (default: 30).
    ///
    /// Transfers are I/O-bound; the limit protects file handles and the
    /// remote server rather than the CPU.
    pub max_concurrency: usize,
    /// Compare on `(key, sha256)` instead of `key` alone (default: false).
    ///
    /// Requires hashing every destination file, which is the expensive path.
    pub verify_hash: bool,
    /// Only consider remote entries created strictly after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Compute the work set and stop before any transfer or publish.
    pub dry_run: bool,
    /// Number of work items per scheduling batch (default: 100).
    pub batch_size: usize,
    /// Manifest publication policy.
    pub publish_policy: PublishPolicy,
    /// Name of the manifest artifact at the destination root.
    pub manifest_name: String,
    /// Directory for staging uploads to an object-store destination.
    /// Defaults to the system temp directory.
    pub staging_dir: Option<PathBuf>,
    /// Bearer token for writes to an object-store destination.
    pub destination_token: Option<String>,
    /// Number of failure reasons kept in reports (default: 20).
    pub max_reported_failures: usize,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            source: Database::Img.source_url(ARCHIVE_URL),
            manifest: None,
            destination: ".".to_string(),
            max_concurrency: 30,
            verify_hash: false,
            since: None,
            dry_run: false,
            batch_size: 100,
            publish_policy: PublishPolicy::RequireFullSuccess,
            manifest_name: MANIFEST_NAME.to_string(),
            staging_dir: None,
            destination_token: None,
            max_reported_failures: 20,
        }
    }
}

impl MirrorConfig {
    /// Location of the remote manifest artifact.
    pub fn manifest_location(&self) -> String {
        match &self.manifest {
            Some(location) => location.clone(),
            None => format!("{}/{}", self.source.trim_end_matches('/'), self.manifest_name),
        }
    }

    /// Rejects parameters the engine cannot run with.
    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.max_concurrency == 0 {
            return Err(MirrorError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(MirrorError::Config("batch_size must be at least 1".to_string()));
        }
        if self.manifest_name.is_empty() || self.manifest_name.contains('/') {
            return Err(MirrorError::Config(format!(
                "manifest name '{}' must be a plain file name",
                self.manifest_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_location_defaults_to_source_root() {
        let config = MirrorConfig {
            source: "https://example.com/wort-sra/".to_string(),
            ..MirrorConfig::default()
        };
        assert_eq!(
            config.manifest_location(),
            "https://example.com/wort-sra/SOURMASH-MANIFEST.parquet"
        );
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = MirrorConfig {
            max_concurrency: 0,
            ..MirrorConfig::default()
        };
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_database_source_url() {
        assert_eq!(
            Database::Genomes.source_url("https://farm.cse.ucdavis.edu/~irber/"),
            "https://farm.cse.ucdavis.edu/~irber/wort-genomes"
        );
    }
}
