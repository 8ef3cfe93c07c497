//! Manifest records and the set operations used to diff them.
//!
//! A [`ManifestSnapshot`] is an immutable record set. All operations return a
//! new snapshot; none of them touch storage.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use tracing::warn;

/// Number of individual duplicate keys logged before only the total is reported.
const MAX_LOGGED_COLLISIONS: usize = 10;

/// A SHA-256 digest as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parses a hex digest, rejecting anything but 64 lowercase hex characters.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    /// Wraps the output of a finished SHA-256 accumulator.
    pub(crate) fn from_digest(digest: impl fmt::LowerHex) -> Self {
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Returns true if `key` is a relative path that stays inside a store root.
///
/// Keys are `/`-separated; empty, `.` and `..` segments and absolute paths
/// are rejected.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.contains('\\')
        && !key.contains('\0')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// One object record of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    /// Storage-relative path, unique within a de-duplicated snapshot.
    pub key: String,
    /// SHA-256 of the content. Absent for unhashed scans or legacy rows.
    pub content_hash: Option<ContentHash>,
    /// Size in bytes.
    pub size_bytes: Option<u64>,
    /// Creation time recorded by the archive.
    pub created_at: Option<DateTime<Utc>>,
}

impl ManifestEntry {
    /// An entry with only a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            content_hash: None,
            size_bytes: None,
            created_at: None,
        }
    }

    #[must_use]
    pub fn with_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    fn join_value(&self, column: Column) -> Option<JoinValue<'_>> {
        match column {
            Column::Key => Some(JoinValue::Str(&self.key)),
            Column::Sha256 => self.content_hash.as_ref().map(|h| JoinValue::Str(h.as_str())),
            Column::Size => self.size_bytes.map(JoinValue::Int),
            Column::CreationDate => self
                .created_at
                .map(|t| JoinValue::Time(t.timestamp_micros())),
        }
    }

    /// The `on`-tuple of this entry, or `None` if any of its columns is null.
    fn join_key(&self, on: &[Column]) -> Option<Vec<JoinValue<'_>>> {
        on.iter().map(|&column| self.join_value(column)).collect()
    }
}

/// Manifest columns, named as in the Parquet artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Key,
    Sha256,
    Size,
    CreationDate,
}

impl Column {
    pub const ALL: [Column; 4] = [
        Column::Key,
        Column::Sha256,
        Column::Size,
        Column::CreationDate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Key => "internal_location",
            Column::Sha256 => "sha256",
            Column::Size => "size",
            Column::CreationDate => "creation_date",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum JoinValue<'a> {
    Str(&'a str),
    Int(u64),
    Time(i64),
}

/// Result of [`ManifestSnapshot::unique_by_key`].
#[derive(Debug, Clone)]
pub struct Deduplicated {
    pub snapshot: ManifestSnapshot,
    /// Number of rows dropped because an earlier row had the same key.
    pub collisions: usize,
}

/// An immutable set of manifest entries describing one corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSnapshot {
    entries: Vec<ManifestEntry>,
}

impl ManifestSnapshot {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ManifestEntry> {
        self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry by key (first occurrence).
    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// Sum of known entry sizes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().filter_map(|e| e.size_bytes).sum()
    }

    /// Restricts every entry to `columns`. The key is always retained, so
    /// uniqueness by key is preserved.
    pub fn project(&self, columns: &[Column]) -> Self {
        let keep = |c: Column| columns.contains(&c);
        let entries = self
            .entries
            .iter()
            .map(|e| ManifestEntry {
                key: e.key.clone(),
                content_hash: e.content_hash.clone().filter(|_| keep(Column::Sha256)),
                size_bytes: e.size_bytes.filter(|_| keep(Column::Size)),
                created_at: e.created_at.filter(|_| keep(Column::CreationDate)),
            })
            .collect();
        Self { entries }
    }

    /// Keeps the first occurrence of every key, in source order.
    ///
    /// Collisions point at an upstream data-quality problem, so each one is
    /// logged and the total is returned.
    pub fn unique_by_key(self) -> Deduplicated {
        let keep: Vec<bool> = {
            let mut seen = HashSet::with_capacity(self.entries.len());
            self.entries
                .iter()
                .map(|e| seen.insert(e.key.as_str()))
                .collect()
        };

        let collisions = keep.iter().filter(|k| !**k).count();
        let dropped = self.entries.iter().zip(&keep).filter(|(_, k)| !**k);
        for (entry, _) in dropped.take(MAX_LOGGED_COLLISIONS) {
            warn!("Duplicate manifest key '{}', keeping first occurrence", entry.key);
        }
        if collisions > MAX_LOGGED_COLLISIONS {
            warn!(
                "{} more duplicate manifest keys not shown",
                collisions - MAX_LOGGED_COLLISIONS
            );
        }

        let entries = self
            .entries
            .into_iter()
            .zip(keep)
            .filter_map(|(entry, keep)| keep.then_some(entry))
            .collect();

        Deduplicated {
            snapshot: Self { entries },
            collisions,
        }
    }

    /// Anti-join: entries of `self` whose `on`-tuple does not appear in `other`.
    ///
    /// Nulls never match, so an entry missing any `on` column is always kept.
    pub fn difference(&self, other: &ManifestSnapshot, on: &[Column]) -> Self {
        let present: HashSet<Vec<JoinValue<'_>>> =
            other.entries.iter().filter_map(|e| e.join_key(on)).collect();

        let entries = self
            .entries
            .iter()
            .filter(|e| match e.join_key(on) {
                Some(k) => !present.contains(&k),
                None => true,
            })
            .cloned()
            .collect();
        Self { entries }
    }

    /// Entries matching `predicate`.
    pub fn filter(&self, predicate: impl Fn(&ManifestEntry) -> bool) -> Self {
        Self {
            entries: self.entries.iter().filter(|e| predicate(e)).cloned().collect(),
        }
    }

    /// Entries created strictly after `since`. Entries without a creation
    /// date are dropped.
    pub fn created_after(&self, since: DateTime<Utc>) -> Self {
        self.filter(|e| e.created_at.is_some_and(|t| t > since))
    }

    /// A copy with entries ordered by key.
    pub fn sorted_by_key(&self) -> Self {
        let mut entries = self.entries.clone();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Self { entries }
    }
}

impl FromIterator<ManifestEntry> for ManifestSnapshot {
    fn from_iter<I: IntoIterator<Item = ManifestEntry>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
