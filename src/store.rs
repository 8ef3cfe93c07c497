//! Object stores addressed by manifest key.
//!
//! A store is either a local directory or an HTTP object store (S3/R2 style
//! GET/HEAD/PUT under a base URL). Both expose the same three operations: a
//! cheap metadata probe, a streamed read, and an atomic commit of a staged,
//! already verified file.

use crate::error::StoreError;
use crate::manifest::is_valid_key;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, ETAG};
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;

/// Read size for streamed local reads and hashing.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Suffix of staged files. Staged files also start with a dot.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Returns true for file names produced by staging.
pub fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)
}

/// Mode given to committed objects and manifests. Staging files are created
/// owner-only.
pub const COMMITTED_MODE: u32 = 0o644;

/// Opens up a staged file to [`COMMITTED_MODE`] before it is renamed into place.
pub fn make_readable(file: &std::fs::File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(COMMITTED_MODE))?;
    }
    #[cfg(not(unix))]
    let _ = file;
    Ok(())
}

/// A stream of object content.
pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

/// Result of a metadata probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Size in bytes, when the store reports one. Chunked HTTP responses
    /// carry no length.
    pub size: Option<u64>,
    /// Opaque revision tag (an ETag without quotes). Local files have none.
    pub tag: Option<String>,
}

/// Where a location string points.
#[derive(Debug, Clone)]
pub enum Store {
    Local(LocalStore),
    Http(HttpStore),
}

impl Store {
    /// Opens a location: `http://` and `https://` URLs are HTTP stores,
    /// everything else is a local directory.
    pub fn open(location: &str, client: &reqwest::Client, token: Option<String>) -> Self {
        if is_url(location) {
            Store::Http(HttpStore::new(client.clone(), location, token))
        } else {
            Store::Local(LocalStore::new(location))
        }
    }

    /// Human-readable locator of `key` in this store.
    pub fn locator(&self, key: &str) -> String {
        match self {
            Store::Local(s) => s.root.join(key).display().to_string(),
            Store::Http(s) => s.url(key),
        }
    }

    /// Size and identity tag of `key`, or `None` if it does not exist. Any
    /// 2xx answer means the object exists, with or without a length.
    pub async fn probe(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        match self {
            Store::Local(s) => s.probe(key).await,
            Store::Http(s) => s.probe(key).await,
        }
    }

    /// Streams the content of `key`.
    pub async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        match self {
            Store::Local(s) => s.get(key).await,
            Store::Http(s) => s.get(key).await,
        }
    }
}

/// Returns true for `http://` and `https://` locations.
pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// A directory tree whose relative paths are the keys.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `key` under the root, refusing keys that would escape it.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    async fn probe(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let path = self.resolve(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => Ok(Some(ObjectMeta {
                size: Some(m.len()),
                tag: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        let file = tokio::fs::File::open(self.resolve(key)?).await?;
        Ok(ReaderStream::with_capacity(file, CHUNK_SIZE).boxed())
    }
}

/// An object store reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpStore {
    pub fn new(client: reqwest::Client, base_url: &str, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    /// URL of `key` under the base URL.
    pub fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn request(&self, method: reqwest::Method, key: &str) -> Result<reqwest::RequestBuilder, StoreError> {
        if !is_valid_key(key) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let builder = self.client.request(method, self.url(key));
        Ok(match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => builder,
        })
    }

    async fn probe(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        let response = self.request(reqwest::Method::HEAD, key)?.send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                method: "HEAD",
                url: self.url(key),
                status,
            });
        }

        // Read the header directly: HEAD responses have no body to size.
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        Ok(Some(ObjectMeta {
            size,
            tag: etag(response.headers()),
        }))
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StoreError> {
        let response = self.request(reqwest::Method::GET, key)?.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                method: "GET",
                url: self.url(key),
                status,
            });
        }
        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }

    /// Uploads `path` as `key` in one PUT and returns the ETag the store
    /// acknowledged, if any.
    pub async fn put_file(&self, key: &str, path: &Path, len: u64) -> Result<Option<String>, StoreError> {
        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));
        self.put(key, body, len).await
    }

    /// Uploads an in-memory object as `key`.
    pub async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<Option<String>, StoreError> {
        let len = data.len() as u64;
        self.put(key, reqwest::Body::from(data), len).await
    }

    async fn put(&self, key: &str, body: reqwest::Body, len: u64) -> Result<Option<String>, StoreError> {
        let response = self
            .request(reqwest::Method::PUT, key)?
            .header(CONTENT_LENGTH, len)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                method: "PUT",
                url: self.url(key),
                status,
            });
        }
        Ok(etag(response.headers()))
    }
}

fn etag(headers: &reqwest::header::HeaderMap) -> Option<String> {
    headers
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim_matches('"').to_string())
}
