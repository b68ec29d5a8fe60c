//! Remote object storage behind a narrow interface.
//!
//! The archive store only ever needs `get`, `put`, `head` and
//! `list_with_prefix`; absence of an object is reported as `None`, never as an
//! error. Retrying is not done here except by [`RetryingObjectStore`], which
//! callers opt into as an outer layer.

use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::error::VaultError;
use crate::vault::config::VaultRemoteConfig;
use crate::vault::paths::VaultPaths;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object store I/O on `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("object store returned HTTP {status} for `{key}`")]
    Http { key: String, status: u16 },
    #[error("object store transport error on `{key}`: {message}")]
    Transport { key: String, message: String },
    #[error("unsafe object key `{0}`")]
    InvalidKey(String),
}

impl ObjectStoreError {
    fn io(key: &str, source: io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    /// Whether an outer retry loop should try again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
            ),
            Self::InvalidKey(_) => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, ObjectStoreError>;

pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Size of an object; `Ok(None)` when it does not exist.
    fn head(&self, key: &str) -> StoreResult<Option<u64>>;

    /// Every key starting with `prefix`, sorted.
    fn list_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Upload a local file. Backends that can stream override this.
    fn put_file(&self, key: &str, path: &Path) -> StoreResult<()> {
        let data = fs::read(path).map_err(|e| ObjectStoreError::io(key, e))?;
        self.put(key, &data)
    }

    /// Download into `path`, replacing it atomically. Returns `false` when the
    /// object does not exist, leaving `path` untouched.
    fn get_to_file(&self, key: &str, path: &Path) -> StoreResult<bool> {
        let Some(data) = self.get(key)? else {
            return Ok(false);
        };
        write_atomic(path, &data).map_err(|e| ObjectStoreError::io(key, e))?;
        Ok(true)
    }

    fn label(&self) -> &'static str;
}

fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Object store rooted at a local directory; keys map to relative paths.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn validate_key(key: &str) -> StoreResult<()> {
        if key.is_empty() || key.starts_with('/') || key.contains('\\') {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        if Path::new(key)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn resolve(&self, key: &str) -> StoreResult<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn list_recursive(&self, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.list_recursive(&path, out)?;
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // in-flight temp files from concurrent writers
            if key.rsplit('/').next().is_some_and(|name| name.starts_with(".tmp")) {
                continue;
            }
            out.push(key);
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectStoreError::io(key, e)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.resolve(key)?;
        write_atomic(&path, data).map_err(|e| ObjectStoreError::io(key, e))
    }

    fn head(&self, key: &str) -> StoreResult<Option<u64>> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectStoreError::io(key, e)),
        }
    }

    fn list_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        if !self.root.exists() {
            return Ok(keys);
        }
        self.list_recursive(&self.root, &mut keys)
            .map_err(|e| ObjectStoreError::io(prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn put_file(&self, key: &str, path: &Path) -> StoreResult<()> {
        let target = self.resolve(key)?;
        let dir = target.parent().unwrap_or(&self.root).to_path_buf();
        let copy = || -> io::Result<()> {
            fs::create_dir_all(&dir)?;
            let tmp = tempfile::NamedTempFile::new_in(&dir)?;
            fs::copy(path, tmp.path())?;
            tmp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        };
        copy().map_err(|e| ObjectStoreError::io(key, e))
    }

    fn get_to_file(&self, key: &str, path: &Path) -> StoreResult<bool> {
        let source = self.resolve(key)?;
        if !source.is_file() {
            return Ok(false);
        }
        let copy = || -> io::Result<()> {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(dir)?;
            let tmp = tempfile::NamedTempFile::new_in(dir)?;
            fs::copy(&source, tmp.path())?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        };
        copy().map_err(|e| ObjectStoreError::io(key, e))?;
        Ok(true)
    }

    fn label(&self) -> &'static str {
        "local"
    }
}

/// Plain HTTP object endpoint: `GET|PUT|HEAD <base>/<key>` and
/// `GET <base>/?list&prefix=<p>` returning a JSON array of keys.
pub struct HttpObjectStore {
    base_url: String,
    client: reqwest::blocking::Client,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, token: Option<&str>) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30 * 60))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: token.map(str::to_string),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn authorize(
        &self,
        req: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn transport(key: &str, err: reqwest::Error) -> ObjectStoreError {
        match err.status() {
            Some(status) => ObjectStoreError::Http {
                key: key.to_string(),
                status: status.as_u16(),
            },
            None => ObjectStoreError::Transport {
                key: key.to_string(),
                message: err.to_string(),
            },
        }
    }

    fn check(
        key: &str,
        resp: reqwest::blocking::Response,
    ) -> StoreResult<Option<reqwest::blocking::Response>> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ObjectStoreError::Http {
                key: key.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(Some(resp))
    }
}

impl ObjectStore for HttpObjectStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let resp = self
            .authorize(self.client.get(self.url(key)))
            .send()
            .map_err(|e| Self::transport(key, e))?;
        let Some(resp) = Self::check(key, resp)? else {
            return Ok(None);
        };
        let body = resp.bytes().map_err(|e| Self::transport(key, e))?;
        Ok(Some(body.to_vec()))
    }

    fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let resp = self
            .authorize(self.client.put(self.url(key)))
            .body(data.to_vec())
            .send()
            .map_err(|e| Self::transport(key, e))?;
        match Self::check(key, resp)? {
            Some(_) => Ok(()),
            None => Err(ObjectStoreError::Http {
                key: key.to_string(),
                status: 404,
            }),
        }
    }

    fn head(&self, key: &str) -> StoreResult<Option<u64>> {
        let resp = self
            .authorize(self.client.head(self.url(key)))
            .send()
            .map_err(|e| Self::transport(key, e))?;
        let Some(resp) = Self::check(key, resp)? else {
            return Ok(None);
        };
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Some(size))
    }

    fn list_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let resp = self
            .authorize(self.client.get(format!("{}/", self.base_url)))
            .query(&[("list", ""), ("prefix", prefix)])
            .send()
            .map_err(|e| Self::transport(prefix, e))?;
        let Some(resp) = Self::check(prefix, resp)? else {
            return Ok(Vec::new());
        };
        let mut keys: Vec<String> = resp.json().map_err(|e| Self::transport(prefix, e))?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn put_file(&self, key: &str, path: &Path) -> StoreResult<()> {
        let file = fs::File::open(path).map_err(|e| ObjectStoreError::io(key, e))?;
        let resp = self
            .authorize(self.client.put(self.url(key)))
            .body(reqwest::blocking::Body::from(file))
            .send()
            .map_err(|e| Self::transport(key, e))?;
        match Self::check(key, resp)? {
            Some(_) => Ok(()),
            None => Err(ObjectStoreError::Http {
                key: key.to_string(),
                status: 404,
            }),
        }
    }

    fn get_to_file(&self, key: &str, path: &Path) -> StoreResult<bool> {
        let resp = self
            .authorize(self.client.get(self.url(key)))
            .send()
            .map_err(|e| Self::transport(key, e))?;
        let Some(mut resp) = Self::check(key, resp)? else {
            return Ok(false);
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| ObjectStoreError::io(key, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ObjectStoreError::io(key, e))?;
        resp.copy_to(&mut tmp).map_err(|e| Self::transport(key, e))?;
        tmp.persist(path)
            .map_err(|e| ObjectStoreError::io(key, e.error))?;
        Ok(true)
    }

    fn label(&self) -> &'static str {
        "http"
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

/// Wraps another store with exponential backoff plus jitter on transient
/// failures. Permanent failures and "not found" pass straight through.
pub struct RetryingObjectStore {
    inner: Box<dyn ObjectStore>,
    policy: RetryPolicy,
}

impl RetryingObjectStore {
    pub fn new(inner: Box<dyn ObjectStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn retry<T>(&self, op: &str, f: impl Fn() -> StoreResult<T>) -> StoreResult<T> {
        let mut delay_ms = self.policy.retry_delay_ms.max(1);
        let mut attempt = 0u32;
        loop {
            match f() {
                Ok(val) => return Ok(val),
                Err(err) if err.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    warn!(
                        "{} {op}: transient error (attempt {attempt}/{}), retrying: {err}",
                        self.inner.label(),
                        self.policy.max_retries
                    );
                    let jitter = rand::random::<u64>() % delay_ms;
                    std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                    delay_ms = (delay_ms * 2).min(self.policy.retry_max_delay_ms.max(1));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl ObjectStore for RetryingObjectStore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.retry("get", || self.inner.get(key))
    }

    fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.retry("put", || self.inner.put(key, data))
    }

    fn head(&self, key: &str) -> StoreResult<Option<u64>> {
        self.retry("head", || self.inner.head(key))
    }

    fn list_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.retry("list", || self.inner.list_with_prefix(prefix))
    }

    fn put_file(&self, key: &str, path: &Path) -> StoreResult<()> {
        self.retry("put-file", || self.inner.put_file(key, path))
    }

    fn get_to_file(&self, key: &str, path: &Path) -> StoreResult<bool> {
        self.retry("get-file", || self.inner.get_to_file(key, path))
    }

    fn label(&self) -> &'static str {
        self.inner.label()
    }
}

pub fn backend_from_config(
    cfg: &VaultRemoteConfig,
    paths: &VaultPaths,
) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let inner: Box<dyn ObjectStore> = match cfg.backend.as_str() {
        "local" => {
            let root = cfg
                .root
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| paths.remote_dir.clone());
            Box::new(LocalObjectStore::new(root))
        }
        "http" => {
            let Some(url) = cfg.url.as_deref() else {
                return Err(VaultError::UnsupportedBackend(
                    "http backend requires remote.url".to_string(),
                )
                .into());
            };
            Box::new(HttpObjectStore::new(url, cfg.token.as_deref())?)
        }
        other => return Err(VaultError::UnsupportedBackend(other.to_string()).into()),
    };

    if cfg.max_retries == 0 {
        return Ok(Arc::from(inner));
    }
    Ok(Arc::new(RetryingObjectStore::new(
        inner,
        RetryPolicy {
            max_retries: cfg.max_retries,
            retry_delay_ms: cfg.retry_delay_ms,
            retry_max_delay_ms: cfg.retry_max_delay_ms,
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[test]
    fn local_store_reports_missing_objects_as_none() {
        let tmp = tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        assert!(store.get("data/tar/year=2000/english.tar").unwrap().is_none());
        assert!(store.head("nope").unwrap().is_none());
        assert!(store.list_with_prefix("data/").unwrap().is_empty());
    }

    #[test]
    fn local_store_put_get_head_list() {
        let tmp = tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        store.put("data/tar/year=2000/english/a.tar", b"abc").unwrap();
        store.put("metadata/tar/year=2000/m.json", b"{}").unwrap();

        assert_eq!(
            store.get("data/tar/year=2000/english/a.tar").unwrap().unwrap(),
            b"abc"
        );
        assert_eq!(store.head("data/tar/year=2000/english/a.tar").unwrap(), Some(3));
        assert_eq!(
            store.list_with_prefix("data/").unwrap(),
            vec!["data/tar/year=2000/english/a.tar".to_string()]
        );
    }

    #[test]
    fn local_store_rejects_escaping_keys() {
        let tmp = tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path());
        assert!(matches!(
            store.put("../outside", b"x"),
            Err(ObjectStoreError::InvalidKey(_))
        ));
        assert!(store.get("/abs").is_err());
    }

    #[test]
    fn local_store_file_transfer() {
        let tmp = tempdir().unwrap();
        let store = LocalObjectStore::new(tmp.path().join("remote"));
        let src = tmp.path().join("src.bin");
        fs::write(&src, b"payload").unwrap();
        store.put_file("k/src.bin", &src).unwrap();

        let dst = tmp.path().join("down/dst.bin");
        assert!(store.get_to_file("k/src.bin", &dst).unwrap());
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert!(!store.get_to_file("k/missing.bin", &dst).unwrap());
    }

    struct Flaky {
        failures_left: AtomicU32,
        status: u16,
    }

    impl ObjectStore for Flaky {
        fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ObjectStoreError::Http {
                    key: key.to_string(),
                    status: self.status,
                });
            }
            Ok(Some(b"ok".to_vec()))
        }
        fn put(&self, _key: &str, _data: &[u8]) -> StoreResult<()> {
            Ok(())
        }
        fn head(&self, _key: &str) -> StoreResult<Option<u64>> {
            Ok(None)
        }
        fn list_with_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
        fn label(&self) -> &'static str {
            "flaky"
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn retrying_store_recovers_from_transient_errors() {
        let store = RetryingObjectStore::new(
            Box::new(Flaky {
                failures_left: AtomicU32::new(2),
                status: 503,
            }),
            policy(3),
        );
        assert_eq!(store.get("k").unwrap().unwrap(), b"ok");
    }

    #[test]
    fn retrying_store_gives_up_on_permanent_errors() {
        let store = RetryingObjectStore::new(
            Box::new(Flaky {
                failures_left: AtomicU32::new(1),
                status: 403,
            }),
            policy(3),
        );
        assert!(matches!(
            store.get("k"),
            Err(ObjectStoreError::Http { status: 403, .. })
        ));
    }
}
