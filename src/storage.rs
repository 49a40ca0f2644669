//! Document storage boundary and built-in backends.
//!
//! Everything persistent (cursors, events, snapshots, leases) is a small
//! document addressed by a `/`-separated key. [`KeyLayout`] owns the key
//! scheme:
//!
//! ```text
//! brooks/<domain>/<type>/<id>/cursor
//! brooks/<domain>/<type>/<id>/pending
//! brooks/<domain>/<type>/<id>/events/<position:020>
//! snapshots/<domain>/<type>/<id>/<projection_type>/<projection_id>/<reducer_hash>/<version:020>
//! locks/<resource>
//! ```
//!
//! Backends only need conditional writes keyed on an opaque [`ETag`] and
//! ordered prefix scans.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::event::StreamKey;
use crate::metrics::BrookMetrics;
use crate::retry::RetryPolicy;

/// Opaque version tag for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ETag(pub u64);

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A stored document and its current version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Raw document bytes.
    pub data: Vec<u8>,
    /// Version tag of this revision.
    pub etag: ETag,
}

/// Condition attached to a write or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Unconditional.
    None,
    /// Only if no document exists at the key.
    IfAbsent,
    /// Only if the current revision carries this tag.
    IfMatch(ETag),
}

/// A key/value document store with conditional writes.
///
/// Implementations report transient faults as
/// [`StorageError::Timeout`], [`StorageError::Throttled`] or 5xx
/// [`StorageError::Server`]; [`RetryingStore`] retries those.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Read a document. Missing documents are `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Document>, StorageError>;

    /// Write a document, returning its new tag.
    ///
    /// # Errors
    ///
    /// [`StorageError::PreconditionFailed`] when the precondition does not
    /// hold; [`StorageError::PayloadTooLarge`] when the backend rejects the
    /// size.
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<ETag, StorageError>;

    /// Delete a document.
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] when nothing exists at the key (callers
    /// that treat that as success use [`delete_if_exists`]);
    /// [`StorageError::PreconditionFailed`] on a tag mismatch.
    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), StorageError>;

    /// Documents whose keys start with `prefix` and fall within
    /// `[from, to]` (both inclusive, both optional), ascending by key, at
    /// most `limit` of them.
    async fn scan(
        &self,
        prefix: &str,
        from: Option<&str>,
        to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StorageError>;

    /// All keys starting with `prefix`, ascending.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Shared, type-erased document store.
pub type SharedStore = Arc<dyn DocumentStore>;

/// Delete a document, treating "not found" as success.
///
/// # Errors
///
/// Any storage error other than [`StorageError::NotFound`].
pub async fn delete_if_exists(
    store: &dyn DocumentStore,
    key: &str,
    precondition: Precondition,
) -> Result<(), StorageError> {
    match store.delete(key, precondition).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Escape one key segment so it cannot introduce a separator.
///
/// `%` and `/` are percent-encoded, a leading `.` is encoded so a
/// segment is never `.` or `..`, and an empty segment becomes `%`. The
/// dot of a trailing `.doc` is encoded too, so no directory created by
/// [`FsStore`] can share a name with a document file.
pub fn escape_segment(segment: &str) -> Cow<'_, str> {
    if segment.is_empty() {
        return Cow::Borrowed("%");
    }
    let doc_dot = segment.strip_suffix(DOC_EXTENSION).map(str::len);
    if !segment.starts_with('.') && doc_dot.is_none() && !segment.contains(['/', '%']) {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len() + 4);
    for (i, c) in segment.char_indices() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '.' if i == 0 || Some(i) == doc_dot => out.push_str("%2E"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// Storage key scheme for brooks, snapshots, and leases.
///
/// An optional namespace prefixes every key so several deployments can
/// share one backend.
///
/// # Examples
///
/// ```
/// use brook_es::{KeyLayout, StreamKey};
///
/// let layout = KeyLayout::default();
/// let stream = StreamKey::new("bank", "account", "acc/1");
/// assert_eq!(layout.cursor_key(&stream), "brooks/bank/account/acc%2F1/cursor");
/// assert_eq!(
///     layout.event_key(&stream, 7),
///     "brooks/bank/account/acc%2F1/events/00000000000000000007"
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyLayout {
    namespace: Option<String>,
}

impl KeyLayout {
    /// A layout whose keys all start with `<namespace>/`.
    pub fn with_namespace(namespace: impl AsRef<str>) -> Self {
        Self {
            namespace: Some(escape_segment(namespace.as_ref()).into_owned()),
        }
    }

    fn root(&self, top: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{top}/"),
            None => format!("{top}/"),
        }
    }

    fn stream_path(&self, top: &str, stream: &StreamKey) -> String {
        format!(
            "{}{}/{}/{}/",
            self.root(top),
            escape_segment(stream.domain()),
            escape_segment(stream.stream_type()),
            escape_segment(stream.stream_id())
        )
    }

    /// `brooks/<domain>/<type>/<id>/`
    pub fn brook_prefix(&self, stream: &StreamKey) -> String {
        self.stream_path("brooks", stream)
    }

    /// Key of the committed cursor document.
    pub fn cursor_key(&self, stream: &StreamKey) -> String {
        format!("{}cursor", self.brook_prefix(stream))
    }

    /// Key of the pending (in-flight append) marker.
    pub fn pending_key(&self, stream: &StreamKey) -> String {
        format!("{}pending", self.brook_prefix(stream))
    }

    /// Prefix shared by every event document of a stream.
    pub fn events_prefix(&self, stream: &StreamKey) -> String {
        format!("{}events/", self.brook_prefix(stream))
    }

    /// Key of the event at `position`. Zero-padded so keys sort numerically.
    pub fn event_key(&self, stream: &StreamKey, position: u64) -> String {
        format!("{}{position:020}", self.events_prefix(stream))
    }

    /// Prefix shared by every snapshot of every projection of a stream.
    pub fn snapshot_stream_prefix(&self, stream: &StreamKey) -> String {
        self.stream_path("snapshots", stream)
    }

    /// Prefix of one snapshot family (one projection, one reducer hash).
    pub fn snapshot_family_prefix(
        &self,
        stream: &StreamKey,
        projection_type: &str,
        projection_id: &str,
        reducer_hash: &str,
    ) -> String {
        format!(
            "{}{}/{}/{}/",
            self.snapshot_stream_prefix(stream),
            escape_segment(projection_type),
            escape_segment(projection_id),
            escape_segment(reducer_hash)
        )
    }

    /// Key of one snapshot version within a family prefix.
    pub fn snapshot_version_key(family_prefix: &str, version: u64) -> String {
        format!("{family_prefix}{version:020}")
    }

    /// Key of the lease document for `resource`.
    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}{}", self.root("locks"), escape_segment(resource))
    }

    /// Parse the trailing zero-padded number of an event or snapshot key.
    pub fn trailing_number(key: &str) -> Option<u64> {
        key.rsplit('/').next()?.parse().ok()
    }
}

// --- in-memory backend ---

/// A transient fault for [`MemoryStore`] to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Request timeout.
    Timeout,
    /// Throttled with an optional retry-after hint.
    Throttled(Option<Duration>),
    /// Server error with the given status code.
    Server(u16),
}

impl Fault {
    fn to_error(self) -> StorageError {
        match self {
            Fault::Timeout => StorageError::Timeout,
            Fault::Throttled(retry_after) => StorageError::Throttled { retry_after },
            Fault::Server(status) => StorageError::Server {
                status,
                retry_after: None,
            },
        }
    }
}

#[derive(Debug)]
struct FaultRule {
    key_fragment: Option<String>,
    remaining: usize,
    fault: Fault,
}

#[derive(Debug, Default)]
struct MemoryInner {
    docs: RwLock<BTreeMap<String, Document>>,
    next_etag: AtomicU64,
    faults: Mutex<Vec<FaultRule>>,
    max_document_size: Option<usize>,
}

/// In-process [`DocumentStore`] for tests and single-process use.
///
/// Cloning shares the same documents. Supports fault injection
/// ([`fail_next`](Self::fail_next)) and an optional document size limit
/// that emulates a backend's 413 response.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// An empty store without a size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store rejecting documents larger than `bytes`.
    pub fn with_max_document_size(bytes: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                max_document_size: Some(bytes),
                ..MemoryInner::default()
            }),
        }
    }

    /// Fail the next `count` operations on any key with `fault`.
    pub fn fail_next(&self, count: usize, fault: Fault) {
        self.push_fault(None, count, fault);
    }

    /// Fail the next `count` operations on keys containing `fragment`.
    pub fn fail_matching(&self, fragment: impl Into<String>, count: usize, fault: Fault) {
        self.push_fault(Some(fragment.into()), count, fault);
    }

    fn push_fault(&self, key_fragment: Option<String>, remaining: usize, fault: Fault) {
        let mut faults = self.inner.faults.lock().unwrap_or_else(|e| e.into_inner());
        faults.push(FaultRule {
            key_fragment,
            remaining,
            fault,
        });
    }

    fn check_fault(&self, key: &str) -> Result<(), StorageError> {
        let mut faults = self.inner.faults.lock().unwrap_or_else(|e| e.into_inner());
        let rule = faults.iter_mut().find(|rule| {
            rule.remaining > 0
                && rule
                    .key_fragment
                    .as_deref()
                    .is_none_or(|fragment| key.contains(fragment))
        });
        match rule {
            Some(rule) => {
                rule.remaining -= 1;
                let err = rule.fault.to_error();
                faults.retain(|r| r.remaining > 0);
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn next_etag(&self) -> ETag {
        ETag(self.inner.next_etag.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// All stored keys, ascending.
    pub fn keys(&self) -> Vec<String> {
        let docs = self.inner.docs.read().unwrap_or_else(|e| e.into_inner());
        docs.keys().cloned().collect()
    }

    /// Write a document bypassing preconditions and faults.
    pub fn insert_raw(&self, key: impl Into<String>, data: Vec<u8>) -> ETag {
        let etag = self.next_etag();
        let mut docs = self.inner.docs.write().unwrap_or_else(|e| e.into_inner());
        docs.insert(key.into(), Document { data, etag });
        etag
    }
}

fn check_precondition(
    key: &str,
    current: Option<&Document>,
    precondition: Precondition,
) -> Result<(), StorageError> {
    let ok = match precondition {
        Precondition::None => true,
        Precondition::IfAbsent => current.is_none(),
        Precondition::IfMatch(etag) => current.is_some_and(|doc| doc.etag == etag),
    };
    if ok {
        Ok(())
    } else {
        Err(StorageError::PreconditionFailed {
            key: key.to_string(),
        })
    }
}

fn in_range(key: &str, prefix: &str, from: Option<&str>, to: Option<&str>) -> bool {
    key.starts_with(prefix) && from.is_none_or(|f| key >= f) && to.is_none_or(|t| key <= t)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StorageError> {
        self.check_fault(key)?;
        let docs = self.inner.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<ETag, StorageError> {
        self.check_fault(key)?;
        if let Some(max) = self.inner.max_document_size
            && data.len() > max
        {
            return Err(StorageError::PayloadTooLarge {
                key: key.to_string(),
                size: data.len(),
            });
        }
        let etag = self.next_etag();
        let mut docs = self.inner.docs.write().unwrap_or_else(|e| e.into_inner());
        check_precondition(key, docs.get(key), precondition)?;
        docs.insert(key.to_string(), Document { data, etag });
        Ok(etag)
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), StorageError> {
        self.check_fault(key)?;
        let mut docs = self.inner.docs.write().unwrap_or_else(|e| e.into_inner());
        let Some(current) = docs.get(key) else {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        };
        if let Precondition::IfMatch(etag) = precondition
            && current.etag != etag
        {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        docs.remove(key);
        Ok(())
    }

    async fn scan(
        &self,
        prefix: &str,
        from: Option<&str>,
        to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StorageError> {
        self.check_fault(prefix)?;
        let docs = self.inner.docs.read().unwrap_or_else(|e| e.into_inner());
        let start = from.unwrap_or(prefix).max(prefix).to_string();
        Ok(docs
            .range(start..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| in_range(key, prefix, from, to))
            .take(limit)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.check_fault(prefix)?;
        let docs = self.inner.docs.read().unwrap_or_else(|e| e.into_inner());
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

// --- filesystem backend ---

const DOC_EXTENSION: &str = ".doc";
const ETAG_HEADER_LEN: usize = 8;

/// [`DocumentStore`] backed by one file per document.
///
/// Each key maps to `<root>/<segment>/.../<last>.doc`. A file holds an
/// 8-byte big-endian tag followed by the document bytes. Writes go to a
/// temporary file that is renamed into place, so readers never observe a
/// partial document. Conditional operations are serialized within the
/// process; the store is not meant to be shared by several processes.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl FsStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        let mut segments = key.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}{DOC_EXTENSION}"));
            }
        }
        path
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for component in relative.components() {
            parts.push(component.as_os_str().to_str()?.to_string());
        }
        let last = parts.pop()?;
        parts.push(last.strip_suffix(DOC_EXTENSION)?.to_string());
        Some(parts.join("/"))
    }

    async fn read_doc(&self, key: &str, path: &Path) -> Result<Option<Document>, StorageError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < ETAG_HEADER_LEN {
            return Err(StorageError::Corrupt {
                key: key.to_string(),
                reason: format!("file holds {} bytes, shorter than its tag header", bytes.len()),
            });
        }
        let (header, data) = bytes.split_at(ETAG_HEADER_LEN);
        let mut tag = [0u8; ETAG_HEADER_LEN];
        tag.copy_from_slice(header);
        Ok(Some(Document {
            data: data.to_vec(),
            etag: ETag(u64::from_be_bytes(tag)),
        }))
    }

    async fn write_doc(&self, path: &Path, data: &[u8]) -> Result<ETag, StorageError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        // Random tags never repeat after a delete and re-create.
        let etag = ETag(uuid::Uuid::new_v4().as_u64_pair().0);
        let mut contents = Vec::with_capacity(ETAG_HEADER_LEN + data.len());
        contents.extend_from_slice(&etag.0.to_be_bytes());
        contents.extend_from_slice(data);

        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, &contents).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(etag)
    }

    async fn walk(&self, prefix: &str) -> Result<Vec<(String, PathBuf)>, StorageError> {
        let dir_part = prefix.rfind('/').map_or("", |i| &prefix[..i]);
        let mut start = self.root.clone();
        for segment in dir_part.split('/').filter(|s| !s.is_empty()) {
            start.push(segment);
        }

        let mut found = Vec::new();
        let mut stack = vec![start];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                } else if let Some(key) = self.key_for(&path)
                    && key.starts_with(prefix)
                {
                    found.push((key, path));
                }
            }
        }
        found.sort();
        Ok(found)
    }
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StorageError> {
        self.read_doc(key, &self.path_for(key)).await
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<ETag, StorageError> {
        let path = self.path_for(key);
        let _guard = self.write_lock.lock().await;
        if precondition != Precondition::None {
            let current = self.read_doc(key, &path).await?;
            check_precondition(key, current.as_ref(), precondition)?;
        }
        self.write_doc(&path, &data).await
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let _guard = self.write_lock.lock().await;
        let Some(current) = self.read_doc(key, &path).await? else {
            return Err(StorageError::NotFound {
                key: key.to_string(),
            });
        };
        if let Precondition::IfMatch(etag) = precondition
            && current.etag != etag
        {
            return Err(StorageError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn scan(
        &self,
        prefix: &str,
        from: Option<&str>,
        to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StorageError> {
        let mut out = Vec::new();
        for (key, path) in self.walk(prefix).await? {
            if out.len() >= limit {
                break;
            }
            if !in_range(&key, prefix, from, to) {
                continue;
            }
            // Deleted between listing and reading: skip it.
            if let Some(doc) = self.read_doc(&key, &path).await? {
                out.push((key, doc));
            }
        }
        Ok(out)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .walk(prefix)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }
}

// --- retry decorator ---

/// Decorator applying a [`RetryPolicy`] to every call of an inner store.
#[derive(Debug, Clone)]
pub struct RetryingStore {
    inner: SharedStore,
    policy: RetryPolicy,
    metrics: Option<BrookMetrics>,
}

impl RetryingStore {
    /// Wrap `inner` with `policy`.
    pub fn new(inner: SharedStore, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            metrics: None,
        }
    }

    /// Count retries in `brook_storage_retries_total`.
    pub fn with_metrics(mut self, metrics: BrookMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl DocumentStore for RetryingStore {
    async fn get(&self, key: &str) -> Result<Option<Document>, StorageError> {
        self.policy
            .run_observed("get", self.metrics.as_ref(), || self.inner.get(key))
            .await
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<ETag, StorageError> {
        self.policy
            .run_observed("put", self.metrics.as_ref(), || {
                self.inner.put(key, data.clone(), precondition)
            })
            .await
    }

    async fn delete(&self, key: &str, precondition: Precondition) -> Result<(), StorageError> {
        self.policy
            .run_observed("delete", self.metrics.as_ref(), || {
                self.inner.delete(key, precondition)
            })
            .await
    }

    async fn scan(
        &self,
        prefix: &str,
        from: Option<&str>,
        to: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Document)>, StorageError> {
        self.policy
            .run_observed("scan", self.metrics.as_ref(), || {
                self.inner.scan(prefix, from, to, limit)
            })
            .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.policy
            .run_observed("list_keys", self.metrics.as_ref(), || {
                self.inner.list_keys(prefix)
            })
            .await
    }
}
