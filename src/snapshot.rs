//! Versioned snapshot persistence and retention.
//!
//! Snapshots are grouped into *families*: one family per stream,
//! projection type, projection id, and reducer hash. Each family holds
//! versions keyed by the last event position folded in, so a snapshot at
//! version `V` reflects positions `[0, V]`.
//!
//! An envelope is stored as a single-line JSON header followed by a
//! newline and the codec-encoded body.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;
use crate::event::StreamKey;
use crate::metrics::BrookMetrics;
use crate::storage::{KeyLayout, Precondition, SharedStore, delete_if_exists};

/// Identifies one snapshot family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotStreamKey {
    /// Source event stream.
    pub stream: StreamKey,
    /// Projection type name.
    pub projection_type: String,
    /// Projection instance id.
    pub projection_id: String,
    /// Hash of the reducer composition that produced the state.
    pub reducer_hash: String,
}

impl SnapshotStreamKey {
    /// Create a family key.
    pub fn new(
        stream: StreamKey,
        projection_type: impl Into<String>,
        projection_id: impl Into<String>,
        reducer_hash: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            projection_type: projection_type.into(),
            projection_id: projection_id.into(),
            reducer_hash: reducer_hash.into(),
        }
    }

    /// The snapshot of this family at `version`.
    pub fn at(&self, version: u64) -> SnapshotKey {
        SnapshotKey {
            family: self.clone(),
            version,
        }
    }

    /// `"<projection_type>/<projection_id>"`.
    pub fn projection_path(&self) -> String {
        format!("{}/{}", self.projection_type, self.projection_id)
    }
}

impl fmt::Display for SnapshotStreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}",
            self.stream,
            self.projection_path(),
            self.reducer_hash
        )
    }
}

/// One snapshot version within a family.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotKey {
    /// Owning family.
    pub family: SnapshotStreamKey,
    /// Last event position folded into the snapshot.
    pub version: u64,
}

#[derive(Serialize, Deserialize)]
struct EnvelopeHeader {
    content_type: String,
    reducer_hash: String,
}

/// A stored snapshot body with the facts needed to decode and trust it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEnvelope {
    /// Content type of `data`.
    pub content_type: String,
    /// Reducer hash that produced the state.
    pub reducer_hash: String,
    /// Codec-encoded projection state.
    pub data: Vec<u8>,
}

impl SnapshotEnvelope {
    fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(&EnvelopeHeader {
            content_type: self.content_type.clone(),
            reducer_hash: self.reducer_hash.clone(),
        })?;
        bytes.push(b'\n');
        bytes.extend_from_slice(&self.data);
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        let (header, data) = match bytes.iter().position(|b| *b == b'\n') {
            Some(split) => (&bytes[..split], &bytes[split + 1..]),
            None => (bytes, &[][..]),
        };
        let header: EnvelopeHeader = serde_json::from_slice(header)?;
        Ok(Self {
            content_type: header.content_type,
            reducer_hash: header.reducer_hash,
            data: data.to_vec(),
        })
    }
}

/// How densely snapshots are retained.
///
/// A version is kept when it is a multiple of the projection's modulus
/// (or is the newest version of its family).
///
/// # Examples
///
/// ```
/// use brook_es::RetentionPolicy;
///
/// let policy = RetentionPolicy::default().with_override("ledger", 10);
/// assert_eq!(policy.modulus_for("ledger"), 10);
/// assert_eq!(policy.modulus_for("balance"), 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Modulus for projection types without an override.
    pub default_modulus: u64,
    /// Per-projection-type moduli.
    pub overrides: HashMap<String, u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            default_modulus: 100,
            overrides: HashMap::new(),
        }
    }
}

impl RetentionPolicy {
    /// Set the modulus for one projection type.
    pub fn with_override(mut self, projection_type: impl Into<String>, modulus: u64) -> Self {
        self.overrides.insert(projection_type.into(), modulus);
        self
    }

    /// Effective modulus for `projection_type`, never zero.
    pub fn modulus_for(&self, projection_type: &str) -> u64 {
        self.overrides
            .get(projection_type)
            .copied()
            .unwrap_or(self.default_modulus)
            .max(1)
    }
}

/// The retained version a build for `target` should start from.
///
/// Always strictly below `target` when `target > 0`, and `0` for
/// `target == 0`. A modulus of `0` behaves like `1`.
///
/// # Examples
///
/// ```
/// use brook_es::snapshot::find_base_version;
///
/// assert_eq!(find_base_version(250, 100), 200);
/// assert_eq!(find_base_version(200, 100), 100);
/// assert_eq!(find_base_version(7, 0), 6);
/// ```
pub fn find_base_version(target: u64, modulus: u64) -> u64 {
    let modulus = modulus.max(1);
    if target == 0 {
        return 0;
    }
    let floor = (target / modulus) * modulus;
    if floor == target {
        floor - modulus
    } else {
        floor
    }
}

/// Snapshot persistence over a [`DocumentStore`](crate::storage::DocumentStore).
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    store: SharedStore,
    layout: KeyLayout,
    metrics: Option<BrookMetrics>,
}

impl SnapshotStore {
    /// Create a snapshot store.
    pub fn new(store: SharedStore, layout: KeyLayout) -> Self {
        Self {
            store,
            layout,
            metrics: None,
        }
    }

    /// Record persist metrics.
    pub fn with_metrics(mut self, metrics: BrookMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn family_prefix(&self, family: &SnapshotStreamKey) -> String {
        self.layout.snapshot_family_prefix(
            &family.stream,
            &family.projection_type,
            &family.projection_id,
            &family.reducer_hash,
        )
    }

    fn storage_key(&self, key: &SnapshotKey) -> String {
        KeyLayout::snapshot_version_key(&self.family_prefix(&key.family), key.version)
    }

    /// Read one snapshot.
    ///
    /// # Returns
    ///
    /// `Ok(None)` if no snapshot exists at `key`.
    ///
    /// # Errors
    ///
    /// * [`SnapshotError::Corrupt`] -- the stored bytes are not an envelope.
    /// * [`SnapshotError::Storage`] -- the backend failed.
    pub async fn read(&self, key: &SnapshotKey) -> Result<Option<SnapshotEnvelope>, SnapshotError> {
        let storage_key = self.storage_key(key);
        let Some(doc) = self.store.get(&storage_key).await? else {
            return Ok(None);
        };
        SnapshotEnvelope::from_bytes(&doc.data)
            .map(Some)
            .map_err(|source| SnapshotError::Corrupt {
                key: storage_key,
                source,
            })
    }

    /// Write (or overwrite) one snapshot.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Storage`] if the backend rejects the write.
    pub async fn write(
        &self,
        key: &SnapshotKey,
        envelope: &SnapshotEnvelope,
    ) -> Result<(), SnapshotError> {
        let started = Instant::now();
        let bytes = envelope.to_bytes()?;
        self.store
            .put(&self.storage_key(key), bytes, Precondition::None)
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.snapshot_persisted(
                &key.family.projection_type,
                started.elapsed().as_secs_f64(),
            );
        }
        tracing::debug!(family = %key.family, version = key.version, "snapshot persisted");
        Ok(())
    }

    /// Delete one snapshot. A missing snapshot is not an error.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Storage`] if the backend fails.
    pub async fn delete(&self, key: &SnapshotKey) -> Result<(), SnapshotError> {
        delete_if_exists(self.store.as_ref(), &self.storage_key(key), Precondition::None).await?;
        Ok(())
    }

    /// Delete every snapshot of every projection of `stream`.
    ///
    /// # Returns
    ///
    /// The number of snapshots removed.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Storage`] if listing or a delete fails.
    pub async fn delete_all(&self, stream: &StreamKey) -> Result<usize, SnapshotError> {
        let keys = self
            .store
            .list_keys(&self.layout.snapshot_stream_prefix(stream))
            .await?;
        for key in &keys {
            delete_if_exists(self.store.as_ref(), key, Precondition::None).await?;
        }
        tracing::info!(stream = %stream, removed = keys.len(), "snapshots deleted");
        Ok(keys.len())
    }

    /// Stored versions of a family, ascending.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Storage`] if listing fails.
    pub async fn versions(&self, family: &SnapshotStreamKey) -> Result<Vec<u64>, SnapshotError> {
        let mut versions: Vec<u64> = self
            .store
            .list_keys(&self.family_prefix(family))
            .await?
            .iter()
            .filter_map(|key| KeyLayout::trailing_number(key))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    /// Delete versions that are a multiple of none of `retain_moduli`,
    /// always keeping the newest version. Zero moduli are ignored.
    ///
    /// # Returns
    ///
    /// The number of versions deleted.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::Storage`] if listing or a delete fails.
    pub async fn prune(
        &self,
        family: &SnapshotStreamKey,
        retain_moduli: &[u64],
    ) -> Result<usize, SnapshotError> {
        let versions = self.versions(family).await?;
        let Some(&newest) = versions.last() else {
            return Ok(0);
        };
        let mut removed = 0;
        for version in versions {
            let retained = version == newest
                || retain_moduli
                    .iter()
                    .any(|m| *m != 0 && version % m == 0);
            if !retained {
                self.delete(&family.at(version)).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(family = %family, removed, "snapshots pruned");
        }
        Ok(removed)
    }
}
