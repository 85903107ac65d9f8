//! Aggregate snapshot persistence.
//!
//! A snapshot records an aggregate's serialized state after a given event,
//! keyed by `(owner, aggregate id, schema version, valid-from global
//! sequence)`. Hydration picks the newest snapshot strictly below its
//! cutoff and replays only the events after it.
//!
//! File snapshots are stored as JSON at
//! `<base_dir>/snapshots/<owner>/<aggregate_id>/v<schema>-<valid_from>.json`
//! and written atomically via temp-and-rename.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::persist::{file_stem, read_if_exists, write_json_atomic};

/// A persisted aggregate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Owner tag of the aggregate type.
    pub owner: String,
    /// Aggregate id.
    pub aggregate_id: String,
    /// [`Aggregate::SCHEMA_VERSION`](crate::Aggregate::SCHEMA_VERSION) at
    /// save time.
    pub schema_version: u32,
    /// Global sequence of the last event folded into `state`.
    pub valid_from_global: i64,
    /// Local sequence of the last event folded into `state`.
    pub local_sequence: i64,
    /// Serialized aggregate state.
    pub state: serde_json::Value,
}

/// When the repository writes a new snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Save after a hydration that replayed at least this many events.
    ///
    /// Default: 50.
    pub min_replayed_events: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            min_replayed_events: 50,
        }
    }
}

/// Storage for [`SnapshotRecord`]s.
pub trait SnapshotStore: Send + Sync {
    /// Newest snapshot for the aggregate with a matching schema version and
    /// `valid_from_global < before_global`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure. Callers treat any error as
    /// a cache miss.
    fn load(
        &self,
        owner: &str,
        aggregate_id: &str,
        schema_version: u32,
        before_global: i64,
    ) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Persist a snapshot, replacing one with the same key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    fn save(&self, record: &SnapshotRecord) -> Result<(), StoreError>;
}

/// Snapshots held in memory.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    records: RwLock<Vec<SnapshotRecord>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored snapshots.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns `true` if no snapshot has been saved.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn load(
        &self,
        owner: &str,
        aggregate_id: &str,
        schema_version: u32,
        before_global: i64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|r| {
                r.owner == owner
                    && r.aggregate_id == aggregate_id
                    && r.schema_version == schema_version
                    && r.valid_from_global < before_global
            })
            .max_by_key(|r| r.valid_from_global)
            .cloned())
    }

    fn save(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.retain(|r| {
            !(r.owner == record.owner
                && r.aggregate_id == record.aggregate_id
                && r.schema_version == record.schema_version
                && r.valid_from_global == record.valid_from_global)
        });
        records.push(record.clone());
        Ok(())
    }
}

/// Snapshots stored as JSON files under a base directory.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at `base_dir`. Directories are created lazily.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn aggregate_dir(&self, owner: &str, aggregate_id: &str) -> PathBuf {
        self.base_dir
            .join("snapshots")
            .join(file_stem(owner))
            .join(file_stem(aggregate_id))
    }
}

/// Compute the filesystem path for a snapshot file.
///
/// # Returns
///
/// `<base_dir>/snapshots/<owner>/<aggregate_id>/v<schema>-<valid_from>.json`,
/// with owner and id escaped for the filesystem.
pub fn snapshot_path(
    base_dir: &Path,
    owner: &str,
    aggregate_id: &str,
    schema_version: u32,
    valid_from_global: i64,
) -> PathBuf {
    FileSnapshotStore::new(base_dir)
        .aggregate_dir(owner, aggregate_id)
        .join(format!("v{schema_version}-{valid_from_global}.json"))
}

/// Parse `v<schema>-<valid_from>.json` back into its key parts.
fn parse_snapshot_name(name: &str) -> Option<(u32, i64)> {
    let (schema, valid_from) = name.strip_suffix(".json")?.strip_prefix('v')?.split_once('-')?;
    Some((schema.parse().ok()?, valid_from.parse().ok()?))
}

impl SnapshotStore for FileSnapshotStore {
    fn load(
        &self,
        owner: &str,
        aggregate_id: &str,
        schema_version: u32,
        before_global: i64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let dir = self.aggregate_dir(owner, aggregate_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<i64> = None;
        for entry in entries {
            let name = entry?.file_name();
            let Some((schema, valid_from)) = name.to_str().and_then(parse_snapshot_name) else {
                continue;
            };
            if schema == schema_version
                && valid_from < before_global
                && newest.is_none_or(|n| valid_from > n)
            {
                newest = Some(valid_from);
            }
        }
        let Some(valid_from) = newest else {
            return Ok(None);
        };

        let path = snapshot_path(
            &self.base_dir,
            owner,
            aggregate_id,
            schema_version,
            valid_from,
        );
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<SnapshotRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    fn save(&self, record: &SnapshotRecord) -> Result<(), StoreError> {
        let path = snapshot_path(
            &self.base_dir,
            &record.owner,
            &record.aggregate_id,
            record.schema_version,
            record.valid_from_global,
        );
        write_json_atomic(&path, record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(valid_from: i64, value: u64) -> SnapshotRecord {
        SnapshotRecord {
            owner: "counter".into(),
            aggregate_id: "c-1".into(),
            schema_version: 0,
            valid_from_global: valid_from,
            local_sequence: valid_from,
            state: json!({ "value": value }),
        }
    }

    fn exercise_newest_below_cutoff(store: &dyn SnapshotStore) {
        store.save(&record(3, 4)).expect("save");
        store.save(&record(9, 10)).expect("save");

        let latest = store
            .load("counter", "c-1", 0, i64::MAX)
            .expect("load")
            .expect("snapshot exists");
        assert_eq!(latest.valid_from_global, 9);

        let bounded = store
            .load("counter", "c-1", 0, 9)
            .expect("load")
            .expect("older snapshot exists");
        assert_eq!(bounded.valid_from_global, 3);

        assert!(store.load("counter", "c-1", 0, 3).expect("load").is_none());
        assert!(store.load("counter", "c-1", 1, i64::MAX).expect("load").is_none());
        assert!(store.load("counter", "c-2", 0, i64::MAX).expect("load").is_none());
    }

    #[test]
    fn snapshot_path_returns_expected_path() {
        let path = snapshot_path(Path::new("/data/app"), "counter", "c/1", 2, 17);
        assert_eq!(
            path,
            PathBuf::from("/data/app/snapshots/counter/c%2F1/v2-17.json")
        );
    }

    #[test]
    fn parse_snapshot_name_round_trips_key() {
        assert_eq!(parse_snapshot_name("v2-17.json"), Some((2, 17)));
        assert_eq!(parse_snapshot_name("v2-17.json.tmp"), None);
        assert_eq!(parse_snapshot_name("notes.txt"), None);
    }

    #[test]
    fn in_memory_store_picks_newest_below_cutoff() {
        exercise_newest_below_cutoff(&InMemorySnapshotStore::new());
    }

    #[test]
    fn file_store_picks_newest_below_cutoff() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        exercise_newest_below_cutoff(&FileSnapshotStore::new(dir.path()));
    }

    #[test]
    fn in_memory_save_replaces_same_key() {
        let store = InMemorySnapshotStore::new();
        store.save(&record(3, 4)).expect("save");
        store.save(&record(3, 5)).expect("save");
        assert_eq!(store.len(), 1);
        let loaded = store
            .load("counter", "c-1", 0, i64::MAX)
            .expect("load")
            .expect("exists");
        assert_eq!(loaded.state["value"], 5);
    }

    #[test]
    fn corrupt_file_is_a_cache_miss() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = snapshot_path(dir.path(), "counter", "c-1", 0, 5);
        std::fs::create_dir_all(path.parent().expect("has parent")).expect("create dir");
        std::fs::write(&path, b"this is not valid json!!!").expect("write corrupt file");

        let store = FileSnapshotStore::new(dir.path());
        let result = store
            .load("counter", "c-1", 0, i64::MAX)
            .expect("load should succeed (not Err)");
        assert!(result.is_none());
    }

    #[test]
    fn file_save_uses_atomic_temp_rename() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileSnapshotStore::new(dir.path());
        store.save(&record(4, 1)).expect("save");

        let final_path = snapshot_path(dir.path(), "counter", "c-1", 0, 4);
        assert!(final_path.exists());
        assert!(!final_path.with_extension("json.tmp").exists());
    }
}
