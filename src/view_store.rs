//! View persistence: per-instance documents plus a position document.
//!
//! The position document is written after the instances it covers, so after
//! a crash it can only lag the instances. When it is missing or unreadable
//! the position falls back to the lowest instance watermark, which never
//! overstates what was durably applied.

use std::collections::HashMap;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ViewError;
use crate::event::NO_SEQUENCE;
use crate::persist::{file_stem, read_if_exists, write_json_atomic};

/// One materialized view instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewDocument<V> {
    /// Instance id, derived by the view's locator.
    pub id: String,
    /// Global sequence of the last event applied to this instance.
    pub last_global_sequence: i64,
    /// Application state.
    pub state: V,
}

impl<V: Default> ViewDocument<V> {
    /// A fresh instance that has applied nothing.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_global_sequence: NO_SEQUENCE,
            state: V::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PositionDocument {
    last_global_sequence: i64,
}

/// Storage for one view's instances and position.
pub trait ViewStore<V>: Send + Sync {
    /// Read instance `id`, or `None` if it was never written.
    ///
    /// # Errors
    ///
    /// [`ViewError`] on backend or decode failure.
    fn load(&self, id: &str) -> Result<Option<ViewDocument<V>>, ViewError>;

    /// Insert or replace an instance.
    ///
    /// # Errors
    ///
    /// [`ViewError`] on backend or encode failure.
    fn upsert(&self, doc: &ViewDocument<V>) -> Result<(), ViewError>;

    /// Remove every instance and the position document.
    ///
    /// # Errors
    ///
    /// [`ViewError`] on backend failure.
    fn delete_all(&self) -> Result<(), ViewError>;

    /// Lowest `last_global_sequence` over all instances, or `None` if there
    /// are none.
    ///
    /// # Errors
    ///
    /// [`ViewError`] on backend or decode failure.
    fn min_last_global_sequence(&self) -> Result<Option<i64>, ViewError>;

    /// Stored position document, or `None` if absent.
    ///
    /// # Errors
    ///
    /// [`ViewError`] on backend failure.
    fn get_position(&self) -> Result<Option<i64>, ViewError>;

    /// Overwrite the position document.
    ///
    /// # Errors
    ///
    /// [`ViewError`] on backend failure.
    fn set_position(&self, position: i64) -> Result<(), ViewError>;
}

struct Documents<V> {
    instances: HashMap<String, ViewDocument<V>>,
    position: Option<i64>,
}

/// View documents held in memory.
pub struct InMemoryViewStore<V> {
    inner: RwLock<Documents<V>>,
}

impl<V> Default for InMemoryViewStore<V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Documents {
                instances: HashMap::new(),
                position: None,
            }),
        }
    }
}

impl<V> InMemoryViewStore<V> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V> std::fmt::Debug for InMemoryViewStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let docs = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("InMemoryViewStore")
            .field("instances", &docs.instances.len())
            .field("position", &docs.position)
            .finish()
    }
}

impl<V: Clone + Send + Sync> ViewStore<V> for InMemoryViewStore<V> {
    fn load(&self, id: &str) -> Result<Option<ViewDocument<V>>, ViewError> {
        let docs = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.instances.get(id).cloned())
    }

    fn upsert(&self, doc: &ViewDocument<V>) -> Result<(), ViewError> {
        let mut docs = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        docs.instances.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    fn delete_all(&self) -> Result<(), ViewError> {
        let mut docs = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        docs.instances.clear();
        docs.position = None;
        Ok(())
    }

    fn min_last_global_sequence(&self) -> Result<Option<i64>, ViewError> {
        let docs = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(docs
            .instances
            .values()
            .map(|d| d.last_global_sequence)
            .min())
    }

    fn get_position(&self) -> Result<Option<i64>, ViewError> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .position)
    }

    fn set_position(&self, position: i64) -> Result<(), ViewError> {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .position = Some(position);
        Ok(())
    }
}

/// View documents stored as JSON files in one directory per view.
///
/// Layout: `<dir>/instances/<id>.json` and `<dir>/position.json`.
#[derive(Debug, Clone)]
pub struct FileViewStore<V> {
    dir: PathBuf,
    _state: PhantomData<fn() -> V>,
}

impl<V> FileViewStore<V> {
    /// Create a store rooted at `dir`. Directories are created lazily.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _state: PhantomData,
        }
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instances_dir(&self) -> PathBuf {
        self.dir.join("instances")
    }

    fn instance_path(&self, id: &str) -> PathBuf {
        self.instances_dir().join(format!("{}.json", file_stem(id)))
    }

    fn position_path(&self) -> PathBuf {
        self.dir.join("position.json")
    }
}

impl<V: Serialize + DeserializeOwned> ViewStore<V> for FileViewStore<V> {
    fn load(&self, id: &str) -> Result<Option<ViewDocument<V>>, ViewError> {
        match read_if_exists(&self.instance_path(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn upsert(&self, doc: &ViewDocument<V>) -> Result<(), ViewError> {
        write_json_atomic(&self.instance_path(&doc.id), doc)?;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), ViewError> {
        // Rewind first: until the instances are gone the view must resume
        // from the start, never from a watermark it is about to lose.
        let position = self.position_path();
        write_json_atomic(
            &position,
            &PositionDocument {
                last_global_sequence: NO_SEQUENCE,
            },
        )?;
        match std::fs::remove_dir_all(self.instances_dir()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match std::fs::remove_file(&position) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn min_last_global_sequence(&self) -> Result<Option<i64>, ViewError> {
        let entries = match std::fs::read_dir(self.instances_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut min: Option<i64> = None;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let doc: ViewDocument<serde::de::IgnoredAny> =
                serde_json::from_slice(&std::fs::read(&path)?)?;
            min = Some(min.map_or(doc.last_global_sequence, |m| {
                m.min(doc.last_global_sequence)
            }));
        }
        Ok(min)
    }

    fn get_position(&self) -> Result<Option<i64>, ViewError> {
        let path = self.position_path();
        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        match serde_json::from_slice::<PositionDocument>(&bytes) {
            Ok(doc) => Ok(Some(doc.last_global_sequence)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt view position document; falling back to instance scan"
                );
                Ok(None)
            }
        }
    }

    fn set_position(&self, position: i64) -> Result<(), ViewError> {
        write_json_atomic(
            &self.position_path(),
            &PositionDocument {
                last_global_sequence: position,
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        count: u32,
    }

    fn doc(id: &str, last: i64, count: u32) -> ViewDocument<Tally> {
        ViewDocument {
            id: id.into(),
            last_global_sequence: last,
            state: Tally { count },
        }
    }

    fn exercise_store(store: &dyn ViewStore<Tally>) {
        assert_eq!(store.load("a").expect("load"), None);
        assert_eq!(store.min_last_global_sequence().expect("min"), None);
        assert_eq!(store.get_position().expect("position"), None);

        store.upsert(&doc("a", 4, 1)).expect("upsert");
        store.upsert(&doc("b", 2, 1)).expect("upsert");
        store.upsert(&doc("a", 7, 2)).expect("replace");
        store.set_position(7).expect("set position");

        assert_eq!(store.load("a").expect("load"), Some(doc("a", 7, 2)));
        assert_eq!(store.min_last_global_sequence().expect("min"), Some(2));
        assert_eq!(store.get_position().expect("position"), Some(7));

        store.delete_all().expect("delete");
        assert_eq!(store.load("a").expect("load"), None);
        assert_eq!(store.min_last_global_sequence().expect("min"), None);
        assert_eq!(store.get_position().expect("position"), None);
    }

    #[test]
    fn in_memory_store_round_trip() {
        exercise_store(&InMemoryViewStore::new());
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        exercise_store(&FileViewStore::new(dir.path().join("tally")));
    }

    #[test]
    fn file_store_escapes_instance_ids() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileViewStore::<Tally>::new(dir.path());
        store.upsert(&doc("../outside", 1, 1)).expect("upsert");
        assert!(dir.path().join("instances").join("%2E%2E%2Foutside.json").exists());
        assert_eq!(
            store.load("../outside").expect("load"),
            Some(doc("../outside", 1, 1))
        );
    }

    #[test]
    fn corrupt_position_document_reads_as_absent() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileViewStore::<Tally>::new(dir.path());
        store.upsert(&doc("a", 3, 1)).expect("upsert");
        std::fs::write(dir.path().join("position.json"), b"{ truncated")
            .expect("write corrupt file");

        assert_eq!(store.get_position().expect("position"), None);
        assert_eq!(store.min_last_global_sequence().expect("min"), Some(3));
    }

    #[test]
    fn failed_file_purge_rewinds_position() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileViewStore::<Tally>::new(dir.path());
        store.set_position(7).expect("set position");
        // A plain file where the instances directory belongs cannot be
        // removed as a directory.
        std::fs::write(dir.path().join("instances"), b"in the way").expect("write blocker");

        assert!(store.delete_all().is_err());
        assert_eq!(store.get_position().expect("position"), Some(NO_SEQUENCE));
    }

    #[test]
    fn corrupt_instance_is_an_error() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let store = FileViewStore::<Tally>::new(dir.path());
        store.upsert(&doc("a", 3, 1)).expect("upsert");
        std::fs::write(dir.path().join("instances").join("a.json"), b"nope")
            .expect("write corrupt file");
        assert!(matches!(store.load("a"), Err(ViewError::Codec(_))));
    }
}
