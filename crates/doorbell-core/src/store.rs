//! File-backed known-face store.
//!
//! The store is a JSON document mapping each enrolled name to its list of
//! embeddings. Writers replace the file atomically (temporary sibling +
//! rename); the access-control loop polls the modification time and
//! reloads the whole set when it advances.

use crate::types::{Embedding, KnownFaceSet};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed face store {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no enrolled user named {0:?}")]
    UnknownUser(String),
    #[error("a user named {0:?} is already enrolled")]
    NameTaken(String),
}

/// All embeddings enrolled under one name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredIdentity {
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

/// On-disk representation of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub faces: Vec<StoredIdentity>,
}

impl StoreDocument {
    /// Read a store document. A missing file is an empty store.
    pub fn read(path: &Path) -> Result<Self, StoreError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Atomically replace the store file with this document.
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        let write_err = |source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }

        let json = serde_json::to_vec_pretty(self).map_err(|e| write_err(e.into()))?;
        let tmp = temp_sibling(path);
        {
            let mut file = std::fs::File::create(&tmp).map_err(write_err)?;
            file.write_all(&json).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        std::fs::rename(&tmp, path).map_err(write_err)
    }

    /// Enrolled names in store order.
    pub fn users(&self) -> Vec<&str> {
        self.faces.iter().map(|f| f.name.as_str()).collect()
    }

    /// Append embeddings under `name`, creating the identity if needed.
    pub fn add(&mut self, name: &str, embeddings: Vec<Embedding>) {
        match self.faces.iter_mut().find(|f| f.name == name) {
            Some(identity) => identity.embeddings.extend(embeddings),
            None => self.faces.push(StoredIdentity {
                name: name.to_string(),
                embeddings,
            }),
        }
    }

    pub fn rename_user(&mut self, old: &str, new: &str) -> Result<(), StoreError> {
        if old != new && self.faces.iter().any(|f| f.name == new) {
            return Err(StoreError::NameTaken(new.to_string()));
        }
        let identity = self
            .faces
            .iter_mut()
            .find(|f| f.name == old)
            .ok_or_else(|| StoreError::UnknownUser(old.to_string()))?;
        identity.name = new.to_string();
        Ok(())
    }

    pub fn remove_user(&mut self, name: &str) -> Result<(), StoreError> {
        let before = self.faces.len();
        self.faces.retain(|f| f.name != name);
        if self.faces.len() == before {
            return Err(StoreError::UnknownUser(name.to_string()));
        }
        Ok(())
    }

    /// Flatten into (name, embedding) pairs, preserving store order.
    pub fn to_face_set(&self) -> KnownFaceSet {
        self.faces
            .iter()
            .flat_map(|identity| {
                identity
                    .embeddings
                    .iter()
                    .map(move |e| (identity.name.clone(), e.clone()))
            })
            .collect()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "faces.json".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Read side of the store, tracking the modification time last loaded.
#[derive(Debug)]
pub struct FaceStore {
    path: PathBuf,
    loaded_mtime: Option<SystemTime>,
}

impl FaceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded_mtime: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the full set unconditionally.
    ///
    /// The recorded modification time only advances after a successful
    /// parse, so a failed load is retried on the next poll.
    pub fn load(&mut self) -> Result<KnownFaceSet, StoreError> {
        let mtime = modified_time(&self.path);
        let doc = StoreDocument::read(&self.path)?;
        self.loaded_mtime = mtime;
        Ok(doc.to_face_set())
    }

    /// Reload only if the file's modification time advanced since the last load.
    pub fn poll(&mut self) -> Result<Option<KnownFaceSet>, StoreError> {
        let current = modified_time(&self.path);
        if current <= self.loaded_mtime {
            return Ok(None);
        }
        tracing::info!(path = %self.path.display(), "face store changed, reloading");
        self.load().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn emb(v: f32) -> Embedding {
        Embedding::new(vec![v, v])
    }

    fn sample() -> StoreDocument {
        let mut doc = StoreDocument::default();
        doc.add("alice", vec![emb(1.0), emb(2.0)]);
        doc.add("bob", vec![emb(3.0)]);
        doc
    }

    fn bump_mtime(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
    }

    #[test]
    fn test_missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FaceStore::new(dir.path().join("faces.json"));
        assert!(store.load().unwrap().is_empty());
        assert!(store.poll().unwrap().is_none());
    }

    #[test]
    fn test_write_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/faces.json");
        sample().write(&path).unwrap();

        let set = FaceStore::new(&path).load().unwrap();
        let names: Vec<&str> = set.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "alice", "bob"]);
        assert!(!dir.path().join("nested/.faces.json.tmp").exists());
    }

    #[test]
    fn test_add_appends_to_existing_identity() {
        let mut doc = sample();
        doc.add("alice", vec![emb(9.0)]);
        assert_eq!(doc.users(), vec!["alice", "bob"]);
        assert_eq!(doc.faces[0].embeddings.len(), 3);
    }

    #[test]
    fn test_rename_user() {
        let mut doc = sample();
        doc.rename_user("bob", "robert").unwrap();
        assert_eq!(doc.users(), vec!["alice", "robert"]);
        assert!(matches!(doc.rename_user("carol", "x"), Err(StoreError::UnknownUser(_))));
        assert!(matches!(doc.rename_user("alice", "robert"), Err(StoreError::NameTaken(_))));
    }

    #[test]
    fn test_remove_user() {
        let mut doc = sample();
        doc.remove_user("alice").unwrap();
        assert_eq!(doc.users(), vec!["bob"]);
        assert_eq!(doc.to_face_set().len(), 1);
        assert!(matches!(doc.remove_user("alice"), Err(StoreError::UnknownUser(_))));
    }

    #[test]
    fn test_poll_reloads_when_mtime_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        sample().write(&path).unwrap();

        let mut store = FaceStore::new(&path);
        assert_eq!(store.load().unwrap().len(), 3);
        assert!(store.poll().unwrap().is_none(), "unchanged store must not reload");

        let mut doc = StoreDocument::read(&path).unwrap();
        doc.remove_user("bob").unwrap();
        doc.write(&path).unwrap();
        bump_mtime(&path, 5);

        let reloaded = store.poll().unwrap().expect("store should reload");
        assert_eq!(reloaded.names(), vec!["alice"]);
        assert!(store.poll().unwrap().is_none());
    }

    #[test]
    fn test_poll_keeps_retrying_malformed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces.json");
        let mut store = FaceStore::new(&path);
        store.load().unwrap();

        std::fs::write(&path, b"{\"faces\": [").unwrap();
        assert!(matches!(store.poll(), Err(StoreError::Parse { .. })));

        sample().write(&path).unwrap();
        bump_mtime(&path, 5);
        assert_eq!(store.poll().unwrap().map(|s| s.len()), Some(3));
    }
}
