//! Persistence collaborator.
//!
//! The server stores three kinds of blobs: per-client context records, world
//! snapshots addressed by [`WorldId`], and the temporary world index. It never
//! interprets their contents beyond JSON for its own records.

use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;
use crate::world::WorldId;

/// Address of a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageKey {
    Client(Uuid),
    World(WorldId),
    TempWorldIndex,
}

pub trait Storage: Send + Sync {
    fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError>;

    /// `Ok(None)` when nothing is stored under `key`.
    fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &StorageKey) -> Result<(), StorageError>;
}

/// Directory-backed storage.
///
/// Layout: `clients/<uuid>.json`, `worlds/<world id>.world` and
/// `tempworlds.json` under the root. Writes go to a temporary file that is
/// renamed into place.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        for dir in [root.join("clients"), root.join("worlds")] {
            fs::create_dir_all(&dir).map_err(|source| io_error(&dir, source))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        match key {
            StorageKey::Client(uuid) => self.root.join("clients").join(format!("{}.json", uuid.simple())),
            StorageKey::World(world) => self
                .root
                .join("worlds")
                .join(format!("{}.world", sanitize_file_name(&world.to_string()))),
            StorageKey::TempWorldIndex => self.root.join("tempworlds.json"),
        }
    }
}

impl Storage for FileStorage {
    fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).map_err(|source| io_error(&tmp, source))?;
        fs::rename(&tmp, &path).map_err(|source| io_error(&path, source))?;
        debug!("Saved {} bytes to {}", data.len(), path.display());
        Ok(())
    }

    fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(io_error(&path, source)),
        }
    }

    fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(io_error(&path, source)),
        }
    }
}

/// In-memory storage, mainly for tests and ephemeral servers.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    blobs: DashMap<StorageKey, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.blobs.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn save(&self, key: &StorageKey, data: &[u8]) -> Result<(), StorageError> {
        self.blobs.insert(key.clone(), data.to_vec());
        Ok(())
    }

    fn load(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blobs.get(key).map(|blob| blob.clone()))
    }

    fn delete(&self, key: &StorageKey) -> Result<(), StorageError> {
        self.blobs.remove(key);
        Ok(())
    }
}

fn io_error(path: &Path, source: io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Maps a world id to a portable file name.
fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{CelestialCoordinate, InstanceWorldId};
    use tempfile::TempDir;

    #[test]
    fn test_file_storage_layout_and_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();

        let player = Uuid::new_v4();
        let planet = WorldId::Celestial(CelestialCoordinate::body([1, -2, 3], 4, 0));
        storage.save(&StorageKey::Client(player), b"{}").unwrap();
        storage.save(&StorageKey::World(planet.clone()), b"snapshot").unwrap();
        storage.save(&StorageKey::TempWorldIndex, b"[]").unwrap();

        assert!(dir.path().join("clients").join(format!("{}.json", player.simple())).exists());
        assert!(dir.path().join("worlds").join("CelestialWorld_1_-2_3_4_0.world").exists());
        assert!(dir.path().join("tempworlds.json").exists());

        assert_eq!(
            storage.load(&StorageKey::World(planet.clone())).unwrap().as_deref(),
            Some(&b"snapshot"[..])
        );
        storage.delete(&StorageKey::World(planet.clone())).unwrap();
        storage.delete(&StorageKey::World(planet.clone())).unwrap();
        assert!(storage.load(&StorageKey::World(planet)).unwrap().is_none());
    }

    #[test]
    fn test_instance_names_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        let world = WorldId::Instance(InstanceWorldId::new("../../escape"));
        let path = storage.path_for(&StorageKey::World(world));
        assert_eq!(path.parent().unwrap(), dir.path().join("worlds"));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_memory_storage() {
        let storage = MemoryStorage::new();
        let key = StorageKey::Client(Uuid::new_v4());
        assert!(storage.load(&key).unwrap().is_none());
        storage.save(&key, b"data").unwrap();
        assert!(storage.contains(&key));
        assert_eq!(storage.len(), 1);
        storage.delete(&key).unwrap();
        assert!(storage.is_empty());
    }
}
