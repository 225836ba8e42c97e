//! Deferred deletion of temporary world data.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::error::StorageError;
use crate::storage::{Storage, StorageKey};
use crate::world::WorldId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Expiry {
    unloaded_at_ms: u64,
    ttl_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct IndexEntry {
    world: WorldId,
    unloaded_at_ms: u64,
    ttl_ms: u64,
}

/// Unload time and time-to-live of every unloaded temporary world, in unix
/// milliseconds.
#[derive(Debug, Default)]
pub(crate) struct TempWorldIndex {
    entries: HashMap<WorldId, Expiry>,
}

pub(crate) fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

impl TempWorldIndex {
    /// Loads the stored index. A corrupt index is logged and replaced.
    pub fn load(storage: &dyn Storage) -> Result<Self, StorageError> {
        let Some(bytes) = storage.load(&StorageKey::TempWorldIndex)? else {
            return Ok(Self::default());
        };
        match serde_json::from_slice::<Vec<IndexEntry>>(&bytes) {
            Ok(list) => Ok(Self {
                entries: list
                    .into_iter()
                    .map(|entry| {
                        (
                            entry.world,
                            Expiry {
                                unloaded_at_ms: entry.unloaded_at_ms,
                                ttl_ms: entry.ttl_ms,
                            },
                        )
                    })
                    .collect(),
            }),
            Err(e) => {
                warn!("⚠️ Ignoring corrupt temporary world index: {}", e);
                Ok(Self::default())
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut list: Vec<IndexEntry> = self
            .entries
            .iter()
            .map(|(world, expiry)| IndexEntry {
                world: world.clone(),
                unloaded_at_ms: expiry.unloaded_at_ms,
                ttl_ms: expiry.ttl_ms,
            })
            .collect();
        list.sort_by_key(|entry| entry.world.to_string());
        Ok(serde_json::to_vec_pretty(&list)?)
    }

    pub fn record(&mut self, world: WorldId, unloaded_at_ms: u64, ttl: Duration) {
        self.entries.insert(
            world,
            Expiry {
                unloaded_at_ms,
                ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
            },
        );
    }

    #[cfg(test)]
    pub fn contains(&self, world: &WorldId) -> bool {
        self.entries.contains_key(world)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes and returns expired worlds that nothing references any more.
    pub fn take_expired(&mut self, now_ms: u64, referenced: impl Fn(&WorldId) -> bool) -> Vec<WorldId> {
        let expired: Vec<WorldId> = self
            .entries
            .iter()
            .filter(|(world, expiry)| {
                now_ms >= expiry.unloaded_at_ms.saturating_add(expiry.ttl_ms) && !referenced(world)
            })
            .map(|(world, _)| world.clone())
            .collect();
        for world in &expired {
            self.entries.remove(world);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::world::InstanceWorldId;

    fn world(name: &str) -> WorldId {
        WorldId::Instance(InstanceWorldId::new(name))
    }

    #[test]
    fn test_expiry_respects_references() {
        let mut index = TempWorldIndex::default();
        index.record(world("a"), 100_000, Duration::from_secs(10));
        index.record(world("b"), 100_000, Duration::from_secs(10));
        index.record(world("c"), 100_000, Duration::from_secs(60));

        assert!(index.take_expired(105_000, |_| false).is_empty());

        let expired = index.take_expired(110_000, |id| *id == world("b"));
        assert_eq!(expired, vec![world("a")]);
        assert!(index.contains(&world("b")));

        assert_eq!(index.take_expired(110_000, |_| false), vec![world("b")]);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_sub_second_ttl_is_kept() {
        let mut index = TempWorldIndex::default();
        index.record(world("flash"), 1_000, Duration::from_millis(250));
        assert!(index.take_expired(1_000, |_| false).is_empty());
        assert!(index.take_expired(1_249, |_| false).is_empty());
        assert_eq!(index.take_expired(1_250, |_| false), vec![world("flash")]);
    }

    #[test]
    fn test_persisted_round_trip() {
        let storage = MemoryStorage::new();
        let mut index = TempWorldIndex::default();
        index.record(world("dungeon"), 42_000, Duration::from_secs(300));
        storage
            .save(&StorageKey::TempWorldIndex, &index.to_bytes().unwrap())
            .unwrap();

        let mut loaded = TempWorldIndex::load(&storage).unwrap();
        assert!(loaded.contains(&world("dungeon")));
        assert!(loaded.take_expired(341_999, |_| false).is_empty());
        assert_eq!(loaded.take_expired(342_000, |_| false), vec![world("dungeon")]);

        storage.save(&StorageKey::TempWorldIndex, b"{oops").unwrap();
        assert_eq!(TempWorldIndex::load(&storage).unwrap().len(), 0);
    }
}
