//! World registry: every requested world and where it is in its lifecycle.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::pool::Promise;
use crate::world::{Fidelity, WorldId, WorldRunner};

pub(crate) enum WorldEntry {
    /// Being created on the worker pool
    Loading(Promise<Option<WorldRunner>>),
    Live(WorldRunner),
    /// Creation failed or the world errored
    Broken { since: Instant },
    /// Being stopped and saved on the worker pool
    Unloading(Promise<()>),
}

/// Result of acquiring a world.
#[derive(Debug, Clone)]
pub enum WorldStatus {
    Loading,
    Live(WorldRunner),
    Broken,
}

impl WorldStatus {
    pub fn runner(&self) -> Option<&WorldRunner> {
        match self {
            WorldStatus::Live(runner) => Some(runner),
            _ => None,
        }
    }
}

/// Inspection view of a registry entry.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldState {
    Loading { ready: bool },
    Live { clients: usize, fidelity: Fidelity },
    Broken,
    Unloading,
}

#[derive(Default)]
pub(crate) struct WorldRegistry {
    entries: HashMap<WorldId, WorldEntry>,
}

impl WorldRegistry {
    pub fn get(&self, id: &WorldId) -> Option<&WorldEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &WorldId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: WorldId, entry: WorldEntry) {
        self.entries.insert(id, entry);
    }

    pub fn ids(&self) -> Vec<WorldId> {
        self.entries.keys().cloned().collect()
    }

    pub fn runner(&self, id: &WorldId) -> Option<WorldRunner> {
        match self.entries.get(id) {
            Some(WorldEntry::Live(runner)) => Some(runner.clone()),
            _ => None,
        }
    }

    pub fn live(&self) -> Vec<(WorldId, WorldRunner)> {
        self.entries
            .iter()
            .filter_map(|(id, entry)| match entry {
                WorldEntry::Live(runner) => Some((id.clone(), runner.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn state(&self, id: &WorldId) -> Option<WorldState> {
        self.entries.get(id).map(|entry| match entry {
            WorldEntry::Loading(promise) => WorldState::Loading { ready: promise.poll() },
            WorldEntry::Live(runner) => WorldState::Live {
                clients: runner.client_count(),
                fidelity: runner.fidelity(),
            },
            WorldEntry::Broken { .. } => WorldState::Broken,
            WorldEntry::Unloading(_) => WorldState::Unloading,
        })
    }

    /// Turns a finished `Loading` entry into `Live` or `Broken`.
    ///
    /// Returns the new status, or `None` when the entry is not a finished load.
    pub fn resolve(&mut self, id: &WorldId) -> Option<WorldStatus> {
        let entry = self.entries.get_mut(id)?;
        if !matches!(entry, WorldEntry::Loading(promise) if promise.poll()) {
            return None;
        }
        let since = Instant::now();
        let WorldEntry::Loading(promise) = std::mem::replace(entry, WorldEntry::Broken { since }) else {
            return None;
        };
        match promise.get() {
            Ok(Some(runner)) => {
                info!("🌍 World {} is live", id);
                *entry = WorldEntry::Live(runner.clone());
                Some(WorldStatus::Live(runner))
            }
            Ok(None) => {
                warn!("⚠️ World {} does not exist", id);
                Some(WorldStatus::Broken)
            }
            Err(e) => {
                error!("❌ World {} failed to load: {}", id, e);
                Some(WorldStatus::Broken)
            }
        }
    }

    /// Resolves every finished load.
    pub fn resolve_ready(&mut self) {
        let ready: Vec<WorldId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, WorldEntry::Loading(promise) if promise.poll()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in ready {
            self.resolve(&id);
        }
    }

    /// Removes finished unloads.
    pub fn finish_unloads(&mut self) -> Vec<WorldId> {
        let done: Vec<WorldId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, WorldEntry::Unloading(promise) if promise.poll()))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &done {
            if let Some(WorldEntry::Unloading(promise)) = self.entries.remove(id) {
                match promise.get() {
                    Ok(()) => info!("💤 World {} unloaded", id),
                    Err(e) => error!("❌ World {} failed to unload cleanly: {}", id, e),
                }
            }
        }
        done
    }

    /// Forgets broken entries older than `retention` so later requests retry.
    pub fn sweep_broken(&mut self, retention: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry {
            WorldEntry::Broken { since } => since.elapsed() < retention,
            _ => true,
        });
        before - self.entries.len()
    }

    /// Removes every entry, for shutdown.
    pub fn drain(&mut self) -> Vec<(WorldId, WorldEntry)> {
        self.entries.drain().collect()
    }
}
