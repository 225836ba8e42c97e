//! Client sessions as seen by the control loop.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::net::ConnectionId;
use crate::world::{CelestialCoordinate, ClientJoin, SpawnTarget, SystemLocation, WarpToWorld, WorldId};

/// Versioned delta-sync state of a client's context.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextSync {
    pub server_version: u64,
    pub last_sent: Option<Value>,
    pub client_version: u64,
    pub client_data: Value,
}

/// Per-connection state owned by the control loop.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub connection: ConnectionId,
    pub remote: Option<SocketAddr>,
    pub uuid: Uuid,
    pub name: String,
    pub species: String,
    pub admin: bool,
    pub team: u32,
    /// Empty, or a world whose registry entry is live
    pub current_world: Option<WorldId>,
    pub return_warp: Option<WarpToWorld>,
    pub revive_warp: Option<WarpToWorld>,
    pub ship_system: Option<CelestialCoordinate>,
    pub ship_location: SystemLocation,
    pub(crate) context: ContextSync,
}

impl ClientSession {
    pub(crate) fn new(
        connection: ConnectionId,
        remote: Option<SocketAddr>,
        uuid: Uuid,
        name: String,
        species: String,
        admin: bool,
    ) -> Self {
        Self {
            connection,
            remote,
            uuid,
            name,
            species,
            admin,
            team: 0,
            current_world: None,
            return_warp: None,
            revive_warp: None,
            ship_system: None,
            ship_location: SystemLocation::default(),
            context: ContextSync::default(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.remote.is_none()
    }

    pub fn ship_world(&self) -> WorldId {
        WorldId::ClientShip(self.uuid)
    }

    /// True when the client stands on its own ship.
    pub fn aboard_own_ship(&self) -> bool {
        self.current_world.as_ref() == Some(&self.ship_world())
    }

    pub(crate) fn join_request(&self, spawn: SpawnTarget, deploy: bool) -> ClientJoin {
        ClientJoin {
            connection: self.connection,
            uuid: self.uuid,
            name: self.name.clone(),
            species: self.species.clone(),
            admin: self.admin,
            team: self.team,
            spawn,
            deploy,
        }
    }

    /// The server-owned half of the client context.
    pub(crate) fn server_context(&self) -> Value {
        json!({
            "admin": self.admin,
            "team": self.team,
            "current_world": self.current_world,
            "return_warp": self.return_warp,
            "revive_warp": self.revive_warp,
            "ship_system": self.ship_system,
            "ship_location": self.ship_location,
        })
    }

    /// Returns the next context version and payload when the context changed.
    pub(crate) fn context_delta(&mut self) -> Option<(u64, Value)> {
        let current = self.server_context();
        if self.context.last_sent.as_ref() == Some(&current) {
            return None;
        }
        self.context.server_version += 1;
        self.context.last_sent = Some(current.clone());
        Some((self.context.server_version, current))
    }

    /// Accepts a client-sent context blob if its version is newer.
    pub(crate) fn accept_client_context(&mut self, version: u64, data: Value) -> bool {
        if version <= self.context.client_version {
            return false;
        }
        self.context.client_version = version;
        self.context.client_data = data;
        true
    }

    pub(crate) fn record(&self) -> ClientRecord {
        ClientRecord {
            uuid: self.uuid,
            name: self.name.clone(),
            species: self.species.clone(),
            team: self.team,
            return_warp: self.return_warp.clone(),
            revive_warp: self.revive_warp.clone(),
            ship_system: self.ship_system,
            ship_location: self.ship_location.clone(),
            client_version: self.context.client_version,
            client_data: self.context.client_data.clone(),
        }
    }

    pub(crate) fn restore(&mut self, record: ClientRecord) {
        self.team = record.team;
        self.return_warp = record.return_warp;
        self.revive_warp = record.revive_warp;
        self.ship_system = record.ship_system;
        self.ship_location = record.ship_location;
        self.context.client_version = record.client_version;
        self.context.client_data = record.client_data;
    }

    pub fn summary(&self) -> ClientSummary {
        ClientSummary {
            connection: self.connection,
            uuid: self.uuid,
            name: self.name.clone(),
            admin: self.admin,
            remote: self.remote,
            world: self.current_world.clone(),
        }
    }
}

/// Persisted form of a client's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ClientRecord {
    pub uuid: Uuid,
    pub name: String,
    pub species: String,
    #[serde(default)]
    pub team: u32,
    #[serde(default)]
    pub return_warp: Option<WarpToWorld>,
    #[serde(default)]
    pub revive_warp: Option<WarpToWorld>,
    #[serde(default)]
    pub ship_system: Option<CelestialCoordinate>,
    #[serde(default)]
    pub ship_location: SystemLocation,
    #[serde(default)]
    pub client_version: u64,
    #[serde(default)]
    pub client_data: Value,
}

/// Admin view of a connected client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSummary {
    pub connection: ConnectionId,
    pub uuid: Uuid,
    pub name: String,
    pub admin: bool,
    pub remote: Option<SocketAddr>,
    pub world: Option<WorldId>,
}

/// All connected clients, indexed by connection id and uuid.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sessions: BTreeMap<ConnectionId, ClientSession>,
    by_uuid: HashMap<Uuid, ConnectionId>,
}

impl ClientRegistry {
    /// Smallest non-server id that is neither registered nor reported as
    /// still `in_use` by the caller.
    pub fn allocate_id(&self, in_use: impl Fn(ConnectionId) -> bool) -> Option<ConnectionId> {
        (1..=u16::MAX)
            .map(ConnectionId)
            .find(|id| !self.sessions.contains_key(id) && !in_use(*id))
    }

    pub fn insert(&mut self, session: ClientSession) {
        self.by_uuid.insert(session.uuid, session.connection);
        self.sessions.insert(session.connection, session);
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ClientSession> {
        let session = self.sessions.remove(&id)?;
        self.by_uuid.remove(&session.uuid);
        Some(session)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ClientSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ClientSession> {
        self.sessions.get_mut(&id)
    }

    pub fn by_uuid(&self, uuid: Uuid) -> Option<ConnectionId> {
        self.by_uuid.get(&uuid).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<ConnectionId> {
        self.sessions
            .values()
            .find(|session| session.name.eq_ignore_ascii_case(name))
            .map(|session| session.connection)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientSession> {
        self.sessions.values_mut()
    }

    /// Clients currently in `world`.
    pub fn in_world(&self, world: &WorldId) -> Vec<ConnectionId> {
        self.sessions
            .values()
            .filter(|session| session.current_world.as_ref() == Some(world))
            .map(|session| session.connection)
            .collect()
    }
}
