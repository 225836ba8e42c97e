//! Collaborator traits for simulation content.
//!
//! The server never interprets world or system contents. It drives them
//! through these traits, which the embedding application implements (see
//! [`crate::sandbox`] for the bundled implementations).

use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::fidelity::Fidelity;
use super::id::{CelestialCoordinate, SpawnTarget, SystemLocation, WorldId};
use crate::net::{ConnectionId, Packet};

/// Everything a world needs to know about a joining client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientJoin {
    pub connection: ConnectionId,
    pub uuid: Uuid,
    pub name: String,
    pub species: String,
    pub admin: bool,
    pub team: u32,
    pub spawn: SpawnTarget,
    pub deploy: bool,
}

/// Flight phase of the ship a client ship world belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipFlightPhase {
    Flying,
    Arrived,
}

/// One simulated world. Called only from its runner, under the runner's lock.
pub trait WorldSimulation: Send {
    fn add_client(&mut self, join: &ClientJoin) -> anyhow::Result<()>;

    /// Removes a client, returning the last packets addressed to it.
    fn remove_client(&mut self, client: ConnectionId) -> Vec<Packet>;

    fn handle_incoming(&mut self, client: ConnectionId, packets: Vec<Packet>) -> anyhow::Result<()>;

    /// Advances the world by `dt` simulated seconds.
    fn update(&mut self, dt: f64, fidelity: Fidelity) -> anyhow::Result<()>;

    fn take_outgoing(&mut self, client: ConnectionId) -> Vec<Packet>;

    fn spawn_target_valid(&self, target: &SpawnTarget) -> bool;

    /// Full state export used for persistence.
    fn snapshot(&self) -> anyhow::Result<Vec<u8>>;

    fn ship_flight(&mut self, _phase: ShipFlightPhase) {}
}

/// How long a world's stored data outlives the loaded world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Saved on unload and kept forever
    Persistent,
    /// Saved on unload and deleted once the time-to-live after unload expires
    Temporary { ttl: Duration },
    /// Never saved
    Transient,
}

pub struct CreatedWorld {
    pub simulation: Box<dyn WorldSimulation>,
    pub persistence: Persistence,
}

/// Builds worlds on worker pool threads.
pub trait WorldFactory: Send + Sync {
    /// Creates the world `id`.
    ///
    /// `stored` holds the last saved snapshot, or for a client ship that was
    /// never saved, the snapshot the client sent at connect time. `Ok(None)`
    /// means the world does not exist.
    fn create_world(&self, id: &WorldId, stored: Option<Vec<u8>>) -> anyhow::Result<Option<CreatedWorld>>;
}

/// Ship movement inside one star system. Driven from the control loop.
pub trait SystemSimulation: Send {
    fn add_ship(&mut self, ship: Uuid, location: SystemLocation);

    fn remove_ship(&mut self, ship: Uuid);

    fn fly_ship(&mut self, ship: Uuid, destination: SystemLocation, settings: &Value);

    /// Current location, `None` while the ship is travelling.
    fn ship_location(&self, ship: Uuid) -> Option<SystemLocation>;

    fn update(&mut self, dt: f64);

    fn ship_count(&self) -> usize;
}

pub trait SystemFactory: Send + Sync {
    fn create_system(&self, system: CelestialCoordinate) -> anyhow::Result<Box<dyn SystemSimulation>>;
}
