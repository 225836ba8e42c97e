//! Built-in simulation collaborators.
//!
//! These let the server run end-to-end without external game content. A
//! sandbox world is a relay room: every `World` packet a client sends is
//! echoed to everyone in the same world. Sandbox systems move ships with a
//! fixed travel time.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::net::{ConnectionId, Packet};
use crate::world::{
    CelestialCoordinate, ClientJoin, CreatedWorld, Fidelity, Persistence, ShipFlightPhase, SpawnTarget,
    SystemFactory, SystemLocation, SystemSimulation, WorldFactory, WorldId, WorldSimulation,
};

/// `World` packet kinds emitted by sandbox worlds.
pub mod kinds {
    pub const CLIENT_JOINED: u16 = 1;
    pub const CLIENT_LEFT: u16 = 2;
    pub const SHIP_FLIGHT: u16 = 3;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxState {
    ticks: u64,
    #[serde(default)]
    entities: BTreeSet<String>,
}

struct SandboxClient {
    name: String,
    outgoing: VecDeque<Packet>,
}

/// Relay-room world.
pub struct SandboxWorld {
    state: SandboxState,
    clients: HashMap<ConnectionId, SandboxClient>,
    flight: Option<ShipFlightPhase>,
}

impl SandboxWorld {
    fn new(state: SandboxState) -> Self {
        Self {
            state,
            clients: HashMap::new(),
            flight: None,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.state.ticks
    }

    pub fn flight(&self) -> Option<ShipFlightPhase> {
        self.flight
    }

    fn broadcast(&mut self, packet: Packet) {
        for client in self.clients.values_mut() {
            client.outgoing.push_back(packet.clone());
        }
    }
}

impl WorldSimulation for SandboxWorld {
    fn add_client(&mut self, join: &ClientJoin) -> anyhow::Result<()> {
        if !self.spawn_target_valid(&join.spawn) {
            anyhow::bail!("spawn target {:?} does not exist", join.spawn);
        }
        self.broadcast(Packet::World {
            kind: kinds::CLIENT_JOINED,
            payload: json!({ "connection": join.connection, "name": join.name }),
        });
        self.clients.insert(
            join.connection,
            SandboxClient {
                name: join.name.clone(),
                outgoing: VecDeque::new(),
            },
        );
        Ok(())
    }

    fn remove_client(&mut self, client: ConnectionId) -> Vec<Packet> {
        let Some(removed) = self.clients.remove(&client) else {
            return Vec::new();
        };
        self.broadcast(Packet::World {
            kind: kinds::CLIENT_LEFT,
            payload: json!({ "connection": client, "name": removed.name }),
        });
        removed.outgoing.into_iter().collect()
    }

    fn handle_incoming(&mut self, client: ConnectionId, packets: Vec<Packet>) -> anyhow::Result<()> {
        for packet in packets {
            match packet {
                Packet::World { .. } => {
                    trace!("Relaying world packet from {}", client);
                    self.broadcast(packet);
                }
                other => anyhow::bail!("unexpected {} packet in world", other.name()),
            }
        }
        Ok(())
    }

    fn update(&mut self, _dt: f64, _fidelity: Fidelity) -> anyhow::Result<()> {
        self.state.ticks += 1;
        Ok(())
    }

    fn take_outgoing(&mut self, client: ConnectionId) -> Vec<Packet> {
        self.clients
            .get_mut(&client)
            .map(|client| client.outgoing.drain(..).collect())
            .unwrap_or_default()
    }

    fn spawn_target_valid(&self, target: &SpawnTarget) -> bool {
        match target {
            SpawnTarget::UniqueEntity(name) => self.state.entities.contains(name),
            SpawnTarget::Default | SpawnTarget::Position(_) | SpawnTarget::X(_) => true,
        }
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn ship_flight(&mut self, phase: ShipFlightPhase) {
        self.flight = Some(phase);
        let label = match phase {
            ShipFlightPhase::Flying => "flying",
            ShipFlightPhase::Arrived => "arrived",
        };
        self.broadcast(Packet::World {
            kind: kinds::SHIP_FLIGHT,
            payload: json!({ "phase": label }),
        });
    }
}

/// Creates sandbox worlds.
///
/// Whole systems are not worlds. Planets and ships are persistent, instances
/// are temporary with `temp_ttl`.
#[derive(Debug, Clone)]
pub struct SandboxWorldFactory {
    pub unique_entities: Vec<String>,
    pub temp_ttl: Duration,
}

impl Default for SandboxWorldFactory {
    fn default() -> Self {
        Self {
            unique_entities: vec!["spawn".to_string()],
            temp_ttl: Duration::from_secs(600),
        }
    }
}

impl WorldFactory for SandboxWorldFactory {
    fn create_world(&self, id: &WorldId, stored: Option<Vec<u8>>) -> anyhow::Result<Option<CreatedWorld>> {
        let persistence = match id {
            WorldId::Celestial(coordinate) if coordinate.is_system() => return Ok(None),
            WorldId::Celestial(_) | WorldId::ClientShip(_) => Persistence::Persistent,
            WorldId::Instance(_) => Persistence::Temporary { ttl: self.temp_ttl },
        };

        let mut state = match stored {
            Some(bytes) => serde_json::from_slice::<SandboxState>(&bytes)?,
            None => SandboxState::default(),
        };
        state.entities.extend(self.unique_entities.iter().cloned());
        debug!("Sandbox world {} created at tick {}", id, state.ticks);

        Ok(Some(CreatedWorld {
            simulation: Box::new(SandboxWorld::new(state)),
            persistence,
        }))
    }
}

struct SandboxShip {
    location: SystemLocation,
    travel: Option<(SystemLocation, f64)>,
}

/// A star system whose ships arrive after a fixed flight time.
pub struct SandboxSystem {
    coordinate: CelestialCoordinate,
    flight_time: Duration,
    ships: HashMap<Uuid, SandboxShip>,
}

impl SystemSimulation for SandboxSystem {
    fn add_ship(&mut self, ship: Uuid, location: SystemLocation) {
        self.ships.insert(ship, SandboxShip { location, travel: None });
    }

    fn remove_ship(&mut self, ship: Uuid) {
        self.ships.remove(&ship);
    }

    fn fly_ship(&mut self, ship: Uuid, destination: SystemLocation, settings: &Value) {
        let Some(entry) = self.ships.get_mut(&ship) else {
            debug!("Ship {} is not in system {}", ship, self.coordinate);
            return;
        };
        let seconds = settings
            .get("flight_time")
            .and_then(Value::as_f64)
            .unwrap_or(self.flight_time.as_secs_f64());
        if seconds <= 0.0 {
            entry.location = destination;
            entry.travel = None;
        } else {
            entry.travel = Some((destination, seconds));
        }
    }

    fn ship_location(&self, ship: Uuid) -> Option<SystemLocation> {
        self.ships
            .get(&ship)
            .filter(|entry| entry.travel.is_none())
            .map(|entry| entry.location.clone())
    }

    fn update(&mut self, dt: f64) {
        for entry in self.ships.values_mut() {
            if let Some((destination, remaining)) = entry.travel.take() {
                let remaining = remaining - dt;
                if remaining <= 0.0 {
                    entry.location = destination;
                } else {
                    entry.travel = Some((destination, remaining));
                }
            }
        }
    }

    fn ship_count(&self) -> usize {
        self.ships.len()
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSystemFactory {
    pub flight_time: Duration,
}

impl Default for SandboxSystemFactory {
    fn default() -> Self {
        Self {
            flight_time: Duration::from_secs(2),
        }
    }
}

impl SystemFactory for SandboxSystemFactory {
    fn create_system(&self, system: CelestialCoordinate) -> anyhow::Result<Box<dyn SystemSimulation>> {
        Ok(Box::new(SandboxSystem {
            coordinate: system.system_coordinate(),
            flight_time: self.flight_time,
            ships: HashMap::new(),
        }))
    }
}
