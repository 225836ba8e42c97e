//! World identifiers, spawn targets and warp actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Position of a star system, planet or moon in the universe.
///
/// A coordinate with `planet == 0` names a whole system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CelestialCoordinate {
    pub location: [i32; 3],
    pub planet: u32,
    pub satellite: u32,
}

impl CelestialCoordinate {
    pub fn system(location: [i32; 3]) -> Self {
        Self {
            location,
            planet: 0,
            satellite: 0,
        }
    }

    pub fn body(location: [i32; 3], planet: u32, satellite: u32) -> Self {
        Self {
            location,
            planet,
            satellite,
        }
    }

    pub fn is_system(&self) -> bool {
        self.planet == 0
    }

    /// The system containing this coordinate.
    pub fn system_coordinate(&self) -> Self {
        Self::system(self.location)
    }
}

impl fmt::Display for CelestialCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.location;
        write!(f, "{}:{}:{}:{}:{}", x, y, z, self.planet, self.satellite)
    }
}

/// Identity of an instanced world.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceWorldId {
    pub name: String,
    pub owner: Option<Uuid>,
    pub level: Option<u32>,
}

impl InstanceWorldId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            level: None,
        }
    }
}

/// Discriminated identifier of a simulated world.
///
/// The textual form produced by `Display` parses back through `FromStr` and
/// is used for storage keys, logs and the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum WorldId {
    Celestial(CelestialCoordinate),
    ClientShip(Uuid),
    Instance(InstanceWorldId),
}

impl WorldId {
    pub fn is_instance(&self) -> bool {
        matches!(self, WorldId::Instance(_))
    }
}

impl fmt::Display for WorldId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldId::Celestial(coordinate) => write!(f, "CelestialWorld:{}", coordinate),
            WorldId::ClientShip(owner) => write!(f, "ClientShipWorld:{}", owner),
            WorldId::Instance(instance) => {
                write!(f, "InstanceWorld:{}:", instance.name)?;
                match instance.owner {
                    Some(owner) => write!(f, "{}:", owner)?,
                    None => write!(f, "-:")?,
                }
                match instance.level {
                    Some(level) => write!(f, "{}", level),
                    None => write!(f, "-"),
                }
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid world id '{0}'")]
pub struct WorldIdParseError(pub String);

impl FromStr for WorldId {
    type Err = WorldIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || WorldIdParseError(s.to_string());
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;

        match kind {
            "CelestialWorld" => {
                let parts: Vec<&str> = rest.split(':').collect();
                if parts.len() != 5 {
                    return Err(invalid());
                }
                let mut location = [0i32; 3];
                for (slot, part) in location.iter_mut().zip(&parts[..3]) {
                    *slot = part.parse().map_err(|_| invalid())?;
                }
                Ok(WorldId::Celestial(CelestialCoordinate {
                    location,
                    planet: parts[3].parse().map_err(|_| invalid())?,
                    satellite: parts[4].parse().map_err(|_| invalid())?,
                }))
            }
            "ClientShipWorld" => Ok(WorldId::ClientShip(
                Uuid::parse_str(rest).map_err(|_| invalid())?,
            )),
            "InstanceWorld" => {
                // The name may itself contain ':', so split from the right.
                let mut parts = rest.rsplitn(3, ':');
                let level = parts.next().ok_or_else(invalid)?;
                let owner = parts.next().ok_or_else(invalid)?;
                let name = parts.next().ok_or_else(invalid)?;
                if name.is_empty() {
                    return Err(invalid());
                }
                let owner = match owner {
                    "-" => None,
                    uuid => Some(Uuid::parse_str(uuid).map_err(|_| invalid())?),
                };
                let level = match level {
                    "-" => None,
                    level => Some(level.parse().map_err(|_| invalid())?),
                };
                Ok(WorldId::Instance(InstanceWorldId {
                    name: name.to_string(),
                    owner,
                    level,
                }))
            }
            _ => Err(invalid()),
        }
    }
}

impl From<WorldId> for String {
    fn from(id: WorldId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for WorldId {
    type Error = WorldIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Where inside a world a client appears.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum SpawnTarget {
    #[default]
    Default,
    UniqueEntity(String),
    Position([f32; 2]),
    X(f32),
}

/// A concrete warp destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarpToWorld {
    pub world: WorldId,
    pub target: SpawnTarget,
}

impl WarpToWorld {
    pub fn new(world: WorldId) -> Self {
        Self {
            world,
            target: SpawnTarget::Default,
        }
    }
}

/// Destinations resolved from the client's own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarpAlias {
    Return,
    OrbitedWorld,
    OwnShip,
}

/// A client-requested relocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum WarpAction {
    ToWorld(WarpToWorld),
    ToPlayer(Uuid),
    Alias(WarpAlias),
}

impl WarpAction {
    pub fn own_ship() -> Self {
        WarpAction::Alias(WarpAlias::OwnShip)
    }
}

/// Position of a ship inside a star system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum SystemLocation {
    Space([f32; 2]),
    Orbit(CelestialCoordinate),
    Object(Uuid),
}

impl SystemLocation {
    /// The celestial body this location orbits, if any.
    pub fn orbited_world(&self) -> Option<CelestialCoordinate> {
        match self {
            SystemLocation::Orbit(coordinate) if !coordinate.is_system() => Some(*coordinate),
            _ => None,
        }
    }
}

impl Default for SystemLocation {
    fn default() -> Self {
        SystemLocation::Space([0.0, 0.0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_id_text_form() {
        let owner = Uuid::new_v4();
        let ids = vec![
            WorldId::Celestial(CelestialCoordinate::body([-4, 12, 900], 3, 1)),
            WorldId::ClientShip(owner),
            WorldId::Instance(InstanceWorldId {
                name: "outpost:annex".into(),
                owner: Some(owner),
                level: Some(4),
            }),
            WorldId::Instance(InstanceWorldId::new("arena")),
        ];

        for id in ids {
            let text = id.to_string();
            assert_eq!(text.parse::<WorldId>().unwrap(), id, "{}", text);
        }

        assert_eq!(
            WorldId::Instance(InstanceWorldId::new("arena")).to_string(),
            "InstanceWorld:arena:-:-"
        );
    }

    #[test]
    fn test_world_id_rejects_garbage() {
        assert!("".parse::<WorldId>().is_err());
        assert!("CelestialWorld:1:2".parse::<WorldId>().is_err());
        assert!("ClientShipWorld:not-a-uuid".parse::<WorldId>().is_err());
        assert!("InstanceWorld::-:-".parse::<WorldId>().is_err());
        assert!("MoonBase:1".parse::<WorldId>().is_err());
    }

    #[test]
    fn test_world_id_serializes_as_string() {
        let id = WorldId::Celestial(CelestialCoordinate::body([1, 2, 3], 4, 0));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"CelestialWorld:1:2:3:4:0\"");
        assert_eq!(serde_json::from_str::<WorldId>(&json).unwrap(), id);
    }

    #[test]
    fn test_orbited_world() {
        let planet = CelestialCoordinate::body([1, 1, 1], 2, 0);
        assert_eq!(SystemLocation::Orbit(planet).orbited_world(), Some(planet));
        assert_eq!(
            SystemLocation::Orbit(planet.system_coordinate()).orbited_world(),
            None
        );
        assert_eq!(SystemLocation::Space([3.0, 4.0]).orbited_world(), None);
    }
}
