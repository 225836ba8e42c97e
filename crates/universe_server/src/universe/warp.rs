//! Warp resolution and the pending-warp state machine.
//!
//! A pending warp is retried every tick until its world is ready. When the
//! destination cannot be used the warp falls back, within the same tick, to
//! the client's return warp and then to its own ship. A client whose own ship
//! cannot be reached is disconnected.

use tracing::{debug, info, warn};

use super::clients::{ClientRegistry, ClientSession};
use super::control::LoopState;
use super::registry::WorldStatus;
use super::UniverseShared;
use crate::net::{ConnectionId, Packet};
use crate::world::{WarpAction, WarpAlias, WarpToWorld, WorldId, WorldRunner};

pub(crate) const OWN_SHIP_FAILED: &str = "Own ship world failed to load";
const WORLD_FAILED: &str = "world failed to load";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingWarp {
    pub action: WarpAction,
    pub deploy: bool,
}

/// Resolves a warp action against the client's state. Pure.
///
/// # Arguments
///
/// * `action` - The requested warp
/// * `client` - The warping client
/// * `clients` - Registry used to find other players
///
/// # Returns
///
/// The concrete destination, or `None` when the action names nothing
/// reachable (no return warp, unknown player, ship not in orbit).
pub fn resolve_warp(action: &WarpAction, client: &ClientSession, clients: &ClientRegistry) -> Option<WarpToWorld> {
    match action {
        WarpAction::ToWorld(target) => Some(target.clone()),
        WarpAction::ToPlayer(uuid) => {
            let other = clients.get(clients.by_uuid(*uuid)?)?;
            other.current_world.clone().map(WarpToWorld::new)
        }
        WarpAction::Alias(WarpAlias::Return) => client.return_warp.clone(),
        WarpAction::Alias(WarpAlias::OrbitedWorld) => {
            client.ship_system?;
            client
                .ship_location
                .orbited_world()
                .map(|body| WarpToWorld::new(WorldId::Celestial(body)))
        }
        WarpAction::Alias(WarpAlias::OwnShip) => Some(WarpToWorld::new(client.ship_world())),
    }
}

enum WarpStep {
    /// Waiting for a world; keeps the action currently being tried
    Parked(WarpAction),
    Done,
    /// Own ship unreachable
    Disconnect,
    ClientGone,
}

impl UniverseShared {
    pub(crate) fn process_pending_warps(&self, state: &mut LoopState) {
        let mut pending: Vec<(ConnectionId, PendingWarp)> =
            state.pending_warps.iter().map(|(id, warp)| (*id, warp.clone())).collect();
        pending.sort_by_key(|(id, _)| *id);

        for (id, warp) in pending {
            match self.step_warp(id, &warp) {
                WarpStep::Parked(action) => {
                    if let Some(entry) = state.pending_warps.get_mut(&id) {
                        entry.action = action;
                    }
                }
                WarpStep::Done | WarpStep::ClientGone => {
                    state.pending_warps.remove(&id);
                }
                WarpStep::Disconnect => {
                    state.pending_warps.remove(&id);
                    self.disconnect_client(state, id, OWN_SHIP_FAILED);
                }
            }
        }
    }

    fn step_warp(&self, id: ConnectionId, warp: &PendingWarp) -> WarpStep {
        let mut action = warp.action.clone();
        let mut reported_failure = false;

        loop {
            let destination = {
                let clients = self.clients.read();
                let Some(client) = clients.get(id) else {
                    return WarpStep::ClientGone;
                };
                resolve_warp(&action, client, &clients)
            };

            let failure = match destination {
                None => "invalid warp target".to_string(),
                Some(destination) => match self.acquire_world(&destination.world, false) {
                    WorldStatus::Loading => return WarpStep::Parked(action),
                    WorldStatus::Broken => WORLD_FAILED.to_string(),
                    WorldStatus::Live(runner) if runner.has_errored() => WORLD_FAILED.to_string(),
                    WorldStatus::Live(runner) if !runner.spawn_target_valid(&destination.target) => {
                        format!("invalid spawn target in {}", destination.world)
                    }
                    WorldStatus::Live(runner) => match self.perform_warp(id, &runner, destination, warp.deploy) {
                        Ok(()) => {
                            self.hub.send_packets(
                                id,
                                vec![Packet::PlayerWarpResult {
                                    success: true,
                                    action,
                                    reason: None,
                                }],
                            );
                            return WarpStep::Done;
                        }
                        Err(e) => format!("{e:#}"),
                    },
                },
            };

            warn!("⚠️ Warp of client {} via {:?} failed: {}", id, action, failure);
            if !reported_failure {
                reported_failure = true;
                self.hub.send_packets(
                    id,
                    vec![Packet::PlayerWarpResult {
                        success: false,
                        action: action.clone(),
                        reason: Some(failure),
                    }],
                );
            }

            action = match action {
                WarpAction::Alias(WarpAlias::OwnShip) => return WarpStep::Disconnect,
                WarpAction::Alias(WarpAlias::Return) => WarpAction::own_ship(),
                _ => {
                    let has_return = self
                        .clients
                        .read()
                        .get(id)
                        .is_some_and(|client| client.return_warp.is_some());
                    if has_return {
                        WarpAction::Alias(WarpAlias::Return)
                    } else {
                        WarpAction::own_ship()
                    }
                }
            };
            debug!("Client {} falls back to {:?}", id, action);
        }
    }

    /// Moves a client out of its current world and into `runner`.
    fn perform_warp(
        &self,
        id: ConnectionId,
        runner: &WorldRunner,
        destination: WarpToWorld,
        deploy: bool,
    ) -> anyhow::Result<()> {
        let (join, previous, name) = {
            let clients = self.clients.read();
            let client = clients
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("client {id} is gone"))?;
            (
                client.join_request(destination.target.clone(), deploy),
                client.current_world.clone(),
                client.name.clone(),
            )
        };

        if let Some(previous) = &previous {
            let old = self.worlds.read().runner(previous);
            let mut farewell = old.map(|old| old.remove_client(id)).unwrap_or_default();
            farewell.push(Packet::WorldStop { reason: "warp".into() });
            self.hub.send_packets(id, farewell);
            self.update_client(id, |client| client.current_world = None);
        }

        runner.add_client(join)?;

        let entering_instance = destination.world.is_instance() && !previous.as_ref().is_some_and(WorldId::is_instance);
        self.update_client(id, |client| {
            if entering_instance {
                if let Some(previous) = previous {
                    client.return_warp = Some(WarpToWorld::new(previous));
                }
            }
            client.current_world = Some(destination.world.clone());
        });
        info!("🚪 {} (client {}) warped to {}", name, id, destination.world);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::{CelestialCoordinate, InstanceWorldId, SpawnTarget, SystemLocation};
    use uuid::Uuid;

    fn client(id: u16) -> ClientSession {
        ClientSession::new(ConnectionId(id), None, Uuid::new_v4(), format!("c{id}"), "human".into(), false)
    }

    #[test]
    fn test_aliases_resolve_from_client_state() {
        let mut registry = ClientRegistry::default();
        let mut me = client(1);
        let ship = WorldId::ClientShip(me.uuid);

        assert_eq!(
            resolve_warp(&WarpAction::own_ship(), &me, &registry),
            Some(WarpToWorld::new(ship.clone()))
        );
        assert_eq!(resolve_warp(&WarpAction::Alias(WarpAlias::Return), &me, &registry), None);
        assert_eq!(resolve_warp(&WarpAction::Alias(WarpAlias::OrbitedWorld), &me, &registry), None);

        let planet = CelestialCoordinate::body([5, 5, 5], 2, 0);
        me.ship_system = Some(planet.system_coordinate());
        me.ship_location = SystemLocation::Orbit(planet);
        me.return_warp = Some(WarpToWorld::new(ship.clone()));
        assert_eq!(
            resolve_warp(&WarpAction::Alias(WarpAlias::OrbitedWorld), &me, &registry),
            Some(WarpToWorld::new(WorldId::Celestial(planet)))
        );
        assert_eq!(
            resolve_warp(&WarpAction::Alias(WarpAlias::Return), &me, &registry),
            Some(WarpToWorld::new(ship))
        );

        let mut friend = client(2);
        let dungeon = WorldId::Instance(InstanceWorldId::new("dungeon"));
        friend.current_world = Some(dungeon.clone());
        let friend_uuid = friend.uuid;
        registry.insert(friend);
        assert_eq!(
            resolve_warp(&WarpAction::ToPlayer(friend_uuid), &me, &registry),
            Some(WarpToWorld::new(dungeon))
        );
        assert_eq!(resolve_warp(&WarpAction::ToPlayer(Uuid::new_v4()), &me, &registry), None);
    }

    #[test]
    fn test_explicit_target_is_kept() {
        let registry = ClientRegistry::default();
        let me = client(1);
        let target = WarpToWorld {
            world: WorldId::Instance(InstanceWorldId::new("arena")),
            target: SpawnTarget::UniqueEntity("gate".into()),
        };
        assert_eq!(
            resolve_warp(&WarpAction::ToWorld(target.clone()), &me, &registry),
            Some(target)
        );
    }
}
