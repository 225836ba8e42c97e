//! Ship flight: queued flights, pending flights and arrivals.
//!
//! A flight request is debounced so rapid destination changes collapse into
//! one trip. It starts once the client has no warp, flight or arrival in
//! progress and its ship world is live. Interstellar flights first move the
//! ship into the new system, then fly to the requested location there.

use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::control::LoopState;
use super::registry::WorldStatus;
use super::UniverseShared;
use crate::net::{ConnectionId, Packet};
use crate::world::{CelestialCoordinate, ShipFlightPhase, SystemLocation, WorldId};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueuedFlight {
    pub system: CelestialCoordinate,
    pub location: SystemLocation,
    pub settings: Value,
    pub ready_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingFlight {
    pub system: CelestialCoordinate,
    pub location: SystemLocation,
    pub settings: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingArrival {
    pub system: CelestialCoordinate,
}

impl LoopState {
    /// Queues a flight, keeping the first request's start time.
    pub fn queue_flight(
        &mut self,
        id: ConnectionId,
        system: CelestialCoordinate,
        location: SystemLocation,
        settings: Value,
        debounce: Duration,
    ) {
        let system = system.system_coordinate();
        match self.queued_flights.get_mut(&id) {
            Some(queued) => {
                queued.system = system;
                queued.location = location;
                queued.settings = settings;
            }
            None => {
                self.queued_flights.insert(
                    id,
                    QueuedFlight {
                        system,
                        location,
                        settings,
                        ready_at: Instant::now() + debounce,
                    },
                );
            }
        }
    }

    /// Promotes ready queued flights of clients with nothing else in progress.
    pub fn promote_flights(&mut self, now: Instant) -> Vec<ConnectionId> {
        let ready: Vec<ConnectionId> = self
            .queued_flights
            .iter()
            .filter(|(id, queued)| {
                queued.ready_at <= now
                    && !self.pending_warps.contains_key(id)
                    && !self.pending_flights.contains_key(id)
                    && !self.pending_arrivals.contains_key(id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &ready {
            if let Some(queued) = self.queued_flights.remove(id) {
                self.pending_flights.insert(
                    *id,
                    PendingFlight {
                        system: queued.system,
                        location: queued.location,
                        settings: queued.settings,
                    },
                );
            }
        }
        ready
    }
}

impl UniverseShared {
    pub(crate) fn process_queued_flights(&self, state: &mut LoopState, now: Instant) {
        for id in state.promote_flights(now) {
            debug!("Flight of client {} is ready", id);
        }
    }

    pub(crate) fn process_pending_flights(&self, state: &mut LoopState, now: Instant) {
        let mut pending: Vec<(ConnectionId, PendingFlight)> = state
            .pending_flights
            .iter()
            .map(|(id, flight)| (*id, flight.clone()))
            .collect();
        pending.sort_by_key(|(id, _)| *id);

        for (id, flight) in pending {
            let client = self
                .clients
                .read()
                .get(id)
                .map(|client| {
                    let system = client.ship_system.map(|system| system.system_coordinate());
                    (client.uuid, client.ship_world(), system)
                });
            let Some((uuid, ship_world, current_system)) = client else {
                state.pending_flights.remove(&id);
                continue;
            };

            let ship = match self.acquire_world(&ship_world, false) {
                WorldStatus::Loading => continue,
                WorldStatus::Broken => {
                    warn!("⚠️ Dropping flight of client {}: ship world is broken", id);
                    state.pending_flights.remove(&id);
                    continue;
                }
                WorldStatus::Live(runner) => runner,
            };
            state.pending_flights.remove(&id);

            if let Err(e) = ship.execute_sync(|world| world.ship_flight(ShipFlightPhase::Flying)) {
                warn!("⚠️ Ship {} failed to start flying: {}", ship_world, e);
                continue;
            }

            if current_system == Some(flight.system) {
                let Some(system) = self.system_mut(state, flight.system) else {
                    continue;
                };
                system.fly_ship(uuid, flight.location.clone(), &flight.settings);
                info!("🚀 Client {} flying to {:?} in {}", id, flight.location, flight.system);
            } else {
                if let Some(old) = current_system {
                    if let Some(system) = state.systems.get_mut(&old) {
                        system.remove_ship(uuid);
                    }
                }
                let Some(system) = self.system_mut(state, flight.system) else {
                    continue;
                };
                system.add_ship(uuid, SystemLocation::default());
                self.update_client(id, |client| {
                    client.ship_system = Some(flight.system);
                    client.ship_location = SystemLocation::default();
                });
                info!("🌠 Client {} jumped to system {}", id, flight.system);

                if flight.location != SystemLocation::default() {
                    state.queued_flights.insert(
                        id,
                        QueuedFlight {
                            system: flight.system,
                            location: flight.location,
                            settings: flight.settings,
                            ready_at: now,
                        },
                    );
                }
            }
            state
                .pending_arrivals
                .insert(id, PendingArrival { system: flight.system });
        }
    }

    pub(crate) fn update_systems(&self, state: &mut LoopState, elapsed: Duration) {
        let clock = &self.ctx.clock;
        let dt = if clock.is_paused() {
            0.0
        } else {
            elapsed.as_secs_f64() * clock.timescale()
        };
        for system in state.systems.values_mut() {
            system.update(dt);
        }
        state.systems.retain(|coordinate, system| {
            let keep = system.ship_count() > 0;
            if !keep {
                debug!("System {} is empty", coordinate);
            }
            keep
        });
    }

    pub(crate) fn process_arrivals(&self, state: &mut LoopState) {
        let mut pending: Vec<(ConnectionId, PendingArrival)> = state
            .pending_arrivals
            .iter()
            .map(|(id, arrival)| (*id, arrival.clone()))
            .collect();
        pending.sort_by_key(|(id, _)| *id);

        for (id, arrival) in pending {
            let Some((uuid, ship_world)) = self
                .clients
                .read()
                .get(id)
                .map(|client| (client.uuid, client.ship_world()))
            else {
                state.pending_arrivals.remove(&id);
                continue;
            };
            let Some(system) = state.systems.get(&arrival.system) else {
                state.pending_arrivals.remove(&id);
                continue;
            };
            let Some(location) = system.ship_location(uuid) else {
                continue;
            };

            if let Some(body) = location.orbited_world() {
                if let WorldStatus::Loading = self.acquire_world(&WorldId::Celestial(body), false) {
                    continue;
                }
            }
            state.pending_arrivals.remove(&id);
            self.complete_arrival(id, arrival.system, location, &ship_world);
        }
    }

    fn complete_arrival(&self, id: ConnectionId, system: CelestialCoordinate, location: SystemLocation, ship_world: &WorldId) {
        self.update_client(id, |client| client.ship_location = location.clone());
        let runner = self.worlds.read().runner(ship_world);
        if let Some(runner) = runner {
            if let Err(e) = runner.execute_sync(|world| world.ship_flight(ShipFlightPhase::Arrived)) {
                warn!("⚠️ Ship {} failed to arrive: {}", ship_world, e);
            }
        }
        info!("🛬 Ship {} arrived at {:?}", ship_world, location);
        self.send_each(
            &self.clients_aboard(ship_world),
            Packet::ShipArrived { system, location },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::universe::temp_worlds::TempWorldIndex;
    use crate::world::WarpAction;

    fn system() -> CelestialCoordinate {
        CelestialCoordinate::system([1, 2, 3])
    }

    #[test]
    fn test_debounce_collapses_destinations() {
        let mut state = LoopState::new(TempWorldIndex::default());
        let id = ConnectionId(1);
        let debounce = Duration::from_millis(500);

        state.queue_flight(id, system(), SystemLocation::Space([1.0, 0.0]), Value::Null, debounce);
        let ready_at = state.queued_flights[&id].ready_at;
        state.queue_flight(id, system(), SystemLocation::Space([2.0, 0.0]), Value::Null, debounce);
        assert_eq!(state.queued_flights[&id].ready_at, ready_at);

        assert!(state.promote_flights(Instant::now()).is_empty());
        assert_eq!(state.promote_flights(ready_at), vec![id]);
        assert_eq!(state.pending_flights[&id].location, SystemLocation::Space([2.0, 0.0]));
        assert!(state.queued_flights.is_empty());
    }

    #[test]
    fn test_flight_waits_for_other_transitions() {
        let mut state = LoopState::new(TempWorldIndex::default());
        let id = ConnectionId(3);
        state.queue_flight(id, system(), SystemLocation::default(), Value::Null, Duration::ZERO);
        state.queue_warp(id, WarpAction::own_ship(), false);

        let later = Instant::now() + Duration::from_secs(1);
        assert!(state.promote_flights(later).is_empty());

        state.pending_warps.clear();
        state.pending_arrivals.insert(id, PendingArrival { system: system() });
        assert!(state.promote_flights(later).is_empty());

        state.pending_arrivals.clear();
        assert_eq!(state.promote_flights(later), vec![id]);
    }

    #[test]
    fn test_queue_flight_normalizes_system() {
        let mut state = LoopState::new(TempWorldIndex::default());
        let planet = CelestialCoordinate::body([1, 2, 3], 4, 0);
        state.queue_flight(ConnectionId(1), planet, SystemLocation::Orbit(planet), Value::Null, Duration::ZERO);
        assert_eq!(state.queued_flights[&ConnectionId(1)].system, system());
    }
}
