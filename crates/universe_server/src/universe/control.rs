//! Control loop passes.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::flight::{PendingArrival, PendingFlight, QueuedFlight};
use super::registry::{WorldEntry, WorldStatus};
use super::temp_worlds::{unix_now_ms, TempWorldIndex};
use super::warp::PendingWarp;
use super::{server_chat, ControlEvent, UniverseShared};
use crate::context::CommandInvoker;
use crate::net::{ChatMode, ConnectionId, Packet, PacketCategory};
use crate::storage::StorageKey;
use crate::world::{
    CelestialCoordinate, Persistence, RunnerSettings, SystemSimulation, WarpAction, WorldId, WorldRunner,
};

/// State touched only by the control loop (and admin calls holding its lock).
pub(crate) struct LoopState {
    pub pending_warps: HashMap<ConnectionId, PendingWarp>,
    pub queued_flights: HashMap<ConnectionId, QueuedFlight>,
    pub pending_flights: HashMap<ConnectionId, PendingFlight>,
    pub pending_arrivals: HashMap<ConnectionId, PendingArrival>,
    pub systems: HashMap<CelestialCoordinate, Box<dyn SystemSimulation>>,
    pub temp_worlds: TempWorldIndex,
    last_tick: Option<Instant>,
    last_time_broadcast: Instant,
    last_persist: Instant,
    last_temp_sweep: Instant,
}

impl LoopState {
    pub fn new(temp_worlds: TempWorldIndex) -> Self {
        let now = Instant::now();
        Self {
            pending_warps: HashMap::new(),
            queued_flights: HashMap::new(),
            pending_flights: HashMap::new(),
            pending_arrivals: HashMap::new(),
            systems: HashMap::new(),
            temp_worlds,
            last_tick: None,
            last_time_broadcast: now,
            last_persist: now,
            last_temp_sweep: now,
        }
    }

    pub fn queue_warp(&mut self, id: ConnectionId, action: WarpAction, deploy: bool) {
        self.pending_warps.insert(id, PendingWarp { action, deploy });
    }

    pub fn has_pending_warp(&self, id: ConnectionId) -> bool {
        self.pending_warps.contains_key(&id)
    }

    /// Forgets every transition of a client.
    pub fn purge(&mut self, id: ConnectionId) {
        self.pending_warps.remove(&id);
        self.queued_flights.remove(&id);
        self.pending_flights.remove(&id);
        self.pending_arrivals.remove(&id);
    }
}

impl UniverseShared {
    /// One control loop pass.
    pub(crate) fn tick(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = state.last_tick.map(|last| now - last).unwrap_or_default();
        state.last_tick = Some(now);

        self.process_events(&mut state);
        self.sweep_connections(&mut state);
        self.sweep_worlds(&mut state);
        self.worlds.write().resolve_ready();

        self.process_pending_warps(&mut state);
        self.process_queued_flights(&mut state, now);
        self.process_pending_flights(&mut state, now);
        self.update_systems(&mut state, elapsed);
        self.process_arrivals(&mut state);

        self.sync_contexts();
        self.ctx.clock.advance(elapsed);
        self.broadcast_time(&mut state, now);
        self.persist_clients(&mut state, now);

        self.unload_idle_worlds(&mut state);
        self.worlds.write().finish_unloads();
        let swept = self.worlds.write().sweep_broken(self.ctx.config.broken_world_retention);
        if swept > 0 {
            debug!("Forgot {} broken world(s)", swept);
        }
        self.sweep_temp_worlds(&mut state, now);
    }

    /// Returns a world, starting its creation when absent.
    ///
    /// With `retry_broken` a broken entry is replaced by a fresh load.
    pub(crate) fn acquire_world(&self, id: &WorldId, retry_broken: bool) -> WorldStatus {
        {
            let worlds = self.worlds.read();
            match worlds.get(id) {
                Some(WorldEntry::Live(runner)) => return WorldStatus::Live(runner.clone()),
                Some(WorldEntry::Loading(promise)) if !promise.poll() => return WorldStatus::Loading,
                Some(WorldEntry::Unloading(_)) => return WorldStatus::Loading,
                Some(WorldEntry::Broken { .. }) if !retry_broken => return WorldStatus::Broken,
                _ => {}
            }
        }

        let mut worlds = self.worlds.write();
        if let Some(runner) = worlds.runner(id) {
            return WorldStatus::Live(runner);
        }
        if let Some(status) = worlds.resolve(id) {
            return status;
        }
        match worlds.get(id) {
            Some(WorldEntry::Loading(_)) | Some(WorldEntry::Unloading(_)) => return WorldStatus::Loading,
            Some(WorldEntry::Broken { .. }) if !retry_broken => return WorldStatus::Broken,
            _ => {}
        }
        debug!("Creating world {}", id);
        worlds.insert(id.clone(), WorldEntry::Loading(self.load_world(id.clone())));
        WorldStatus::Loading
    }

    fn load_world(&self, id: WorldId) -> crate::pool::Promise<Option<WorldRunner>> {
        let ctx = self.ctx.clone();
        let hook = self.hook.clone();
        let seed = match &id {
            WorldId::ClientShip(owner) => self.ship_seeds.get(owner).map(|seed| seed.clone()),
            _ => None,
        };
        self.pool.submit(move || {
            let stored = ctx.storage.load(&StorageKey::World(id.clone()))?.or(seed);
            let Some(created) = ctx.worlds.create_world(&id, stored)? else {
                return Ok(None);
            };
            let settings = RunnerSettings {
                tick_interval: ctx.config.world.tick_interval(),
                fidelity: ctx.config.world.fidelity.clone(),
            };
            let runner = WorldRunner::spawn(id, created, settings, ctx.clock.clone(), hook)?;
            Ok(Some(runner))
        })
    }

    fn process_events(&self, state: &mut LoopState) {
        for event in self.drain_events() {
            match event {
                ControlEvent::Connected(id) => self.on_connected(state, id),
                ControlEvent::Packets(id, packets) => {
                    for packet in packets {
                        if self.clients.read().get(id).is_none() {
                            break;
                        }
                        self.handle_client_packet(state, id, packet);
                    }
                }
            }
        }
    }

    fn on_connected(&self, state: &mut LoopState, id: ConnectionId) {
        let client = {
            let clients = self.clients.read();
            clients
                .get(id)
                .map(|client| (client.name.clone(), client.uuid, client.ship_system, client.ship_location.clone()))
        };
        let Some((name, uuid, ship_system, ship_location)) = client else {
            return;
        };
        info!("👋 {} connected as client {}", name, id);

        if let Some(system) = ship_system {
            match self.system_mut(state, system) {
                Some(simulation) => simulation.add_ship(uuid, ship_location),
                None => {
                    if let Some(client) = self.clients.write().get_mut(id) {
                        client.ship_system = None;
                    }
                }
            }
        }
        state.queue_warp(id, WarpAction::own_ship(), false);
    }

    /// Returns the system simulation, creating it on first use.
    pub(crate) fn system_mut<'a>(
        &self,
        state: &'a mut LoopState,
        system: CelestialCoordinate,
    ) -> Option<&'a mut Box<dyn SystemSimulation>> {
        let system = system.system_coordinate();
        if !state.systems.contains_key(&system) {
            match self.ctx.systems.create_system(system) {
                Ok(simulation) => {
                    debug!("System {} created", system);
                    state.systems.insert(system, simulation);
                }
                Err(e) => {
                    error!("❌ Failed to create system {}: {:#}", system, e);
                    return None;
                }
            }
        }
        state.systems.get_mut(&system)
    }

    fn handle_client_packet(&self, state: &mut LoopState, id: ConnectionId, packet: Packet) {
        match packet {
            Packet::ChatSend { mode, text } => self.handle_chat(id, mode, text),
            Packet::PlayerWarp { action, deploy } => state.queue_warp(id, action, deploy),
            Packet::FlyShip {
                system,
                location,
                settings,
            } => {
                let aboard = self
                    .clients
                    .read()
                    .get(id)
                    .is_some_and(|client| client.aboard_own_ship());
                if aboard {
                    state.queue_flight(id, system, location, settings, self.ctx.config.flight_debounce);
                } else {
                    debug!("Ignoring flight request from {} outside its own ship", id);
                }
            }
            Packet::ClientContextUpdate { version, data } => {
                if let Some(client) = self.clients.write().get_mut(id) {
                    if !client.accept_client_context(version, data) {
                        debug!("Ignoring stale context update {} from {}", version, id);
                    }
                }
            }
            Packet::ClientDisconnectRequest => {
                self.disconnect_client(state, id, "Client disconnected");
            }
            other => {
                let reason = match other.category() {
                    PacketCategory::Handshake => format!("Protocol error: {} after handshake", other.name()),
                    _ => format!("Protocol error: unexpected {} packet", other.name()),
                };
                warn!("⚠️ Client {}: {}", id, reason);
                self.disconnect_client(state, id, &reason);
            }
        }
    }

    fn handle_chat(&self, id: ConnectionId, mode: ChatMode, text: String) {
        if let Some(command_line) = text.strip_prefix('/') {
            self.handle_command(id, command_line);
            return;
        }

        let clients = self.clients.read();
        let Some(sender) = clients.get(id) else {
            return;
        };
        let (recipients, text): (Vec<ConnectionId>, String) = match mode {
            ChatMode::Broadcast => (clients.ids(), text),
            ChatMode::Local => (
                clients
                    .iter()
                    .filter(|client| client.current_world.is_some() && client.current_world == sender.current_world)
                    .map(|client| client.connection)
                    .collect(),
                text,
            ),
            ChatMode::Party => (
                clients
                    .iter()
                    .filter(|client| (client.team != 0 && client.team == sender.team) || client.connection == id)
                    .map(|client| client.connection)
                    .collect(),
                text,
            ),
            ChatMode::Whisper => {
                let (target, message) = text.split_once(' ').unwrap_or((text.as_str(), ""));
                match clients.by_name(target) {
                    Some(target) => (vec![target, id], message.to_string()),
                    None => {
                        let notice = server_chat(ChatMode::Whisper, &format!("No player named {target}"));
                        self.hub.send_packets(id, vec![notice]);
                        return;
                    }
                }
            }
        };

        let packet = Packet::ChatReceive {
            from: id,
            from_name: sender.name.clone(),
            mode,
            text,
        };
        drop(clients);
        for recipient in recipients {
            self.hub.send_packets(recipient, vec![packet.clone()]);
        }
    }

    fn handle_command(&self, id: ConnectionId, command_line: &str) {
        let Some(invoker) = self.clients.read().get(id).map(|client| CommandInvoker {
            connection: id,
            name: client.name.clone(),
            admin: client.admin,
        }) else {
            return;
        };
        let (command, args) = command_line.split_once(' ').unwrap_or((command_line, ""));

        let reply = match &self.ctx.commands {
            Some(processor) => match processor.process(&invoker, command, args.trim()) {
                Ok(reply) => reply,
                Err(e) => Some(format!("Command /{command} failed: {e:#}")),
            },
            None => Some(format!("Unknown command /{command}")),
        };
        info!("💬 {} ran /{}", invoker.name, command);
        if let Some(reply) = reply {
            self.hub.send_packets(id, vec![server_chat(ChatMode::Whisper, &reply)]);
        }
    }

    fn sweep_connections(&self, state: &mut LoopState) {
        let timeout = self.ctx.config.connection_timeout;
        let candidates: Vec<(ConnectionId, bool)> = self
            .clients
            .read()
            .iter()
            .map(|client| (client.connection, client.is_local()))
            .collect();

        for (id, local) in candidates {
            if !self.hub.connection_is_open(id) {
                self.disconnect_client(state, id, "Connection closed");
                continue;
            }
            let silent = self
                .hub
                .last_activity_time(id)
                .is_some_and(|last| last.elapsed() > timeout);
            if silent && !local {
                self.disconnect_client(state, id, "Connection timed out");
            }
        }
    }

    /// Handles errored worlds and errored clients and forwards world output.
    fn sweep_worlds(&self, state: &mut LoopState) {
        let live = self.worlds.read().live();
        for (world, runner) in live {
            if runner.has_errored() {
                self.evacuate_errored_world(state, &world, &runner);
                continue;
            }

            for errored in runner.errored_clients() {
                let id = errored.connection;
                warn!("⚠️ Client {} was removed from {}: {}", id, world, errored.reason);
                if let Some(client) = self.clients.write().get_mut(id) {
                    if client.current_world.as_ref() == Some(&world) {
                        client.current_world = None;
                    }
                }
                let mut packets = errored.final_packets;
                packets.push(Packet::WorldStop {
                    reason: "client errored".into(),
                });
                self.hub.send_packets(id, packets);
                self.disconnect_client(state, id, &format!("Protocol error: {}", errored.reason));
            }

            if self.hook.is_none() {
                self.forward_world_output(&runner);
            }
        }
    }

    fn evacuate_errored_world(&self, state: &mut LoopState, world: &WorldId, runner: &WorldRunner) {
        error!("💥 World {} errored, moving its clients out", world);
        for id in runner.clients() {
            let mut packets = runner.remove_client(id);
            packets.push(Packet::WorldStop {
                reason: "world errored".into(),
            });
            self.hub.send_packets(id, packets);
            if let Some(client) = self.clients.write().get_mut(id) {
                client.current_world = None;
            }
            state.queue_warp(id, WarpAction::own_ship(), false);
        }
        if let Err(e) = runner.join() {
            error!("❌ {}", e);
        }

        let mut worlds = self.worlds.write();
        if matches!(worlds.get(world), Some(WorldEntry::Live(current)) if current.same_runner(runner)) {
            worlds.insert(world.clone(), WorldEntry::Broken { since: Instant::now() });
        }
    }

    /// Removes a client and everything that refers to it.
    ///
    /// Returns false when the client was already gone.
    pub(crate) fn disconnect_client(&self, state: &mut LoopState, id: ConnectionId, reason: &str) -> bool {
        let Some(client) = self.clients.write().remove(id) else {
            return false;
        };
        state.purge(id);
        info!("👋 {} (client {}) disconnected: {}", client.name, id, reason);

        let mut farewell = Vec::new();
        if let Some(world) = &client.current_world {
            let runner = self.worlds.read().runner(world);
            if let Some(runner) = runner {
                farewell = runner.remove_client(id);
            }
            farewell.push(Packet::WorldStop {
                reason: "disconnected".into(),
            });
        }
        if let Some(system) = client.ship_system {
            if let Some(simulation) = state.systems.get_mut(&system.system_coordinate()) {
                simulation.remove_ship(client.uuid);
            }
        }
        self.ship_seeds.remove(&client.uuid);
        farewell.push(Packet::ServerDisconnect {
            reason: reason.to_string(),
        });

        let session = self.hub.remove_connection(id).ok();
        let record = serde_json::to_vec(&client.record());
        let storage = self.ctx.storage.clone();
        let uuid = client.uuid;
        // Flushing can block up to a second, so it runs on the pool.
        drop(self.pool.submit(move || {
            if let Some(mut session) = session {
                session.queue_send(farewell);
                session.send_all(Duration::from_secs(1));
                session.close();
            }
            storage.save(&StorageKey::Client(uuid), &record?)?;
            Ok(())
        }));
        true
    }

    fn sync_contexts(&self) {
        let mut updates = Vec::new();
        for client in self.clients.write().iter_mut() {
            if let Some((version, data)) = client.context_delta() {
                updates.push((client.connection, Packet::ClientContextUpdate { version, data }));
            }
        }
        for (id, packet) in updates {
            self.hub.send_packets(id, vec![packet]);
        }
    }

    fn broadcast_time(&self, state: &mut LoopState, now: Instant) {
        if now.duration_since(state.last_time_broadcast) < self.ctx.config.time_broadcast_interval {
            return;
        }
        state.last_time_broadcast = now;
        let time = self.ctx.clock.universe_time();
        for id in self.clients.read().ids() {
            self.hub.send_packets(id, vec![Packet::UniverseTimeUpdate { time }]);
        }
    }

    fn persist_clients(&self, state: &mut LoopState, now: Instant) {
        if now.duration_since(state.last_persist) < self.ctx.config.client_persist_interval {
            return;
        }
        state.last_persist = now;
        let records: Vec<_> = self.clients.read().iter().map(|client| client.record()).collect();
        if records.is_empty() {
            return;
        }
        let storage = self.ctx.storage.clone();
        drop(self.pool.submit(move || {
            for record in records {
                storage.save(&StorageKey::Client(record.uuid), &serde_json::to_vec(&record)?)?;
            }
            Ok(())
        }));
    }

    /// Worlds some pending transition is about to need.
    fn referenced_worlds(&self, state: &LoopState) -> Vec<WorldId> {
        let clients = self.clients.read();
        let mut referenced = Vec::new();
        for (id, pending) in &state.pending_warps {
            if let Some(client) = clients.get(*id) {
                if let Some(target) = super::warp::resolve_warp(&pending.action, client, &clients) {
                    referenced.push(target.world);
                }
            }
        }
        for id in state
            .pending_flights
            .keys()
            .chain(state.pending_arrivals.keys())
            .chain(state.queued_flights.keys())
        {
            if let Some(client) = clients.get(*id) {
                referenced.push(client.ship_world());
            }
        }
        referenced
    }

    fn unload_idle_worlds(&self, state: &mut LoopState) {
        let idle_timeout = self.ctx.config.world_idle_timeout;
        let idle: Vec<(WorldId, WorldRunner)> = self
            .worlds
            .read()
            .live()
            .into_iter()
            .filter(|(_, runner)| {
                runner.client_count() == 0
                    && !runner.has_errored()
                    && runner.idle_since().is_some_and(|since| since.elapsed() >= idle_timeout)
            })
            .collect();
        if idle.is_empty() {
            return;
        }

        let referenced = self.referenced_worlds(state);
        let mut index_changed = false;
        for (world, runner) in idle {
            if referenced.contains(&world) {
                continue;
            }
            if let Persistence::Temporary { ttl } = runner.persistence() {
                state.temp_worlds.record(world.clone(), unix_now_ms(), ttl);
                index_changed = true;
            }
            info!("💤 Unloading idle world {}", world);
            let promise = self.unload_world(world.clone(), runner);
            self.worlds.write().insert(world, WorldEntry::Unloading(promise));
        }
        if index_changed {
            self.save_temp_index(state);
        }
    }

    fn unload_world(&self, world: WorldId, runner: WorldRunner) -> crate::pool::Promise<()> {
        let storage = self.ctx.storage.clone();
        self.pool.submit(move || {
            runner.stop();
            runner.join()?;
            if runner.persistence() != Persistence::Transient {
                let snapshot = runner.read_snapshot()?;
                storage.save(&StorageKey::World(world), &snapshot)?;
            }
            Ok(())
        })
    }

    fn save_temp_index(&self, state: &LoopState) {
        match state.temp_worlds.to_bytes() {
            Ok(bytes) => {
                let storage = self.ctx.storage.clone();
                drop(self.pool.submit(move || {
                    storage.save(&StorageKey::TempWorldIndex, &bytes)?;
                    Ok(())
                }));
            }
            Err(e) => error!("❌ Failed to encode temporary world index: {}", e),
        }
    }

    fn sweep_temp_worlds(&self, state: &mut LoopState, now: Instant) {
        if now.duration_since(state.last_temp_sweep) < self.ctx.config.temp_world_sweep_interval {
            return;
        }
        state.last_temp_sweep = now;

        let expired = {
            let clients = self.clients.read();
            let worlds = self.worlds.read();
            state.temp_worlds.take_expired(unix_now_ms(), |world| {
                worlds.contains(world) || clients.iter().any(|client| {
                    client.return_warp.as_ref().is_some_and(|warp| &warp.world == world)
                })
            })
        };
        if expired.is_empty() {
            return;
        }
        for world in &expired {
            info!("🗑️ Deleting expired temporary world {}", world);
            if let Err(e) = self.ctx.storage.delete(&StorageKey::World(world.clone())) {
                error!("❌ Failed to delete {}: {}", world, e);
            }
        }
        self.save_temp_index(state);
    }

    /// Final teardown. Blocks until every world is saved.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        let ids = self.clients.read().ids();
        for id in ids {
            self.disconnect_client(&mut state, id, "Server shutting down");
        }

        let entries = self.worlds.write().drain();
        for (world, entry) in entries {
            let runner = match entry {
                WorldEntry::Loading(promise) => promise.get().ok().flatten(),
                WorldEntry::Live(runner) => Some(runner),
                WorldEntry::Unloading(promise) => {
                    if let Err(e) = promise.get() {
                        error!("❌ World {} failed to unload: {}", world, e);
                    }
                    None
                }
                WorldEntry::Broken { .. } => None,
            };
            let Some(runner) = runner else {
                continue;
            };
            if let Persistence::Temporary { ttl } = runner.persistence() {
                state.temp_worlds.record(world.clone(), unix_now_ms(), ttl);
            }
            if let Err(e) = self.unload_world(world.clone(), runner).get() {
                error!("❌ Failed to save world {} on shutdown: {}", world, e);
            }
        }

        match state.temp_worlds.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.ctx.storage.save(&StorageKey::TempWorldIndex, &bytes) {
                    error!("❌ Failed to save temporary world index: {}", e);
                }
            }
            Err(e) => error!("❌ Failed to encode temporary world index: {}", e),
        }
        state.systems.clear();
        drop(state);

        self.pool.shutdown();
        self.hub.shutdown();
    }

    /// Clients aboard a ship world.
    pub(crate) fn clients_aboard(&self, ship: &WorldId) -> Vec<ConnectionId> {
        self.clients.read().in_world(ship)
    }

    pub(crate) fn update_client(&self, id: ConnectionId, update: impl FnOnce(&mut super::ClientSession)) {
        if let Some(client) = self.clients.write().get_mut(id) {
            update(client);
        }
    }

    /// Sends a packet to every listed client.
    pub(crate) fn send_each(&self, ids: &[ConnectionId], packet: Packet) {
        for id in ids {
            self.hub.send_packets(*id, vec![packet.clone()]);
        }
    }
}
