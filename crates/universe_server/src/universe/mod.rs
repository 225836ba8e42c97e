//! The universe server: client registry, world lifecycle and the control loop.
//!
//! One control thread owns all state transitions. Hub workers, handshake
//! threads and world threads talk to it through the event channel and the
//! two registries, which are always locked clients before worlds. Anything
//! slow runs on the worker pool and is polled on later ticks.

pub mod clients;
mod control;
mod flight;
pub mod handshake;
mod listener;
pub mod registry;
mod temp_worlds;
mod warp;

pub use clients::{ClientSession, ClientSummary};
pub use handshake::{client_handshake, pass_hash, ServerWelcome};
pub use listener::ListenerBackoff;
pub use registry::{WorldState, WorldStatus};
pub use warp::resolve_warp;

use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::access::BanScope;
use crate::context::ServerContext;
use crate::error::{panic_message, ServerError};
use crate::net::{ChatMode, ConnectionHub, ConnectionId, LocalChannel, Packet, Session};
use crate::pool::WorkerPool;
use crate::world::{PostUpdateHook, WarpAction, WorldId, WorldRunner};
use clients::ClientRegistry;
use control::LoopState;
use registry::WorldRegistry;
use temp_worlds::TempWorldIndex;

/// Name used for server-originated chat.
pub const SERVER_NAME: &str = "server";

pub(crate) enum ControlEvent {
    /// A handshake registered a new client
    Connected(ConnectionId),
    /// Non-world packets received from a client, in order
    Packets(ConnectionId, Vec<Packet>),
}

pub(crate) struct UniverseShared {
    pub(crate) ctx: Arc<ServerContext>,
    // Lock order: state, clients, worlds.
    pub(crate) state: Mutex<LoopState>,
    pub(crate) clients: RwLock<ClientRegistry>,
    pub(crate) worlds: RwLock<WorldRegistry>,
    pub(crate) hub: ConnectionHub,
    pub(crate) pool: WorkerPool,
    /// Ship snapshots sent at connect time, used until the ship is first saved
    pub(crate) ship_seeds: DashMap<Uuid, Vec<u8>>,
    pub(crate) events_tx: Sender<ControlEvent>,
    events_rx: Receiver<ControlEvent>,
    pub(crate) stop: AtomicBool,
    pub(crate) hook: Option<PostUpdateHook>,
    handshake_counter: AtomicU64,
    /// Address the listener is bound to, once it is
    pub(crate) listen_addr: Mutex<Option<SocketAddr>>,
}

impl UniverseShared {
    /// Hub callback: world packets go straight to the client's world, the
    /// rest to the control loop.
    fn route_incoming(&self, id: ConnectionId, packets: Vec<Packet>) -> anyhow::Result<()> {
        let (world_packets, control): (Vec<Packet>, Vec<Packet>) =
            packets.into_iter().partition(|packet| matches!(packet, Packet::World { .. }));

        if !world_packets.is_empty() {
            let runner = {
                let clients = self.clients.read();
                let world = clients.get(id).and_then(|client| client.current_world.clone());
                world.and_then(|world| self.worlds.read().runner(&world))
            };
            match runner {
                Some(runner) => runner.push_incoming(id, world_packets),
                None => trace!("Dropping {} world packet(s) from {} outside any world", world_packets.len(), id),
            }
        }

        if !control.is_empty() {
            self.events_tx
                .send(ControlEvent::Packets(id, control))
                .map_err(|_| anyhow::anyhow!("control loop is gone"))?;
        }
        Ok(())
    }

    /// Post-update hook body: sends a world's fresh output to its clients.
    pub(crate) fn forward_world_output(&self, runner: &WorldRunner) {
        for client in runner.clients() {
            let packets = runner.pull_outgoing(client);
            if !packets.is_empty() {
                self.hub.send_packets(client, packets);
            }
        }
    }

    pub(crate) fn drain_events(&self) -> Vec<ControlEvent> {
        self.events_rx.try_iter().collect()
    }

    fn spawn_handshake(self: &Arc<Self>, session: Session) -> Result<(), ServerError> {
        let shared = self.clone();
        let number = self.handshake_counter.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("handshake-{number}"))
            .spawn(move || handshake::serve(&shared, session))
            .map(|_| ())
            .map_err(|e| ServerError::Internal(format!("failed to spawn handshake thread: {e}")))
    }
}

/// Handle to a running universe.
pub struct UniverseServer {
    shared: Arc<UniverseShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl UniverseServer {
    /// Builds the server and its hub and worker pool. Nothing is simulated
    /// until [`UniverseServer::start`] or [`UniverseServer::tick`] is called.
    pub fn new(context: ServerContext) -> Result<Self, ServerError> {
        let ctx = Arc::new(context);
        let temp_worlds = TempWorldIndex::load(ctx.storage.as_ref())?;
        let (events_tx, events_rx) = channel::unbounded();

        let shared = Arc::new_cyclic(|weak: &Weak<UniverseShared>| {
            let router = weak.clone();
            let hub = ConnectionHub::new(ctx.config.hub_workers, ctx.config.hub_idle_sleep, move |id, packets| {
                match router.upgrade() {
                    Some(shared) => shared.route_incoming(id, packets),
                    None => Ok(()),
                }
            });

            let hook = ctx.config.world.immediate_forwarding.then(|| {
                let forward = weak.clone();
                Arc::new(move |runner: &WorldRunner| {
                    if let Some(shared) = forward.upgrade() {
                        shared.forward_world_output(runner);
                    }
                }) as PostUpdateHook
            });

            UniverseShared {
                state: Mutex::new(LoopState::new(temp_worlds)),
                clients: RwLock::new(ClientRegistry::default()),
                worlds: RwLock::new(WorldRegistry::default()),
                hub,
                pool: WorkerPool::new("universe-pool", ctx.config.pool_workers),
                ship_seeds: DashMap::new(),
                events_tx,
                events_rx,
                stop: AtomicBool::new(false),
                hook,
                handshake_counter: AtomicU64::new(0),
                listen_addr: Mutex::new(None),
                ctx: ctx.clone(),
            }
        });

        info!("🌌 Universe server {} created", ctx.config.server_uuid);
        Ok(Self {
            shared,
            threads: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &ServerContext {
        &self.shared.ctx
    }

    /// Starts the control loop thread and, when enabled, the listener.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(ServerError::Internal("server already started".into()));
        }

        let shared = self.shared.clone();
        let main = thread::Builder::new()
            .name("universe-main".into())
            .spawn(move || main_loop(shared))
            .map_err(|e| ServerError::Internal(format!("failed to spawn control loop: {e}")))?;
        threads.push(main);

        if self.shared.ctx.config.listening_enabled {
            let shared = self.shared.clone();
            let listener = thread::Builder::new()
                .name("universe-listener".into())
                .spawn(move || listener::run_listener(shared))
                .map_err(|e| ServerError::Network(format!("failed to spawn listener: {e}")))?;
            threads.push(listener);
        }

        info!("🚀 Universe server started");
        Ok(())
    }

    /// Runs one control loop pass on the calling thread.
    ///
    /// Meant for embedders that drive the loop themselves; do not mix with
    /// [`UniverseServer::start`].
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Disconnects everyone, saves and stops every world and joins all
    /// threads. Later calls do nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 Stopping universe server");
        self.shared.stop.store(true, Ordering::Release);

        let threads: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("❌ Universe thread panicked");
            }
        }

        self.shared.shutdown();
        info!("✅ Universe server stopped");
    }

    /// The address the listener is bound to, once it is listening.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        *self.shared.listen_addr.lock()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Hands an accepted session to a new handshake thread.
    pub fn accept_session(&self, session: Session) -> Result<(), ServerError> {
        if self.is_stopped() {
            return Err(ServerError::Internal("server is stopped".into()));
        }
        self.shared.spawn_handshake(session)
    }

    /// Connects an in-process client through one end of a local pipe.
    pub fn add_local_client(&self, channel: LocalChannel) -> Result<(), ServerError> {
        self.accept_session(Session::new(channel))
    }

    pub fn kick(&self, id: ConnectionId, reason: &str) -> bool {
        let mut state = self.shared.state.lock();
        self.shared.disconnect_client(&mut state, id, reason)
    }

    /// Bans a connected client's address and/or uuid, then disconnects it.
    pub fn ban(&self, id: ConnectionId, reason: &str, scope: BanScope) -> bool {
        let mut state = self.shared.state.lock();
        let identity = self
            .shared
            .clients
            .read()
            .get(id)
            .map(|client| (client.remote.map(|addr| addr.ip()), client.uuid));
        let Some((ip, uuid)) = identity else {
            return false;
        };
        self.shared.ctx.access.ban(
            ip.filter(|_| scope.covers_ip()),
            Some(uuid).filter(|_| scope.covers_uuid()),
            reason,
        );
        self.shared
            .disconnect_client(&mut state, id, &format!("You are banned: {reason}"))
    }

    pub fn broadcast(&self, text: &str) {
        let ids = self.shared.clients.read().ids();
        for id in ids {
            self.shared.hub.send_packets(id, vec![server_chat(ChatMode::Broadcast, text)]);
        }
    }

    pub fn whisper(&self, id: ConnectionId, text: &str) -> bool {
        if self.shared.clients.read().get(id).is_none() {
            return false;
        }
        self.shared.hub.send_packets(id, vec![server_chat(ChatMode::Whisper, text)])
    }

    /// Queues a warp for a client, replacing any pending one.
    pub fn warp_client(&self, id: ConnectionId, action: WarpAction) -> bool {
        let mut state = self.shared.state.lock();
        if self.shared.clients.read().get(id).is_none() {
            return false;
        }
        state.queue_warp(id, action, false);
        true
    }

    pub fn set_paused(&self, paused: bool) {
        info!("⏸️ Universe {}", if paused { "paused" } else { "resumed" });
        self.shared.ctx.clock.set_paused(paused);
    }

    pub fn set_timescale(&self, timescale: f64) {
        self.shared.ctx.clock.set_timescale(timescale);
        debug!("Timescale set to {}", self.shared.ctx.clock.timescale());
    }

    /// Returns the world, starting its creation when it is not registered.
    /// A broken entry is retried.
    pub fn create_or_get(&self, world: &WorldId) -> WorldStatus {
        self.shared.acquire_world(world, true)
    }

    pub fn client_summaries(&self) -> Vec<ClientSummary> {
        self.shared.clients.read().iter().map(ClientSession::summary).collect()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.read().len()
    }

    pub fn client_world(&self, id: ConnectionId) -> Option<WorldId> {
        self.shared.clients.read().get(id).and_then(|client| client.current_world.clone())
    }

    pub fn world_ids(&self) -> Vec<WorldId> {
        self.shared.worlds.read().ids()
    }

    pub fn world_state(&self, world: &WorldId) -> Option<WorldState> {
        self.shared.worlds.read().state(world)
    }

    pub fn has_pending_warp(&self, id: ConnectionId) -> bool {
        self.shared.state.lock().has_pending_warp(id)
    }
}

impl Drop for UniverseServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn server_chat(mode: ChatMode, text: &str) -> Packet {
    Packet::ChatReceive {
        from: ConnectionId::SERVER,
        from_name: SERVER_NAME.to_string(),
        mode,
        text: text.to_string(),
    }
}

fn main_loop(shared: Arc<UniverseShared>) {
    let interval = shared.ctx.config.main_loop_interval;
    while !shared.stop.load(Ordering::Acquire) {
        let started = Instant::now();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| shared.tick())) {
            error!("❌ Control loop pass panicked: {}", panic_message(payload.as_ref()));
        }
        if let Some(rest) = interval.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
    debug!("Control loop stopped");
}
