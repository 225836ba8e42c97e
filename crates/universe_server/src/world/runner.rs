//! Per-world execution thread.
//!
//! A [`WorldRunner`] owns one [`WorldSimulation`] and steps it on a dedicated
//! thread. Each tick it feeds every client's queued packets to the world,
//! steps it (scaled by the universe timescale, skipped while paused), collects
//! the world's output per client and sleeps for the rest of the tick budget.
//!
//! Faults are contained at two levels. A failure while handling one client's
//! packets removes only that client and records it in
//! [`WorldRunner::errored_clients`]. A failure of the step itself sets a
//! sticky error flag and ends the thread, whose join result carries the error.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::fidelity::{Fidelity, FidelityGovernor, FidelitySettings};
use super::id::{SpawnTarget, WorldId};
use super::simulation::{ClientJoin, CreatedWorld, Persistence, WorldSimulation};
use crate::context::UniverseClock;
use crate::error::{panic_message, RunnerError};
use crate::net::{ConnectionId, Packet};

/// Invoked on the world thread after every tick, typically to forward output.
pub type PostUpdateHook = Arc<dyn Fn(&WorldRunner) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub tick_interval: Duration,
    pub fidelity: FidelitySettings,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(16),
            fidelity: FidelitySettings::default(),
        }
    }
}

/// A client removed because handling its packets failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ErroredClient {
    pub connection: ConnectionId,
    pub reason: String,
    pub final_packets: Vec<Packet>,
}

#[derive(Default)]
struct ClientQueues {
    incoming: Vec<Packet>,
    outgoing: Vec<Packet>,
}

struct RunnerQueues {
    clients: HashMap<ConnectionId, ClientQueues>,
    errored: Vec<ErroredClient>,
    idle_since: Option<Instant>,
}

struct RunnerShared {
    id: WorldId,
    persistence: Persistence,
    settings: RunnerSettings,
    clock: Arc<UniverseClock>,
    hook: Option<PostUpdateHook>,
    // Lock order: world before queues.
    world: Mutex<Box<dyn WorldSimulation>>,
    queues: Mutex<RunnerQueues>,
    stop: AtomicBool,
    errored: AtomicBool,
    fidelity: AtomicU8,
    fidelity_lock: Mutex<Option<Fidelity>>,
    steps: AtomicU64,
    /// Failure raised outside the world thread, reported by its join
    fault: Mutex<Option<RunnerError>>,
    thread: Mutex<Option<JoinHandle<Result<(), RunnerError>>>>,
}

/// Cloneable handle to a running world.
#[derive(Clone)]
pub struct WorldRunner {
    shared: Arc<RunnerShared>,
}

impl std::fmt::Debug for WorldRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldRunner")
            .field("id", &self.shared.id)
            .field("errored", &self.has_errored())
            .finish()
    }
}

impl WorldRunner {
    /// Starts the world thread.
    ///
    /// # Arguments
    ///
    /// * `id` - Identity of the world, also used as the thread name
    /// * `world` - The simulation and its persistence class
    /// * `settings` - Tick budget and fidelity hysteresis
    /// * `clock` - Shared pause flag and timescale
    /// * `hook` - Optional post-update hook run on the world thread
    pub fn spawn(
        id: WorldId,
        world: CreatedWorld,
        settings: RunnerSettings,
        clock: Arc<UniverseClock>,
        hook: Option<PostUpdateHook>,
    ) -> Result<WorldRunner, RunnerError> {
        let shared = Arc::new(RunnerShared {
            fidelity: AtomicU8::new(settings.fidelity.initial.to_u8()),
            id: id.clone(),
            persistence: world.persistence,
            settings,
            clock,
            hook,
            world: Mutex::new(world.simulation),
            queues: Mutex::new(RunnerQueues {
                clients: HashMap::new(),
                errored: Vec::new(),
                idle_since: Some(Instant::now()),
            }),
            stop: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            fidelity_lock: Mutex::new(None),
            steps: AtomicU64::new(0),
            fault: Mutex::new(None),
            thread: Mutex::new(None),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("world:{id}"))
            .spawn(move || run_world(thread_shared))?;
        *shared.thread.lock() = Some(handle);

        info!("🌍 World {} started", id);
        Ok(WorldRunner { shared })
    }

    pub fn id(&self) -> &WorldId {
        &self.shared.id
    }

    pub fn persistence(&self) -> Persistence {
        self.shared.persistence
    }

    /// True when both handles refer to the same running world.
    pub fn same_runner(&self, other: &WorldRunner) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Adds a client. Its outgoing queue starts with a `WorldStart` packet.
    pub fn add_client(&self, join: ClientJoin) -> anyhow::Result<()> {
        if self.has_errored() {
            anyhow::bail!("world {} has errored", self.shared.id);
        }
        let mut world = self.shared.world.lock();
        match catch_unwind(AssertUnwindSafe(|| world.add_client(&join))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(payload) => anyhow::bail!("add_client panicked: {}", panic_message(payload.as_ref())),
        }
        let mut queues = self.shared.queues.lock();
        queues.clients.insert(
            join.connection,
            ClientQueues {
                incoming: Vec::new(),
                outgoing: vec![Packet::WorldStart {
                    world: self.shared.id.clone(),
                }],
            },
        );
        queues.idle_since = None;
        debug!("Client {} joined world {}", join.connection, self.shared.id);
        Ok(())
    }

    /// Removes a client and returns every packet still owed to it.
    pub fn remove_client(&self, client: ConnectionId) -> Vec<Packet> {
        let mut world = self.shared.world.lock();
        let last = match catch_unwind(AssertUnwindSafe(|| world.remove_client(client))) {
            Ok(packets) => packets,
            Err(payload) => {
                warn!(
                    "⚠️ World {} panicked removing client {}: {}",
                    self.shared.id,
                    client,
                    panic_message(payload.as_ref())
                );
                Vec::new()
            }
        };
        let mut queues = self.shared.queues.lock();
        let mut packets = queues
            .clients
            .remove(&client)
            .map(|queued| queued.outgoing)
            .unwrap_or_default();
        packets.extend(last);
        if queues.clients.is_empty() && queues.idle_since.is_none() {
            queues.idle_since = Some(Instant::now());
        }
        packets
    }

    /// Queues packets for the world. Packets for unknown clients are dropped.
    pub fn push_incoming(&self, client: ConnectionId, packets: Vec<Packet>) {
        let mut queues = self.shared.queues.lock();
        match queues.clients.get_mut(&client) {
            Some(queued) => queued.incoming.extend(packets),
            None => debug!(
                "Dropping {} packet(s) from {} not in world {}",
                packets.len(),
                client,
                self.shared.id
            ),
        }
    }

    pub fn pull_outgoing(&self, client: ConnectionId) -> Vec<Packet> {
        let mut queues = self.shared.queues.lock();
        queues
            .clients
            .get_mut(&client)
            .map(|queued| std::mem::take(&mut queued.outgoing))
            .unwrap_or_default()
    }

    /// Drains the clients removed since the last call.
    pub fn errored_clients(&self) -> Vec<ErroredClient> {
        std::mem::take(&mut self.shared.queues.lock().errored)
    }

    /// Sticky: once set, the world thread has ended.
    pub fn has_errored(&self) -> bool {
        self.shared.errored.load(Ordering::Acquire)
    }

    pub fn clients(&self) -> Vec<ConnectionId> {
        let mut clients: Vec<ConnectionId> = self.shared.queues.lock().clients.keys().copied().collect();
        clients.sort();
        clients
    }

    pub fn has_client(&self, client: ConnectionId) -> bool {
        self.shared.queues.lock().clients.contains_key(&client)
    }

    pub fn client_count(&self) -> usize {
        self.shared.queues.lock().clients.len()
    }

    /// Since when the world has had no clients.
    pub fn idle_since(&self) -> Option<Instant> {
        self.shared.queues.lock().idle_since
    }

    pub fn spawn_target_valid(&self, target: &SpawnTarget) -> bool {
        let world = self.shared.world.lock();
        catch_unwind(AssertUnwindSafe(|| world.spawn_target_valid(target))).unwrap_or(false)
    }

    /// Runs `f` against the simulation with exclusive access.
    ///
    /// A panic inside `f` marks the world as errored.
    pub fn execute_sync<R>(&self, f: impl FnOnce(&mut dyn WorldSimulation) -> R) -> Result<R, RunnerError> {
        let mut world = self.shared.world.lock();
        catch_unwind(AssertUnwindSafe(|| f(world.as_mut()))).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!("❌ Synchronous call into world {} panicked: {}", self.shared.id, message);
            self.shared.fault.lock().get_or_insert(RunnerError::Panicked {
                world: self.shared.id.clone(),
                message: message.clone(),
            });
            self.shared.errored.store(true, Ordering::Release);
            self.shared.stop.store(true, Ordering::Release);
            RunnerError::Panicked {
                world: self.shared.id.clone(),
                message,
            }
        })
    }

    /// Synchronous full-state export.
    pub fn read_snapshot(&self) -> anyhow::Result<Vec<u8>> {
        let world = self.shared.world.lock();
        match catch_unwind(AssertUnwindSafe(|| world.snapshot())) {
            Ok(result) => result,
            Err(payload) => anyhow::bail!("snapshot panicked: {}", panic_message(payload.as_ref())),
        }
    }

    pub fn fidelity(&self) -> Fidelity {
        Fidelity::from_u8(self.shared.fidelity.load(Ordering::Relaxed))
    }

    /// Pins the fidelity to a level, or returns it to adaptive control.
    pub fn set_fidelity_lock(&self, locked: Option<Fidelity>) {
        *self.shared.fidelity_lock.lock() = locked;
        if let Some(level) = locked {
            self.shared.fidelity.store(level.to_u8(), Ordering::Relaxed);
        }
    }

    /// Number of completed simulation steps.
    pub fn steps(&self) -> u64 {
        self.shared.steps.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .thread
            .lock()
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Waits for the world thread and returns how it ended.
    ///
    /// Only the first call observes the result; later calls return `Ok`.
    pub fn join(&self) -> Result<(), RunnerError> {
        let handle = self.shared.thread.lock().take();
        match handle {
            Some(handle) if handle.thread().id() == thread::current().id() => Ok(()),
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(RunnerError::Join(self.shared.id.clone()))),
            None => Ok(()),
        }
    }
}

fn run_world(shared: Arc<RunnerShared>) -> Result<(), RunnerError> {
    let handle = WorldRunner {
        shared: shared.clone(),
    };
    let budget = shared.settings.tick_interval;
    let mut governor = FidelityGovernor::new(shared.settings.fidelity.clone(), Instant::now());

    while !shared.stop.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        governor.set_locked(*shared.fidelity_lock.lock());

        if let Err(e) = tick(&shared, governor.fidelity()) {
            error!("❌ {}", e);
            shared.errored.store(true, Ordering::Release);
            return Err(e);
        }

        if let Some(hook) = &shared.hook {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(&handle))) {
                warn!(
                    "⚠️ Post-update hook of {} panicked: {}",
                    shared.id,
                    panic_message(payload.as_ref())
                );
            }
        }

        let elapsed = tick_start.elapsed();
        let spare = 1.0 - elapsed.as_secs_f64() / budget.as_secs_f64().max(f64::EPSILON);
        if let Some(level) = governor.observe(Instant::now(), spare) {
            debug!("World {} fidelity now {:?}", shared.id, level);
        }
        shared.fidelity.store(governor.fidelity().to_u8(), Ordering::Relaxed);

        if let Some(remaining) = budget.checked_sub(elapsed) {
            thread::sleep(remaining);
        }
    }

    if let Some(fault) = shared.fault.lock().take() {
        return Err(fault);
    }
    debug!("World {} thread stopped", shared.id);
    Ok(())
}

fn tick(shared: &RunnerShared, fidelity: Fidelity) -> Result<(), RunnerError> {
    let mut world = shared.world.lock();

    let pending: Vec<(ConnectionId, Vec<Packet>)> = {
        let mut queues = shared.queues.lock();
        let mut pending: Vec<_> = queues
            .clients
            .iter_mut()
            .filter(|(_, queued)| !queued.incoming.is_empty())
            .map(|(id, queued)| (*id, std::mem::take(&mut queued.incoming)))
            .collect();
        pending.sort_by_key(|(id, _)| *id);
        pending
    };

    for (client, packets) in pending {
        let failure = match catch_unwind(AssertUnwindSafe(|| world.handle_incoming(client, packets))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };
        warn!(
            "⚠️ World {} removed client {} after packet error: {}",
            shared.id, client, failure
        );
        let last = catch_unwind(AssertUnwindSafe(|| world.remove_client(client))).unwrap_or_default();
        let mut queues = shared.queues.lock();
        let mut final_packets = queues
            .clients
            .remove(&client)
            .map(|queued| queued.outgoing)
            .unwrap_or_default();
        final_packets.extend(last);
        if queues.clients.is_empty() {
            queues.idle_since = Some(Instant::now());
        }
        queues.errored.push(ErroredClient {
            connection: client,
            reason: failure,
            final_packets,
        });
    }

    if !shared.clock.is_paused() {
        let dt = shared.settings.tick_interval.as_secs_f64() * shared.clock.timescale();
        match catch_unwind(AssertUnwindSafe(|| world.update(dt, fidelity))) {
            Ok(Ok(())) => {
                shared.steps.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                return Err(RunnerError::Simulation {
                    world: shared.id.clone(),
                    message: format!("{e:#}"),
                })
            }
            Err(payload) => {
                return Err(RunnerError::Panicked {
                    world: shared.id.clone(),
                    message: panic_message(payload.as_ref()),
                })
            }
        }
    }

    let clients: Vec<ConnectionId> = shared.queues.lock().clients.keys().copied().collect();
    for client in clients {
        let produced = match catch_unwind(AssertUnwindSafe(|| world.take_outgoing(client))) {
            Ok(packets) => packets,
            Err(payload) => {
                return Err(RunnerError::Panicked {
                    world: shared.id.clone(),
                    message: panic_message(payload.as_ref()),
                })
            }
        };
        if produced.is_empty() {
            continue;
        }
        if let Some(queued) = shared.queues.lock().clients.get_mut(&client) {
            queued.outgoing.extend(produced);
        }
    }

    Ok(())
}
