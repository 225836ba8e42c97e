//! Shared fixtures for the universe integration tests.
#![allow(dead_code)]

use crossbeam::channel::Receiver;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use universe_server::access::StaticAccessControl;
use universe_server::net::{ClientConnectInfo, LocalChannel, Session};
use universe_server::sandbox::{SandboxSystemFactory, SandboxWorldFactory};
use universe_server::storage::MemoryStorage;
use universe_server::universe::{client_handshake, ServerWelcome};
use universe_server::world::{
    ClientJoin, CreatedWorld, Fidelity, Persistence, SpawnTarget, WorldFactory, WorldId, WorldSimulation,
};
use universe_server::{ConnectionId, Packet, ServerConfig, ServerContext, UniverseServer};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Instance name of worlds that fail once a client has been inside for ten steps.
pub const UNSTABLE: &str = "unstable";
/// Instance names with this prefix fail to build.
pub const VOID_PREFIX: &str = "void";

pub fn test_config() -> ServerConfig {
    ServerConfig {
        listening_enabled: false,
        hub_workers: 2,
        pool_workers: 2,
        handshake_timeout: Duration::from_secs(5),
        flight_debounce: Duration::ZERO,
        ..ServerConfig::default()
    }
}

/// Fails its update on the tenth step taken while it has clients.
pub struct UnstableWorld {
    clients: HashMap<ConnectionId, VecDeque<Packet>>,
    occupied_steps: u64,
}

impl WorldSimulation for UnstableWorld {
    fn add_client(&mut self, join: &ClientJoin) -> anyhow::Result<()> {
        self.clients.insert(join.connection, VecDeque::new());
        Ok(())
    }

    fn remove_client(&mut self, client: ConnectionId) -> Vec<Packet> {
        self.clients
            .remove(&client)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    fn handle_incoming(&mut self, _client: ConnectionId, _packets: Vec<Packet>) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, _dt: f64, _fidelity: Fidelity) -> anyhow::Result<()> {
        if self.clients.is_empty() {
            return Ok(());
        }
        self.occupied_steps += 1;
        if self.occupied_steps >= 10 {
            anyhow::bail!("reactor breach at step {}", self.occupied_steps);
        }
        Ok(())
    }

    fn take_outgoing(&mut self, client: ConnectionId) -> Vec<Packet> {
        self.clients
            .get_mut(&client)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default()
    }

    fn spawn_target_valid(&self, _target: &SpawnTarget) -> bool {
        true
    }

    fn snapshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Sandbox worlds plus a few special instances. Client ships can be held
/// back until the test opens `ship_gate`.
#[derive(Default)]
pub struct TestFactory {
    pub sandbox: SandboxWorldFactory,
    pub ship_gate: Option<Receiver<()>>,
}

impl WorldFactory for TestFactory {
    fn create_world(&self, id: &WorldId, stored: Option<Vec<u8>>) -> anyhow::Result<Option<CreatedWorld>> {
        match id {
            WorldId::Instance(instance) if instance.name == UNSTABLE => Ok(Some(CreatedWorld {
                simulation: Box::new(UnstableWorld {
                    clients: HashMap::new(),
                    occupied_steps: 0,
                }),
                persistence: Persistence::Transient,
            })),
            WorldId::Instance(instance) if instance.name.starts_with(VOID_PREFIX) => {
                anyhow::bail!("{} cannot be built", instance.name)
            }
            WorldId::ClientShip(_) => {
                if let Some(gate) = &self.ship_gate {
                    gate.recv_timeout(TIMEOUT)?;
                }
                self.sandbox.create_world(id, stored)
            }
            _ => self.sandbox.create_world(id, stored),
        }
    }
}

pub struct TestUniverse {
    pub server: UniverseServer,
    pub storage: Arc<MemoryStorage>,
    pub access: Arc<StaticAccessControl>,
}

pub fn universe(config: ServerConfig, factory: TestFactory) -> TestUniverse {
    universe_with_access(config, factory, StaticAccessControl::default())
}

pub fn universe_with_access(config: ServerConfig, factory: TestFactory, access: StaticAccessControl) -> TestUniverse {
    let storage = Arc::new(MemoryStorage::new());
    let access = Arc::new(access);
    let context = ServerContext::new(
        config,
        storage.clone(),
        Arc::new(factory),
        Arc::new(SandboxSystemFactory::default()),
        access.clone(),
    );
    let server = UniverseServer::new(context).expect("server builds");
    TestUniverse { server, storage, access }
}

pub fn connect_info(name: &str) -> ClientConnectInfo {
    ClientConnectInfo {
        asset_digest: String::new(),
        allow_asset_mismatch: false,
        player_uuid: Uuid::new_v4(),
        player_name: name.to_string(),
        species: "human".to_string(),
        ship_snapshot: None,
        account: None,
    }
}

/// Connects an in-process client and completes its handshake.
pub fn connect_local(server: &UniverseServer, info: ClientConnectInfo) -> (Session, ServerWelcome) {
    let (server_end, client_end) = LocalChannel::pair();
    server.add_local_client(server_end).expect("session accepted");
    let mut session = Session::new(client_end);
    let welcome = client_handshake(&mut session, info, None, TIMEOUT).expect("handshake succeeds");
    (session, welcome)
}

/// Waits until `condition` holds without driving the server.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Ticks the server until `condition` holds.
pub fn tick_until(server: &UniverseServer, mut condition: impl FnMut() -> bool) -> bool {
    wait_for(|| {
        server.tick();
        condition()
    })
}

/// Ticks the server repeatedly for `duration`.
pub fn tick_for(server: &UniverseServer, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        server.tick();
        thread::sleep(Duration::from_millis(2));
    }
}

/// Pumps the client session until a packet matching `matches` arrives,
/// returning everything received on the way.
pub fn receive_until(session: &mut Session, inbox: &mut Vec<Packet>, matches: impl Fn(&Packet) -> bool) -> bool {
    wait_for(|| {
        inbox.extend(session.receive());
        inbox.iter().any(&matches)
    })
}
