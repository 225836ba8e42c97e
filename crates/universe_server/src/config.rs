//! Server configuration types and defaults.
//!
//! This module contains the runtime configuration consumed by the universe
//! server at startup. The binary builds it from a TOML file; tests construct
//! it directly and override the fields they care about.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::access::Account;
use crate::world::fidelity::FidelitySettings;

/// Wire protocol version spoken by this server build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Configuration structure for the universe server.
///
/// Contains network settings, connection limits, thread counts, world
/// scheduling parameters and the periodic maintenance intervals of the
/// control loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address the listener binds to
    pub bind_address: SocketAddr,

    /// Whether remote TCP connections are accepted at all
    pub listening_enabled: bool,

    /// Maximum number of remote clients connected at once
    pub max_clients: usize,

    /// Root directory for persisted client, world and index files
    pub storage_directory: PathBuf,

    /// Number of connection hub worker threads
    pub hub_workers: usize,

    /// Number of worker pool threads used for world loading and persistence
    pub pool_workers: usize,

    /// Identity reported to clients in `ConnectSuccess`
    pub server_uuid: Uuid,

    /// Protocol version clients must request
    pub protocol_version: u32,

    /// Whether zlib compression may be negotiated
    pub allow_compression: bool,

    /// Digest of the server asset set; remote clients must match it
    pub asset_digest: String,

    /// Whether a mismatching asset digest is tolerated when the client also allows it
    pub allow_asset_mismatch: bool,

    /// Whether remote clients may connect without an account
    pub allow_anonymous: bool,

    /// Named accounts keyed by account name
    pub accounts: HashMap<String, Account>,

    /// Time limit for each blocking step of the handshake
    pub handshake_timeout: Duration,

    /// Connections silent for longer than this are dropped
    pub connection_timeout: Duration,

    /// Sleep between control loop passes
    pub main_loop_interval: Duration,

    /// Sleep of an idle hub worker pass
    pub hub_idle_sleep: Duration,

    /// Per-world simulation settings
    pub world: WorldSettings,

    /// Worlds without clients for this long are unloaded
    pub world_idle_timeout: Duration,

    /// Broken registry entries are forgotten after this long
    pub broken_world_retention: Duration,

    /// Debounce window collapsing rapid flight requests
    pub flight_debounce: Duration,

    /// Interval of `UniverseTimeUpdate` broadcasts
    pub time_broadcast_interval: Duration,

    /// Interval of periodic client context persistence
    pub client_persist_interval: Duration,

    /// Interval of the temporary world expiry sweep
    pub temp_world_sweep_interval: Duration,
}

/// Settings applied to every world thread.
#[derive(Debug, Clone)]
pub struct WorldSettings {
    /// Simulation steps per second
    pub tick_rate: f64,

    /// Fidelity hysteresis parameters
    pub fidelity: FidelitySettings,

    /// Forward world output to clients from the world thread right after each step
    pub immediate_forwarding: bool,
}

impl WorldSettings {
    /// Wall-clock budget of one world tick.
    pub fn tick_interval(&self) -> Duration {
        if self.tick_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.tick_rate)
        } else {
            Duration::from_millis(16)
        }
    }
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            fidelity: FidelitySettings::default(),
            immediate_forwarding: true,
        }
    }
}

/// Default hub worker count derived from the CPU count.
pub fn default_hub_workers() -> usize {
    num_cpus::get().clamp(1, 8)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 21025)),
            listening_enabled: true,
            max_clients: 8,
            storage_directory: PathBuf::from("storage"),
            hub_workers: default_hub_workers(),
            pool_workers: 2,
            server_uuid: Uuid::new_v4(),
            protocol_version: PROTOCOL_VERSION,
            allow_compression: true,
            asset_digest: String::new(),
            allow_asset_mismatch: false,
            allow_anonymous: true,
            accounts: HashMap::new(),
            handshake_timeout: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(60),
            main_loop_interval: Duration::from_millis(10),
            hub_idle_sleep: Duration::from_millis(2),
            world: WorldSettings::default(),
            world_idle_timeout: Duration::from_secs(30),
            broken_world_retention: Duration::from_secs(60),
            flight_debounce: Duration::from_millis(500),
            time_broadcast_interval: Duration::from_secs(5),
            client_persist_interval: Duration::from_secs(60),
            temp_world_sweep_interval: Duration::from_secs(60),
        }
    }
}
