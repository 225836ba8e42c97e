//! Universe server orchestration core.
//!
//! This crate hosts many independently simulated worlds and moves clients
//! between them. It is organized in three layers:
//!
//! * [`net`] - transport-agnostic packet channels, sessions and the
//!   multi-threaded [`net::ConnectionHub`]
//! * [`world`] - the per-world execution thread ([`world::WorldRunner`]) with
//!   adaptive fidelity and fault isolation
//! * [`universe`] - the [`universe::UniverseServer`] control loop: client
//!   registry, lazy world creation and the warp/flight/arrival state machines
//!
//! Simulation content, persistence formats and access control are consumed
//! through the narrow traits in [`world::simulation`], [`storage`] and
//! [`access`]. The [`sandbox`] module ships simple implementations of those
//! traits so the server runs end-to-end on its own.

pub mod access;
pub mod config;
pub mod context;
pub mod error;
pub mod net;
pub mod pool;
pub mod sandbox;
pub mod storage;
pub mod universe;
pub mod world;

pub use config::ServerConfig;
pub use context::{ServerContext, UniverseClock};
pub use error::ServerError;
pub use net::{ConnectionId, Packet};
pub use universe::UniverseServer;
pub use world::{WorldId, WorldRunner};
