//! Worlds: identifiers, collaborator traits and the per-world thread.

pub mod fidelity;
pub mod id;
pub mod runner;
pub mod simulation;

pub use fidelity::{Fidelity, FidelityGovernor, FidelitySettings};
pub use id::{
    CelestialCoordinate, InstanceWorldId, SpawnTarget, SystemLocation, WarpAction, WarpAlias,
    WarpToWorld, WorldId,
};
pub use runner::{ErroredClient, PostUpdateHook, RunnerSettings, WorldRunner};
pub use simulation::{
    ClientJoin, CreatedWorld, Persistence, ShipFlightPhase, SystemFactory, SystemSimulation,
    WorldFactory, WorldSimulation,
};
