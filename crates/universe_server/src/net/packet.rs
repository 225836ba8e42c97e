//! Packet definitions.
//!
//! The orchestration core routes packets by [`PacketCategory`] only. World
//! payloads are opaque JSON values owned by the simulation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ConnectionId;
use crate::world::{CelestialCoordinate, SystemLocation, WarpAction, WorldId};

/// Negotiated stream compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionMode {
    #[default]
    None,
    Zlib,
}

/// Chat delivery scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatMode {
    Broadcast,
    Local,
    Party,
    Whisper,
}

/// Identity and compatibility information sent by a connecting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConnectInfo {
    pub asset_digest: String,
    pub allow_asset_mismatch: bool,
    pub player_uuid: Uuid,
    pub player_name: String,
    pub species: String,
    /// Base64 encoded ship world snapshot used when no stored ship exists
    pub ship_snapshot: Option<String>,
    pub account: Option<String>,
}

/// Every message exchanged between clients and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Packet {
    // Handshake
    ProtocolRequest { version: u32, compression: CompressionMode },
    ProtocolResponse { allowed: bool, compression: CompressionMode },
    ClientConnect(ClientConnectInfo),
    HandshakeChallenge { salt: String },
    HandshakeResponse { pass_hash: String },
    ConnectSuccess { connection_id: ConnectionId, server_uuid: Uuid, universe_time: f64 },
    ConnectFailure { reason: String },

    // Chat
    ChatSend { mode: ChatMode, text: String },
    ChatReceive { from: ConnectionId, from_name: String, mode: ChatMode, text: String },

    // Warp
    PlayerWarp { action: WarpAction, deploy: bool },
    PlayerWarpResult { success: bool, action: WarpAction, reason: Option<String> },

    // Flight
    FlyShip { system: CelestialCoordinate, location: SystemLocation, settings: Value },
    ShipArrived { system: CelestialCoordinate, location: SystemLocation },

    // Context
    ClientContextUpdate { version: u64, data: Value },

    // World
    World { kind: u16, payload: Value },
    WorldStart { world: WorldId },
    WorldStop { reason: String },

    // Control
    UniverseTimeUpdate { time: f64 },
    ClientDisconnectRequest,
    ServerDisconnect { reason: String },
}

/// Coarse routing class of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCategory {
    Handshake,
    Chat,
    Warp,
    Flight,
    Context,
    World,
    Control,
}

impl Packet {
    pub fn category(&self) -> PacketCategory {
        match self {
            Packet::ProtocolRequest { .. }
            | Packet::ProtocolResponse { .. }
            | Packet::ClientConnect(_)
            | Packet::HandshakeChallenge { .. }
            | Packet::HandshakeResponse { .. }
            | Packet::ConnectSuccess { .. }
            | Packet::ConnectFailure { .. } => PacketCategory::Handshake,
            Packet::ChatSend { .. } | Packet::ChatReceive { .. } => PacketCategory::Chat,
            Packet::PlayerWarp { .. } | Packet::PlayerWarpResult { .. } => PacketCategory::Warp,
            Packet::FlyShip { .. } | Packet::ShipArrived { .. } => PacketCategory::Flight,
            Packet::ClientContextUpdate { .. } => PacketCategory::Context,
            Packet::World { .. } | Packet::WorldStart { .. } | Packet::WorldStop { .. } => {
                PacketCategory::World
            }
            Packet::UniverseTimeUpdate { .. }
            | Packet::ClientDisconnectRequest
            | Packet::ServerDisconnect { .. } => PacketCategory::Control,
        }
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::ProtocolRequest { .. } => "ProtocolRequest",
            Packet::ProtocolResponse { .. } => "ProtocolResponse",
            Packet::ClientConnect(_) => "ClientConnect",
            Packet::HandshakeChallenge { .. } => "HandshakeChallenge",
            Packet::HandshakeResponse { .. } => "HandshakeResponse",
            Packet::ConnectSuccess { .. } => "ConnectSuccess",
            Packet::ConnectFailure { .. } => "ConnectFailure",
            Packet::ChatSend { .. } => "ChatSend",
            Packet::ChatReceive { .. } => "ChatReceive",
            Packet::PlayerWarp { .. } => "PlayerWarp",
            Packet::PlayerWarpResult { .. } => "PlayerWarpResult",
            Packet::FlyShip { .. } => "FlyShip",
            Packet::ShipArrived { .. } => "ShipArrived",
            Packet::ClientContextUpdate { .. } => "ClientContextUpdate",
            Packet::World { .. } => "World",
            Packet::WorldStart { .. } => "WorldStart",
            Packet::WorldStop { .. } => "WorldStop",
            Packet::UniverseTimeUpdate { .. } => "UniverseTimeUpdate",
            Packet::ClientDisconnectRequest => "ClientDisconnectRequest",
            Packet::ServerDisconnect { .. } => "ServerDisconnect",
        }
    }
}
