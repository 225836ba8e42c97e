//! Error types shared across the server.
//!
//! Every thread boundary converts failures into one of these values before
//! handing them on, so nothing escapes a worker loop as a panic.

use std::any::Any;
use thiserror::Error;

use crate::net::ConnectionId;
use crate::world::WorldId;

/// Top-level server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Hub error: {0}")]
    Hub(#[from] HubError),
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("World error: {0}")]
    World(#[from] RunnerError),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while framing packets for a byte-oriented transport
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
    #[error("Unknown frame flag: {0}")]
    UnknownFlag(u8),
    #[error("Malformed packet: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),
}

/// Connection hub errors
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("Connection {0} is already registered")]
    DuplicateConnection(ConnectionId),
}

/// Failures reported through a worker pool promise
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Job failed: {0}")]
    Failed(String),
    #[error("Job panicked: {0}")]
    Panicked(String),
    #[error("Worker pool is shut down")]
    ShutDown,
}

/// Failures of a world execution thread
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("World {world} failed to step: {message}")]
    Simulation { world: WorldId, message: String },
    #[error("World {world} panicked: {message}")]
    Panicked { world: WorldId, message: String },
    #[error("Failed to spawn world thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("World thread for {0} could not be joined")]
    Join(WorldId),
}

/// Storage collaborator errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Typed handshake failures.
///
/// The `Display` text of each variant is the stable reason string sent to the
/// client in a `ConnectFailure` packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Unsupported protocol version {client}, server speaks {server}")]
    ProtocolMismatch { client: u32, server: u32 },
    #[error("Asset digest mismatch")]
    AssetMismatch,
    #[error("Invalid account name or password")]
    BadCredentials,
    #[error("Anonymous connections are not allowed")]
    AnonymousNotAllowed,
    #[error("You are banned: {0}")]
    Banned(String),
    #[error("Server is full")]
    ServerFull,
    #[error("Duplicate player identity")]
    DuplicateIdentity,
    #[error("Handshake timed out")]
    Timeout,
    #[error("Connection closed during handshake")]
    Closed,
    #[error("Unexpected packet during handshake: {0}")]
    Unexpected(String),
    #[error("Connection rejected: {0}")]
    Rejected(String),
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_reasons_are_stable() {
        assert_eq!(HandshakeError::ServerFull.to_string(), "Server is full");
        assert_eq!(
            HandshakeError::Banned("griefing".into()).to_string(),
            "You are banned: griefing"
        );
        assert_eq!(
            HandshakeError::ProtocolMismatch { client: 3, server: 4 }.to_string(),
            "Unsupported protocol version 3, server speaks 4"
        );
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("{} {}", "formatted", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }
}
