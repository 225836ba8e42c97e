//! Connection and packet transport layer.
//!
//! Packets travel through a [`PacketChannel`] (TCP, in-process pipe or relay
//! link), are queued by a [`Session`], and are pumped for every live
//! connection by the worker threads of the [`ConnectionHub`].

pub mod channel;
pub mod codec;
pub mod hub;
pub mod packet;
pub mod session;

pub use channel::{LocalChannel, PacketChannel, PumpResult, RelayChannel, RelayLink, TcpChannel, UdpRelayLink};
pub use hub::ConnectionHub;
pub use packet::{ChatMode, ClientConnectInfo, CompressionMode, Packet, PacketCategory};
pub use session::Session;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one live client session.
///
/// Ids are small and reused once a session has been fully torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u16);

impl ConnectionId {
    /// The server's own pseudo-connection, used for admin-originated traffic.
    pub const SERVER: ConnectionId = ConnectionId(0);

    pub fn is_server(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
