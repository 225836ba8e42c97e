//! Connection handshake.
//!
//! Protocol negotiation, identity checks and registration run on a
//! short-lived thread per connection. The session is handed to the hub only
//! after the client is registered, so the control loop never sees a
//! half-accepted client.
//!
//! Sequence:
//! 1. client `ProtocolRequest`, server `ProtocolResponse` (compression is
//!    switched on right after the response is flushed)
//! 2. client `ClientConnect`
//! 3. for named accounts, server `HandshakeChallenge`, client
//!    `HandshakeResponse`
//! 4. server `ConnectSuccess` or `ConnectFailure`

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::clients::{ClientRecord, ClientSession};
use super::{ControlEvent, UniverseShared};
use crate::config::PROTOCOL_VERSION;
use crate::error::HandshakeError;
use crate::net::{ClientConnectInfo, CompressionMode, ConnectionId, Packet, Session};
use crate::storage::StorageKey;

const SALT_LEN: usize = 32;
const FAILURE_FLUSH: Duration = Duration::from_secs(1);

/// Computes the account challenge answer: base64(SHA-256(password, account, salt)).
pub fn pass_hash(password: &str, account: &str, salt: &[u8]) -> String {
    let mut context = digest::Context::new(&digest::SHA256);
    context.update(password.as_bytes());
    context.update(account.as_bytes());
    context.update(salt);
    BASE64.encode(context.finish().as_ref())
}

/// What a client learns from a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerWelcome {
    pub connection_id: ConnectionId,
    pub server_uuid: Uuid,
    pub universe_time: f64,
}

/// A client that passed every check but is not registered yet.
struct Accepted {
    info: ClientConnectInfo,
    admin: bool,
    ship_seed: Option<Vec<u8>>,
}

/// Runs the server side of the handshake for one session.
pub(crate) fn serve(shared: &UniverseShared, mut session: Session) {
    let remote = session.remote_addr();
    let deadline = Instant::now() + shared.ctx.config.handshake_timeout;

    let outcome = match negotiate(shared, &mut session, deadline) {
        Ok(accepted) => register(shared, session, accepted),
        Err(e) => Err((e, session)),
    };

    if let Err((error, mut session)) = outcome {
        match remote {
            Some(addr) => warn!("⚠️ Handshake with {} failed: {}", addr, error),
            None => warn!("⚠️ Local handshake failed: {}", error),
        }
        if session.is_open() {
            session.queue_send(vec![Packet::ConnectFailure {
                reason: error.to_string(),
            }]);
            session.send_all(FAILURE_FLUSH);
        }
        session.close();
    }
}

fn next_packet(session: &mut Session, deadline: Instant) -> Result<Packet, HandshakeError> {
    loop {
        if let Some(packet) = session.next_incoming() {
            return Ok(packet);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(HandshakeError::Timeout);
        }
        if !session.receive_any(remaining) && !session.is_open() {
            return Err(HandshakeError::Closed);
        }
    }
}

fn flush(session: &mut Session, deadline: Instant) -> Result<(), HandshakeError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if session.send_all(remaining) {
        Ok(())
    } else if session.is_open() {
        Err(HandshakeError::Timeout)
    } else {
        Err(HandshakeError::Closed)
    }
}

fn negotiate(shared: &UniverseShared, session: &mut Session, deadline: Instant) -> Result<Accepted, HandshakeError> {
    let config = &shared.ctx.config;

    let requested = match next_packet(session, deadline)? {
        Packet::ProtocolRequest { version, compression } => {
            if version != config.protocol_version {
                session.queue_send(vec![Packet::ProtocolResponse {
                    allowed: false,
                    compression: CompressionMode::None,
                }]);
                return Err(HandshakeError::ProtocolMismatch {
                    client: version,
                    server: config.protocol_version,
                });
            }
            compression
        }
        other => return Err(HandshakeError::Unexpected(other.name().to_string())),
    };

    let compression = if config.allow_compression {
        requested
    } else {
        CompressionMode::None
    };
    session.queue_send(vec![Packet::ProtocolResponse {
        allowed: true,
        compression,
    }]);
    flush(session, deadline)?;
    session.set_compression(compression);

    let info = match next_packet(session, deadline)? {
        Packet::ClientConnect(info) => info,
        other => return Err(HandshakeError::Unexpected(other.name().to_string())),
    };

    let local = session.remote_addr().is_none();
    let mut admin = local;
    if !local {
        let mismatch = info.asset_digest != config.asset_digest;
        if mismatch && !config.allow_asset_mismatch && !info.allow_asset_mismatch {
            return Err(HandshakeError::AssetMismatch);
        }

        let ip = session.remote_addr().map(|addr| addr.ip());
        if let Some(reason) = shared.ctx.access.ban_reason(ip, info.player_uuid) {
            return Err(HandshakeError::Banned(reason));
        }

        match &info.account {
            Some(name) => admin = challenge(shared, session, name, deadline)?,
            None if !config.allow_anonymous => return Err(HandshakeError::AnonymousNotAllowed),
            None => {}
        }
    }

    let ship_seed = match &info.ship_snapshot {
        Some(encoded) => Some(
            BASE64
                .decode(encoded)
                .map_err(|_| HandshakeError::Rejected("invalid ship snapshot".into()))?,
        ),
        None => None,
    };

    Ok(Accepted { info, admin, ship_seed })
}

/// Runs the account challenge and returns the account's admin flag.
fn challenge(shared: &UniverseShared, session: &mut Session, name: &str, deadline: Instant) -> Result<bool, HandshakeError> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| HandshakeError::Rejected("no randomness available".into()))?;

    session.queue_send(vec![Packet::HandshakeChallenge {
        salt: BASE64.encode(salt),
    }]);
    flush(session, deadline)?;

    let answer = match next_packet(session, deadline)? {
        Packet::HandshakeResponse { pass_hash } => pass_hash,
        other => return Err(HandshakeError::Unexpected(other.name().to_string())),
    };

    let account = shared
        .ctx
        .access
        .account(name)
        .ok_or(HandshakeError::BadCredentials)?;
    if answer != pass_hash(&account.password, name, &salt) {
        return Err(HandshakeError::BadCredentials);
    }
    debug!("Account {} authenticated", name);
    Ok(account.admin)
}

/// Allocates an id, registers the client and hands the session to the hub.
fn register(
    shared: &UniverseShared,
    mut session: Session,
    accepted: Accepted,
) -> Result<(), (HandshakeError, Session)> {
    let config = &shared.ctx.config;
    let info = accepted.info;
    let remote = session.remote_addr();

    let record = match shared.ctx.storage.load(&StorageKey::Client(info.player_uuid)) {
        Ok(Some(bytes)) => match serde_json::from_slice::<ClientRecord>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("⚠️ Ignoring unreadable record of {}: {}", info.player_uuid, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("⚠️ Failed to load record of {}: {}", info.player_uuid, e);
            None
        }
    };

    let mut clients = shared.clients.write();
    if remote.is_some() && clients.len() >= config.max_clients {
        return Err((HandshakeError::ServerFull, session));
    }
    if clients.by_uuid(info.player_uuid).is_some() {
        return Err((HandshakeError::DuplicateIdentity, session));
    }
    // An id stays taken until the hub has released its slot too.
    let Some(id) = clients.allocate_id(|id| shared.hub.holds(id)) else {
        return Err((HandshakeError::ServerFull, session));
    };

    let mut client = ClientSession::new(
        id,
        remote,
        info.player_uuid,
        info.player_name.clone(),
        info.species.clone(),
        accepted.admin,
    );
    if let Some(record) = record {
        client.restore(record);
    }
    if let Some(seed) = accepted.ship_seed {
        shared.ship_seeds.insert(info.player_uuid, seed);
    }

    session.queue_send(vec![Packet::ConnectSuccess {
        connection_id: id,
        server_uuid: config.server_uuid,
        universe_time: shared.ctx.clock.universe_time(),
    }]);
    clients.insert(client);
    // Queued ahead of anything the hub routes for this connection. The
    // control loop owns the receiver for the server's lifetime.
    let _ = shared.events_tx.send(ControlEvent::Connected(id));
    if let Err((e, mut session)) = shared.hub.add_connection(id, session) {
        clients.remove(id);
        shared.ship_seeds.remove(&info.player_uuid);
        session.discard_outgoing();
        return Err((HandshakeError::Rejected(e.to_string()), session));
    }
    drop(clients);

    info!(
        "🤝 {} ({}) accepted as client {}{}",
        info.player_name,
        remote.map(|addr| addr.to_string()).unwrap_or_else(|| "local".into()),
        id,
        if accepted.admin { " with admin rights" } else { "" }
    );
    Ok(())
}

/// Runs the client side of the handshake on `session`.
///
/// `password` answers an account challenge; it is required when
/// `request.account` is set.
pub fn client_handshake(
    session: &mut Session,
    request: ClientConnectInfo,
    password: Option<&str>,
    timeout: Duration,
) -> Result<ServerWelcome, HandshakeError> {
    let deadline = Instant::now() + timeout;

    session.queue_send(vec![Packet::ProtocolRequest {
        version: PROTOCOL_VERSION,
        compression: CompressionMode::Zlib,
    }]);
    flush(session, deadline)?;

    match next_packet(session, deadline)? {
        Packet::ProtocolResponse { allowed: true, compression } => session.set_compression(compression),
        Packet::ProtocolResponse { allowed: false, .. } => {
            return match next_packet(session, deadline) {
                Ok(Packet::ConnectFailure { reason }) => Err(HandshakeError::Rejected(reason)),
                _ => Err(HandshakeError::Rejected("protocol version refused".into())),
            };
        }
        other => return Err(HandshakeError::Unexpected(other.name().to_string())),
    }

    let account = request.account.clone();
    session.queue_send(vec![Packet::ClientConnect(request)]);
    flush(session, deadline)?;

    loop {
        match next_packet(session, deadline)? {
            Packet::HandshakeChallenge { salt } => {
                let (Some(account), Some(password)) = (account.as_deref(), password) else {
                    return Err(HandshakeError::BadCredentials);
                };
                let salt = BASE64
                    .decode(salt)
                    .map_err(|_| HandshakeError::Unexpected("malformed challenge".into()))?;
                session.queue_send(vec![Packet::HandshakeResponse {
                    pass_hash: pass_hash(password, account, &salt),
                }]);
                flush(session, deadline)?;
            }
            Packet::ConnectSuccess {
                connection_id,
                server_uuid,
                universe_time,
            } => {
                return Ok(ServerWelcome {
                    connection_id,
                    server_uuid,
                    universe_time,
                })
            }
            Packet::ConnectFailure { reason } => return Err(HandshakeError::Rejected(reason)),
            other => return Err(HandshakeError::Unexpected(other.name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessControl;
    use crate::config::ServerConfig;
    use crate::context::ServerContext;
    use crate::net::LocalChannel;
    use crate::sandbox::{SandboxSystemFactory, SandboxWorldFactory};
    use crate::storage::MemoryStorage;
    use crate::universe::UniverseServer;
    use std::sync::Arc;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn local_server() -> UniverseServer {
        let config = ServerConfig {
            listening_enabled: false,
            hub_workers: 1,
            pool_workers: 1,
            handshake_timeout: TIMEOUT,
            ..ServerConfig::default()
        };
        let context = ServerContext::new(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(SandboxWorldFactory::default()),
            Arc::new(SandboxSystemFactory::default()),
            Arc::new(StaticAccessControl::default()),
        );
        UniverseServer::new(context).unwrap()
    }

    fn connect(server: &UniverseServer, name: &str) -> Result<(Session, ServerWelcome), HandshakeError> {
        let (server_end, client_end) = LocalChannel::pair();
        server.add_local_client(server_end).unwrap();
        let mut session = Session::new(client_end);
        let info = ClientConnectInfo {
            asset_digest: String::new(),
            allow_asset_mismatch: false,
            player_uuid: Uuid::new_v4(),
            player_name: name.to_string(),
            species: "human".to_string(),
            ship_snapshot: None,
            account: None,
        };
        client_handshake(&mut session, info, None, TIMEOUT).map(|welcome| (session, welcome))
    }

    #[test]
    fn test_id_stays_reserved_until_hub_releases_it() {
        let server = local_server();
        let (_first, welcome) = connect(&server, "Vega").unwrap();
        assert_eq!(welcome.connection_id, ConnectionId(1));

        // A disconnect drops the registry entry before it takes the session
        // back from the hub.
        server.shared.clients.write().remove(ConnectionId(1));
        assert!(server.shared.hub.holds(ConnectionId(1)));

        let (_second, welcome) = connect(&server, "Rigel").unwrap();
        assert_eq!(welcome.connection_id, ConnectionId(2));
        assert!(server.shared.clients.read().get(ConnectionId(2)).is_some());
        assert!(server.shared.hub.holds(ConnectionId(2)));
    }

    #[test]
    fn test_connected_event_precedes_first_packets() {
        let server = local_server();
        let (mut session, welcome) = connect(&server, "Deneb").unwrap();
        session.send(vec![Packet::ClientDisconnectRequest]);

        let mut events = Vec::new();
        let deadline = Instant::now() + TIMEOUT;
        while events.len() < 2 && Instant::now() < deadline {
            events.extend(server.shared.drain_events());
            thread::sleep(Duration::from_millis(1));
        }
        let id = welcome.connection_id;
        assert!(matches!(
            events.as_slice(),
            [ControlEvent::Connected(first), ControlEvent::Packets(second, _)] if *first == id && *second == id
        ));
    }

    #[test]
    fn test_pass_hash_is_deterministic_and_salted() {
        let salt = [7u8; SALT_LEN];
        let first = pass_hash("hunter2", "captain", &salt);
        assert_eq!(first, pass_hash("hunter2", "captain", &salt));
        assert_ne!(first, pass_hash("hunter2", "captain", &[8u8; SALT_LEN]));
        assert_ne!(first, pass_hash("hunter3", "captain", &salt));
        assert_eq!(BASE64.decode(first).unwrap().len(), 32);
    }
}
