//! Transport-agnostic packet channels.
//!
//! A [`PacketChannel`] is a non-blocking, message-oriented pipe. Callers move
//! packets in with `enqueue`, push them to the transport with `write_ready`,
//! pull bytes from the transport with `read_ready` and collect whole packets
//! with `drain`. All blocking behavior lives above this layer.
//!
//! Any transport failure closes the channel. A closed channel ignores further
//! calls; packets that were fully received before the failure stay drainable
//! until the owner closes the channel explicitly.

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::codec::{self, FrameDecoder};
use super::packet::{CompressionMode, Packet};

const READ_CHUNK: usize = 16 * 1024;
const MAX_DATAGRAM: usize = 65_507;

/// Outcome of one pump pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpResult {
    pub written: bool,
    pub read: bool,
}

impl PumpResult {
    pub fn any(&self) -> bool {
        self.written || self.read
    }
}

/// Bidirectional packet transport.
pub trait PacketChannel: Send {
    fn is_open(&self) -> bool;

    /// Closes the transport and discards everything still queued.
    fn close(&mut self);

    fn enqueue(&mut self, packets: Vec<Packet>);

    fn drain(&mut self) -> Vec<Packet>;

    /// Flushes queued output to the transport. Returns true if anything was written.
    fn write_ready(&mut self) -> bool;

    /// Reads available input from the transport. Returns true if anything was read.
    fn read_ready(&mut self) -> bool;

    fn pump(&mut self) -> PumpResult {
        let written = self.write_ready();
        let read = self.read_ready();
        PumpResult { written, read }
    }

    fn has_pending_output(&self) -> bool;

    /// Sets the compression applied to outgoing packets from now on.
    fn set_compression(&mut self, mode: CompressionMode);

    /// Remote peer address; `None` for in-process connections.
    fn remote_addr(&self) -> Option<SocketAddr>;
}

// ============================================================================
// TCP
// ============================================================================

/// Stream socket channel with length-prefixed frames.
pub struct TcpChannel {
    stream: Option<TcpStream>,
    remote: Option<SocketAddr>,
    compression: CompressionMode,
    outgoing: Vec<u8>,
    decoder: FrameDecoder,
    incoming: VecDeque<Packet>,
}

impl TcpChannel {
    /// Wraps an accepted or connected stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr().ok();
        Ok(Self {
            stream: Some(stream),
            remote,
            compression: CompressionMode::None,
            outgoing: Vec::new(),
            decoder: FrameDecoder::new(),
            incoming: VecDeque::new(),
        })
    }

    /// Connects to a server, used by clients and tests.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<Self> {
        let mut last_error = io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved");
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::new(stream),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn fail(&mut self, context: &str, error: impl std::fmt::Display) {
        if self.stream.take().is_some() {
            debug!("TCP channel {:?} closed on {}: {}", self.remote, context, error);
        }
        self.outgoing.clear();
    }
}

impl PacketChannel for TcpChannel {
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.outgoing.clear();
        self.incoming.clear();
    }

    fn enqueue(&mut self, packets: Vec<Packet>) {
        if self.stream.is_none() {
            return;
        }
        for packet in packets {
            match codec::encode_frame(&packet, self.compression) {
                Ok(frame) => self.outgoing.extend_from_slice(&frame),
                Err(e) => {
                    warn!("Dropping unencodable {} packet: {}", packet.name(), e);
                    self.fail("encode", e);
                    return;
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<Packet> {
        self.incoming.drain(..).collect()
    }

    fn write_ready(&mut self) -> bool {
        let mut written = 0;
        let result = {
            let Some(stream) = self.stream.as_mut() else {
                return false;
            };
            loop {
                if written == self.outgoing.len() {
                    break Ok(());
                }
                match stream.write(&self.outgoing[written..]) {
                    Ok(0) => break Err(io::Error::from(ErrorKind::WriteZero)),
                    Ok(n) => written += n,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => break Err(e),
                }
            }
        };
        self.outgoing.drain(..written);
        if let Err(e) = result {
            self.fail("write", e);
        }
        written > 0
    }

    fn read_ready(&mut self) -> bool {
        let mut any_read = false;
        let mut buffer = [0u8; READ_CHUNK];
        let failure = loop {
            let Some(stream) = self.stream.as_mut() else {
                return any_read;
            };
            match stream.read(&mut buffer) {
                Ok(0) => break Some(io::Error::from(ErrorKind::UnexpectedEof).to_string()),
                Ok(n) => {
                    any_read = true;
                    self.decoder.push(&buffer[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break None,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Some(e.to_string()),
            }
        };

        loop {
            match self.decoder.next_packet() {
                Ok(Some(packet)) => self.incoming.push_back(packet),
                Ok(None) => break,
                Err(e) => {
                    self.fail("decode", e);
                    break;
                }
            }
        }

        if let Some(reason) = failure {
            self.fail("read", reason);
        }
        any_read
    }

    fn has_pending_output(&self) -> bool {
        self.stream.is_some() && !self.outgoing.is_empty()
    }

    fn set_compression(&mut self, mode: CompressionMode) {
        self.compression = mode;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

// ============================================================================
// In-process pipe
// ============================================================================

/// One end of an in-process packet pipe.
///
/// Packets are moved between the ends without encoding, so compression is
/// accepted and ignored.
pub struct LocalChannel {
    sender: Option<Sender<Packet>>,
    receiver: Receiver<Packet>,
    outgoing: VecDeque<Packet>,
    incoming: VecDeque<Packet>,
    open: bool,
}

impl LocalChannel {
    /// Creates two connected ends.
    pub fn pair() -> (LocalChannel, LocalChannel) {
        let (a_tx, a_rx) = channel::unbounded();
        let (b_tx, b_rx) = channel::unbounded();
        (Self::end(a_tx, b_rx), Self::end(b_tx, a_rx))
    }

    fn end(sender: Sender<Packet>, receiver: Receiver<Packet>) -> Self {
        Self {
            sender: Some(sender),
            receiver,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            open: true,
        }
    }

    fn shut(&mut self) {
        self.open = false;
        self.sender = None;
        self.outgoing.clear();
    }
}

impl PacketChannel for LocalChannel {
    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        self.shut();
        self.incoming.clear();
    }

    fn enqueue(&mut self, packets: Vec<Packet>) {
        if self.open {
            self.outgoing.extend(packets);
        }
    }

    fn drain(&mut self) -> Vec<Packet> {
        self.incoming.drain(..).collect()
    }

    fn write_ready(&mut self) -> bool {
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        let mut written = false;
        while let Some(packet) = self.outgoing.pop_front() {
            if sender.send(packet).is_err() {
                trace!("Local channel peer hung up");
                self.shut();
                return written;
            }
            written = true;
        }
        written
    }

    fn read_ready(&mut self) -> bool {
        if !self.open {
            return false;
        }
        let mut read = false;
        loop {
            match self.receiver.try_recv() {
                Ok(packet) => {
                    self.incoming.push_back(packet);
                    read = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shut();
                    break;
                }
            }
        }
        read
    }

    fn has_pending_output(&self) -> bool {
        self.open && !self.outgoing.is_empty()
    }

    fn set_compression(&mut self, _mode: CompressionMode) {}

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// ============================================================================
// Peer relay
// ============================================================================

/// A datagram link to a peer through a relay service.
///
/// The link is expected to deliver datagrams reliably and in order, the way
/// relay sessions of platform networking services do.
pub trait RelayLink: Send {
    /// Sends one datagram. `WouldBlock` means retry later.
    fn send_datagram(&mut self, data: &[u8]) -> io::Result<()>;

    /// Receives one datagram into `buffer`, `Ok(None)` when nothing is waiting.
    fn recv_datagram(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Relay link over a connected UDP socket.
pub struct UdpRelayLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpRelayLink {
    pub fn new(socket: UdpSocket, peer: SocketAddr) -> io::Result<Self> {
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket, peer })
    }
}

impl RelayLink for UdpRelayLink {
    fn send_datagram(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).map(|_| ())
    }

    fn recv_datagram(&mut self, buffer: &mut [u8]) -> io::Result<Option<usize>> {
        match self.socket.recv(buffer) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}

/// Channel carrying one packet body per relay datagram.
pub struct RelayChannel<L: RelayLink> {
    link: Option<L>,
    remote: Option<SocketAddr>,
    compression: CompressionMode,
    outgoing: VecDeque<Vec<u8>>,
    incoming: VecDeque<Packet>,
}

impl<L: RelayLink> RelayChannel<L> {
    pub fn new(link: L) -> Self {
        let remote = link.peer_addr();
        Self {
            link: Some(link),
            remote,
            compression: CompressionMode::None,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
        }
    }

    fn fail(&mut self, context: &str, error: impl std::fmt::Display) {
        if self.link.take().is_some() {
            debug!("Relay channel {:?} closed on {}: {}", self.remote, context, error);
        }
        self.outgoing.clear();
    }
}

impl<L: RelayLink> PacketChannel for RelayChannel<L> {
    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn close(&mut self) {
        self.link = None;
        self.outgoing.clear();
        self.incoming.clear();
    }

    fn enqueue(&mut self, packets: Vec<Packet>) {
        if self.link.is_none() {
            return;
        }
        for packet in packets {
            match codec::encode_body(&packet, self.compression) {
                Ok(body) if body.len() <= MAX_DATAGRAM => self.outgoing.push_back(body),
                Ok(body) => {
                    self.fail("enqueue", format!("{} byte {} packet exceeds datagram size", body.len(), packet.name()));
                    return;
                }
                Err(e) => {
                    self.fail("encode", e);
                    return;
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<Packet> {
        self.incoming.drain(..).collect()
    }

    fn write_ready(&mut self) -> bool {
        let mut written = false;
        let failure = {
            let Some(link) = self.link.as_mut() else {
                return false;
            };
            loop {
                let Some(body) = self.outgoing.front() else {
                    break None;
                };
                match link.send_datagram(body) {
                    Ok(()) => {
                        self.outgoing.pop_front();
                        written = true;
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break None,
                    Err(e) => break Some(e),
                }
            }
        };
        if let Some(e) = failure {
            self.fail("send", e);
        }
        written
    }

    fn read_ready(&mut self) -> bool {
        let mut read = false;
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        loop {
            let Some(link) = self.link.as_mut() else {
                return read;
            };
            match link.recv_datagram(&mut buffer) {
                Ok(Some(n)) => {
                    read = true;
                    match codec::decode_body(&buffer[..n]) {
                        Ok(packet) => self.incoming.push_back(packet),
                        Err(e) => {
                            self.fail("decode", e);
                            return read;
                        }
                    }
                }
                Ok(None) => return read,
                Err(e) => {
                    self.fail("receive", e);
                    return read;
                }
            }
        }
    }

    fn has_pending_output(&self) -> bool {
        self.link.is_some() && !self.outgoing.is_empty()
    }

    fn set_compression(&mut self, mode: CompressionMode) {
        self.compression = mode;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::TcpListener;
    use std::time::Instant;

    fn pump_until<F: FnMut() -> bool>(mut done: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn tcp_pair() -> (TcpChannel, TcpChannel) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpChannel::connect(addr, Duration::from_secs(1)).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (TcpChannel::new(stream).unwrap(), client)
    }

    #[test]
    fn test_local_pair_moves_packets_in_order() {
        let (mut a, mut b) = LocalChannel::pair();
        a.enqueue(vec![
            Packet::UniverseTimeUpdate { time: 1.0 },
            Packet::UniverseTimeUpdate { time: 2.0 },
        ]);
        assert!(a.has_pending_output());
        assert!(a.pump().written);
        assert!(b.pump().read);
        assert_eq!(
            b.drain(),
            vec![
                Packet::UniverseTimeUpdate { time: 1.0 },
                Packet::UniverseTimeUpdate { time: 2.0 },
            ]
        );
        assert!(b.remote_addr().is_none());
    }

    #[test]
    fn test_local_close_is_seen_by_peer_after_queued_packets() {
        let (mut a, mut b) = LocalChannel::pair();
        a.enqueue(vec![Packet::ServerDisconnect { reason: "bye".into() }]);
        a.write_ready();
        a.close();
        assert!(!a.is_open());

        b.read_ready();
        assert!(!b.is_open());
        assert_eq!(b.drain(), vec![Packet::ServerDisconnect { reason: "bye".into() }]);

        // Closed channels are inert.
        b.enqueue(vec![Packet::ClientDisconnectRequest]);
        assert!(!b.write_ready());
        assert!(!b.read_ready());
        assert!(b.drain().is_empty());
    }

    #[test]
    fn test_tcp_channel_with_compression() {
        let (mut server, mut client) = tcp_pair();
        server.set_compression(CompressionMode::Zlib);
        let big = Packet::World {
            kind: 1,
            payload: json!({ "blob": "x".repeat(4096) }),
        };
        server.enqueue(vec![big.clone(), Packet::WorldStop { reason: "done".into() }]);

        let mut received = Vec::new();
        assert!(pump_until(|| {
            server.pump();
            client.pump();
            received.extend(client.drain());
            received.len() == 2
        }));
        assert_eq!(received[0], big);
        assert!(client.remote_addr().is_some());
        assert!(server.remote_addr().is_some());
    }

    #[test]
    fn test_tcp_peer_close_keeps_received_packets() {
        let (mut server, mut client) = tcp_pair();
        server.enqueue(vec![Packet::ConnectFailure { reason: "Server is full".into() }]);
        assert!(pump_until(|| {
            server.write_ready();
            !server.has_pending_output()
        }));
        server.close();

        assert!(pump_until(|| {
            client.read_ready();
            !client.is_open()
        }));
        assert_eq!(
            client.drain(),
            vec![Packet::ConnectFailure { reason: "Server is full".into() }]
        );
        assert!(!client.read_ready());
    }

    #[test]
    fn test_tcp_garbage_closes_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut raw = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut channel = TcpChannel::new(stream).unwrap();

        raw.write_all(&[0, 0, 0, 3, 7, 7, 7]).unwrap();
        assert!(pump_until(|| {
            channel.read_ready();
            !channel.is_open()
        }));
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn test_relay_channel_over_udp() {
        let a_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let a_addr = a_socket.local_addr().unwrap();
        let b_addr = b_socket.local_addr().unwrap();
        let mut a = RelayChannel::new(UdpRelayLink::new(a_socket, b_addr).unwrap());
        let mut b = RelayChannel::new(UdpRelayLink::new(b_socket, a_addr).unwrap());

        a.set_compression(CompressionMode::Zlib);
        a.enqueue(vec![Packet::ChatSend {
            mode: crate::net::ChatMode::Broadcast,
            text: "relayed".repeat(20),
        }]);
        assert!(a.write_ready());

        let mut received = Vec::new();
        assert!(pump_until(|| {
            b.read_ready();
            received.extend(b.drain());
            !received.is_empty()
        }));
        assert_eq!(b.remote_addr(), Some(a_addr));
        assert!(matches!(&received[0], Packet::ChatSend { text, .. } if text.starts_with("relayed")));
    }
}
