//! Queued packet session over a single channel.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use super::channel::{PacketChannel, PumpResult};
use super::packet::{CompressionMode, Packet};

const BLOCKING_POLL: Duration = Duration::from_millis(1);

/// A channel wrapped with outbound and inbound FIFO queues.
///
/// `pump` never blocks. `send_all` and `receive_any` loop over `pump` until
/// their condition holds or the timeout expires; they are meant for the
/// handshake, which runs on its own short-lived thread.
pub struct Session {
    channel: Box<dyn PacketChannel>,
    outgoing: VecDeque<Packet>,
    incoming: VecDeque<Packet>,
    last_activity: Instant,
}

impl Session {
    pub fn new(channel: impl PacketChannel + 'static) -> Self {
        Self::from_boxed(Box::new(channel))
    }

    pub fn from_boxed(channel: Box<dyn PacketChannel>) -> Self {
        Self {
            channel,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn close(&mut self) {
        self.outgoing.clear();
        self.channel.close();
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    /// Applies to every packet queued after this call.
    pub fn set_compression(&mut self, mode: CompressionMode) {
        self.flush_to_channel();
        self.channel.set_compression(mode);
    }

    /// Time of the last successful read from the peer.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn queue_send(&mut self, packets: impl IntoIterator<Item = Packet>) {
        if self.channel.is_open() {
            self.outgoing.extend(packets);
        }
    }

    /// Drops packets queued but not yet handed to the channel.
    pub fn discard_outgoing(&mut self) {
        self.outgoing.clear();
    }

    pub fn pull_incoming(&mut self) -> Vec<Packet> {
        self.incoming.drain(..).collect()
    }

    pub fn has_pending_output(&self) -> bool {
        !self.outgoing.is_empty() || self.channel.has_pending_output()
    }

    fn flush_to_channel(&mut self) {
        if !self.outgoing.is_empty() {
            let packets: Vec<Packet> = self.outgoing.drain(..).collect();
            self.channel.enqueue(packets);
        }
    }

    /// Moves queued packets through the channel in both directions.
    pub fn pump(&mut self) -> PumpResult {
        self.flush_to_channel();
        let result = self.channel.pump();
        let received = self.channel.drain();
        if result.read || !received.is_empty() {
            self.last_activity = Instant::now();
        }
        self.incoming.extend(received);
        result
    }

    /// Queues packets and pumps once.
    pub fn send(&mut self, packets: impl IntoIterator<Item = Packet>) {
        self.queue_send(packets);
        self.pump();
    }

    /// Pumps once and returns everything received so far.
    pub fn receive(&mut self) -> Vec<Packet> {
        self.pump();
        self.pull_incoming()
    }

    /// Pumps until all queued output is written. Returns false on timeout or close.
    pub fn send_all(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if !self.channel.is_open() {
                return false;
            }
            if !self.has_pending_output() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(BLOCKING_POLL);
        }
    }

    /// Pumps until at least one packet is available. Returns false on timeout
    /// or when the channel closes with nothing received.
    pub fn receive_any(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if !self.incoming.is_empty() {
                return true;
            }
            if !self.channel.is_open() || Instant::now() >= deadline {
                return false;
            }
            thread::sleep(BLOCKING_POLL);
        }
    }

    /// Removes and returns the oldest received packet.
    pub fn next_incoming(&mut self) -> Option<Packet> {
        self.incoming.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LocalChannel;
    use std::thread;

    #[test]
    fn test_send_all_and_receive_any() {
        let (a, b) = LocalChannel::pair();
        let mut server = Session::new(a);
        let mut client = Session::new(b);

        server.queue_send(vec![Packet::UniverseTimeUpdate { time: 4.0 }]);
        assert!(server.has_pending_output());
        assert!(server.send_all(Duration::from_secs(1)));
        assert!(!server.has_pending_output());

        assert!(client.receive_any(Duration::from_secs(1)));
        assert_eq!(client.next_incoming(), Some(Packet::UniverseTimeUpdate { time: 4.0 }));
        assert_eq!(client.next_incoming(), None);
    }

    #[test]
    fn test_receive_any_times_out() {
        let (a, _b) = LocalChannel::pair();
        let mut session = Session::new(a);
        let start = Instant::now();
        assert!(!session.receive_any(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_receive_any_returns_early_when_peer_closes() {
        let (a, b) = LocalChannel::pair();
        let mut session = Session::new(a);
        let handle = thread::spawn(move || {
            let mut peer = Session::new(b);
            thread::sleep(Duration::from_millis(10));
            peer.close();
        });
        assert!(!session.receive_any(Duration::from_secs(5)));
        assert!(!session.is_open());
        handle.join().unwrap();
    }

    #[test]
    fn test_last_activity_tracks_reads_only() {
        let (a, b) = LocalChannel::pair();
        let mut session = Session::new(a);
        let mut peer = Session::new(b);
        let before = session.last_activity();

        thread::sleep(Duration::from_millis(5));
        session.send(vec![Packet::ClientDisconnectRequest]);
        assert_eq!(session.last_activity(), before);

        peer.send(vec![Packet::ServerDisconnect { reason: "x".into() }]);
        assert_eq!(session.receive().len(), 1);
        assert!(session.last_activity() > before);
    }
}
