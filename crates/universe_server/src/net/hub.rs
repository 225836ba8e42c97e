//! Multi-connection hub.
//!
//! The hub owns every established [`Session`] and pumps them from a fixed
//! set of worker threads. Each connection is assigned to exactly one worker
//! (`id % workers`), which gives per-connection ordering: callbacks for one
//! connection run on one thread, one at a time, in the order the packets
//! arrived. Callbacks run without any hub lock held, so they may call back
//! into the hub freely.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::packet::Packet;
use super::session::Session;
use super::ConnectionId;
use crate::error::{panic_message, HubError};

/// Callback receiving the packets read from one connection.
pub type ReceiveCallback = Arc<dyn Fn(ConnectionId, Vec<Packet>) -> anyhow::Result<()> + Send + Sync>;

/// Slot holding one session; emptied when the connection is removed.
type ConnectionSlot = Arc<Mutex<Option<Session>>>;

struct HubShared {
    connections: DashMap<ConnectionId, ConnectionSlot>,
    callback: ReceiveCallback,
    stop: AtomicBool,
    worker_count: usize,
    idle_sleep: Duration,
}

/// Owns sessions keyed by connection id and pumps them from worker threads.
pub struct ConnectionHub {
    shared: Arc<HubShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionHub {
    /// Creates the hub and starts its workers.
    ///
    /// # Arguments
    ///
    /// * `worker_count` - Number of pumping threads (at least one is used)
    /// * `idle_sleep` - Pause of a worker whose last pass moved no data
    /// * `callback` - Invoked with every batch of received packets
    pub fn new<F>(worker_count: usize, idle_sleep: Duration, callback: F) -> Self
    where
        F: Fn(ConnectionId, Vec<Packet>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(HubShared {
            connections: DashMap::new(),
            callback: Arc::new(callback),
            stop: AtomicBool::new(false),
            worker_count,
            idle_sleep,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("hub-worker-{index}"))
                .spawn(move || worker_loop(shared, index));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("❌ Failed to spawn hub worker {}: {}", index, e),
            }
        }
        info!("🔌 Connection hub started with {} worker(s)", workers.len());

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn add_connection(&self, id: ConnectionId, session: Session) -> Result<(), (HubError, Session)> {
        use dashmap::mapref::entry::Entry;
        match self.shared.connections.entry(id) {
            Entry::Occupied(_) => Err((HubError::DuplicateConnection(id), session)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Some(session))));
                debug!("Connection {} added to hub", id);
                Ok(())
            }
        }
    }

    /// Removes a connection and hands its session back to the caller.
    ///
    /// Waits for an in-progress pump of that connection to finish.
    pub fn remove_connection(&self, id: ConnectionId) -> Result<Session, HubError> {
        let (_, slot) = self
            .shared
            .connections
            .remove(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        let session = slot.lock().take();
        session.ok_or(HubError::UnknownConnection(id))
    }

    /// Queues packets for a connection. Unknown connections drop them.
    pub fn send_packets(&self, id: ConnectionId, packets: Vec<Packet>) -> bool {
        if packets.is_empty() {
            return self.connection_is_open(id);
        }
        let Some(slot) = self.slot(id) else {
            debug!("Dropping {} packet(s) for unknown connection {}", packets.len(), id);
            return false;
        };
        let mut guard = slot.lock();
        match guard.as_mut() {
            Some(session) if session.is_open() => {
                session.queue_send(packets);
                true
            }
            _ => false,
        }
    }

    /// True while the hub still owns a slot for `id`, open or not.
    pub fn holds(&self, id: ConnectionId) -> bool {
        self.shared.connections.contains_key(&id)
    }

    pub fn connection_is_open(&self, id: ConnectionId) -> bool {
        self.slot(id)
            .map(|slot| slot.lock().as_ref().is_some_and(|session| session.is_open()))
            .unwrap_or(false)
    }

    pub fn last_activity_time(&self, id: ConnectionId) -> Option<Instant> {
        self.slot(id)
            .and_then(|slot| slot.lock().as_ref().map(|session| session.last_activity()))
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.shared.connections.iter().map(|entry| *entry.key()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Stops and joins the workers. Sessions stay registered.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for worker in workers {
            // A callback may drop the last owner of the hub on a worker thread.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                error!("❌ Hub worker panicked during shutdown");
            }
        }
    }

    fn slot(&self, id: ConnectionId) -> Option<ConnectionSlot> {
        self.shared.connections.get(&id).map(|entry| entry.value().clone())
    }

    fn force_close(shared: &HubShared, id: ConnectionId) {
        if let Some(slot) = shared.connections.get(&id).map(|entry| entry.value().clone()) {
            if let Some(session) = slot.lock().as_mut() {
                session.close();
            }
        }
    }
}

impl Drop for ConnectionHub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<HubShared>, index: usize) {
    debug!("Hub worker {} running", index);
    while !shared.stop.load(Ordering::Acquire) {
        let assigned: Vec<(ConnectionId, ConnectionSlot)> = shared
            .connections
            .iter()
            .filter(|entry| usize::from(entry.key().0) % shared.worker_count == index)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut active = false;
        for (id, slot) in assigned {
            let received = {
                let mut guard = slot.lock();
                let Some(session) = guard.as_mut() else {
                    continue;
                };
                if !session.is_open() {
                    continue;
                }
                active |= session.pump().any();
                session.pull_incoming()
            };

            if received.is_empty() {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| (shared.callback)(id, received)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("⚠️ Receive callback failed for connection {}: {:#}", id, e);
                    ConnectionHub::force_close(&shared, id);
                }
                Err(payload) => {
                    error!(
                        "❌ Receive callback panicked for connection {}: {}",
                        id,
                        panic_message(payload.as_ref())
                    );
                    ConnectionHub::force_close(&shared, id);
                }
            }
        }

        if !active {
            thread::sleep(shared.idle_sleep);
        }
    }
    debug!("Hub worker {} stopped", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::LocalChannel;
    use std::sync::atomic::AtomicUsize;

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_callback_receives_packets_and_can_reply() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let hub = Arc::new_cyclic(|weak: &std::sync::Weak<ConnectionHub>| {
            let weak = weak.clone();
            let received = received.clone();
            ConnectionHub::new(2, Duration::from_millis(1), move |id, packets| {
                received.lock().extend(packets.clone());
                if let Some(hub) = weak.upgrade() {
                    hub.send_packets(id, vec![Packet::WorldStop { reason: "echo".into() }]);
                }
                Ok(())
            })
        });

        let (server_end, client_end) = LocalChannel::pair();
        assert!(hub.add_connection(ConnectionId(5), Session::new(server_end)).is_ok());
        let mut client = Session::new(client_end);
        client.send(vec![Packet::ClientDisconnectRequest]);

        assert!(client.receive_any(Duration::from_secs(5)));
        assert_eq!(client.next_incoming(), Some(Packet::WorldStop { reason: "echo".into() }));
        assert_eq!(received.lock().as_slice(), &[Packet::ClientDisconnectRequest]);
        hub.shutdown();
    }

    #[test]
    fn test_failing_callback_closes_only_that_connection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let hub = ConnectionHub::new(1, Duration::from_millis(1), move |id, _packets| {
            counter.fetch_add(1, Ordering::SeqCst);
            if id == ConnectionId(1) {
                anyhow::bail!("bad packet");
            }
            if id == ConnectionId(2) {
                panic!("callback exploded");
            }
            Ok(())
        });

        let mut clients = Vec::new();
        for id in 1..=3u16 {
            let (server_end, client_end) = LocalChannel::pair();
            assert!(hub.add_connection(ConnectionId(id), Session::new(server_end)).is_ok());
            let mut client = Session::new(client_end);
            client.send(vec![Packet::ClientDisconnectRequest]);
            clients.push(client);
        }

        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 3));
        assert!(wait_for(|| !hub.connection_is_open(ConnectionId(1))));
        assert!(wait_for(|| !hub.connection_is_open(ConnectionId(2))));
        assert!(hub.connection_is_open(ConnectionId(3)));
    }

    #[test]
    fn test_remove_connection_errors_only_for_unknown_ids() {
        let hub = ConnectionHub::new(1, Duration::from_millis(1), |_, _| Ok(()));
        let (server_end, _client_end) = LocalChannel::pair();
        assert!(hub.add_connection(ConnectionId(7), Session::new(server_end)).is_ok());

        let (dup, _other) = LocalChannel::pair();
        match hub.add_connection(ConnectionId(7), Session::new(dup)) {
            Err((HubError::DuplicateConnection(id), returned)) => {
                assert_eq!(id, ConnectionId(7));
                assert!(returned.is_open());
            }
            _ => panic!("duplicate connection accepted"),
        }

        assert!(hub.holds(ConnectionId(7)));
        assert!(hub.last_activity_time(ConnectionId(7)).is_some());
        let session = hub.remove_connection(ConnectionId(7)).unwrap();
        assert!(session.is_open());
        assert!(matches!(
            hub.remove_connection(ConnectionId(7)),
            Err(HubError::UnknownConnection(_))
        ));
        assert!(!hub.send_packets(ConnectionId(7), vec![Packet::ClientDisconnectRequest]));
        assert!(!hub.holds(ConnectionId(7)));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn test_callbacks_for_one_connection_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let (flight, overlap, count) = (in_flight.clone(), overlaps.clone(), total.clone());
        let hub = ConnectionHub::new(4, Duration::from_millis(1), move |_, packets| {
            if flight.fetch_add(1, Ordering::SeqCst) != 0 {
                overlap.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_micros(200));
            count.fetch_add(packets.len(), Ordering::SeqCst);
            flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        let (server_end, client_end) = LocalChannel::pair();
        assert!(hub.add_connection(ConnectionId(9), Session::new(server_end)).is_ok());
        let mut client = Session::new(client_end);
        for i in 0..200 {
            client.send(vec![Packet::UniverseTimeUpdate { time: i as f64 }]);
        }

        assert!(wait_for(|| total.load(Ordering::SeqCst) == 200));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }
}
