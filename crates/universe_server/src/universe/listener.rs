//! TCP listener thread.
//!
//! Accepted streams become sessions and are handed to handshake threads.
//! When binding or accepting fails the listener backs off and retries, so
//! a temporarily busy port does not take the universe down.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::UniverseShared;
use crate::net::{Session, TcpChannel};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const ACCEPT_IDLE: Duration = Duration::from_millis(10);
const STOP_POLL: Duration = Duration::from_millis(50);
const BACKLOG: i32 = 128;

/// Exponential retry delay for listener failures.
#[derive(Debug, Clone)]
pub struct ListenerBackoff {
    next: Duration,
    failures: u32,
}

impl Default for ListenerBackoff {
    fn default() -> Self {
        Self {
            next: INITIAL_BACKOFF,
            failures: 0,
        }
    }
}

impl ListenerBackoff {
    /// Records a failure and returns how long to wait before retrying.
    pub fn failure(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        self.failures += 1;
        delay
    }

    pub fn success(&mut self) {
        *self = Self::default();
    }

    /// True while the last attempt failed.
    pub fn is_degraded(&self) -> bool {
        self.failures > 0
    }
}

fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Sleeps for `delay` unless the server stops first.
fn wait(shared: &UniverseShared, delay: Duration) {
    let mut remaining = delay;
    while !remaining.is_zero() && !shared.stop.load(Ordering::Acquire) {
        let step = remaining.min(STOP_POLL);
        thread::sleep(step);
        remaining -= step;
    }
}

pub(crate) fn run_listener(shared: Arc<UniverseShared>) {
    let addr = shared.ctx.config.bind_address;
    let mut backoff = ListenerBackoff::default();
    let mut listener: Option<TcpListener> = None;

    while !shared.stop.load(Ordering::Acquire) {
        if listener.is_none() {
            match bind(addr) {
                Ok(bound) => {
                    let local = bound.local_addr().unwrap_or(addr);
                    *shared.listen_addr.lock() = Some(local);
                    if backoff.is_degraded() {
                        info!("✅ Listener recovered on {}", local);
                    } else {
                        info!("🌐 Listening on {}", local);
                    }
                    backoff.success();
                    listener = Some(bound);
                }
                Err(e) => {
                    let delay = backoff.failure();
                    warn!("⚠️ Listener degraded, cannot bind {}: {} (retry in {:?})", addr, e, delay);
                    wait(&shared, delay);
                }
            }
            continue;
        }
        let Some(socket) = listener.as_ref() else {
            continue;
        };

        match socket.accept() {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                let session = match TcpChannel::new(stream) {
                    Ok(channel) => Session::new(channel),
                    Err(e) => {
                        warn!("⚠️ Could not set up connection from {}: {}", peer, e);
                        continue;
                    }
                };
                if let Err(e) = shared.spawn_handshake(session) {
                    error!("❌ {}", e);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_IDLE),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                let delay = backoff.failure();
                warn!("⚠️ Listener degraded, accept failed: {} (rebinding in {:?})", e, delay);
                listener = None;
                *shared.listen_addr.lock() = None;
                wait(&shared, delay);
            }
        }
    }

    *shared.listen_addr.lock() = None;
    debug!("Listener stopped");
}
