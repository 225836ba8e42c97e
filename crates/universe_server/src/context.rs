//! Shared server context.
//!
//! Built once at startup and passed by `Arc` into the control loop, world
//! threads and pool jobs. It replaces process-wide globals.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::access::AccessControl;
use crate::config::ServerConfig;
use crate::net::ConnectionId;
use crate::storage::Storage;
use crate::world::{SystemFactory, WorldFactory};

/// Global pause flag, timescale and universe time.
#[derive(Debug)]
pub struct UniverseClock {
    paused: AtomicBool,
    timescale_bits: AtomicU64,
    time: Mutex<f64>,
}

impl UniverseClock {
    pub fn new(start_time: f64) -> Self {
        Self {
            paused: AtomicBool::new(false),
            timescale_bits: AtomicU64::new(1.0f64.to_bits()),
            time: Mutex::new(start_time),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn timescale(&self) -> f64 {
        f64::from_bits(self.timescale_bits.load(Ordering::Relaxed))
    }

    /// Negative and non-finite values are treated as zero.
    pub fn set_timescale(&self, timescale: f64) {
        let timescale = if timescale.is_finite() { timescale.max(0.0) } else { 0.0 };
        self.timescale_bits.store(timescale.to_bits(), Ordering::Relaxed);
    }

    /// Universe time in seconds.
    pub fn universe_time(&self) -> f64 {
        *self.time.lock()
    }

    /// Advances universe time by a real-time interval, scaled and pause-aware.
    pub fn advance(&self, real: Duration) {
        if self.is_paused() {
            return;
        }
        *self.time.lock() += real.as_secs_f64() * self.timescale();
    }
}

impl Default for UniverseClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Who issued a chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvoker {
    pub connection: ConnectionId,
    pub name: String,
    pub admin: bool,
}

/// External chat command handler.
pub trait CommandProcessor: Send + Sync {
    /// Handles `/command args`, returning an optional reply for the invoker.
    fn process(&self, invoker: &CommandInvoker, command: &str, args: &str) -> anyhow::Result<Option<String>>;
}

/// Shared services and configuration.
pub struct ServerContext {
    pub config: ServerConfig,
    pub storage: Arc<dyn Storage>,
    pub worlds: Arc<dyn WorldFactory>,
    pub systems: Arc<dyn SystemFactory>,
    pub access: Arc<dyn AccessControl>,
    pub commands: Option<Arc<dyn CommandProcessor>>,
    pub clock: Arc<UniverseClock>,
}

impl ServerContext {
    pub fn new(
        config: ServerConfig,
        storage: Arc<dyn Storage>,
        worlds: Arc<dyn WorldFactory>,
        systems: Arc<dyn SystemFactory>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        Self {
            config,
            storage,
            worlds,
            systems,
            access,
            commands: None,
            clock: Arc::new(UniverseClock::default()),
        }
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandProcessor>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_clock(mut self, clock: Arc<UniverseClock>) -> Self {
        self.clock = clock;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_scaling_and_pause() {
        let clock = UniverseClock::new(100.0);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.universe_time(), 102.0);

        clock.set_timescale(0.5);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.universe_time(), 103.0);

        clock.set_paused(true);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.universe_time(), 103.0);

        clock.set_timescale(f64::NAN);
        assert_eq!(clock.timescale(), 0.0);
        clock.set_timescale(-3.0);
        assert_eq!(clock.timescale(), 0.0);
    }
}
